#[cfg(test)]
mod command_tests;
