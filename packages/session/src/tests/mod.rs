#[cfg(test)]
mod orchestrator_tests;
