#[cfg(test)]
mod manager_tests;

#[cfg(test)]
mod reaper_tests;
