#[cfg(test)]
mod support;

#[cfg(test)]
mod artifact_tests;
