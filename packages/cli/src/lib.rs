// ABOUTME: Library side of the branchlab binary: argument parsing, dispatch and rendering
// ABOUTME: Kept out of the binary so parsing and output can be tested

pub mod commands;
pub mod output;

#[cfg(test)]
mod tests;

pub use commands::{run, BranchCommands, Cli, Commands, RestoreArg};
