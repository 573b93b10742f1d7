// ABOUTME: Configuration for BranchLab sandboxes and session history
// ABOUTME: Environment variable names, typed parsing helpers and the resolved LabConfig

pub mod constants;
pub mod env;
pub mod settings;

pub use settings::{default_home, LabConfig};
