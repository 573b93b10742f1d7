// ABOUTME: Session orchestrator tying sandboxed execution to per-session version control
// ABOUTME: Every execution becomes a commit; branch and checkout keep the interpreter consistent with the tree

pub mod error;
pub mod orchestrator;

#[cfg(test)]
mod tests;

pub use error::{Result, SessionError};
pub use orchestrator::{
    CheckoutOutcome, ExecuteOutcome, RestoreMode, SessionInfo, SessionOrchestrator,
};
