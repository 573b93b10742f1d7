// ABOUTME: Resource governor enforcing the global sandbox cap and per-sandbox resource ceilings
// ABOUTME: Slots are taken with compare-and-increment and returned when the permit drops

use branchlab_config::LabConfig;
use branchlab_core::ExecutionStatus;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum GovernorError {
    #[error("{resource} limit exceeded: requested {requested}, maximum {max}")]
    LimitExceeded {
        resource: &'static str,
        requested: String,
        max: String,
    },

    #[error("Invalid resource limit: {0}")]
    InvalidLimit(String),
}

/// Per-sandbox resource ceilings handed to the runtime adapter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceLimits {
    pub memory_mb: u64,
    pub cpu_cores: f64,
    pub pids_limit: i64,
    pub nofile_limit: u64,
}

impl ResourceLimits {
    pub fn from_config(config: &LabConfig) -> Self {
        Self {
            memory_mb: config.memory_mb,
            cpu_cores: config.cpu_cores,
            pids_limit: config.pids_limit,
            nofile_limit: config.nofile_limit,
        }
    }
}

#[derive(Debug, Clone)]
pub struct GovernorConfig {
    pub max_sandboxes: usize,
    /// Hard ceilings; requested limits above these are rejected
    pub max_limits: ResourceLimits,
    pub default_timeout: Duration,
    pub max_timeout: Duration,
}

impl GovernorConfig {
    pub fn from_config(config: &LabConfig) -> Self {
        Self {
            max_sandboxes: config.max_sandboxes,
            max_limits: ResourceLimits::from_config(config),
            default_timeout: config.default_timeout,
            max_timeout: config.max_timeout,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionUsage {
    pub executions: u64,
    pub errors: u64,
    pub timeouts: u64,
    pub interrupts: u64,
    pub total_duration_ms: u64,
}

/// Holding a permit means holding one of the global sandbox slots.
#[derive(Debug)]
pub struct SandboxPermit {
    active: Arc<AtomicUsize>,
}

impl Drop for SandboxPermit {
    fn drop(&mut self) {
        let previous = self.active.fetch_sub(1, Ordering::AcqRel);
        debug!("Released sandbox slot ({} -> {})", previous, previous - 1);
    }
}

pub struct ResourceGovernor {
    config: GovernorConfig,
    active: Arc<AtomicUsize>,
    usage: Mutex<HashMap<String, SessionUsage>>,
}

impl ResourceGovernor {
    pub fn new(config: GovernorConfig) -> Self {
        Self {
            config,
            active: Arc::new(AtomicUsize::new(0)),
            usage: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &GovernorConfig {
        &self.config
    }

    /// Take a sandbox slot, or `None` when the global cap is reached.
    pub fn try_acquire(&self) -> Option<SandboxPermit> {
        let mut current = self.active.load(Ordering::Acquire);
        loop {
            if current >= self.config.max_sandboxes {
                return None;
            }
            match self.active.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    return Some(SandboxPermit {
                        active: self.active.clone(),
                    })
                }
                Err(actual) => current = actual,
            }
        }
    }

    pub fn active(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    pub fn capacity(&self) -> usize {
        self.config.max_sandboxes
    }

    pub fn validate(&self, limits: &ResourceLimits) -> Result<(), GovernorError> {
        let max = &self.config.max_limits;

        if limits.memory_mb == 0 {
            return Err(GovernorError::InvalidLimit("memory must be positive".into()));
        }
        if !(limits.cpu_cores > 0.0) {
            return Err(GovernorError::InvalidLimit("cpu cores must be positive".into()));
        }
        if limits.pids_limit <= 0 || limits.nofile_limit == 0 {
            return Err(GovernorError::InvalidLimit(
                "process and open-file limits must be positive".into(),
            ));
        }
        if limits.memory_mb > max.memory_mb {
            return Err(GovernorError::LimitExceeded {
                resource: "memory_mb",
                requested: limits.memory_mb.to_string(),
                max: max.memory_mb.to_string(),
            });
        }
        if limits.cpu_cores > max.cpu_cores {
            return Err(GovernorError::LimitExceeded {
                resource: "cpu_cores",
                requested: limits.cpu_cores.to_string(),
                max: max.cpu_cores.to_string(),
            });
        }
        if limits.pids_limit > max.pids_limit {
            return Err(GovernorError::LimitExceeded {
                resource: "pids_limit",
                requested: limits.pids_limit.to_string(),
                max: max.pids_limit.to_string(),
            });
        }
        if limits.nofile_limit > max.nofile_limit {
            return Err(GovernorError::LimitExceeded {
                resource: "nofile_limit",
                requested: limits.nofile_limit.to_string(),
                max: max.nofile_limit.to_string(),
            });
        }
        Ok(())
    }

    /// Default when absent or zero, never above the configured maximum.
    pub fn clamp_timeout(&self, requested: Option<Duration>) -> Duration {
        match requested {
            Some(timeout) if !timeout.is_zero() => timeout.min(self.config.max_timeout),
            _ => self.config.default_timeout,
        }
    }

    pub fn record_execution(&self, session_id: &str, duration: Duration, status: ExecutionStatus) {
        let mut usage = self.usage.lock().unwrap_or_else(|e| e.into_inner());
        let entry = usage.entry(session_id.to_string()).or_default();
        entry.executions += 1;
        entry.total_duration_ms += duration.as_millis() as u64;
        match status {
            ExecutionStatus::Ok => {}
            ExecutionStatus::Error => entry.errors += 1,
            ExecutionStatus::Timeout => entry.timeouts += 1,
            ExecutionStatus::Interrupted => entry.interrupts += 1,
        }
    }

    pub fn usage(&self, session_id: &str) -> SessionUsage {
        let usage = self.usage.lock().unwrap_or_else(|e| e.into_inner());
        usage.get(session_id).cloned().unwrap_or_default()
    }

    pub fn forget(&self, session_id: &str) {
        let mut usage = self.usage.lock().unwrap_or_else(|e| e.into_inner());
        usage.remove(session_id);
    }
}
