// ABOUTME: Background task that periodically sweeps idle sandboxes out of the manager
// ABOUTME: Runs on a fixed interval until stopped or dropped

use crate::manager::SandboxManager;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

pub struct IdleReaper {
    shutdown: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
}

impl IdleReaper {
    /// Start the reaper loop (runs in background)
    pub fn start(manager: Arc<SandboxManager>, interval: Duration) -> Self {
        let (shutdown, mut stop_rx) = watch::channel(false);
        info!("Starting idle sandbox reaper (interval: {:?})", interval);

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // First tick completes immediately
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let reaped = manager.reap_idle().await;
                        if reaped > 0 {
                            info!("Reaped {} idle sandboxes", reaped);
                        } else {
                            debug!("Reaper sweep found nothing idle");
                        }
                    }
                    changed = stop_rx.changed() => {
                        if changed.is_err() || *stop_rx.borrow() {
                            break;
                        }
                    }
                }
            }
            debug!("Idle sandbox reaper stopped");
        });

        Self {
            shutdown,
            task: Some(task),
        }
    }

    pub fn is_running(&self) -> bool {
        self.task
            .as_ref()
            .map(|task| !task.is_finished())
            .unwrap_or(false)
    }

    /// Signal the loop and wait for the current sweep to finish
    pub async fn stop(mut self) {
        let _ = self.shutdown.send(true);
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for IdleReaper {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}
