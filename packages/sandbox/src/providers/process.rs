// ABOUTME: Fallback provider running the execution kernel as a plain child process
// ABOUTME: Same timeout and interrupt contract as Docker, without any isolation guarantees

use super::{
    CellRequest, ContainerConfig, FrameStream, Provider, ProviderCapabilities, ProviderError,
    Result, RuntimeHandle,
};
use crate::kernel::{install_kernel, KernelChannel, KernelFrame};
use async_trait::async_trait;
use branchlab_core::KERNEL_DIR;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, Mutex, RwLock};
use tracing::{debug, info, warn};

const DEFAULT_PATH: &str = "/usr/local/bin:/usr/bin:/bin";

struct ProcessKernel {
    pid: u32,
    child: Mutex<Child>,
    channel: Arc<KernelChannel>,
}

pub struct ProcessProvider {
    python: String,
    kernels: RwLock<HashMap<String, Arc<ProcessKernel>>>,
}

impl ProcessProvider {
    pub fn new(python: impl Into<String>) -> Self {
        Self {
            python: python.into(),
            kernels: RwLock::new(HashMap::new()),
        }
    }

    async fn kernel(&self, handle: &RuntimeHandle) -> Result<Arc<ProcessKernel>> {
        self.kernels
            .read()
            .await
            .get(&handle.id)
            .cloned()
            .ok_or_else(|| ProviderError::UnknownHandle(handle.name.clone()))
    }

    fn signal(pid: u32, signal: Signal) -> Result<()> {
        kill(Pid::from_raw(pid as i32), signal).map_err(|e| {
            ProviderError::KernelError(format!("failed to send {:?} to {}: {}", signal, pid, e))
        })
    }
}

#[async_trait]
impl Provider for ProcessProvider {
    fn kind(&self) -> &'static str {
        "process"
    }

    fn capabilities(&self) -> ProviderCapabilities {
        ProviderCapabilities {
            isolated: false,
            network_isolation: false,
            resource_limits: false,
            seccomp: false,
        }
    }

    async fn is_available(&self) -> Result<bool> {
        match Command::new(&self.python).arg("--version").output().await {
            Ok(output) => Ok(output.status.success()),
            Err(e) => {
                warn!("Interpreter {} not available: {}", self.python, e);
                Ok(false)
            }
        }
    }

    async fn create(&self, config: &ContainerConfig) -> Result<RuntimeHandle> {
        info!("Starting unisolated kernel process: {}", config.name);

        let kernel_path = install_kernel(&config.workspace.join(KERNEL_DIR)).await?;
        let path = std::env::var("PATH").unwrap_or_else(|_| DEFAULT_PATH.to_string());

        let mut child = Command::new(&config.python)
            .arg("-u")
            .arg(&kernel_path)
            .current_dir(&config.workspace)
            .env_clear()
            .env("PATH", path)
            .env("HOME", &config.workspace)
            .env("PYTHONUNBUFFERED", "1")
            .env("MPLBACKEND", "Agg")
            .envs(&config.env_vars)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                ProviderError::NotAvailable(format!("failed to launch {}: {}", config.python, e))
            })?;

        let pid = child
            .id()
            .ok_or_else(|| ProviderError::KernelError("kernel exited immediately".to_string()))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| ProviderError::InternalError("kernel stdin not piped".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ProviderError::InternalError("kernel stdout not piped".to_string()))?;

        if let Some(stderr) = child.stderr.take() {
            let name = config.name.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!("Kernel stderr ({}): {}", name, line);
                }
            });
        }

        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        if let Some(frame) = KernelFrame::parse_line(&line) {
                            if tx.send(frame).is_err() {
                                break;
                            }
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        warn!("Kernel {} output failed: {}", pid, e);
                        break;
                    }
                }
            }
        });

        let channel = Arc::new(KernelChannel::new(Box::pin(stdin), rx));
        if let Err(e) = channel.wait_ready(config.startup_timeout).await {
            warn!("Kernel process {} never became ready: {}", pid, e);
            if let Err(kill_err) = child.kill().await {
                debug!("Kernel {} already gone: {}", pid, kill_err);
            }
            return Err(e);
        }

        let handle = RuntimeHandle {
            id: format!("pid-{}", pid),
            name: config.name.clone(),
        };
        self.kernels.write().await.insert(
            handle.id.clone(),
            Arc::new(ProcessKernel {
                pid,
                child: Mutex::new(child),
                channel,
            }),
        );
        Ok(handle)
    }

    async fn exec(&self, handle: &RuntimeHandle, request: CellRequest) -> Result<FrameStream> {
        let kernel = self.kernel(handle).await?;
        kernel.channel.submit(request).await
    }

    async fn interrupt(&self, handle: &RuntimeHandle) -> Result<()> {
        let kernel = self.kernel(handle).await?;
        debug!("Interrupting kernel process {}", kernel.pid);
        Self::signal(kernel.pid, Signal::SIGINT)
    }

    async fn stop(&self, handle: &RuntimeHandle, grace: Duration) -> Result<()> {
        let kernel = match self.kernels.write().await.remove(&handle.id) {
            Some(kernel) => kernel,
            None => return Ok(()),
        };
        info!("Stopping kernel process {} (grace: {:?})", kernel.pid, grace);

        kernel.channel.shutdown().await;
        let mut child = kernel.child.lock().await;
        match tokio::time::timeout(grace, child.wait()).await {
            Ok(Ok(status)) => {
                debug!("Kernel {} exited: {}", kernel.pid, status);
                Ok(())
            }
            Ok(Err(e)) => Err(ProviderError::Io(e)),
            Err(_) => {
                warn!("Kernel {} ignored shutdown, killing", kernel.pid);
                child.kill().await.map_err(ProviderError::Io)
            }
        }
    }

    async fn remove(&self, handle: &RuntimeHandle) -> Result<()> {
        if let Some(kernel) = self.kernels.write().await.remove(&handle.id) {
            let mut child = kernel.child.lock().await;
            if let Ok(None) = child.try_wait() {
                child.kill().await.map_err(ProviderError::Io)?;
            }
        }
        Ok(())
    }

    async fn kill(&self, handle: &RuntimeHandle) -> Result<()> {
        let kernel = match self.kernels.write().await.remove(&handle.id) {
            Some(kernel) => kernel,
            None => return Ok(()),
        };
        warn!("Killing kernel process {}", kernel.pid);
        // SIGKILL directly; the child mutex may be held by a graceful stop in progress
        match Self::signal(kernel.pid, Signal::SIGKILL) {
            Ok(()) => Ok(()),
            Err(e) => {
                let mut child = kernel.child.lock().await;
                match child.try_wait() {
                    Ok(Some(_)) => Ok(()),
                    _ => Err(e),
                }
            }
        }
    }
}
