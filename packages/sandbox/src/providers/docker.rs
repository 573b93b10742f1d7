// ABOUTME: Docker provider running the execution kernel as PID 1 of a locked-down container
// ABOUTME: Uses bollard to create, attach, interrupt, stop and remove sandbox containers

use super::{
    CellRequest, ContainerConfig, FrameStream, Provider, ProviderCapabilities, ProviderError,
    Result, RuntimeHandle, SecurityProfile,
};
use crate::kernel::{install_kernel, KernelChannel, KernelFrame, LineDecoder, KERNEL_FILE};
use async_trait::async_trait;
use bollard::{
    container::{
        AttachContainerOptions, AttachContainerResults, Config, CreateContainerOptions,
        KillContainerOptions, LogOutput, RemoveContainerOptions, StartContainerOptions,
        StopContainerOptions,
    },
    image::CreateImageOptions,
    models::{HostConfig, ResourcesUlimits},
    Docker,
};
use branchlab_core::constants::CONTAINER_WORKSPACE;
use branchlab_core::KERNEL_DIR;
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, warn};

pub const DEFAULT_LABEL_PREFIX: &str = "branchlab.sandbox";

pub struct DockerProvider {
    client: Docker,
    label_prefix: String,
    /// Images pulled by this process, keyed by reference
    image_cache: Arc<RwLock<HashMap<String, chrono::DateTime<chrono::Utc>>>>,
    pull_timeout: Duration,
    kernels: RwLock<HashMap<String, Arc<KernelChannel>>>,
}

impl DockerProvider {
    /// Create a new Docker provider with default pull timeout (10 minutes)
    pub fn new() -> Result<Self> {
        Self::with_pull_timeout(Duration::from_secs(600))
    }

    pub fn with_pull_timeout(timeout: Duration) -> Result<Self> {
        let client = Docker::connect_with_defaults()
            .map_err(|e| ProviderError::ConnectionError(e.to_string()))?;
        Ok(Self::with_client(client, timeout))
    }

    pub fn with_client(client: Docker, pull_timeout: Duration) -> Self {
        Self {
            client,
            label_prefix: DEFAULT_LABEL_PREFIX.to_string(),
            image_cache: Arc::new(RwLock::new(HashMap::new())),
            pull_timeout,
            kernels: RwLock::new(HashMap::new()),
        }
    }

    /// Resolve the seccomp option and refuse profiles the daemon cannot enforce.
    async fn ensure_policy(&self, security: &SecurityProfile) -> Result<Option<String>> {
        let mut seccomp_json = None;
        if let Some(path) = &security.seccomp_profile {
            let contents = tokio::fs::read_to_string(path).await.map_err(|e| {
                ProviderError::PolicyUnsupported(format!(
                    "cannot read seccomp profile {}: {}",
                    path.display(),
                    e
                ))
            })?;
            serde_json::from_str::<serde_json::Value>(&contents).map_err(|e| {
                ProviderError::PolicyUnsupported(format!(
                    "seccomp profile {} is not valid JSON: {}",
                    path.display(),
                    e
                ))
            })?;
            seccomp_json = Some(contents);
        }

        if security.require_seccomp {
            let info = self
                .client
                .info()
                .await
                .map_err(|e| ProviderError::ConnectionError(e.to_string()))?;
            let supported = info
                .security_options
                .unwrap_or_default()
                .iter()
                .any(|option| option.contains("seccomp"));
            if !supported {
                return Err(ProviderError::PolicyUnsupported(
                    "Docker daemon does not report seccomp support".to_string(),
                ));
            }
        }

        Ok(seccomp_json)
    }

    async fn attach_and_start(
        &self,
        handle: &RuntimeHandle,
        startup_timeout: Duration,
    ) -> Result<Arc<KernelChannel>> {
        let options = AttachContainerOptions::<String> {
            stdin: Some(true),
            stdout: Some(true),
            stderr: Some(true),
            stream: Some(true),
            logs: Some(false),
            detach_keys: None,
        };
        let AttachContainerResults { mut output, input } = self
            .client
            .attach_container(&handle.id, Some(options))
            .await
            .map_err(|e| ProviderError::ContainerError(e.to_string()))?;

        let (tx, rx) = mpsc::unbounded_channel();
        let name = handle.name.clone();
        tokio::spawn(async move {
            let mut decoder = LineDecoder::default();
            while let Some(item) = output.next().await {
                match item {
                    Ok(LogOutput::StdOut { message }) | Ok(LogOutput::Console { message }) => {
                        for line in decoder.push(&message) {
                            if let Some(frame) = KernelFrame::parse_line(&line) {
                                if tx.send(frame).is_err() {
                                    return;
                                }
                            }
                        }
                    }
                    Ok(LogOutput::StdErr { message }) => {
                        debug!(
                            "Kernel stderr ({}): {}",
                            name,
                            String::from_utf8_lossy(&message).trim_end()
                        );
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!("Attach stream for {} failed: {}", name, e);
                        break;
                    }
                }
            }
            if let Some(frame) = decoder
                .finish()
                .and_then(|rest| KernelFrame::parse_line(&rest))
            {
                let _ = tx.send(frame);
            }
            debug!("Attach stream closed for {}", name);
        });

        let channel = Arc::new(KernelChannel::new(input, rx));

        self.client
            .start_container(&handle.id, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| ProviderError::ContainerError(e.to_string()))?;

        channel.wait_ready(startup_timeout).await?;
        Ok(channel)
    }

    async fn channel(&self, handle: &RuntimeHandle) -> Result<Arc<KernelChannel>> {
        self.kernels
            .read()
            .await
            .get(&handle.id)
            .cloned()
            .ok_or_else(|| ProviderError::UnknownHandle(handle.name.clone()))
    }

    async fn force_remove(&self, container_id: &str) -> Result<()> {
        let options = RemoveContainerOptions {
            force: true,
            v: true,
            ..Default::default()
        };
        match self.client.remove_container(container_id, Some(options)).await {
            Ok(()) => Ok(()),
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(()),
            Err(e) => Err(ProviderError::ContainerError(e.to_string())),
        }
    }

    async fn pull_image(&self, image: &str) -> Result<()> {
        if self.image_cache.read().await.contains_key(image) && self.image_exists(image).await? {
            return Ok(());
        }

        info!("Pulling image: {} (timeout: {:?})", image, self.pull_timeout);

        let options = CreateImageOptions {
            from_image: image.to_string(),
            ..Default::default()
        };
        let mut stream = self.client.create_image(Some(options), None, None);

        let result = tokio::time::timeout(self.pull_timeout, async {
            let mut last_status = String::new();
            while let Some(result) = stream.next().await {
                let progress = result.map_err(|e| {
                    ProviderError::ImageError(format!("Failed to pull image {}: {}", image, e))
                })?;
                if let Some(error) = progress.error {
                    return Err(ProviderError::ImageError(format!(
                        "Failed to pull image {}: {}",
                        image, error
                    )));
                }
                if let Some(status) = progress.status {
                    if status != last_status {
                        debug!("Pull status: {}", status);
                        last_status = status;
                    }
                }
            }
            Ok(())
        })
        .await;

        match result {
            Ok(Ok(())) => {
                info!("Successfully pulled image: {}", image);
                self.image_cache
                    .write()
                    .await
                    .insert(image.to_string(), chrono::Utc::now());
                Ok(())
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(ProviderError::ImageError(format!(
                "Timeout pulling image {} after {:?}",
                image, self.pull_timeout
            ))),
        }
    }

    async fn image_exists(&self, image: &str) -> Result<bool> {
        match self.client.inspect_image(image).await {
            Ok(_) => Ok(true),
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(false),
            Err(e) => Err(ProviderError::ImageError(e.to_string())),
        }
    }
}

/// Translate a sandbox request into a container body. Every control in the security
/// profile maps onto a host-config field; nothing is silently dropped.
pub fn to_bollard_config(
    config: &ContainerConfig,
    label_prefix: &str,
    seccomp_json: Option<String>,
) -> Config<String> {
    let security = &config.security;
    let limits = &config.limits;

    let mut labels = config.labels.clone();
    labels.insert(format!("{}.managed", label_prefix), "true".to_string());
    labels.insert(
        format!("{}.session", label_prefix),
        config.session_id.clone(),
    );

    let mut env: Vec<String> = config
        .env_vars
        .iter()
        .map(|(key, value)| format!("{}={}", key, value))
        .collect();
    env.sort();
    env.push("PYTHONUNBUFFERED=1".to_string());
    env.push("MPLBACKEND=Agg".to_string());
    // read-only rootfs leaves /tmp as the only writable place for caches
    env.push("HOME=/tmp".to_string());

    let mut security_opt = Vec::new();
    if security.no_new_privileges {
        security_opt.push("no-new-privileges:true".to_string());
    }
    if let Some(profile) = seccomp_json {
        security_opt.push(format!("seccomp={}", profile));
    }

    let tmpfs: HashMap<String, String> = security.scratch_mounts.iter().cloned().collect();
    let memory_bytes = (limits.memory_mb * 1024 * 1024) as i64;
    let nofile = limits.nofile_limit as i64;

    let host_config = HostConfig {
        binds: Some(vec![format!(
            "{}:{}:rw",
            config.workspace.display(),
            CONTAINER_WORKSPACE
        )]),
        memory: Some(memory_bytes),
        memory_swap: Some(memory_bytes),
        nano_cpus: Some((limits.cpu_cores * 1_000_000_000.0) as i64),
        pids_limit: Some(limits.pids_limit),
        ulimits: Some(vec![ResourcesUlimits {
            name: Some("nofile".to_string()),
            soft: Some(nofile),
            hard: Some(nofile),
        }]),
        readonly_rootfs: Some(security.read_only_rootfs),
        tmpfs: (!tmpfs.is_empty()).then_some(tmpfs),
        cap_drop: security
            .drop_all_capabilities
            .then(|| vec!["ALL".to_string()]),
        security_opt: (!security_opt.is_empty()).then_some(security_opt),
        network_mode: security.network_disabled.then(|| "none".to_string()),
        ..Default::default()
    };

    Config {
        image: Some(config.image.clone()),
        cmd: Some(vec![
            config.python.clone(),
            "-u".to_string(),
            format!("{}/{}/{}", CONTAINER_WORKSPACE, KERNEL_DIR, KERNEL_FILE),
        ]),
        env: Some(env),
        working_dir: Some(CONTAINER_WORKSPACE.to_string()),
        labels: Some(labels),
        user: security.user.clone(),
        open_stdin: Some(true),
        stdin_once: Some(false),
        attach_stdin: Some(true),
        attach_stdout: Some(true),
        attach_stderr: Some(true),
        tty: Some(false),
        network_disabled: Some(security.network_disabled),
        host_config: Some(host_config),
        ..Default::default()
    }
}

#[async_trait]
impl Provider for DockerProvider {
    fn kind(&self) -> &'static str {
        "docker"
    }

    fn capabilities(&self) -> ProviderCapabilities {
        ProviderCapabilities {
            isolated: true,
            network_isolation: true,
            resource_limits: true,
            seccomp: true,
        }
    }

    async fn is_available(&self) -> Result<bool> {
        match self.client.ping().await {
            Ok(_) => Ok(true),
            Err(e) => {
                warn!("Docker not available: {}", e);
                Ok(false)
            }
        }
    }

    async fn create(&self, config: &ContainerConfig) -> Result<RuntimeHandle> {
        info!("Creating sandbox container: {}", config.name);

        let seccomp_json = self.ensure_policy(&config.security).await?;
        install_kernel(&config.workspace.join(KERNEL_DIR)).await?;

        if !self.image_exists(&config.image).await? {
            self.pull_image(&config.image).await?;
        }

        let body = to_bollard_config(config, &self.label_prefix, seccomp_json);
        let options = CreateContainerOptions {
            name: config.name.clone(),
            platform: None,
        };
        let container = self
            .client
            .create_container(Some(options), body)
            .await
            .map_err(|e| ProviderError::ContainerError(e.to_string()))?;

        let handle = RuntimeHandle {
            id: container.id,
            name: config.name.clone(),
        };
        debug!("Created container {} ({})", handle.name, handle.id);

        match self.attach_and_start(&handle, config.startup_timeout).await {
            Ok(channel) => {
                self.kernels
                    .write()
                    .await
                    .insert(handle.id.clone(), channel);
                Ok(handle)
            }
            Err(e) => {
                warn!("Sandbox container {} failed to start: {}", handle.name, e);
                if let Err(remove_err) = self.force_remove(&handle.id).await {
                    warn!("Failed to clean up {}: {}", handle.name, remove_err);
                }
                Err(e)
            }
        }
    }

    async fn exec(&self, handle: &RuntimeHandle, request: CellRequest) -> Result<FrameStream> {
        let channel = self.channel(handle).await?;
        channel.submit(request).await
    }

    async fn interrupt(&self, handle: &RuntimeHandle) -> Result<()> {
        debug!("Interrupting container: {}", handle.name);
        self.client
            .kill_container(&handle.id, Some(KillContainerOptions { signal: "SIGINT" }))
            .await
            .map_err(|e| ProviderError::ContainerError(e.to_string()))
    }

    async fn stop(&self, handle: &RuntimeHandle, grace: Duration) -> Result<()> {
        info!("Stopping container: {} (grace: {:?})", handle.name, grace);

        if let Some(channel) = self.kernels.write().await.remove(&handle.id) {
            channel.shutdown().await;
        }

        let options = StopContainerOptions {
            t: grace.as_secs().max(1) as i64,
        };
        match self.client.stop_container(&handle.id, Some(options)).await {
            Ok(()) => Ok(()),
            // 304: already stopped, 404: already gone
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 304 | 404,
                ..
            }) => Ok(()),
            Err(e) => Err(ProviderError::ContainerError(e.to_string())),
        }
    }

    async fn remove(&self, handle: &RuntimeHandle) -> Result<()> {
        info!("Removing container: {}", handle.name);
        self.kernels.write().await.remove(&handle.id);
        self.force_remove(&handle.id).await
    }

    async fn kill(&self, handle: &RuntimeHandle) -> Result<()> {
        warn!("Killing container: {}", handle.name);
        self.kernels.write().await.remove(&handle.id);

        match self
            .client
            .kill_container(&handle.id, Some(KillContainerOptions { signal: "SIGKILL" }))
            .await
        {
            Ok(()) => {}
            // 409: not running, 404: already gone; removal below still applies
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404 | 409,
                ..
            }) => {}
            Err(e) => return Err(ProviderError::ContainerError(e.to_string())),
        }
        self.force_remove(&handle.id).await
    }
}
