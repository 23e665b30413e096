// src/service/mod.rs

pub mod protocol;
pub mod rpc;

use std::sync::Arc;
use std::time::Duration;
use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::association::ImageVmAssociations;
use crate::config::{AgentConfig, ConfigError, ConfigManager};
use crate::execution::{CommandRunner, SystemCommandRunner};
use crate::lifecycle::{Collaborators, LifecycleError, Orchestrator, OrchestratorSettings};
use crate::network::{HttpKeyService, KeyServiceError};
use crate::security::{KeyCache, KeyUnwrapper, Tpm2ToolsProvider, UnwrapError};
use crate::vm::{DomainParser, LibvirtDomainParser};
use crate::volume::{DmCryptVolumeManager, QemuImgProbe};
use crate::watcher::{NotifyWatcher, WatcherError};

pub use protocol::{LifecycleReply, LifecycleRequest};
pub use rpc::{RequestHandler, RpcServer};

/// Turns hook requests into orchestrator calls
pub struct Dispatcher {
    /// Domain XML parser
    parser: Arc<dyn DomainParser>,

    /// Lifecycle orchestrator
    orchestrator: Arc<Orchestrator>,
}

impl Dispatcher {
    /// Creates a dispatcher
    pub fn new(parser: Arc<dyn DomainParser>, orchestrator: Arc<Orchestrator>) -> Self {
        Self { parser, orchestrator }
    }
}

#[async_trait]
impl RequestHandler for Dispatcher {
    async fn handle(&self, request: LifecycleRequest) -> LifecycleReply {
        let descriptor = match self.parser.parse(&request.domain_xml) {
            Ok(descriptor) => descriptor,
            Err(e) => {
                warn!(method = %request.method, "Rejecting request with unusable domain XML: {}", e);
                return LifecycleReply::failure(LifecycleError::Input(e.to_string()).to_string());
            }
        };

        match self.orchestrator.run(request.method, &descriptor).await {
            Ok(_) => LifecycleReply::success(),
            Err(e) => LifecycleReply::failure(e.to_string()),
        }
    }
}

/// Running agent: orchestrator, watcher and RPC listener
pub struct Service {
    /// Configuration the service was built from
    config: AgentConfig,

    /// Lifecycle orchestrator
    orchestrator: Arc<Orchestrator>,

    /// Shutdown signal for the RPC server
    shutdown_tx: watch::Sender<bool>,

    /// RPC server task
    server_task: JoinHandle<Result<(), ServiceError>>,

    /// Instance watcher task
    watcher_task: JoinHandle<()>,
}

impl Service {
    /// Builds every component from configuration and starts serving
    pub async fn start(manager: &ConfigManager) -> Result<Self, ServiceError> {
        let config = manager.get_config().clone();

        let runner: Arc<dyn CommandRunner> = Arc::new(SystemCommandRunner::new(Duration::from_secs(
            config.volume.command_timeout_seconds,
        )));

        // Key material
        let tpm = Arc::new(Tpm2ToolsProvider::new(runner.clone(), &config.tpm));
        let unwrapper = Arc::new(KeyUnwrapper::from_config(tpm, &config.tpm)?);
        let key_service = Arc::new(HttpKeyService::from_config(&config.key_service)?);

        // Host side state
        let owner = config.runtime.resolve_owner()?;
        let hardware_uuid = manager.hardware_uuid()?;
        std::fs::create_dir_all(&config.paths.mount_root).map_err(|e| {
            ServiceError::InitializationError(format!(
                "Failed to create mount root {}: {}",
                config.paths.mount_root.display(),
                e
            ))
        })?;

        let watcher = Arc::new(NotifyWatcher::new(Duration::from_millis(config.watcher.debounce_ms))?);
        let watcher_task = watcher.spawn();

        let orchestrator = Arc::new(Orchestrator::new(
            OrchestratorSettings {
                mount_root: config.paths.mount_root.clone(),
                hardware_uuid,
                owner,
            },
            Collaborators {
                volumes: Arc::new(DmCryptVolumeManager::new(runner.clone(), &config.volume, &config.paths)),
                key_service,
                unwrapper,
                associations: Arc::new(ImageVmAssociations::new(config.paths.association_file.clone())),
                keys: Arc::new(KeyCache::new()),
                probe: Arc::new(QemuImgProbe::new(runner, config.volume.qemu_img_path.clone())),
                watcher: Some(watcher),
            },
        ));

        let dispatcher = Arc::new(Dispatcher::new(Arc::new(LibvirtDomainParser::new()), orchestrator.clone()));

        let request_timeout = match config.rpc.request_timeout_seconds {
            0 => None,
            seconds => Some(Duration::from_secs(seconds)),
        };
        let server = RpcServer::bind(&config.rpc.socket_path, request_timeout)?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let server_task = tokio::spawn(server.serve(dispatcher, shutdown_rx));

        info!(socket = %config.rpc.socket_path.display(), "Workload agent started");

        Ok(Self {
            config,
            orchestrator,
            shutdown_tx,
            server_task,
            watcher_task,
        })
    }

    /// Configuration in use
    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    /// Lifecycle orchestrator
    pub fn orchestrator(&self) -> Arc<Orchestrator> {
        self.orchestrator.clone()
    }

    /// Stops accepting requests; calls already running finish on their own tasks
    pub async fn shutdown(self) -> Result<(), ServiceError> {
        let _ = self.shutdown_tx.send(true);

        let result = match self.server_task.await {
            Ok(result) => result,
            Err(e) => Err(ServiceError::InitializationError(format!("RPC server task failed: {}", e))),
        };
        self.watcher_task.abort();

        info!("Workload agent stopped");
        result
    }
}

/// Service errors
#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    #[error("Initialization error: {0}")]
    InitializationError(String),

    #[error("Socket error on {path}: {error}")]
    Socket {
        path: String,
        error: String,
    },

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("I/O error: {0}")]
    Io(String),
}

impl From<ConfigError> for ServiceError {
    fn from(error: ConfigError) -> Self {
        ServiceError::ConfigurationError(error.to_string())
    }
}

impl From<UnwrapError> for ServiceError {
    fn from(error: UnwrapError) -> Self {
        ServiceError::InitializationError(error.to_string())
    }
}

impl From<WatcherError> for ServiceError {
    fn from(error: WatcherError) -> Self {
        ServiceError::InitializationError(error.to_string())
    }
}

impl From<KeyServiceError> for ServiceError {
    fn from(error: KeyServiceError) -> Self {
        ServiceError::InitializationError(error.to_string())
    }
}
