use std::path::PathBuf;
use structopt::StructOpt;
use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use wlagent::config::{ConfigManager, LogFormat, LoggingConfig};
use wlagent::lifecycle::LifecycleMethod;
use wlagent::service::{rpc, LifecycleRequest, Service};

#[derive(Debug, StructOpt)]
#[structopt(name = "wlagent", about = "Workload agent keeping VM disks encrypted at rest")]
enum Opt {
    /// Run the agent daemon
    Run {
        /// Path to configuration file
        #[structopt(short, long, parse(from_os_str))]
        config: PathBuf,
    },

    /// Hook: prepare a VM's disks before it is defined
    Prepare(HookOpt),

    /// Hook: prepare a VM's disks right before it boots
    Start(HookOpt),

    /// Hook: release a VM's disks after it stopped
    Stop(HookOpt),
}

#[derive(Debug, StructOpt)]
struct HookOpt {
    /// Agent socket
    #[structopt(short, long, parse(from_os_str), default_value = "/var/run/workload-agent/wlagent.sock")]
    socket: PathBuf,

    /// Read the domain XML from this file instead of stdin
    #[structopt(long, parse(from_os_str))]
    domain_xml: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    match Opt::from_args() {
        Opt::Run { config } => run_daemon(config).await,
        Opt::Prepare(hook) => exit_with(run_hook(LifecycleMethod::Prepare, hook).await),
        Opt::Start(hook) => exit_with(run_hook(LifecycleMethod::Start, hook).await),
        Opt::Stop(hook) => exit_with(run_hook(LifecycleMethod::Stop, hook).await),
    }
}

fn init_tracing(logging: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(logging.level.as_directive()));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);

    match logging.format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Plain => builder.init(),
    }
}

async fn run_daemon(config_path: PathBuf) -> Result<(), Box<dyn std::error::Error>> {
    let config_manager = ConfigManager::load_from_file(&config_path).map_err(|e| {
        eprintln!("Failed to load configuration from {}: {}", config_path.display(), e);
        e
    })?;
    init_tracing(&config_manager.get_config().logging);

    info!("Starting wlagent {}", env!("CARGO_PKG_VERSION"));

    let service = Service::start(&config_manager).await.map_err(|e| {
        error!("Failed to start workload agent: {}", e);
        e
    })?;

    // Create a shutdown channel
    let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);

    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigint = signal(SignalKind::interrupt())?;
        let mut sigterm = signal(SignalKind::terminate())?;

        tokio::spawn(async move {
            tokio::select! {
                _ = sigint.recv() => {
                    info!("Received SIGINT, shutting down...");
                }
                _ = sigterm.recv() => {
                    info!("Received SIGTERM, shutting down...");
                }
            }
            let _ = shutdown_tx.send(()).await;
        });
    }

    shutdown_rx.recv().await;

    service.shutdown().await?;
    Ok(())
}

/// Forwards one hook invocation to the daemon; true when it succeeded
async fn run_hook(method: LifecycleMethod, hook: HookOpt) -> Result<bool, Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    let domain_xml = match &hook.domain_xml {
        Some(path) => tokio::fs::read_to_string(path).await?,
        None => {
            let mut xml = String::new();
            tokio::io::stdin().read_to_string(&mut xml).await?;
            xml
        }
    };

    let reply = rpc::call(&hook.socket, &LifecycleRequest { method, domain_xml }).await?;
    if let Some(reason) = &reply.error {
        error!(%method, "{}", reason);
    }
    Ok(reply.exit_code() == 0)
}

fn exit_with(outcome: Result<bool, Box<dyn std::error::Error>>) -> Result<(), Box<dyn std::error::Error>> {
    match outcome {
        Ok(true) => Ok(()),
        Ok(false) => std::process::exit(1),
        Err(e) => {
            eprintln!("wlagent: {}", e);
            std::process::exit(1)
        }
    }
}
