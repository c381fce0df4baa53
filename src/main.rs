//! Volume Migrator
//!
//! Command-line front end: list claims, resize or delete one, or serve the
//! REST API. Progress of resize and delete is printed as it happens.

use anyhow::Context;
use clap::{Parser, Subcommand};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::broadcast::{self, error::RecvError, error::TryRecvError};
use tracing::{info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use volume_migrator::{
    format_bytes, ApiServer, ApiServerConfig, ClusterApiRef, InMemoryCluster, KubeCluster,
    MigrationConfig, MigrationEvent, ResizePhase, VolumeOrchestrator,
};

// =============================================================================
// CLI Arguments
// =============================================================================

/// Resize and safely delete Kubernetes persistent volume claims
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// YAML configuration file
    #[arg(long, env = "MIGRATOR_CONFIG")]
    config: Option<String>,

    /// Image used for probe and transfer pods (overrides the config file)
    #[arg(long, env = "WORKER_IMAGE")]
    worker_image: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "warn")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,

    /// Run against a simulated cluster (no Kubernetes)
    #[arg(long, env = "STANDALONE")]
    standalone: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List persistent volume claims
    List {
        /// Only this namespace
        #[arg(short, long)]
        namespace: Option<String>,
    },
    /// Resize a claim by migrating its data to a new volume
    Resize {
        namespace: String,
        name: String,
        /// New size, e.g. 10Gi
        size: String,
    },
    /// Drain every workload using a claim, then delete it
    Delete { namespace: String, name: String },
    /// Serve the REST API
    Serve {
        #[arg(long, env = "API_ADDR", default_value = "0.0.0.0:8090")]
        addr: SocketAddr,
    },
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    init_logging(&args);

    let mut config = match &args.config {
        Some(path) => MigrationConfig::from_file(path)
            .with_context(|| format!("loading configuration from {}", path))?,
        None => MigrationConfig::default(),
    };
    if let Some(image) = &args.worker_image {
        config.worker.image = image.clone();
    }

    let cluster: ClusterApiRef = if args.standalone {
        info!("Standalone mode: using a simulated cluster");
        Arc::new(InMemoryCluster::demo())
    } else {
        Arc::new(
            KubeCluster::try_default()
                .await
                .context("connecting to the Kubernetes API")?,
        )
    };
    let orchestrator = VolumeOrchestrator::new(config, cluster)?;

    match args.command {
        Command::List { namespace } => {
            let volumes = orchestrator.list_volumes(namespace.as_deref()).await?;
            println!(
                "{:<20} {:<32} {:<10} {:<10} {}",
                "NAMESPACE", "NAME", "SIZE", "PHASE", "STORAGECLASS"
            );
            for v in volumes {
                println!(
                    "{:<20} {:<32} {:<10} {:<10} {}",
                    v.namespace, v.name, v.size, v.phase, v.storage_class
                );
            }
        }
        Command::Resize {
            namespace,
            name,
            size,
        } => {
            let rx = orchestrator.subscribe();
            let report =
                with_progress(rx, orchestrator.resize_volume(&namespace, &name, &size)).await?;
            println!(
                "Resized PVC {}/{} from {} to {} ({})",
                report.namespace,
                report.claim,
                report.previous_size,
                report.size,
                format_bytes(report.target_bytes)
            );
            if report.phase == ResizePhase::DoneWithWarnings {
                for warning in &report.warnings {
                    println!("  warning: {}", warning);
                }
            }
        }
        Command::Delete { namespace, name } => {
            let rx = orchestrator.subscribe();
            let report = with_progress(rx, orchestrator.delete_volume(&namespace, &name)).await?;
            for deployment in &report.plan.deployments {
                println!(
                    "Deployment {} was scaled from {} replicas to 0 and left scaled down",
                    deployment.name, deployment.original_replicas
                );
            }
        }
        Command::Serve { addr } => {
            let server = Arc::new(ApiServer::new(ApiServerConfig { addr }, orchestrator));
            let signal = server.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    info!("Interrupt received, shutting down");
                    signal.shutdown();
                }
            });
            server.run().await?;
            info!("Server shutdown complete");
        }
    }

    Ok(())
}

/// Drive `op` to completion, printing every event it emits
async fn with_progress<T>(
    mut rx: broadcast::Receiver<MigrationEvent>,
    op: impl Future<Output = T>,
) -> T {
    tokio::pin!(op);
    let mut open = true;
    loop {
        tokio::select! {
            result = &mut op => {
                loop {
                    match rx.try_recv() {
                        Ok(event) => println!("{}", event),
                        Err(TryRecvError::Lagged(n)) => warn!(skipped = n, "progress output lagged"),
                        Err(_) => break,
                    }
                }
                return result;
            }
            event = rx.recv(), if open => match event {
                Ok(event) => println!("{}", event),
                Err(RecvError::Lagged(n)) => warn!(skipped = n, "progress output lagged"),
                Err(RecvError::Closed) => open = false,
            }
        }
    }
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let mut filter = EnvFilter::from_default_env().add_directive(level.into());
    for directive in ["hyper=warn", "kube=info", "tower=warn", "axum=info"] {
        if let Ok(directive) = directive.parse() {
            filter = filter.add_directive(directive);
        }
    }

    // stdout carries progress output
    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true).with_writer(std::io::stderr))
            .init();
    }
}
