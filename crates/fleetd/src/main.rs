//! fleetd — the FleetGrid daemon.
//!
//! Runs the placement, scaling, and deployment control loops against an
//! in-process simulated instance group and load balancer.
//!
//! # Usage
//!
//! ```text
//! fleetd run --config fleet.toml --data-dir /var/lib/fleetgrid
//! fleetd validate --config fleet.toml
//! fleetd deploy --config fleet.toml --service web --revision 2
//! fleetd init --cluster demo > fleet.toml
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, bail};
use clap::{Parser, Subcommand, ValueEnum};
use tokio::sync::watch;
use tokio_stream::StreamExt;
use tracing::info;
use tracing_subscriber::EnvFilter;

use fleetd::ControlPlane;
use fleetgrid_core::FleetConfig;
use fleetgrid_rollout::DeploymentPhase;
use fleetgrid_state::StateStore;

const DEFAULT_FILTER: &str = "info,fleetd=debug,fleetgrid=debug";

#[derive(Parser)]
#[command(name = "fleetd", about = "FleetGrid daemon")]
struct Cli {
    /// Log output format.
    #[arg(long, value_enum, default_value = "text", global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Command {
    /// Run every control loop until Ctrl-C.
    Run {
        /// Path to fleet.toml.
        #[arg(long, default_value = "fleet.toml")]
        config: PathBuf,

        /// Data directory for persistent state.
        #[arg(long, default_value = "/var/lib/fleetgrid")]
        data_dir: PathBuf,
    },

    /// Parse and validate a configuration file.
    Validate {
        #[arg(long, default_value = "fleet.toml")]
        config: PathBuf,
    },

    /// Roll a service to a new task definition revision and print progress
    /// events as JSON lines.
    Deploy {
        #[arg(long, default_value = "fleet.toml")]
        config: PathBuf,

        #[arg(long)]
        service: String,

        #[arg(long)]
        revision: u32,

        /// CPU units for the new revision (default: unchanged).
        #[arg(long)]
        cpu: Option<u32>,

        /// Memory (MiB) for the new revision (default: unchanged).
        #[arg(long)]
        memory: Option<u32>,

        /// Persist state here instead of running purely in memory.
        #[arg(long)]
        data_dir: Option<PathBuf>,
    },

    /// Print a starter configuration.
    Init {
        #[arg(long, default_value = "demo")]
        cluster: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    match cli.command {
        Command::Run { config, data_dir } => run(&config, &data_dir).await,
        Command::Validate { config } => validate(&config),
        Command::Deploy {
            config,
            service,
            revision,
            cpu,
            memory,
            data_dir,
        } => deploy(&config, &service, revision, cpu, memory, data_dir.as_deref()).await,
        Command::Init { cluster } => {
            print!("{}", FleetConfig::scaffold(&cluster).to_toml_string()?);
            Ok(())
        }
    }
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

fn load_config(path: &Path) -> anyhow::Result<FleetConfig> {
    FleetConfig::from_file(path).with_context(|| format!("loading {}", path.display()))
}

fn open_store(data_dir: &Path) -> anyhow::Result<StateStore> {
    std::fs::create_dir_all(data_dir)
        .with_context(|| format!("creating {}", data_dir.display()))?;
    let path = data_dir.join("fleetgrid.redb");
    let store = StateStore::open(&path)?;
    info!(path = ?path, "state store opened");
    Ok(store)
}

async fn run(config_path: &Path, data_dir: &Path) -> anyhow::Result<()> {
    let config = load_config(config_path)?;
    info!(cluster = %config.cluster.name, services = config.services.len(), "fleetd starting");

    let store = open_store(data_dir)?;
    let plane = ControlPlane::new(config, Some(store)).await?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handles = plane.spawn_loops(&shutdown_rx);

    tokio::signal::ctrl_c()
        .await
        .context("installing Ctrl-C handler")?;
    info!("shutdown signal received");
    let _ = shutdown_tx.send(true);

    for handle in handles {
        let _ = handle.await;
    }
    plane.persist().await;

    info!("fleetd stopped");
    Ok(())
}

fn validate(config_path: &Path) -> anyhow::Result<()> {
    let config = load_config(config_path)?;
    let cp = &config.capacity_provider;

    println!("cluster {}: configuration is valid", config.cluster.name);
    println!(
        "  capacity provider {}: {} ({}), size {}..={}, target {}%",
        cp.name,
        cp.instance_type,
        cp.instance_resources(),
        cp.min_size,
        cp.max_size,
        cp.target_capacity_percent
    );
    for svc in &config.services {
        println!(
            "  service {}: {} x{} ({})",
            svc.name,
            svc.task_definition.reference(),
            svc.desired_count,
            svc.task_definition.requirements()
        );
        if let Some(policy) = &svc.scaling {
            println!(
                "    scaling: {} target {} in {}..={}",
                policy.metric, policy.target_value, policy.min_capacity, policy.max_capacity
            );
        }
    }
    Ok(())
}

async fn deploy(
    config_path: &Path,
    service: &str,
    revision: u32,
    cpu: Option<u32>,
    memory: Option<u32>,
    data_dir: Option<&Path>,
) -> anyhow::Result<()> {
    let config = load_config(config_path)?;
    let startup = config.simulation.startup_delay;
    let store = data_dir.map(open_store).transpose()?;
    let plane = ControlPlane::new(config, store).await?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handles = plane.spawn_loops(&shutdown_rx);

    let current = plane
        .registry()
        .service(service)
        .await
        .with_context(|| format!("unknown service {service}"))?;
    plane
        .wait_for_service(service, startup + Duration::from_secs(60))
        .await?;

    let mut definition = current.task_definition.clone();
    definition.revision = revision;
    definition.cpu = cpu.unwrap_or(definition.cpu);
    definition.memory = memory.unwrap_or(definition.memory);

    let (handle, mut events) = plane.deployments().roll_out(service, definition);
    while let Some(event) = events.next().await {
        println!("{}", serde_json::to_string(&event)?);
    }
    let phase = handle.wait().await.context("deployment task panicked")?;

    let _ = shutdown_tx.send(true);
    for handle in handles {
        let _ = handle.await;
    }

    match phase {
        DeploymentPhase::Steady => Ok(()),
        other => bail!("deployment of {service} ended {}", serde_json::to_string(&other)?),
    }
}
