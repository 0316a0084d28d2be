//! keeld — the Keel daemon.
//!
//! Single binary that assembles the scheduler:
//! - State store (redb)
//! - Reconciliation coordinator + health monitors
//! - Resource manager backend
//! - REST API + Prometheus metrics
//!
//! # Usage
//!
//! ```text
//! keeld run --config keel.toml --simulate-agents 3
//! keeld check-config --config keel.toml
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, bail};
use clap::{Parser, Subcommand, ValueEnum};
use tracing::{info, warn};

use keel_core::KeelConfig;
use keel_scheduler::SchedulerHandle;
use keel_sim::{SimCluster, SimConfig, SimProber};
use keel_state::StateStore;

#[derive(Parser)]
#[command(name = "keeld", about = "Keel executor scheduler daemon")]
struct Cli {
    /// Log output format.
    #[arg(long, global = true, value_enum, default_value = "text")]
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
    /// Run the scheduler and its API.
    Run {
        /// Configuration file (TOML). Defaults apply when omitted.
        #[arg(long)]
        config: Option<PathBuf>,

        /// Override `[executors] desired_count`.
        #[arg(long)]
        desired_count: Option<u32>,

        /// Override `[state] data_dir`.
        #[arg(long)]
        data_dir: Option<PathBuf>,

        /// Override `[api] listen`.
        #[arg(long)]
        listen: Option<String>,

        /// Replace the persisted desired spec with the configured one.
        #[arg(long)]
        apply_config: bool,

        /// Run against an in-process cluster with this many agents.
        #[arg(long)]
        simulate_agents: Option<usize>,
    },
    /// Validate a configuration file, then print it normalized followed by
    /// the resolved settings.
    CheckConfig {
        #[arg(long)]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    match cli.command {
        Command::Run {
            config,
            desired_count,
            data_dir,
            listen,
            apply_config,
            simulate_agents,
        } => {
            let mut file = load_config(config.as_deref())?;
            if let Some(count) = desired_count {
                file.set_desired_count(count);
            }
            if let Some(dir) = data_dir {
                file.set_data_dir(dir);
            }
            if let Some(listen) = listen {
                file.set_listen(listen);
            }
            run(file, apply_config, simulate_agents).await
        }
        Command::CheckConfig { config } => {
            let file = load_config(Some(&config))?;
            let settings = file.resolve()?;
            println!("{}", file.to_toml_string()?);
            println!("{settings:#?}");
            Ok(())
        }
    }
}

fn init_tracing(format: LogFormat) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,keeld=debug,keel=debug"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

fn load_config(path: Option<&Path>) -> anyhow::Result<KeelConfig> {
    match path {
        Some(path) => KeelConfig::from_file(path),
        None => Ok(KeelConfig::default()),
    }
}

async fn run(
    config: KeelConfig,
    apply_config: bool,
    simulate_agents: Option<usize>,
) -> anyhow::Result<()> {
    let settings = config.resolve()?;
    let Some(agents) = simulate_agents else {
        bail!("no resource manager backend configured; pass --simulate-agents N");
    };
    info!(framework = %settings.framework_name, "keel daemon starting");

    // ── State store ────────────────────────────────────────────

    std::fs::create_dir_all(&settings.data_dir)
        .with_context(|| format!("creating data dir {}", settings.data_dir.display()))?;
    let db_path = settings.data_dir.join("keel.redb");
    let store = StateStore::open(&db_path)?;
    info!(path = ?db_path, "state store opened");

    // ── Cluster backend ────────────────────────────────────────

    let cluster = SimCluster::start(SimConfig::with_agents(agents));
    let prober = Arc::new(SimProber::new(cluster.clone()));
    info!(agents, "simulated cluster backend started");

    // ── Scheduler ──────────────────────────────────────────────

    let scheduler = SchedulerHandle::start(&settings, store, prober, apply_config, |events| {
        cluster.register(events)
    })
    .await?;

    // ── API server ─────────────────────────────────────────────

    let router = keel_api::build_router(scheduler.clone());
    let listener = tokio::net::TcpListener::bind(&settings.listen)
        .await
        .with_context(|| format!("binding {}", settings.listen))?;
    info!(addr = %settings.listen, "API server starting");

    axum::serve(listener, router)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "failed to listen for ctrl-c; shutting down");
            }
            info!("shutdown signal received");
        })
        .await?;

    scheduler.shutdown().await;
    cluster.stop();
    info!("keel daemon stopped");
    Ok(())
}
