//! modgated - candidate module validation daemon
//!
//! ## Commands
//!
//! - `run`: run the upgrade scheduler until interrupted
//! - `validate`: screen, execute and score one candidate file
//! - `config`: print the effective configuration

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, Level};

use modgate_core::fakes::{MemoryLiveSystem, QueueIntegrator, RecordingLearner};
use modgate_core::sandbox::{
    CandidateModule, NetworkIsolation, PatternPolicy, ProcessExecutor, Readiness,
    SandboxController, SandboxOptions, TestScenario,
};
use modgate_core::upgrade::{spawn_scheduler, UpgradeConfig, UpgradeOrchestrator};
use modgate_core::{init_tracing, ModgateConfig, METRICS};

#[derive(Parser)]
#[command(name = "modgated")]
#[command(author = "Stevedores Org")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Sandboxed validation and staged upgrades for candidate modules", long_about = None)]
struct Cli {
    /// TOML configuration file
    #[arg(short, long, global = true, env = "MODGATE_CONFIG")]
    config: Option<PathBuf>,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Interpreter used to execute candidates
    #[arg(long, global = true, default_value = "node")]
    interpreter: String,

    /// Arguments passed to the interpreter before the candidate source
    #[arg(
        long = "interpreter-arg",
        global = true,
        allow_hyphen_values = true,
        default_values_t = vec!["-e".to_string()]
    )]
    interpreter_args: Vec<String>,

    /// How candidates are kept off the network: unshare, external or none
    #[arg(long, global = true, default_value = "unshare", env = "MODGATE_NETWORK_ISOLATION")]
    network_isolation: NetworkIsolation,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the scheduler until Ctrl-C
    Run {
        /// JSON file with an array of upgrade requests to queue at startup
        #[arg(long)]
        jobs: Option<PathBuf>,
    },

    /// Validate one candidate source file and print its verdict
    Validate {
        /// Candidate source file
        file: PathBuf,

        /// JSON file with an array of test scenarios
        #[arg(long)]
        scenarios: Option<PathBuf>,

        /// Execution timeout in milliseconds
        #[arg(long)]
        timeout_ms: Option<u64>,
    },

    /// Print the effective configuration as JSON
    Config,
}

fn load_config(path: Option<&Path>) -> Result<ModgateConfig> {
    match path {
        Some(p) => ModgateConfig::load(p).with_context(|| format!("loading {}", p.display())),
        None => Ok(ModgateConfig::default()),
    }
}

fn build_controller(cfg: &ModgateConfig, cli: &Cli) -> SandboxController {
    let executor = ProcessExecutor::new(&cli.interpreter, cli.interpreter_args.clone())
        .with_search_path(std::env::var("PATH").unwrap_or_else(|_| "/usr/bin:/bin".into()))
        .with_network_isolation(cli.network_isolation);
    SandboxController::new(
        cfg.sandbox.clone(),
        cfg.scoring.clone(),
        Arc::new(PatternPolicy::standard(cfg.policy.clone())),
        Arc::new(executor),
    )
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let raw = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("parsing {}", path.display()))
}

async fn run(cfg: ModgateConfig, cli: &Cli, jobs: Option<&Path>) -> Result<()> {
    let controller = Arc::new(build_controller(&cfg, cli));
    let orchestrator = Arc::new(UpgradeOrchestrator::new(
        cfg.orchestrator.clone(),
        controller,
        Arc::new(RecordingLearner::default()),
        Arc::new(QueueIntegrator::new(0, 16)),
        Arc::new(MemoryLiveSystem::default()),
    ));

    if let Some(path) = jobs {
        let requests: Vec<UpgradeConfig> = read_json(path)?;
        for request in requests {
            let id = orchestrator.schedule_upgrade(request).await?;
            info!(job_id = %id, "queued upgrade");
        }
    }

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let scheduler = spawn_scheduler(Arc::clone(&orchestrator), shutdown_rx);
    info!("modgated running; press Ctrl-C to stop");

    tokio::signal::ctrl_c().await.context("waiting for Ctrl-C")?;
    info!("shutting down");
    shutdown_tx.send(true).ok();
    scheduler.await.context("scheduler task")?;

    let status = orchestrator.upgrade_status().await;
    info!(
        queue_length = status.queue_length,
        last_success = status.last_outcome.as_ref().map(|o| o.success),
        "final status"
    );
    METRICS.flush();
    Ok(())
}

async fn validate(
    cfg: ModgateConfig,
    cli: &Cli,
    file: &Path,
    scenarios: Option<&Path>,
    timeout_ms: Option<u64>,
) -> Result<Readiness> {
    let source =
        std::fs::read_to_string(file).with_context(|| format!("reading {}", file.display()))?;
    let id = file
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "candidate".into());
    let mut module = CandidateModule::new(&id, &id, source);
    if let Some(path) = scenarios {
        let list: Vec<TestScenario> = read_json(path)?;
        module.test_scenarios = list;
    }

    let controller = build_controller(&cfg, cli);
    let verdict = controller
        .validate(
            &module,
            SandboxOptions {
                timeout_ms,
                ..Default::default()
            },
        )
        .await?;
    println!("{}", serde_json::to_string_pretty(&verdict)?);
    Ok(verdict.readiness)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    init_tracing(cli.json, level);

    let cfg = load_config(cli.config.as_deref())?;

    match &cli.command {
        Commands::Run { jobs } => run(cfg, &cli, jobs.as_deref()).await,
        Commands::Validate {
            file,
            scenarios,
            timeout_ms,
        } => {
            let readiness = validate(cfg, &cli, file, scenarios.as_deref(), *timeout_ms).await?;
            if readiness == Readiness::NotReady {
                std::process::exit(2);
            }
            Ok(())
        }
        Commands::Config => {
            println!("{}", serde_json::to_string_pretty(&cfg)?);
            Ok(())
        }
    }
}
