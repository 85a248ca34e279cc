use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::sync::Mutex;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use rollcall::browser::CdpBrowserProvider;
use rollcall::challenge::ChallengeSolver;
use rollcall::clock::SystemClock;
use rollcall::config::{default_config_path, Config};
use rollcall::fastpath::FastPathClient;
use rollcall::orchestrator::{CheckinOrchestrator, EngineContext};
use rollcall::provider::{load_credentials, SiteCatalog};
use rollcall::report::print_run_report;
use rollcall::results::ResultLog;
use rollcall::state::StateStore;

#[derive(Parser)]
#[command(name = "rollcall")]
#[command(about = "Keeps a fleet of accounts checked in daily")]
struct Cli {
    /// Path to config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the daily check-in pass (default)
    Run {
        /// One credential group at a time, regardless of memory
        #[arg(long)]
        serial: bool,

        /// Show the browser instead of running headless
        #[arg(long)]
        headful: bool,
    },
    /// Print the current state summary without contacting anything
    Status,
    /// Show the resolved configuration
    Config,
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new(
                "info,chromiumoxide=warn,chromiumoxide::conn=off,chromiumoxide::handler=off",
            )
        }))
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false),
        )
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    let config_path = cli.config.unwrap_or_else(default_config_path);
    let config = Config::load_or_default(&config_path)?.resolve(&config_path);

    match cli.command.unwrap_or(Command::Run {
        serial: false,
        headful: false,
    }) {
        Command::Run { serial, headful } => {
            let exit = run(config, serial, headful).await?;
            std::process::exit(exit);
        }
        Command::Status => {
            let clock = Arc::new(SystemClock);
            let state = StateStore::load(&config.state_file, clock)?;
            let credentials = load_credentials(&config.accounts_file).unwrap_or_default();
            print_run_report(&state, &credentials, std::time::Duration::ZERO);
        }
        Command::Config => {
            println!("Config file: {}", config_path.display());
            println!("Data directory: {}", config.data_dir.display());
            println!("Sites: {}", config.sites_file.display());
            println!("Accounts: {}", config.accounts_file.display());
            println!("State: {}", config.state_file.display());
            println!("Results: {}", config.results_file.display());
        }
    }

    Ok(())
}

async fn run(
    config: rollcall::config::ResolvedConfig,
    serial: bool,
    headful: bool,
) -> Result<i32> {
    let started = Instant::now();
    let clock = Arc::new(SystemClock);

    let catalog = SiteCatalog::load(&config.sites_file)?;
    let credentials = load_credentials(&config.accounts_file)?;
    tracing::info!(
        sites = catalog.len(),
        accounts = credentials.len(),
        "configuration loaded"
    );

    let mut state = StateStore::load(&config.state_file, clock.clone())?;
    let changes = state.sync(&catalog, &credentials)?;
    for change in &changes {
        tracing::info!("  {change}");
    }

    let run_order: Vec<String> = catalog.iter().map(|(k, _)| k.to_string()).collect();
    let results = ResultLog::open(&config.results_file)?;

    let solver = ChallengeSolver::new(&config.challenge).context("challenge solver setup")?;
    let solver = if solver.runtime_available().await {
        Some(Arc::new(solver))
    } else {
        tracing::warn!(
            binary = %config.challenge.node_binary,
            "sandbox runtime unavailable; protected sites will fail"
        );
        None
    };

    let client = Arc::new(FastPathClient::new(&config.oauth.session_cookie)?);
    let browsers = Arc::new(CdpBrowserProvider::new(!headful));

    let mut run_config = config.run.clone();
    if serial {
        run_config.parallel = false;
    }

    let state = Arc::new(Mutex::new(state));
    let context = EngineContext::new(
        state.clone(),
        Arc::new(Mutex::new(results)),
        client,
        browsers,
        credentials.clone(),
        run_order,
    )
    .with_solver(solver)
    .with_oauth(config.oauth.clone())
    .with_run(run_config)
    .with_clock(clock);

    let orchestrator = CheckinOrchestrator::new(context);
    let summary = orchestrator.run_all().await?;

    {
        let state = state.lock().await;
        print_run_report(&state, &credentials, started.elapsed());
    }

    // Succeed only when at least one task resolved usefully; schedulers
    // alert on total failure.
    Ok(if summary.any_effective() { 0 } else { 1 })
}
