use clap::{Parser, Subcommand};
use taskmesh::config::{AppConfig, LoggingConfig};
use taskmesh::error::Result;
use taskmesh::sim::Simulation;
use tokio::signal;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "taskmesh")]
#[command(version = "0.1.0")]
#[command(about = "Decentralized task allocation and cooperation for agent fleets", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Config directory path
    #[arg(short, long, default_value = "config")]
    config: String,

    /// RNG seed override for reproducible scenarios
    #[arg(long)]
    seed: Option<u64>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the full simulation: allocation session, then the tick loop
    Run {
        /// Tick budget before the run is abandoned
        #[arg(long, default_value = "5000")]
        max_ticks: u64,
    },
    /// Run one allocation session and print the report as JSON
    Allocate,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut cfg = AppConfig::load_from(&cli.config)?;
    if cli.seed.is_some() {
        cfg.scenario.seed = cli.seed;
    }
    init_logging(&cfg.logging);

    match cli.command.unwrap_or(Commands::Run { max_ticks: 5000 }) {
        Commands::Run { max_ticks } => run_simulation(&cfg, max_ticks).await?,
        Commands::Allocate => {
            let mut sim = Simulation::from_config(&cfg)?;
            let report = sim.allocate();
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
    }

    Ok(())
}

/// Tick loop paced at `motion.tick_ms`, interruptible by Ctrl+C/SIGTERM.
async fn run_simulation(cfg: &AppConfig, max_ticks: u64) -> Result<()> {
    let mut sim = Simulation::from_config(cfg)?;

    let allocation = sim.allocate();
    if !allocation.all_resolved() {
        warn!(unresolved = ?allocation.unresolved, "starting with a partially allocated fleet");
    }

    let mut pacer = interval(Duration::from_millis(cfg.motion.tick_ms));
    pacer.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let mut ticks_run = 0u64;
    loop {
        tokio::select! {
            _ = pacer.tick() => {
                let report = sim.tick()?;
                ticks_run += 1;

                if report.assists_completed > 0 {
                    info!(ticks_run, "assist episodes ended, re-running allocation");
                    sim.allocate();
                }
                if sim.completed() {
                    info!(ticks_run, "all agents reached their goals");
                    break;
                }
                if ticks_run >= max_ticks {
                    warn!(ticks_run, "tick budget exhausted before convergence");
                    break;
                }
            }
            _ = shutdown_signal() => {
                info!(ticks_run, "shutdown signal received, stopping");
                break;
            }
        }
    }

    for agent in sim.agents.values() {
        info!(
            agent = %agent.name,
            engagement = ?agent.engagement,
            reached = agent.reached_goal,
            priority = agent.priority,
            "final agent state"
        );
    }
    Ok(())
}

fn init_logging(cfg: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("{},taskmesh=debug", cfg.level)));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false);

    if cfg.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => error!("Failed to install SIGTERM handler: {}", e),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
