//! Headless match runner.
//!
//! Runs the simulation without graphics for CI testing and replay
//! verification.
//!
//! # Usage
//!
//! ```bash
//! # Run the built-in smoke scenario for 600 ticks
//! cargo run -p vox_headless -- run
//!
//! # Run a scenario file and record a replay
//! cargo run -p vox_headless -- run --scenario skirmish.ron --replay out.replay
//!
//! # Verify a recorded replay reproduces its final hash
//! cargo run -p vox_headless -- verify --replay out.replay
//! ```
//!
//! Output (stdout): one JSON summary per command
//! Logs (stderr): debug information

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use vox_headless::runner::{verify_replay, HeadlessRunner};
use vox_headless::scenario::Scenario;

#[derive(Parser)]
#[command(name = "vox_headless")]
#[command(about = "Headless match runner for CI and replay verification")]
#[command(version)]
struct Cli {
    /// Enable verbose logging to stderr
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a scripted scenario and print its summary
    Run {
        /// Scenario file to load (built-in skirmish if omitted)
        #[arg(short, long)]
        scenario: Option<PathBuf>,

        /// Number of ticks to simulate
        #[arg(short, long, default_value = "600")]
        ticks: u64,

        /// Record the run to a replay file
        #[arg(short, long)]
        replay: Option<PathBuf>,
    },

    /// Verify a recorded replay reproduces its final hash
    Verify {
        /// Replay file to verify
        #[arg(short, long)]
        replay: PathBuf,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        tracing_subscriber::EnvFilter::new("debug")
    } else {
        tracing_subscriber::EnvFilter::from_default_env()
    };
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();

    match run(cli.command) {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            tracing::error!(%error, "headless run failed");
            ExitCode::FAILURE
        }
    }
}

fn run(command: Commands) -> Result<(), Box<dyn std::error::Error>> {
    match command {
        Commands::Run {
            scenario,
            ticks,
            replay,
        } => {
            let scenario = match scenario {
                Some(path) => Scenario::load(&path)?,
                None => Scenario::builtin_skirmish(),
            };
            let mut runner = HeadlessRunner::new(scenario)?;
            let summary = runner.run(ticks)?;
            if let Some(path) = replay {
                runner.replay().save(&path)?;
                tracing::info!(path = %path.display(), "replay written");
            }
            println!("{}", serde_json::to_string(&summary)?);
        }
        Commands::Verify { replay } => {
            let verified = verify_replay(&replay)?;
            println!(
                "{}",
                serde_json::to_string(&serde_json::json!({
                    "replay": replay.display().to_string(),
                    "verified": verified,
                }))?
            );
            if !verified {
                return Err("replay hash mismatch".into());
            }
        }
    }
    Ok(())
}
