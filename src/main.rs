use std::path::PathBuf;
use std::process;

use clap::{Parser, Subcommand};
use colored::Colorize;
use tracing_subscriber::EnvFilter;

use dollhouse::daemon::House;
use dollhouse::interp::HEAP_CELLS;
use dollhouse::repl::Repl;
use dollhouse::sandbox::Sandbox;

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser)]
#[command(name = "dollhouse")]
#[command(version = VERSION)]
#[command(about = "Dollhouse - a cooperative daemon host with an embedded Lisp", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Sandbox root directory; every daemon file access resolves inside it
    #[arg(long, global = true, default_value = "dollhouse_sandbox")]
    sandbox: PathBuf,

    /// Cells per interpreter semispace
    #[arg(long, global = true, default_value_t = HEAP_CELLS)]
    heap: usize,

    /// Evaluation trace level (0 = off, 1 = steps, 2 = single-step)
    #[arg(long, global = true, default_value_t = 0)]
    trace: u64,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the interactive REPL
    Repl,

    /// Boot daemons from .proc manifests and run scheduler cycles
    Run {
        /// Manifest paths, relative to the sandbox root
        #[arg(required = true)]
        manifests: Vec<String>,

        /// Stop after this many scheduler cycles (default: run to quiescence)
        #[arg(long)]
        cycles: Option<u64>,
    },
}

fn run_house(
    sandbox: Sandbox,
    heap: usize,
    trace: u64,
    manifests: &[String],
    cycles: Option<u64>,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut house = House::with_heap(sandbox, heap);
    for manifest in manifests {
        let id = house.boot_manifest(manifest)?;
        if let Some(daemon) = house.daemon_mut(id) {
            daemon.interp.set_trace(trace);
        }
    }
    let ran = house.run(cycles);
    tracing::info!(cycles = ran, daemons = house.daemon_count(), "house quiescent");
    Ok(())
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let sandbox = Sandbox::new(cli.sandbox);

    let result: Result<(), Box<dyn std::error::Error>> = match cli.command {
        Some(Commands::Repl) | None => match Repl::new(sandbox, cli.heap) {
            Ok(mut repl) => {
                repl.set_trace(cli.trace);
                repl.run();
                Ok(())
            }
            Err(fault) => Err(format!("cannot start interpreter: {}", fault).into()),
        },
        Some(Commands::Run { manifests, cycles }) => {
            run_house(sandbox, cli.heap, cli.trace, &manifests, cycles)
        }
    };

    if let Err(err) = result {
        eprintln!("{} {}", "error:".red().bold(), err);
        process::exit(1);
    }
}
