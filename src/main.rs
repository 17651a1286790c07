use clap::Parser;
use std::path::PathBuf;
use tracing::{info, warn};
use z80_debugger::config::{RemoteConfig, SessionConfig, TargetSource};
use z80_debugger::debugger::{DebugSession, Z80Classifier};
use z80_debugger::target::{SimulatorTarget, Target, TraceTarget};
use z80_debugger::{executor, logging, Result};

#[derive(Parser, Debug)]
#[command(name = "z80-debugger", about = "Step backwards and forwards through Z80 execution")]
struct Args {
    /// JSON launch configuration
    #[arg(long)]
    config: Option<PathBuf>,

    /// Replay a recorded trace file
    #[arg(long, conflicts_with = "connect")]
    trace: Option<PathBuf>,

    /// Attach to a simulator
    #[arg(long, value_name = "HOST:PORT")]
    connect: Option<String>,

    #[arg(long)]
    log_level: Option<String>,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => SessionConfig::from_file(path)?,
        None => SessionConfig::default(),
    };
    if let Some(trace) = args.trace {
        config.trace = Some(trace);
        config.remote = None;
    }
    if let Some(connect) = &args.connect {
        config.remote = Some(RemoteConfig::parse(connect)?);
        config.trace = None;
    }
    if let Some(level) = args.log_level {
        config.log.level = level;
    }

    logging::init_logger(&config.log)?;
    info!("=== DEBUGGER STARTED ===");

    let target: Box<dyn Target> = match config.target_source()? {
        TargetSource::Trace(path) => Box::new(TraceTarget::from_file(&path)?),
        TargetSource::Remote(remote) => Box::new(
            SimulatorTarget::connect(&remote, config.history.reverse_debug_instruction_count)?
                .with_labels(config.label_table())
                .with_top_of_stack(config.top_of_stack),
        ),
    };
    let mut session = DebugSession::new(
        target,
        Box::new(Z80Classifier),
        Box::new(config.label_table()),
        &config,
    )?;

    if !config.stop_on_entry {
        if let Err(e) = session.continue_() {
            warn!(error = %e, "could not start the program");
        }
    }

    executor::run_console(&mut session, &config.labels)?;
    session.terminate();
    info!("=== DEBUGGER EXITING ===");
    Ok(())
}
