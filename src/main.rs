//! Calorimetry rig controller: command-line entry point.
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────────┐
//! │                      Adapters (outer ring)                     │
//! │                                                                │
//! │  SerialPorts / SimulatedPorts   LogEventSink   Monotonic/Scaled│
//! │  (PortOpener → Transport)       (EventSink)    (Clock)         │
//! │                                                                │
//! │  ──────────────── Port Trait Boundary ───────────────────      │
//! │                                                                │
//! │  ┌────────────────────────────────────────────────────────┐    │
//! │  │              Automation (pure logic)                   │    │
//! │  │  Strategy · Pump/Thermostat/Calorimeter drivers        │    │
//! │  └────────────────────────────────────────────────────────┘    │
//! │                                                                │
//! │  Runner (tick loop) · CancellationToken (Enter on stdin)       │
//! └────────────────────────────────────────────────────────────────┘
//! ```

use std::io::BufRead;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::rc::Rc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use log::{info, warn};

use calorimetry_rig::adapters::log_sink::LogEventSink;
use calorimetry_rig::adapters::serial::SerialPorts;
use calorimetry_rig::adapters::sim::SimulatedPorts;
use calorimetry_rig::adapters::time::{MonotonicClock, ScaledClock};
use calorimetry_rig::app::builder::build_automation;
use calorimetry_rig::app::ports::Clock;
use calorimetry_rig::app::runner::{self, CancellationToken, Report};
use calorimetry_rig::config::RigConfig;

#[derive(Debug, Parser)]
#[command(name = "calorimetry-rig", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the operation point list to the end.  Press Enter to stop early.
    Run {
        /// Rig configuration (JSON).
        #[arg(short, long)]
        config: PathBuf,
        /// Talk to simulated instruments instead of serial ports.
        #[arg(long)]
        simulate: bool,
        /// Clock speed-up for simulated runs.
        #[arg(long, default_value_t = 1.0)]
        time_scale: f64,
        /// Write rows, point boundaries and metrics here as JSON.
        #[arg(short, long)]
        report: Option<PathBuf>,
    },
    /// Validate a configuration without opening any port.
    Check {
        #[arg(short, long)]
        config: PathBuf,
    },
}

fn load(path: &Path) -> Result<RigConfig> {
    let config = RigConfig::load(path).with_context(|| format!("loading {}", path.display()))?;
    config.validate().with_context(|| format!("validating {}", path.display()))?;
    Ok(config)
}

/// Cancels `token` once a line arrives on stdin.  A closed stdin never cancels.
fn watch_stdin(token: CancellationToken) {
    std::thread::spawn(move || {
        let mut line = String::new();
        if matches!(std::io::stdin().lock().read_line(&mut line), Ok(n) if n > 0) {
            token.cancel();
        }
    });
}

fn run(config: &RigConfig, simulate: bool, time_scale: f64, report: Option<&Path>) -> Result<bool> {
    let (clock, pause): (Rc<dyn Clock>, _) = if simulate {
        let clock = ScaledClock::new(time_scale);
        let pause = config.timing.tick_interval().div_f64(clock.scale());
        (Rc::new(clock), pause)
    } else {
        (Rc::new(MonotonicClock), config.timing.tick_interval())
    };

    let mut automation = if simulate {
        info!("run: simulated instruments, time x{}", time_scale);
        build_automation(config, &mut SimulatedPorts::new(Rc::clone(&clock)), clock)
    } else {
        build_automation(config, &mut SerialPorts, clock)
    }
    .context("building the rig")?;

    let cancel = CancellationToken::new();
    watch_stdin(cancel.clone());
    info!("run: press Enter to stop");

    let mut sink = LogEventSink::new();
    let outcome = runner::run(&mut automation, &mut sink, &cancel, || std::thread::sleep(pause));

    if let Some(path) = report {
        let json = serde_json::to_string_pretty(&Report::collect(&automation)).context("serialising the report")?;
        std::fs::write(path, json).with_context(|| format!("writing {}", path.display()))?;
        info!("run: report written to {}", path.display());
    }

    if !outcome.finished() {
        warn!("run: did not finish (final state {:?})", outcome.state);
    }
    Ok(outcome.finished())
}

fn main() -> Result<ExitCode> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    info!("calorimetry-rig v{}", env!("CARGO_PKG_VERSION"));

    match Cli::parse().command {
        Command::Check { config } => {
            let rig = load(&config)?;
            info!(
                "check: {} is valid ({} pump(s), {} operation point(s))",
                config.display(),
                rig.pumps.len(),
                rig.operation_points.len()
            );
            Ok(ExitCode::SUCCESS)
        }
        Command::Run {
            config,
            simulate,
            time_scale,
            report,
        } => {
            let rig = load(&config)?;
            let finished = run(&rig, simulate, time_scale, report.as_deref())?;
            Ok(if finished { ExitCode::SUCCESS } else { ExitCode::FAILURE })
        }
    }
}
