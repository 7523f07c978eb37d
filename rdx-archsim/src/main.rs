use anyhow::{Context, Result};
use archsim::demo::{build_pipeline, register_factories};
use archsim::prelude::*;
use colored::Colorize;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

const CORES: u32 = 2;

#[tokio::main]
async fn main() -> ExitCode {
    // 1. Initialize structured logging.
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .init();

    match drive() {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            let code = err
                .downcast_ref::<SimError>()
                .map(SimError::exit_code)
                .unwrap_or(1);
            error!("{err:#}");
            eprintln!("{} {err:#}", "error:".red().bold());
            ExitCode::from(code as u8)
        }
    }
}

/// Builds the demo pipeline, optionally configured from the TOML file named
/// by the first argument, and runs it through its whole lifecycle.
fn drive() -> Result<()> {
    let file = match std::env::args_os().nth(1).map(PathBuf::from) {
        Some(path) => ConfigFile::load(&path).with_context(|| format!("loading {}", path.display()))?,
        None => ConfigFile::default(),
    };

    // 2. Create the simulation and listen to its system events.
    let mut sim = Simulation::with_config("top", file.settings.clone())?;
    spawn_event_listener(&sim);

    // 3. Build and configure the model.
    register_factories(&mut sim)?;
    let pipeline = build_pipeline(&mut sim, CORES)?;
    sim.apply_config(&file)?;
    sim.enter_configuring()?;
    sim.enter_finalized()?;
    sim.finalize_scheduler()?;
    pipeline.arm(&mut sim)?;

    // 4. Run.
    let summary = sim.run_configured()?;
    sim.validate_post_run()?;
    print_report(&sim, &summary);
    sim.enter_teardown()?;
    info!("{} {} finished", archsim::ENGINE_NAME, archsim::VERSION);
    Ok(())
}

fn spawn_event_listener(sim: &Simulation) {
    let mut system_rx = sim.subscribe_system_events();
    tokio::spawn(async move {
        while let Ok(event) = system_rx.recv().await {
            info!("[SYSTEM] => {:?}", event);
        }
    });
}

fn print_report(sim: &Simulation, summary: &RunSummary) {
    println!("{} {}", "run:".green().bold(), summary);
    for (location, value) in sim.statistics(sim.top()) {
        println!("  {:<40} {}", location.cyan(), value);
    }
}
