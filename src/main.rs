//! Cadence - Entity/component lifecycle runtime
//!
//! Host binary: loads settings, installs logging, builds the demo scene, and
//! drives the entity manager for a fixed number of frames.

mod demo;
mod settings;

use anyhow::{Context, Result};
use cadence_core::GameTime;
use clap::Parser;
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use crate::demo::Demo;
use crate::settings::Settings;

#[derive(Parser)]
#[command(version, about = "Drives the Cadence demo scene for a number of frames")]
struct Cli {
    /// Frames to run; overrides the settings file
    #[arg(long, value_name = "N")]
    frames: Option<u64>,

    /// Log filter; overrides the settings file (RUST_LOG wins over both)
    #[arg(long, value_name = "FILTER")]
    log_level: Option<String>,

    /// Write the effective settings back to the settings file
    #[arg(long)]
    save_settings: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut settings = Settings::load();
    if let Some(frames) = cli.frames {
        settings.runtime.frames = frames;
    }
    if let Some(level) = cli.log_level {
        settings.runtime.log_level = level;
    }

    // Initialize logging
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&settings.runtime.log_level))
        .context("Invalid log filter")?;
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber).context("Failed to set subscriber")?;

    info!("Starting Cadence...");

    if cli.save_settings {
        settings.save()?;
    }

    let demo = Demo::build(&settings.demo)?;
    let mut time = GameTime::new(settings.time.clone());
    let report_every = ((1.0 / settings.runtime.fixed_delta).round() as u64).max(1);

    for frame in 1..=settings.runtime.frames {
        time.update(settings.runtime.fixed_delta);
        let stats = demo
            .step(&time)
            .with_context(|| format!("Frame {} failed", frame))?;

        if frame % report_every == 0 {
            info!(
                "t={:.2}s frame {}: {} entities live, {} started this frame, {} removed",
                time.total_time,
                frame,
                demo.manager.entity_count(),
                stats.started,
                stats.removed
            );
        }
    }

    info!(
        "Finished {} frames: {} motes spawned, {} expired, {} entities live",
        settings.runtime.frames,
        demo.census.spawned(),
        demo.census.expired(),
        demo.manager.entity_count()
    );
    Ok(())
}
