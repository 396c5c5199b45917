use std::path::PathBuf;
use std::thread;

use anyhow::{Context, Result};
use clap::Parser;

use pyre_core::{Config, SceneFile};
use pyre_engine::{Engine, RenderOptions};

#[derive(Debug, clap::Parser)]
#[command(name = "pyre", about = "Render a scene to OpenEXR")]
struct CommandLineArguments {
    #[arg(help = "Render config file (JSON)")]
    config: PathBuf,

    #[arg(help = "Scene file (JSON)")]
    scene: PathBuf,

    #[arg(
        long,
        default_value_t = 16,
        help = "Stop after N consecutive stats intervals with no progress (0 disables)"
    )]
    intervals: u32,

    #[arg(long, help = "Maximum in-flight render jobs (defaults to the CPU count)")]
    jobs: Option<u32>,

    #[arg(long, help = "Sampling seed, for reproducible renders")]
    seed: Option<u64>,
}

fn default_jobs() -> u32 {
    thread::available_parallelism().map_or(4, |n| n.get() as u32)
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = CommandLineArguments::parse();

    log::info!("Loading config from {}.", args.config.display());
    let config = Config::load(&args.config)
        .with_context(|| format!("can't continue with bad config {}", args.config.display()))?;

    log::info!("Loading scene from {}.", args.scene.display());
    let scene = SceneFile::load(&args.scene)
        .with_context(|| format!("can't continue with bad scene {}", args.scene.display()))?;

    let options = RenderOptions {
        max_jobs: args.jobs.unwrap_or_else(default_jobs).max(1),
        max_intervals: args.intervals,
        seed: args.seed,
    };

    let engine = Engine::new(config, scene, options).context("scene setup failed")?;
    let stats = engine.run().context("render failed")?;

    log::info!(
        "Done: {} intersect rays, {} light rays",
        stats.intersects_killed,
        stats.lights_killed
    );

    Ok(())
}
