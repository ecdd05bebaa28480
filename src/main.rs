//! harvest-replay: runs a recorded page session through the harvest engine
//!
//! The session file holds the page URL and the frames the page showed between
//! scroll steps. The engine ticks over them exactly as it would on a live page
//! and the finalized output sequence is printed as JSON.

#![allow(clippy::uninlined_format_args)]

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, ValueEnum};
use tracing::{info, warn};

use timeline_harvester::crawling::{
    EngineParts, EngineStart, HarvestEngine, HarvestEngineHandle, RecordingNavigator, RecordingSink, ReplaySession,
};
use timeline_harvester::domain::ShiftDirection;
use timeline_harvester::infrastructure::logging::{init_logging_with_config, log_system_info};
use timeline_harvester::infrastructure::{ConfigManager, FileStore, KeyValueStore, MemoryStore};

#[derive(Parser, Debug)]
#[command(name = "harvest-replay", version, about = "Replay a recorded page session through the harvest engine")]
struct Cli {
    /// Recorded session (JSON)
    session: PathBuf,

    /// Configuration file (defaults to the user config directory)
    #[arg(long, env = "HARVEST_CONFIG")]
    config: Option<PathBuf>,

    /// Directory of the persistent store
    #[arg(long, env = "HARVEST_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Keep checkpoint state in memory only
    #[arg(long)]
    in_memory: bool,

    /// Do not consult or update remembered ids
    #[arg(long)]
    no_remember: bool,

    /// Tick period override in milliseconds
    #[arg(long)]
    tick_ms: Option<u64>,

    /// Ignore the saved resume cursor and harvest from the top
    #[arg(long)]
    from_start: bool,

    /// On a search page, request the neighbouring since:/until: window instead of queueing
    #[arg(long, value_enum)]
    shift_window: Option<WindowShift>,

    /// Manual stop after this many ticks
    #[arg(long, default_value_t = 1000)]
    max_ticks: u32,

    /// Write the output sequence here instead of stdout
    #[arg(long, short)]
    output: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "HARVEST_LOG_LEVEL")]
    log_level: Option<String>,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum WindowShift {
    Backward,
    Forward,
}

impl From<WindowShift> for ShiftDirection {
    fn from(shift: WindowShift) -> Self {
        match shift {
            WindowShift::Backward => Self::Backward,
            WindowShift::Forward => Self::Forward,
        }
    }
}

/// Wall-clock budget for `max_ticks` ticks
fn tick_budget(tick_interval: Duration, max_ticks: u32) -> Result<Duration> {
    tick_interval
        .checked_mul(max_ticks)
        .ok_or_else(|| anyhow!("Tick budget of {} ticks at {:?} overflows", max_ticks, tick_interval))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let manager = match &cli.config {
        Some(path) => ConfigManager::with_path(path),
        None => ConfigManager::new()?,
    };
    let mut config = manager.load_config()?;
    if let Some(level) = &cli.log_level {
        config.logging.level.clone_from(level);
    }
    if let Some(tick_ms) = cli.tick_ms {
        config.timing.tick_ms = tick_ms;
    }
    if cli.no_remember {
        config.checkpoint.remember_ids = false;
    }
    if let Some(dir) = &cli.data_dir {
        config.checkpoint.data_dir = Some(dir.clone());
    }
    let config = config.normalized();

    init_logging_with_config(&config.logging, None).context("Failed to initialize logging")?;
    log_system_info();

    let store: Arc<dyn KeyValueStore> = if cli.in_memory {
        Arc::new(MemoryStore::new())
    } else {
        let root = ConfigManager::resolve_data_dir(&config)?;
        Arc::new(FileStore::open(&root).with_context(|| format!("Failed to open store at {:?}", root))?)
    };

    let session = ReplaySession::load(&cli.session)?;
    info!("🎞️ Replaying {} frames from {}", session.frames.len(), session.page_url);

    let sink = Arc::new(RecordingSink::new());
    let navigator = Arc::new(RecordingNavigator::new());
    let parts = EngineParts {
        observer: Arc::new(session.into_page()),
        sink: Arc::clone(&sink) as _,
        navigator: Arc::clone(&navigator) as _,
        store,
    };

    let mut engine = HarvestEngine::open(parts, config.clone()).await;
    if cli.from_start {
        engine.checkpoint_mut().clear_resume_cursor();
    }
    let start = match cli.shift_window {
        Some(shift) => {
            let url = engine.shift_search_window(shift.into()).await?;
            info!("Requested search window {}", url);
            None
        }
        None => Some(engine.begin().await?),
    };
    info!("Engine start: {:?}", start);

    if matches!(start, Some(EngineStart::Harvesting { .. })) {
        let budget = tick_budget(config.timing.tick_interval(), cli.max_ticks)?;
        let handle = HarvestEngineHandle::new(engine);

        tokio::select! {
            reason = handle.run() => info!("Run ended: {:?}", reason),
            () = tokio::time::sleep(budget) => {
                warn!("⏱️ Tick budget exhausted, stopping");
                handle.stop(false).await;
            }
            signal = tokio::signal::ctrl_c() => {
                signal.context("Failed to listen for ctrl-c")?;
                warn!("Interrupted, stopping");
                handle.stop(false).await;
            }
        }
    }

    for url in navigator.visits() {
        info!("🧭 Requested navigation: {}", url);
    }

    let outputs = sink.outputs();
    let json = serde_json::to_string_pretty(&outputs).context("Failed to serialize output")?;
    match &cli.output {
        Some(path) => {
            tokio::fs::write(path, json)
                .await
                .with_context(|| format!("Failed to write {:?}", path))?;
            info!("✅ Output written to {:?}", path);
        }
        None => println!("{}", json),
    }

    // Give the non-blocking log writer a moment to drain
    tokio::time::sleep(Duration::from_millis(50)).await;
    Ok(())
}
