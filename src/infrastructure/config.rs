//! Configuration infrastructure
//!
//! Contains configuration loading and management for the harvester.
//!
//! Configuration is layered:
//! 1. Built-in defaults (the `defaults` module below)
//! 2. JSON config file under the user config directory
//! 3. `HARVEST__<SECTION>__<KEY>` environment overrides

#![allow(clippy::uninlined_format_args)]
#![allow(missing_docs)]

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::info;

/// Complete harvester configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HarvestConfig {
    /// Tick and poll timing
    pub timing: TimingConfig,

    /// Auto-stop and stall limits
    pub limits: LimitsConfig,

    /// Translation overlay deferral
    pub translation: TranslationConfig,

    /// Remembered ids and resume cursor
    pub checkpoint: CheckpointConfig,

    /// Multi-page search run
    pub search_run: SearchRunConfig,

    /// Logging configuration
    pub logging: LoggingConfig,
}

/// Timing configuration settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    /// Harvest tick period in milliseconds
    pub tick_ms: u64,

    /// Translation overlay poll interval in milliseconds
    pub translation_poll_ms: u64,

    /// Poll interval while paused waiting for new posts to load
    pub load_poll_ms: u64,

    /// Delay before harvesting a status page opened by a search run
    pub search_run_start_delay_ms: u64,

    /// Scroll distance per tick in pixels
    pub scroll_step_px: u32,
}

/// Auto-stop / stall detection settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    /// Stop automatically when the page stops producing posts
    pub auto_stop: bool,

    /// Consecutive no-progress ticks before a stall stop
    pub max_no_new_ticks: u32,

    /// No-progress ticks with the end marker visible before stopping
    pub end_marker_ticks: u32,

    /// No-progress ticks before the load-wait pause is considered
    pub pause_min_ticks: u32,

    /// Idle time since the last new node before pausing (timeline mode)
    pub pause_threshold_ms: u64,

    /// Maximum time to wait for new nodes once paused
    pub load_wait_timeout_ms: u64,
}

/// Translation overlay deferral settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TranslationConfig {
    /// Hold posts back until the translation overlay attached content
    pub wait_for_overlay: bool,

    /// Configured wait window in milliseconds (clamped to 0..=15000)
    pub wait_ms: u64,

    /// Lower bound of the effective wait window
    pub min_effective_wait_ms: u64,

    /// Deferral attempts per post before giving up
    pub max_defer_attempts: u32,

    /// Entries older than this many wait windows get a fresh window
    pub stale_factor: u32,
}

/// Checkpoint settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckpointConfig {
    /// Persist accepted ids so later runs skip them
    pub remember_ids: bool,

    /// Debounce window for remembered-id writes
    pub save_debounce_ms: u64,

    /// Directory of the file-backed store; `None` uses the app data directory
    pub data_dir: Option<PathBuf>,
}

/// Multi-page search run settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchRunConfig {
    /// Status pages visited per run (clamped to 15..=20)
    pub max_targets: usize,

    /// Collector tick budget on the search page
    pub collect_max_ticks: u32,

    /// Collector stops after this many ticks without a new candidate
    pub collect_max_no_progress_ticks: u32,
}

/// Logging configuration settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level: "error", "warn", "info", "debug", "trace"
    pub level: String,

    /// Enable JSON formatted logs
    pub json_format: bool,

    /// Enable console output
    pub console_output: bool,

    /// Enable file output
    pub file_output: bool,

    /// Module-specific log level filters (e.g., "timeline_harvester::crawling": "debug")
    pub module_filters: HashMap<String, String>,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            tick_ms: defaults::TICK_MS,
            translation_poll_ms: defaults::TRANSLATION_POLL_MS,
            load_poll_ms: defaults::LOAD_POLL_MS,
            search_run_start_delay_ms: defaults::SEARCH_RUN_START_DELAY_MS,
            scroll_step_px: defaults::SCROLL_STEP_PX,
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            auto_stop: defaults::AUTO_STOP_ENABLED,
            max_no_new_ticks: defaults::MAX_NO_NEW_TICKS,
            end_marker_ticks: defaults::END_MARKER_TICKS,
            pause_min_ticks: defaults::PAUSE_MIN_TICKS,
            pause_threshold_ms: defaults::TIMELINE_PAUSE_THRESHOLD_MS,
            load_wait_timeout_ms: defaults::TIMELINE_LOAD_WAIT_MS,
        }
    }
}

impl Default for TranslationConfig {
    fn default() -> Self {
        Self {
            wait_for_overlay: defaults::WAIT_FOR_OVERLAY,
            wait_ms: defaults::TRANSLATION_WAIT_MS,
            min_effective_wait_ms: defaults::MIN_EFFECTIVE_TRANSLATION_WAIT_MS,
            max_defer_attempts: defaults::MAX_DEFER_ATTEMPTS,
            stale_factor: defaults::DEFER_STALE_FACTOR,
        }
    }
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            remember_ids: defaults::REMEMBER_IDS,
            save_debounce_ms: defaults::REMEMBERED_SAVE_DEBOUNCE_MS,
            data_dir: None,
        }
    }
}

impl Default for SearchRunConfig {
    fn default() -> Self {
        Self {
            max_targets: defaults::SEARCH_RUN_MAX_TARGETS,
            collect_max_ticks: defaults::SEARCH_COLLECT_MAX_TICKS,
            collect_max_no_progress_ticks: defaults::SEARCH_COLLECT_MAX_NO_PROGRESS_TICKS,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: defaults::LOG_LEVEL.to_string(),
            json_format: defaults::LOG_JSON_FORMAT,
            console_output: defaults::LOG_CONSOLE_OUTPUT,
            file_output: defaults::LOG_FILE_OUTPUT,
            module_filters: {
                let mut filters = HashMap::new();
                filters.insert("tokio".to_string(), "info".to_string());
                filters.insert("timeline_harvester".to_string(), "info".to_string());
                filters
            },
        }
    }
}

impl TimingConfig {
    #[must_use]
    pub const fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_ms)
    }

    #[must_use]
    pub fn effective_scroll_step(&self) -> u32 {
        clamp_scroll_step(self.scroll_step_px)
    }
}

impl TranslationConfig {
    /// Configured wait after clamping; 0 disables settling
    #[must_use]
    pub fn clamped_wait(&self) -> Duration {
        Duration::from_millis(clamp_translation_wait(self.wait_ms))
    }
}

impl SearchRunConfig {
    #[must_use]
    pub fn effective_max_targets(&self) -> usize {
        clamp_search_run_max_targets(self.max_targets)
    }
}

impl HarvestConfig {
    /// Returns a copy with every clamped field brought into range
    #[must_use]
    pub fn normalized(mut self) -> Self {
        self.translation.wait_ms = clamp_translation_wait(self.translation.wait_ms);
        self.search_run.max_targets = clamp_search_run_max_targets(self.search_run.max_targets);
        self.timing.scroll_step_px = clamp_scroll_step(self.timing.scroll_step_px);
        if self.timing.tick_ms == 0 {
            self.timing.tick_ms = defaults::TICK_MS;
        }
        self
    }
}

#[must_use]
pub fn clamp_translation_wait(wait_ms: u64) -> u64 {
    wait_ms.clamp(defaults::MIN_TRANSLATION_WAIT_MS, defaults::MAX_TRANSLATION_WAIT_MS)
}

#[must_use]
pub fn clamp_search_run_max_targets(max_targets: usize) -> usize {
    max_targets.clamp(defaults::MIN_SEARCH_RUN_MAX_TARGETS, defaults::MAX_SEARCH_RUN_MAX_TARGETS)
}

#[must_use]
pub fn clamp_scroll_step(step_px: u32) -> u32 {
    step_px.clamp(defaults::MIN_EFFECTIVE_SCROLL_STEP_PX, defaults::MAX_SCROLL_STEP_PX)
}

/// Configuration manager for loading and saving settings
pub struct ConfigManager {
    config_path: PathBuf,
}

impl ConfigManager {
    /// Get the application configuration directory
    pub fn get_config_dir() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .context("Failed to get user config directory")?
            .join(defaults::APP_DIR_NAME);

        Ok(config_dir)
    }

    /// Get application data directory (file-backed store lives here)
    pub fn get_app_data_dir() -> Result<PathBuf> {
        let data_dir = dirs::data_local_dir()
            .context("Failed to get user data directory")?
            .join(defaults::APP_DIR_NAME);

        Ok(data_dir)
    }

    /// Create a configuration manager for the default config file
    pub fn new() -> Result<Self> {
        let config_path = Self::get_config_dir()?.join(defaults::CONFIG_FILE_NAME);
        Ok(Self { config_path })
    }

    /// Create a configuration manager for an explicit config file
    #[must_use]
    pub fn with_path(config_path: impl Into<PathBuf>) -> Self {
        Self { config_path: config_path.into() }
    }

    #[must_use]
    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    /// Load configuration: defaults, then the JSON file (if present), then environment overrides
    pub fn load_config(&self) -> Result<HarvestConfig> {
        let exists = self.config_path.exists();

        let config: HarvestConfig = Config::builder()
            .add_source(File::from(self.config_path.as_path()).format(FileFormat::Json).required(false))
            .add_source(Environment::with_prefix(defaults::ENV_PREFIX).separator("__").try_parsing(true))
            .build()
            .with_context(|| format!("Failed to read configuration: {:?}", self.config_path))?
            .try_deserialize()
            .context("Failed to parse configuration")?;

        if exists {
            info!("📋 Loaded configuration from: {:?}", self.config_path);
        } else {
            info!("📋 No configuration file at {:?}, using defaults", self.config_path);
        }

        Ok(config.normalized())
    }

    /// Save configuration to file
    pub async fn save_config(&self, config: &HarvestConfig) -> Result<()> {
        if let Some(parent) = self.config_path.parent() {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create config directory: {:?}", parent))?;
        }

        let content = serde_json::to_string_pretty(config).context("Failed to serialize configuration")?;
        fs::write(&self.config_path, content)
            .await
            .context("Failed to write configuration file")?;

        info!("✅ Configuration saved to: {:?}", self.config_path);
        Ok(())
    }

    /// Data directory for the file-backed store, honoring the config override
    pub fn resolve_data_dir(config: &HarvestConfig) -> Result<PathBuf> {
        match &config.checkpoint.data_dir {
            Some(dir) => Ok(dir.clone()),
            None => Ok(Self::get_app_data_dir()?.join("store")),
        }
    }
}

/// Default configuration values
pub mod defaults {
    pub const APP_DIR_NAME: &str = "timeline-harvester";
    pub const CONFIG_FILE_NAME: &str = "harvest_config.json";
    pub const ENV_PREFIX: &str = "HARVEST";

    // Timing
    /// Harvest tick period
    pub const TICK_MS: u64 = 600;
    /// Translation overlay poll interval
    pub const TRANSLATION_POLL_MS: u64 = 50;
    /// New-node poll interval while paused
    pub const LOAD_POLL_MS: u64 = 100;
    /// Initial delay on status pages opened by a search run
    pub const SEARCH_RUN_START_DELAY_MS: u64 = 2000;

    // Scrolling
    pub const SCROLL_STEP_PX: u32 = 500;
    pub const MIN_EFFECTIVE_SCROLL_STEP_PX: u32 = 80;
    pub const MAX_SCROLL_STEP_PX: u32 = 6000;

    // Auto-stop / stall detection
    pub const AUTO_STOP_ENABLED: bool = true;
    pub const MAX_NO_NEW_TICKS: u32 = 12;
    pub const END_MARKER_TICKS: u32 = 4;
    pub const PAUSE_MIN_TICKS: u32 = 2;
    pub const TIMELINE_PAUSE_THRESHOLD_MS: u64 = 1100;
    pub const TIMELINE_LOAD_WAIT_MS: u64 = 10_000;

    // Translation deferral
    pub const WAIT_FOR_OVERLAY: bool = false;
    pub const TRANSLATION_WAIT_MS: u64 = 15_000;
    pub const MIN_TRANSLATION_WAIT_MS: u64 = 0;
    pub const MAX_TRANSLATION_WAIT_MS: u64 = 15_000;
    /// Floor of the effective per-post wait window
    pub const MIN_EFFECTIVE_TRANSLATION_WAIT_MS: u64 = 1200;
    pub const MAX_DEFER_ATTEMPTS: u32 = 25;
    pub const DEFER_STALE_FACTOR: u32 = 3;
    /// Rendered deferred posts checked per settle
    pub const MAX_SETTLE_CANDIDATES: usize = 12;

    // Checkpoint
    pub const REMEMBER_IDS: bool = true;
    pub const REMEMBERED_SAVE_DEBOUNCE_MS: u64 = 900;

    // Search run
    pub const SEARCH_RUN_MAX_TARGETS: usize = 20;
    pub const MIN_SEARCH_RUN_MAX_TARGETS: usize = 15;
    pub const MAX_SEARCH_RUN_MAX_TARGETS: usize = 20;
    pub const SEARCH_COLLECT_MAX_TICKS: u32 = 300;
    pub const SEARCH_COLLECT_MAX_NO_PROGRESS_TICKS: u32 = 20;

    // Logging
    pub const LOG_LEVEL: &str = "info";
    pub const LOG_JSON_FORMAT: bool = false;
    pub const LOG_CONSOLE_OUTPUT: bool = true;
    pub const LOG_FILE_OUTPUT: bool = false;
}
