//! Site configuration using Figment
//!
//! Configuration is loaded from:
//! 1. a TOML file (base configuration, `config/tomoscan.toml` by default)
//! 2. Environment variables prefixed with `TOMOSCAN_` (nested keys split on `__`)
//!
//! The `[timing]` table carries every settle time and timeout the sequencer
//! uses. Defaults are the named constants in [`timing`].
//!
//! # Example
//! ```no_run
//! use tomoscan::config::TomoScanConfig;
//!
//! let config = TomoScanConfig::load()?;
//! println!("Scan kind: {:?}", config.beamline.scan_kind);
//! # Ok::<(), tomoscan::error::ScanError>(())
//! ```

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{ScanError, ScanResult};

/// Named settle times and timeouts per device class.
pub mod timing {
    use std::time::Duration;

    /// Poll interval for `wait_pv` style read-back waits.
    pub const PV_POLL_INTERVAL: Duration = Duration::from_millis(10);
    /// Poll interval of the completion monitor; bounds abort latency.
    pub const MONITOR_POLL_INTERVAL: Duration = Duration::from_millis(200);
    /// How long a PV may take to connect before it is reported as missing.
    pub const PV_CONNECT_TIMEOUT: Duration = Duration::from_secs(1);
    /// Acknowledgement timeout for every PSO controller command.
    pub const PSO_COMMAND_TIMEOUT: Duration = Duration::from_secs(10);
    /// Time for AcquireBusy to go high after the camera is started.
    pub const CAMERA_START_SETTLE: Duration = Duration::from_millis(500);
    /// Added to the nominal duration of a dark/flat collection.
    pub const STATIC_FRAME_MARGIN: Duration = Duration::from_secs(5);
    /// Added to the nominal duration of a projection collection.
    pub const PROJECTION_MARGIN: Duration = Duration::from_secs(60);
    /// Per-angle wait for a software-triggered frame in a step scan.
    pub const STEP_TRIGGER_TIMEOUT: Duration = Duration::from_secs(60);
    /// Sample translation moves.
    pub const SAMPLE_MOVE_TIMEOUT: Duration = Duration::from_secs(600);
    /// Camera read-back of a new trigger or exposure mode.
    pub const TRIGGER_MODE_TIMEOUT: Duration = Duration::from_secs(10);
    /// File plugin finishing its capture after the camera stops.
    pub const FILE_CAPTURE_TIMEOUT: Duration = Duration::from_secs(30);
    /// Shutter open/close acknowledgement.
    pub const SHUTTER_TIMEOUT: Duration = Duration::from_secs(10);
    /// Added to one exposure while an in-flight stream frame completes.
    pub const STREAM_FRAME_SETTLE: Duration = Duration::from_millis(100);
    /// Added to one exposure while the first re-synchronized frame is taken.
    pub const STREAM_FIRST_FRAME_SETTLE: Duration = Duration::from_millis(400);
    /// Between controller program commands and reading their reply.
    pub const CONTROLLER_REPLY_SETTLE: Duration = Duration::from_millis(100);
    /// Watchdog refresh period.
    pub const WATCHDOG_PERIOD: Duration = Duration::from_secs(3);
    /// Value written to the watchdog PV every period.
    pub const WATCHDOG_VALUE: i64 = 5;
}

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TomoScanConfig {
    /// Application settings
    #[serde(default)]
    pub application: ApplicationConfig,
    /// Beamline description
    #[serde(default)]
    pub beamline: BeamlineConfig,
    /// Settle times and timeouts
    #[serde(default)]
    pub timing: TimingConfig,
}

/// Application-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Application name
    #[serde(default = "default_name")]
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Log output format (pretty, compact, json)
    #[serde(default = "default_log_format")]
    pub log_format: String,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            log_level: default_log_level(),
            log_format: default_log_format(),
        }
    }
}

/// Which acquisition strategy the sequencer runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScanKind {
    /// Continuous rotation, PSO-triggered projections.
    #[default]
    Fly,
    /// Stop-and-shoot with software triggers.
    Step,
    /// Endless rotation with on-the-fly re-synchronization.
    Stream,
}

/// What to do when the target data file already exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OverwritePolicy {
    /// Ask the operator on the terminal.
    #[default]
    Prompt,
    /// Always overwrite.
    Overwrite,
    /// Never overwrite; the scan is refused.
    Refuse,
}

/// Beamline description: PV files, macros and the per-site capability choices.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BeamlineConfig {
    /// PV name files, read in order
    #[serde(default = "default_pv_files")]
    pub pv_files: Vec<PathBuf>,
    /// Macro substitutions, e.g. `P = "2bma:"`
    #[serde(default = "default_macros")]
    pub macros: BTreeMap<String, String>,
    /// Acquisition strategy
    #[serde(default)]
    pub scan_kind: ScanKind,
    /// Overwrite handling
    #[serde(default)]
    pub overwrite_policy: OverwritePolicy,
    /// Camera model reported by the simulated beamline
    #[serde(default = "default_simulated_camera")]
    pub simulated_camera_model: String,
}

impl Default for BeamlineConfig {
    fn default() -> Self {
        Self {
            pv_files: default_pv_files(),
            macros: default_macros(),
            scan_kind: ScanKind::default(),
            overwrite_policy: OverwritePolicy::default(),
            simulated_camera_model: default_simulated_camera(),
        }
    }
}

/// Settle times and timeouts, in milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimingConfig {
    /// `wait_pv` poll interval
    #[serde(default = "default_pv_poll_ms")]
    pub pv_poll_ms: u64,
    /// Completion monitor poll interval
    #[serde(default = "default_monitor_poll_ms")]
    pub monitor_poll_ms: u64,
    /// PV connection timeout
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// PSO command acknowledgement timeout
    #[serde(default = "default_pso_command_timeout_ms")]
    pub pso_command_timeout_ms: u64,
    /// Settle after starting the camera
    #[serde(default = "default_camera_settle_ms")]
    pub camera_settle_ms: u64,
    /// Margin added to dark/flat collection time
    #[serde(default = "default_static_margin_ms")]
    pub static_frame_margin_ms: u64,
    /// Margin added to projection collection time
    #[serde(default = "default_projection_margin_ms")]
    pub projection_margin_ms: u64,
    /// Per-angle software trigger timeout
    #[serde(default = "default_step_trigger_timeout_ms")]
    pub step_trigger_timeout_ms: u64,
    /// Sample translation timeout
    #[serde(default = "default_sample_move_timeout_ms")]
    pub sample_move_timeout_ms: u64,
    /// Trigger mode read-back timeout
    #[serde(default = "default_trigger_mode_timeout_ms")]
    pub trigger_mode_timeout_ms: u64,
    /// File plugin capture completion timeout
    #[serde(default = "default_file_capture_timeout_ms")]
    pub file_capture_timeout_ms: u64,
    /// Shutter acknowledgement timeout
    #[serde(default = "default_shutter_timeout_ms")]
    pub shutter_timeout_ms: u64,
    /// Watchdog refresh period
    #[serde(default = "default_watchdog_period_ms")]
    pub watchdog_period_ms: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            pv_poll_ms: default_pv_poll_ms(),
            monitor_poll_ms: default_monitor_poll_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
            pso_command_timeout_ms: default_pso_command_timeout_ms(),
            camera_settle_ms: default_camera_settle_ms(),
            static_frame_margin_ms: default_static_margin_ms(),
            projection_margin_ms: default_projection_margin_ms(),
            step_trigger_timeout_ms: default_step_trigger_timeout_ms(),
            sample_move_timeout_ms: default_sample_move_timeout_ms(),
            trigger_mode_timeout_ms: default_trigger_mode_timeout_ms(),
            file_capture_timeout_ms: default_file_capture_timeout_ms(),
            shutter_timeout_ms: default_shutter_timeout_ms(),
            watchdog_period_ms: default_watchdog_period_ms(),
        }
    }
}

impl TimingConfig {
    /// `wait_pv` poll interval.
    pub fn pv_poll(&self) -> Duration {
        Duration::from_millis(self.pv_poll_ms)
    }

    /// Completion monitor poll interval.
    pub fn monitor_poll(&self) -> Duration {
        Duration::from_millis(self.monitor_poll_ms)
    }

    /// PV connection timeout.
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// PSO command acknowledgement timeout.
    pub fn pso_command_timeout(&self) -> Duration {
        Duration::from_millis(self.pso_command_timeout_ms)
    }

    /// Settle after starting the camera.
    pub fn camera_settle(&self) -> Duration {
        Duration::from_millis(self.camera_settle_ms)
    }

    /// Margin added to dark/flat collection time.
    pub fn static_frame_margin(&self) -> Duration {
        Duration::from_millis(self.static_frame_margin_ms)
    }

    /// Margin added to projection collection time.
    pub fn projection_margin(&self) -> Duration {
        Duration::from_millis(self.projection_margin_ms)
    }

    /// Per-angle software trigger timeout.
    pub fn step_trigger_timeout(&self) -> Duration {
        Duration::from_millis(self.step_trigger_timeout_ms)
    }

    /// Sample translation timeout.
    pub fn sample_move_timeout(&self) -> Duration {
        Duration::from_millis(self.sample_move_timeout_ms)
    }

    /// Trigger mode read-back timeout.
    pub fn trigger_mode_timeout(&self) -> Duration {
        Duration::from_millis(self.trigger_mode_timeout_ms)
    }

    /// File plugin capture completion timeout.
    pub fn file_capture_timeout(&self) -> Duration {
        Duration::from_millis(self.file_capture_timeout_ms)
    }

    /// Shutter acknowledgement timeout.
    pub fn shutter_timeout(&self) -> Duration {
        Duration::from_millis(self.shutter_timeout_ms)
    }

    /// Watchdog refresh period.
    pub fn watchdog_period(&self) -> Duration {
        Duration::from_millis(self.watchdog_period_ms)
    }
}

// Default value functions
fn default_name() -> String {
    "tomoscan".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

fn default_pv_files() -> Vec<PathBuf> {
    vec![PathBuf::from("config/pvs/tomoscan_pso.pvs")]
}

fn default_macros() -> BTreeMap<String, String> {
    BTreeMap::from([
        ("P".to_string(), "2bma:".to_string()),
        ("R".to_string(), "TomoScan:".to_string()),
    ])
}

fn default_simulated_camera() -> String {
    "Oryx ORX-10G-51S5M".to_string()
}

fn millis(duration: Duration) -> u64 {
    duration.as_millis() as u64
}

fn default_pv_poll_ms() -> u64 {
    millis(timing::PV_POLL_INTERVAL)
}

fn default_monitor_poll_ms() -> u64 {
    millis(timing::MONITOR_POLL_INTERVAL)
}

fn default_connect_timeout_ms() -> u64 {
    millis(timing::PV_CONNECT_TIMEOUT)
}

fn default_pso_command_timeout_ms() -> u64 {
    millis(timing::PSO_COMMAND_TIMEOUT)
}

fn default_camera_settle_ms() -> u64 {
    millis(timing::CAMERA_START_SETTLE)
}

fn default_static_margin_ms() -> u64 {
    millis(timing::STATIC_FRAME_MARGIN)
}

fn default_projection_margin_ms() -> u64 {
    millis(timing::PROJECTION_MARGIN)
}

fn default_step_trigger_timeout_ms() -> u64 {
    millis(timing::STEP_TRIGGER_TIMEOUT)
}

fn default_sample_move_timeout_ms() -> u64 {
    millis(timing::SAMPLE_MOVE_TIMEOUT)
}

fn default_trigger_mode_timeout_ms() -> u64 {
    millis(timing::TRIGGER_MODE_TIMEOUT)
}

fn default_file_capture_timeout_ms() -> u64 {
    millis(timing::FILE_CAPTURE_TIMEOUT)
}

fn default_shutter_timeout_ms() -> u64 {
    millis(timing::SHUTTER_TIMEOUT)
}

fn default_watchdog_period_ms() -> u64 {
    millis(timing::WATCHDOG_PERIOD)
}

impl TomoScanConfig {
    /// Load configuration from `config/tomoscan.toml` and environment variables
    ///
    /// Environment variables override the file with prefix `TOMOSCAN_`.
    /// Example: `TOMOSCAN_APPLICATION__LOG_LEVEL=debug`
    pub fn load() -> ScanResult<Self> {
        Self::load_from("config/tomoscan.toml")
    }

    /// Load configuration from a specific file path
    pub fn load_from<P: AsRef<Path>>(path: P) -> ScanResult<Self> {
        let config = Figment::from(Serialized::defaults(TomoScanConfig::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("TOMOSCAN_").split("__"))
            .extract()?;
        Ok(config)
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> Result<(), String> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.to_lowercase().as_str()) {
            return Err(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            ));
        }

        let valid_formats = ["pretty", "compact", "json"];
        if !valid_formats.contains(&self.application.log_format.to_lowercase().as_str()) {
            return Err(format!(
                "Invalid log_format '{}'. Must be one of: {}",
                self.application.log_format,
                valid_formats.join(", ")
            ));
        }

        if self.beamline.pv_files.is_empty() {
            return Err("At least one PV file must be configured".to_string());
        }

        if self.timing.pv_poll_ms == 0 || self.timing.monitor_poll_ms == 0 {
            return Err("Poll intervals must be greater than zero".to_string());
        }

        Ok(())
    }

    /// Same as [`validate`](Self::validate), as a crate error.
    pub fn validated(self) -> ScanResult<Self> {
        self.validate().map_err(ScanError::Configuration)?;
        Ok(self)
    }
}
