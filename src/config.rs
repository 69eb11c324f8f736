//! Engine configuration, loaded through Figment.
//!
//! Configuration is loaded from (in order of precedence):
//! 1. Environment variables prefixed with `SHOTENGINE_` (sections separated
//!    by `__`, e.g. `SHOTENGINE_WORKER__RESPONSE_TIMEOUT=5s`)
//! 2. An optional TOML configuration file
//! 3. Built-in defaults
//!
//! All timing values are soft bounds; durations are written in humantime
//! form (`"30s"`, `"2s500ms"`).
//!
//! # Example
//!
//! ```no_run
//! use shot_engine::config::Settings;
//!
//! let settings = Settings::load_from(Some("config/engine.toml".as_ref()))?;
//! println!("barrier deadline: {:?}", settings.pipeline.buffered_deadline);
//! # Ok::<(), shot_engine::error::EngineError>(())
//! ```

use crate::error::AppResult;
use figment::providers::{Env, Format, Serialized, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Top-level engine settings.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Worker communication protocol settings.
    pub worker: WorkerSettings,
    /// Shot pipeline settings.
    pub pipeline: PipelineSettings,
}

/// Settings for the controller/worker communication protocol.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerSettings {
    /// Bounded wait for each worker channel receive. A single retry is made
    /// after the first expiry; the second escalates to a fatal communication
    /// error for that controller.
    #[serde(with = "humantime_serde")]
    pub response_timeout: Duration,

    /// Bounded wait for the timing master's run to finish. Kept separate
    /// from `response_timeout` so a long hardware run is not mistaken for a
    /// hung worker.
    #[serde(with = "humantime_serde")]
    pub run_timeout: Duration,

    /// Grace period for a worker to honor its `shutdown` call before it is
    /// abandoned.
    #[serde(with = "humantime_serde")]
    pub shutdown_grace: Duration,

    /// Capacity of the request and response channels.
    pub channel_capacity: usize,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            response_timeout: Duration::from_secs(30),
            run_timeout: Duration::from_secs(3600),
            shutdown_grace: Duration::from_secs(2),
            channel_capacity: 16,
        }
    }
}

/// Settings for the shot pipeline orchestrator.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineSettings {
    /// Poll interval for the barrier / result channel during fan-in phases.
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,

    /// Wall-clock deadline for the transition-to-buffered barrier to empty.
    #[serde(with = "humantime_serde")]
    pub buffered_deadline: Duration,

    /// Repeat behavior after a shot completes.
    pub repeat_mode: RepeatMode,

    /// Capacity of the shared device event channel.
    pub event_channel_capacity: usize,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(2),
            buffered_deadline: Duration::from_secs(300),
            repeat_mode: RepeatMode::Off,
            event_channel_capacity: 64,
        }
    }
}

/// Whether (and when) a completed shot is re-submitted as a repeat.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RepeatMode {
    /// Never repeat.
    #[default]
    Off,
    /// Repeat every completed shot.
    All,
    /// Repeat only when the pending queue is empty.
    WhenQueueEmpty,
}

impl Settings {
    /// Loads settings from defaults and `SHOTENGINE_` environment overrides.
    pub fn load() -> AppResult<Self> {
        Self::load_from(None)
    }

    /// Loads settings, merging an optional TOML file between defaults and
    /// environment overrides.
    pub fn load_from(path: Option<&Path>) -> AppResult<Self> {
        let mut figment = Figment::from(Serialized::defaults(Settings::default()));
        if let Some(path) = path {
            figment = figment.merge(Toml::file(path));
        }
        figment = figment.merge(Env::prefixed("SHOTENGINE_").split("__"));
        Ok(figment.extract()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_are_sane() {
        let settings = Settings::default();
        assert_eq!(settings.worker.response_timeout, Duration::from_secs(30));
        assert_eq!(settings.worker.run_timeout, Duration::from_secs(3600));
        assert_eq!(settings.pipeline.poll_interval, Duration::from_secs(2));
        assert_eq!(settings.pipeline.buffered_deadline, Duration::from_secs(300));
        assert_eq!(settings.pipeline.repeat_mode, RepeatMode::Off);
    }

    #[test]
    fn load_without_file_matches_defaults() {
        let loaded = Settings::load().unwrap();
        assert_eq!(
            loaded.worker.channel_capacity,
            Settings::default().worker.channel_capacity
        );
    }

    #[test]
    fn toml_file_overrides_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "[pipeline]\npoll_interval = \"250ms\"\nrepeat_mode = \"when_queue_empty\""
        )
        .unwrap();

        let settings = Settings::load_from(Some(file.path())).unwrap();
        assert_eq!(settings.pipeline.poll_interval, Duration::from_millis(250));
        assert_eq!(settings.pipeline.repeat_mode, RepeatMode::WhenQueueEmpty);
        // Untouched sections keep their defaults
        assert_eq!(settings.worker.response_timeout, Duration::from_secs(30));
    }

    #[test]
    #[serial_test::serial]
    fn env_overrides_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[worker]\nresponse_timeout = \"10s\"").unwrap();

        std::env::set_var("SHOTENGINE_WORKER__RESPONSE_TIMEOUT", "5s");
        let settings = Settings::load_from(Some(file.path())).unwrap();
        std::env::remove_var("SHOTENGINE_WORKER__RESPONSE_TIMEOUT");

        assert_eq!(settings.worker.response_timeout, Duration::from_secs(5));
    }
}
