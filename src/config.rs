//! Configuration management for tutor-narrator-rs.
//!
//! Loads config from YAML files in standard locations. Every section falls
//! back to its defaults, so a partial file only overrides what it names.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PacingConfig {
    /// Reading speed used to pace reveals, in characters per millisecond.
    pub reading_rate: f64,
    pub min_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for PacingConfig {
    fn default() -> Self {
        Self {
            reading_rate: 0.05,
            min_delay_ms: 1000,
            max_delay_ms: 2500,
        }
    }
}

/// How agent turns are voiced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NarrationMode {
    /// One clip per message; reveal waits for each clip to finish.
    #[default]
    Single,
    /// One clip for a whole batch; reveal is paced by the timer only.
    Bulk,
}

impl NarrationMode {
    pub fn from_str(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "bulk" | "batch" => Self::Bulk,
            _ => Self::Single,
        }
    }
}

impl std::fmt::Display for NarrationMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Single => write!(f, "single"),
            Self::Bulk => write!(f, "bulk"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct NarrationSettings {
    pub enabled: bool,
    pub mode: NarrationMode,
}

impl Default for NarrationSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            mode: NarrationMode::Single,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PlaybackConfig {
    pub fade_ms: u64,
    /// Gain the fade decays towards before the hard stop.
    pub fade_floor: f32,
    pub fade_step_ms: u64,
    /// Extra wait after the fade window before releasing the clip.
    pub stop_buffer_ms: u64,
    /// How often a playing clip is checked for completion.
    pub poll_ms: u64,
}

impl PlaybackConfig {
    pub fn fade(&self) -> Duration {
        Duration::from_millis(self.fade_ms)
    }

    pub fn fade_step(&self) -> Duration {
        Duration::from_millis(self.fade_step_ms.max(1))
    }

    pub fn stop_buffer(&self) -> Duration {
        Duration::from_millis(self.stop_buffer_ms)
    }

    pub fn poll(&self) -> Duration {
        Duration::from_millis(self.poll_ms.max(1))
    }
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            fade_ms: 800,
            fade_floor: 0.001,
            fade_step_ms: 20,
            stop_buffer_ms: 50,
            poll_ms: 50,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ClassifierConfig {
    /// System-event names that flush pending work like a user turn does.
    pub interrupt_events: Vec<String>,
    /// Text prefix length used when deriving a surrogate message id.
    pub id_prefix_chars: usize,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            interrupt_events: vec!["question_changed".into(), "session_restarted".into()],
            id_prefix_chars: 20,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WatchdogConfig {
    pub interval_ms: u64,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self { interval_ms: 500 }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SynthesisConfig {
    pub host: String,
    pub voice: String,
    pub speed: f32,
    /// 0 disables the client-side timeout.
    pub request_timeout_secs: u64,
}

impl Default for SynthesisConfig {
    fn default() -> Self {
        Self {
            host: "http://localhost:8767".into(),
            voice: "af_heart".into(),
            speed: 1.0,
            request_timeout_secs: 0,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub enabled: bool,
    pub port: u16,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: 8768,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct HistoryConfig {
    pub enabled: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub pacing: PacingConfig,
    pub narration: NarrationSettings,
    pub playback: PlaybackConfig,
    pub classifier: ClassifierConfig,
    pub watchdog: WatchdogConfig,
    pub synthesis: SynthesisConfig,
    pub api: ApiConfig,
    pub history: HistoryConfig,
}

impl Config {
    /// Load configuration from YAML file.
    ///
    /// Searches standard locations if no path is provided:
    /// 1. ./config.yaml
    /// 2. ~/.config/tutor-narrator/config.yaml
    /// 3. /etc/tutor-narrator/config.yaml
    pub fn load(path: Option<&Path>) -> Self {
        let resolved = path.map(PathBuf::from).or_else(|| {
            let candidates = [
                std::env::current_dir().ok().map(|d| d.join("config.yaml")),
                dirs::home_dir().map(|h| h.join(".config/tutor-narrator/config.yaml")),
                Some(PathBuf::from("/etc/tutor-narrator/config.yaml")),
            ];
            candidates.into_iter().flatten().find(|p| p.exists())
        });

        let Some(config_path) = resolved else {
            info!("No config file found, using defaults");
            return Self::default();
        };

        match std::fs::read_to_string(&config_path) {
            Ok(contents) => match Self::from_yaml(&contents) {
                Ok(config) => {
                    info!("Loaded config from {}", config_path.display());
                    config
                }
                Err(e) => {
                    tracing::warn!("Failed to parse {}: {e}, using defaults", config_path.display());
                    Self::default()
                }
            },
            Err(e) => {
                tracing::warn!("Failed to read {}: {e}, using defaults", config_path.display());
                Self::default()
            }
        }
    }

    pub fn from_yaml(contents: &str) -> Result<Self, serde_yml::Error> {
        serde_yml::from_str(contents)
    }
}
