use serde::{Deserialize, Serialize};

/// Tuning knobs for a single `StreamState` event loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamConfig {
    /// Period of the opportunistic upgrade tick, in milliseconds.
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,
    /// Capacity of the public event channel. Kept small (conceptually
    /// unbuffered) so callers observe back-pressure rather than queuing.
    #[serde(default = "default_event_channel_capacity")]
    pub event_channel_capacity: usize,
    /// Buffer size requested from `PassthroughSource::subscribe`.
    #[serde(default = "default_subscribe_buffer_size")]
    pub subscribe_buffer_size: usize,
    #[serde(default)]
    pub error_throttle: ErrorThrottleConfig,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: default_tick_interval_ms(),
            event_channel_capacity: default_event_channel_capacity(),
            subscribe_buffer_size: default_subscribe_buffer_size(),
            error_throttle: ErrorThrottleConfig::default(),
        }
    }
}

/// Exponential-backoff table for the encoded pipeline's error throttle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorThrottleConfig {
    /// Base delay before the first retry, in milliseconds.
    #[serde(default = "default_throttle_base_ms")]
    pub base_ms: u64,
    /// Delay ceiling, in milliseconds.
    #[serde(default = "default_throttle_max_ms")]
    pub max_ms: u64,
    /// Number of consecutive identical-kind errors tolerated before the
    /// error is surfaced to the pipeline as fatal.
    #[serde(default = "default_throttle_max_attempts")]
    pub max_attempts: u32,
}

impl Default for ErrorThrottleConfig {
    fn default() -> Self {
        Self {
            base_ms: default_throttle_base_ms(),
            max_ms: default_throttle_max_ms(),
            max_attempts: default_throttle_max_attempts(),
        }
    }
}

/// Tuning knobs for the server-scope registry and its camera-removal sweeper.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// Period of the missing-camera sweeper, in milliseconds.
    #[serde(default = "default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,
    /// How often an unchanged "camera unavailable" error is re-warned
    /// rather than silently demoted to debug, in milliseconds.
    #[serde(default = "default_rewarn_interval_ms")]
    pub rewarn_interval_ms: u64,
    #[serde(default)]
    pub stream: StreamConfig,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            sweep_interval_ms: default_sweep_interval_ms(),
            rewarn_interval_ms: default_rewarn_interval_ms(),
            stream: StreamConfig::default(),
        }
    }
}

/// Load registry configuration from a TOML file. Falls back to defaults
/// (with a warning) if the file doesn't exist.
pub fn load_config(path: &std::path::Path) -> anyhow::Result<RegistryConfig> {
    use anyhow::Context;

    if !path.exists() {
        tracing::warn!(
            path = %path.display(),
            "config file not found, using defaults"
        );
        return Ok(RegistryConfig::default());
    }

    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file: {}", path.display()))?;
    let config: RegistryConfig =
        toml::from_str(&contents).with_context(|| "failed to parse config TOML")?;

    tracing::info!(path = %path.display(), "loaded config");
    Ok(config)
}

fn default_tick_interval_ms() -> u64 {
    1_000
}
fn default_event_channel_capacity() -> usize {
    1
}
fn default_subscribe_buffer_size() -> usize {
    32
}
fn default_throttle_base_ms() -> u64 {
    250
}
fn default_throttle_max_ms() -> u64 {
    30_000
}
fn default_throttle_max_attempts() -> u32 {
    8
}
fn default_sweep_interval_ms() -> u64 {
    1_000
}
fn default_rewarn_interval_ms() -> u64 {
    // 10x the default sweep period; see DESIGN.md for the Open Question
    // this resolves.
    10_000
}
