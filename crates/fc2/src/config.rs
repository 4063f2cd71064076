use std::{collections::BTreeMap, num::NonZeroU32, path::PathBuf, time::Duration};

use serde::{Deserialize, Deserializer};
use serde_json::Value;

use crate::quality::{Latency, Mode, Quality};

pub const DEFAULT_OUTTMPL: &str = "%(date)s %(title)s (%(channel_name)s).%(ext)s";

/// Durations are written as (fractional) seconds.
///
/// For `#[serde(deserialize_with = "...")]` on `Duration` fields.
pub fn secs<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let secs = f64::deserialize(deserializer)?;
    Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
}

/// Settings of one recording. Shared as an immutable `Arc<RecorderConfig>` snapshot.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RecorderConfig {
    pub quality: Quality,
    pub latency: Latency,
    /// Parallel segment downloads.
    pub threads: NonZeroU32,
    pub outtmpl: String,

    pub write_chat: bool,
    pub write_info_json: bool,
    pub write_thumbnail: bool,
    /// Writes every control channel frame next to the recording.
    pub dump_websocket: bool,

    pub wait_for_live: bool,
    #[serde(deserialize_with = "secs")]
    pub wait_for_quality_timeout: Duration,
    #[serde(deserialize_with = "secs")]
    pub wait_poll_interval: Duration,

    /// Netscape cookies file.
    pub cookies_file: Option<PathBuf>,
    /// Use proxies from the environment.
    pub trust_env_proxy: bool,

    pub remux: bool,
    pub keep_intermediates: bool,
    pub extract_audio: bool,

    /// Consecutive reconnects before giving up.
    pub reconnect_retries: u32,
    #[serde(deserialize_with = "secs")]
    pub reconnect_backoff: Duration,
    #[serde(deserialize_with = "secs")]
    pub reconnect_max_backoff: Duration,
    pub segment_retries: u32,
    #[serde(deserialize_with = "secs")]
    pub segment_timeout: Duration,

    /// `_`-prefixed keys available to the output template.
    #[serde(flatten)]
    pub params: BTreeMap<String, Value>,
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self {
            quality: Quality::Mbps3,
            latency: Latency::Mid,
            threads: NonZeroU32::MIN,
            outtmpl: DEFAULT_OUTTMPL.to_string(),
            write_chat: false,
            write_info_json: false,
            write_thumbnail: false,
            dump_websocket: false,
            wait_for_live: false,
            wait_for_quality_timeout: Duration::from_secs(15),
            wait_poll_interval: Duration::from_secs(5),
            cookies_file: None,
            trust_env_proxy: false,
            remux: true,
            keep_intermediates: false,
            extract_audio: false,
            reconnect_retries: 3,
            reconnect_backoff: Duration::from_secs(2),
            reconnect_max_backoff: Duration::from_secs(60),
            segment_retries: 5,
            segment_timeout: Duration::from_secs(15),
            params: BTreeMap::new(),
        }
    }
}

impl RecorderConfig {
    pub fn mode(&self) -> Mode {
        Mode::new(self.quality, self.latency)
    }

    /// Drops unknown keys. Only `_`-prefixed extra keys are kept as template params.
    pub fn validate(mut self) -> Self {
        self.params.retain(|key, _| {
            let keep = key.starts_with('_');
            if !keep {
                log::warn!("Ignoring unknown option {key}");
            }
            keep
        });
        self
    }

    /// Template params as strings.
    pub fn string_params(&self) -> impl Iterator<Item = (&str, String)> {
        self.params.iter().map(|(key, value)| {
            let value = match value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            (key.as_str(), value)
        })
    }
}
