use std::{collections::BTreeMap, path::Path, time::Duration};

use anyhow::Context;
use kasumi_fc2::RecorderConfig;
use serde::Deserialize;
use serde_json::{Map, Value};

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Minimum time between two recordings of the same channel.
    #[serde(deserialize_with = "kasumi_fc2::config::secs")]
    pub debounce_time: Duration,
    pub log_level: Option<String>,
}

/// ```toml
/// [autofc2]
/// debounce_time = 300
/// log_level = "info"
///
/// [default_params]
/// quality = "3Mbps"
/// outtmpl = "%(channel_name)s %(date)s %(title)s.%(ext)s"
///
/// [channels."12345678"]
/// _en_name = "someone"
/// ```
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct AutoFc2Config {
    pub autofc2: Settings,
    pub default_params: Map<String, Value>,
    pub channels: BTreeMap<String, Map<String, Value>>,
}

impl AutoFc2Config {
    /// Reads a TOML file, or JSON when the file name ends with `.json`.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let is_json = path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
        if is_json {
            Ok(serde_json::from_str(&content)?)
        } else {
            Ok(toml::from_str(&content)?)
        }
    }

    /// `default_params` overridden by the channel's own params.
    pub fn channel_config(&self, channel_id: &str) -> anyhow::Result<RecorderConfig> {
        let mut params = self.default_params.clone();
        if let Some(overrides) = self.channels.get(channel_id) {
            params.extend(overrides.clone());
        }
        let mut config: RecorderConfig = serde_json::from_value(Value::Object(params))
            .with_context(|| format!("invalid params for channel {channel_id}"))?;
        // offline channels are polled by the recorder, not restarted every tick
        config.wait_for_live = true;
        Ok(config.validate())
    }
}
