use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::error::{Fc2Error, Fc2Result};

/// FC2 sends ids and versions either as strings or numbers.
fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Value::deserialize(deserializer)? {
        Value::String(s) => s,
        Value::Null => String::new(),
        other => other.to_string(),
    })
}

fn lenient_i64<'de, D>(deserializer: D) -> Result<i64, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Value::deserialize(deserializer)? {
        Value::Number(n) => n.as_i64().unwrap_or_default(),
        Value::String(s) => s.trim().parse().unwrap_or_default(),
        Value::Bool(b) => b as i64,
        _ => 0,
    })
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChannelData {
    #[serde(deserialize_with = "string_or_number")]
    pub channelid: String,
    #[serde(default)]
    pub title: String,
    #[serde(default, deserialize_with = "lenient_i64")]
    pub is_publish: i64,
    #[serde(default, deserialize_with = "string_or_number")]
    pub version: String,
    /// Thumbnail url.
    #[serde(default)]
    pub image: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProfileData {
    #[serde(default)]
    pub name: String,
}

#[derive(Deserialize)]
struct MemberApiResponse {
    data: Value,
}

#[derive(Deserialize)]
struct MemberApiData {
    channel_data: ChannelData,
    #[serde(default)]
    profile_data: ProfileData,
}

/// Channel information from `memberApi.php`.
///
/// The untouched response is kept for the info json, with the title unescaped.
#[derive(Debug, Clone)]
pub struct ChannelMeta {
    pub channel_data: ChannelData,
    pub profile_data: ProfileData,
    raw: Value,
}

impl ChannelMeta {
    pub fn from_response(body: &[u8], channel_id: &str) -> Fc2Result<Self> {
        let response: MemberApiResponse = serde_json::from_slice(body)?;
        Self::from_value(response.data, channel_id)
    }

    pub fn from_value(mut raw: Value, channel_id: &str) -> Fc2Result<Self> {
        let data: MemberApiData = serde_json::from_value(raw.clone())
            .map_err(|_| Fc2Error::InvalidChannel(channel_id.to_string()))?;

        let mut channel_data = data.channel_data;
        // FC2 html-encodes the title
        channel_data.title = html_escape::decode_html_entities(&channel_data.title).into_owned();
        if let Some(title) = raw.pointer_mut("/channel_data/title") {
            *title = Value::String(channel_data.title.clone());
        }

        Ok(Self {
            channel_data,
            profile_data: data.profile_data,
            raw,
        })
    }

    pub fn is_online(&self) -> bool {
        self.channel_data.is_publish > 0
    }

    pub fn raw(&self) -> &Value {
        &self.raw
    }
}

/// Response of `getControlServer.php`.
#[derive(Debug, Clone, Deserialize)]
pub struct ControlServer {
    pub url: String,
    pub control_token: String,
}

impl ControlServer {
    pub fn websocket_url(&self) -> String {
        format!("{}?control_token={}", self.url, self.control_token)
    }
}

/// Claims of the JWT handed out as control token.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ControlTokenClaims {
    #[serde(default, deserialize_with = "string_or_number")]
    pub fc2_id: String,
}

impl ControlTokenClaims {
    /// FC2 user id, `None` for anonymous sessions.
    pub fn user_id(&self) -> Option<&str> {
        match self.fc2_id.parse::<i64>() {
            Ok(id) if id > 0 => Some(&self.fc2_id),
            _ => None,
        }
    }
}

/// A frame on the control channel, in both directions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlMessage {
    pub name: String,
    #[serde(default)]
    pub arguments: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
}

impl ControlMessage {
    pub fn request(name: &str, arguments: Value, id: u64) -> Self {
        Self {
            name: name.to_string(),
            arguments,
            id: Some(id),
        }
    }

    pub fn disconnection_code(&self) -> Option<u16> {
        self.arguments
            .get("code")
            .and_then(Value::as_u64)
            .and_then(|c| u16::try_from(c).ok())
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct PlaylistEntry {
    pub url: String,
    pub mode: u32,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

/// Arguments of the `get_hls_information` reply.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct HlsInformation {
    #[serde(default)]
    pub playlists: Vec<PlaylistEntry>,
    #[serde(default)]
    pub playlists_high_latency: Vec<PlaylistEntry>,
    #[serde(default)]
    pub playlists_middle_latency: Vec<PlaylistEntry>,
}

impl HlsInformation {
    /// All playlists regardless of latency group.
    pub fn merged(&self) -> impl Iterator<Item = &PlaylistEntry> {
        self.playlists
            .iter()
            .chain(self.playlists_high_latency.iter())
            .chain(self.playlists_middle_latency.iter())
    }
}
