use std::{path::Path, sync::LazyLock};

use base64::{
    engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig},
    Engine,
};
use kasumi::{HttpClient, KasumiError};
use tokio::io::AsyncWriteExt;

use crate::{
    error::{Fc2Error, Fc2Result},
    model::{ChannelMeta, ControlServer, ControlTokenClaims},
};

pub const FC2_LIVE: &str = "https://live.fc2.com";
const MEMBER_API: &str = "/api/memberApi.php";
const CONTROL_SERVER_API: &str = "/api/getControlServer.php";
const CLIENT_VERSION: &str = "2.1.0\n+[1]";

static JWT_ENGINE: LazyLock<GeneralPurpose> = LazyLock::new(|| {
    GeneralPurpose::new(
        &base64::alphabet::URL_SAFE,
        GeneralPurposeConfig::new()
            .with_decode_padding_mode(DecodePaddingMode::Indifferent)
            .with_decode_allow_trailing_bits(true),
    )
});

/// Reads the claims of a control token without verifying it.
pub fn decode_control_token(token: &str) -> Fc2Result<ControlTokenClaims> {
    let payload = token
        .split('.')
        .nth(1)
        .ok_or_else(|| Fc2Error::InvalidToken("not a JWT".to_string()))?;
    let payload = JWT_ENGINE
        .decode(payload)
        .map_err(|e| Fc2Error::InvalidToken(e.to_string()))?;
    Ok(serde_json::from_slice(&payload)?)
}

/// The HTTP API of one channel.
#[derive(Clone)]
pub struct Fc2LiveStream {
    client: HttpClient,
    channel_id: String,
    base: String,
}

impl Fc2LiveStream {
    pub fn new(client: HttpClient, channel_id: impl Into<String>) -> Self {
        Self {
            client,
            channel_id: channel_id.into(),
            base: FC2_LIVE.to_string(),
        }
    }

    /// Sends API requests to another host.
    pub fn with_base(mut self, base: impl Into<String>) -> Self {
        self.base = base.into().trim_end_matches('/').to_string();
        self
    }

    pub fn channel_id(&self) -> &str {
        &self.channel_id
    }

    pub fn client(&self) -> &HttpClient {
        &self.client
    }

    pub async fn meta(&self) -> Fc2Result<ChannelMeta> {
        let url = format!("{}{MEMBER_API}", self.base);
        log::trace!("get_meta> {url}");
        let response = self
            .client
            .post(url)
            .form(&[
                ("channel", "1"),
                ("profile", "1"),
                ("user", "1"),
                ("streamid", self.channel_id.as_str()),
            ])
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(KasumiError::HttpError(response.status()).into());
        }

        // served as text/javascript
        let body = response.bytes().await?;
        let meta = ChannelMeta::from_response(&body, &self.channel_id)?;
        log::trace!("<get_meta {}", meta.raw());
        Ok(meta)
    }

    pub async fn is_online(&self) -> Fc2Result<bool> {
        Ok(self.meta().await?.is_online())
    }

    /// Asks for a control server. Fails with `NotOnline` when the channel is not broadcasting.
    pub async fn control_server(
        &self,
        meta: &ChannelMeta,
    ) -> Fc2Result<(ControlServer, ControlTokenClaims)> {
        if !meta.is_online() {
            return Err(Fc2Error::NotOnline);
        }

        let orz = self
            .client
            .cookie("l_ortkn", FC2_LIVE)
            .unwrap_or_default();
        let url = format!("{}{CONTROL_SERVER_API}", self.base);
        log::trace!("get_control_server> {url}");
        let response = self
            .client
            .post(url)
            .form(&[
                ("channel_id", self.channel_id.as_str()),
                ("mode", "play"),
                ("orz", orz.as_str()),
                ("channel_version", meta.channel_data.version.as_str()),
                ("client_version", CLIENT_VERSION),
                ("client_type", "pc"),
                ("client_app", "browser_hls"),
                ("ipv6", ""),
            ])
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(KasumiError::HttpError(response.status()).into());
        }

        let body = response.bytes().await?;
        let server: ControlServer = serde_json::from_slice(&body)?;
        let claims = decode_control_token(&server.control_token)?;
        match claims.user_id() {
            Some(id) => log::debug!("Logged in with ID {id}"),
            None => log::debug!("Using anonymous account"),
        }
        Ok((server, claims))
    }

    pub async fn download_thumbnail(&self, meta: &ChannelMeta, path: &Path) -> Fc2Result<()> {
        let url = &meta.channel_data.image;
        if url.is_empty() {
            log::warn!("Channel has no thumbnail");
            return Ok(());
        }

        let mut response = self.client.get(url).send().await?;
        if !response.status().is_success() {
            return Err(KasumiError::HttpError(response.status()).into());
        }
        let mut file = tokio::fs::File::create(path).await?;
        while let Some(chunk) = response.chunk().await? {
            file.write_all(&chunk).await?;
        }
        file.flush().await?;
        Ok(())
    }
}
