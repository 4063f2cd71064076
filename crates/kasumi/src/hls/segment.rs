use std::time::Duration;

use bytes::Bytes;
use url::Url;

use crate::{
    error::{KasumiError, KasumiResult},
    util::http::HttpClient,
    StreamingSegment,
};

#[derive(Debug, Clone, PartialEq)]
pub struct HlsSegment {
    pub url: Url,
    pub filename: String,
    /// Media sequence number taken from the playlist.
    pub sequence: u64,
    pub duration: f32,
}

impl HlsSegment {
    pub fn new(url: Url, sequence: u64, duration: f32) -> Self {
        // FIXME: filename may be too long
        let filename = url
            .path_segments()
            .and_then(|c| c.last())
            .filter(|r| !r.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| format!("{sequence}.ts"));

        Self {
            url,
            filename,
            sequence,
            duration,
        }
    }

    pub(crate) async fn fetch(&self, client: &HttpClient, timeout: Duration) -> KasumiResult<Bytes> {
        let response = client.get(self.url.clone()).timeout(timeout).send().await?;
        if !response.status().is_success() {
            return Err(KasumiError::HttpError(response.status()));
        }

        Ok(response.bytes().await?)
    }
}

impl StreamingSegment for HlsSegment {
    fn sequence(&self) -> u64 {
        self.sequence
    }

    fn file_name(&self) -> &str {
        &self.filename
    }
}
