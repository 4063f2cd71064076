use std::time::Duration;

use m3u8_rs::{MediaPlaylist, Playlist};
use reqwest::StatusCode;
use url::Url;

use crate::{
    error::{KasumiError, KasumiResult},
    hls::{manifest::StreamManifest, segment::HlsSegment},
    util::http::HttpClient,
};

/// Fetches `url` and parses it as a media playlist.
///
/// A master playlist is followed to its best variant. `403` and `410` mean the broadcast is
/// over and surface as [`KasumiError::PlaylistGone`]. `404` is treated as a playlist that has
/// nothing in it yet. Transport and parse errors are retried up to `total_retry` times.
#[async_recursion::async_recursion]
pub async fn load_manifest(
    client: &HttpClient,
    url: Url,
    total_retry: u32,
    timeout: Duration,
) -> KasumiResult<StreamManifest> {
    tracing::debug!("Start fetching M3U8 file.");

    let mut retry = total_retry.max(1);
    let parsed = loop {
        if retry == 0 {
            return Err(KasumiError::ManifestFetchError);
        }

        let response = match client.get(url.clone()).timeout(timeout).send().await {
            Ok(response) => response,
            Err(error) => {
                tracing::warn!("Failed to fetch M3U8 file: {error}");
                retry -= 1;
                continue;
            }
        };

        match response.status() {
            StatusCode::FORBIDDEN | StatusCode::GONE => {
                return Err(KasumiError::PlaylistGone(response.status()));
            }
            StatusCode::NOT_FOUND => {
                tracing::debug!("Playlist is not available yet.");
                return Ok(StreamManifest::empty(url));
            }
            status if !status.is_success() => {
                tracing::warn!("Failed to fetch M3U8 file: HTTP {status}");
                retry -= 1;
                continue;
            }
            _ => {}
        }

        match response.bytes().await {
            Ok(m3u8_bytes) => match m3u8_rs::parse_playlist_res(&m3u8_bytes) {
                Ok(parsed) => break parsed,
                Err(error) => {
                    tracing::warn!("Failed to parse M3U8 file: {error}");
                    retry -= 1;
                }
            },
            Err(error) => {
                tracing::warn!("Failed to fetch M3U8 file: {error}");
                retry -= 1;
            }
        }
    };

    match parsed {
        Playlist::MasterPlaylist(pl) => {
            tracing::info!("Master playlist input detected. Auto selecting best quality streams.");
            let variant = pl
                .variants
                .iter()
                .filter(|v| !v.is_i_frame)
                .max_by_key(|v| v.bandwidth)
                .ok_or_else(|| KasumiError::ManifestParseError("no variant found".to_string()))?;
            let url = url.join(&variant.uri)?;

            tracing::info!(
                "Best stream: {url}; Bandwidth: {bandwidth}",
                bandwidth = variant.bandwidth
            );
            load_manifest(client, url, total_retry, timeout).await
        }
        Playlist::MediaPlaylist(pl) => to_manifest(url, pl),
    }
}

fn to_manifest(url: Url, playlist: MediaPlaylist) -> KasumiResult<StreamManifest> {
    let media_sequence = playlist.media_sequence;
    let segments = playlist
        .segments
        .iter()
        .enumerate()
        .map(|(i, segment)| {
            let segment_url = url.join(&segment.uri)?;
            Ok(HlsSegment::new(
                segment_url,
                media_sequence + i as u64,
                segment.duration,
            ))
        })
        .collect::<KasumiResult<Vec<_>>>()?;

    Ok(StreamManifest {
        url,
        media_sequence,
        target_duration: playlist.target_duration as f32,
        segments,
        ended: playlist.end_list,
    })
}
