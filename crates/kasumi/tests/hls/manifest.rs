use std::time::Duration;

use kasumi::{hls::load_manifest, HttpClient, KasumiError};
use reqwest::Client;
use url::Url;
use wiremock::MockServer;

use super::{media_playlist, HlsMock};

const TIMEOUT: Duration = Duration::from_secs(5);

fn playlist_url(server: &MockServer, path: &str) -> Url {
    Url::parse(&format!("{}{path}", server.uri())).unwrap()
}

#[tokio::test]
async fn test_load_media_playlist() -> anyhow::Result<()> {
    let server = MockServer::start().await;
    server.mock("/live.m3u8", media_playlist(10..=14, false)).await;

    let client = HttpClient::new(Client::builder())?;
    let manifest = load_manifest(&client, playlist_url(&server, "/live.m3u8"), 3, TIMEOUT).await?;

    assert_eq!(manifest.media_sequence, 10);
    assert_eq!(manifest.segments.len(), 5);
    assert_eq!(manifest.segments[4].sequence, 14);
    assert_eq!(
        manifest.segments[0].url.as_str(),
        format!("{}/seg/10.ts", server.uri())
    );
    assert!(!manifest.ended);
    Ok(())
}

#[tokio::test]
async fn test_master_playlist_selects_highest_bandwidth() -> anyhow::Result<()> {
    let server = MockServer::start().await;
    server
        .mock(
            "/master.m3u8",
            "#EXTM3U
#EXT-X-STREAM-INF:BANDWIDTH=400000
low.m3u8
#EXT-X-STREAM-INF:BANDWIDTH=3000000
high.m3u8
",
        )
        .await
        .mock("/high.m3u8", media_playlist(1..=2, true))
        .await;

    let client = HttpClient::new(Client::builder())?;
    let manifest =
        load_manifest(&client, playlist_url(&server, "/master.m3u8"), 3, TIMEOUT).await?;

    assert_eq!(manifest.url, playlist_url(&server, "/high.m3u8"));
    assert!(manifest.ended);
    Ok(())
}

#[tokio::test]
async fn test_forbidden_playlist_is_gone() -> anyhow::Result<()> {
    let server = MockServer::start().await;
    server.mock_status("/live.m3u8", 403).await;

    let client = HttpClient::new(Client::builder())?;
    let result = load_manifest(&client, playlist_url(&server, "/live.m3u8"), 3, TIMEOUT).await;

    assert!(matches!(result, Err(KasumiError::PlaylistGone(status)) if status == 403));
    Ok(())
}

#[tokio::test]
async fn test_missing_playlist_is_empty() -> anyhow::Result<()> {
    let server = MockServer::start().await;
    server.mock_status("/live.m3u8", 404).await;

    let client = HttpClient::new(Client::builder())?;
    let manifest = load_manifest(&client, playlist_url(&server, "/live.m3u8"), 3, TIMEOUT).await?;

    assert!(manifest.segments.is_empty());
    assert!(!manifest.ended);
    Ok(())
}

#[tokio::test]
async fn test_broken_playlist_exhausts_retries() -> anyhow::Result<()> {
    let server = MockServer::start().await;
    server.mock("/live.m3u8", "this is not a playlist").await;

    let client = HttpClient::new(Client::builder())?;
    let result = load_manifest(&client, playlist_url(&server, "/live.m3u8"), 2, TIMEOUT).await;

    assert!(matches!(result, Err(KasumiError::ManifestFetchError)));
    assert_eq!(server.received_requests().await.unwrap_or_default().len(), 2);
    Ok(())
}
