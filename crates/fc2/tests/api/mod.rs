use std::{sync::Arc, time::Duration};

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use futures_util::{SinkExt, StreamExt};
use kasumi::{HttpClient, KasumiError};
use kasumi_fc2::{
    control::ControlOptions,
    live::{Fc2LiveStream, FC2_LIVE},
    session::AcquisitionState::*,
    Fc2Error, Fc2Platform, Latency, Mode, Quality, Recorder, RecorderConfig, RecordingOutcome,
};
use reqwest::StatusCode;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::Message;
use wiremock::{
    matchers::{body_string_contains, method, path},
    Mock, MockServer, ResponseTemplate,
};

const CHANNEL_ID: &str = "12345678";

fn client() -> HttpClient {
    HttpClient::new(reqwest::Client::builder().http1_only().no_proxy()).unwrap()
}

fn member_api(server: &MockServer, is_publish: u32) -> Value {
    json!({
        "status": 0,
        "data": {
            "channel_data": {
                "channelid": CHANNEL_ID,
                "title": "Morning &amp; coffee",
                "is_publish": is_publish,
                "version": 42,
                "image": format!("{}/thumb/{CHANNEL_ID}.png", server.uri()),
            },
            "profile_data": { "name": "someone" },
        }
    })
}

fn control_token(fc2_id: &str) -> String {
    let payload = URL_SAFE_NO_PAD.encode(json!({ "fc2_id": fc2_id, "channel_id": CHANNEL_ID }).to_string());
    format!("eyJhbGciOiJIUzI1NiJ9.{payload}.c2lnbmF0dXJl")
}

async fn mount_meta(server: &MockServer, is_publish: u32) {
    Mock::given(method("POST"))
        .and(path("/api/memberApi.php"))
        .and(body_string_contains(format!("streamid={CHANNEL_ID}")))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_string(member_api(server, is_publish).to_string())
                .insert_header("content-type", "text/javascript"),
        )
        .mount(server)
        .await;
}

#[tokio::test]
async fn test_meta() -> anyhow::Result<()> {
    let server = MockServer::start().await;
    mount_meta(&server, 1).await;

    let live = Fc2LiveStream::new(client(), CHANNEL_ID).with_base(server.uri());
    let meta = live.meta().await?;

    assert!(meta.is_online());
    assert_eq!(meta.channel_data.channelid, CHANNEL_ID);
    assert_eq!(meta.channel_data.title, "Morning & coffee");
    assert_eq!(meta.channel_data.version, "42");
    assert_eq!(meta.profile_data.name, "someone");
    assert_eq!(meta.raw()["channel_data"]["title"], "Morning & coffee");
    Ok(())
}

#[tokio::test]
async fn test_unknown_channel() -> anyhow::Result<()> {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/memberApi.php"))
        .respond_with(ResponseTemplate::new(200).set_body_string(r#"{"status":0,"data":[]}"#))
        .mount(&server)
        .await;

    let live = Fc2LiveStream::new(client(), CHANNEL_ID).with_base(server.uri());
    assert!(matches!(
        live.meta().await,
        Err(Fc2Error::InvalidChannel(id)) if id == CHANNEL_ID
    ));
    Ok(())
}

#[tokio::test]
async fn test_server_error() -> anyhow::Result<()> {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/memberApi.php"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let live = Fc2LiveStream::new(client(), CHANNEL_ID).with_base(server.uri());
    assert!(matches!(
        live.is_online().await,
        Err(Fc2Error::Kasumi(KasumiError::HttpError(StatusCode::INTERNAL_SERVER_ERROR)))
    ));
    Ok(())
}

#[tokio::test]
async fn test_control_server() -> anyhow::Result<()> {
    let server = MockServer::start().await;
    mount_meta(&server, 1).await;
    Mock::given(method("POST"))
        .and(path("/api/getControlServer.php"))
        .and(body_string_contains(format!("channel_id={CHANNEL_ID}")))
        .and(body_string_contains("orz=secret"))
        .and(body_string_contains("channel_version=42"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "url": "wss://control.example/control",
            "control_token": control_token("98765"),
        })))
        .expect(1)
        .mount(&server)
        .await;

    let client = client();
    client.add_cookies(
        vec!["l_ortkn=secret; Domain=live.fc2.com; Path=/".to_string()],
        FC2_LIVE,
    )?;
    let live = Fc2LiveStream::new(client, CHANNEL_ID).with_base(server.uri());
    let meta = live.meta().await?;
    let (control, claims) = live.control_server(&meta).await?;

    assert_eq!(claims.user_id(), Some("98765"));
    assert_eq!(
        control.websocket_url(),
        format!("wss://control.example/control?control_token={}", control.control_token)
    );
    Ok(())
}

#[tokio::test]
async fn test_anonymous_control_token() -> anyhow::Result<()> {
    let server = MockServer::start().await;
    mount_meta(&server, 1).await;
    Mock::given(method("POST"))
        .and(path("/api/getControlServer.php"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "url": "wss://control.example/control",
            "control_token": control_token("0"),
        })))
        .mount(&server)
        .await;

    let live = Fc2LiveStream::new(client(), CHANNEL_ID).with_base(server.uri());
    let meta = live.meta().await?;
    let (_, claims) = live.control_server(&meta).await?;
    assert_eq!(claims.user_id(), None);
    Ok(())
}

#[tokio::test]
async fn test_offline_channel_has_no_control_server() -> anyhow::Result<()> {
    let server = MockServer::start().await;
    mount_meta(&server, 0).await;
    Mock::given(method("POST"))
        .and(path("/api/getControlServer.php"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let live = Fc2LiveStream::new(client(), CHANNEL_ID).with_base(server.uri());
    let meta = live.meta().await?;
    assert!(!meta.is_online());
    assert!(matches!(
        live.control_server(&meta).await,
        Err(Fc2Error::NotOnline)
    ));
    Ok(())
}

#[tokio::test]
async fn test_thumbnail() -> anyhow::Result<()> {
    let server = MockServer::start().await;
    mount_meta(&server, 1).await;
    Mock::given(method("GET"))
        .and(path(format!("/thumb/{CHANNEL_ID}.png")))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"\x89PNG fake".to_vec()))
        .mount(&server)
        .await;

    let dir = tempfile::tempdir()?;
    let target = dir.path().join("thumb.png");
    let live = Fc2LiveStream::new(client(), CHANNEL_ID).with_base(server.uri());
    let meta = live.meta().await?;
    live.download_thumbnail(&meta, &target).await?;

    assert_eq!(tokio::fs::read(&target).await?, b"\x89PNG fake");
    Ok(())
}

/// Answers `get_hls_information` with `playlist` and everything else with an empty reply.
async fn control_server(playlist: String) -> anyhow::Result<String> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    tokio::spawn(async move {
        let Ok((stream, _)) = listener.accept().await else {
            return;
        };
        let Ok(mut socket) = tokio_tungstenite::accept_async(stream).await else {
            return;
        };
        let _ = socket
            .send(Message::Text(json!({ "name": "connect_complete", "arguments": {} }).to_string()))
            .await;
        while let Some(Ok(message)) = socket.next().await {
            let Message::Text(text) = message else {
                continue;
            };
            let Ok(request) = serde_json::from_str::<Value>(&text) else {
                continue;
            };
            let arguments = if request["name"] == "get_hls_information" {
                json!({ "playlists": [{ "url": playlist, "mode": 52 }] })
            } else {
                json!({})
            };
            let response = json!({ "name": "_response_", "arguments": arguments, "id": request["id"] });
            let _ = socket.send(Message::Text(response.to_string())).await;
        }
    });
    Ok(format!("ws://{addr}/control"))
}

#[tokio::test]
async fn test_records_finished_playlist() -> anyhow::Result<()> {
    let server = MockServer::start().await;
    mount_meta(&server, 1).await;

    let websocket = control_server(format!("{}/hls/52/playlist.m3u8", server.uri())).await?;
    Mock::given(method("POST"))
        .and(path("/api/getControlServer.php"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "url": websocket,
            "control_token": control_token("0"),
        })))
        .mount(&server)
        .await;

    let mut playlist = String::from(
        "#EXTM3U\n#EXT-X-VERSION:3\n#EXT-X-TARGETDURATION:1\n#EXT-X-MEDIA-SEQUENCE:0\n",
    );
    for i in 0..3 {
        playlist.push_str(&format!("#EXTINF:1.0,\nsegment{i}.ts\n"));
        Mock::given(method("GET"))
            .and(path(format!("/hls/52/segment{i}.ts")))
            .respond_with(ResponseTemplate::new(200).set_body_string(format!("<{i}>")))
            .mount(&server)
            .await;
    }
    playlist.push_str("#EXT-X-ENDLIST\n");
    Mock::given(method("GET"))
        .and(path("/hls/52/playlist.m3u8"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_string(playlist)
                .insert_header("content-type", "application/vnd.apple.mpegurl"),
        )
        .mount(&server)
        .await;

    let dir = tempfile::tempdir()?;
    let config = RecorderConfig {
        outtmpl: format!("{}/%(channel_id)s.%(ext)s", dir.path().display()),
        write_chat: true,
        ..Default::default()
    };
    let live = Fc2LiveStream::new(client(), CHANNEL_ID).with_base(server.uri());
    let platform = Fc2Platform::with_live(live, &config).with_control_options(ControlOptions {
        hls_backoff: Duration::from_millis(10),
        ..Default::default()
    });

    let report = tokio::time::timeout(
        Duration::from_secs(30),
        Recorder::new(platform, Arc::new(config)).run(),
    )
    .await?;

    assert_eq!(report.outcome, RecordingOutcome::Stopped);
    assert_eq!(
        report.states,
        vec![Idle, Negotiating, Downloading, Stopping, Stopped]
    );
    assert_eq!(report.mode, Some(Mode::new(Quality::Mbps3, Latency::Mid)));
    assert_eq!(report.segments, 3);

    let output = report.output.expect("output should be planned");
    assert_eq!(tokio::fs::read_to_string(&output.stream).await?, "<0><1><2>");
    Ok(())
}
