use std::{
    future::Future,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use futures_util::{SinkExt, StreamExt};
use kasumi::HttpClient;
use kasumi_fc2::{
    control::{CloseReason, ControlChannel, ControlEvent, ControlOptions},
    Fc2Error,
};
use serde_json::{json, Value};
use tokio::{net::TcpListener, sync::broadcast};
use tokio_tungstenite::{tungstenite::Message, WebSocketStream};

type ServerSocket = WebSocketStream<tokio::net::TcpStream>;

fn client() -> HttpClient {
    HttpClient::new(reqwest::Client::builder().http1_only()).unwrap()
}

/// Accepts one websocket connection and hands it to `handler`.
async fn serve<F, Fut>(handler: F) -> anyhow::Result<String>
where
    F: FnOnce(ServerSocket) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    tokio::spawn(async move {
        let Ok((stream, _)) = listener.accept().await else {
            return;
        };
        let Ok(socket) = tokio_tungstenite::accept_async(stream).await else {
            return;
        };
        handler(socket).await;
    });
    Ok(format!("ws://{addr}/control?control_token=test"))
}

async fn next_request(socket: &mut ServerSocket) -> Option<Value> {
    while let Some(Ok(message)) = socket.next().await {
        if let Message::Text(text) = message {
            return serde_json::from_str(&text).ok();
        }
    }
    None
}

async fn push(socket: &mut ServerSocket, message: Value) {
    let _ = socket.send(Message::Text(message.to_string())).await;
}

async fn reply(socket: &mut ServerSocket, request: &Value, arguments: Value) {
    push(
        socket,
        json!({ "name": "_response_", "arguments": arguments, "id": request["id"] }),
    )
    .await;
}

async fn drain(socket: &mut ServerSocket) {
    while socket.next().await.is_some() {}
}

async fn next_event(events: &mut broadcast::Receiver<ControlEvent>) -> ControlEvent {
    tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .expect("no control event within 5 seconds")
        .expect("event channel closed")
}

fn playlists(mode: u32) -> Value {
    json!({
        "playlists": [{ "url": format!("https://hls.example/{mode}.m3u8"), "mode": mode }],
        "playlists_high_latency": [],
        "playlists_middle_latency": [],
    })
}

#[tokio::test]
async fn test_replies_and_events() -> anyhow::Result<()> {
    let url = serve(|mut socket| async move {
        let Some(request) = next_request(&mut socket).await else {
            return;
        };
        if request["name"] == "get_hls_information" {
            reply(&mut socket, &request, playlists(52)).await;
        }
        push(
            &mut socket,
            json!({
                "name": "comment",
                "arguments": { "comments": [
                    { "user_name": "a", "comment": "first" },
                    { "user_name": "b", "comment": "second" },
                ]},
            }),
        )
        .await;
        push(&mut socket, json!({ "name": "publish_stop", "arguments": {} })).await;
        drain(&mut socket).await;
    })
    .await?;

    let channel = ControlChannel::connect(&client(), &url, ControlOptions::default()).await?;
    let mut events = channel.subscribe();

    let info = channel.hls_information().await?;
    assert_eq!(info.playlists.len(), 1);
    assert_eq!(info.playlists[0].mode, 52);

    assert!(matches!(next_event(&mut events).await, ControlEvent::StreamInfo(_)));
    match next_event(&mut events).await {
        ControlEvent::Comment(comment) => {
            assert_eq!(comment.author, "a");
            assert_eq!(comment.body, "first");
        }
        event => panic!("unexpected event {event:?}"),
    }
    assert!(matches!(next_event(&mut events).await, ControlEvent::Comment(c) if c.body == "second"));
    assert!(matches!(
        next_event(&mut events).await,
        ControlEvent::Closed(CloseReason::PublishStop)
    ));
    assert_eq!(channel.close_reason(), Some(CloseReason::PublishStop));

    Ok(())
}

#[tokio::test]
async fn test_unknown_messages_are_forwarded() -> anyhow::Result<()> {
    let url = serve(|mut socket| async move {
        push(&mut socket, json!({ "name": "connect_complete", "arguments": {} })).await;
        push(&mut socket, json!({ "name": "user_count", "arguments": { "count": 3 } })).await;
        drain(&mut socket).await;
    })
    .await?;

    let channel = ControlChannel::connect(&client(), &url, ControlOptions::default()).await?;
    let mut events = channel.subscribe();

    // connect_complete may be pushed before the subscription exists
    let event = match next_event(&mut events).await {
        ControlEvent::Ready => next_event(&mut events).await,
        event => event,
    };
    match event {
        ControlEvent::Control(message) => {
            assert_eq!(message.name, "user_count");
            assert_eq!(message.arguments["count"], 3);
        }
        event => panic!("unexpected event {event:?}"),
    }

    channel.close().await;
    assert_eq!(channel.close_reason(), Some(CloseReason::Requested));
    Ok(())
}

#[tokio::test]
async fn test_disconnection_closes_channel() -> anyhow::Result<()> {
    let url = serve(|mut socket| async move {
        if next_request(&mut socket).await.is_some() {
            push(
                &mut socket,
                json!({ "name": "control_disconnection", "arguments": { "code": 4512 } }),
            )
            .await;
        }
        drain(&mut socket).await;
    })
    .await?;

    let channel = ControlChannel::connect(&client(), &url, ControlOptions::default()).await?;
    let mut events = channel.subscribe();
    channel.send("ping", json!({}))?;

    assert!(matches!(
        next_event(&mut events).await,
        ControlEvent::Closed(CloseReason::MultipleConnections)
    ));
    assert!(matches!(
        channel.hls_information().await,
        Err(Fc2Error::MultipleConnections)
    ));
    assert!(channel.send("ping", json!({})).is_err());

    Ok(())
}

#[tokio::test]
async fn test_server_close_is_connection_loss() -> anyhow::Result<()> {
    let url = serve(|mut socket| async move {
        if next_request(&mut socket).await.is_some() {
            let _ = socket.close(None).await;
        }
    })
    .await?;

    let channel = ControlChannel::connect(&client(), &url, ControlOptions::default()).await?;
    let mut events = channel.subscribe();
    channel.send("ping", json!({}))?;

    assert!(matches!(
        next_event(&mut events).await,
        ControlEvent::Closed(CloseReason::ConnectionLost(_))
    ));
    Ok(())
}

#[tokio::test]
async fn test_missed_heartbeat_is_connection_loss() -> anyhow::Result<()> {
    let requests = Arc::new(AtomicUsize::new(0));
    let seen = requests.clone();
    let url = serve(|mut socket| async move {
        while let Some(request) = next_request(&mut socket).await {
            if request["name"] == "heartbeat" {
                seen.fetch_add(1, Ordering::SeqCst);
            }
        }
    })
    .await?;

    let options = ControlOptions {
        heartbeat_interval: Duration::from_millis(100),
        heartbeat_timeout: Duration::from_millis(200),
        ..Default::default()
    };
    let channel = ControlChannel::connect(&client(), &url, options).await?;
    let mut events = channel.subscribe();

    assert!(matches!(
        next_event(&mut events).await,
        ControlEvent::Closed(CloseReason::ConnectionLost(_))
    ));
    assert_eq!(requests.load(Ordering::SeqCst), 1);
    Ok(())
}

#[tokio::test]
async fn test_answered_heartbeats_keep_channel_open() -> anyhow::Result<()> {
    let url = serve(|mut socket| async move {
        while let Some(request) = next_request(&mut socket).await {
            reply(&mut socket, &request, json!({})).await;
        }
    })
    .await?;

    let options = ControlOptions {
        heartbeat_interval: Duration::from_millis(100),
        heartbeat_timeout: Duration::from_millis(200),
        ..Default::default()
    };
    let channel = ControlChannel::connect(&client(), &url, options).await?;
    let mut events = channel.subscribe();

    tokio::time::sleep(Duration::from_millis(700)).await;
    assert_eq!(channel.close_reason(), None);

    channel.close().await;
    assert!(matches!(
        next_event(&mut events).await,
        ControlEvent::Closed(CloseReason::Requested)
    ));
    Ok(())
}

#[tokio::test]
async fn test_empty_hls_information_is_retried() -> anyhow::Result<()> {
    let requests = Arc::new(AtomicUsize::new(0));
    let seen = requests.clone();
    let url = serve(|mut socket| async move {
        while let Some(request) = next_request(&mut socket).await {
            if request["name"] != "get_hls_information" {
                continue;
            }
            let arguments = match seen.fetch_add(1, Ordering::SeqCst) {
                0 => json!({}),
                _ => playlists(42),
            };
            reply(&mut socket, &request, arguments).await;
        }
    })
    .await?;

    let options = ControlOptions {
        hls_backoff: Duration::from_millis(10),
        hls_tries: 3,
        ..Default::default()
    };
    let channel = ControlChannel::connect(&client(), &url, options).await?;

    let info = channel.hls_information().await?;
    assert_eq!(info.playlists[0].mode, 42);
    assert_eq!(requests.load(Ordering::SeqCst), 2);
    Ok(())
}

#[tokio::test]
async fn test_hls_information_gives_up() -> anyhow::Result<()> {
    let requests = Arc::new(AtomicUsize::new(0));
    let seen = requests.clone();
    let url = serve(|mut socket| async move {
        while let Some(request) = next_request(&mut socket).await {
            if request["name"] != "get_hls_information" {
                continue;
            }
            // the second request is left unanswered
            if seen.fetch_add(1, Ordering::SeqCst) != 1 {
                reply(&mut socket, &request, json!({})).await;
            }
        }
    })
    .await?;

    let options = ControlOptions {
        hls_backoff: Duration::from_millis(10),
        hls_timeout: Duration::from_millis(200),
        hls_tries: 3,
        ..Default::default()
    };
    let channel = ControlChannel::connect(&client(), &url, options).await?;

    assert!(matches!(
        channel.hls_information().await,
        Err(Fc2Error::EmptyPlaylist)
    ));
    assert_eq!(requests.load(Ordering::SeqCst), 3);
    Ok(())
}

#[tokio::test]
async fn test_frames_are_dumped() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let dump = dir.path().join("ws.log");
    let url = serve(|mut socket| async move {
        while let Some(request) = next_request(&mut socket).await {
            reply(&mut socket, &request, json!({ "ok": true })).await;
        }
    })
    .await?;

    let options = ControlOptions {
        dump: Some(dump.clone()),
        ..Default::default()
    };
    let channel = ControlChannel::connect(&client(), &url, options).await?;
    let response = channel
        .call("ping", json!({}), Duration::from_secs(5))
        .await?
        .expect("ping was not answered");
    assert_eq!(response.arguments["ok"], true);
    channel.close().await;

    let content = tokio::fs::read_to_string(&dump).await?;
    let lines: Vec<_> = content.lines().collect();
    assert_eq!(lines.len(), 2);
    assert!(lines[0].starts_with("> "));
    assert!(lines[0].contains("\"ping\""));
    assert!(lines[1].starts_with("< "));
    assert!(lines[1].contains("_response_"));
    Ok(())
}
