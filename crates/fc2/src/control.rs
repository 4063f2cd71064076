use std::{
    collections::HashMap,
    path::PathBuf,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use kasumi::HttpClient;
use parking_lot::Mutex;
use reqwest_websocket::{Message, RequestBuilderExt, WebSocket};
use serde_json::{json, Value};
use tokio::{
    fs::{File, OpenOptions},
    io::{AsyncWriteExt, BufWriter},
    sync::{broadcast, mpsc, oneshot, watch},
    task::JoinHandle,
    time::Instant,
};
use tokio_util::sync::CancellationToken;

use crate::{
    chat::CommentEvent,
    error::{Fc2Error, Fc2Result},
    model::{ControlMessage, HlsInformation},
};

pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Why the control channel stopped. Always the last event a subscriber receives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// Closed locally.
    Requested,
    /// The broadcaster stopped publishing.
    PublishStop,
    PaidProgram,
    LoginRequired,
    MultipleConnections,
    /// `control_disconnection` with any other code.
    Server(u16),
    /// Socket error, unexpected close or missed heartbeat.
    ConnectionLost(String),
}

impl CloseReason {
    pub fn from_code(code: u16) -> Self {
        match code {
            4101 => Self::PaidProgram,
            4507 => Self::LoginRequired,
            4512 => Self::MultipleConnections,
            code => Self::Server(code),
        }
    }

    pub fn to_error(&self) -> Fc2Error {
        match self {
            Self::Requested => Fc2Error::ConnectionLost("closed by client".to_string()),
            Self::PublishStop => Fc2Error::BroadcastEnded,
            Self::PaidProgram => Fc2Error::PaidProgram,
            Self::LoginRequired => Fc2Error::LoginRequired,
            Self::MultipleConnections => Fc2Error::MultipleConnections,
            Self::Server(code) => Fc2Error::ServerDisconnection(*code),
            Self::ConnectionLost(reason) => Fc2Error::ConnectionLost(reason.clone()),
        }
    }
}

#[derive(Debug, Clone)]
pub enum ControlEvent {
    /// `connect_complete`
    Ready,
    /// A non-empty `get_hls_information` reply.
    StreamInfo(HlsInformation),
    Comment(CommentEvent),
    /// Any other named message.
    Control(ControlMessage),
    Closed(CloseReason),
}

#[derive(Debug, Clone)]
pub struct ControlOptions {
    pub heartbeat_interval: Duration,
    /// How long a heartbeat may go without any frame coming back.
    pub heartbeat_timeout: Duration,
    pub hls_timeout: Duration,
    pub hls_tries: u32,
    /// Wait before retry `n` is `hls_backoff * 2^n`.
    pub hls_backoff: Duration,
    /// Writes every frame to this file.
    pub dump: Option<PathBuf>,
    pub event_capacity: usize,
}

impl Default for ControlOptions {
    fn default() -> Self {
        Self {
            heartbeat_interval: HEARTBEAT_INTERVAL,
            heartbeat_timeout: Duration::from_secs(15),
            hls_timeout: Duration::from_secs(5),
            hls_tries: 5,
            hls_backoff: Duration::from_secs(1),
            dump: None,
            event_capacity: 1024,
        }
    }
}

struct PendingReply {
    name: String,
    reply: oneshot::Sender<ControlMessage>,
}

type Pending = Arc<Mutex<HashMap<u64, PendingReply>>>;

/// Client side of the FC2 control websocket.
///
/// A single background task owns the socket: it writes queued requests, sends heartbeats,
/// routes `_response_` frames to their callers and publishes everything else as
/// [`ControlEvent`]s. The channel never reconnects by itself.
pub struct ControlChannel {
    outgoing: mpsc::UnboundedSender<ControlMessage>,
    pending: Pending,
    next_id: Arc<AtomicU64>,
    events: broadcast::Sender<ControlEvent>,
    closed: watch::Receiver<Option<CloseReason>>,
    shutdown: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
    options: ControlOptions,
}

impl ControlChannel {
    pub async fn connect(client: &HttpClient, url: &str, options: ControlOptions) -> Fc2Result<Self> {
        log::debug!("Connecting to control server");
        let response = client.get(url).upgrade().send().await?;
        let websocket = response.into_websocket().await?;
        log::debug!("Control server connected");

        let dump = match &options.dump {
            Some(path) => {
                log::info!("Writing websocket to {}", path.display());
                let file = OpenOptions::new().create(true).append(true).open(path).await?;
                Some(BufWriter::new(file))
            }
            None => None,
        };

        let (outgoing, outgoing_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(options.event_capacity.max(1));
        let (closed_tx, closed) = watch::channel(None);
        let pending: Pending = Default::default();
        let next_id = Arc::new(AtomicU64::new(0));
        let shutdown = CancellationToken::new();

        let connection = Connection {
            outgoing: outgoing_rx,
            pending: pending.clone(),
            next_id: next_id.clone(),
            events: events.clone(),
            closed: closed_tx,
            shutdown: shutdown.clone(),
            dump,
            heartbeat_interval: options.heartbeat_interval,
            heartbeat_timeout: options.heartbeat_timeout,
        };
        let task = tokio::spawn(connection.run(websocket));

        Ok(Self {
            outgoing,
            pending,
            next_id,
            events,
            closed,
            shutdown,
            task: Mutex::new(Some(task)),
            options,
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ControlEvent> {
        self.events.subscribe()
    }

    /// Reason the channel closed, `None` while still connected.
    pub fn close_reason(&self) -> Option<CloseReason> {
        self.closed.borrow().clone()
    }

    fn closed_error(&self) -> Fc2Error {
        match self.close_reason() {
            Some(reason) => reason.to_error(),
            None => Fc2Error::ConnectionLost("control channel closed".to_string()),
        }
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Sends `name` without waiting for a reply.
    pub fn send(&self, name: &str, arguments: Value) -> Fc2Result<u64> {
        let id = self.next_id();
        self.outgoing
            .send(ControlMessage::request(name, arguments, id))
            .map_err(|_| self.closed_error())?;
        Ok(id)
    }

    /// Sends `name` and waits up to `timeout` for its `_response_`. `Ok(None)` on timeout.
    pub async fn call(
        &self,
        name: &str,
        arguments: Value,
        timeout: Duration,
    ) -> Fc2Result<Option<ControlMessage>> {
        let id = self.next_id();
        let (reply, response) = oneshot::channel();
        self.pending.lock().insert(
            id,
            PendingReply {
                name: name.to_string(),
                reply,
            },
        );

        if self
            .outgoing
            .send(ControlMessage::request(name, arguments, id))
            .is_err()
        {
            self.pending.lock().remove(&id);
            return Err(self.closed_error());
        }

        match tokio::time::timeout(timeout, response).await {
            Ok(Ok(message)) => Ok(Some(message)),
            Ok(Err(_)) => Err(self.closed_error()),
            Err(_) => {
                self.pending.lock().remove(&id);
                Ok(None)
            }
        }
    }

    /// Asks for the playlists of the stream.
    ///
    /// Timeouts and replies without `playlists` are retried with exponential backoff.
    pub async fn hls_information(&self) -> Fc2Result<HlsInformation> {
        let mut tries = 0;
        loop {
            let backoff = self.options.hls_backoff * 2u32.pow(tries.min(16));
            tries += 1;

            let reply = self
                .call("get_hls_information", json!({}), self.options.hls_timeout)
                .await?;
            match reply {
                Some(message) if message.arguments.get("playlists").is_some() => {
                    return Ok(serde_json::from_value(message.arguments)?);
                }
                Some(_) => log::warn!(
                    "Received empty playlist, retrying in {} seconds",
                    backoff.as_secs_f32()
                ),
                None => log::warn!(
                    "Timeout reached waiting for HLS information, retrying in {} seconds",
                    backoff.as_secs_f32()
                ),
            }

            if tries >= self.options.hls_tries {
                log::error!("Gave up after {tries} tries");
                return Err(Fc2Error::EmptyPlaylist);
            }
            tokio::time::sleep(backoff).await;
        }
    }

    /// Closes the socket and waits for the background task. Subscribers receive
    /// `Closed(Requested)` unless the channel was already closed.
    pub async fn close(&self) {
        self.shutdown.cancel();
        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                log::error!("Control channel task panicked: {e}");
            }
        }
    }
}

impl Drop for ControlChannel {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

struct Connection {
    outgoing: mpsc::UnboundedReceiver<ControlMessage>,
    pending: Pending,
    next_id: Arc<AtomicU64>,
    events: broadcast::Sender<ControlEvent>,
    closed: watch::Sender<Option<CloseReason>>,
    shutdown: CancellationToken,
    dump: Option<BufWriter<File>>,
    heartbeat_interval: Duration,
    heartbeat_timeout: Duration,
}

async fn deadline(at: Option<Instant>) {
    match at {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

impl Connection {
    async fn run(mut self, mut socket: WebSocket) {
        let reason = self.serve(&mut socket).await;
        match &reason {
            CloseReason::Requested | CloseReason::PublishStop => log::debug!("Control channel closed: {reason:?}"),
            _ => log::warn!("Control channel closed: {reason:?}"),
        }
        if let Err(e) = SinkExt::close(&mut socket).await {
            log::debug!("Failed to close websocket: {e}");
        }
        if let Some(dump) = self.dump.as_mut() {
            if let Err(e) = dump.flush().await {
                log::warn!("Failed to flush websocket dump: {e}");
            }
        }

        // publish the reason before waking up callers waiting for replies
        let _ = self.closed.send(Some(reason.clone()));
        self.outgoing.close();
        self.pending.lock().clear();
        let _ = self.events.send(ControlEvent::Closed(reason));
    }

    async fn serve(&mut self, socket: &mut WebSocket) -> CloseReason {
        let mut heartbeat = tokio::time::interval_at(
            Instant::now() + self.heartbeat_interval,
            self.heartbeat_interval,
        );
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // deadline of the unanswered heartbeat
        let mut awaiting_ack: Option<Instant> = None;

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => return CloseReason::Requested,
                message = self.outgoing.recv() => {
                    let Some(message) = message else {
                        return CloseReason::Requested;
                    };
                    if let Err(e) = self.send(socket, &message).await {
                        return CloseReason::ConnectionLost(e.to_string());
                    }
                }
                _ = heartbeat.tick() => {
                    if awaiting_ack.is_some() {
                        continue;
                    }
                    log::debug!("heartbeat");
                    let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
                    let message = ControlMessage::request("heartbeat", json!({}), id);
                    if let Err(e) = self.send(socket, &message).await {
                        return CloseReason::ConnectionLost(e.to_string());
                    }
                    awaiting_ack = Some(Instant::now() + self.heartbeat_timeout);
                }
                _ = deadline(awaiting_ack) => {
                    return CloseReason::ConnectionLost("heartbeat was not acknowledged".to_string());
                }
                frame = socket.next() => match frame {
                    Some(Ok(Message::Text(text))) => {
                        // any frame proves the connection alive
                        awaiting_ack = None;
                        if let Some(reason) = self.handle(&text).await {
                            return reason;
                        }
                    }
                    Some(Ok(Message::Close { .. })) => {
                        return CloseReason::ConnectionLost("server closed the connection".to_string());
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return CloseReason::ConnectionLost(e.to_string()),
                    None => return CloseReason::ConnectionLost("connection closed".to_string()),
                },
            }
        }
    }

    async fn send(
        &mut self,
        socket: &mut WebSocket,
        message: &ControlMessage,
    ) -> Fc2Result<()> {
        let text = serde_json::to_string(message)?;
        log::trace!("> {text}");
        self.dump_line("> ", &text).await;
        SinkExt::send(socket, Message::Text(text)).await?;
        Ok(())
    }

    async fn dump_line(&mut self, prefix: &str, text: &str) {
        let Some(dump) = self.dump.as_mut() else {
            return;
        };
        let result = async {
            dump.write_all(prefix.as_bytes()).await?;
            dump.write_all(text.as_bytes()).await?;
            dump.write_all(b"\n").await
        }
        .await;
        if let Err(e) = result {
            log::warn!("Failed to write websocket dump, disabling it: {e}");
            self.dump = None;
        }
    }

    async fn handle(&mut self, text: &str) -> Option<CloseReason> {
        self.dump_line("< ", text).await;
        log::trace!("< {}", text.chars().take(100).collect::<String>());

        let message: ControlMessage = match serde_json::from_str(text) {
            Ok(message) => message,
            Err(e) => {
                log::warn!("Ignoring malformed control message: {e}");
                return None;
            }
        };

        match message.name.as_str() {
            "connect_complete" => {
                let _ = self.events.send(ControlEvent::Ready);
            }
            "_response_" => {
                let pending = message.id.and_then(|id| self.pending.lock().remove(&id));
                if let Some(pending) = pending {
                    if pending.name == "get_hls_information" {
                        if let Ok(info) = serde_json::from_value::<HlsInformation>(message.arguments.clone()) {
                            if info.merged().next().is_some() {
                                let _ = self.events.send(ControlEvent::StreamInfo(info));
                            }
                        }
                    }
                    let _ = pending.reply.send(message);
                }
            }
            "control_disconnection" => {
                let code = message.disconnection_code().unwrap_or_default();
                return Some(CloseReason::from_code(code));
            }
            "publish_stop" => return Some(CloseReason::PublishStop),
            "comment" => {
                let comments = message
                    .arguments
                    .get("comments")
                    .and_then(Value::as_array)
                    .cloned()
                    .unwrap_or_default();
                for comment in comments {
                    let event = CommentEvent::from_raw(comment, Utc::now());
                    let _ = self.events.send(ControlEvent::Comment(event));
                }
            }
            _ => {
                log::trace!("Unhandled control message: {}", message.name);
                let _ = self.events.send(ControlEvent::Control(message));
            }
        }
        None
    }
}
