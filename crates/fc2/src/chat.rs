use std::path::Path;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tokio::{
    fs::File,
    io::{AsyncWrite, AsyncWriteExt, BufWriter},
    sync::broadcast::{self, error::RecvError},
};
use tokio_util::sync::CancellationToken;

use crate::control::ControlEvent;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CommentKind {
    Chat,
    Gift,
    System,
}

/// One entry of the live chat, written as a JSON line.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CommentEvent {
    pub timestamp: DateTime<Utc>,
    pub author: String,
    pub body: String,
    pub kind: CommentKind,
    /// The comment as sent by FC2.
    pub raw: Value,
}

fn number(raw: &Value, key: &str) -> i64 {
    match raw.get(key) {
        Some(Value::Number(n)) => n.as_i64().unwrap_or_default(),
        Some(Value::String(s)) => s.parse().unwrap_or_default(),
        Some(Value::Bool(b)) => *b as i64,
        _ => 0,
    }
}

fn text(raw: &Value, key: &str) -> String {
    raw.get(key)
        .and_then(Value::as_str)
        .map(|s| html_escape::decode_html_entities(s).into_owned())
        .unwrap_or_default()
}

impl CommentEvent {
    pub fn from_raw(raw: Value, received_at: DateTime<Utc>) -> Self {
        let timestamp = match number(&raw, "timestamp") {
            0 => received_at,
            secs => DateTime::from_timestamp(secs, 0).unwrap_or(received_at),
        };
        let author = text(&raw, "user_name");
        let body = text(&raw, "comment");

        let kind = if number(&raw, "tip_amount") > 0 || number(&raw, "gift_id") > 0 {
            CommentKind::Gift
        } else if number(&raw, "system_comment") > 0 || author.is_empty() {
            CommentKind::System
        } else {
            CommentKind::Chat
        };

        Self {
            timestamp,
            author,
            body,
            kind,
            raw,
        }
    }
}

/// Appends comments to a JSON lines file.
///
/// Never fails: problems are logged once and comments keep being consumed, so a broken chat
/// log cannot stall or stop the recording.
pub struct ChatSink {
    writer: Option<Box<dyn AsyncWrite + Send + Unpin>>,
    failed: bool,
    recorded: u64,
}

impl ChatSink {
    pub async fn create(path: &Path) -> Self {
        match File::create(path).await {
            Ok(file) => Self::from_writer(BufWriter::new(file)),
            Err(e) => {
                log::error!("Failed to open chat log {}: {e}", path.display());
                Self {
                    writer: None,
                    failed: true,
                    recorded: 0,
                }
            }
        }
    }

    pub fn from_writer<W>(writer: W) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            writer: Some(Box::new(writer)),
            failed: false,
            recorded: 0,
        }
    }

    /// Number of comments written successfully.
    pub fn recorded(&self) -> u64 {
        self.recorded
    }

    pub async fn record(&mut self, event: &CommentEvent) {
        let Some(writer) = self.writer.as_mut() else {
            return;
        };

        let mut line = match serde_json::to_vec(event) {
            Ok(line) => line,
            Err(e) => {
                log::warn!("Failed to serialize comment: {e}");
                return;
            }
        };
        line.push(b'\n');

        let result = async {
            writer.write_all(&line).await?;
            writer.flush().await
        }
        .await;
        match result {
            Ok(()) => self.recorded += 1,
            Err(e) if !self.failed => {
                self.failed = true;
                log::error!("Failed to write chat: {e}");
            }
            Err(e) => log::debug!("Failed to write chat: {e}"),
        }
    }

    /// Records comments from `events` until the control channel closes or `cancel` fires.
    /// The sink is handed back so that it can follow the next connection.
    pub async fn drain(
        mut self,
        mut events: broadcast::Receiver<ControlEvent>,
        cancel: CancellationToken,
    ) -> Self {
        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => break,
                event = events.recv() => event,
            };
            match event {
                Ok(ControlEvent::Comment(comment)) => self.record(&comment).await,
                Ok(ControlEvent::Closed(_)) | Err(RecvError::Closed) => break,
                Ok(_) => {}
                Err(RecvError::Lagged(n)) => log::warn!("Chat log skipped {n} comments"),
            }
        }
        self
    }

    pub async fn close(mut self) {
        if let Some(writer) = self.writer.as_mut() {
            if let Err(e) = writer.shutdown().await {
                log::warn!("Failed to close chat log: {e}");
            }
        }
        log::debug!("Chat log closed after {} comments", self.recorded);
    }
}
