use std::fmt;

use kasumi::KasumiError;
use thiserror::Error;

use crate::quality::Mode;

#[derive(Error, Debug)]
pub enum Fc2Error {
    #[error("Channel {0} does not exist")]
    InvalidChannel(String),

    #[error("Live stream is currently not online")]
    NotOnline,

    #[error("Server disconnected: 4507 (Login required)")]
    LoginRequired,

    #[error("Server disconnected: 4101 (Paid program)")]
    PaidProgram,

    #[error("Server disconnected: 4512 (Multiple connections)")]
    MultipleConnections,

    #[error("Server disconnected: {0}")]
    ServerDisconnection(u16),

    #[error("Control channel connection lost: {0}")]
    ConnectionLost(String),

    #[error("Invalid control token: {0}")]
    InvalidToken(String),

    #[error("Requested quality {requested} is not available (available: {})", format_modes(.available))]
    QualityUnavailable {
        requested: Mode,
        available: Vec<Mode>,
    },

    #[error("Server did not return a valid playlist")]
    EmptyPlaylist,

    #[error("Stream has ended")]
    BroadcastEnded,

    #[error("Invalid output template: {0}")]
    Template(String),

    #[error(transparent)]
    Kasumi(#[from] KasumiError),

    #[error(transparent)]
    RequestError(#[from] reqwest::Error),

    #[error(transparent)]
    WebSocketError(#[from] reqwest_websocket::Error),

    #[error(transparent)]
    JsonError(#[from] serde_json::Error),

    #[error(transparent)]
    IOError(#[from] std::io::Error),

    #[error(transparent)]
    UrlParseError(#[from] url::ParseError),
}

fn format_modes(modes: &[Mode]) -> String {
    if modes.is_empty() {
        return "none".to_string();
    }
    modes
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Coarse error taxonomy used to decide between retrying and giving up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Credentials or account state. Never retried.
    Auth,
    /// The channel does not exist or is not broadcasting.
    Channel,
    /// Transport problems and lost connections. Retried with backoff.
    Network,
    /// Handled by the quality fallback policy.
    QualityUnavailable,
    /// Malformed or unreachable playlist. Retried like `Network`.
    Manifest,
    /// A single segment. Retried, then skipped.
    Segment,
    /// Local output could not be written.
    Output,
}

impl ErrorClass {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Network | Self::Manifest | Self::Segment)
    }
}

impl Fc2Error {
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::LoginRequired | Self::PaidProgram | Self::MultipleConnections => ErrorClass::Auth,
            Self::InvalidToken(_) => ErrorClass::Auth,
            Self::InvalidChannel(_) | Self::NotOnline => ErrorClass::Channel,
            Self::ServerDisconnection(_)
            | Self::ConnectionLost(_)
            | Self::RequestError(_)
            | Self::WebSocketError(_) => ErrorClass::Network,
            Self::QualityUnavailable { .. } => ErrorClass::QualityUnavailable,
            Self::EmptyPlaylist | Self::BroadcastEnded | Self::JsonError(_) | Self::UrlParseError(_) => {
                ErrorClass::Manifest
            }
            Self::Kasumi(KasumiError::IOError(_)) | Self::IOError(_) | Self::Template(_) => {
                ErrorClass::Output
            }
            Self::Kasumi(e) if e.is_transient() => ErrorClass::Network,
            Self::Kasumi(_) => ErrorClass::Manifest,
        }
    }
}

pub type Fc2Result<T> = Result<T, Fc2Error>;

/// Why a recording ended in `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureReason {
    NotOnline,
    InvalidChannel,
    LoginRequired,
    PaidProgram,
    MultipleConnections,
    /// Neither the requested quality nor any fallback was offered.
    NoQualityAvailable,
    /// Reconnect attempts were exhausted.
    ConnectionLost,
    /// The channel status could not be fetched.
    Network,
    Output,
}

impl FailureReason {
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::NotOnline | Self::InvalidChannel => ErrorClass::Channel,
            Self::LoginRequired | Self::PaidProgram | Self::MultipleConnections => ErrorClass::Auth,
            Self::NoQualityAvailable => ErrorClass::QualityUnavailable,
            Self::ConnectionLost | Self::Network => ErrorClass::Network,
            Self::Output => ErrorClass::Output,
        }
    }
}

impl From<&Fc2Error> for FailureReason {
    fn from(error: &Fc2Error) -> Self {
        match error {
            Fc2Error::NotOnline => Self::NotOnline,
            Fc2Error::InvalidChannel(_) => Self::InvalidChannel,
            Fc2Error::LoginRequired | Fc2Error::InvalidToken(_) => Self::LoginRequired,
            Fc2Error::PaidProgram => Self::PaidProgram,
            Fc2Error::MultipleConnections => Self::MultipleConnections,
            Fc2Error::QualityUnavailable { .. } => Self::NoQualityAvailable,
            e => match e.class() {
                ErrorClass::Output => Self::Output,
                ErrorClass::Network => Self::ConnectionLost,
                _ => Self::Network,
            },
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let message = match self {
            Self::NotOnline => "channel is not online",
            Self::InvalidChannel => "channel does not exist",
            Self::LoginRequired => "login required",
            Self::PaidProgram => "broadcast is a paid program",
            Self::MultipleConnections => "multiple connections to the same stream",
            Self::NoQualityAvailable => "no quality available",
            Self::ConnectionLost => "connection lost",
            Self::Network => "network error",
            Self::Output => "output could not be written",
        };
        write!(f, "{message} ({:?})", self.class())
    }
}
