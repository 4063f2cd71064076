use thiserror::Error;

#[derive(Error, Debug)]
pub enum KasumiError {
    #[error("HTTP error: {0}")]
    HttpError(reqwest::StatusCode),

    #[error("Manifest fetch error")]
    ManifestFetchError,

    #[error("Invalid m3u8 file: {0}")]
    ManifestParseError(String),

    /// The playlist endpoint refused us, which the platform uses to signal the end of a broadcast.
    #[error("Playlist is gone: {0}")]
    PlaylistGone(reqwest::StatusCode),

    #[error("Download cancelled")]
    Cancelled,

    #[error(transparent)]
    IOError(#[from] std::io::Error),

    #[error(transparent)]
    UrlParseError(#[from] url::ParseError),

    #[error(transparent)]
    RequestError(#[from] reqwest::Error),

    #[error(transparent)]
    MissingExecutable(#[from] which::Error),

    #[error("{program} exited with {status}")]
    ProcessFailed {
        program: String,
        status: std::process::ExitStatus,
    },
}

impl KasumiError {
    /// Whether retrying the same request might succeed.
    ///
    /// Timeouts, connection failures, server errors, `408` and `429` are transient.
    /// Other client errors and local failures are not.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::HttpError(status) => {
                status.is_server_error()
                    || *status == reqwest::StatusCode::REQUEST_TIMEOUT
                    || *status == reqwest::StatusCode::TOO_MANY_REQUESTS
            }
            Self::RequestError(e) => {
                if let Some(status) = e.status() {
                    return status.is_server_error()
                        || status == reqwest::StatusCode::REQUEST_TIMEOUT
                        || status == reqwest::StatusCode::TOO_MANY_REQUESTS;
                }
                e.is_timeout() || e.is_connect() || e.is_request() || e.is_body()
            }
            Self::ManifestFetchError => true,
            Self::IOError(e) => matches!(
                e.kind(),
                std::io::ErrorKind::TimedOut
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::UnexpectedEof
            ),
            _ => false,
        }
    }
}

pub type KasumiResult<T> = Result<T, KasumiError>;
