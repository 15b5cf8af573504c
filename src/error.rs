//! Error type shared by the cache, upstream and identity layers.

use thiserror::Error;

/// Failures surfaced by backends and codecs. The query and save paths log
/// these instead of propagating them to callers.
#[derive(Debug, Error)]
pub enum Error {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("websocket: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("invalid event: {0}")]
    InvalidEvent(String),
    #[error("identity: {0}")]
    Identity(String),
    #[error("upstream {url}: {reason}")]
    Upstream { url: String, reason: String },
    #[error("timed out after {0:?}")]
    Timeout(std::time::Duration),
    #[error("cache: {0}")]
    Cache(String),
}

impl Error {
    pub(crate) fn upstream(url: &str, reason: impl ToString) -> Self {
        Error::Upstream {
            url: url.to_string(),
            reason: reason.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
