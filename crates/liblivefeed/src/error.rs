use thiserror::Error;

use livefeed_protocol::UserId;

#[derive(Error, Debug)]
pub enum LiveFeedError {
    #[error("invalid user_id: {0}")]
    InvalidUserId(String),

    #[error("user not found: {0}")]
    UserNotFound(UserId),

    #[error("poller registry at capacity ({0} active users)")]
    AtCapacity(usize),

    #[error("malformed record at byte {offset}: expected 4 fields, got {fields}")]
    MalformedRecord { offset: u64, fields: usize },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("upstream returned status {0}")]
    UpstreamStatus(u16),

    #[error("identity store error: {0}")]
    Store(String),

    #[error("encode error: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("client disconnected")]
    Disconnected,
}

impl From<rusqlite::Error> for LiveFeedError {
    fn from(err: rusqlite::Error) -> Self {
        LiveFeedError::Store(err.to_string())
    }
}

impl LiveFeedError {
    /// True for errors caused by the caller's request rather than the service.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            LiveFeedError::InvalidUserId(_) | LiveFeedError::UserNotFound(_)
        )
    }
}
