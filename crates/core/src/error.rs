pub type Result<T> = eyre::Result<T>;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Every failure a verdict operation can surface to its caller.
#[derive(Debug, thiserror::Error)]
pub enum VerdictError {
    #[error("authentication failed: {0}")]
    Authentication(String),
    #[error("invalid state: {0}")]
    InvalidState(&'static str),
    #[error("connection closed")]
    ConnectionClosed,
    #[error("upload failed: {0}")]
    Upload(#[from] UploadError),
    #[error("no response before the deadline")]
    Timeout,
    #[error("transport: {0}")]
    Transport(#[source] BoxError),
    #[error("failed to decode message: {0}")]
    Decode(#[source] serde_json::Error),
    #[error("failed to encode message: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid SHA256: {0}")]
    InvalidSha256(String),
}

impl VerdictError {
    pub fn transport(e: impl Into<BoxError>) -> Self {
        Self::Transport(e.into())
    }

    /// True for errors caused by the connection going away.
    #[must_use]
    pub const fn is_connection_closed(&self) -> bool {
        matches!(self, Self::ConnectionClosed)
    }
}

/// Failure of the out-of-band upload step.
#[derive(Debug, thiserror::Error)]
pub enum UploadError {
    #[error("server answered {status}: {body}")]
    Status { status: u16, body: String },
    #[error("transport: {0}")]
    Transport(#[source] BoxError),
    #[error("reading upload source: {0}")]
    Io(#[from] std::io::Error),
    #[error("unknown verdict carried no upload url or token")]
    MissingTarget,
}
