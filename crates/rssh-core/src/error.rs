use thiserror::Error;

/// Errors produced by the rssh protocol layer and the proxy engine.
#[derive(Debug, Error)]
pub enum RsshError {
    #[error("truncated payload: need {needed} bytes at offset {offset}, {remaining} remaining")]
    TruncatedPayload {
        offset: usize,
        needed: usize,
        remaining: usize,
    },

    #[error("malformed terminal mode block: {0}")]
    MalformedModeBlock(String),

    #[error("invalid forward target: {0}")]
    InvalidTarget(String),

    #[error("unsupported channel type: {0}")]
    UnsupportedChannelType(String),

    #[error("unsupported request type: {0}")]
    UnsupportedRequest(String),

    #[error("channel error: {0}")]
    Channel(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("upstream error: {0}")]
    Upstream(String),

    #[error("dial error: {0}")]
    Dial(String),

    #[error("policy denied: {0}")]
    PolicyDenied(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl RsshError {
    /// Whether this error came from decoding a malformed payload.
    pub fn is_malformed_payload(&self) -> bool {
        matches!(
            self,
            RsshError::TruncatedPayload { .. } | RsshError::MalformedModeBlock(_)
        )
    }
}

pub type RsshResult<T> = Result<T, RsshError>;
