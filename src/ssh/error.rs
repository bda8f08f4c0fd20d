use thiserror::Error;

#[derive(Error, Debug)]
pub enum SshError {
    #[error("no connection for instance {0}")]
    NotFound(u64),

    #[error("maximum connections reached")]
    MaxConnections,

    #[error("{0}")]
    Validation(String),

    #[error("connect failed: {0}")]
    ConnectionFailed(String),

    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("channel error: {0}")]
    ChannelError(String),

    #[error("rate limited, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("cancelled")]
    Cancelled,

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<russh::Error> for SshError {
    fn from(err: russh::Error) -> Self {
        SshError::Protocol(err.to_string())
    }
}

impl From<russh_keys::Error> for SshError {
    fn from(err: russh_keys::Error) -> Self {
        SshError::AuthenticationFailed(err.to_string())
    }
}
