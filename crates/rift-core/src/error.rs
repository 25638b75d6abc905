use thiserror::Error;

/// Errors produced by the rift protocol layer.
#[derive(Debug, Error)]
pub enum RiftError {
    #[error("malformed message: {0}")]
    MalformedMessage(String),

    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("proxy name [{0}] is already in use")]
    NameConflict(String),

    #[error("endpoint unavailable: {0}")]
    EndpointUnavailable(String),

    #[error("proxy type [{0}] is not supported")]
    UnsupportedProxyType(String),

    #[error("proxy [{0}] not found")]
    ProxyNotFound(String),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("session expired: {0}")]
    SessionExpired(String),

    #[error("session closed: {0}")]
    SessionClosed(String),

    #[error("proxy [{0}] closed")]
    ProxyClosed(String),

    #[error("stream closed")]
    StreamClosed,

    #[error("hole punch: {0}")]
    HolePunch(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl From<ciborium::de::Error<std::io::Error>> for RiftError {
    fn from(e: ciborium::de::Error<std::io::Error>) -> Self {
        RiftError::MalformedMessage(e.to_string())
    }
}

impl From<ciborium::ser::Error<std::io::Error>> for RiftError {
    fn from(e: ciborium::ser::Error<std::io::Error>) -> Self {
        RiftError::MalformedMessage(e.to_string())
    }
}

impl RiftError {
    /// Map an I/O error from a framed stream, folding EOF into [`RiftError::StreamClosed`].
    pub fn from_stream(e: std::io::Error) -> Self {
        match e.kind() {
            std::io::ErrorKind::UnexpectedEof
            | std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::BrokenPipe => RiftError::StreamClosed,
            _ => RiftError::Io(e),
        }
    }
}

pub type RiftResult<T> = Result<T, RiftError>;
