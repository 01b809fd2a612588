use thiserror::Error;

/// Which side initiated a close.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CloseOrigin {
    Local,
    Remote,
}

/// Errors of the connection, handshake and routing layer.
#[derive(Debug, Error)]
pub enum NetError {
    /// A per-call read timeout elapsed. The connection stays open.
    #[error("read timed out")]
    ReadTimeout,
    /// The connection closed; pending reads are cancelled with this.
    #[error("connection closed ({origin:?}): {reason}")]
    ConnectionClosed { reason: String, origin: CloseOrigin },
    /// The peer deviated from the handshake protocol.
    #[error("handshake: {0}")]
    Handshake(String),
    #[error("handshake timed out")]
    HandshakeTimeout,
    /// A signature verified against a different key than expected.
    #[error("peer signed with an unexpected key")]
    KeyMismatch,
    #[error("transport: {0}")]
    Transport(String),
    #[error(transparent)]
    Core(#[from] chum_core::Error),
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
}

impl NetError {
    pub(crate) fn handshake(msg: impl Into<String>) -> Self {
        Self::Handshake(msg.into())
    }

    pub(crate) fn transport(msg: impl std::fmt::Display) -> Self {
        Self::Transport(msg.to_string())
    }
}

pub type Result<T, E = NetError> = std::result::Result<T, E>;
