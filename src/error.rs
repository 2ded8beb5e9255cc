use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the peer endpoint and its transports.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    #[error("failed to initialize {subsystem}")]
    InitFailed { subsystem: &'static str },

    #[error("invalid sdp")]
    InvalidSdp,

    #[error("invalid ice candidate")]
    InvalidCandidate,

    #[error("unknown data channel")]
    UnknownChannel,

    #[error("sctp send failed")]
    SendFailed,

    #[error("sctp send cancelled")]
    SendCancelled,

    #[error("endpoint stopped")]
    Stopped,

    #[error("dtls handshake failed")]
    HandshakeFailed,

    /// `sctp::endpoint::ConnectError` is its own `thiserror` type, separate
    /// from the `shared::error::Error` umbrella the other collaborator
    /// crates share, so it gets a dedicated variant rather than `Transport`.
    #[error("sctp connect failed: {0}")]
    SctpConnectFailed(String),

    #[error("stream reset denied")]
    StreamResetDenied,

    #[error("unknown message type {0}")]
    InvalidMessageType(u8),

    #[error("unknown payload protocol identifier {0}")]
    InvalidPayloadProtocolIdentifier(u8),

    #[error("buffer too short")]
    BufferTooShort,

    /// Wraps an error surfaced by the ice/dtls/sctp/sdp collaborator crates,
    /// which all share `rtc-shared`'s error type.
    #[error(transparent)]
    Transport(#[from] shared::error::Error),

    #[error(transparent)]
    Utf8(#[from] std::string::FromUtf8Error),
}
