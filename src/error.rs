use std::{io, sync::Arc};

use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors produced by a [`Connection`](crate::Connection) and its calls.
///
/// Connection-level errors are recorded once and then handed to every pending caller, which is
/// why this type is `Clone`.
#[derive(Debug, Error, Clone)]
pub enum Error {
    #[error("connection io error: {0}")]
    Io(Arc<io::Error>),

    #[error("failed to connect to '{address}': {reason}")]
    Connect { address: String, reason: String },

    #[error("invalid cproto magic '{0:08X}'")]
    InvalidMagic(u32),

    #[error(
        "unsupported cproto version '{version:04X}', this client expects server {} (protocol {min:04X}) or newer",
        crate::protocol::MIN_SERVER_RELEASE
    )]
    IncompatibleVersion { version: u16, min: u16 },

    #[error("invalid seq num: {0}")]
    InvalidSequence(u32),

    #[error("reply frame of {size} bytes exceeds the {max} byte limit")]
    FrameTooLarge { size: u32, max: u32 },

    #[error("unexpected answer: seq {seq}, command {command}")]
    UnexpectedAnswer { seq: u32, command: u16 },

    #[error("deadline exceeded")]
    Timeout,

    #[error("call cancelled")]
    Cancelled,

    #[error("server error {code}: {message}")]
    Server { code: u64, message: String },

    #[error("malformed reply payload: {0}")]
    Decode(String),

    #[error("payload compression failed: {0}")]
    Compression(String),

    #[error("failed to encode frame header: {0}")]
    Codec(String),

    #[error("connection closed")]
    Closed,

    #[error("invalid connection options: {0}")]
    InvalidOptions(String),
}

impl Error {
    /// Returns true when the error only affected a single call and the connection stays usable.
    pub fn is_per_call(&self) -> bool {
        matches!(
            self,
            Error::Timeout
                | Error::Cancelled
                | Error::Server { .. }
                | Error::Decode(_)
                | Error::Compression(_)
        )
    }
}

impl From<io::Error> for Error {
    fn from(value: io::Error) -> Self {
        Error::Io(Arc::new(value))
    }
}

// bincode errors are not `Clone`; only their text is kept.
impl From<bincode::error::EncodeError> for Error {
    fn from(value: bincode::error::EncodeError) -> Self {
        Error::Codec(value.to_string())
    }
}

impl From<bincode::error::DecodeError> for Error {
    fn from(value: bincode::error::DecodeError) -> Self {
        Error::Decode(value.to_string())
    }
}
