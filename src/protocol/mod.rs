//! cproto wire protocol.
//!
//! This module defines the binary request/reply protocol spoken between a client and the database
//! server over a single TCP connection: frame headers, command identifiers, the tagged argument
//! format and the payload compression seam.
//!
//! # Overview
//!
//! Every message on the wire is a *frame*: a fixed 16-byte header followed by `size` bytes of
//! payload. The header carries the sequence number used to correlate a reply with the request that
//! caused it, which is what allows many calls to share one socket.
//!
//! # Binary Format
//!
//! - `magic: u32` identifies the protocol.
//! - `version: u16` holds the protocol version in its low 10 bits, the compression flag in bit 10
//!   and the dedicated-thread hint in bit 11.
//! - `command: u16`, `size: u32`, `seq: u32`.
//! - All integers are little-endian.
//!
//! Request payloads are a chunk of tagged arguments followed by a chunk holding the execution
//! timeout. Reply payloads start with a status code and message, then the returned values.
//!
//! # Key Components
//!
//! - [`FrameHeader`]: the fixed header, encoded with `bincode`.
//! - [`Arg`]: closed set of argument types a request may carry.
//! - [`Reply`]: decoded reply values.
//! - [`Compressor`]: pluggable payload codec used once compression is negotiated.
//!
//! # See Also
//!
//! - [`connection`](crate::connection): multiplexes frames over a socket.
mod args;
mod compression;
mod header;

pub use args::{Arg, Reply, Value, decode_request, encode_reply, encode_request};
pub use compression::Compressor;
pub use header::{FrameHeader, HEADER_LEN};

pub const CPROTO_MAGIC: u32 = 0xEEDD1132;
pub const CPROTO_VERSION: u16 = 0x104;
pub const MIN_COMPAT_VERSION: u16 = 0x101;
pub const MIN_COMPRESSION_VERSION: u16 = 0x103;

pub const VERSION_COMPRESSION_FLAG: u16 = 1 << 10;
pub const DEDICATED_THREAD_FLAG: u16 = 1 << 11;
pub const VERSION_MASK: u16 = 0x3FF;

/// Server release matching [`MIN_COMPAT_VERSION`], used in error messages.
pub const MIN_SERVER_RELEASE: &str = "v1.9.8";

/// Client identity reported during login.
pub const CLIENT_VERSION: &str = concat!("v", env!("CARGO_PKG_VERSION"));

/// Command identifiers understood by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum Command {
    Ping = 0,
    Login = 1,
    OpenDatabase = 2,
    CloseDatabase = 3,
    DropDatabase = 4,
    OpenNamespace = 16,
    CloseNamespace = 17,
    DropNamespace = 18,
    TruncateNamespace = 19,
    RenameNamespace = 20,
    AddIndex = 21,
    EnumNamespaces = 22,
    DropIndex = 24,
    UpdateIndex = 25,
    AddTxItem = 26,
    CommitTx = 27,
    RollbackTx = 28,
    StartTransaction = 29,
    DeleteQueryTx = 30,
    UpdateQueryTx = 31,
    Commit = 32,
    ModifyItem = 33,
    DeleteQuery = 34,
    UpdateQuery = 35,
    Select = 48,
    SelectSql = 49,
    FetchResults = 50,
    CloseResults = 51,
    GetMeta = 64,
    PutMeta = 65,
    EnumMeta = 66,
    SetSchema = 67,
}

impl Command {
    /// Try to convert a raw header value to a command.
    pub fn from_u16(value: u16) -> Option<Self> {
        let cmd = match value {
            0 => Command::Ping,
            1 => Command::Login,
            2 => Command::OpenDatabase,
            3 => Command::CloseDatabase,
            4 => Command::DropDatabase,
            16 => Command::OpenNamespace,
            17 => Command::CloseNamespace,
            18 => Command::DropNamespace,
            19 => Command::TruncateNamespace,
            20 => Command::RenameNamespace,
            21 => Command::AddIndex,
            22 => Command::EnumNamespaces,
            24 => Command::DropIndex,
            25 => Command::UpdateIndex,
            26 => Command::AddTxItem,
            27 => Command::CommitTx,
            28 => Command::RollbackTx,
            29 => Command::StartTransaction,
            30 => Command::DeleteQueryTx,
            31 => Command::UpdateQueryTx,
            32 => Command::Commit,
            33 => Command::ModifyItem,
            34 => Command::DeleteQuery,
            35 => Command::UpdateQuery,
            48 => Command::Select,
            49 => Command::SelectSql,
            50 => Command::FetchResults,
            51 => Command::CloseResults,
            64 => Command::GetMeta,
            65 => Command::PutMeta,
            66 => Command::EnumMeta,
            67 => Command::SetSchema,
            _ => return None,
        };
        Some(cmd)
    }

    pub fn as_u16(self) -> u16 {
        self as u16
    }

    /// Returns true for long-running commands whose late replies hold server-side results that
    /// must be released with a `CloseResults` notice.
    pub fn needs_cancel_notice(self) -> bool {
        matches!(
            self,
            Command::CommitTx
                | Command::ModifyItem
                | Command::DeleteQuery
                | Command::UpdateQuery
                | Command::Select
                | Command::SelectSql
                | Command::FetchResults
        )
    }
}

/// Cancellation check for a raw command id taken off the wire.
pub(crate) fn needs_cancel_notice(command: u16) -> bool {
    Command::from_u16(command).is_some_and(Command::needs_cancel_notice)
}
