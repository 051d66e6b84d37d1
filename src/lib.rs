//! Client engine for the cproto binary RPC protocol: one TCP connection carrying many concurrent
//! request/reply exchanges, matched up by sequence number.
pub mod config;
pub mod connection;
pub mod context;
pub mod error;
pub mod protocol;

pub use config::{ConnectOptions, Credentials, ServerStartTime};
pub use connection::Connection;
pub use context::{CallContext, CancelHandle};
pub use error::{Error, Result};
pub use protocol::{Arg, Command, Compressor, Reply, Value};
