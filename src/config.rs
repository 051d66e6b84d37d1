//! Connection configuration.
use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicI64, Ordering},
    },
    time::Duration,
};

use crate::{
    error::{Error, Result},
    protocol::Compressor,
};

pub const DEFAULT_QUEUE_SIZE: u32 = 512;
/// Largest queue size whose sequence space still fits in a `u32`.
pub const MAX_QUEUE_SIZE: u32 = 4096;
pub const DEFAULT_MAX_FRAME_SIZE: u32 = 256 * 1024 * 1024;

/// Login credentials and target database.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
    /// Database path; a leading `/` is ignored.
    pub database: String,
}

/// Server start timestamp as last reported at login.
///
/// Shared by every connection an owner opens to the same server, so a changed timestamp on a new
/// connection reveals that the server restarted in between.
#[derive(Debug, Default)]
pub struct ServerStartTime {
    stamp: AtomicI64,
    changed: AtomicBool,
}

impl ServerStartTime {
    /// Records a login timestamp, flagging a restart when it differs from a previous one.
    pub fn record(&self, stamp: i64) -> bool {
        let old = self.stamp.swap(stamp, Ordering::SeqCst);
        let restarted = old != 0 && old != stamp;
        if restarted {
            self.changed.store(true, Ordering::SeqCst);
        }
        restarted
    }

    pub fn get(&self) -> i64 {
        self.stamp.load(Ordering::SeqCst)
    }

    pub fn restarted(&self) -> bool {
        self.changed.load(Ordering::SeqCst)
    }

    /// Clears the restart flag once the owner has reacted to it.
    pub fn acknowledge(&self) -> bool {
        self.changed.swap(false, Ordering::SeqCst)
    }
}

/// Everything a [`Connection`](crate::Connection) needs to dial and log in.
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    /// `host:port` of the server.
    pub address: String,
    pub credentials: Credentials,
    pub create_db_if_missing: bool,
    /// Bounds dialing plus the login call. `None` waits forever.
    pub login_timeout: Option<Duration>,
    /// Bounds every call in addition to the caller's own deadline.
    pub request_timeout: Option<Duration>,
    /// Payload codec; compression is offered to the server only when set.
    pub compression: Option<Arc<dyn Compressor>>,
    pub dedicated_threads: bool,
    pub app_name: String,
    /// Number of request slots, i.e. the maximum number of calls in flight.
    pub queue_size: u32,
    /// How often asynchronous deadlines are checked.
    pub deadline_check_period: Duration,
    /// Largest reply payload accepted; a bigger announced size fails the connection.
    pub max_frame_size: u32,
    pub server_start: Arc<ServerStartTime>,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            address: "127.0.0.1:6534".to_string(),
            credentials: Credentials::default(),
            create_db_if_missing: false,
            login_timeout: Some(Duration::from_secs(10)),
            request_timeout: None,
            compression: None,
            dedicated_threads: false,
            app_name: env!("CARGO_PKG_NAME").to_string(),
            queue_size: DEFAULT_QUEUE_SIZE,
            deadline_check_period: Duration::from_secs(1),
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            server_start: Arc::default(),
        }
    }
}

impl ConnectOptions {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.queue_size == 0 || self.queue_size > MAX_QUEUE_SIZE {
            return Err(Error::InvalidOptions(format!(
                "queue size must be within 1..={MAX_QUEUE_SIZE}, got {}",
                self.queue_size
            )));
        }
        if self.deadline_check_period.is_zero() {
            return Err(Error::InvalidOptions(
                "deadline check period must be nonzero".to_string(),
            ));
        }
        if self.max_frame_size == 0 {
            return Err(Error::InvalidOptions(
                "max frame size must be nonzero".to_string(),
            ));
        }
        if self.address.is_empty() {
            return Err(Error::InvalidOptions("empty address".to_string()));
        }
        Ok(())
    }

    /// Database path as sent at login.
    pub(crate) fn login_path(&self) -> &str {
        let db = self.credentials.database.as_str();
        db.strip_prefix('/').unwrap_or(db)
    }
}
