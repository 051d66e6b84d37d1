//! Multiplexed client connection.
//!
//! A [`Connection`] owns one TCP socket shared by any number of concurrent callers. Each call is
//! admitted by taking a sequence number from a bounded pool, which also picks the request slot
//! that will receive its reply. Three background threads serve the socket:
//!
//! - the writer flushes coalesced request frames,
//! - the reader parses reply frames and routes them to their slot,
//! - the sweeper expires asynchronous calls whose deadline passed.
//!
//! The first fatal error (I/O failure, protocol violation, or [`Connection::close`]) is recorded
//! once, tears the socket down and fails every outstanding call with that same error. A failed
//! connection is never reused.
mod reader;
mod seq;
mod signal;
mod slots;
mod sweeper;
mod writer;

#[cfg(test)]
mod tests;

use std::{
    net::{Shutdown, TcpStream, ToSocketAddrs},
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    thread,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use crossbeam_channel::select;
use log::{debug, error, info, trace, warn};
use parking_lot::RwLock;

use crate::{
    config::ConnectOptions,
    context::CallContext,
    error::{Error, Result},
    protocol::{self, Arg, CLIENT_VERSION, Command, Reply, Value, encode_request},
};

use seq::SequencePool;
use signal::Signal;
use slots::{Answer, RequestSlot, SlotTable};
use writer::WritePipeline;

#[derive(Debug, Default)]
struct State {
    err: Option<Error>,
    stream: Option<TcpStream>,
}

/// State shared between callers and the background threads.
pub(crate) struct Shared {
    options: ConnectOptions,
    pool: SequencePool,
    slots: SlotTable,
    pipeline: WritePipeline,
    state: RwLock<State>,
    /// Fired on the first fatal error; wakes blocked synchronous callers and the writer.
    errored: Signal,
    /// Fired on the first fatal error; stops the sweeper.
    terminating: Signal,
    /// Virtual clock in milliseconds, advanced only by the sweeper.
    now: AtomicU64,
    compression: AtomicBool,
    last_read_ms: AtomicU64,
}

impl Shared {
    fn new(options: ConnectOptions) -> Self {
        let pool = SequencePool::new(options.queue_size);
        let slots = SlotTable::new(pool.queue_size(), pool.max_seq());
        Self {
            options,
            pool,
            slots,
            pipeline: WritePipeline::new(),
            state: RwLock::new(State::default()),
            errored: Signal::new(),
            terminating: Signal::new(),
            now: AtomicU64::new(1),
            compression: AtomicBool::new(false),
            last_read_ms: AtomicU64::new(0),
        }
    }

    fn slot(&self, seq: u32) -> &RequestSlot {
        self.slots.get(self.pool.slot_index(seq))
    }

    fn current_error(&self) -> Option<Error> {
        self.state.read().err.clone()
    }

    fn sticky_error(&self) -> Error {
        self.current_error().unwrap_or(Error::Closed)
    }

    /// Records the first fatal error and fails everything outstanding. Later calls are no-ops.
    fn report_error(&self, err: Error) {
        let pending = {
            let mut state = self.state.write();
            if state.err.is_some() {
                return;
            }
            if matches!(err, Error::Closed) {
                debug!("closing connection to {}", self.options.address);
            } else {
                error!("connection to {} failed: {err}", self.options.address);
            }
            state.err = Some(err.clone());
            if let Some(stream) = state.stream.take() {
                let _ = stream.shutdown(Shutdown::Both);
            }
            self.errored.fire();
            self.terminating.fire();
            self.slots.take_all_pending()
        };

        for (seq, completion) in pending {
            self.pool.release(seq);
            completion(Err(err.clone()));
        }
    }

    fn dial(&self, ctx: &CallContext) -> Result<TcpStream> {
        let address = &self.options.address;
        let connect_err = |reason: String| Error::Connect {
            address: address.clone(),
            reason,
        };

        let addrs = address
            .to_socket_addrs()
            .map_err(|e| connect_err(e.to_string()))?;
        let mut last = None;
        for addr in addrs {
            let attempt = match ctx.remaining() {
                Some(left) if left.is_zero() => return Err(Error::Timeout),
                Some(left) => TcpStream::connect_timeout(&addr, left),
                None => TcpStream::connect(addr),
            };
            match attempt {
                Ok(stream) => return Ok(stream),
                Err(e) => {
                    debug!("dial {addr} failed: {e}");
                    last = Some(e);
                }
            }
        }
        Err(connect_err(
            last.map_or_else(|| "no address resolved".to_string(), |e| e.to_string()),
        ))
    }

    /// Dials the server and starts the reader and writer threads.
    fn connect(self: &Arc<Self>, ctx: &CallContext) -> Result<()> {
        let stream = self.dial(ctx)?;
        stream.set_nodelay(true)?;
        let read_half = stream.try_clone()?;
        let write_half = stream.try_clone()?;
        {
            let mut state = self.state.write();
            if let Some(err) = &state.err {
                return Err(err.clone());
            }
            state.stream = Some(stream);
        }

        let shared = Arc::clone(self);
        thread::Builder::new()
            .name("cproto-writer".to_string())
            .spawn(move || {
                if let Err(e) = shared.pipeline.run(write_half, &shared.errored) {
                    shared.report_error(e.into());
                }
            })?;

        let shared = Arc::clone(self);
        thread::Builder::new()
            .name("cproto-reader".to_string())
            .spawn(move || reader::run(shared, read_half))?;

        info!("connected to {}", self.options.address);
        Ok(())
    }

    /// Bounds `ctx` by the configured per-call timeout.
    fn bounded(&self, ctx: &CallContext) -> CallContext {
        match self.options.request_timeout {
            Some(timeout) => ctx.clone().timeout(timeout),
            None => ctx.clone(),
        }
    }

    /// Encodes a request and queues it for the writer.
    fn send(&self, command: u16, seq: u32, timeout: Option<Duration>, args: &[Arg<'_>]) -> Result<()> {
        let exec_timeout =
            timeout.map_or(0, |t| i64::try_from(t.as_millis()).unwrap_or(i64::MAX));
        let compressor = if self.compression.load(Ordering::SeqCst) {
            self.options.compression.as_deref()
        } else {
            None
        };
        let frame = encode_request(
            command,
            seq,
            args,
            exec_timeout,
            compressor,
            self.options.dedicated_threads,
        )?;

        trace!("send cmd {command} seq {seq}, {} bytes", frame.len());
        self.pipeline.submit(&frame);
        Ok(())
    }

    fn parse(&self, answer: &Answer) -> Result<Reply> {
        if !answer.compressed {
            return Reply::parse(&answer.payload);
        }
        let compressor = self.options.compression.as_deref().ok_or_else(|| {
            Error::Compression("compressed reply without a configured compressor".to_string())
        })?;
        let raw = compressor
            .decompress(&answer.payload)
            .map_err(|e| Error::Compression(e.to_string()))?;
        Reply::parse(&raw)
    }

    /// Drops a reply nobody waits for, releasing its server-side results when the command holds
    /// any.
    fn discard_stale(&self, answer: Answer) {
        debug!("dropping stale reply seq {} cmd {}", answer.seq, answer.command);
        if !protocol::needs_cancel_notice(answer.command) {
            return;
        }
        let Ok(reply) = self.parse(&answer) else {
            return;
        };
        if let Some((req_id, uid)) = reply.result_ids() {
            self.send_cancel_notice(answer.seq, req_id, uid);
        }
    }

    fn send_cancel_notice(&self, seq: u32, req_id: i32, uid: Option<i64>) {
        debug!("closing results {req_id} of stale seq {seq}");
        let args = [
            Arg::Int(req_id),
            Arg::Int64(uid.unwrap_or(-1)),
            Arg::Bool(true),
        ];
        let timeout = self.options.request_timeout;
        if let Err(e) = self.send(Command::CloseResults.as_u16(), seq, timeout, &args) {
            warn!("failed to send close results for seq {seq}: {e}");
        }
    }

    fn wait_reply(&self, ctx: &CallContext, slot: &RequestSlot, seq: u32) -> Result<Answer> {
        let expired = ctx.expired();
        loop {
            select! {
                recv(slot.replies()) -> answer => match answer {
                    Ok(answer) if answer.seq == seq => return Ok(answer),
                    Ok(stale) => self.discard_stale(stale),
                    Err(_) => return Err(Error::Closed),
                },
                // A reply that arrived before the failure still wins.
                recv(self.errored.receiver()) -> _ => match slot.replies().try_recv() {
                    Ok(answer) if answer.seq == seq => return Ok(answer),
                    _ => return Err(self.sticky_error()),
                },
                recv(ctx.cancelled()) -> _ => return Err(Error::Cancelled),
                recv(expired) -> _ => return Err(Error::Timeout),
            }
        }
    }

    fn now(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }

    fn advance_clock(&self, step: u64) -> u64 {
        self.now.fetch_add(step, Ordering::SeqCst) + step
    }

    fn touch_read(&self) {
        let stamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| d.as_millis() as u64);
        self.last_read_ms.store(stamp, Ordering::SeqCst);
    }
}

/// A logged-in cproto session over a single TCP connection.
///
/// All methods take `&self`; share the connection between threads with an `Arc`. Dropping the
/// connection closes it.
pub struct Connection {
    shared: Arc<Shared>,
}

impl Connection {
    /// Dials `options.address`, starts the I/O threads and logs in.
    pub fn open(options: ConnectOptions) -> Result<Self> {
        options.validate()?;
        let login_ctx = match options.login_timeout {
            Some(timeout) => CallContext::with_timeout(timeout),
            None => CallContext::background(),
        };

        let shared = Arc::new(Shared::new(options));
        {
            let shared = Arc::clone(&shared);
            thread::Builder::new()
                .name("cproto-sweeper".to_string())
                .spawn(move || sweeper::run(shared))?;
        }

        let conn = Self { shared };
        if let Err(err) = conn
            .shared
            .connect(&login_ctx)
            .and_then(|_| conn.login(&login_ctx))
        {
            conn.shared.report_error(err.clone());
            return Err(err);
        }
        Ok(conn)
    }

    fn login(&self, ctx: &CallContext) -> Result<()> {
        let opts = &self.shared.options;
        let args = [
            Arg::from(&opts.credentials.username),
            Arg::from(&opts.credentials.password),
            Arg::from(opts.login_path()),
            Arg::from(opts.create_db_if_missing),
            Arg::from(false),
            Arg::from(-1i32),
            Arg::from(CLIENT_VERSION),
            Arg::from(&opts.app_name),
        ];
        let reply = self.call(ctx, Command::Login, &args)?;

        if let Some(stamp) = reply.get(1).and_then(Value::as_i64) {
            if opts.server_start.record(stamp) {
                warn!("server at {} restarted (start time {stamp})", opts.address);
            }
        }
        info!(
            "logged in to {} as '{}'",
            opts.address, opts.credentials.username
        );
        Ok(())
    }

    /// Issues a call and blocks until its reply arrives, the context ends or the connection fails.
    pub fn call(&self, ctx: &CallContext, command: Command, args: &[Arg<'_>]) -> Result<Reply> {
        let shared = &self.shared;
        if let Some(err) = shared.current_error() {
            return Err(err);
        }

        let ctx = shared.bounded(ctx);
        let (seq, remaining) = shared.pool.acquire(&ctx)?;
        let slot = shared.slot(seq);

        slot.arm_sync(seq);
        let result = shared
            .send(command.as_u16(), seq, remaining, args)
            .and_then(|_| shared.wait_reply(&ctx, slot, seq));
        slot.retire_sync();
        shared.pool.release(seq);

        shared.parse(&result?)
    }

    /// Like [`call`](Self::call), discarding the reply values.
    pub fn call_no_results(
        &self,
        ctx: &CallContext,
        command: Command,
        args: &[Arg<'_>],
    ) -> Result<()> {
        self.call(ctx, command, args).map(|_| ())
    }

    /// Issues a call without blocking for the reply.
    ///
    /// `completion` runs exactly once: on the reader thread with the reply, on the sweeper thread
    /// once the deadline passes, or with the connection error when the connection fails. It runs
    /// on the calling thread when the call cannot be admitted.
    pub fn call_async<F>(&self, ctx: &CallContext, command: Command, args: &[Arg<'_>], completion: F)
    where
        F: FnOnce(Result<Reply>) + Send + 'static,
    {
        let shared = &self.shared;
        if let Some(err) = shared.current_error() {
            return completion(Err(err));
        }

        let ctx = shared.bounded(ctx);
        let (seq, remaining) = match shared.pool.acquire(&ctx) {
            Ok(admitted) => admitted,
            Err(err) => return completion(Err(err)),
        };
        let deadline = remaining.map_or(0, |left| {
            let left = u64::try_from(left.as_millis()).unwrap_or(u64::MAX);
            shared.now().saturating_add(left)
        });

        let slot = shared.slot(seq);
        slot.arm_async(seq, deadline, Box::new(completion));

        // The teardown scan may have run before the slot was armed.
        if shared.errored.is_fired() {
            if let Some((seq, completion)) = slot.take_pending() {
                shared.pool.release(seq);
                completion(Err(shared.sticky_error()));
            }
            return;
        }

        if let Err(err) = shared.send(command.as_u16(), seq, remaining, args) {
            if let Some(completion) = slot.take_for_reply(seq) {
                shared.pool.release(seq);
                completion(Err(err));
            }
        }
    }

    /// Sends a frame under an explicit sequence number without registering for a reply.
    pub fn call_no_reply(
        &self,
        command: Command,
        seq: u32,
        timeout: Duration,
        args: &[Arg<'_>],
    ) -> Result<()> {
        self.shared.send(command.as_u16(), seq, Some(timeout), args)
    }

    /// Closes the connection, failing outstanding calls with [`Error::Closed`].
    pub fn close(&self) {
        self.shared.report_error(Error::Closed);
    }

    pub fn has_error(&self) -> bool {
        self.shared.current_error().is_some()
    }

    /// The error that ended this connection, if any.
    pub fn current_error(&self) -> Option<Error> {
        self.shared.current_error()
    }

    /// Wall-clock time of the last reply frame read from the socket.
    pub fn last_read_time(&self) -> Option<SystemTime> {
        match self.shared.last_read_ms.load(Ordering::SeqCst) {
            0 => None,
            ms => Some(UNIX_EPOCH + Duration::from_millis(ms)),
        }
    }

    /// True once payload compression has been negotiated with the server.
    pub fn compression_enabled(&self) -> bool {
        self.shared.compression.load(Ordering::SeqCst)
    }

    /// True if a login on any connection sharing this one's [`ServerStartTime`] saw the server's
    /// start time change.
    ///
    /// [`ServerStartTime`]: crate::ServerStartTime
    pub fn server_restarted(&self) -> bool {
        self.shared.options.server_start.restarted()
    }

    pub fn options(&self) -> &ConnectOptions {
        &self.shared.options
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.close();
    }
}
