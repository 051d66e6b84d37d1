use std::{
    io::{self, Read, Write},
    net::{TcpListener, TcpStream},
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
        mpsc,
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use crate::{
    config::{ConnectOptions, Credentials, ServerStartTime},
    context::CallContext,
    error::Error,
    protocol::{
        Arg, CLIENT_VERSION, Command, Compressor, FrameHeader, HEADER_LEN, Value, decode_request,
        encode_reply,
    },
};

use super::Connection;

const WAIT: Duration = Duration::from_secs(5);

#[derive(Debug)]
struct Reverse;

impl Compressor for Reverse {
    fn compress(&self, input: &[u8]) -> Vec<u8> {
        input.iter().rev().copied().collect()
    }

    fn decompress(&self, input: &[u8]) -> io::Result<Vec<u8>> {
        Ok(self.compress(input))
    }
}

struct Frame {
    header: FrameHeader,
    args: Vec<Value>,
}

impl Frame {
    fn seq(&self) -> u32 {
        self.header.seq
    }
}

/// Server side of a scripted session.
struct Peer {
    stream: TcpStream,
    compressor: Option<Arc<dyn Compressor>>,
}

impl Peer {
    fn read_frame(&mut self) -> Frame {
        let mut raw = [0u8; HEADER_LEN];
        self.stream.read_exact(&mut raw).unwrap();
        let header = FrameHeader::decode(&raw).unwrap();
        let mut payload = vec![0u8; header.size as usize];
        self.stream.read_exact(&mut payload).unwrap();
        if header.is_compressed() {
            let compressor = self.compressor.as_ref().expect("peer compressor");
            payload = compressor.decompress(&payload).unwrap();
        }
        let (args, _) = decode_request(&payload).unwrap();
        Frame { header, args }
    }

    fn respond(&mut self, frame: &Frame, status: u64, message: &str, values: &[Value]) {
        let bytes = encode_reply(
            frame.header.command,
            frame.header.seq,
            status,
            message,
            values,
            self.compressor.as_deref(),
        )
        .unwrap();
        self.stream.write_all(&bytes).unwrap();
    }

    fn echo(&mut self, frame: &Frame) {
        self.respond(frame, 0, "", &frame.args);
    }

    fn login(&mut self, start: i64) -> Frame {
        let frame = self.read_frame();
        assert_eq!(frame.header.command, Command::Login.as_u16());
        self.respond(&frame, 0, "", &[Value::Int64(0), Value::Int64(start)]);
        frame
    }
}

fn serve<F>(script: F) -> (String, JoinHandle<()>)
where
    F: FnOnce(Peer) + Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let handle = thread::spawn(move || {
        let (stream, _) = listener.accept().unwrap();
        script(Peer {
            stream,
            compressor: None,
        });
    });
    (addr, handle)
}

fn options(addr: &str, queue_size: u32) -> ConnectOptions {
    let mut opts = ConnectOptions::new(addr);
    opts.queue_size = queue_size;
    opts.deadline_check_period = Duration::from_millis(10);
    opts.login_timeout = Some(WAIT);
    opts
}

fn text(s: &str) -> Value {
    Value::String(s.as_bytes().to_vec())
}

#[test]
fn login_sends_credentials_and_tracks_server_start() {
    let start = Arc::new(ServerStartTime::default());

    let (addr, server) = serve(|mut peer| {
        let login = peer.login(1000);
        assert_eq!(
            login.args,
            vec![
                text("admin"),
                text("secret"),
                text("items"),
                Value::Bool(true),
                Value::Bool(false),
                Value::Int(-1),
                text(CLIENT_VERSION),
                text("tests"),
            ]
        );
        let ping = peer.read_frame();
        assert_eq!(ping.header.command, Command::Ping.as_u16());
        peer.echo(&ping);
    });
    let mut opts = options(&addr, 4);
    opts.credentials = Credentials {
        username: "admin".to_string(),
        password: "secret".to_string(),
        database: "/items".to_string(),
    };
    opts.create_db_if_missing = true;
    opts.app_name = "tests".to_string();
    opts.server_start = Arc::clone(&start);

    let conn = Connection::open(opts.clone()).unwrap();
    assert!(!conn.server_restarted());
    conn.call(&CallContext::background(), Command::Ping, &[]).unwrap();
    assert!(conn.last_read_time().is_some());
    drop(conn);
    server.join().unwrap();

    let (addr, server) = serve(|mut peer| {
        peer.login(2000);
    });
    opts.address = addr;
    let conn = Connection::open(opts).unwrap();
    assert!(conn.server_restarted());
    assert_eq!(start.get(), 2000);
    drop(conn);
    server.join().unwrap();
}

#[test]
fn replies_reach_their_callers_in_any_order() {
    const CALLERS: i32 = 8;

    let (addr, server) = serve(|mut peer| {
        peer.login(1);
        let frames: Vec<Frame> = (0..CALLERS).map(|_| peer.read_frame()).collect();
        for frame in frames.iter().rev() {
            peer.echo(frame);
        }
    });
    let conn = Arc::new(Connection::open(options(&addr, CALLERS as u32)).unwrap());

    let callers: Vec<_> = (0..CALLERS)
        .map(|i| {
            let conn = Arc::clone(&conn);
            thread::spawn(move || {
                let reply = conn
                    .call(&CallContext::with_timeout(WAIT), Command::Select, &[Arg::Int(i)])
                    .unwrap();
                assert_eq!(reply.args(), &[Value::Int(i)]);
            })
        })
        .collect();
    for caller in callers {
        caller.join().unwrap();
    }
    server.join().unwrap();
}

#[test]
fn admission_waits_for_a_released_slot() {
    let (go_tx, go_rx) = mpsc::channel::<()>();
    let (addr, server) = serve(move |mut peer| {
        peer.login(1);
        let first = peer.read_frame();
        let second = peer.read_frame();
        go_rx.recv().unwrap();
        peer.echo(&first);
        let next = peer.read_frame();
        assert_eq!(next.args, vec![text("fourth")]);
        peer.echo(&next);
        peer.echo(&second);
    });
    let conn = Connection::open(options(&addr, 2)).unwrap();

    let (done_tx, done_rx) = mpsc::channel();
    for name in ["first", "second"] {
        let done_tx = done_tx.clone();
        conn.call_async(
            &CallContext::background(),
            Command::Ping,
            &[Arg::from(name)],
            move |res| done_tx.send(res).unwrap(),
        );
    }

    let started = Instant::now();
    let third = conn.call(
        &CallContext::with_timeout(Duration::from_millis(100)),
        Command::Ping,
        &[Arg::from("third")],
    );
    assert!(matches!(third, Err(Error::Timeout)));
    assert!(started.elapsed() >= Duration::from_millis(100));

    go_tx.send(()).unwrap();
    let fourth = conn
        .call(&CallContext::with_timeout(WAIT), Command::Ping, &[Arg::from("fourth")])
        .unwrap();
    assert_eq!(fourth.args(), &[text("fourth")]);

    for _ in 0..2 {
        done_rx.recv_timeout(WAIT).unwrap().unwrap();
    }
    server.join().unwrap();
}

#[test]
fn expired_call_writes_nothing() {
    let (addr, server) = serve(|mut peer| {
        peer.login(1);
        let frame = peer.read_frame();
        assert_eq!(frame.args, vec![text("after")]);
        peer.echo(&frame);
    });
    let conn = Connection::open(options(&addr, 2)).unwrap();

    let expired = CallContext::background().deadline(Instant::now());
    let res = conn.call(&expired, Command::Ping, &[Arg::from("expired")]);
    assert!(matches!(res, Err(Error::Timeout)));

    let (tx, rx) = mpsc::channel();
    conn.call_async(&expired, Command::Ping, &[Arg::from("expired")], move |res| {
        tx.send(res).unwrap()
    });
    assert!(matches!(rx.recv_timeout(WAIT).unwrap(), Err(Error::Timeout)));

    conn.call(&CallContext::background(), Command::Ping, &[Arg::from("after")])
        .unwrap();
    server.join().unwrap();
}

#[test]
fn async_deadline_completes_once_and_late_reply_is_skipped() {
    let (go_tx, go_rx) = mpsc::channel::<()>();
    let (addr, server) = serve(move |mut peer| {
        peer.login(1);
        let slow = peer.read_frame();
        go_rx.recv().unwrap();
        peer.respond(&slow, 0, "", &[text("late payload that nobody reads")]);
        let next = peer.read_frame();
        assert_eq!(next.args, vec![text("next")]);
        peer.echo(&next);
        // Hold the socket open until the client has checked its state.
        go_rx.recv().unwrap();
    });
    let conn = Connection::open(options(&addr, 4)).unwrap();

    let calls = Arc::new(AtomicUsize::new(0));
    let (tx, rx) = mpsc::channel();
    {
        let calls = Arc::clone(&calls);
        conn.call_async(
            &CallContext::with_timeout(Duration::from_millis(50)),
            Command::Ping,
            &[Arg::from("slow")],
            move |res| {
                calls.fetch_add(1, Ordering::SeqCst);
                tx.send(res).unwrap();
            },
        );
    }

    assert!(matches!(rx.recv_timeout(WAIT).unwrap(), Err(Error::Timeout)));
    go_tx.send(()).unwrap();

    let reply = conn
        .call(&CallContext::with_timeout(WAIT), Command::Ping, &[Arg::from("next")])
        .unwrap();
    assert_eq!(reply.args(), &[text("next")]);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(!conn.has_error());
    go_tx.send(()).unwrap();
    server.join().unwrap();
}

#[test]
fn stale_select_reply_releases_server_results() {
    let (go_tx, go_rx) = mpsc::channel::<()>();
    let (seen_tx, seen_rx) = mpsc::channel::<()>();
    let (addr, server) = serve(move |mut peer| {
        peer.login(1);
        let select = peer.read_frame();
        go_rx.recv().unwrap();
        peer.respond(&select, 0, "", &[text("rows"), Value::Int(7), Value::Int64(99)]);

        let notice = peer.read_frame();
        assert_eq!(notice.header.command, Command::CloseResults.as_u16());
        assert_eq!(notice.seq(), select.seq());
        assert_eq!(
            notice.args,
            vec![Value::Int(7), Value::Int64(99), Value::Bool(true)]
        );
        seen_tx.send(()).unwrap();

        let next = peer.read_frame();
        assert_eq!(next.header.command, Command::Ping.as_u16());
        peer.echo(&next);
    });
    let conn = Connection::open(options(&addr, 4)).unwrap();

    let res = conn.call(
        &CallContext::with_timeout(Duration::from_millis(50)),
        Command::Select,
        &[Arg::from("SELECT * FROM items")],
    );
    assert!(matches!(res, Err(Error::Timeout)));
    go_tx.send(()).unwrap();
    seen_rx.recv_timeout(WAIT).unwrap();

    conn.call(&CallContext::with_timeout(WAIT), Command::Ping, &[])
        .unwrap();
    server.join().unwrap();
}

#[test]
fn cancelled_call_recycles_its_slot() {
    let (go_tx, go_rx) = mpsc::channel::<()>();
    let (addr, server) = serve(move |mut peer| {
        peer.login(1);
        let abandoned = peer.read_frame();
        go_rx.recv().unwrap();
        peer.echo(&abandoned);
        let next = peer.read_frame();
        assert_eq!(next.seq(), abandoned.seq() + 1);
        peer.echo(&next);
    });
    let conn = Connection::open(options(&addr, 1)).unwrap();

    let (ctx, handle) = CallContext::background().cancellable();
    let canceller = thread::spawn(move || {
        thread::sleep(Duration::from_millis(50));
        handle.cancel();
    });
    let res = conn.call(&ctx, Command::Ping, &[Arg::from("abandoned")]);
    assert!(matches!(res, Err(Error::Cancelled)));
    canceller.join().unwrap();
    go_tx.send(()).unwrap();

    let reply = conn
        .call(&CallContext::with_timeout(WAIT), Command::Ping, &[Arg::from("next")])
        .unwrap();
    assert_eq!(reply.args(), &[text("next")]);
    server.join().unwrap();
}

#[test]
fn read_error_fails_every_pending_call_once() {
    let (addr, server) = serve(|mut peer| {
        peer.login(1);
        for _ in 0..8 {
            peer.read_frame();
        }
        drop(peer);
    });
    let conn = Arc::new(Connection::open(options(&addr, 16)).unwrap());
    let (tx, rx) = mpsc::channel();

    for i in 0..5 {
        let tx = tx.clone();
        conn.call_async(
            &CallContext::background(),
            Command::Ping,
            &[Arg::Int(i)],
            move |res| tx.send(res.map(|_| ())).unwrap(),
        );
    }
    let sync_callers: Vec<_> = (0..3)
        .map(|i| {
            let (conn, tx) = (Arc::clone(&conn), tx.clone());
            thread::spawn(move || {
                let res = conn.call(&CallContext::background(), Command::Ping, &[Arg::Int(i)]);
                tx.send(res.map(|_| ())).unwrap();
            })
        })
        .collect();
    drop(tx);

    let results: Vec<_> = (0..8).map(|_| rx.recv_timeout(WAIT).unwrap()).collect();
    for caller in sync_callers {
        caller.join().unwrap();
    }
    assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());

    let errors: Vec<String> = results
        .into_iter()
        .map(|res| res.unwrap_err().to_string())
        .collect();
    assert!(errors.iter().all(|e| *e == errors[0]), "{errors:?}");

    assert!(conn.has_error());
    let later = conn.call(&CallContext::background(), Command::Ping, &[]);
    assert_eq!(later.unwrap_err().to_string(), errors[0]);
    server.join().unwrap();
}

#[test]
fn bad_magic_is_fatal() {
    let (addr, server) = serve(|mut peer| {
        peer.login(1);
        peer.read_frame();
        let mut bogus = FrameHeader::request(0, 1, 0, false, false);
        bogus.magic = 0x01020304;
        peer.stream.write_all(&bogus.encode().unwrap()).unwrap();
    });
    let conn = Connection::open(options(&addr, 4)).unwrap();

    let res = conn.call(&CallContext::with_timeout(WAIT), Command::Ping, &[]);
    assert!(matches!(res, Err(Error::InvalidMagic(0x01020304))));
    assert!(matches!(conn.current_error(), Some(Error::InvalidMagic(_))));
    server.join().unwrap();
}

#[test]
fn sequence_numbers_advance_by_queue_size_per_slot() {
    const QUEUE: u32 = 2;
    let (seq_tx, seq_rx) = mpsc::channel();
    let (addr, server) = serve(move |mut peer| {
        seq_tx.send(peer.login(1).seq()).unwrap();
        for _ in 0..6 {
            let frame = peer.read_frame();
            seq_tx.send(frame.seq()).unwrap();
            peer.echo(&frame);
        }
    });
    let conn = Connection::open(options(&addr, QUEUE)).unwrap();
    for _ in 0..6 {
        conn.call(&CallContext::with_timeout(WAIT), Command::Ping, &[])
            .unwrap();
    }
    server.join().unwrap();

    let seqs: Vec<u32> = seq_rx.iter().collect();
    assert_eq!(seqs.len(), 7);
    for slot in 0..QUEUE {
        let used: Vec<u32> = seqs.iter().copied().filter(|s| s % QUEUE == slot).collect();
        assert!(used.len() >= 3);
        for pair in used.windows(2) {
            assert_eq!(pair[1], pair[0] + QUEUE);
        }
    }
}

#[test]
fn compression_flag_in_reply_enables_compression() {
    let (addr, server) = serve(|mut peer| {
        peer.compressor = Some(Arc::new(Reverse));
        let login = peer.login(1);
        assert!(!login.header.is_compressed());
        let ping = peer.read_frame();
        assert!(ping.header.is_compressed());
        assert_eq!(ping.args, vec![text("squeezed")]);
        peer.echo(&ping);
    });
    let mut opts = options(&addr, 4);
    opts.compression = Some(Arc::new(Reverse));
    let conn = Connection::open(opts).unwrap();
    assert!(conn.compression_enabled());

    let reply = conn
        .call(&CallContext::with_timeout(WAIT), Command::Ping, &[Arg::from("squeezed")])
        .unwrap();
    assert_eq!(reply.args(), &[text("squeezed")]);
    server.join().unwrap();
}

#[test]
fn compression_stays_off_without_local_codec() {
    let (addr, server) = serve(|mut peer| {
        let login = peer.read_frame();
        let bytes = encode_reply(
            login.header.command,
            login.seq(),
            0,
            "",
            &[Value::Int64(0), Value::Int64(1)],
            Some(&Reverse as &dyn Compressor),
        )
        .unwrap();
        peer.stream.write_all(&bytes).unwrap();
    });

    let res = Connection::open(options(&addr, 4));
    assert!(matches!(res, Err(Error::Compression(_))));
    server.join().unwrap();
}

#[test]
fn server_error_is_reported_to_its_caller_only() {
    let (addr, server) = serve(|mut peer| {
        peer.login(1);
        let bad = peer.read_frame();
        peer.respond(&bad, 5, "namespace not found", &[]);
        let good = peer.read_frame();
        peer.echo(&good);
    });
    let conn = Connection::open(options(&addr, 4)).unwrap();

    let res = conn.call(
        &CallContext::with_timeout(WAIT),
        Command::OpenNamespace,
        &[Arg::from("missing")],
    );
    match res {
        Err(Error::Server { code, message }) => {
            assert_eq!(code, 5);
            assert_eq!(message, "namespace not found");
        }
        other => panic!("unexpected {other:?}"),
    }
    assert!(!conn.has_error());
    conn.call_no_results(&CallContext::with_timeout(WAIT), Command::Ping, &[])
        .unwrap();
    server.join().unwrap();
}

#[test]
fn close_fails_pending_async_calls() {
    let (addr, server) = serve(|mut peer| {
        peer.login(1);
        peer.read_frame();
        let mut rest = Vec::new();
        let _ = peer.stream.read_to_end(&mut rest);
    });
    let conn = Connection::open(options(&addr, 4)).unwrap();

    let (tx, rx) = mpsc::channel();
    conn.call_async(&CallContext::background(), Command::Ping, &[], move |res| {
        tx.send(res).unwrap()
    });
    thread::sleep(Duration::from_millis(50));
    conn.close();

    assert!(matches!(rx.recv_timeout(WAIT).unwrap(), Err(Error::Closed)));
    assert!(matches!(
        conn.call(&CallContext::background(), Command::Ping, &[]),
        Err(Error::Closed)
    ));
    server.join().unwrap();
}

#[test]
fn refused_dial_is_a_connect_error() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    drop(listener);

    let res = Connection::open(options(&addr, 4));
    assert!(matches!(res, Err(Error::Connect { .. })));
}

#[test]
fn invalid_options_are_rejected_before_dialing() {
    let mut opts = ConnectOptions::new("127.0.0.1:1");
    opts.queue_size = 0;
    assert!(matches!(Connection::open(opts), Err(Error::InvalidOptions(_))));
}
