use std::{
    error::Error,
    sync::{
        Arc,
        atomic::{AtomicU64, AtomicUsize, Ordering},
        mpsc,
    },
    thread,
    time::{Duration, Instant},
};

use clap::Parser;
use cproto::{CallContext, Command, ConnectOptions, Connection, Credentials};
use log::{error, info};

/// Logs in to a cproto server and measures ping round trips.
#[derive(Debug, Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Server address as host:port
    #[arg(default_value = "127.0.0.1:6534")]
    address: String,
    #[arg(short, long, default_value = "")]
    user: String,
    #[arg(short, long, default_value = "")]
    password: String,
    /// Database to log in to
    #[arg(short, long, default_value = "")]
    database: String,
    /// Create the database if it does not exist
    #[arg(long)]
    create: bool,
    /// Number of pings to send
    #[arg(short = 'n', long, default_value_t = 10)]
    count: usize,
    /// Number of threads issuing pings
    #[arg(short, long, default_value_t = 1)]
    concurrency: usize,
    /// Per-ping timeout in milliseconds
    #[arg(short, long, default_value_t = 1000)]
    timeout: u64,
    /// Issue pings without blocking for their replies
    #[arg(long = "async")]
    asynchronous: bool,
    #[arg(long, default_value_t = cproto::config::DEFAULT_QUEUE_SIZE)]
    queue_size: u32,
    #[arg(long, default_value = "cproto_ping")]
    app_name: String,
}

#[derive(Debug, Default)]
struct Stats {
    ok: AtomicUsize,
    failed: AtomicUsize,
    total_us: AtomicU64,
    max_us: AtomicU64,
}

impl Stats {
    fn record(&self, started: Instant, res: cproto::Result<()>) {
        match res {
            Ok(()) => {
                let us = started.elapsed().as_micros() as u64;
                self.ok.fetch_add(1, Ordering::Relaxed);
                self.total_us.fetch_add(us, Ordering::Relaxed);
                self.max_us.fetch_max(us, Ordering::Relaxed);
            }
            Err(e) => {
                self.failed.fetch_add(1, Ordering::Relaxed);
                error!("ping failed: {e}");
            }
        }
    }
}

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();

    let cli = Cli::parse();
    let mut options = ConnectOptions::new(cli.address);
    options.credentials = Credentials {
        username: cli.user,
        password: cli.password,
        database: cli.database,
    };
    options.create_db_if_missing = cli.create;
    options.queue_size = cli.queue_size;
    options.app_name = cli.app_name;

    let conn = Arc::new(Connection::open(options)?);
    {
        let conn = Arc::clone(&conn);
        ctrlc::set_handler(move || {
            info!("interrupted, closing connection");
            conn.close();
        })?;
    }

    let timeout = Duration::from_millis(cli.timeout);
    let stats = Arc::new(Stats::default());
    let started = Instant::now();

    if cli.asynchronous {
        let (done_tx, done_rx) = mpsc::channel();
        for _ in 0..cli.count {
            let (stats, done_tx) = (Arc::clone(&stats), done_tx.clone());
            let sent = Instant::now();
            conn.call_async(
                &CallContext::with_timeout(timeout),
                Command::Ping,
                &[],
                move |res| {
                    stats.record(sent, res.map(|_| ()));
                    let _ = done_tx.send(());
                },
            );
        }
        drop(done_tx);
        while done_rx.recv().is_ok() {}
    } else {
        let workers = cli.concurrency.max(1);
        let handles: Vec<_> = (0..workers)
            .map(|worker| {
                let (conn, stats) = (Arc::clone(&conn), Arc::clone(&stats));
                let share = cli.count / workers + usize::from(worker < cli.count % workers);
                thread::spawn(move || {
                    for _ in 0..share {
                        let sent = Instant::now();
                        let res = conn.call_no_results(
                            &CallContext::with_timeout(timeout),
                            Command::Ping,
                            &[],
                        );
                        stats.record(sent, res);
                        if conn.has_error() {
                            break;
                        }
                    }
                })
            })
            .collect();
        for handle in handles {
            let _ = handle.join();
        }
    }

    let ok = stats.ok.load(Ordering::Relaxed);
    let failed = stats.failed.load(Ordering::Relaxed);
    let avg_us = stats.total_us.load(Ordering::Relaxed) / ok.max(1) as u64;
    println!(
        "{ok} ok, {failed} failed in {:.1?}; avg {avg_us}us, max {}us",
        started.elapsed(),
        stats.max_us.load(Ordering::Relaxed)
    );

    if let Some(err) = conn.current_error() {
        return Err(err.into());
    }
    Ok(())
}
