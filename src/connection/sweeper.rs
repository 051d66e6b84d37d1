//! Asynchronous deadline enforcement.
//!
//! Instead of a timer per request, one thread advances a coarse virtual clock every period and
//! expires async calls whose deadline tick has been reached.
use std::sync::Arc;

use crossbeam_channel::{select, tick};
use log::{trace, warn};

use crate::error::Error;

use super::Shared;

pub(crate) fn run(shared: Arc<Shared>) {
    let period = shared.options.deadline_check_period;
    let step = u64::try_from(period.as_millis()).unwrap_or(u64::MAX).max(1);
    let ticker = tick(period);

    loop {
        select! {
            recv(shared.terminating.receiver()) -> _ => break,
            recv(ticker) -> _ => {}
        }

        let now = shared.advance_clock(step);
        for (seq, completion) in shared.slots.expire(now) {
            shared.pool.release(seq);
            warn!("async deadline exceeded, seq {seq}");
            completion(Err(Error::Timeout));
        }
    }
    trace!("deadline sweeper stopped");
}
