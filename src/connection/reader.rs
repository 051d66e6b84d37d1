//! Reply demultiplexer.
//!
//! A single thread reads frames off the socket and routes each one to the slot named by its
//! sequence number. Every announced payload byte is consumed before the next header is read, even
//! for replies nobody waits for, so the stream never desynchronizes.
use std::{
    io::{self, BufReader, Read},
    net::TcpStream,
    sync::{Arc, atomic::Ordering},
};

use log::{debug, trace};

use crate::{
    error::{Error, Result},
    protocol::{
        self, CPROTO_MAGIC, FrameHeader, HEADER_LEN, MIN_COMPAT_VERSION, MIN_COMPRESSION_VERSION,
    },
};

use super::{
    Shared,
    seq::SequencePool,
    slots::{Answer, SlotMode},
};

const BUF_CAP: usize = 16 * 1024;

pub(crate) fn run(shared: Arc<Shared>, stream: TcpStream) {
    let mut reader = BufReader::with_capacity(BUF_CAP, stream);
    loop {
        if let Err(err) = read_reply(&shared, &mut reader) {
            shared.report_error(err);
            return;
        }
        shared.touch_read();
    }
}

/// Checks a reply header. Returns true when the frame advertises compression from a server able to
/// use it.
pub(crate) fn validate_header(header: &FrameHeader, pool: &SequencePool) -> Result<bool> {
    if header.magic != CPROTO_MAGIC {
        return Err(Error::InvalidMagic(header.magic));
    }
    let version = header.protocol_version();
    if version < MIN_COMPAT_VERSION {
        return Err(Error::IncompatibleVersion {
            version,
            min: MIN_COMPAT_VERSION,
        });
    }
    let offers_compression = header.is_compressed() && version >= MIN_COMPRESSION_VERSION;
    if !pool.is_valid(header.seq) {
        return Err(Error::InvalidSequence(header.seq));
    }
    Ok(offers_compression)
}

fn read_payload<R: Read>(reader: &mut R, size: u32) -> Result<Vec<u8>> {
    let mut payload = vec![0u8; size as usize];
    reader.read_exact(&mut payload)?;
    Ok(payload)
}

fn skip_payload<R: Read>(reader: &mut R, size: u32) -> Result<()> {
    let skipped = io::copy(&mut reader.take(u64::from(size)), &mut io::sink())?;
    if skipped != u64::from(size) {
        return Err(io::Error::from(io::ErrorKind::UnexpectedEof).into());
    }
    Ok(())
}

fn read_reply<R: Read>(shared: &Shared, reader: &mut R) -> Result<()> {
    let mut raw = [0u8; HEADER_LEN];
    reader.read_exact(&mut raw)?;
    let header = FrameHeader::decode(&raw)?;

    if validate_header(&header, &shared.pool)?
        && shared.options.compression.is_some()
        && !shared.compression.swap(true, Ordering::SeqCst)
    {
        debug!("server accepted payload compression");
    }

    let max = shared.options.max_frame_size;
    if header.size > max {
        return Err(Error::FrameTooLarge {
            size: header.size,
            max,
        });
    }

    let seq = header.seq;
    let slot = shared.slot(seq);
    trace!("reply cmd {} seq {seq}, {} bytes", header.command, header.size);

    if !slot.matches(seq) {
        // Timed out, cancelled or duplicate.
        if protocol::needs_cancel_notice(header.command) {
            let payload = read_payload(reader, header.size)?;
            shared.discard_stale(Answer {
                seq,
                command: header.command,
                payload,
                compressed: header.is_compressed(),
            });
        } else {
            skip_payload(reader, header.size)?;
        }
        return Ok(());
    }

    let answer = Answer {
        seq,
        command: header.command,
        payload: read_payload(reader, header.size)?,
        compressed: header.is_compressed(),
    };

    match slot.mode() {
        SlotMode::Async => match slot.take_for_reply(seq) {
            Some(completion) => {
                shared.pool.release(seq);
                completion(shared.parse(&answer));
            }
            None => trace!("async seq {seq} already retired"),
        },
        SlotMode::Sync => slot.deliver(answer),
        SlotMode::Idle if !slot.matches(seq) => shared.discard_stale(answer),
        // Arm publishes mode before seq and retire clears seq before mode, so a live seq with no
        // owner means the slot bookkeeping is broken.
        SlotMode::Idle => {
            return Err(Error::UnexpectedAnswer {
                seq,
                command: header.command,
            });
        }
    }
    Ok(())
}
