//! Tagged argument format carried inside frame payloads.
//!
//! Values are written as a varint type tag followed by the value itself. Integers use LEB128
//! varints (zig-zag for signed values) and strings are length-prefixed. Arguments are grouped in
//! chunks, each prefixed with its argument count.
use crate::error::{Error, Result};

use super::{CPROTO_VERSION, Compressor, FrameHeader, HEADER_LEN, VERSION_COMPRESSION_FLAG};

const TAG_INT64: u64 = 0;
const TAG_DOUBLE: u64 = 1;
const TAG_STRING: u64 = 2;
const TAG_BOOL: u64 = 3;
const TAG_NULL: u64 = 4;
const TAG_INT: u64 = 8;
const TAG_TUPLE: u64 = 11;

const MAX_VARINT_LEN: usize = 10;
/// Deepest tuple nesting accepted in a payload.
pub(crate) const MAX_DEPTH: usize = 64;

/// A single request argument.
///
/// This is the complete set of types a request can carry; anything else has to be converted by the
/// caller before the call is made.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arg<'a> {
    Bool(bool),
    Int(i32),
    Int64(i64),
    Str(&'a str),
    Bytes(&'a [u8]),
    Int32Array(&'a [i32]),
}

impl From<bool> for Arg<'_> {
    fn from(value: bool) -> Self {
        Arg::Bool(value)
    }
}

impl From<i32> for Arg<'_> {
    fn from(value: i32) -> Self {
        Arg::Int(value)
    }
}

impl From<i64> for Arg<'_> {
    fn from(value: i64) -> Self {
        Arg::Int64(value)
    }
}

impl<'a> From<&'a str> for Arg<'a> {
    fn from(value: &'a str) -> Self {
        Arg::Str(value)
    }
}

impl<'a> From<&'a String> for Arg<'a> {
    fn from(value: &'a String) -> Self {
        Arg::Str(value.as_str())
    }
}

impl<'a> From<&'a [u8]> for Arg<'a> {
    fn from(value: &'a [u8]) -> Self {
        Arg::Bytes(value)
    }
}

impl<'a> From<&'a [i32]> for Arg<'a> {
    fn from(value: &'a [i32]) -> Self {
        Arg::Int32Array(value)
    }
}

/// A decoded value from a payload.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Int(i32),
    Int64(i64),
    Double(f64),
    /// Strings and byte strings share a wire tag.
    String(Vec<u8>),
    Bool(bool),
    Null,
    Tuple(Vec<Value>),
}

impl Value {
    /// Integer value of an `Int` or `Int64`.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(i64::from(*v)),
            Value::Int64(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_i32(&self) -> Option<i32> {
        match self {
            Value::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::String(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        self.as_bytes().and_then(|b| std::str::from_utf8(b).ok())
    }
}

impl From<Arg<'_>> for Value {
    fn from(value: Arg<'_>) -> Self {
        match value {
            Arg::Bool(v) => Value::Bool(v),
            Arg::Int(v) => Value::Int(v),
            Arg::Int64(v) => Value::Int64(v),
            Arg::Str(v) => Value::String(v.as_bytes().to_vec()),
            Arg::Bytes(v) => Value::String(v.to_vec()),
            Arg::Int32Array(v) => Value::Tuple(v.iter().copied().map(Value::Int).collect()),
        }
    }
}

/// Successfully decoded reply of a call.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Reply {
    args: Vec<Value>,
}

impl Reply {
    /// Parses a reply payload. A nonzero status becomes [`Error::Server`].
    pub fn parse(payload: &[u8]) -> Result<Self> {
        let mut reader = ArgReader::new(payload);
        let code = reader.get_varuint()?;
        let message = reader.get_vbytes()?;
        if code != 0 {
            return Err(Error::Server {
                code,
                message: String::from_utf8_lossy(message).into_owned(),
            });
        }
        let args = reader.get_chunk()?;
        Ok(Self { args })
    }

    pub fn args(&self) -> &[Value] {
        &self.args
    }

    pub fn get(&self, idx: usize) -> Option<&Value> {
        self.args.get(idx)
    }

    pub fn into_args(self) -> Vec<Value> {
        self.args
    }

    /// Server-side result identifiers carried by replies of long-running commands: the logical
    /// request id and, when present, the connection identity token.
    pub fn result_ids(&self) -> Option<(i32, Option<i64>)> {
        let req_id = self.args.get(1)?.as_i32()?;
        let uid = self.args.get(2).and_then(|v| match v {
            Value::Int64(uid) => Some(*uid),
            _ => None,
        });
        Some((req_id, uid))
    }
}

pub(crate) struct ArgWriter {
    buf: Vec<u8>,
}

impl ArgWriter {
    pub fn new() -> Self {
        Self { buf: Vec::new() }
    }

    pub fn put_varuint(&mut self, mut v: u64) {
        while v >= 0x80 {
            self.buf.push((v as u8) | 0x80);
            v >>= 7;
        }
        self.buf.push(v as u8);
    }

    pub fn put_varint(&mut self, v: i64) {
        self.put_varuint(((v << 1) ^ (v >> 63)) as u64);
    }

    pub fn put_vbytes(&mut self, bytes: &[u8]) {
        self.put_varuint(bytes.len() as u64);
        self.buf.extend_from_slice(bytes);
    }

    pub fn put_arg(&mut self, arg: &Arg<'_>) {
        match *arg {
            Arg::Bool(v) => {
                self.put_varuint(TAG_BOOL);
                self.put_varuint(u64::from(v));
            }
            Arg::Int(v) => {
                self.put_varuint(TAG_INT);
                self.put_varint(i64::from(v));
            }
            Arg::Int64(v) => {
                self.put_varuint(TAG_INT64);
                self.put_varint(v);
            }
            Arg::Str(v) => {
                self.put_varuint(TAG_STRING);
                self.put_vbytes(v.as_bytes());
            }
            Arg::Bytes(v) => {
                self.put_varuint(TAG_STRING);
                self.put_vbytes(v);
            }
            Arg::Int32Array(v) => {
                self.put_varuint(TAG_TUPLE);
                self.put_varuint(v.len() as u64);
                for item in v {
                    self.put_varuint(TAG_INT);
                    self.put_varint(i64::from(*item));
                }
            }
        }
    }

    pub fn put_value(&mut self, value: &Value) {
        match value {
            Value::Int(v) => self.put_arg(&Arg::Int(*v)),
            Value::Int64(v) => self.put_arg(&Arg::Int64(*v)),
            Value::Bool(v) => self.put_arg(&Arg::Bool(*v)),
            Value::String(v) => self.put_arg(&Arg::Bytes(v)),
            Value::Double(v) => {
                self.put_varuint(TAG_DOUBLE);
                self.buf.extend_from_slice(&v.to_le_bytes());
            }
            Value::Null => self.put_varuint(TAG_NULL),
            Value::Tuple(items) => {
                self.put_varuint(TAG_TUPLE);
                self.put_varuint(items.len() as u64);
                for item in items {
                    self.put_value(item);
                }
            }
        }
    }

    pub fn put_chunk(&mut self, args: &[Arg<'_>]) {
        self.put_varuint(args.len() as u64);
        for arg in args {
            self.put_arg(arg);
        }
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.buf
    }
}

pub(crate) struct ArgReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> ArgReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|end| *end <= self.buf.len())
            .ok_or_else(|| {
                Error::Decode(format!("need {n} bytes at offset {}, have {}", self.pos, self.buf.len()))
            })?;
        let out = &self.buf[self.pos..end];
        self.pos = end;
        Ok(out)
    }

    pub fn get_varuint(&mut self) -> Result<u64> {
        let mut out = 0u64;
        for i in 0..MAX_VARINT_LEN {
            let byte = self.take(1)?[0];
            out |= u64::from(byte & 0x7F) << (7 * i);
            if byte & 0x80 == 0 {
                return Ok(out);
            }
        }
        Err(Error::Decode("varint overflow".to_string()))
    }

    pub fn get_varint(&mut self) -> Result<i64> {
        let v = self.get_varuint()?;
        Ok((v >> 1) as i64 ^ -((v & 1) as i64))
    }

    pub fn get_vbytes(&mut self) -> Result<&'a [u8]> {
        let len = self.get_varuint()?;
        let len = usize::try_from(len).map_err(|_| Error::Decode(format!("length {len}")))?;
        self.take(len)
    }

    pub fn get_value(&mut self) -> Result<Value> {
        self.get_nested(0)
    }

    fn get_nested(&mut self, depth: usize) -> Result<Value> {
        if depth > MAX_DEPTH {
            return Err(Error::Decode(format!(
                "tuples nested deeper than {MAX_DEPTH} at offset {}",
                self.pos
            )));
        }
        let tag = self.get_varuint()?;
        let value = match tag {
            TAG_INT64 => Value::Int64(self.get_varint()?),
            TAG_INT => {
                let v = self.get_varint()?;
                Value::Int(
                    i32::try_from(v).map_err(|_| Error::Decode(format!("int out of range: {v}")))?,
                )
            }
            TAG_DOUBLE => {
                let mut raw = [0u8; 8];
                raw.copy_from_slice(self.take(8)?);
                Value::Double(f64::from_le_bytes(raw))
            }
            TAG_STRING => Value::String(self.get_vbytes()?.to_vec()),
            TAG_BOOL => Value::Bool(self.get_varuint()? != 0),
            TAG_NULL => Value::Null,
            TAG_TUPLE => {
                let count = self.get_varuint()?;
                let mut items = Vec::with_capacity((count as usize).min(self.remaining()));
                for _ in 0..count {
                    items.push(self.get_nested(depth + 1)?);
                }
                Value::Tuple(items)
            }
            other => return Err(Error::Decode(format!("unknown value tag {other}"))),
        };
        Ok(value)
    }

    pub fn get_chunk(&mut self) -> Result<Vec<Value>> {
        let count = self.get_varuint()?;
        let mut out = Vec::with_capacity((count as usize).min(self.remaining()));
        for _ in 0..count {
            out.push(self.get_value()?);
        }
        Ok(out)
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }
}

fn frame(header: FrameHeader, payload: &[u8]) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(HEADER_LEN + payload.len());
    out.extend_from_slice(&header.encode()?);
    out.extend_from_slice(payload);
    Ok(out)
}

fn payload_size(payload: &[u8]) -> Result<u32> {
    u32::try_from(payload.len())
        .map_err(|_| Error::Codec(format!("payload of {} bytes is too large", payload.len())))
}

/// Builds a complete request frame.
///
/// The execution timeout is always appended as a trailing chunk. When `compressor` is given the
/// payload is compressed and the header flag is set.
pub fn encode_request(
    command: u16,
    seq: u32,
    args: &[Arg<'_>],
    exec_timeout_ms: i64,
    compressor: Option<&dyn Compressor>,
    dedicated: bool,
) -> Result<Vec<u8>> {
    let mut writer = ArgWriter::new();
    writer.put_chunk(args);
    writer.put_chunk(&[Arg::Int64(exec_timeout_ms)]);
    let mut payload = writer.into_inner();

    if let Some(compressor) = compressor {
        payload = compressor.compress(&payload);
    }
    let header = FrameHeader::request(
        command,
        seq,
        payload_size(&payload)?,
        compressor.is_some(),
        dedicated,
    );
    frame(header, &payload)
}

/// Splits a request payload into its arguments and execution timeout.
pub fn decode_request(payload: &[u8]) -> Result<(Vec<Value>, i64)> {
    let mut reader = ArgReader::new(payload);
    let args = reader.get_chunk()?;
    let timeout = reader.get_chunk()?;
    match timeout.as_slice() {
        [Value::Int64(ms)] => Ok((args, *ms)),
        other => Err(Error::Decode(format!("bad execution timeout chunk: {other:?}"))),
    }
}

/// Builds a complete reply frame, as a server would send it.
pub fn encode_reply(
    command: u16,
    seq: u32,
    status: u64,
    message: &str,
    values: &[Value],
    compressor: Option<&dyn Compressor>,
) -> Result<Vec<u8>> {
    let mut writer = ArgWriter::new();
    writer.put_varuint(status);
    writer.put_vbytes(message.as_bytes());
    writer.put_varuint(values.len() as u64);
    for value in values {
        writer.put_value(value);
    }
    let mut payload = writer.into_inner();

    let mut version = CPROTO_VERSION;
    if let Some(compressor) = compressor {
        payload = compressor.compress(&payload);
        version |= VERSION_COMPRESSION_FLAG;
    }
    let header = FrameHeader {
        version,
        ..FrameHeader::request(command, seq, payload_size(&payload)?, false, false)
    };
    frame(header, &payload)
}
