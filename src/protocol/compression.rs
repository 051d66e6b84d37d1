use std::{fmt::Debug, io};

/// Payload codec applied once both peers agree on compression.
///
/// The algorithm is supplied by the caller; the connection only decides *when* it is used.
/// Outgoing payloads are compressed after compression has been negotiated, and incoming payloads
/// are decompressed whenever their frame carries the compression flag.
pub trait Compressor: Send + Sync + Debug {
    fn compress(&self, input: &[u8]) -> Vec<u8>;

    fn decompress(&self, input: &[u8]) -> io::Result<Vec<u8>>;
}
