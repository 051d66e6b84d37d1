use bincode::{
    Decode, Encode,
    config::{Configuration, Fixint, LittleEndian},
    decode_from_slice, encode_into_slice,
};

use crate::error::Result;

use super::{
    CPROTO_MAGIC, CPROTO_VERSION, DEDICATED_THREAD_FLAG, VERSION_COMPRESSION_FLAG, VERSION_MASK,
};

/// Size of an encoded [`FrameHeader`].
pub const HEADER_LEN: usize = 16;

/// Fixed header preceding every frame payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Encode, Decode)]
pub struct FrameHeader {
    pub magic: u32,
    /// Protocol version plus the compression and dedicated-thread flag bits.
    pub version: u16,
    pub command: u16,
    pub size: u32,
    pub seq: u32,
}

fn wire_config() -> Configuration<LittleEndian, Fixint> {
    bincode::config::standard()
        .with_little_endian()
        .with_fixed_int_encoding()
}

impl FrameHeader {
    pub fn request(command: u16, seq: u32, size: u32, compressed: bool, dedicated: bool) -> Self {
        let mut version = CPROTO_VERSION;
        if compressed {
            version |= VERSION_COMPRESSION_FLAG;
        }
        if dedicated {
            version |= DEDICATED_THREAD_FLAG;
        }
        Self {
            magic: CPROTO_MAGIC,
            version,
            command,
            size,
            seq,
        }
    }

    pub fn encode(&self) -> Result<[u8; HEADER_LEN]> {
        let mut out = [0u8; HEADER_LEN];
        encode_into_slice(*self, &mut out, wire_config())?;
        Ok(out)
    }

    pub fn decode(bytes: &[u8; HEADER_LEN]) -> Result<Self> {
        let (header, _) = decode_from_slice(bytes, wire_config())?;
        Ok(header)
    }

    /// Version with the flag bits masked off.
    pub fn protocol_version(&self) -> u16 {
        self.version & VERSION_MASK
    }

    pub fn is_compressed(&self) -> bool {
        self.version & VERSION_COMPRESSION_FLAG != 0
    }

    pub fn is_dedicated(&self) -> bool {
        self.version & DEDICATED_THREAD_FLAG != 0
    }
}
