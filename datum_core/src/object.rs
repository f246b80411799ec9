//! Binary cache entry format.
//!
//! Every cache entry is a 16-byte header followed by the payload:
//!
//! ```text
//! 0x00  4   "DTUM" magic
//! 0x04  1   version (u8) = 1
//! 0x05  1   algo: 1=blake3-256, 2=sha2-256
//! 0x06  1   compression: 0=none, 1=zstd
//! 0x07  1   reserved (must be 0)
//! 0x08  8   payload_len (u64 LE) - stored size, compressed if compressed
//! 0x10  ... payload
//! ```
//!
//! The entry's fingerprint is always computed over the uncompressed content,
//! so the same bytes stored with or without compression share one key.

use crate::error::{Error, Result};
use crate::hash::Algorithm;

/// Magic bytes at the start of every cache entry.
pub const MAGIC: &[u8; 4] = b"DTUM";

/// Current entry format version.
pub const VERSION: u8 = 1;

/// Size of the entry header in bytes.
pub const HEADER_SIZE: usize = 16;

/// Compression types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressionType {
    /// No compression.
    None = 0,
    /// Zstandard compression.
    Zstd = 1,
}

impl CompressionType {
    /// Convert to byte representation.
    pub fn to_u8(self) -> u8 {
        self as u8
    }

    /// Parse from byte representation.
    pub fn from_u8(value: u8) -> Result<Self> {
        match value {
            0 => Ok(CompressionType::None),
            1 => Ok(CompressionType::Zstd),
            _ => Err(Error::invalid_entry(format!(
                "Invalid compression type: {}",
                value
            ))),
        }
    }

    /// Get the string name of this compression type.
    pub fn as_str(&self) -> &'static str {
        match self {
            CompressionType::None => "none",
            CompressionType::Zstd => "zstd",
        }
    }
}

/// A 16-byte entry header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectHeader {
    /// Entry format version.
    pub version: u8,
    /// Hash algorithm the key was computed with.
    pub algorithm: Algorithm,
    /// Compression type.
    pub compression: CompressionType,
    /// Length of the stored payload in bytes.
    pub payload_len: u64,
}

impl ObjectHeader {
    /// Create a new entry header.
    pub fn new(algorithm: Algorithm, compression: CompressionType, payload_len: u64) -> Self {
        Self {
            version: VERSION,
            algorithm,
            compression,
            payload_len,
        }
    }

    /// Encode the header to a 16-byte array.
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];

        buf[0..4].copy_from_slice(MAGIC);
        buf[4] = self.version;
        buf[5] = self.algorithm.id();
        buf[6] = self.compression.to_u8();
        // buf[7] reserved
        buf[8..16].copy_from_slice(&self.payload_len.to_le_bytes());

        buf
    }

    /// Decode a header from the first 16 bytes of `buf`.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < HEADER_SIZE {
            return Err(Error::invalid_entry(format!(
                "Header too short: {} bytes (expected {})",
                buf.len(),
                HEADER_SIZE
            )));
        }

        if &buf[0..4] != MAGIC {
            return Err(Error::invalid_entry(format!(
                "Invalid magic: expected {:?}, got {:?}",
                MAGIC,
                &buf[0..4]
            )));
        }

        let version = buf[4];
        if version != VERSION {
            return Err(Error::invalid_entry(format!(
                "Unsupported version: {} (expected {})",
                version, VERSION
            )));
        }

        let algorithm = Algorithm::from_id(buf[5])?;
        let compression = CompressionType::from_u8(buf[6])?;

        if buf[7] != 0 {
            return Err(Error::invalid_entry(format!(
                "Reserved byte must be 0, got {}",
                buf[7]
            )));
        }

        let mut len_bytes = [0u8; 8];
        len_bytes.copy_from_slice(&buf[8..16]);
        let payload_len = u64::from_le_bytes(len_bytes);

        Ok(Self {
            version,
            algorithm,
            compression,
            payload_len,
        })
    }
}
