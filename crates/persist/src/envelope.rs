//! Self-describing wrapper around every stored payload.
//!
//! ```text
//! [magic "CS"][version u8][algorithm tag u8][raw_len u64 LE][sha256 of raw, 32][payload]
//! ```
//! `raw` is the serialized value before compression, so the digest checks the
//! whole pipeline end to end.

use sha2::{Digest, Sha256};

use crate::compress::Algorithm;
use crate::error::PersistError;

const MAGIC: &[u8; 2] = b"CS";
const VERSION: u8 = 1;
const HEADER_LEN: usize = 2 + 1 + 1 + 8 + 32;

/// A decoded envelope borrowing its payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope<'a> {
    pub algorithm: Algorithm,
    pub raw_len: u64,
    pub digest: [u8; 32],
    pub payload: &'a [u8],
}

impl<'a> Envelope<'a> {
    /// Wrap `payload` (already compressed with `algorithm`) produced from `raw`.
    pub fn seal(raw: &[u8], algorithm: Algorithm, payload: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_LEN + payload.len());
        out.extend_from_slice(MAGIC);
        out.push(VERSION);
        out.push(algorithm.tag());
        out.extend_from_slice(&(raw.len() as u64).to_le_bytes());
        out.extend_from_slice(&sha256(raw));
        out.extend_from_slice(payload);
        out
    }

    /// Parse the header of a stored blob. `key` only labels errors.
    pub fn open(key: &str, bytes: &'a [u8]) -> Result<Self, PersistError> {
        if bytes.len() < HEADER_LEN {
            return Err(PersistError::corrupt(key, "payload shorter than envelope header"));
        }
        if &bytes[..2] != MAGIC {
            return Err(PersistError::corrupt(key, "bad magic"));
        }
        if bytes[2] != VERSION {
            return Err(PersistError::corrupt(
                key,
                format!("unsupported envelope version {}", bytes[2]),
            ));
        }
        let algorithm = Algorithm::from_tag(bytes[3])
            .ok_or_else(|| PersistError::corrupt(key, format!("unknown algorithm tag {}", bytes[3])))?;
        let mut len = [0u8; 8];
        len.copy_from_slice(&bytes[4..12]);
        let mut digest = [0u8; 32];
        digest.copy_from_slice(&bytes[12..HEADER_LEN]);
        Ok(Self {
            algorithm,
            raw_len: u64::from_le_bytes(len),
            digest,
            payload: &bytes[HEADER_LEN..],
        })
    }

    /// Check decompressed bytes against the recorded length and digest.
    pub fn verify(&self, key: &str, raw: &[u8]) -> Result<(), PersistError> {
        if raw.len() as u64 != self.raw_len {
            return Err(PersistError::corrupt(
                key,
                format!("length mismatch: expected {}, got {}", self.raw_len, raw.len()),
            ));
        }
        if sha256(raw) != self.digest {
            return Err(PersistError::corrupt(key, "sha256 mismatch"));
        }
        Ok(())
    }
}

fn sha256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}
