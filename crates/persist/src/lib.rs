//! Persistence: storage driver capability, chunking + compression pipeline,
//! and the hydration controller that materializes persisted values.
//!
//! # Invariants
//! - Higher layers only ever talk to a [`StorageDriver`].
//! - A logical key is stored either as one single-value entry or as N chunk
//!   entries (`<key>:chunk:<6 digits>`), never both. Every persist removes
//!   stale entries of the other layout and trailing chunks.
//! - Atom keys never start with [`SYSTEM_KEY_PREFIX`]; that namespace holds
//!   engine-owned entries such as the mirrored event log.
//! - A payload is never labelled compressed unless it is.
//! - `hydrated` flips to true at most once per in-memory atom and never reverts.

mod chunk;
mod codec;
mod compress;
mod driver;
mod envelope;
mod error;
mod fs;
mod hydrate;
mod memory;
mod persister;

pub use chunk::{
    CHUNK_INDEX_WIDTH, CHUNK_MARKER, ChunkDescriptor, MAX_CHUNKS, SYSTEM_KEY_PREFIX, chunk_key,
    chunk_prefix, parse_chunk_key, reassemble, split_chunks, validate_base_key,
};
pub use codec::{cbor_decode, cbor_encode};
pub use compress::{Algorithm, Codec, CompressionError, CompressionRegistry};
pub use driver::{PutOptions, StorageDriver, StorageDriverExt};
pub use envelope::Envelope;
pub use error::{DriverError, PersistError};
pub use fs::FsDriver;
pub use hydrate::{AtomOptions, AtomRecord, FlushReport, HydrationController, LoadMode};
pub use memory::{DriverStats, MemoryDriver};
pub use persister::{PersistConfig, PersistReport, Persister, StoredLayout};

pub fn crate_info() -> &'static str {
    "chronostate-persist v0.1.0"
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crate_loads() {
        assert!(crate_info().contains("persist"));
    }
}
