use std::sync::Arc;

use chronostate_common::Value;
use futures::future::try_join_all;
use serde::{Deserialize, Serialize};

use crate::chunk::{
    ChunkDescriptor, MAX_CHUNKS, chunk_key, chunk_prefix, parse_chunk_key, reassemble,
    split_chunks, validate_base_key,
};
use crate::codec::{cbor_decode, cbor_encode};
use crate::compress::{Algorithm, CompressionRegistry};
use crate::driver::{PutOptions, StorageDriver};
use crate::envelope::Envelope;
use crate::error::PersistError;

/// Size and compression knobs for the persist pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistConfig {
    /// Envelopes larger than this many bytes are stored as chunks.
    pub chunk_threshold: usize,
    /// Size of each chunk in bytes.
    pub chunk_size: usize,
    /// Requested compression; falls back to `none` when unavailable.
    pub compression: Algorithm,
}

impl Default for PersistConfig {
    fn default() -> Self {
        Self {
            chunk_threshold: 10 * 1024 * 1024,
            chunk_size: 1024 * 1024,
            compression: Algorithm::Zstd,
        }
    }
}

/// How a logical key currently sits in storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoredLayout {
    Absent,
    Single,
    Chunked(usize),
}

/// Outcome of one successful persist.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PersistReport {
    /// Envelope size in bytes.
    pub stored_bytes: usize,
    pub algorithm: Algorithm,
    /// `None` for a single entry.
    pub chunks: Option<usize>,
}

/// Serialize, compress, seal and write values; the reverse on load.
pub struct Persister<D> {
    driver: Arc<D>,
    registry: Arc<CompressionRegistry>,
    config: PersistConfig,
}

impl<D> Clone for Persister<D> {
    fn clone(&self) -> Self {
        Self {
            driver: Arc::clone(&self.driver),
            registry: Arc::clone(&self.registry),
            config: self.config.clone(),
        }
    }
}

impl<D: StorageDriver> Persister<D> {
    pub fn new(driver: Arc<D>, config: PersistConfig) -> Self {
        Self::with_registry(driver, config, Arc::new(CompressionRegistry::default()))
    }

    pub fn with_registry(
        driver: Arc<D>,
        config: PersistConfig,
        registry: Arc<CompressionRegistry>,
    ) -> Self {
        Self {
            driver,
            registry,
            config,
        }
    }

    pub fn driver(&self) -> &Arc<D> {
        &self.driver
    }

    pub fn config(&self) -> &PersistConfig {
        &self.config
    }

    /// Write `value` under `key`, choosing single or chunked layout, then
    /// delete whatever the previous layout left behind.
    pub async fn persist(&self, key: &str, value: &Value) -> Result<PersistReport, PersistError> {
        validate_base_key(key)?;
        let raw = cbor_encode(value)?;
        let (algorithm, sealed) = self.seal(key, raw).await?;
        let stored_bytes = sealed.len();
        let driver = self.driver.as_ref();

        if sealed.len() <= self.config.chunk_threshold {
            driver.put(key, sealed, PutOptions::default()).await?;
            let stale = self.chunk_indices(key).await?;
            for (_, chunk) in &stale {
                driver.delete(chunk).await?;
            }
            tracing::debug!(key, stored_bytes, %algorithm, removed_chunks = stale.len(), "persisted single entry");
            return Ok(PersistReport {
                stored_bytes,
                algorithm,
                chunks: None,
            });
        }

        let chunks = split_chunks(&sealed, self.config.chunk_size);
        drop(sealed);
        let count = chunks.len();
        if count > MAX_CHUNKS {
            return Err(PersistError::TooManyChunks {
                count,
                max: MAX_CHUNKS,
            });
        }
        try_join_all(chunks.into_iter().map(|chunk| {
            let target = chunk_key(key, chunk.index);
            async move { driver.put(&target, chunk.data, PutOptions::default()).await }
        }))
        .await?;

        driver.delete(key).await?;
        let stale: Vec<String> = self
            .chunk_indices(key)
            .await?
            .into_iter()
            .filter(|(index, _)| *index >= count)
            .map(|(_, chunk)| chunk)
            .collect();
        for chunk in &stale {
            driver.delete(chunk).await?;
        }
        tracing::debug!(key, stored_bytes, %algorithm, chunks = count, removed_chunks = stale.len(), "persisted chunked entry");
        Ok(PersistReport {
            stored_bytes,
            algorithm,
            chunks: Some(count),
        })
    }

    /// Read back a value. `Ok(None)` when nothing is stored under `key`.
    pub async fn load(&self, key: &str) -> Result<Option<Value>, PersistError> {
        validate_base_key(key)?;
        let driver = self.driver.as_ref();
        let sealed = match driver.get(key).await? {
            Some(bytes) => bytes,
            None => {
                let indices = self.chunk_indices(key).await?;
                if indices.is_empty() {
                    return Ok(None);
                }
                let parts = try_join_all(indices.into_iter().map(|(index, chunk)| async move {
                    match driver.get(&chunk).await? {
                        Some(data) => Ok(ChunkDescriptor { index, data }),
                        None => Err(PersistError::MissingChunk {
                            key: key.to_owned(),
                            index,
                        }),
                    }
                }))
                .await?;
                tracing::trace!(key, chunks = parts.len(), "chunks fetched");
                reassemble(key, parts)?
            }
        };
        self.unseal(key, sealed).await.map(Some)
    }

    /// Delete both layouts of `key`.
    pub async fn remove(&self, key: &str) -> Result<(), PersistError> {
        validate_base_key(key)?;
        let driver = self.driver.as_ref();
        driver.delete(key).await?;
        for (_, chunk) in self.chunk_indices(key).await? {
            driver.delete(&chunk).await?;
        }
        Ok(())
    }

    pub async fn layout(&self, key: &str) -> Result<StoredLayout, PersistError> {
        validate_base_key(key)?;
        if self.driver.has(key).await? {
            return Ok(StoredLayout::Single);
        }
        let chunks = self.chunk_indices(key).await?.len();
        Ok(if chunks == 0 {
            StoredLayout::Absent
        } else {
            StoredLayout::Chunked(chunks)
        })
    }

    /// Stored chunk keys of `key`, sorted by index.
    async fn chunk_indices(&self, key: &str) -> Result<Vec<(usize, String)>, PersistError> {
        let mut found: Vec<(usize, String)> = self
            .driver
            .keys(&chunk_prefix(key))
            .await?
            .into_iter()
            .filter_map(|stored| {
                let index = parse_chunk_key(&stored).and_then(|(base, i)| (base == key).then_some(i));
                index.map(|i| (i, stored))
            })
            .collect();
        found.sort_by_key(|(index, _)| *index);
        Ok(found)
    }

    /// Compression runs on the blocking pool; payloads can be large.
    async fn seal(&self, key: &str, raw: Vec<u8>) -> Result<(Algorithm, Vec<u8>), PersistError> {
        let registry = Arc::clone(&self.registry);
        let requested = self.config.compression;
        tokio::task::spawn_blocking(move || {
            let (algorithm, payload) = registry.compress(&raw, requested);
            (algorithm, Envelope::seal(&raw, algorithm, &payload))
        })
        .await
        .map_err(|e| PersistError::Task {
            key: key.to_owned(),
            reason: e.to_string(),
        })
    }

    async fn unseal(&self, key: &str, sealed: Vec<u8>) -> Result<Value, PersistError> {
        let registry = Arc::clone(&self.registry);
        let owned_key = key.to_owned();
        tokio::task::spawn_blocking(move || {
            let envelope = Envelope::open(&owned_key, &sealed)?;
            let raw = registry.decompress(envelope.payload, envelope.algorithm)?;
            envelope.verify(&owned_key, &raw)?;
            cbor_decode::<Value>(&raw).map_err(|e| PersistError::corrupt(&owned_key, e.to_string()))
        })
        .await
        .map_err(|e| PersistError::Task {
            key: key.to_owned(),
            reason: e.to_string(),
        })?
    }
}
