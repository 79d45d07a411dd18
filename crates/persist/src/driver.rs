//! The storage capability every backend provides.

use std::collections::BTreeMap;
use std::future::Future;
use std::time::Duration;

use futures::stream::{self, BoxStream, StreamExt};
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::codec::{cbor_decode, cbor_encode};
use crate::error::DriverError;

/// Per-write options.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PutOptions {
    /// Entry reads as absent once this much time has passed since the write.
    pub ttl: Option<Duration>,
    /// Free-form annotations stored next to the bytes.
    pub metadata: BTreeMap<String, String>,
}

impl PutOptions {
    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            ttl: Some(ttl),
            ..Self::default()
        }
    }
}

/// Asynchronous key/bytes storage.
///
/// Keys are opaque strings. Deleting a missing key is not an error. Expired
/// entries behave exactly like absent ones for `get`, `has` and `keys`.
pub trait StorageDriver: Send + Sync + 'static {
    fn put(
        &self,
        key: &str,
        data: Vec<u8>,
        options: PutOptions,
    ) -> impl Future<Output = Result<(), DriverError>> + Send;

    fn get(&self, key: &str) -> impl Future<Output = Result<Option<Vec<u8>>, DriverError>> + Send;

    fn delete(&self, key: &str) -> impl Future<Output = Result<(), DriverError>> + Send;

    fn has(&self, key: &str) -> impl Future<Output = Result<bool, DriverError>> + Send;

    /// Live keys starting with `prefix`, in ascending order.
    fn keys(&self, prefix: &str) -> impl Future<Output = Result<Vec<String>, DriverError>> + Send;

    fn clear(&self) -> impl Future<Output = Result<(), DriverError>> + Send;

    /// Read an entry as a stream of blocks of at most `block_size` bytes.
    /// An absent key yields an empty stream.
    fn stream_read<'a>(
        &'a self,
        key: &'a str,
        block_size: usize,
    ) -> BoxStream<'a, Result<Vec<u8>, DriverError>> {
        let block_size = block_size.max(1);
        stream::once(self.get(key))
            .flat_map(move |result| {
                let blocks: Vec<Result<Vec<u8>, DriverError>> = match result {
                    Ok(Some(data)) => data.chunks(block_size).map(|b| Ok(b.to_vec())).collect(),
                    Ok(None) => Vec::new(),
                    Err(err) => vec![Err(err)],
                };
                stream::iter(blocks)
            })
            .boxed()
    }

    /// Physically drop expired entries. Returns how many were removed.
    fn compact(&self) -> impl Future<Output = Result<usize, DriverError>> + Send {
        async { Ok(0) }
    }
}

/// Typed convenience on top of any driver: values go through CBOR.
pub trait StorageDriverExt: StorageDriver {
    fn put_value<T: Serialize + ?Sized>(
        &self,
        key: &str,
        value: &T,
        options: PutOptions,
    ) -> impl Future<Output = Result<(), DriverError>> + Send {
        let encoded = cbor_encode(value);
        async move { self.put(key, encoded?, options).await }
    }

    fn get_value<T: DeserializeOwned + Send>(
        &self,
        key: &str,
    ) -> impl Future<Output = Result<Option<T>, DriverError>> + Send {
        async move {
            match self.get(key).await? {
                Some(bytes) => Ok(Some(cbor_decode(&bytes)?)),
                None => Ok(None),
            }
        }
    }
}

impl<D: StorageDriver> StorageDriverExt for D {}
