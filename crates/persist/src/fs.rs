//! File-backed driver.
//!
//! One file per key inside the root directory. The file name is the key
//! hex-encoded, so any key maps to a portable name. File layout:
//! ```text
//! [header_len: u32 LE][CBOR FileHeader][raw bytes]
//! ```
//! Writes go to a uniquely named `.tmp` sibling and are renamed into place,
//! so concurrent writers of one key never share a temp file. Listing decodes
//! file names first and reads only the header of matching entries; an entry
//! removed mid-listing is skipped.

use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use tokio::io::AsyncReadExt;

use crate::codec::{cbor_decode, cbor_encode};
use crate::driver::{PutOptions, StorageDriver};
use crate::error::DriverError;

const ENTRY_EXT: &str = "entry";
const TMP_EXT: &str = "tmp";

static TMP_COUNTER: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Clone, Serialize, Deserialize)]
struct FileHeader {
    expires_at_ms: Option<i64>,
    metadata: BTreeMap<String, String>,
}

impl FileHeader {
    fn is_expired(&self, now_ms: i64) -> bool {
        self.expires_at_ms.is_some_and(|at| at <= now_ms)
    }
}

/// Driver storing each entry as a file under `root`.
#[derive(Debug, Clone)]
pub struct FsDriver {
    root: PathBuf,
}

impl FsDriver {
    /// Open (creating if needed) a store rooted at `path`.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, DriverError> {
        let root = path.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&root).await?;
        tracing::debug!(root = %root.display(), "fs driver opened");
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn entry_path(&self, key: &str) -> PathBuf {
        self.root.join(format!("{}.{ENTRY_EXT}", hex_encode(key)))
    }

    fn tmp_path(&self, key: &str) -> PathBuf {
        let n = TMP_COUNTER.fetch_add(1, Ordering::Relaxed);
        self.root
            .join(format!("{}.{}-{n}.{TMP_EXT}", hex_encode(key), std::process::id()))
    }

    async fn read_entry(&self, key: &str) -> Result<Option<(FileHeader, Vec<u8>)>, DriverError> {
        let bytes = match tokio::fs::read(self.entry_path(key)).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        let (header, data) = split_file(key, bytes)?;
        if header.is_expired(now_ms()) {
            tracing::trace!(key, "expired entry dropped");
            self.remove_file(key).await?;
            return Ok(None);
        }
        Ok(Some((header, data)))
    }

    async fn remove_file(&self, key: &str) -> Result<(), DriverError> {
        match tokio::fs::remove_file(self.entry_path(key)).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    /// Stored keys starting with `prefix`, decoded from file names only.
    async fn stored_keys(&self, prefix: &str) -> Result<Vec<(String, PathBuf)>, DriverError> {
        let mut found = Vec::new();
        let mut dir = tokio::fs::read_dir(&self.root).await?;
        while let Some(dirent) = dir.next_entry().await? {
            let path = dirent.path();
            if path.extension().and_then(|e| e.to_str()) != Some(ENTRY_EXT) {
                continue;
            }
            let Some(key) = path
                .file_stem()
                .and_then(|stem| stem.to_str())
                .and_then(hex_decode)
            else {
                tracing::warn!(path = %path.display(), "skipping file with undecodable name");
                continue;
            };
            if key.starts_with(prefix) {
                found.push((key, path));
            }
        }
        found.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(found)
    }

    /// Keys under `prefix` with their headers, expired ones included.
    async fn scan(&self, prefix: &str) -> Result<Vec<(String, FileHeader)>, DriverError> {
        let mut found = Vec::new();
        for (key, path) in self.stored_keys(prefix).await? {
            match read_header(&path, &key).await? {
                Some(header) => found.push((key, header)),
                None => tracing::trace!(key = %key, "entry vanished during scan"),
            }
        }
        Ok(found)
    }
}

/// Read the length prefix and header of one entry file. `None` when the file
/// no longer exists.
async fn read_header(path: &Path, key: &str) -> Result<Option<FileHeader>, DriverError> {
    let mut file = match tokio::fs::File::open(path).await {
        Ok(file) => file,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err.into()),
    };
    let file_len = file.metadata().await?.len();
    let mut len_bytes = [0u8; 4];
    file.read_exact(&mut len_bytes)
        .await
        .map_err(|err| eof_as_malformed(err, key, "truncated header length"))?;
    let header_len = u64::from(u32::from_le_bytes(len_bytes));
    if 4 + header_len > file_len {
        return Err(DriverError::Malformed {
            key: key.to_owned(),
            reason: "truncated header".into(),
        });
    }
    let mut header = vec![0; header_len as usize];
    file.read_exact(&mut header)
        .await
        .map_err(|err| eof_as_malformed(err, key, "truncated header"))?;
    Ok(Some(cbor_decode(&header)?))
}

fn eof_as_malformed(err: std::io::Error, key: &str, reason: &str) -> DriverError {
    if err.kind() == ErrorKind::UnexpectedEof {
        DriverError::Malformed {
            key: key.to_owned(),
            reason: reason.to_owned(),
        }
    } else {
        err.into()
    }
}

impl StorageDriver for FsDriver {
    async fn put(&self, key: &str, data: Vec<u8>, options: PutOptions) -> Result<(), DriverError> {
        let header = FileHeader {
            expires_at_ms: options
                .ttl
                .map(|ttl| now_ms().saturating_add(ttl.as_millis().min(i64::MAX as u128) as i64)),
            metadata: options.metadata,
        };
        let header_bytes = cbor_encode(&header)?;
        let header_len = u32::try_from(header_bytes.len()).map_err(|_| DriverError::Malformed {
            key: key.to_owned(),
            reason: "header too large".into(),
        })?;

        let mut file = Vec::with_capacity(4 + header_bytes.len() + data.len());
        file.extend_from_slice(&header_len.to_le_bytes());
        file.extend_from_slice(&header_bytes);
        file.extend_from_slice(&data);

        let target = self.entry_path(key);
        let tmp = self.tmp_path(key);
        tokio::fs::write(&tmp, &file).await?;
        if let Err(err) = tokio::fs::rename(&tmp, &target).await {
            if let Err(cleanup) = tokio::fs::remove_file(&tmp).await {
                tracing::warn!(path = %tmp.display(), error = %cleanup, "temp file left behind");
            }
            return Err(err.into());
        }
        tracing::trace!(key, bytes = data.len(), "entry written");
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, DriverError> {
        Ok(self.read_entry(key).await?.map(|(_, data)| data))
    }

    async fn delete(&self, key: &str) -> Result<(), DriverError> {
        self.remove_file(key).await
    }

    async fn has(&self, key: &str) -> Result<bool, DriverError> {
        Ok(self.read_entry(key).await?.is_some())
    }

    async fn keys(&self, prefix: &str) -> Result<Vec<String>, DriverError> {
        let now = now_ms();
        Ok(self
            .scan(prefix)
            .await?
            .into_iter()
            .filter(|(_, header)| !header.is_expired(now))
            .map(|(key, _)| key)
            .collect())
    }

    async fn clear(&self) -> Result<(), DriverError> {
        for (key, _) in self.stored_keys("").await? {
            self.remove_file(&key).await?;
        }
        Ok(())
    }

    async fn compact(&self) -> Result<usize, DriverError> {
        let now = now_ms();
        let mut removed = 0;
        for (key, header) in self.scan("").await? {
            if header.is_expired(now) {
                self.remove_file(&key).await?;
                removed += 1;
            }
        }
        tracing::debug!(removed, root = %self.root.display(), "fs driver compacted");
        Ok(removed)
    }
}

fn split_file(key: &str, mut bytes: Vec<u8>) -> Result<(FileHeader, Vec<u8>), DriverError> {
    let malformed = |reason: &str| DriverError::Malformed {
        key: key.to_owned(),
        reason: reason.to_owned(),
    };
    let len_bytes: [u8; 4] = bytes
        .get(..4)
        .and_then(|b| b.try_into().ok())
        .ok_or_else(|| malformed("truncated header length"))?;
    let header_end = 4 + u32::from_le_bytes(len_bytes) as usize;
    if bytes.len() < header_end {
        return Err(malformed("truncated header"));
    }
    let header: FileHeader = cbor_decode(&bytes[4..header_end])?;
    let data = bytes.split_off(header_end);
    Ok((header, data))
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

fn hex_encode(key: &str) -> String {
    key.bytes().map(|b| format!("{b:02x}")).collect()
}

fn hex_decode(name: &str) -> Option<String> {
    if name.len() % 2 != 0 {
        return None;
    }
    let bytes = (0..name.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(name.get(i..i + 2)?, 16).ok())
        .collect::<Option<Vec<u8>>>()?;
    String::from_utf8(bytes).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn hex_names_roundtrip() {
        for key in ["", "plain", "a:chunk:000001", "slash/and space", "ünï"] {
            assert_eq!(hex_decode(&hex_encode(key)).as_deref(), Some(key));
        }
        assert_eq!(hex_decode("abc"), None);
        assert_eq!(hex_decode("zz"), None);
    }

    #[tokio::test]
    async fn fs_put_get_survives_reopen() {
        let tmp = tempfile::tempdir().unwrap();
        {
            let driver = FsDriver::open(tmp.path().join("store")).await.unwrap();
            driver.put("todos", vec![1, 2, 3], PutOptions::default()).await.unwrap();
        }
        let driver = FsDriver::open(tmp.path().join("store")).await.unwrap();
        assert_eq!(driver.get("todos").await.unwrap(), Some(vec![1, 2, 3]));
        assert_eq!(driver.keys("").await.unwrap(), vec!["todos"]);
    }

    #[tokio::test]
    async fn fs_keys_prefix_and_delete() {
        let tmp = tempfile::tempdir().unwrap();
        let driver = FsDriver::open(tmp.path()).await.unwrap();
        for key in ["x:chunk:000001", "x:chunk:000000", "x", "y"] {
            driver.put(key, vec![0], PutOptions::default()).await.unwrap();
        }
        assert_eq!(
            driver.keys("x:chunk:").await.unwrap(),
            vec!["x:chunk:000000", "x:chunk:000001"]
        );
        driver.delete("x").await.unwrap();
        driver.delete("never-existed").await.unwrap();
        assert!(!driver.has("x").await.unwrap());
        driver.clear().await.unwrap();
        assert!(driver.keys("").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn fs_ttl_and_compact() {
        let tmp = tempfile::tempdir().unwrap();
        let driver = FsDriver::open(tmp.path()).await.unwrap();
        driver
            .put("gone", vec![1], PutOptions::with_ttl(Duration::from_millis(10)))
            .await
            .unwrap();
        driver.put("stays", vec![2], PutOptions::default()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;

        assert_eq!(driver.keys("").await.unwrap(), vec!["stays"]);
        assert_eq!(driver.compact().await.unwrap(), 1);
        assert_eq!(driver.get("gone").await.unwrap(), None);
    }

    #[tokio::test]
    async fn fs_truncated_file_is_malformed() {
        let tmp = tempfile::tempdir().unwrap();
        let driver = FsDriver::open(tmp.path()).await.unwrap();
        driver.put("k", vec![9; 16], PutOptions::default()).await.unwrap();
        std::fs::write(driver.entry_path("k"), [0xff, 0xff]).unwrap();
        assert!(matches!(
            driver.get("k").await,
            Err(DriverError::Malformed { .. })
        ));
    }

    #[tokio::test]
    async fn fs_listing_reads_only_matching_entries() {
        let tmp = tempfile::tempdir().unwrap();
        let driver = FsDriver::open(tmp.path()).await.unwrap();
        driver.put("a", vec![1], PutOptions::default()).await.unwrap();
        driver.put("a:chunk:000000", vec![2], PutOptions::default()).await.unwrap();
        driver.put("b", vec![3], PutOptions::default()).await.unwrap();
        std::fs::write(driver.entry_path("b"), [0xff, 0xff, 0xff, 0xff, 0x00]).unwrap();

        assert_eq!(driver.keys("a").await.unwrap(), vec!["a", "a:chunk:000000"]);
        assert!(matches!(
            driver.keys("").await,
            Err(DriverError::Malformed { .. })
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn fs_listing_tolerates_concurrent_deletes() {
        let tmp = tempfile::tempdir().unwrap();
        let driver = FsDriver::open(tmp.path()).await.unwrap();
        driver.put("steady", vec![0], PutOptions::default()).await.unwrap();

        let churn = {
            let driver = driver.clone();
            tokio::spawn(async move {
                for i in 0..200 {
                    let key = format!("churn:{}", i % 8);
                    driver.put(&key, vec![1; 64], PutOptions::default()).await?;
                    driver.delete(&key).await?;
                }
                Ok::<_, DriverError>(())
            })
        };
        while !churn.is_finished() {
            let keys = driver.keys("").await.unwrap();
            assert!(keys.iter().any(|k| k == "steady"));
        }
        churn.await.unwrap().unwrap();
        assert_eq!(driver.keys("").await.unwrap(), vec!["steady"]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn fs_concurrent_puts_to_one_key_both_succeed() {
        let tmp = tempfile::tempdir().unwrap();
        let driver = FsDriver::open(tmp.path()).await.unwrap();
        for _ in 0..50 {
            let (first, second) = tokio::join!(
                driver.put("k", vec![1; 256], PutOptions::default()),
                driver.put("k", vec![2; 256], PutOptions::default()),
            );
            first.unwrap();
            second.unwrap();
            let stored = driver.get("k").await.unwrap().unwrap();
            assert!(stored == vec![1; 256] || stored == vec![2; 256]);
        }
        let leftovers = std::fs::read_dir(tmp.path())
            .unwrap()
            .filter(|e| {
                e.as_ref()
                    .unwrap()
                    .path()
                    .extension()
                    .is_some_and(|ext| ext == TMP_EXT)
            })
            .count();
        assert_eq!(leftovers, 0);
    }
}
