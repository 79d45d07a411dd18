//! Chunked, compressed values through the file-backed driver.

use std::sync::Arc;

use chronostate_common::Value;
use chronostate_persist::{
    Algorithm, AtomOptions, FsDriver, HydrationController, PersistConfig, Persister, StorageDriver,
    StoredLayout,
};

fn big_document() -> Value {
    let rows: Vec<Value> = (0..2000)
        .map(|i| Value::from(row_label(i)))
        .collect();
    Value::List(rows)
}

fn row_label(i: i64) -> String {
    format!("row-{i:05}-{}", "x".repeat((i % 13) as usize))
}

#[tokio::test]
async fn chunked_value_survives_reopen() {
    let tmp = tempfile::tempdir().unwrap();
    let config = PersistConfig {
        chunk_threshold: 4096,
        chunk_size: 4096,
        compression: Algorithm::None,
    };
    let value = big_document();

    {
        let driver = Arc::new(FsDriver::open(tmp.path()).await.unwrap());
        let persister = Persister::new(driver, config.clone());
        let report = persister.persist("table", &value).await.unwrap();
        assert!(report.chunks.unwrap() > 1);
    }

    let driver = Arc::new(FsDriver::open(tmp.path()).await.unwrap());
    let persister = Persister::new(Arc::clone(&driver), config);
    assert!(matches!(persister.layout("table").await.unwrap(), StoredLayout::Chunked(_)));
    assert_eq!(persister.load("table").await.unwrap(), Some(value));
    assert!(driver.keys("table:chunk:").await.unwrap().len() > 1);
}

#[tokio::test]
async fn hydration_over_fs_driver() {
    let tmp = tempfile::tempdir().unwrap();
    let driver = Arc::new(FsDriver::open(tmp.path()).await.unwrap());

    let mut first = HydrationController::new(Arc::clone(&driver), PersistConfig::default());
    first.write("doc", big_document()).unwrap();
    assert_eq!(first.flush().await.failed, 0);

    let mut second = HydrationController::new(driver, PersistConfig::default());
    second.declare("doc", AtomOptions::lazy()).await.unwrap();
    assert!(second.peek("doc").is_none());
    assert_eq!(second.read("doc").await.unwrap(), big_document());
}

#[cfg(feature = "lz4")]
#[tokio::test]
async fn lz4_label_recorded_and_read_back() {
    let tmp = tempfile::tempdir().unwrap();
    let driver = Arc::new(FsDriver::open(tmp.path()).await.unwrap());
    let config = PersistConfig {
        compression: Algorithm::Lz4,
        ..PersistConfig::default()
    };
    let persister = Persister::new(driver, config);
    let report = persister.persist("doc", &big_document()).await.unwrap();
    assert_eq!(report.algorithm, Algorithm::Lz4);
    assert_eq!(persister.load("doc").await.unwrap(), Some(big_document()));
}
