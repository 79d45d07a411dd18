//! Lazy hydration of persisted atoms.
//!
//! An atom is a named value backed by a persistence key. Eager atoms load on
//! declaration; lazy ones load on their first asynchronous read. A write marks
//! the atom hydrated immediately; the value it carries is the truth from then
//! on, whatever storage later says.
//!
//! Background persists of one key run one after another, and a persist that
//! completes after a newer write or a delete of the same key is ignored.

use std::collections::BTreeMap;
use std::ops::AddAssign;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use chronostate_common::Value;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;

use crate::chunk::validate_base_key;
use crate::driver::StorageDriver;
use crate::error::PersistError;
use crate::persister::{PersistConfig, PersistReport, Persister};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoadMode {
    Eager,
    #[default]
    Lazy,
}

/// Declaration options for one atom.
#[derive(Debug, Clone, Default)]
pub struct AtomOptions {
    pub mode: LoadMode,
    /// Used instead of failing when nothing is persisted yet.
    pub initial: Option<Value>,
}

impl AtomOptions {
    pub fn eager() -> Self {
        Self {
            mode: LoadMode::Eager,
            initial: None,
        }
    }

    pub fn lazy() -> Self {
        Self::default()
    }

    pub fn with_initial(mut self, initial: impl Into<Value>) -> Self {
        self.initial = Some(initial.into());
        self
    }
}

/// Hydration state of one atom, as reported to callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AtomRecord {
    pub key: String,
    pub mode: LoadMode,
    pub hydrated: bool,
    /// Storage holds the current value (loaded from or written to it).
    pub persisted: bool,
    /// Envelope size of the last completed persist.
    pub size_bytes: Option<usize>,
    /// Bumped by every write and delete; persists report against it.
    #[serde(skip)]
    generation: u64,
}

impl AtomRecord {
    fn new(key: &str, mode: LoadMode) -> Self {
        Self {
            key: key.to_owned(),
            mode,
            hydrated: false,
            persisted: false,
            size_bytes: None,
            generation: 0,
        }
    }
}

/// Outcome of awaiting background persists.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushReport {
    pub awaited: usize,
    pub failed: usize,
}

impl AddAssign for FlushReport {
    fn add_assign(&mut self, other: Self) {
        self.awaited += other.awaited;
        self.failed += other.failed;
    }
}

type Records = Arc<Mutex<BTreeMap<String, AtomRecord>>>;

/// Tracks atoms, their in-memory values, and outstanding background writes.
pub struct HydrationController<D> {
    persister: Persister<D>,
    records: Records,
    values: BTreeMap<String, Value>,
    initials: BTreeMap<String, Value>,
    /// Newest background persist per key; each one awaits its predecessor.
    pending: BTreeMap<String, JoinHandle<FlushReport>>,
    /// Persists already awaited outside [`Self::flush`], not yet reported.
    settled: FlushReport,
    failed_persists: Arc<AtomicUsize>,
}

impl<D: StorageDriver> HydrationController<D> {
    pub fn new(driver: Arc<D>, config: PersistConfig) -> Self {
        Self::from_persister(Persister::new(driver, config))
    }

    pub fn from_persister(persister: Persister<D>) -> Self {
        Self {
            persister,
            records: Arc::default(),
            values: BTreeMap::new(),
            initials: BTreeMap::new(),
            pending: BTreeMap::new(),
            settled: FlushReport::default(),
            failed_persists: Arc::default(),
        }
    }

    pub fn persister(&self) -> &Persister<D> {
        &self.persister
    }

    /// Register an atom. Eager atoms are loaded before this returns.
    /// Declaring an existing key again returns its current record.
    pub async fn declare(&mut self, key: &str, options: AtomOptions) -> Result<AtomRecord, PersistError> {
        validate_base_key(key)?;
        if let Some(existing) = self.record(key) {
            tracing::trace!(key, "atom already declared");
            return Ok(existing);
        }
        self.records
            .lock()
            .insert(key.to_owned(), AtomRecord::new(key, options.mode));
        if let Some(initial) = options.initial {
            self.initials.insert(key.to_owned(), initial);
        }
        tracing::debug!(key, mode = ?options.mode, "atom declared");
        if options.mode == LoadMode::Eager {
            self.hydrate(key).await?;
        }
        self.record(key).ok_or_else(|| PersistError::NotFound { key: key.to_owned() })
    }

    /// The in-memory value, without touching storage. `None` until hydrated.
    pub fn peek(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    /// Current value, loading it from storage on first access.
    pub async fn read(&mut self, key: &str) -> Result<Value, PersistError> {
        validate_base_key(key)?;
        let hydrated = self
            .records
            .lock()
            .entry(key.to_owned())
            .or_insert_with(|| AtomRecord::new(key, LoadMode::Lazy))
            .hydrated;
        if hydrated {
            return self
                .values
                .get(key)
                .cloned()
                .ok_or_else(|| PersistError::NotFound { key: key.to_owned() });
        }
        self.hydrate(key).await
    }

    async fn hydrate(&mut self, key: &str) -> Result<Value, PersistError> {
        let loaded = self.persister.load(key).await?;
        let persisted = loaded.is_some();
        let value = match loaded.or_else(|| self.initials.get(key).cloned()) {
            Some(value) => value,
            None => return Err(PersistError::NotFound { key: key.to_owned() }),
        };
        {
            let mut records = self.records.lock();
            let record = records
                .entry(key.to_owned())
                .or_insert_with(|| AtomRecord::new(key, LoadMode::Lazy));
            record.hydrated = true;
            record.persisted = persisted;
        }
        self.values.insert(key.to_owned(), value.clone());
        tracing::debug!(key, from_storage = persisted, "atom hydrated");
        Ok(value)
    }

    /// Set the value and persist it in the background. Persist failures are
    /// logged, counted, and otherwise swallowed; see [`Self::flush`].
    pub fn write(&mut self, key: &str, value: Value) -> Result<(), PersistError> {
        validate_base_key(key)?;
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| PersistError::NoRuntime)?;
        let generation = self.mark_written(key, value.clone());

        let persister = self.persister.clone();
        let records = Arc::clone(&self.records);
        let failed = Arc::clone(&self.failed_persists);
        let previous = self.pending.remove(key);
        let owned_key = key.to_owned();
        let task = runtime.spawn(async move {
            let key = owned_key;
            let mut report = match previous {
                Some(task) => join_report(&key, task).await,
                None => FlushReport::default(),
            };
            report.awaited += 1;
            match persister.persist(&key, &value).await {
                Ok(stored) => record_persisted(&records, &key, generation, &stored),
                Err(err) => {
                    failed.fetch_add(1, Ordering::Relaxed);
                    report.failed += 1;
                    tracing::error!(key = %key, %err, "background persist failed");
                }
            }
            report
        });
        self.pending.insert(key.to_owned(), task);
        Ok(())
    }

    /// Set the value and wait for the persist, surfacing its error. The
    /// in-memory value is updated even when persisting fails.
    pub async fn write_persisted(&mut self, key: &str, value: Value) -> Result<PersistReport, PersistError> {
        validate_base_key(key)?;
        self.settle(key).await;
        let generation = self.mark_written(key, value.clone());
        let report = self.persister.persist(key, &value).await?;
        record_persisted(&self.records, key, generation, &report);
        Ok(report)
    }

    /// Drop the value from memory and storage. The atom stays hydrated.
    /// Background persists of `key` are awaited first so none can land after
    /// the delete.
    pub async fn delete(&mut self, key: &str) -> Result<(), PersistError> {
        validate_base_key(key)?;
        self.settle(key).await;
        self.values.remove(key);
        {
            let mut records = self.records.lock();
            let record = records
                .entry(key.to_owned())
                .or_insert_with(|| AtomRecord::new(key, LoadMode::Lazy));
            record.hydrated = true;
            record.persisted = false;
            record.size_bytes = None;
            record.generation += 1;
        }
        self.persister.remove(key).await
    }

    /// Await every outstanding background persist. The report also counts
    /// persists that a delete or an awaited write already waited for.
    pub async fn flush(&mut self) -> FlushReport {
        let mut report = std::mem::take(&mut self.settled);
        for (key, task) in std::mem::take(&mut self.pending) {
            report += join_report(&key, task).await;
        }
        report
    }

    pub fn pending_persists(&self) -> usize {
        self.pending.values().filter(|task| !task.is_finished()).count()
    }

    /// Background persists that have failed since construction.
    pub fn failed_persists(&self) -> usize {
        self.failed_persists.load(Ordering::Relaxed)
    }

    pub fn record(&self, key: &str) -> Option<AtomRecord> {
        self.records.lock().get(key).cloned()
    }

    pub fn records(&self) -> Vec<AtomRecord> {
        self.records.lock().values().cloned().collect()
    }

    /// Every hydrated value, by key.
    pub fn values(&self) -> &BTreeMap<String, Value> {
        &self.values
    }

    /// Returns the write generation the persist of `value` must report.
    fn mark_written(&mut self, key: &str, value: Value) -> u64 {
        let generation = {
            let mut records = self.records.lock();
            let record = records
                .entry(key.to_owned())
                .or_insert_with(|| AtomRecord::new(key, LoadMode::Lazy));
            record.hydrated = true;
            record.persisted = false;
            record.generation += 1;
            record.generation
        };
        self.values.insert(key.to_owned(), value);
        generation
    }

    async fn settle(&mut self, key: &str) {
        if let Some(task) = self.pending.remove(key) {
            let report = join_report(key, task).await;
            self.settled += report;
        }
    }
}

async fn join_report(key: &str, task: JoinHandle<FlushReport>) -> FlushReport {
    match task.await {
        Ok(report) => report,
        Err(err) => {
            tracing::error!(key, %err, "background persist task aborted");
            FlushReport { awaited: 1, failed: 1 }
        }
    }
}

fn record_persisted(records: &Records, key: &str, generation: u64, report: &PersistReport) {
    let mut records = records.lock();
    let Some(record) = records.get_mut(key) else {
        return;
    };
    if record.generation != generation {
        tracing::trace!(key, generation, current = record.generation, "stale persist ignored");
        return;
    }
    record.persisted = true;
    record.size_bytes = Some(report.stored_bytes);
}
