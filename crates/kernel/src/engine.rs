use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use chronostate_common::Value;
use chronostate_patch::{Patch, PatchError, apply};
use chronostate_persist::{
    AtomOptions, AtomRecord, FlushReport, HydrationController, MemoryDriver, PersistError,
    PersistReport, StorageDriver,
};
use chronostate_sync::{ReducerRegistry, SyncError, WorkerHandle, spawn_worker};
use chronostate_timeline::{
    Event, EventLog, NewEvent, ReconstructOptions, Reconstruction, TimelineError,
};
use tracing::Instrument;

use crate::config::{ConfigError, EngineConfig};

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Persist(#[from] PersistError),
    #[error(transparent)]
    Timeline(#[from] TimelineError),
    #[error("patch on {key:?} rejected: {source}")]
    Patch {
        key: String,
        #[source]
        source: PatchError,
    },
    #[error(transparent)]
    Sync(#[from] SyncError),
    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// The authoritative state holder.
///
/// Every mutation goes through the engine, lands in the hydrated value map,
/// is persisted through the shared driver, and is recorded as one event.
/// Reconstruction reads back from the same log.
pub struct Engine<D: StorageDriver = MemoryDriver> {
    hydration: HydrationController<D>,
    log: EventLog<D>,
    config: EngineConfig,
}

impl Engine {
    /// In-memory engine with default configuration.
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryDriver::new()), EngineConfig::default())
    }
}

impl<D: StorageDriver> Engine<D> {
    pub fn new(driver: Arc<D>, config: EngineConfig) -> Self {
        let hydration = HydrationController::new(Arc::clone(&driver), config.persist.clone());
        let log = EventLog::with_driver(config.event_log.clone(), driver);
        Self { hydration, log, config }
    }

    /// Open over an existing store. With `persist_events` set, the event log
    /// is rebuilt from the mirrored events; otherwise it starts empty.
    pub async fn open(driver: Arc<D>, config: EngineConfig) -> Result<Self, EngineError> {
        config.validate()?;
        let hydration = HydrationController::new(Arc::clone(&driver), config.persist.clone());
        let log = if config.event_log.persist_events {
            EventLog::restore(driver, config.event_log.clone()).await?
        } else {
            EventLog::with_driver(config.event_log.clone(), driver)
        };
        tracing::info!(latest_seq = log.latest_seq(), retained = log.retained(), "engine opened");
        Ok(Self { hydration, log, config })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn events(&self) -> &EventLog<D> {
        &self.log
    }

    pub fn hydration(&self) -> &HydrationController<D> {
        &self.hydration
    }

    /// Register an atom. An eager atom that hydrates here logs `Hydrated`.
    pub async fn declare(&mut self, key: &str, options: AtomOptions) -> Result<AtomRecord, EngineError> {
        let was_hydrated = self.is_hydrated(key);
        let record = self.hydration.declare(key, options).await?;
        if record.hydrated && !was_hydrated {
            self.log_hydrated(key).await?;
        }
        Ok(record)
    }

    /// Current value of `key`, hydrating it on first access.
    pub async fn get(&mut self, key: &str) -> Result<Value, EngineError> {
        let was_hydrated = self.is_hydrated(key);
        let value = self.hydration.read(key).await?;
        if !was_hydrated {
            self.log_hydrated(key).await?;
        }
        Ok(value)
    }

    pub fn peek(&self, key: &str) -> Option<&Value> {
        self.hydration.peek(key)
    }

    /// Replace the value. Storage is written in the background.
    pub async fn set(&mut self, key: &str, value: impl Into<Value>) -> Result<Event, EngineError> {
        let value = value.into();
        self.hydration.write(key, value.clone())?;
        Ok(self.log.log(NewEvent::value_set(key, value)).await?)
    }

    /// Replace the value and wait for storage to hold it.
    pub async fn set_persisted(
        &mut self,
        key: &str,
        value: impl Into<Value>,
    ) -> Result<(Event, PersistReport), EngineError> {
        let value = value.into();
        let report = self.hydration.write_persisted(key, value.clone()).await?;
        let event = self.log.log(NewEvent::value_set(key, value)).await?;
        Ok((event, report))
    }

    /// Apply `ops` to the current value. A key with nothing stored patches
    /// from `Null`. A rejected patch leaves the value and the log untouched.
    pub async fn patch(&mut self, key: &str, ops: Patch) -> Result<Event, EngineError> {
        let current = match self.get(key).await {
            Ok(value) => value,
            Err(EngineError::Persist(PersistError::NotFound { .. })) => Value::Null,
            Err(err) => return Err(err),
        };
        let next = apply(&current, &ops).map_err(|source| EngineError::Patch {
            key: key.to_owned(),
            source,
        })?;
        self.hydration.write(key, next)?;
        Ok(self.log.log(NewEvent::value_patched(key, ops)).await?)
    }

    pub async fn remove(&mut self, key: &str) -> Result<Event, EngineError> {
        self.hydration.delete(key).await?;
        Ok(self.log.log(NewEvent::value_deleted(key)).await?)
    }

    /// Record a named action. State is not touched.
    pub async fn dispatch(
        &mut self,
        action: &str,
        payload: Value,
        target: Option<&str>,
    ) -> Result<Event, EngineError> {
        let mut new = NewEvent::dispatched(action, payload);
        if let Some(key) = target {
            new = new.with_target(key);
        }
        Ok(self.log.log(new).await?)
    }

    /// Run `body` between `TransactionBegin` and `TransactionCommit` markers.
    ///
    /// Mutations made by `body` are not rolled back on failure; a failed body
    /// leaves the begin marker without a matching commit.
    pub async fn transaction<T>(
        &mut self,
        label: &str,
        body: impl AsyncFnOnce(&mut Self) -> Result<T, EngineError>,
    ) -> Result<T, EngineError> {
        let begin = self.log.log(NewEvent::transaction_begin(label)).await?;
        let span = tracing::debug_span!("transaction", label, begin = begin.seq);
        match body(self).instrument(span).await {
            Ok(out) => {
                self.log.log(NewEvent::transaction_commit(label)).await?;
                Ok(out)
            }
            Err(err) => {
                tracing::warn!(label, begin = begin.seq, %err, "transaction body failed");
                Err(err)
            }
        }
    }

    /// Start a reducer worker seeded with the current value of `key`.
    pub async fn spawn_worker(
        &mut self,
        key: &str,
        registry: ReducerRegistry,
    ) -> Result<WorkerHandle, EngineError> {
        let initial = self.get(key).await?;
        Ok(spawn_worker(registry, initial, self.config.worker.clone()))
    }

    /// Run `action` on `worker` and fold its delta into `key`.
    ///
    /// Logs `Dispatched` for the action, then `ValuePatched` with the delta
    /// ops when the reducer changed anything.
    pub async fn dispatch_to_worker(
        &mut self,
        worker: &mut WorkerHandle,
        key: &str,
        action: &str,
        payload: Value,
    ) -> Result<Option<Event>, EngineError> {
        self.dispatch(action, payload.clone(), Some(key)).await?;
        let delta = worker.dispatch(action, payload).await?;
        if delta.ops.is_empty() {
            return Ok(None);
        }
        self.patch(key, delta.ops).await.map(Some)
    }

    pub fn reconstruct(&self, options: &ReconstructOptions) -> Result<Reconstruction, EngineError> {
        Ok(self.log.reconstruct(options)?)
    }

    pub fn state_at(
        &self,
        seq: u64,
        keys: Option<BTreeSet<String>>,
    ) -> Result<BTreeMap<String, Value>, EngineError> {
        Ok(self.log.get_state_at(seq, keys)?)
    }

    pub fn changes_between(
        &self,
        from: u64,
        to: u64,
        keys: Option<&BTreeSet<String>>,
    ) -> Result<BTreeMap<String, Patch>, EngineError> {
        Ok(self.log.changes_between(from, to, keys)?)
    }

    /// Await outstanding background writes.
    pub async fn flush(&mut self) -> FlushReport {
        let report = self.hydration.flush().await;
        if report.failed > 0 {
            tracing::warn!(awaited = report.awaited, failed = report.failed, "flush finished with failures");
        }
        report
    }

    fn is_hydrated(&self, key: &str) -> bool {
        self.hydration.record(key).is_some_and(|r| r.hydrated)
    }

    async fn log_hydrated(&mut self, key: &str) -> Result<(), EngineError> {
        if let Some(value) = self.hydration.peek(key).cloned() {
            self.log.log(NewEvent::hydrated(key, value)).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chronostate_common::path;
    use chronostate_patch::PatchOp;
    use chronostate_timeline::{EventQuery, EventType};

    fn types(engine: &Engine) -> Vec<EventType> {
        engine
            .events()
            .get_events(&EventQuery::default())
            .into_iter()
            .map(|e| e.event_type())
            .collect()
    }

    #[tokio::test]
    async fn mutations_are_logged_once_each() {
        let mut engine = Engine::in_memory();
        engine.set("count", 1i64).await.unwrap();
        engine
            .patch("count", vec![PatchOp::set(chronostate_common::Path::root(), 2i64)])
            .await
            .unwrap();
        engine.dispatch("ping", Value::Null, None).await.unwrap();
        engine.remove("count").await.unwrap();
        assert_eq!(
            types(&engine),
            vec![
                EventType::ValueSet,
                EventType::ValuePatched,
                EventType::Dispatched,
                EventType::ValueDeleted,
            ]
        );
        assert_eq!(engine.peek("count"), None);
    }

    #[tokio::test]
    async fn first_get_logs_hydrated() {
        let driver = Arc::new(MemoryDriver::new());
        {
            let mut writer = Engine::new(Arc::clone(&driver), EngineConfig::default());
            writer.set_persisted("user", "ada").await.unwrap();
        }
        let mut engine = Engine::new(driver, EngineConfig::default());
        assert_eq!(engine.get("user").await.unwrap(), Value::from("ada"));
        assert_eq!(engine.get("user").await.unwrap(), Value::from("ada"));
        assert_eq!(types(&engine), vec![EventType::Hydrated]);
        assert_eq!(
            engine.state_at(1, None).unwrap().get("user"),
            Some(&Value::from("ada"))
        );
    }

    #[tokio::test]
    async fn eager_declare_logs_hydrated() {
        let mut engine = Engine::in_memory();
        let record = engine
            .declare("flags", AtomOptions::eager().with_initial(Value::map()))
            .await
            .unwrap();
        assert!(record.hydrated);
        assert_eq!(types(&engine), vec![EventType::Hydrated]);
    }

    #[tokio::test]
    async fn missing_key_without_initial_is_not_found() {
        let mut engine = Engine::in_memory();
        assert!(matches!(
            engine.get("nothing").await,
            Err(EngineError::Persist(PersistError::NotFound { .. }))
        ));
        assert!(types(&engine).is_empty());
    }

    #[tokio::test]
    async fn rejected_patch_changes_nothing() {
        let mut engine = Engine::in_memory();
        engine.set("list", Value::list()).await.unwrap();
        let err = engine
            .patch("list", vec![PatchOp::set(path![5usize], 1i64)])
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Patch { .. }));
        assert_eq!(engine.peek("list"), Some(&Value::list()));
        assert_eq!(engine.events().latest_seq(), 1);
    }

    #[tokio::test]
    async fn transaction_brackets_body() {
        let mut engine = Engine::in_memory();
        let out = engine
            .transaction("seed", async |engine| {
                engine.set("a", 1i64).await?;
                engine.set("b", 2i64).await?;
                Ok(7)
            })
            .await
            .unwrap();
        assert_eq!(out, 7);
        assert_eq!(
            types(&engine),
            vec![
                EventType::TransactionBegin,
                EventType::ValueSet,
                EventType::ValueSet,
                EventType::TransactionCommit,
            ]
        );
    }

    #[tokio::test]
    async fn failed_transaction_has_no_commit() {
        let mut engine = Engine::in_memory();
        let result: Result<(), _> = engine
            .transaction("broken", async |engine| {
                engine.set("a", 1i64).await?;
                engine.get("missing").await?;
                Ok(())
            })
            .await;
        assert!(result.is_err());
        assert_eq!(
            types(&engine),
            vec![EventType::TransactionBegin, EventType::ValueSet]
        );
    }

    #[tokio::test]
    async fn patch_on_absent_key_starts_from_null() {
        let mut engine = Engine::in_memory();
        engine
            .patch("fresh", vec![PatchOp::set(chronostate_common::Path::root(), Value::map())])
            .await
            .unwrap();
        assert_eq!(engine.peek("fresh"), Some(&Value::map()));
    }

    #[tokio::test]
    async fn worker_deltas_are_logged_as_patches() {
        let mut engine = Engine::in_memory();
        engine.set("counter", 0i64).await.unwrap();
        let mut registry = ReducerRegistry::new();
        registry.register("add", |state: &Value, payload: &Value| {
            let by = payload.as_int().ok_or("payload must be an int")?;
            Ok(Value::Int(state.as_int().unwrap_or(0) + by))
        });
        let mut worker = engine.spawn_worker("counter", registry).await.unwrap();

        engine
            .dispatch_to_worker(&mut worker, "counter", "add", Value::Int(5))
            .await
            .unwrap();
        let unchanged = engine
            .dispatch_to_worker(&mut worker, "counter", "add", Value::Int(0))
            .await
            .unwrap();
        assert!(unchanged.is_none());
        assert_eq!(engine.peek("counter"), Some(&Value::Int(5)));
        assert_eq!(worker.snapshot(), &Value::Int(5));
        assert_eq!(
            types(&engine),
            vec![
                EventType::ValueSet,
                EventType::Dispatched,
                EventType::ValuePatched,
                EventType::Dispatched,
            ]
        );
        worker.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn open_rejects_invalid_config() {
        let mut config = EngineConfig::default();
        config.event_log.snapshot_interval = 0;
        let opened = Engine::open(Arc::new(MemoryDriver::new()), config).await;
        assert!(matches!(opened, Err(EngineError::Config(_))));
    }
}
