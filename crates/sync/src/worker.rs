use chronostate_common::Value;
use chronostate_patch::{DiffOptions, Patch, apply, diff_with};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::error::SyncError;
use crate::registry::ReducerRegistry;

/// Worker channel sizing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Requests that may queue before `dispatch` waits for room.
    pub channel_capacity: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self { channel_capacity: 64 }
    }
}

/// The change one dispatch made to the worker state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Delta {
    pub version: u64,
    pub ops: Patch,
}

enum Request {
    Dispatch {
        action: String,
        payload: Value,
        reply: oneshot::Sender<Result<Delta, SyncError>>,
    },
    Fetch {
        reply: oneshot::Sender<(u64, Value)>,
    },
}

/// Caller side of a worker: sends actions, applies the returned deltas to a
/// local mirror.
pub struct WorkerHandle {
    tx: mpsc::Sender<Request>,
    task: JoinHandle<()>,
    mirror: Value,
    version: u64,
}

/// Start a worker owning `registry` and `initial`. Must be called inside a
/// tokio runtime.
pub fn spawn_worker(registry: ReducerRegistry, initial: Value, config: WorkerConfig) -> WorkerHandle {
    let (tx, rx) = mpsc::channel(config.channel_capacity.max(1));
    let task = tokio::spawn(run_worker(registry, initial.clone(), rx));
    WorkerHandle {
        tx,
        task,
        mirror: initial,
        version: 0,
    }
}

async fn run_worker(registry: ReducerRegistry, mut state: Value, mut rx: mpsc::Receiver<Request>) {
    let mut version = 0u64;
    let options = DiffOptions { binary_ranges: true };
    tracing::debug!(reducers = ?registry, "worker started");
    while let Some(request) = rx.recv().await {
        match request {
            Request::Dispatch {
                action,
                payload,
                reply,
            } => {
                let result = registry.run(&action, &state, &payload).map(|next| {
                    let ops = diff_with(&state, &next, options);
                    state = next;
                    version += 1;
                    tracing::trace!(action = %action, version, ops = ops.len(), "action reduced");
                    Delta { version, ops }
                });
                if let Err(err) = &result {
                    tracing::debug!(action = %action, %err, "action rejected");
                }
                if reply.send(result).is_err() {
                    tracing::trace!("dispatcher went away before the reply");
                }
            }
            Request::Fetch { reply } => {
                let _ = reply.send((version, state.clone()));
            }
        }
    }
    tracing::debug!(version, "worker stopped");
}

impl WorkerHandle {
    /// Run `action` on the worker and fold the resulting delta into the mirror.
    pub async fn dispatch(&mut self, action: &str, payload: Value) -> Result<Delta, SyncError> {
        let (reply, response) = oneshot::channel();
        self.tx
            .send(Request::Dispatch {
                action: action.to_owned(),
                payload,
                reply,
            })
            .await
            .map_err(|_| SyncError::WorkerGone)?;
        let delta = response.await.map_err(|_| SyncError::WorkerGone)??;
        self.apply_delta(&delta)?;
        Ok(delta)
    }

    /// Fold a delta into the mirror. Its version must follow the mirror's.
    pub fn apply_delta(&mut self, delta: &Delta) -> Result<(), SyncError> {
        let expected = self.version + 1;
        if delta.version != expected {
            return Err(SyncError::VersionGap {
                expected,
                found: delta.version,
            });
        }
        self.mirror = apply(&self.mirror, &delta.ops)?;
        self.version = delta.version;
        Ok(())
    }

    /// The mirrored state.
    pub fn snapshot(&self) -> &Value {
        &self.mirror
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    /// Replace the mirror with the worker's authoritative state, e.g. after
    /// a version gap.
    pub async fn resync(&mut self) -> Result<(), SyncError> {
        let (reply, response) = oneshot::channel();
        self.tx
            .send(Request::Fetch { reply })
            .await
            .map_err(|_| SyncError::WorkerGone)?;
        let (version, state) = response.await.map_err(|_| SyncError::WorkerGone)?;
        tracing::debug!(from = self.version, to = version, "mirror resynced");
        self.version = version;
        self.mirror = state;
        Ok(())
    }

    /// Close the channel and wait for the worker to drain and exit.
    pub async fn shutdown(self) -> Result<Value, SyncError> {
        let WorkerHandle {
            tx, task, mirror, ..
        } = self;
        drop(tx);
        task.await.map_err(|_| SyncError::WorkerGone)?;
        Ok(mirror)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chronostate_patch::PatchOp;
    use serde_json::json;

    fn todo_registry() -> ReducerRegistry {
        let mut registry = ReducerRegistry::new();
        registry
            .register("add", |state, payload| {
                let mut items = state.as_list().cloned().ok_or("state is not a list")?;
                items.push(payload.clone());
                Ok(Value::List(items))
            })
            .register("pop", |state, _| {
                let mut items = state.as_list().cloned().ok_or("state is not a list")?;
                items.pop().ok_or("nothing to pop")?;
                Ok(Value::List(items))
            });
        registry
    }

    #[tokio::test]
    async fn deltas_keep_mirror_in_step() {
        let mut worker = spawn_worker(todo_registry(), Value::list(), WorkerConfig::default());
        let delta = worker.dispatch("add", Value::from("a")).await.unwrap();
        assert_eq!(delta.version, 1);
        assert_eq!(delta.ops.len(), 1);
        worker.dispatch("add", Value::from("b")).await.unwrap();
        worker.dispatch("pop", Value::Null).await.unwrap();

        assert_eq!(worker.version(), 3);
        assert_eq!(worker.snapshot(), &Value::from(json!(["a"])));
        let last = worker.shutdown().await.unwrap();
        assert_eq!(last, Value::from(json!(["a"])));
    }

    #[tokio::test]
    async fn rejected_actions_leave_state_alone() {
        let mut worker = spawn_worker(todo_registry(), Value::list(), WorkerConfig::default());
        assert_eq!(
            worker.dispatch("missing", Value::Null).await,
            Err(SyncError::UnknownReducer("missing".into()))
        );
        assert!(matches!(
            worker.dispatch("pop", Value::Null).await,
            Err(SyncError::Reducer { .. })
        ));
        // versions continue from where they were
        assert_eq!(worker.dispatch("add", Value::Int(1)).await.unwrap().version, 1);
    }

    #[tokio::test]
    async fn gap_is_detected_and_resync_recovers() {
        let mut worker = spawn_worker(todo_registry(), Value::list(), WorkerConfig::default());
        let skipped = Delta {
            version: 2,
            ops: vec![PatchOp::set(chronostate_common::Path::root(), Value::Null)],
        };
        assert_eq!(
            worker.apply_delta(&skipped),
            Err(SyncError::VersionGap { expected: 1, found: 2 })
        );
        worker.dispatch("add", Value::Int(7)).await.unwrap();
        worker.resync().await.unwrap();
        assert_eq!(worker.version(), 1);
        assert_eq!(worker.snapshot(), &Value::from(json!([7])));
    }

    #[tokio::test]
    async fn blob_changes_ship_as_byte_ranges() {
        let mut registry = ReducerRegistry::new();
        registry.register("poke", |state, payload| {
            let mut bytes = state.as_bytes().ok_or("not bytes")?.to_vec();
            let offset = payload.as_int().ok_or("offset must be an int")? as usize;
            let slot = bytes.get_mut(offset).ok_or("offset out of range")?;
            *slot = 0xff;
            Ok(Value::Bytes(bytes))
        });
        let mut worker = spawn_worker(registry, Value::Bytes(vec![0; 4096]), WorkerConfig::default());
        let delta = worker.dispatch("poke", Value::Int(100)).await.unwrap();
        assert_eq!(
            delta.ops,
            vec![PatchOp::BinaryChunk {
                path: chronostate_common::Path::root(),
                offset: 100,
                data: vec![0xff],
            }]
        );
        assert_eq!(worker.snapshot().as_bytes().unwrap()[100], 0xff);
    }
}
