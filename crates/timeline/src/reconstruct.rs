//! Point-in-time state reconstruction over retained events.
//!
//! Reconstruction starts from the nearest snapshot at or before the target
//! and folds the events after it. Snapshots carry no state, so a patch whose
//! key has no value since the snapshot is applied on top of that key's value
//! at the snapshot, rebuilt from its own retained history.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use chronostate_common::Value;
use chronostate_patch::{Patch, apply, diff};
use chronostate_persist::StorageDriver;
use serde::Serialize;

use crate::error::TimelineError;
use crate::event::{Event, EventKind};
use crate::log::EventLog;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconstructOptions {
    /// Defaults to the latest seq; values past it are clamped.
    pub target_seq: Option<u64>,
    /// Only fold events targeting these keys.
    pub keys: Option<BTreeSet<String>>,
    /// Return the state map, not just the changed key set.
    pub include_state: bool,
}

impl ReconstructOptions {
    pub fn at(seq: u64) -> Self {
        Self {
            target_seq: Some(seq),
            ..Self::default()
        }
    }

    pub fn with_keys<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.keys = Some(keys.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_state(mut self) -> Self {
        self.include_state = true;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Reconstruction {
    /// The seq actually reconstructed (after clamping).
    pub seq: u64,
    /// Time of the last folded event, or of the base snapshot.
    pub timestamp: Option<DateTime<Utc>>,
    pub state: Option<BTreeMap<String, Value>>,
    /// Keys changed by the replayed events.
    pub keys: BTreeSet<String>,
    pub base_snapshot: Option<u64>,
    /// Events after the base snapshot up to `seq`.
    pub replayed: usize,
}

impl<D: StorageDriver> EventLog<D> {
    pub fn reconstruct(&self, options: &ReconstructOptions) -> Result<Reconstruction, TimelineError> {
        let latest = self.latest_seq();
        let target = options.target_seq.map_or(latest, |seq| seq.min(latest));
        let base = self.snapshots.iter().rev().find(|s| s.seq <= target);
        let from = base.map_or(0, |s| s.seq);
        if let Some(oldest) = self.oldest_retained_seq()
            && oldest > from + 1
        {
            tracing::warn!(from, oldest, "events after the base snapshot were dropped; replay is partial");
        }

        let mut state: BTreeMap<String, Value> = BTreeMap::new();
        let mut keys = BTreeSet::new();
        let mut timestamp = base.map(|s| s.timestamp);
        let mut replayed = 0;
        for event in self.events.iter().filter(|e| e.seq > from && e.seq <= target) {
            replayed += 1;
            timestamp = Some(event.timestamp);
            let Some(key) = event.target_key.as_deref() else {
                continue;
            };
            if !event.kind.mutates_state() || options.keys.as_ref().is_some_and(|f| !f.contains(key)) {
                continue;
            }
            let current = match state.remove(key) {
                Some(value) => Some(value),
                // deleted since the snapshot
                None if keys.contains(key) => None,
                None if matches!(event.kind, EventKind::ValuePatched { .. }) => self.value_at(key, from)?,
                None => None,
            };
            if let Some(next) = fold(current, event, key)? {
                state.insert(key.to_owned(), next);
            }
            keys.insert(key.to_owned());
        }

        tracing::debug!(target, base = ?base.map(|s| s.seq), replayed, keys = keys.len(), "reconstructed");
        Ok(Reconstruction {
            seq: target,
            timestamp,
            state: options.include_state.then_some(state),
            keys,
            base_snapshot: base.map(|s| s.seq),
            replayed,
        })
    }

    /// State map at `seq`, optionally restricted to `keys`.
    pub fn get_state_at(
        &self,
        seq: u64,
        keys: Option<BTreeSet<String>>,
    ) -> Result<BTreeMap<String, Value>, TimelineError> {
        let options = ReconstructOptions {
            target_seq: Some(seq),
            keys,
            include_state: true,
        };
        Ok(self.reconstruct(&options)?.state.unwrap_or_default())
    }

    /// Value of one key at `seq`, folded from its last retained full value.
    /// `None` when the key was deleted or never set.
    pub fn value_at(&self, key: &str, seq: u64) -> Result<Option<Value>, TimelineError> {
        let history: Vec<&Event> = self
            .events
            .iter()
            .take_while(|e| e.seq <= seq)
            .filter(|e| e.targets(key) && e.kind.mutates_state())
            .collect();
        let start = history
            .iter()
            .rposition(|e| !matches!(e.kind, EventKind::ValuePatched { .. }))
            .unwrap_or(0);
        history[start..]
            .iter()
            .try_fold(None, |current, event| fold(current, event, key))
    }

    /// Per-key patches turning each key's value at `from` into its value at
    /// `to`. Absent values compare as `Null`; unchanged keys are omitted.
    pub fn changes_between(
        &self,
        from: u64,
        to: u64,
        keys: Option<&BTreeSet<String>>,
    ) -> Result<BTreeMap<String, Patch>, TimelineError> {
        let touched: BTreeSet<&str> = self
            .events
            .iter()
            .filter(|e| e.seq > from && e.seq <= to && e.kind.mutates_state())
            .filter_map(|e| e.target_key.as_deref())
            .filter(|key| keys.is_none_or(|f| f.contains(*key)))
            .collect();

        let mut changes = BTreeMap::new();
        for key in touched {
            let before = self.value_at(key, from)?.unwrap_or_default();
            let after = self.value_at(key, to)?.unwrap_or_default();
            let ops = diff(&before, &after);
            if !ops.is_empty() {
                changes.insert(key.to_owned(), ops);
            }
        }
        Ok(changes)
    }
}

fn fold(current: Option<Value>, event: &Event, key: &str) -> Result<Option<Value>, TimelineError> {
    match &event.kind {
        EventKind::ValueSet { value } | EventKind::Hydrated { value } => Ok(Some(value.clone())),
        EventKind::ValuePatched { ops } => apply(&current.unwrap_or_default(), ops)
            .map(Some)
            .map_err(|source| TimelineError::Replay {
                seq: event.seq,
                key: key.to_owned(),
                source,
            }),
        EventKind::ValueDeleted => Ok(None),
        EventKind::Dispatched { .. }
        | EventKind::TransactionBegin { .. }
        | EventKind::TransactionCommit { .. } => Ok(current),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::NewEvent;
    use crate::log::EventLogConfig;
    use chronostate_common::path;
    use chronostate_patch::PatchOp;

    fn log_with_interval(interval: u64) -> EventLog {
        EventLog::new(EventLogConfig {
            snapshot_interval: interval,
            ..EventLogConfig::default()
        })
    }

    #[test]
    fn empty_log_reconstructs_nothing() {
        let log = log_with_interval(10);
        let r = log.reconstruct(&ReconstructOptions::default().with_state()).unwrap();
        assert_eq!(r.seq, 0);
        assert!(r.keys.is_empty());
        assert_eq!(r.state, Some(BTreeMap::new()));
        assert_eq!(r.timestamp, None);
    }

    #[test]
    fn fold_rules() {
        let mut log = log_with_interval(1000);
        log.append(NewEvent::value_set("a", Value::Int(1)));
        log.append(NewEvent::value_set("b", Value::Int(2)));
        log.append(NewEvent::dispatched("noop", Value::Null).with_target("a"));
        log.append(NewEvent::value_deleted("b"));
        log.append(NewEvent::hydrated("c", Value::from("loaded")));

        let state = log.get_state_at(5, None).unwrap();
        assert_eq!(state.get("a"), Some(&Value::Int(1)));
        assert_eq!(state.get("b"), None);
        assert_eq!(state.get("c"), Some(&Value::from("loaded")));

        let r = log.reconstruct(&ReconstructOptions::at(5)).unwrap();
        assert_eq!(r.keys.into_iter().collect::<Vec<_>>(), vec!["a", "b", "c"]);
        assert_eq!(r.state, None);
    }

    #[test]
    fn patches_seed_from_value_before_snapshot() {
        let mut log = log_with_interval(2);
        log.append(NewEvent::value_set("todos", Value::list()));
        log.append(NewEvent::value_set("other", Value::Null)); // snapshot at 2
        log.append(NewEvent::value_patched(
            "todos",
            vec![PatchOp::set(path![0usize], "write docs")],
        ));

        let r = log.reconstruct(&ReconstructOptions::at(3).with_state()).unwrap();
        assert_eq!(r.base_snapshot, Some(2));
        assert_eq!(r.replayed, 1);
        let state = r.state.unwrap();
        assert_eq!(state["todos"], Value::List(vec![Value::from("write docs")]));
        assert!(!state.contains_key("other"));
    }

    #[test]
    fn failing_patch_is_fatal() {
        let mut log = log_with_interval(100);
        log.append(NewEvent::value_set("k", Value::Int(1)));
        log.append(NewEvent::value_patched("k", vec![PatchOp::set(path!["x", "y"], 1i64)]));
        assert!(matches!(
            log.reconstruct(&ReconstructOptions::default()),
            Err(TimelineError::Replay { seq: 2, .. })
        ));
    }

    #[test]
    fn key_filter_limits_fold() {
        let mut log = log_with_interval(100);
        log.append(NewEvent::value_set("a", Value::Int(1)));
        log.append(NewEvent::value_set("b", Value::Int(2)));
        let r = log
            .reconstruct(&ReconstructOptions::default().with_keys(["b"]).with_state())
            .unwrap();
        assert_eq!(r.keys.len(), 1);
        assert_eq!(r.state.unwrap().keys().collect::<Vec<_>>(), vec!["b"]);
        assert_eq!(r.replayed, 2);
    }

    #[test]
    fn value_at_walks_history() {
        let mut log = log_with_interval(100);
        log.append(NewEvent::value_set("n", Value::Int(1)));
        log.append(NewEvent::value_patched("n", vec![PatchOp::set(path![], 2i64)]));
        log.append(NewEvent::value_deleted("n"));
        assert_eq!(log.value_at("n", 1).unwrap(), Some(Value::Int(1)));
        assert_eq!(log.value_at("n", 2).unwrap(), Some(Value::Int(2)));
        assert_eq!(log.value_at("n", 3).unwrap(), None);
        assert_eq!(log.value_at("missing", 3).unwrap(), None);
    }

    #[test]
    fn changes_between_diffs_per_key() {
        let mut log = log_with_interval(100);
        log.append(NewEvent::value_set("a", Value::List(vec![Value::Int(1)])));
        log.append(NewEvent::value_set("b", Value::Int(5)));
        log.append(NewEvent::value_patched("a", vec![PatchOp::set(path![1usize], 2i64)]));
        log.append(NewEvent::value_set("b", Value::Int(5)));

        let changes = log.changes_between(2, 4, None).unwrap();
        assert_eq!(changes.len(), 1);
        assert_eq!(changes["a"], vec![PatchOp::set(path![1usize], 2i64)]);
    }
}
