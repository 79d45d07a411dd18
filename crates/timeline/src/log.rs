use std::collections::{BTreeSet, VecDeque};
use std::ops::RangeInclusive;
use std::sync::Arc;

use chrono::Utc;
use chronostate_persist::{MemoryDriver, PutOptions, StorageDriver, StorageDriverExt};
use serde::{Deserialize, Serialize};

use crate::error::TimelineError;
use crate::event::{Event, EventType, NewEvent};
use crate::snapshot::Snapshot;

/// Driver key prefix of mirrored events. Lives under the reserved
/// [`chronostate_persist::SYSTEM_KEY_PREFIX`] so atom keys cannot collide.
pub const EVENT_KEY_PREFIX: &str = "$chronostate/event:";
/// Driver key prefix of mirrored snapshots.
pub const SNAPSHOT_KEY_PREFIX: &str = "$chronostate/snapshot:";
const SEQ_WIDTH: usize = 10;

/// Configuration for the event log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EventLogConfig {
    /// Events kept in memory; the oldest are dropped first.
    pub max_events: usize,
    /// A snapshot is taken every this many events.
    pub snapshot_interval: u64,
    /// Mirror events and snapshots to the storage driver.
    pub persist_events: bool,
}

impl Default for EventLogConfig {
    fn default() -> Self {
        Self {
            max_events: 10_000,
            snapshot_interval: 100,
            persist_events: false,
        }
    }
}

/// Filter for [`EventLog::get_events`]. Bounds are inclusive.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventQuery {
    pub start: Option<u64>,
    pub end: Option<u64>,
    pub kind: Option<EventType>,
}

impl EventQuery {
    pub fn range(start: u64, end: u64) -> Self {
        Self {
            start: Some(start),
            end: Some(end),
            kind: None,
        }
    }

    fn matches(&self, event: &Event) -> bool {
        self.start.is_none_or(|s| event.seq >= s)
            && self.end.is_none_or(|e| event.seq <= e)
            && self.kind.is_none_or(|k| event.event_type() == k)
    }
}

/// Append-only, sequenced event log with a bounded in-memory ring.
pub struct EventLog<D = MemoryDriver> {
    config: EventLogConfig,
    driver: Option<Arc<D>>,
    pub(crate) events: VecDeque<Event>,
    pub(crate) snapshots: Vec<Snapshot>,
    next_seq: u64,
    observed_keys: BTreeSet<String>,
}

impl EventLog {
    /// A log without a storage mirror.
    pub fn new(config: EventLogConfig) -> Self {
        Self::build(config, None)
    }
}

impl<D: StorageDriver> EventLog<D> {
    /// A log that mirrors to `driver` when `config.persist_events` is set.
    pub fn with_driver(config: EventLogConfig, driver: Arc<D>) -> Self {
        Self::build(config, Some(driver))
    }

    fn build(config: EventLogConfig, driver: Option<Arc<D>>) -> Self {
        Self {
            config,
            driver,
            events: VecDeque::new(),
            snapshots: Vec::new(),
            next_seq: 1,
            observed_keys: BTreeSet::new(),
        }
    }

    pub fn config(&self) -> &EventLogConfig {
        &self.config
    }

    /// Assign the next seq and the current time, retain the event, and take
    /// a snapshot when the seq lands on the interval.
    pub fn append(&mut self, new: NewEvent) -> Event {
        let (event, snapshot) = self.stage(new);
        self.commit(event.clone(), snapshot);
        event
    }

    /// [`Self::append`], mirroring the event (and a new snapshot) to storage
    /// first when configured. A failed write leaves the log untouched, so the
    /// seq is reused by the next call and the mirror stays gap-free.
    pub async fn log(&mut self, new: NewEvent) -> Result<Event, TimelineError> {
        let (event, snapshot) = self.stage(new);
        if let Some(driver) = self.mirror() {
            let key = event_key(event.seq);
            driver.put_value(&key, &event, PutOptions::default()).await?;
            if let Some(snapshot) = &snapshot
                && let Err(err) = driver
                    .put_value(&snapshot_key(snapshot.seq), snapshot, PutOptions::default())
                    .await
            {
                if let Err(cleanup) = driver.delete(&key).await {
                    tracing::warn!(seq = event.seq, error = %cleanup, "orphaned mirrored event");
                }
                return Err(err.into());
            }
            tracing::trace!(seq = event.seq, "event mirrored");
        }
        self.commit(event.clone(), snapshot);
        Ok(event)
    }

    /// The event `new` would become, and the snapshot it would trigger,
    /// without changing the log.
    fn stage(&self, new: NewEvent) -> (Event, Option<Snapshot>) {
        let event = Event {
            seq: self.next_seq,
            timestamp: Utc::now(),
            target_key: new.target_key,
            kind: new.kind,
        };
        let interval = self.config.snapshot_interval.max(1);
        let snapshot = (event.seq % interval == 0).then(|| {
            let mut covered_keys = self.observed_keys.clone();
            if let Some(key) = &event.target_key {
                covered_keys.insert(key.clone());
            }
            Snapshot {
                seq: event.seq,
                timestamp: event.timestamp,
                covered_keys,
            }
        });
        (event, snapshot)
    }

    fn commit(&mut self, event: Event, snapshot: Option<Snapshot>) {
        self.next_seq = event.seq + 1;
        if let Some(key) = &event.target_key {
            self.observed_keys.insert(key.clone());
        }

        self.events.push_back(event);
        while self.events.len() > self.config.max_events {
            if let Some(dropped) = self.events.pop_front() {
                tracing::trace!(seq = dropped.seq, "event dropped from ring");
            }
        }

        if let Some(snapshot) = snapshot {
            tracing::debug!(seq = snapshot.seq, keys = snapshot.covered_keys.len(), "snapshot taken");
            self.snapshots.push(snapshot);
        }
    }

    /// Retained events matching `query`, in seq order.
    pub fn get_events(&self, query: &EventQuery) -> Vec<&Event> {
        self.events.iter().filter(|e| query.matches(e)).collect()
    }

    pub fn snapshots(&self) -> &[Snapshot] {
        &self.snapshots
    }

    /// Seq of the last appended event, 0 before the first.
    pub fn latest_seq(&self) -> u64 {
        self.next_seq - 1
    }

    pub fn oldest_retained_seq(&self) -> Option<u64> {
        self.events.front().map(|e| e.seq)
    }

    pub fn retained(&self) -> usize {
        self.events.len()
    }

    /// Keys any event has targeted since the log began.
    pub fn observed_keys(&self) -> &BTreeSet<String> {
        &self.observed_keys
    }

    /// Read mirrored events in `range` back from the driver. Works for events
    /// the ring has already dropped.
    pub async fn load_persisted(&self, range: RangeInclusive<u64>) -> Result<Vec<Event>, TimelineError> {
        let Some(driver) = &self.driver else {
            return Ok(Vec::new());
        };
        let mut out = Vec::new();
        for (seq, key) in mirrored_seqs(driver.as_ref(), EVENT_KEY_PREFIX).await? {
            if !range.contains(&seq) {
                continue;
            }
            out.push(load_event(driver.as_ref(), &key, seq).await?);
        }
        Ok(out)
    }

    /// Rebuild a log from events and snapshots mirrored to `driver`.
    ///
    /// The stored sequence must be gap-free; anything else is fatal. Only the
    /// newest `max_events` are retained in memory.
    pub async fn restore(driver: Arc<D>, config: EventLogConfig) -> Result<Self, TimelineError> {
        let mut log = Self::with_driver(config, Arc::clone(&driver));

        let mut previous: Option<u64> = None;
        for (seq, key) in mirrored_seqs(driver.as_ref(), EVENT_KEY_PREFIX).await? {
            if let Some(prev) = previous
                && seq != prev + 1
            {
                return Err(TimelineError::OutOfOrder {
                    expected: prev + 1,
                    found: seq,
                });
            }
            previous = Some(seq);
            let event = load_event(driver.as_ref(), &key, seq).await?;
            if let Some(target) = &event.target_key {
                log.observed_keys.insert(target.clone());
            }
            log.events.push_back(event);
            if log.events.len() > log.config.max_events {
                log.events.pop_front();
            }
        }

        for (seq, key) in mirrored_seqs(driver.as_ref(), SNAPSHOT_KEY_PREFIX).await? {
            let snapshot: Snapshot = driver.get_value(&key).await?.ok_or_else(|| TimelineError::Corrupt {
                key: key.clone(),
                reason: "listed snapshot vanished".into(),
            })?;
            if snapshot.seq != seq {
                return Err(TimelineError::Corrupt {
                    key,
                    reason: format!("snapshot holds seq {}", snapshot.seq),
                });
            }
            log.snapshots.push(snapshot);
        }

        log.next_seq = previous.map_or(1, |last| last + 1);
        tracing::info!(
            latest = log.latest_seq(),
            retained = log.events.len(),
            snapshots = log.snapshots.len(),
            "event log restored"
        );
        Ok(log)
    }

    fn mirror(&self) -> Option<&Arc<D>> {
        self.driver.as_ref().filter(|_| self.config.persist_events)
    }
}

fn event_key(seq: u64) -> String {
    format!("{EVENT_KEY_PREFIX}{seq:0width$}", width = SEQ_WIDTH)
}

fn snapshot_key(seq: u64) -> String {
    format!("{SNAPSHOT_KEY_PREFIX}{seq:0width$}", width = SEQ_WIDTH)
}

/// Mirrored keys under `prefix` with their parsed seqs, ascending.
async fn mirrored_seqs<D: StorageDriver>(
    driver: &D,
    prefix: &str,
) -> Result<Vec<(u64, String)>, TimelineError> {
    let mut found = Vec::new();
    for key in driver.keys(prefix).await? {
        let digits = &key[prefix.len()..];
        if digits.len() != SEQ_WIDTH || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return Err(TimelineError::Corrupt {
                key,
                reason: "malformed sequence suffix".into(),
            });
        }
        let seq = digits.parse().map_err(|_| TimelineError::Corrupt {
            key: key.clone(),
            reason: "sequence out of range".into(),
        })?;
        found.push((seq, key));
    }
    found.sort_by_key(|(seq, _)| *seq);
    Ok(found)
}

async fn load_event<D: StorageDriver>(driver: &D, key: &str, seq: u64) -> Result<Event, TimelineError> {
    let event: Event = driver.get_value(key).await?.ok_or_else(|| TimelineError::Corrupt {
        key: key.to_owned(),
        reason: "listed event vanished".into(),
    })?;
    if event.seq != seq {
        return Err(TimelineError::Corrupt {
            key: key.to_owned(),
            reason: format!("event holds seq {}", event.seq),
        });
    }
    Ok(event)
}
