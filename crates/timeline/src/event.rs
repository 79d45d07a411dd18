use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use chronostate_common::Value;
use chronostate_patch::Patch;
use serde::{Deserialize, Serialize};

/// What happened. Each kind has a fixed reconstruction rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    ValueSet { value: Value },
    ValuePatched { ops: Patch },
    ValueDeleted,
    Hydrated { value: Value },
    /// Intent, not outcome; never changes reconstructed state.
    Dispatched { action: String, payload: Value },
    TransactionBegin { label: String },
    TransactionCommit { label: String },
}

/// Payload-free tag of an [`EventKind`], for filtering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    ValueSet,
    ValuePatched,
    ValueDeleted,
    Hydrated,
    Dispatched,
    TransactionBegin,
    TransactionCommit,
}

impl EventType {
    pub const ALL: [EventType; 7] = [
        EventType::ValueSet,
        EventType::ValuePatched,
        EventType::ValueDeleted,
        EventType::Hydrated,
        EventType::Dispatched,
        EventType::TransactionBegin,
        EventType::TransactionCommit,
    ];

    pub fn name(self) -> &'static str {
        match self {
            EventType::ValueSet => "value_set",
            EventType::ValuePatched => "value_patched",
            EventType::ValueDeleted => "value_deleted",
            EventType::Hydrated => "hydrated",
            EventType::Dispatched => "dispatched",
            EventType::TransactionBegin => "transaction_begin",
            EventType::TransactionCommit => "transaction_commit",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for EventType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EventType::ALL
            .into_iter()
            .find(|t| t.name() == s)
            .ok_or_else(|| format!("unknown event type {s:?}"))
    }
}

impl EventKind {
    pub fn event_type(&self) -> EventType {
        match self {
            EventKind::ValueSet { .. } => EventType::ValueSet,
            EventKind::ValuePatched { .. } => EventType::ValuePatched,
            EventKind::ValueDeleted => EventType::ValueDeleted,
            EventKind::Hydrated { .. } => EventType::Hydrated,
            EventKind::Dispatched { .. } => EventType::Dispatched,
            EventKind::TransactionBegin { .. } => EventType::TransactionBegin,
            EventKind::TransactionCommit { .. } => EventType::TransactionCommit,
        }
    }

    /// Whether replaying this kind can change a key's value.
    pub fn mutates_state(&self) -> bool {
        matches!(
            self,
            EventKind::ValueSet { .. }
                | EventKind::ValuePatched { .. }
                | EventKind::ValueDeleted
                | EventKind::Hydrated { .. }
        )
    }
}

/// An event before the log assigns its sequence number and timestamp.
#[derive(Debug, Clone, PartialEq)]
pub struct NewEvent {
    pub target_key: Option<String>,
    pub kind: EventKind,
}

impl NewEvent {
    pub fn value_set(key: impl Into<String>, value: Value) -> Self {
        Self::keyed(key, EventKind::ValueSet { value })
    }

    pub fn value_patched(key: impl Into<String>, ops: Patch) -> Self {
        Self::keyed(key, EventKind::ValuePatched { ops })
    }

    pub fn value_deleted(key: impl Into<String>) -> Self {
        Self::keyed(key, EventKind::ValueDeleted)
    }

    pub fn hydrated(key: impl Into<String>, value: Value) -> Self {
        Self::keyed(key, EventKind::Hydrated { value })
    }

    pub fn dispatched(action: impl Into<String>, payload: Value) -> Self {
        Self {
            target_key: None,
            kind: EventKind::Dispatched {
                action: action.into(),
                payload,
            },
        }
    }

    pub fn transaction_begin(label: impl Into<String>) -> Self {
        Self {
            target_key: None,
            kind: EventKind::TransactionBegin { label: label.into() },
        }
    }

    pub fn transaction_commit(label: impl Into<String>) -> Self {
        Self {
            target_key: None,
            kind: EventKind::TransactionCommit { label: label.into() },
        }
    }

    /// Attach a target key (e.g. the atom a dispatch was aimed at).
    pub fn with_target(mut self, key: impl Into<String>) -> Self {
        self.target_key = Some(key.into());
        self
    }

    fn keyed(key: impl Into<String>, kind: EventKind) -> Self {
        Self {
            target_key: Some(key.into()),
            kind,
        }
    }
}

/// A sequenced, timestamped event. Immutable once appended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    pub target_key: Option<String>,
    pub kind: EventKind,
}

impl Event {
    pub fn event_type(&self) -> EventType {
        self.kind.event_type()
    }

    pub fn targets(&self, key: &str) -> bool {
        self.target_key.as_deref() == Some(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn type_names_parse_back() {
        for t in EventType::ALL {
            assert_eq!(t.name().parse::<EventType>().unwrap(), t);
        }
        assert!("value_exploded".parse::<EventType>().is_err());
    }

    #[test]
    fn dispatch_does_not_mutate() {
        assert!(!NewEvent::dispatched("add", Value::Null).kind.mutates_state());
        assert!(NewEvent::value_deleted("k").kind.mutates_state());
    }

    #[test]
    fn event_json_shape() {
        let event = Event {
            seq: 3,
            timestamp: Utc::now(),
            target_key: Some("todos".into()),
            kind: EventKind::ValueDeleted,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["seq"], 3);
        assert_eq!(json["kind"], "value_deleted");
        let back: Event = serde_json::from_value(json).unwrap();
        assert_eq!(back, event);
    }
}
