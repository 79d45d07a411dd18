use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Checkpoint marker bounding how far back reconstruction replays.
///
/// Holds the set of keys observed up to `seq`, never a copy of state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    pub covered_keys: BTreeSet<String>,
}
