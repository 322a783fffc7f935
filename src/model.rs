//! Core data model.
//!
//! A queue item is one logical unit of work. It has identity (id + duplicate
//! key), a caller-owned body, a priority, lease state and completion
//! bookkeeping.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Error;

// ---------------------------------------------------------------------------
// Queue Item
// ---------------------------------------------------------------------------

/// A persisted queue record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueItem {
    /// Assigned by the store on first insert.
    pub id: ItemId,

    /// Arbitrary payload. The engine only reads it to derive a fingerprint
    /// and to group stats by `task`.
    pub body: serde_json::Value,

    /// Natural key for merge-on-insert.
    pub duplicate_key: String,

    /// Higher = served first.
    pub priority: i32,

    /// Set on first insert of a duplicate group, kept on merges.
    pub inserted_at: DateTime<Utc>,

    /// Number of pushes merged into this record.
    pub count: u32,

    pub locked: bool,

    /// Lease expiry. `None` while unlocked, or for a lease that never expires.
    pub locked_till: Option<DateTime<Utc>>,

    pub complete: bool,

    /// Most recent completion call.
    pub completed_at: Option<DateTime<Utc>>,

    /// Every completion call increments this, including calls on an item
    /// that is already complete.
    pub completecount: u32,
}

impl QueueItem {
    /// True when the lease has an expiry that has passed.
    pub fn lease_expired(&self, now: DateTime<Utc>) -> bool {
        self.locked_till.is_some_and(|till| till < now)
    }

    /// Value of the body's `task` field used for stats grouping.
    ///
    /// Strings group by their text, other values by compact JSON. A missing
    /// or null field groups under `None`.
    pub fn task(&self) -> Option<String> {
        task_label(self.body.get("task"))
    }
}

/// Stats label for a body's `task` value. Shared by every store so the
/// grouping key does not depend on the backend.
pub fn task_label(task: Option<&serde_json::Value>) -> Option<String> {
    match task? {
        serde_json::Value::Null => None,
        serde_json::Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

/// Newtype for queue item IDs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ItemId(pub Uuid);

impl ItemId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// First 8 characters, for tabular output.
    pub fn short(&self) -> String {
        self.0.to_string()[..8].to_string()
    }
}

impl Default for ItemId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ItemId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for ItemId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s)
            .map(ItemId)
            .map_err(|e| Error::MalformedInput(format!("invalid item id {s:?}: {e}")))
    }
}

// ---------------------------------------------------------------------------
// Lease timeout
// ---------------------------------------------------------------------------

/// How long a pop holds its lease.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseTimeout {
    /// Lease expires after this duration and the item becomes eligible again.
    Expires(Duration),
    /// Lease never expires on its own. The holder must `unlock` or `complete`,
    /// otherwise the item stays leased forever.
    Disabled,
}

impl LeaseTimeout {
    pub fn seconds(secs: u64) -> Self {
        LeaseTimeout::Expires(Duration::from_secs(secs))
    }

    /// Parse `"300"`, `"disabled"`, `"off"` or `"0"`.
    pub fn parse(s: &str) -> Result<Self, Error> {
        match s.trim().to_ascii_lowercase().as_str() {
            "disabled" | "off" | "none" | "0" => Ok(LeaseTimeout::Disabled),
            other => other
                .parse::<u64>()
                .map(LeaseTimeout::seconds)
                .map_err(|_| Error::MalformedInput(format!("invalid lease timeout: {s:?}"))),
        }
    }
}

impl std::fmt::Display for LeaseTimeout {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LeaseTimeout::Expires(d) => write!(f, "{}s", d.as_secs()),
            LeaseTimeout::Disabled => write!(f, "disabled"),
        }
    }
}

// ---------------------------------------------------------------------------
// Call options
// ---------------------------------------------------------------------------

/// Options for `push` and `Batch::push`.
#[derive(Debug, Clone, Default)]
pub struct PushOptions {
    pub(crate) priority: Option<i32>,
    pub(crate) duplicate_key: Option<String>,
}

impl PushOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Explicit priority. Without it a new record gets the configured default
    /// and a merged record keeps its current priority.
    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = Some(priority);
        self
    }

    /// Merge on this key instead of the body fingerprint.
    pub fn duplicate_key(mut self, key: impl Into<String>) -> Self {
        self.duplicate_key = Some(key.into());
        self
    }
}

/// Options for `pop` and `peek`.
#[derive(Debug, Clone, Copy, Default)]
pub struct PopOptions {
    pub(crate) timeout: Option<LeaseTimeout>,
}

impl PopOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Override the configured lease timeout.
    pub fn timeout(mut self, timeout: LeaseTimeout) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// What a consumer receives from `pop`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Popped {
    pub id: ItemId,
    pub body: serde_json::Value,
}

// ---------------------------------------------------------------------------
// Stats
// ---------------------------------------------------------------------------

/// Completed vs. still-waiting counts for one group.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Breakdown {
    pub complete: u64,
    /// Incomplete items, leased or not.
    pub waiting: u64,
}

/// Per-task counts. `task` is `None` for bodies without a task field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskBreakdown {
    pub task: Option<String>,
    #[serde(flatten)]
    pub counts: Breakdown,
}

/// Aggregate snapshot of the queue.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub available: u64,
    pub locked: u64,
    pub complete: u64,
    pub total: u64,
    /// Sum of `completecount - 1` over completed items.
    pub redundant_completes: u64,
    pub priority: BTreeMap<i32, Breakdown>,
    pub tasks: Vec<TaskBreakdown>,
}
