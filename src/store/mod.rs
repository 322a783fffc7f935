//! Storage adapter.
//!
//! The engine never reads-then-writes. Every mutation is one call into a
//! [`Store`], and each store implements those calls as a single atomic step
//! against its backend. That step is what keeps two concurrent `pop`s from
//! leasing the same item.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::model::{ItemId, QueueItem};

pub use memory::MemoryStore;
pub use postgres::PgStore;

/// Atomic primitives a backing store must provide.
#[async_trait]
pub trait Store: Send + Sync {
    /// Select the first record matching `filter` under `order`, apply
    /// `update`, and return the updated record. One atomic step.
    async fn find_one_and_update(
        &self,
        filter: &Filter,
        update: &Update,
        order: Order,
    ) -> Result<Option<QueueItem>>;

    /// Merge into the incomplete record with the same duplicate key, or
    /// insert a new one. Returns the resulting record.
    async fn upsert(&self, upsert: &Upsert) -> Result<QueueItem>;

    /// Apply each upsert individually. Every entry is attempted even if an
    /// earlier one fails; the first failure is returned afterwards.
    async fn bulk_upsert(&self, upserts: &[Upsert]) -> Result<()>;

    /// Read-only query.
    async fn find(&self, filter: &Filter, order: Order, limit: usize) -> Result<Vec<QueueItem>>;

    async fn count(&self, filter: &Filter) -> Result<u64>;

    /// Grouped counts over every record, taken in one pass so the rows
    /// describe a single instant.
    async fn aggregate(&self, now: DateTime<Utc>) -> Result<Vec<StatsRow>>;

    /// Returns the number of records removed.
    async fn delete_many(&self, filter: &Filter) -> Result<u64>;

    async fn drop_all(&self) -> Result<()>;
}

// ---------------------------------------------------------------------------
// Filters
// ---------------------------------------------------------------------------

/// Whether leases carry an expiry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseMode {
    /// A lease whose deadline passed no longer holds the item. A lease with
    /// no deadline (`locked_till` unset) was taken by a non-expiring pop and
    /// still holds here; only `unlock`, `complete` or a merge frees it.
    Expiring,
    /// Only an explicitly unlocked item is free.
    Permanent,
}

/// Record predicate.
#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    All,
    Id(ItemId),
    Complete,
    /// Incomplete and not held by a live lease.
    Eligible { now: DateTime<Utc>, mode: LeaseMode },
}

impl Filter {
    pub fn matches(&self, item: &QueueItem) -> bool {
        match self {
            Filter::All => true,
            Filter::Id(id) => item.id == *id,
            Filter::Complete => item.complete,
            Filter::Eligible { now, mode } => !item.complete && lease_is_free(item, *now, *mode),
        }
    }
}

// A lease without a deadline only comes from a non-expiring pop and is never
// reclaimed by time, whatever mode the caller is in.
fn lease_is_free(item: &QueueItem, now: DateTime<Utc>, mode: LeaseMode) -> bool {
    match mode {
        LeaseMode::Expiring => !item.locked || item.lease_expired(now),
        LeaseMode::Permanent => !item.locked,
    }
}

// ---------------------------------------------------------------------------
// Updates
// ---------------------------------------------------------------------------

/// Single-record mutation.
#[derive(Debug, Clone, PartialEq)]
pub enum Update {
    /// Take a lease. `until = None` never expires.
    Lease { until: Option<DateTime<Utc>> },
    Unlock,
    /// Move the deadline; `locked` is left as is.
    ExtendLease { until: DateTime<Utc> },
    Complete { at: DateTime<Utc> },
    SetPriority(i32),
    AdjustPriority(i32),
}

impl Update {
    pub fn apply(&self, item: &mut QueueItem) {
        match self {
            Update::Lease { until } => {
                item.locked = true;
                item.locked_till = *until;
            }
            Update::Unlock => {
                item.locked = false;
                item.locked_till = None;
            }
            Update::ExtendLease { until } => item.locked_till = Some(*until),
            Update::Complete { at } => {
                item.complete = true;
                item.completed_at = Some(*at);
                item.completecount = item.completecount.saturating_add(1);
            }
            Update::SetPriority(p) => item.priority = *p,
            Update::AdjustPriority(delta) => item.priority = item.priority.saturating_add(*delta),
        }
    }
}

/// Result ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Order {
    /// Highest priority first, then earliest `inserted_at`, then store order.
    Schedule,
    /// Store order.
    Natural,
}

// ---------------------------------------------------------------------------
// Upserts
// ---------------------------------------------------------------------------

/// One deduplicating insert, keyed on `{duplicate_key, complete = false}`.
#[derive(Debug, Clone, PartialEq)]
pub struct Upsert {
    pub duplicate_key: String,
    pub body: serde_json::Value,
    /// Priority for a newly inserted record.
    pub priority: i32,
    /// Whether a merge overwrites the existing priority.
    pub overwrite_priority: bool,
    pub now: DateTime<Utc>,
}

impl Upsert {
    /// A fresh record for this upsert.
    pub fn new_item(&self, id: ItemId) -> QueueItem {
        QueueItem {
            id,
            body: self.body.clone(),
            duplicate_key: self.duplicate_key.clone(),
            priority: self.priority,
            inserted_at: self.now,
            count: 1,
            locked: false,
            locked_till: None,
            complete: false,
            completed_at: None,
            completecount: 0,
        }
    }

    /// Merge into an existing incomplete record. Drops any lease on it.
    pub fn merge_into(&self, item: &mut QueueItem) {
        item.body = self.body.clone();
        if self.overwrite_priority {
            item.priority = self.priority;
        }
        item.locked = false;
        item.locked_till = None;
        item.count = item.count.saturating_add(1);
    }
}

// ---------------------------------------------------------------------------
// Aggregates
// ---------------------------------------------------------------------------

/// One group of records sharing every key field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatsRow {
    pub priority: i32,
    pub task: Option<String>,
    pub complete: bool,
    pub locked: bool,
    /// Lease deadline is set and already passed.
    pub expired: bool,
    /// Number of records in the group.
    pub items: u64,
    /// Sum of `completecount` over the group.
    pub completions: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use serde_json::json;

    fn item() -> QueueItem {
        Upsert {
            duplicate_key: "k".into(),
            body: json!("x"),
            priority: 3,
            overwrite_priority: true,
            now: Utc::now(),
        }
        .new_item(ItemId::new())
    }

    #[test]
    fn expired_lease_is_eligible_only_when_expiring() {
        let now = Utc::now();
        let mut it = item();
        Update::Lease {
            until: Some(now - Duration::seconds(1)),
        }
        .apply(&mut it);

        let expiring = Filter::Eligible {
            now,
            mode: LeaseMode::Expiring,
        };
        let permanent = Filter::Eligible {
            now,
            mode: LeaseMode::Permanent,
        };
        assert!(expiring.matches(&it));
        assert!(!permanent.matches(&it));
    }

    #[test]
    fn lease_without_deadline_is_never_eligible() {
        let now = Utc::now();
        let mut it = item();
        Update::Lease { until: None }.apply(&mut it);

        for mode in [LeaseMode::Expiring, LeaseMode::Permanent] {
            assert!(!Filter::Eligible { now, mode }.matches(&it));
        }
    }

    #[test]
    fn completed_items_are_not_eligible() {
        let now = Utc::now();
        let mut it = item();
        Update::Complete { at: now }.apply(&mut it);
        let mode = LeaseMode::Expiring;
        assert!(!Filter::Eligible { now, mode }.matches(&it));
        assert!(Filter::Complete.matches(&it));
    }

    #[test]
    fn merge_clears_lease_and_keeps_insert_time() {
        let mut it = item();
        let inserted_at = it.inserted_at;
        Update::Lease {
            until: Some(Utc::now() + Duration::seconds(60)),
        }
        .apply(&mut it);

        let merge = Upsert {
            duplicate_key: "k".into(),
            body: json!("y"),
            priority: 9,
            overwrite_priority: false,
            now: Utc::now() + Duration::seconds(5),
        };
        merge.merge_into(&mut it);

        assert!(!it.locked);
        assert_eq!(it.locked_till, None);
        assert_eq!(it.count, 2);
        assert_eq!(it.priority, 3);
        assert_eq!(it.body, json!("y"));
        assert_eq!(it.inserted_at, inserted_at);
    }

    #[test]
    fn complete_counts_every_call() {
        let now = Utc::now();
        let mut it = item();
        for _ in 0..3 {
            Update::Complete { at: now }.apply(&mut it);
        }
        assert!(it.complete);
        assert_eq!(it.completecount, 3);
    }
}
