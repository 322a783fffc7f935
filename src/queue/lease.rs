//! Lease protocol: pop, peek, unlock, renew, complete and priority changes.
//!
//! Item-targeted calls on an id that matches nothing are no-ops and return
//! `Ok(None)`; an empty `pop` is likewise not an error.

use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use opentelemetry::KeyValue;
use tracing::{Instrument, debug, warn};

use super::{Queue, lease_mode};
use crate::error::{Error, Result};
use crate::model::{ItemId, LeaseTimeout, PopOptions, Popped, QueueItem};
use crate::store::{Filter, Order, Update};
use crate::telemetry::metrics;
use crate::telemetry::queue::{record_leased, start_lease_span};

/// Maximum items returned by `peek`.
pub const PEEK_LIMIT: usize = 10;

impl Queue {
    /// Lease the highest-priority, earliest-inserted eligible item.
    ///
    /// With an expiring timeout the lease lapses after that duration and the
    /// item can be popped again. With [`LeaseTimeout::Disabled`] the lease
    /// holds until `unlock` or `complete`.
    pub async fn pop(&self, opts: PopOptions) -> Result<Option<Popped>> {
        let timeout = opts.timeout.unwrap_or(self.config.timeout);
        let span = start_lease_span(&timeout.to_string());
        self.lease_next(timeout).instrument(span).await
    }

    async fn lease_next(&self, timeout: LeaseTimeout) -> Result<Option<Popped>> {
        let now = self.clock.now();
        let until = lease_deadline(now, timeout)?;
        let filter = Filter::Eligible {
            now,
            mode: lease_mode(timeout),
        };

        let item = self
            .store
            .find_one_and_update(&filter, &Update::Lease { until }, Order::Schedule)
            .await?;

        let Some(item) = item else {
            record_operation("pop", "empty");
            return Ok(None);
        };

        record_leased(&tracing::Span::current(), &item.id);
        debug!(id = %item.id, priority = item.priority, locked_till = ?item.locked_till, "leased");
        record_operation("pop", "ok");
        Ok(Some(Popped {
            id: item.id,
            body: item.body,
        }))
    }

    /// Up to [`PEEK_LIMIT`] eligible items in pop order. Leaves lease state
    /// untouched; each call reads current state afresh.
    pub async fn peek(&self, opts: PopOptions) -> Result<Vec<QueueItem>> {
        let timeout = opts.timeout.unwrap_or(self.config.timeout);
        let filter = Filter::Eligible {
            now: self.clock.now(),
            mode: lease_mode(timeout),
        };
        let items = self.store.find(&filter, Order::Schedule, PEEK_LIMIT).await?;
        record_operation("peek", if items.is_empty() { "empty" } else { "ok" });
        Ok(items)
    }

    /// Release a lease early. Unlocking an unlocked item is a no-op.
    pub async fn unlock(&self, id: ItemId) -> Result<Option<QueueItem>> {
        self.update_one("unlock", id, Update::Unlock).await
    }

    /// Move the lease deadline to `now + duration`.
    pub async fn lock_until(&self, id: ItemId, duration: Duration) -> Result<Option<QueueItem>> {
        if duration.is_zero() {
            return Err(Error::MalformedInput("lease extension must be positive".to_string()));
        }
        let until = deadline(self.clock.now(), duration)?;
        self.update_one("lock_until", id, Update::ExtendLease { until })
            .await
    }

    /// Mark an item done.
    ///
    /// Every call increments `completecount`, including calls on an item that
    /// is already complete. Values above one mean two workers finished the
    /// same item, usually because a lease expired mid-work.
    pub async fn complete(&self, id: ItemId) -> Result<Option<QueueItem>> {
        let at = self.clock.now();
        let item = self.update_one("complete", id, Update::Complete { at }).await?;

        if let Some(ref item) = item {
            if item.completecount > 1 {
                warn!(id = %item.id, completecount = item.completecount, "redundant completion");
                metrics::redundant_completes().add(1, &[]);
            }
        }
        Ok(item)
    }

    pub async fn change_item_priority(&self, id: ItemId, priority: i32) -> Result<Option<QueueItem>> {
        self.update_one("change_priority", id, Update::SetPriority(priority))
            .await
    }

    /// Raise priority by one.
    pub async fn increase_item_priority(&self, id: ItemId) -> Result<Option<QueueItem>> {
        self.increase_item_priority_by(id, 1).await
    }

    /// Lower priority by one.
    pub async fn decrease_item_priority(&self, id: ItemId) -> Result<Option<QueueItem>> {
        self.decrease_item_priority_by(id, 1).await
    }

    /// Raise priority by `step`, saturating at the `i32` bounds.
    pub async fn increase_item_priority_by(&self, id: ItemId, step: i32) -> Result<Option<QueueItem>> {
        self.update_one("increase_priority", id, Update::AdjustPriority(step))
            .await
    }

    pub async fn decrease_item_priority_by(&self, id: ItemId, step: i32) -> Result<Option<QueueItem>> {
        let delta = step
            .checked_neg()
            .ok_or_else(|| Error::MalformedInput(format!("priority step out of range: {step}")))?;
        self.update_one("decrease_priority", id, Update::AdjustPriority(delta))
            .await
    }

    async fn update_one(
        &self,
        operation: &'static str,
        id: ItemId,
        update: Update,
    ) -> Result<Option<QueueItem>> {
        let item = self
            .store
            .find_one_and_update(&Filter::Id(id), &update, Order::Natural)
            .await?;
        match item {
            Some(_) => record_operation(operation, "ok"),
            None => {
                debug!(%id, operation, "no matching item");
                record_operation(operation, "no_match");
            }
        }
        Ok(item)
    }
}

fn lease_deadline(now: DateTime<Utc>, timeout: LeaseTimeout) -> Result<Option<DateTime<Utc>>> {
    match timeout {
        LeaseTimeout::Disabled => Ok(None),
        LeaseTimeout::Expires(d) if d.is_zero() => Err(Error::MalformedInput(
            "lease timeout must be positive".to_string(),
        )),
        LeaseTimeout::Expires(d) => deadline(now, d).map(Some),
    }
}

fn deadline(now: DateTime<Utc>, duration: Duration) -> Result<DateTime<Utc>> {
    TimeDelta::from_std(duration)
        .ok()
        .and_then(|delta| now.checked_add_signed(delta))
        .ok_or_else(|| Error::MalformedInput(format!("lease duration too large: {duration:?}")))
}

fn record_operation(operation: &'static str, result: &'static str) {
    metrics::queue_operations().add(
        1,
        &[
            KeyValue::new("operation", operation),
            KeyValue::new("result", result),
        ],
    );
}
