//! The queue engine.
//!
//! `Queue` is a cheap handle over a shared [`Store`]. It holds no mutable
//! state of its own: every operation is one atomic store call, so any number
//! of clones in any number of processes can push, pop and complete against
//! the same store.

pub mod batch;
mod lease;

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info};

pub use batch::Batch;

use crate::clock::{Clock, SystemClock};
use crate::config::QueueConfig;
use crate::error::{Error, Result};
use crate::fingerprint::{ContentHash, Fingerprint};
use crate::model::{ItemId, LeaseTimeout, PushOptions, QueueItem, QueueStats};
use crate::stats;
use crate::store::{Filter, LeaseMode, MemoryStore, Order, Store, Upsert};
use crate::telemetry::metrics;
use opentelemetry::KeyValue;

#[derive(Clone)]
pub struct Queue {
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
    fingerprint: Arc<dyn Fingerprint>,
    config: QueueConfig,
}

impl Queue {
    pub fn new(store: Arc<dyn Store>, config: QueueConfig) -> Self {
        Self {
            store,
            clock: Arc::new(SystemClock),
            fingerprint: Arc::new(ContentHash),
            config,
        }
    }

    /// Queue over a fresh [`MemoryStore`].
    pub fn in_memory(config: QueueConfig) -> Self {
        Self::new(Arc::new(MemoryStore::new()), config)
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_fingerprint(mut self, fingerprint: Arc<dyn Fingerprint>) -> Self {
        self.fingerprint = fingerprint;
        self
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    // -----------------------------------------------------------------------
    // Insert
    // -----------------------------------------------------------------------

    /// Push a body, merging into the incomplete record with the same
    /// duplicate key if there is one.
    ///
    /// A merge overwrites the body, drops any lease held on the record and
    /// bumps `count`. The priority is overwritten only when `opts` names one.
    pub async fn push<T: Serialize + ?Sized>(
        &self,
        body: &T,
        opts: PushOptions,
    ) -> Result<QueueItem> {
        let body = to_body(body)?;
        let upsert = self.prepare_upsert(body, opts)?;
        let item = self.store.upsert(&upsert).await?;

        let result = if item.count > 1 { "merged" } else { "inserted" };
        debug!(id = %item.id, duplicate_key = %item.duplicate_key, count = item.count, result, "pushed");
        metrics::items_pushed().add(1, &[KeyValue::new("result", result)]);
        Ok(item)
    }

    /// Start a batch buffer for this queue.
    pub fn batch(&self) -> Batch {
        Batch::new(self.clone())
    }

    fn prepare_upsert(&self, body: serde_json::Value, opts: PushOptions) -> Result<Upsert> {
        let duplicate_key = match opts.duplicate_key {
            Some(key) if key.trim().is_empty() => {
                return Err(Error::MalformedInput("duplicate key is empty".to_string()));
            }
            Some(key) => key,
            None => self.fingerprint.duplicate_key(&body),
        };
        Ok(Upsert {
            duplicate_key,
            body,
            priority: opts.priority.unwrap_or(self.config.default_priority),
            overwrite_priority: opts.priority.is_some(),
            now: self.clock.now(),
        })
    }

    // -----------------------------------------------------------------------
    // Inspection
    // -----------------------------------------------------------------------

    /// Fetch one record.
    pub async fn get(&self, id: ItemId) -> Result<QueueItem> {
        self.store
            .find(&Filter::Id(id), Order::Natural, 1)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| Error::NotFound(id.to_string()))
    }

    /// Number of records, complete or not.
    pub async fn count(&self) -> Result<u64> {
        self.store.count(&Filter::All).await
    }

    /// Aggregate counts from a single pass over the store.
    pub async fn stats(&self) -> Result<QueueStats> {
        let rows = self.store.aggregate(self.clock.now()).await?;
        Ok(stats::fold(&rows, lease_mode(self.config.timeout)))
    }

    // -----------------------------------------------------------------------
    // Maintenance
    // -----------------------------------------------------------------------

    /// Delete every completed record. Returns how many were removed.
    pub async fn cleanup(&self) -> Result<u64> {
        let removed = self.store.delete_many(&Filter::Complete).await?;
        info!(removed, "removed completed items");
        Ok(removed)
    }

    /// Delete every record. For tests and resets.
    pub async fn flush(&self) -> Result<()> {
        self.store.drop_all().await?;
        info!("queue flushed");
        Ok(())
    }
}

fn lease_mode(timeout: LeaseTimeout) -> LeaseMode {
    match timeout {
        LeaseTimeout::Expires(_) => LeaseMode::Expiring,
        LeaseTimeout::Disabled => LeaseMode::Permanent,
    }
}

fn to_body<T: Serialize + ?Sized>(body: &T) -> Result<serde_json::Value> {
    let value = serde_json::to_value(body)
        .map_err(|e| Error::MalformedInput(format!("body is not serializable: {e}")))?;
    if value.is_null() {
        return Err(Error::MalformedInput("body is null".to_string()));
    }
    Ok(value)
}
