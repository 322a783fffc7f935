//! In-memory store.
//!
//! A mutex-guarded map. Every trait call runs under one lock acquisition, so
//! it is exactly as atomic as the Postgres statements it stands in for. Not
//! durable; meant for tests and single-process embedding.

use std::cmp::Reverse;
use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use super::{Filter, Order, StatsRow, Store, Update, Upsert};
use crate::error::Result;
use crate::model::{ItemId, QueueItem};

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    next_seq: u64,
    /// Keyed by insertion sequence, which doubles as natural order.
    items: BTreeMap<u64, QueueItem>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Inner {
    fn select(&self, filter: &Filter, order: Order) -> Vec<u64> {
        let mut seqs: Vec<u64> = self
            .items
            .iter()
            .filter(|(_, item)| filter.matches(item))
            .map(|(seq, _)| *seq)
            .collect();

        if order == Order::Schedule {
            seqs.sort_by_key(|seq| {
                let item = &self.items[seq];
                (Reverse(item.priority), item.inserted_at, *seq)
            });
        }
        seqs
    }

    fn upsert(&mut self, upsert: &Upsert) -> QueueItem {
        let existing = self
            .items
            .values_mut()
            .find(|item| !item.complete && item.duplicate_key == upsert.duplicate_key);

        if let Some(item) = existing {
            upsert.merge_into(item);
            return item.clone();
        }

        let item = upsert.new_item(ItemId::new());
        let seq = self.next_seq;
        self.next_seq += 1;
        self.items.insert(seq, item.clone());
        item
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn find_one_and_update(
        &self,
        filter: &Filter,
        update: &Update,
        order: Order,
    ) -> Result<Option<QueueItem>> {
        let mut inner = self.inner.lock().await;
        let Some(seq) = inner.select(filter, order).into_iter().next() else {
            return Ok(None);
        };
        Ok(inner.items.get_mut(&seq).map(|item| {
            update.apply(item);
            item.clone()
        }))
    }

    async fn upsert(&self, upsert: &Upsert) -> Result<QueueItem> {
        Ok(self.inner.lock().await.upsert(upsert))
    }

    async fn bulk_upsert(&self, upserts: &[Upsert]) -> Result<()> {
        let mut inner = self.inner.lock().await;
        for upsert in upserts {
            inner.upsert(upsert);
        }
        Ok(())
    }

    async fn find(&self, filter: &Filter, order: Order, limit: usize) -> Result<Vec<QueueItem>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .select(filter, order)
            .into_iter()
            .take(limit)
            .map(|seq| inner.items[&seq].clone())
            .collect())
    }

    async fn count(&self, filter: &Filter) -> Result<u64> {
        let inner = self.inner.lock().await;
        Ok(inner.items.values().filter(|item| filter.matches(item)).count() as u64)
    }

    async fn aggregate(&self, now: DateTime<Utc>) -> Result<Vec<StatsRow>> {
        type Key = (i32, Option<String>, bool, bool, bool);

        let inner = self.inner.lock().await;
        let mut groups: HashMap<Key, (u64, u64)> = HashMap::new();
        for item in inner.items.values() {
            let key = (
                item.priority,
                item.task(),
                item.complete,
                item.locked,
                item.lease_expired(now),
            );
            let entry = groups.entry(key).or_default();
            entry.0 += 1;
            entry.1 += u64::from(item.completecount);
        }

        Ok(groups
            .into_iter()
            .map(
                |((priority, task, complete, locked, expired), (items, completions))| StatsRow {
                    priority,
                    task,
                    complete,
                    locked,
                    expired,
                    items,
                    completions,
                },
            )
            .collect())
    }

    async fn delete_many(&self, filter: &Filter) -> Result<u64> {
        let mut inner = self.inner.lock().await;
        let before = inner.items.len();
        inner.items.retain(|_, item| !filter.matches(item));
        Ok((before - inner.items.len()) as u64)
    }

    async fn drop_all(&self) -> Result<()> {
        self.inner.lock().await.items.clear();
        Ok(())
    }
}
