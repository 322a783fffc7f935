//! Postgres store.
//!
//! Each trait call is one SQL statement. Pop-style selection is
//! `UPDATE … WHERE id = (SELECT … FOR UPDATE SKIP LOCKED)`, which locks the
//! chosen row, rechecks the filter against its latest version and writes
//! the lease before any other statement can see it.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Postgres, QueryBuilder};
use tracing::warn;
use uuid::Uuid;

use super::{Filter, LeaseMode, Order, StatsRow, Store, Update, Upsert};
use crate::error::Result;
use crate::model::{ItemId, QueueItem, task_label};

const COLUMNS: &str = "id, body, duplicate_key, priority, inserted_at, count, locked, \
                       locked_till, complete, completed_at, completecount";

const UPSERT: &str = "INSERT INTO queue_items (id, body, duplicate_key, priority, inserted_at)
     VALUES ($1, $2, $3, $4, $5)
     ON CONFLICT (duplicate_key) WHERE NOT complete
     DO UPDATE SET body = EXCLUDED.body,
                   priority = CASE WHEN $6 THEN EXCLUDED.priority ELSE queue_items.priority END,
                   locked = FALSE,
                   locked_till = NULL,
                   count = queue_items.count + 1
     RETURNING id, body, duplicate_key, priority, inserted_at, count, locked,
               locked_till, complete, completed_at, completecount";

// `task` comes back as raw JSON and is labelled in Rust, so both stores
// render non-string tasks identically.
const AGGREGATE: &str = "SELECT priority,
            body -> 'task' AS task,
            complete,
            locked,
            COALESCE(locked_till < $1, FALSE) AS expired,
            COUNT(*) AS items,
            COALESCE(SUM(completecount), 0)::BIGINT AS completions
     FROM queue_items
     GROUP BY 1, 2, 3, 4, 5";

/// Postgres-backed store. Owns the connection pool.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    /// Connect to Postgres and create a connection pool.
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Run all pending migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(sqlx::Error::from)?;
        Ok(())
    }

    /// Simple health check: run a SELECT 1.
    pub async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl Store for PgStore {
    async fn find_one_and_update(
        &self,
        filter: &Filter,
        update: &Update,
        order: Order,
    ) -> Result<Option<QueueItem>> {
        let mut qb = QueryBuilder::<Postgres>::new("UPDATE queue_items SET ");
        push_update(&mut qb, update);
        qb.push(" WHERE id = (SELECT id FROM queue_items WHERE ");
        push_filter(&mut qb, filter);
        push_order(&mut qb, order);
        // Contended scheduling scans skip rows another pop is holding;
        // targeted updates wait for them instead of silently missing.
        match order {
            Order::Schedule => qb.push(" LIMIT 1 FOR UPDATE SKIP LOCKED)"),
            Order::Natural => qb.push(" LIMIT 1 FOR UPDATE)"),
        };
        qb.push(" RETURNING ").push(COLUMNS);

        let row: Option<QueueItemRow> = qb.build_query_as().fetch_optional(&self.pool).await?;
        Ok(row.map(QueueItem::from))
    }

    async fn upsert(&self, upsert: &Upsert) -> Result<QueueItem> {
        let row: QueueItemRow = sqlx::query_as(UPSERT)
            .bind(Uuid::new_v4())
            .bind(&upsert.body)
            .bind(&upsert.duplicate_key)
            .bind(upsert.priority)
            .bind(upsert.now)
            .bind(upsert.overwrite_priority)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.into())
    }

    async fn bulk_upsert(&self, upserts: &[Upsert]) -> Result<()> {
        let mut first_error = None;
        for upsert in upserts {
            if let Err(e) = self.upsert(upsert).await {
                warn!(duplicate_key = %upsert.duplicate_key, error = %e, "batch entry failed");
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn find(&self, filter: &Filter, order: Order, limit: usize) -> Result<Vec<QueueItem>> {
        let mut qb = QueryBuilder::<Postgres>::new("SELECT ");
        qb.push(COLUMNS).push(" FROM queue_items WHERE ");
        push_filter(&mut qb, filter);
        push_order(&mut qb, order);
        qb.push(" LIMIT ").push_bind(i64::try_from(limit).unwrap_or(i64::MAX));

        let rows: Vec<QueueItemRow> = qb.build_query_as().fetch_all(&self.pool).await?;
        Ok(rows.into_iter().map(QueueItem::from).collect())
    }

    async fn count(&self, filter: &Filter) -> Result<u64> {
        let mut qb = QueryBuilder::<Postgres>::new("SELECT COUNT(*) FROM queue_items WHERE ");
        push_filter(&mut qb, filter);
        let count: i64 = qb.build_query_scalar().fetch_one(&self.pool).await?;
        Ok(count as u64)
    }

    async fn aggregate(&self, now: DateTime<Utc>) -> Result<Vec<StatsRow>> {
        let rows: Vec<StatsRowRaw> = sqlx::query_as(AGGREGATE)
            .bind(now)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(StatsRow::from).collect())
    }

    async fn delete_many(&self, filter: &Filter) -> Result<u64> {
        let mut qb = QueryBuilder::<Postgres>::new("DELETE FROM queue_items WHERE ");
        push_filter(&mut qb, filter);
        Ok(qb.build().execute(&self.pool).await?.rows_affected())
    }

    async fn drop_all(&self) -> Result<()> {
        sqlx::query("TRUNCATE queue_items").execute(&self.pool).await?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// SQL fragments
// ---------------------------------------------------------------------------

fn push_filter(qb: &mut QueryBuilder<'_, Postgres>, filter: &Filter) {
    match filter {
        Filter::All => {
            qb.push("TRUE");
        }
        Filter::Id(id) => {
            qb.push("id = ").push_bind(id.0);
        }
        Filter::Complete => {
            qb.push("complete");
        }
        Filter::Eligible { now, mode } => {
            qb.push("NOT complete AND ");
            push_lease_free(qb, *now, *mode);
        }
    }
}

fn push_lease_free(qb: &mut QueryBuilder<'_, Postgres>, now: DateTime<Utc>, mode: LeaseMode) {
    match mode {
        LeaseMode::Expiring => {
            qb.push("(NOT locked OR (locked_till IS NOT NULL AND locked_till < ")
                .push_bind(now)
                .push("))");
        }
        LeaseMode::Permanent => {
            qb.push("(NOT locked)");
        }
    }
}

fn push_update(qb: &mut QueryBuilder<'_, Postgres>, update: &Update) {
    match update {
        Update::Lease { until } => {
            qb.push("locked = TRUE, locked_till = ").push_bind(*until);
        }
        Update::Unlock => {
            qb.push("locked = FALSE, locked_till = NULL");
        }
        Update::ExtendLease { until } => {
            qb.push("locked_till = ").push_bind(*until);
        }
        Update::Complete { at } => {
            qb.push("complete = TRUE, completecount = completecount + 1, completed_at = ")
                .push_bind(*at);
        }
        Update::SetPriority(priority) => {
            qb.push("priority = ").push_bind(*priority);
        }
        Update::AdjustPriority(delta) => {
            // Saturate at the INTEGER bounds instead of raising 22003.
            qb.push("priority = LEAST(GREATEST(priority::BIGINT + ")
                .push_bind(i64::from(*delta))
                .push(", -2147483648), 2147483647)::INTEGER");
        }
    }
}

fn push_order(qb: &mut QueryBuilder<'_, Postgres>, order: Order) {
    match order {
        Order::Schedule => qb.push(" ORDER BY priority DESC, inserted_at ASC, seq ASC"),
        Order::Natural => qb.push(" ORDER BY seq ASC"),
    };
}

// ---------------------------------------------------------------------------
// Row types
// ---------------------------------------------------------------------------

/// Internal row type for sqlx::FromRow.
#[derive(sqlx::FromRow)]
struct QueueItemRow {
    id: Uuid,
    body: serde_json::Value,
    duplicate_key: String,
    priority: i32,
    inserted_at: DateTime<Utc>,
    count: i32,
    locked: bool,
    locked_till: Option<DateTime<Utc>>,
    complete: bool,
    completed_at: Option<DateTime<Utc>>,
    completecount: i32,
}

impl From<QueueItemRow> for QueueItem {
    fn from(row: QueueItemRow) -> Self {
        QueueItem {
            id: ItemId(row.id),
            body: row.body,
            duplicate_key: row.duplicate_key,
            priority: row.priority,
            inserted_at: row.inserted_at,
            count: row.count.max(0) as u32,
            locked: row.locked,
            locked_till: row.locked_till,
            complete: row.complete,
            completed_at: row.completed_at,
            completecount: row.completecount.max(0) as u32,
        }
    }
}

#[derive(sqlx::FromRow)]
struct StatsRowRaw {
    priority: i32,
    task: Option<serde_json::Value>,
    complete: bool,
    locked: bool,
    expired: bool,
    items: i64,
    completions: i64,
}

impl From<StatsRowRaw> for StatsRow {
    fn from(row: StatsRowRaw) -> Self {
        StatsRow {
            priority: row.priority,
            task: task_label(row.task.as_ref()),
            complete: row.complete,
            locked: row.locked,
            expired: row.expired,
            items: row.items.max(0) as u64,
            completions: row.completions.max(0) as u64,
        }
    }
}
