//! Buffered pushes committed in one bulk upsert pass.
//!
//! A `Batch` belongs to a single producer: `push` and `process` take
//! `&mut self`, so sharing one across tasks needs an explicit lock.

use serde::Serialize;
use tracing::{info, warn};

use super::{Queue, to_body};
use crate::error::Result;
use crate::model::PushOptions;

struct Entry {
    body: serde_json::Value,
    opts: PushOptions,
}

pub struct Batch {
    queue: Queue,
    entries: Vec<Entry>,
}

impl Batch {
    pub(super) fn new(queue: Queue) -> Self {
        Self {
            queue,
            entries: Vec::new(),
        }
    }

    /// Buffer a push. Touches no storage; fails only on a malformed body or
    /// an empty duplicate key.
    pub fn push<T: Serialize + ?Sized>(&mut self, body: &T, opts: PushOptions) -> Result<()> {
        let body = to_body(body)?;
        // Validate now so a bad entry is rejected at the call that added it.
        self.queue.prepare_upsert(body.clone(), opts.clone())?;
        self.entries.push(Entry { body, opts });
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Apply every buffered push with the same merge rules as
    /// [`Queue::push`], then clear the buffer whether or not all of them
    /// succeeded. Each entry is atomic on its own; the batch as a whole is
    /// not. Returns the number of entries submitted.
    pub async fn process(&mut self) -> Result<usize> {
        let entries = std::mem::take(&mut self.entries);
        if entries.is_empty() {
            return Ok(0);
        }

        let upserts = entries
            .into_iter()
            .map(|entry| self.queue.prepare_upsert(entry.body, entry.opts))
            .collect::<Result<Vec<_>>>()?;

        let submitted = upserts.len();
        match self.queue.store.bulk_upsert(&upserts).await {
            Ok(()) => {
                info!(submitted, "batch committed");
                Ok(submitted)
            }
            Err(e) => {
                warn!(submitted, error = %e, "batch partially applied");
                Err(e)
            }
        }
    }
}
