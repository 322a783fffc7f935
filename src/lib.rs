//! # dequeue
//!
//! Persistent priority work queue. Producers push bodies that are merged by
//! duplicate key; consumers pop time-bounded leases, then complete or unlock.
//! All coordination happens through atomic single-record operations on a
//! [`store::Store`], so no coordinator process is needed.

pub mod clock;
pub mod config;
pub mod error;
pub mod fingerprint;
pub mod model;
pub mod queue;
pub mod stats;
pub mod store;
pub mod telemetry;

pub use error::{Error, Result};
pub use queue::{Batch, Queue};
