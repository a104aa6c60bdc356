//! Fixed-size concurrency slot pool.
//!
//! Slot ids are seeded `1..=slot_count` at store initialization. The pool
//! never grows at runtime; a freed id becomes immediately reusable and the
//! lowest free id is always handed out first.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One concurrency slot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Slot {
    /// Stable slot id, `1..=slot_count`.
    pub id: u32,
    /// Worker currently occupying the slot, if any.
    pub worker_id: Option<i64>,
    /// When the current occupant took the slot.
    pub assigned_at: Option<DateTime<Utc>>,
}

impl Slot {
    pub fn is_free(&self) -> bool {
        self.worker_id.is_none()
    }
}
