//! Worker registry primitives: lifecycle states, the slot pool, and the
//! coordination event log.

pub mod event;
pub mod slot;
pub mod worker;

pub use event::{EventKind, EventRecord};
pub use slot::Slot;
pub use worker::{NewWorker, WorkerRecord, WorkerStatus};
