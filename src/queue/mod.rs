//! Durable queue of scan submissions that could not be delivered.

mod entry;
mod store;

pub use entry::{EntryStatus, NewScanEntry, PendingScanEntry};
pub use store::{QueueStore, SqliteQueueStore};
