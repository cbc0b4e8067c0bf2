//! Queue storage for the outbox.
//!
//! [`QueueStore`] defines the contract; [`InMemoryQueueStore`] and (with the
//! `persistent` feature) [`persistent::PersistentQueueStore`] implement it.

mod index;
mod memory;
mod traits;

#[cfg(feature = "persistent")]
pub mod persistent;

pub use memory::InMemoryQueueStore;
pub use traits::{BatchToken, QueueStore, Snapshot, StorageError};

#[cfg(feature = "persistent")]
pub use persistent::{open_queue, PersistentConfig, PersistentQueueStore};
