//! # action-outbox - durable outbox for user actions
//!
//! Client applications record user actions (likes, views, messages, ...) while
//! connectivity comes and goes. The outbox persists every action locally the
//! moment it happens and delivers the backlog to the remote service in
//! ordered, single-flight batches.
//!
//! ## Core Concepts
//!
//! - **ActionObject**: one user action; a shared target envelope plus a per-type payload
//! - **TriggerStrategy**: per-action policy deciding when a flush is requested
//! - **QueueStore**: ordered durable queue with atomic mark/commit/rollback
//! - **CommitBarrier**: single-flight gate so batches never overlap
//! - **ActionPool**: the facade tying the above together
//!
//! ## Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use action_outbox::{open_queue, ActionObject, ActionPool, ActionTarget};
//!
//! let pool = ActionPool::builder()
//!     .store(Arc::new(open_queue("./outbox", None)?))
//!     .client(Arc::new(http_client))
//!     .token_provider(Arc::new(session))
//!     .build()?;
//!
//! pool.put(ActionObject::like(ActionTarget::new("new_faces", "img-1", "user-1"), 1))?;
//!
//! // On logout:
//! pool.finalize_pool();
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

// Data model
pub mod error;
pub mod event;
pub mod strategy;

// Persistence and delivery
pub mod barrier;
pub mod config;
pub mod pool;
pub mod remote;
pub mod retry;
pub mod storage;

// Re-export primary types at crate root for convenience
pub use barrier::{BarrierGuard, CommitBarrier};
pub use config::OutboxConfig;
pub use error::{ConfigError, OutboxError, OutboxResult};
pub use event::{ActionKind, ActionObject, ActionTarget, ActionType, EventId, EventState, StoredEvent};
pub use pool::{ActionPool, ActionPoolBuilder, FinalizeOutcome, FlushRequest, PutReceipt};
pub use remote::{
    AccessToken, AccessTokenProvider, AuthError, CommitClient, CommitError, CommitRequest,
    CommitResponse, StaticTokenProvider,
};
pub use retry::{CancellationToken, RetryPolicy};
pub use storage::{BatchToken, InMemoryQueueStore, QueueStore, Snapshot, StorageError};
pub use strategy::{TriggerContext, TriggerState, TriggerStrategy};

#[cfg(feature = "persistent")]
pub use storage::{open_queue, PersistentConfig, PersistentQueueStore};
