//! txsync core library
//!
//! Client-side synchronization engine for a wallet that talks to remote
//! transaction endpoints.
//!
//! ## Overview
//!
//! Every (local nym, endpoint) pair is a *context*. The
//! [`SynchronizationManager`] owns one [`ContextWorker`] per context. Each
//! worker bootstraps itself (fetch the endpoint's contract, register the
//! nym) and then drains per-kind task queues in a fixed order, retrying
//! tasks whose preconditions are not met yet and reporting the rest through
//! a shared status table.
//!
//! ## Core Principles
//!
//! - **Single flight**: at most one pass per worker runs at a time; triggers
//!   during a pass fold into one rerun
//! - **Deduplicated queues**: submitting a task equal to a queued one is a no-op
//! - **Consume-on-read status**: a terminal status is reported once
//! - **Pluggable edges**: the endpoint is a [`Transport`], local data a [`Repository`]
//!
//! ## Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//! use txsync_core::{ContextId, MemoryRepository, SyncConfig, SynchronizationManager, Task};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let repository = Arc::new(MemoryRepository::new());
//!     let manager = SynchronizationManager::new(SyncConfig::default(), repository, transport)?;
//!
//!     let context = ContextId::new("alice", "notary");
//!     let id = manager.start_task(&context, Task::RegisterNym { resync: false });
//!     manager.context_idle(&context).unwrap().await;
//!     println!("{:?}", manager.status(id));
//!
//!     manager.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod events;
pub mod logging;
pub mod manager;
pub mod operation;
pub mod queue;
pub mod repository;
pub mod scheduler;
pub mod status;
pub mod storage;
pub mod task;
pub mod types;
pub mod worker;

// Re-exports
pub use config::SyncConfig;
pub use error::{Precondition, SyncError, SyncResult, TaskError};
pub use events::{WorkerEvent, WorkerState};
pub use manager::{Depositability, Messagability, SynchronizationManager};
pub use operation::{
    run_operation, Operation, OperationRequest, OperationResult, OperationStatus, Reply, Transport,
};
pub use queue::{TaskQueue, TaskQueues};
pub use repository::{MemoryRepository, Repository};
pub use scheduler::{Completion, Scheduler, SchedulerState};
pub use status::{StatusTable, TaskCompletion, ThreadStatus};
pub use storage::{PeerBox, Storage};
pub use task::{Task, TaskKind};
pub use types::*;
pub use worker::{Backoff, ContextWorker, DiscoveryQueues};
