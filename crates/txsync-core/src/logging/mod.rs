//! JSONL logging for synchronization nodes.
//!
//! Every process running a [`SynchronizationManager`](crate::SynchronizationManager)
//! is a node. Each node appends to its own JSONL file, so several nodes on
//! one machine never interleave partial lines.
//!
//! ```text
//! logs/
//! └── raw/                          # one file per node per day
//!     ├── 2026-10-19_alice.jsonl
//!     └── 2026-10-19_bob.jsonl
//! ```
//!
//! Events emitted inside a worker's `context_worker` span carry the context
//! (`nym@server`) in their `context` column.
//!
//! ```ignore
//! use txsync_core::logging::LoggingBuilder;
//!
//! LoggingBuilder::new("./logs", "alice")
//!     .with_filter("txsync_core=debug")
//!     .init()?;
//! ```
//!
//! ```bash
//! # Everything one context did
//! jq 'select(.context == "alice@notary")' logs/raw/*.jsonl
//! ```

pub mod entry;
pub mod layer;
pub mod writer;

pub use entry::JsonLogEntry;
pub use layer::{JsonlLayer, LoggingBuilder};
pub use writer::{read_entries, read_entries_for_context, NodeLogWriter};
