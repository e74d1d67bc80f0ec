//! Worker event types
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │  WorkerEvent: what a context worker did on its own initiative   │
//! │  ├── StateChanged: bootstrap advanced                           │
//! │  ├── TaskScheduled: worker queued a follow-up task              │
//! │  └── TaskRequeued: task put back until a precondition holds     │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Caller-submitted task outcomes are reported through
//! [`TaskCompletion`](crate::status::TaskCompletion) instead.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::task::TaskKind;
use crate::types::{ContextId, TaskId};

/// Bootstrap phase of a context worker. Never regresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum WorkerState {
    /// Endpoint contract is not resolvable yet
    NeedServerContract,
    /// Nym has never registered with the endpoint
    NeedRegistration,
    /// Queues are drained on every pass
    Ready,
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkerState::NeedServerContract => write!(f, "need_server_contract"),
            WorkerState::NeedRegistration => write!(f, "need_registration"),
            WorkerState::Ready => write!(f, "ready"),
        }
    }
}

/// Notification published by context workers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkerEvent {
    StateChanged {
        context: ContextId,
        from: WorkerState,
        to: WorkerState,
    },
    /// A follow-up task was queued by the worker itself
    TaskScheduled {
        context: ContextId,
        task_id: TaskId,
        kind: TaskKind,
    },
    /// A task was put back in its queue instead of finishing
    TaskRequeued {
        context: ContextId,
        task_id: TaskId,
        kind: TaskKind,
        reason: String,
    },
}

impl WorkerEvent {
    pub fn context(&self) -> &ContextId {
        match self {
            WorkerEvent::StateChanged { context, .. }
            | WorkerEvent::TaskScheduled { context, .. }
            | WorkerEvent::TaskRequeued { context, .. } => context,
        }
    }
}

impl fmt::Display for WorkerEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkerEvent::StateChanged { context, from, to } => {
                write!(f, "{context}: {from} -> {to}")
            }
            WorkerEvent::TaskScheduled {
                context,
                task_id,
                kind,
            } => write!(f, "{context}: scheduled {kind} ({task_id})"),
            WorkerEvent::TaskRequeued {
                context,
                task_id,
                kind,
                reason,
            } => write!(f, "{context}: requeued {kind} ({task_id}): {reason}"),
        }
    }
}
