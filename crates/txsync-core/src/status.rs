//! Task lifecycle tracking and completion notification
//!
//! ```text
//! add_task ──► Running ──finish_task──► FinishedSuccess | FinishedFailed
//!                  │                           │
//!                  └──mark_shutdown──► Shutdown│
//!                                              ▼
//!                                 status() returns and deletes
//! ```
//!
//! A terminal status is observable through [`StatusTable::status`] by exactly
//! one caller. Every terminal transition is also published as a
//! [`TaskCompletion`] on a broadcast channel.

use std::collections::HashMap;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, trace};

use crate::types::{MessageId, TaskId};

/// Lifecycle state of a submitted task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ThreadStatus {
    /// Queued or in flight
    Running,
    FinishedSuccess,
    FinishedFailed,
    /// Unknown id, or a terminal status that was already consumed
    Error,
    /// The worker stopped before the task completed
    Shutdown,
}

impl ThreadStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ThreadStatus::FinishedSuccess | ThreadStatus::FinishedFailed | ThreadStatus::Shutdown
        )
    }
}

/// Published once per task when it reaches a terminal status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskCompletion {
    pub task_id: TaskId,
    pub success: bool,
}

#[derive(Debug, Default)]
struct Entries {
    status: HashMap<TaskId, ThreadStatus>,
    messages: HashMap<TaskId, MessageId>,
}

/// Shared table of task statuses
#[derive(Debug)]
pub struct StatusTable {
    entries: Mutex<Entries>,
    completion_tx: broadcast::Sender<TaskCompletion>,
}

impl StatusTable {
    pub fn new(capacity: usize) -> Self {
        let (completion_tx, _) = broadcast::channel(capacity.max(1));
        Self {
            entries: Mutex::new(Entries::default()),
            completion_tx,
        }
    }

    /// Subscribe to completion notifications
    pub fn subscribe(&self) -> broadcast::Receiver<TaskCompletion> {
        self.completion_tx.subscribe()
    }

    /// Record a newly submitted task as Running
    pub fn add_task(&self, id: TaskId) {
        self.entries.lock().status.insert(id, ThreadStatus::Running);
        trace!(%id, "Task added");
    }

    /// Forget a task that never made it into a queue
    pub(crate) fn remove_task(&self, id: TaskId) {
        let mut entries = self.entries.lock();
        entries.status.remove(&id);
        entries.messages.remove(&id);
    }

    /// Move a task to its terminal status and publish the outcome.
    ///
    /// A task already terminal is left untouched, so the Running→terminal
    /// transition happens at most once. Ids without an entry (worker
    /// follow-ups, discovery requests) still publish a completion.
    pub fn finish_task(&self, id: TaskId, success: bool) {
        let status = if success {
            ThreadStatus::FinishedSuccess
        } else {
            ThreadStatus::FinishedFailed
        };
        if self.transition(id, status) {
            debug!(%id, success, "Task finished");
            let _ = self.completion_tx.send(TaskCompletion {
                task_id: id,
                success,
            });
        }
    }

    /// Record the message id delivered for a task
    pub fn set_message_id(&self, id: TaskId, message: MessageId) {
        self.entries.lock().messages.insert(id, message);
    }

    /// Read the status of a task.
    ///
    /// Unknown ids report [`ThreadStatus::Error`]. A terminal status is
    /// removed by this call.
    pub fn status(&self, id: TaskId) -> ThreadStatus {
        let mut entries = self.entries.lock();
        match entries.status.get(&id).copied() {
            None => ThreadStatus::Error,
            Some(ThreadStatus::Running) => ThreadStatus::Running,
            Some(terminal) => {
                entries.status.remove(&id);
                terminal
            }
        }
    }

    /// Message id recorded for a task.
    ///
    /// Only meaningful once a terminal status has been observed; the
    /// correlation is removed on read.
    pub fn message_id(&self, id: TaskId) -> Option<MessageId> {
        self.entries.lock().messages.remove(&id)
    }

    /// Mark every Running task as Shutdown, publishing a failed completion
    /// for each. Returns the number of tasks affected.
    pub fn mark_shutdown(&self) -> usize {
        let running: Vec<TaskId> = {
            let mut entries = self.entries.lock();
            let ids: Vec<TaskId> = entries
                .status
                .iter()
                .filter(|(_, status)| **status == ThreadStatus::Running)
                .map(|(id, _)| *id)
                .collect();
            for id in &ids {
                entries.status.insert(*id, ThreadStatus::Shutdown);
            }
            ids
        };
        for id in &running {
            let _ = self.completion_tx.send(TaskCompletion {
                task_id: *id,
                success: false,
            });
        }
        running.len()
    }

    /// Number of tracked entries, terminal or not
    pub fn len(&self) -> usize {
        self.entries.lock().status.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().status.is_empty()
    }

    /// Returns `true` if a completion should be published for `id`
    fn transition(&self, id: TaskId, status: ThreadStatus) -> bool {
        let mut entries = self.entries.lock();
        match entries.status.get_mut(&id) {
            Some(current) if current.is_terminal() => false,
            Some(current) => {
                *current = status;
                true
            }
            None => true,
        }
    }
}

impl Default for StatusTable {
    fn default() -> Self {
        Self::new(256)
    }
}
