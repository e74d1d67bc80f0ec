//! Deduplicating FIFO of pending tasks
//!
//! A queue never holds two entries with equal payloads: a second push of an
//! equal payload is a no-op until the first entry is popped.

use std::collections::VecDeque;

use parking_lot::Mutex;

use crate::task::{Task, TaskKind};
use crate::types::TaskId;

/// FIFO of `(TaskId, payload)` pairs guarded by its own lock
#[derive(Debug)]
pub struct TaskQueue<T> {
    entries: Mutex<VecDeque<(TaskId, T)>>,
}

impl<T: PartialEq + Clone> TaskQueue<T> {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(VecDeque::new()),
        }
    }

    /// Append an entry unless an equal payload is already pending.
    ///
    /// Returns `false` when the push was a duplicate no-op.
    pub fn push(&self, id: TaskId, payload: T) -> bool {
        let mut entries = self.entries.lock();
        if entries.iter().any(|(_, pending)| *pending == payload) {
            return false;
        }
        entries.push_back((id, payload));
        true
    }

    /// Remove and return the oldest entry
    pub fn pop(&self) -> Option<(TaskId, T)> {
        self.entries.lock().pop_front()
    }

    /// Remove any entry whose payload equals `payload`.
    ///
    /// Returns the ids of the removed entries.
    pub fn cancel_by_value(&self, payload: &T) -> Vec<TaskId> {
        let mut entries = self.entries.lock();
        let mut removed = Vec::new();
        entries.retain(|(id, pending)| {
            if pending == payload {
                removed.push(*id);
                false
            } else {
                true
            }
        });
        removed
    }

    /// Snapshot of every pending entry without draining
    pub fn copy(&self) -> Vec<(TaskId, T)> {
        self.entries.lock().iter().cloned().collect()
    }

    pub fn contains(&self, payload: &T) -> bool {
        self.entries.lock().iter().any(|(_, pending)| pending == payload)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

impl<T: PartialEq + Clone> Default for TaskQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// One [`TaskQueue`] per [`TaskKind`], owned by a context worker
#[derive(Debug)]
pub struct TaskQueues {
    queues: Vec<TaskQueue<Task>>,
}

impl TaskQueues {
    pub fn new() -> Self {
        Self {
            queues: (0..TaskKind::COUNT).map(|_| TaskQueue::new()).collect(),
        }
    }

    /// The queue holding tasks of `kind`
    pub fn queue(&self, kind: TaskKind) -> &TaskQueue<Task> {
        &self.queues[kind.index()]
    }

    /// Route a task to the queue of its kind
    pub fn push(&self, id: TaskId, task: Task) -> bool {
        self.queue(task.kind()).push(id, task)
    }

    /// Total number of pending tasks across every kind
    pub fn pending(&self) -> usize {
        self.queues.iter().map(TaskQueue::len).sum()
    }

    /// Pending task count per kind, in cycle order, skipping empty queues
    pub fn snapshot(&self) -> Vec<(TaskKind, usize)> {
        TaskKind::CYCLE_ORDER
            .iter()
            .map(|kind| (*kind, self.queue(*kind).len()))
            .filter(|(_, count)| *count > 0)
            .collect()
    }
}

impl Default for TaskQueues {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::NymId;

    #[test]
    fn test_push_rejects_equal_payload() {
        let queue = TaskQueue::new();
        assert!(queue.push(TaskId::new(), "contract-1".to_string()));
        assert!(!queue.push(TaskId::new(), "contract-1".to_string()));
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_pop_is_fifo() {
        let queue = TaskQueue::new();
        let first = TaskId::new();
        let second = TaskId::new();
        queue.push(first, 1u32);
        queue.push(second, 2u32);

        assert_eq!(queue.pop(), Some((first, 1)));
        assert_eq!(queue.pop(), Some((second, 2)));
        assert_eq!(queue.pop(), None);
    }

    #[test]
    fn test_payload_can_be_requeued_after_pop() {
        let queue = TaskQueue::new();
        queue.push(TaskId::new(), 7u32);
        let (id, payload) = queue.pop().unwrap();
        assert!(queue.push(id, payload));
    }

    #[test]
    fn test_cancel_by_value_removes_matching_entries() {
        let queue = TaskQueue::new();
        let keep = TaskId::new();
        let drop = TaskId::new();
        queue.push(keep, NymId::new("alice"));
        queue.push(drop, NymId::new("bob"));

        assert_eq!(queue.cancel_by_value(&NymId::new("bob")), vec![drop]);
        assert!(queue.cancel_by_value(&NymId::new("carol")).is_empty());
        assert_eq!(queue.copy(), vec![(keep, NymId::new("alice"))]);
    }

    #[test]
    fn test_copy_does_not_drain() {
        let queue = TaskQueue::new();
        queue.push(TaskId::new(), 1u8);
        queue.push(TaskId::new(), 2u8);
        assert_eq!(queue.copy().len(), 2);
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn test_bundle_routes_by_kind() {
        let queues = TaskQueues::new();
        assert!(queues.push(TaskId::new(), Task::GetTransactionNumbers));
        assert!(queues.push(TaskId::new(), Task::DownloadNymbox));
        assert!(!queues.push(TaskId::new(), Task::GetTransactionNumbers));

        assert_eq!(queues.queue(TaskKind::GetTransactionNumbers).len(), 1);
        assert_eq!(queues.pending(), 2);
        assert_eq!(
            queues.snapshot(),
            vec![
                (TaskKind::DownloadNymbox, 1),
                (TaskKind::GetTransactionNumbers, 1)
            ]
        );
    }
}
