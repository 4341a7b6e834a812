use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::{Condvar, Mutex, MutexGuard};

/// Scheduling lane of an indexing task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    /// Explicit requests, such as re-indexing the file a user is looking at.
    Interactive,
    /// Bulk indexing.
    #[default]
    Background,
}

/// Two-lane blocking task queue shared by the workers.
///
/// Interactive tasks are always dequeued before background ones. A task that
/// is already waiting is not queued twice; asking for it interactively moves
/// it to the interactive lane. Each task runs to completion on one worker.
#[derive(Debug)]
pub struct TaskQueue<T> {
    state: Mutex<Lanes<T>>,
    ready: Condvar,
}

#[derive(Debug)]
struct Lanes<T> {
    interactive: VecDeque<T>,
    background: VecDeque<T>,
    closed: bool,
}

impl<T: PartialEq> Default for TaskQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: PartialEq> TaskQueue<T> {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(Lanes {
                interactive: VecDeque::new(),
                background: VecDeque::new(),
                closed: false,
            }),
            ready: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Lanes<T>> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Queues a task. Returns `false` when it was already waiting or the
    /// queue is closed.
    pub fn push(&self, task: T, priority: Priority) -> bool {
        let mut lanes = self.lock();
        if lanes.closed || lanes.interactive.contains(&task) {
            return false;
        }
        if let Some(pos) = lanes.background.iter().position(|queued| *queued == task) {
            if priority == Priority::Interactive {
                if let Some(task) = lanes.background.remove(pos) {
                    lanes.interactive.push_back(task);
                }
            }
            return false;
        }
        match priority {
            Priority::Interactive => lanes.interactive.push_back(task),
            Priority::Background => lanes.background.push_back(task),
        }
        drop(lanes);
        self.ready.notify_one();
        true
    }

    /// Waits for the next task. Returns `None` once the queue is closed and
    /// drained.
    pub fn pop(&self) -> Option<T> {
        let mut lanes = self.lock();
        loop {
            if let Some(task) = lanes.dequeue() {
                return Some(task);
            }
            if lanes.closed {
                return None;
            }
            lanes = self
                .ready
                .wait(lanes)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
        }
    }

    pub fn close(&self) {
        self.lock().closed = true;
        self.ready.notify_all();
    }

    pub fn len(&self) -> usize {
        let lanes = self.lock();
        lanes.interactive.len() + lanes.background.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T> Lanes<T> {
    fn dequeue(&mut self) -> Option<T> {
        self.interactive
            .pop_front()
            .or_else(|| self.background.pop_front())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interactive_tasks_run_first() {
        let queue = TaskQueue::new();
        queue.push("bulk.cc", Priority::Background);
        queue.push("open.cc", Priority::Interactive);
        assert_eq!(queue.pop(), Some("open.cc"));
        assert_eq!(queue.pop(), Some("bulk.cc"));
        assert!(queue.is_empty());
    }

    #[test]
    fn waiting_tasks_are_not_duplicated() {
        let queue = TaskQueue::new();
        assert!(queue.push("a.cc", Priority::Background));
        assert!(!queue.push("a.cc", Priority::Background));
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn interactive_request_promotes_waiting_task() {
        let queue = TaskQueue::new();
        queue.push("a.cc", Priority::Background);
        queue.push("b.cc", Priority::Background);
        assert!(!queue.push("b.cc", Priority::Interactive));
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.pop(), Some("b.cc"));
        assert_eq!(queue.pop(), Some("a.cc"));
    }

    #[test]
    fn closed_queue_drains_then_stops() {
        let queue = TaskQueue::new();
        queue.push(1, Priority::Background);
        queue.close();
        assert!(!queue.push(2, Priority::Background));
        assert_eq!(queue.pop(), Some(1));
        assert_eq!(queue.pop(), None);
        assert!(queue.is_empty());
    }
}
