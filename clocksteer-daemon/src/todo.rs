//! The todo-list scheduler.
//!
//! A single-threaded queue of deferred calls ordered by fire-time. Jobs
//! can be one-shot or repeating, and repeating jobs can stop themselves.
//! For ease of debugging, every job has a name; it shows up in the `Now`
//! trace records.
//!
//! The queue only stores data (a [`TaskKind`]-style payload); firing and
//! the sleep between tasks live in the driver, which owns everything a
//! task might need to touch.

use clocksteer_proto::Timestamp;

/// What a fired task tells the run loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    /// Reschedule me if I repeat, destroy me otherwise.
    Ok,
    /// Stop repeating me.
    Done,
    /// Stop the run loop. This is the normal end-of-run signal, not an
    /// error; errors propagate as `Err` instead.
    Fail,
    /// A signal arrived; unwind to the top level.
    Intr,
}

/// Names a live queue entry. Handles stay valid across the reinsertions
/// of a repeating task and die when the task is destroyed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TodoHandle(u64);

#[derive(Debug)]
pub struct TodoEntry<K> {
    pub when: Timestamp,
    pub repeat: f64,
    pub label: String,
    pub kind: K,
    handle: u64,
}

impl<K> TodoEntry<K> {
    pub fn handle(&self) -> TodoHandle {
        TodoHandle(self.handle)
    }
}

#[derive(Debug)]
pub struct TodoList<K> {
    queue: Vec<TodoEntry<K>>,
    next_handle: u64,
}

impl<K> Default for TodoList<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K> TodoList<K> {
    pub fn new() -> TodoList<K> {
        TodoList {
            queue: Vec::new(),
            next_handle: 1,
        }
    }

    /// Insert before the first strictly-later entry, so tasks with equal
    /// fire-times keep their insertion order.
    fn insert(&mut self, entry: TodoEntry<K>) {
        let pos = self
            .queue
            .iter()
            .position(|other| other.when.diff(&entry.when) > 0.0)
            .unwrap_or(self.queue.len());
        self.queue.insert(pos, entry);
    }

    pub fn schedule_abs(
        &mut self,
        when: Timestamp,
        repeat: f64,
        kind: K,
        label: impl Into<String>,
    ) -> TodoHandle {
        assert!(repeat >= 0.0);
        let handle = self.next_handle;
        self.next_handle += 1;
        self.insert(TodoEntry {
            when,
            repeat,
            label: label.into(),
            kind,
            handle,
        });
        TodoHandle(handle)
    }

    pub fn schedule_rel(
        &mut self,
        now: Timestamp,
        delta: f64,
        repeat: f64,
        kind: K,
        label: impl Into<String>,
    ) -> TodoHandle {
        assert!(delta >= 0.0);
        self.schedule_abs(now.plus(delta), repeat, kind, label)
    }

    /// Remove the named task. The caller must hold a live handle;
    /// cancelling something already fired-and-destroyed is a bug.
    pub fn cancel(&mut self, handle: TodoHandle) {
        let pos = self
            .queue
            .iter()
            .position(|entry| entry.handle == handle.0)
            .unwrap_or_else(|| panic!("cancel of dead todo handle {handle:?}"));
        self.queue.remove(pos);
    }

    pub fn first_when(&self) -> Option<Timestamp> {
        self.queue.first().map(|entry| entry.when)
    }

    pub fn pop_first(&mut self) -> Option<TodoEntry<K>> {
        if self.queue.is_empty() {
            None
        } else {
            Some(self.queue.remove(0))
        }
    }

    /// Put a popped entry back, keeping its handle. Used both to repeat a
    /// task at its next period and to restore one that must not be lost
    /// when the loop unwinds on a signal.
    pub fn reinsert(&mut self, entry: TodoEntry<K>) {
        self.insert(entry);
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(t: f64) -> Timestamp {
        Timestamp::from_double(1000.0 + t)
    }

    fn drain(tdl: &mut TodoList<u32>) -> Vec<u32> {
        let mut fired = Vec::new();
        while let Some(entry) = tdl.pop_first() {
            fired.push(entry.kind);
        }
        fired
    }

    #[test]
    fn fires_in_time_order() {
        let mut tdl = TodoList::new();
        tdl.schedule_abs(at(3.0), 0.0, 3, "c");
        tdl.schedule_abs(at(1.0), 0.0, 1, "a");
        tdl.schedule_abs(at(2.0), 0.0, 2, "b");
        assert_eq!(drain(&mut tdl), vec![1, 2, 3]);
    }

    #[test]
    fn equal_fire_times_keep_insertion_order() {
        let mut tdl = TodoList::new();
        tdl.schedule_abs(at(1.0), 0.0, 1, "first");
        tdl.schedule_abs(at(1.0), 0.0, 2, "second");
        tdl.schedule_abs(at(0.5), 0.0, 0, "earlier");
        tdl.schedule_abs(at(1.0), 0.0, 3, "third");
        assert_eq!(drain(&mut tdl), vec![0, 1, 2, 3]);
    }

    #[test]
    fn schedule_rel_converts_via_now() {
        let mut tdl = TodoList::new();
        tdl.schedule_rel(at(0.0), 2.0, 0.0, 2, "late");
        tdl.schedule_rel(at(0.0), 1.0, 0.0, 1, "early");
        let first = tdl.pop_first().unwrap();
        assert_eq!(first.kind, 1);
        assert!((first.when.diff(&at(1.0))).abs() < 1e-9);
    }

    #[test]
    fn cancelled_tasks_never_fire() {
        let mut tdl = TodoList::new();
        tdl.schedule_abs(at(1.0), 0.0, 1, "a");
        let doomed = tdl.schedule_abs(at(2.0), 0.0, 2, "b");
        tdl.schedule_abs(at(3.0), 0.0, 3, "c");
        tdl.cancel(doomed);
        assert_eq!(drain(&mut tdl), vec![1, 3]);
    }

    #[test]
    #[should_panic(expected = "dead todo handle")]
    fn cancelling_a_fired_task_is_a_bug() {
        let mut tdl = TodoList::new();
        let handle = tdl.schedule_abs(at(1.0), 0.0, 1, "a");
        let _ = tdl.pop_first();
        tdl.cancel(handle);
    }

    #[test]
    fn reinsert_keeps_the_handle_alive() {
        let mut tdl = TodoList::new();
        let handle = tdl.schedule_abs(at(1.0), 5.0, 1, "tick");
        let mut entry = tdl.pop_first().unwrap();
        assert_eq!(entry.handle(), handle);

        entry.when.add(entry.repeat);
        tdl.reinsert(entry);
        tdl.cancel(handle);
        assert!(tdl.is_empty());
    }
}
