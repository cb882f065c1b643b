//! Thread-safe add/snapshot container backing the command queue and the fade
//! registry.
//!
//! Producer threads push into an inbox; the control thread merges the inbox
//! into a stable working list and iterates or mutates that list freely between
//! merges. Items added before a snapshot are visible in that snapshot or a
//! later one, never lost and never duplicated.

use std::sync::{Mutex, MutexGuard};

#[derive(Debug)]
pub struct PendingSet<T> {
    inbox: Mutex<Vec<T>>,
    working: Mutex<Vec<T>>,
}

impl<T> Default for PendingSet<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> PendingSet<T> {
    pub fn new() -> Self {
        Self {
            inbox: Mutex::new(Vec::new()),
            working: Mutex::new(Vec::new()),
        }
    }

    /// Callable from any thread.
    pub fn add(&self, item: T) {
        self.inbox.lock().unwrap().push(item);
    }

    /// Merges every item added since the last snapshot into the working list
    /// and returns it. Only the control thread calls this; the working list
    /// is never contended in practice, the lock just keeps the type honest.
    pub fn snapshot(&self) -> MutexGuard<'_, Vec<T>> {
        let mut working = self.working.lock().unwrap();
        working.append(&mut self.inbox.lock().unwrap());
        working
    }
}
