//! Indexed min-heap of per-connection expirations.
//!
//! The heap is a plain `Vec` ordered by expiry, plus a map from timer id to
//! its current position. Every swap updates the map, so looking a timer up is
//! O(1) and inserting, adjusting or removing one is O(log n).

use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::time::{Duration, Instant};

pub type TimeoutCallback = Box<dyn FnOnce() + Send>;

struct TimerNode<K> {
    id: K,
    expires: Instant,
    cb: TimeoutCallback,
}

pub struct HeapTimer<K> {
    heap: Vec<TimerNode<K>>,
    index: HashMap<K, usize>,
}

impl<K: Copy + Eq + Hash> Default for HeapTimer<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Copy + Eq + Hash> HeapTimer<K> {
    pub fn new() -> Self {
        Self {
            heap: Vec::with_capacity(64),
            index: HashMap::with_capacity(64),
        }
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    pub fn contains(&self, id: K) -> bool {
        self.index.contains_key(&id)
    }

    /// Schedules `cb` to run `timeout` from now. An existing timer with the
    /// same id is refreshed in place: new expiry, new callback.
    pub fn add<F>(&mut self, id: K, timeout: Duration, cb: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let expires = Instant::now() + timeout;
        match self.index.get(&id) {
            Some(&i) => {
                self.heap[i].expires = expires;
                self.heap[i].cb = Box::new(cb);
                self.reposition(i);
            }
            None => {
                let i = self.heap.len();
                self.index.insert(id, i);
                self.heap.push(TimerNode {
                    id,
                    expires,
                    cb: Box::new(cb),
                });
                self.sift_up(i);
            }
        }
    }

    /// Moves the expiry of `id` to `timeout` from now. Unknown ids are ignored.
    pub fn adjust(&mut self, id: K, timeout: Duration) {
        if let Some(&i) = self.index.get(&id) {
            self.heap[i].expires = Instant::now() + timeout;
            self.reposition(i);
        }
    }

    /// Removes the timer for `id` and runs its callback right away.
    pub fn do_work(&mut self, id: K) {
        if let Some(&i) = self.index.get(&id) {
            let node = self.remove_at(i);
            (node.cb)();
        }
    }

    /// Runs and removes every timer that has expired.
    pub fn tick(&mut self) {
        let now = Instant::now();
        while self.heap.first().is_some_and(|node| node.expires <= now) {
            let node = self.remove_at(0);
            (node.cb)();
        }
    }

    /// Drops the earliest timer without running it.
    pub fn pop(&mut self) {
        if !self.heap.is_empty() {
            self.remove_at(0);
        }
    }

    pub fn clear(&mut self) {
        self.heap.clear();
        self.index.clear();
    }

    /// Time until the earliest expiry, zero if it is already due, or `None`
    /// when no timer is scheduled.
    pub fn next_tick(&self) -> Option<Duration> {
        self.heap
            .first()
            .map(|node| node.expires.saturating_duration_since(Instant::now()))
    }

    fn remove_at(&mut self, i: usize) -> TimerNode<K> {
        let node = self.heap.swap_remove(i);
        self.index.remove(&node.id);
        if i < self.heap.len() {
            self.index.insert(self.heap[i].id, i);
            self.reposition(i);
        }
        node
    }

    fn reposition(&mut self, i: usize) {
        if !self.sift_down(i) {
            self.sift_up(i);
        }
    }

    fn sift_up(&mut self, mut i: usize) {
        while i > 0 {
            let parent = (i - 1) / 2;
            if self.heap[parent].expires <= self.heap[i].expires {
                break;
            }
            self.swap_nodes(i, parent);
            i = parent;
        }
    }

    /// Returns whether the node moved.
    fn sift_down(&mut self, start: usize) -> bool {
        let n = self.heap.len();
        let mut i = start;
        let mut child = 2 * i + 1;
        while child < n {
            if child + 1 < n && self.heap[child + 1].expires < self.heap[child].expires {
                child += 1;
            }
            if self.heap[i].expires <= self.heap[child].expires {
                break;
            }
            self.swap_nodes(i, child);
            i = child;
            child = 2 * i + 1;
        }
        i > start
    }

    fn swap_nodes(&mut self, i: usize, j: usize) {
        self.heap.swap(i, j);
        self.index.insert(self.heap[i].id, i);
        self.index.insert(self.heap[j].id, j);
    }
}

impl<K: fmt::Debug> fmt::Debug for HeapTimer<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.heap.iter().map(|node| (&node.id, node.expires)))
            .finish()
    }
}
