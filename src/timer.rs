// Copyright 2024 The vev developers
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Indexed min-heap of per-connection idle timers.
//!
//! Nodes are keyed by the connection's [`Token`]; a companion map from token
//! to heap index makes adjust and delete-by-key O(log n). The reactor calls
//! [`TimerHeap::next_tick`] once per loop iteration to fire whatever has
//! expired and learn how long the poll may sleep.

use std::collections::HashMap;
use std::fmt;
use std::time::{Duration, Instant};

use mio::Token;

/// Invoked once when the node expires or is driven via [`TimerHeap::do_work`].
pub type TimeoutCallback = Box<dyn FnOnce() + Send>;

struct TimerNode {
    id: Token,
    expires: Instant,
    cb: TimeoutCallback,
}

/// Min-heap of timer nodes ordered by expiry.
#[derive(Default)]
pub struct TimerHeap {
    heap: Vec<TimerNode>,
    ref_: HashMap<Token, usize>,
}

impl fmt::Debug for TimerHeap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimerHeap").field("len", &self.heap.len()).finish()
    }
}

impl TimerHeap {
    /// Creates an empty heap.
    pub fn new() -> Self {
        Self {
            heap: Vec::with_capacity(64),
            ref_: HashMap::new(),
        }
    }

    /// Number of live nodes.
    pub fn len(&self) -> usize {
        self.heap.len()
    }

    /// Whether the heap holds no nodes.
    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// Schedules `cb` to run after `timeout`. If `id` already has a node its
    /// expiry and callback are replaced instead.
    pub fn add(&mut self, id: Token, timeout: Duration, cb: TimeoutCallback) {
        match self.ref_.get(&id) {
            Some(&i) => {
                self.heap[i].expires = Instant::now() + timeout;
                self.heap[i].cb = cb;
                self.restore(i);
            }
            None => {
                let i = self.heap.len();
                self.ref_.insert(id, i);
                self.heap.push(TimerNode {
                    id,
                    expires: Instant::now() + timeout,
                    cb,
                });
                self.sift_up(i);
            }
        }
    }

    /// Moves `id`'s expiry to `now + timeout`, keeping its callback.
    pub fn adjust(&mut self, id: Token, timeout: Duration) {
        if let Some(&i) = self.ref_.get(&id) {
            self.heap[i].expires = Instant::now() + timeout;
            self.restore(i);
        }
    }

    /// Runs `id`'s callback now and removes the node.
    pub fn do_work(&mut self, id: Token) {
        if let Some(&i) = self.ref_.get(&id) {
            let node = self.delete(i);
            (node.cb)();
        }
    }

    /// Removes `id`'s node without running its callback.
    pub fn cancel(&mut self, id: Token) {
        if let Some(&i) = self.ref_.get(&id) {
            self.delete(i);
        }
    }

    /// Removes the root node without running its callback.
    pub fn pop(&mut self) {
        if !self.heap.is_empty() {
            self.delete(0);
        }
    }

    /// Fires every expired node's callback, removing each as it fires.
    pub fn tick(&mut self) {
        let now = Instant::now();
        while let Some(root) = self.heap.first() {
            if root.expires > now {
                break;
            }
            let node = self.delete(0);
            (node.cb)();
        }
    }

    /// Ticks, then reports how long until the next node expires, or `None`
    /// when the heap is empty (the poll may block indefinitely).
    pub fn next_tick(&mut self) -> Option<Duration> {
        self.tick();
        self.heap
            .first()
            .map(|node| node.expires.saturating_duration_since(Instant::now()))
    }

    /// Drops every node without running callbacks.
    pub fn clear(&mut self) {
        self.heap.clear();
        self.ref_.clear();
    }

    /// Removes the node at heap index `i` and restores heap order.
    fn delete(&mut self, i: usize) -> TimerNode {
        debug_assert!(i < self.heap.len());
        let last = self.heap.len() - 1;
        if i < last {
            self.swap(i, last);
        }
        let node = self.heap.pop().expect("delete on empty heap");
        self.ref_.remove(&node.id);
        if i < self.heap.len() {
            self.restore(i);
        }
        node
    }

    /// Re-establishes heap order for the node at `i`, whichever direction it
    /// is out of place.
    fn restore(&mut self, i: usize) {
        let moved = self.sift_down(i);
        if !moved {
            self.sift_up(i);
        }
    }

    fn sift_up(&mut self, mut i: usize) {
        while i > 0 {
            let parent = (i - 1) / 2;
            if self.heap[parent].expires <= self.heap[i].expires {
                break;
            }
            self.swap(i, parent);
            i = parent;
        }
    }

    /// Returns whether the node moved.
    fn sift_down(&mut self, mut i: usize) -> bool {
        let n = self.heap.len();
        let start = i;
        loop {
            let mut child = 2 * i + 1;
            if child >= n {
                break;
            }
            if child + 1 < n && self.heap[child + 1].expires < self.heap[child].expires {
                child += 1;
            }
            if self.heap[i].expires <= self.heap[child].expires {
                break;
            }
            self.swap(i, child);
            i = child;
        }
        i > start
    }

    fn swap(&mut self, i: usize, j: usize) {
        self.heap.swap(i, j);
        self.ref_.insert(self.heap[i].id, i);
        self.ref_.insert(self.heap[j].id, j);
    }
}
