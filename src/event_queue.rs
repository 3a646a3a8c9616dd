// Copyright 2020 Google LLC
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

//! A time-sorted doubly-linked event queue over a flat, index-addressed
//! arena. Two instances of this queue exist in the engine: one for
//! scheduled sends (`ping_q`), one for outstanding deadlines (`timeout_q`).
//!
//! Pointer-based intrusive lists need unsafe aliasing in Rust, so instead
//! each host reserves a contiguous range of slots in the arena at
//! ingestion time, and `prev`/`next` are `Option<usize>` indices into that
//! same `Vec`.

use crate::clock::TimeNs;

#[derive(Debug, Clone, Copy)]
struct EventSlot {
    time_ns: TimeNs,
    host_index: usize,
    ping_index: u64,
    in_queue: bool,
    prev: Option<usize>,
    next: Option<usize>,
}

impl EventSlot {
    fn unused() -> Self {
        Self {
            time_ns: 0,
            host_index: 0,
            ping_index: 0,
            in_queue: false,
            prev: None,
            next: None,
        }
    }
}

/// A time-sorted queue over a preallocated arena of event slots.
///
/// Slot indices are stable for the lifetime of the queue: a host's slot at
/// `base + (ping_index % s)` is always the same `usize`, which lets the
/// engine address events directly instead of searching for them.
pub struct EventQueue {
    slots: Vec<EventSlot>,
    head: Option<usize>,
    tail: Option<usize>,
}

impl EventQueue {
    /// Creates a queue with `capacity` preallocated (unused) slots.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            slots: vec![EventSlot::unused(); capacity],
            head: None,
            tail: None,
        }
    }

    /// Grows the arena to at least `capacity` slots. Used when hosts are
    /// added incrementally during target ingestion.
    pub fn reserve(&mut self, capacity: usize) {
        if self.slots.len() < capacity {
            self.slots.resize(capacity, EventSlot::unused());
        }
    }

    pub fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    pub fn peek_head_time(&self) -> Option<TimeNs> {
        self.head.map(|h| self.slots[h].time_ns)
    }

    pub fn peek_head(&self) -> Option<(usize, usize, u64)> {
        self.head
            .map(|h| (h, self.slots[h].host_index, self.slots[h].ping_index))
    }

    /// O(n) insert scanning from the tail; on ties, new entries land after
    /// existing ones (FIFO among same-time events).
    pub fn enqueue(&mut self, slot_index: usize, time_ns: TimeNs, host_index: usize, ping_index: u64) {
        debug_assert!(!self.slots[slot_index].in_queue, "slot already queued");
        self.slots[slot_index] = EventSlot {
            time_ns,
            host_index,
            ping_index,
            in_queue: true,
            prev: None,
            next: None,
        };

        let mut cursor = self.tail;
        while let Some(c) = cursor {
            if self.slots[c].time_ns <= time_ns {
                break;
            }
            cursor = self.slots[c].prev;
        }

        match cursor {
            None => {
                // New head.
                let old_head = self.head;
                self.slots[slot_index].next = old_head;
                if let Some(h) = old_head {
                    self.slots[h].prev = Some(slot_index);
                }
                self.head = Some(slot_index);
                if self.tail.is_none() {
                    self.tail = Some(slot_index);
                }
            }
            Some(c) => {
                let after = self.slots[c].next;
                self.slots[slot_index].prev = Some(c);
                self.slots[slot_index].next = after;
                self.slots[c].next = Some(slot_index);
                match after {
                    Some(a) => self.slots[a].prev = Some(slot_index),
                    None => self.tail = Some(slot_index),
                }
            }
        }
    }

    /// Removes `slot_index` from the queue. A no-op if it is not currently
    /// queued: late/duplicate receive handling can legitimately race
    /// against a slot that was already removed.
    pub fn remove(&mut self, slot_index: usize) {
        if !self.slots[slot_index].in_queue {
            return;
        }
        let prev = self.slots[slot_index].prev;
        let next = self.slots[slot_index].next;
        match prev {
            Some(p) => self.slots[p].next = next,
            None => self.head = next,
        }
        match next {
            Some(n) => self.slots[n].prev = prev,
            None => self.tail = prev,
        }
        self.slots[slot_index].in_queue = false;
        self.slots[slot_index].prev = None;
        self.slots[slot_index].next = None;
    }

    pub fn dequeue_head(&mut self) -> Option<(usize, usize, u64)> {
        let head = self.head?;
        let host_index = self.slots[head].host_index;
        let ping_index = self.slots[head].ping_index;
        self.remove(head);
        Some((head, host_index, ping_index))
    }

    pub fn is_queued(&self, slot_index: usize) -> bool {
        self.slots[slot_index].in_queue
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enqueue_dequeue_orders_by_time() {
        let mut q = EventQueue::with_capacity(4);
        q.enqueue(0, 300, 0, 0);
        q.enqueue(1, 100, 1, 0);
        q.enqueue(2, 200, 2, 0);

        assert_eq!(q.peek_head_time(), Some(100));
        assert_eq!(q.dequeue_head(), Some((1, 1, 0)));
        assert_eq!(q.dequeue_head(), Some((2, 2, 0)));
        assert_eq!(q.dequeue_head(), Some((0, 0, 0)));
        assert!(q.is_empty());
    }

    #[test]
    fn equal_time_entries_are_fifo() {
        let mut q = EventQueue::with_capacity(4);
        q.enqueue(0, 100, 10, 0);
        q.enqueue(1, 100, 20, 0);
        q.enqueue(2, 100, 30, 0);

        assert_eq!(q.dequeue_head().unwrap().1, 10);
        assert_eq!(q.dequeue_head().unwrap().1, 20);
        assert_eq!(q.dequeue_head().unwrap().1, 30);
    }

    #[test]
    fn remove_unlinks_arbitrary_slot() {
        let mut q = EventQueue::with_capacity(4);
        q.enqueue(0, 100, 0, 0);
        q.enqueue(1, 200, 1, 0);
        q.enqueue(2, 300, 2, 0);

        q.remove(1);
        assert!(!q.is_queued(1));
        assert_eq!(q.dequeue_head(), Some((0, 0, 0)));
        assert_eq!(q.dequeue_head(), Some((2, 2, 0)));
        assert!(q.is_empty());
    }

    #[test]
    fn remove_of_unqueued_slot_is_noop() {
        let mut q = EventQueue::with_capacity(2);
        q.remove(0);
        assert!(q.is_empty());
    }

    #[test]
    fn head_is_always_earliest_after_mixed_ops() {
        let mut q = EventQueue::with_capacity(8);
        let times = [500, 100, 900, 50, 300, 700];
        for (i, t) in times.iter().enumerate() {
            q.enqueue(i, *t, i, 0);
        }
        q.remove(2); // drop the 900
        let mut out = Vec::new();
        while let Some((_, h, _)) = q.dequeue_head() {
            out.push(times[h]);
        }
        let mut sorted = out.clone();
        sorted.sort_unstable();
        assert_eq!(out, sorted);
    }
}
