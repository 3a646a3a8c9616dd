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

//! Direct-mapped table correlating outgoing ICMP sequence numbers to the
//! probe that sent them.

use crate::clock::TimeNs;

#[derive(Debug, Clone, Copy)]
pub struct SeqEntry {
    pub host_index: usize,
    pub ping_index: u64,
    pub send_time_ns: TimeNs,
}

/// Table size defaults to the full 16-bit sequence space, so `seq mod N ==
/// seq` and any send rate this tool can express satisfies `N > send_rate *
/// max_timeout`.
pub const DEFAULT_TABLE_SIZE: usize = 1 << 16;

pub struct SeqMap {
    slots: Vec<Option<SeqEntry>>,
    next_seq: u16,
    retention_ns: TimeNs,
}

impl SeqMap {
    pub fn new(retention_ns: TimeNs) -> Self {
        Self::with_table_size(DEFAULT_TABLE_SIZE, retention_ns)
    }

    pub fn with_table_size(table_size: usize, retention_ns: TimeNs) -> Self {
        assert!(table_size.is_power_of_two(), "seqmap size must be a power of two");
        Self {
            slots: vec![None; table_size],
            next_seq: 0,
            retention_ns,
        }
    }

    fn index_of(&self, seq: u16) -> usize {
        (seq as usize) & (self.slots.len() - 1)
    }

    /// Advances the sequence counter, overwrites the slot unconditionally
    /// (newest-insertion-wins), and returns the chosen sequence number.
    pub fn add(&mut self, host_index: usize, ping_index: u64, now_ns: TimeNs) -> u16 {
        let seq = self.next_seq;
        self.next_seq = self.next_seq.wrapping_add(1);
        let idx = self.index_of(seq);
        self.slots[idx] = Some(SeqEntry {
            host_index,
            ping_index,
            send_time_ns: now_ns,
        });
        seq
    }

    /// Returns the entry for `seq` if present and still within the
    /// retention window. Does not remove the entry: a duplicate physical
    /// reply arriving shortly after the first is still expected to find
    /// it (see the engine's duplicate-handling logic, which keys off
    /// `resp_times`, not seqmap presence).
    pub fn fetch(&self, seq: u16, now_ns: TimeNs) -> Option<SeqEntry> {
        let idx = self.index_of(seq);
        match self.slots[idx] {
            Some(entry) if now_ns - entry.send_time_ns <= self.retention_ns => Some(entry),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_then_fetch_roundtrips() {
        let mut m = SeqMap::new(1_000_000_000);
        let seq = m.add(3, 7, 1_000);
        let entry = m.fetch(seq, 1_500).expect("entry present");
        assert_eq!(entry.host_index, 3);
        assert_eq!(entry.ping_index, 7);
        assert_eq!(entry.send_time_ns, 1_000);
    }

    #[test]
    fn fetch_after_retention_window_misses() {
        let mut m = SeqMap::new(100);
        let seq = m.add(0, 0, 0);
        assert!(m.fetch(seq, 50).is_some());
        assert!(m.fetch(seq, 101).is_none());
    }

    #[test]
    fn newest_insertion_overwrites_same_slot() {
        let mut m = SeqMap::with_table_size(4, 1_000);
        let seq_a = m.add(1, 0, 0); // occupies slot 0
        let seq_b = m.add(2, 0, 10); // slot 1
        let seq_c = m.add(3, 0, 20); // slot 2
        let seq_d = m.add(4, 0, 30); // slot 3
        let seq_e = m.add(5, 0, 40); // wraps back to slot 0, overwrites seq_a

        assert!(m.fetch(seq_a, 40).is_none());
        let entry = m.fetch(seq_e, 40).unwrap();
        assert_eq!(entry.host_index, 5);
        let _ = (seq_b, seq_c, seq_d);
    }

    #[test]
    fn unknown_seq_misses() {
        let m = SeqMap::new(1_000);
        assert!(m.fetch(12345, 0).is_none());
    }
}
