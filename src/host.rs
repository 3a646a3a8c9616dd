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

//! Per-target state: address, counters, and the bounded response-time
//! array used for duplicate detection.

use std::net::IpAddr;

use crate::clock::TimeNs;

/// Outcome recorded for a single ping index, addressed by `ping_index mod
/// arena_size`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RespState {
    Unused,
    Waiting,
    Error,
    Timeout,
    Rtt(TimeNs),
}

/// A set of counters, duplicated for the cumulative (whole-run) and
/// interval (reset every report tick) views.
#[derive(Debug, Clone, Copy, Default)]
pub struct Counters {
    pub sent: u64,
    pub recv_unique: u64,
    pub recv_total: u64,
    pub timeouts: u64,
    pub send_errors: u64,
    pub other_icmp: u64,
    pub min_rtt_ns: Option<TimeNs>,
    pub max_rtt_ns: Option<TimeNs>,
    pub sum_rtt_ns: i64,
}

impl Counters {
    fn record_rtt(&mut self, rtt_ns: TimeNs) {
        self.min_rtt_ns = Some(self.min_rtt_ns.map_or(rtt_ns, |m| m.min(rtt_ns)));
        self.max_rtt_ns = Some(self.max_rtt_ns.map_or(rtt_ns, |m| m.max(rtt_ns)));
        self.sum_rtt_ns += rtt_ns;
    }

    pub fn avg_rtt_ns(&self) -> Option<TimeNs> {
        if self.recv_unique == 0 {
            None
        } else {
            Some(self.sum_rtt_ns / self.recv_unique as i64)
        }
    }

    pub fn loss_percent(&self) -> f64 {
        if self.sent == 0 {
            0.0
        } else {
            100.0 * (1.0 - (self.recv_unique as f64 / self.sent as f64))
        }
    }
}

pub struct HostRecord {
    pub index: usize,
    pub display_name: String,
    pub resolved_address: IpAddr,
    pub initial_timeout_ns: TimeNs,
    pub current_timeout_ns: TimeNs,
    pub last_send_ns: TimeNs,
    pub cumulative: Counters,
    pub interval: Counters,
    resp_times: Vec<RespState>,
    /// Number of attempts (including retries) made for the in-flight ping
    /// index in default mode; unused in count/loop mode.
    pub retry_attempts: u32,
    pub send_slot_base: usize,
    pub timeout_slot_base: usize,
    pub arena_size: usize,
}

impl HostRecord {
    pub fn new(
        index: usize,
        display_name: String,
        resolved_address: IpAddr,
        initial_timeout_ns: TimeNs,
        arena_size: usize,
        send_slot_base: usize,
        timeout_slot_base: usize,
    ) -> Self {
        Self {
            index,
            display_name,
            resolved_address,
            initial_timeout_ns,
            current_timeout_ns: initial_timeout_ns,
            last_send_ns: 0,
            cumulative: Counters::default(),
            interval: Counters::default(),
            resp_times: vec![RespState::Unused; arena_size.max(1)],
            retry_attempts: 0,
            send_slot_base,
            timeout_slot_base,
            arena_size: arena_size.max(1),
        }
    }

    pub fn slot_of(&self, ping_index: u64) -> usize {
        (ping_index as usize) % self.arena_size
    }

    pub fn resp(&self, ping_index: u64) -> RespState {
        self.resp_times[self.slot_of(ping_index)]
    }

    pub fn set_resp(&mut self, ping_index: u64, state: RespState) {
        let slot = self.slot_of(ping_index);
        self.resp_times[slot] = state;
    }

    pub fn on_sent(&mut self, now_ns: TimeNs) {
        self.cumulative.sent += 1;
        self.interval.sent += 1;
        self.last_send_ns = now_ns;
    }

    pub fn on_send_error(&mut self, ping_index: u64) {
        self.set_resp(ping_index, RespState::Error);
        self.cumulative.send_errors += 1;
        self.interval.send_errors += 1;
    }

    pub fn on_timeout(&mut self, ping_index: u64) {
        self.set_resp(ping_index, RespState::Timeout);
        self.cumulative.timeouts += 1;
        self.interval.timeouts += 1;
    }

    pub fn on_reply_accepted(&mut self, ping_index: u64, rtt_ns: TimeNs) {
        self.set_resp(ping_index, RespState::Rtt(rtt_ns));
        self.cumulative.recv_unique += 1;
        self.cumulative.recv_total += 1;
        self.cumulative.record_rtt(rtt_ns);
        self.interval.recv_unique += 1;
        self.interval.recv_total += 1;
        self.interval.record_rtt(rtt_ns);
    }

    pub fn on_duplicate(&mut self) {
        self.cumulative.recv_total += 1;
        self.interval.recv_total += 1;
    }

    pub fn on_other_icmp(&mut self) {
        self.cumulative.other_icmp += 1;
        self.interval.other_icmp += 1;
    }

    pub fn reset_interval(&mut self) {
        self.interval = Counters::default();
    }

    /// Number of probes whose arena slot is still `Waiting` at run end.
    pub fn waiting_at_end(&self) -> u64 {
        self.resp_times
            .iter()
            .filter(|s| matches!(s, RespState::Waiting))
            .count() as u64
    }

    pub fn is_reachable(&self) -> bool {
        self.cumulative.recv_unique > 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn host(arena: usize) -> HostRecord {
        HostRecord::new(
            0,
            "127.0.0.1".into(),
            IpAddr::V4(Ipv4Addr::LOCALHOST),
            100_000_000,
            arena,
            0,
            arena,
        )
    }

    #[test]
    fn sent_equals_sum_of_terminal_outcomes() {
        let mut h = host(4);
        h.on_sent(0);
        h.set_resp(0, RespState::Waiting);
        h.on_reply_accepted(0, 5_000_000);

        h.on_sent(10);
        h.set_resp(1, RespState::Waiting);
        h.on_timeout(1);

        h.on_sent(20);
        h.on_send_error(2);

        h.on_sent(30);
        h.set_resp(3, RespState::Waiting);

        let c = &h.cumulative;
        let total =
            c.recv_unique + c.timeouts + c.send_errors + h.waiting_at_end();
        assert_eq!(c.sent, total);
    }

    #[test]
    fn duplicate_does_not_change_recv_unique() {
        let mut h = host(1);
        h.on_sent(0);
        h.on_reply_accepted(0, 1_000);
        assert_eq!(h.cumulative.recv_unique, 1);
        h.on_duplicate();
        assert_eq!(h.cumulative.recv_unique, 1);
        assert_eq!(h.cumulative.recv_total, 2);
    }

    #[test]
    fn min_avg_max_are_consistent() {
        let mut h = host(8);
        for (i, rtt) in [10i64, 30, 20].into_iter().enumerate() {
            h.on_sent(0);
            h.on_reply_accepted(i as u64, rtt);
        }
        let c = h.cumulative;
        let avg = c.avg_rtt_ns().unwrap();
        assert!(c.min_rtt_ns.unwrap() <= avg);
        assert!(avg <= c.max_rtt_ns.unwrap());
    }
}
