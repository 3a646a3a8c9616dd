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

//! The core probing loop: one thread, one `Engine` value, no shared
//! mutable state outside it.

use std::collections::HashMap;
use std::net::IpAddr;
use std::time::Duration;

use crate::clock::{ClockSource, TimeNs};
use crate::config::{EngineConfig, ProbeMode};
use crate::event_queue::EventQueue;
use crate::host::{HostRecord, RespState};
use crate::icmp_codec::{CodecError, Decoded, IcmpCodec, IpFamily};
use crate::reporter::{ProbeOutcome, Reporter};
use crate::seqmap::SeqMap;
use crate::signals;
use crate::socket::{IcmpTransport, RecvEvent};
use crate::targets::ResolvedTarget;

fn to_ns(d: Duration) -> TimeNs {
    d.as_nanos() as TimeNs
}

fn family_of(addr: IpAddr) -> IpFamily {
    match addr {
        IpAddr::V4(_) => IpFamily::V4,
        IpAddr::V6(_) => IpFamily::V6,
    }
}

pub struct RunSummary {
    pub total_hosts: usize,
    pub reachable_hosts: usize,
}

pub struct Engine<C: ClockSource, T: IcmpTransport> {
    clock: C,
    transport: T,
    codec: IcmpCodec,
    config: EngineConfig,
    hosts: Vec<HostRecord>,
    addr_index: HashMap<IpAddr, usize>,
    ping_q: EventQueue,
    timeout_q: EventQueue,
    seqmap: SeqMap,
    last_send_ns: TimeNs,
    next_report_ns: TimeNs,
}

impl<C: ClockSource, T: IcmpTransport> Engine<C, T> {
    pub fn new(config: EngineConfig, targets: &[ResolvedTarget], clock: C, transport: T) -> Result<Self, CodecError> {
        let arena_size = config.arena_size();
        let ident = (std::process::id() & 0xffff) as u16;
        let codec = IcmpCodec::new(ident, config.payload_size, config.random_payload, config.icmp_timestamp)?;

        let initial_timeout_ns = to_ns(config.initial_timeout());
        let max_timeout_ns = (initial_timeout_ns as f64 * config.backoff_factor.powi(config.retries as i32)) as TimeNs;
        let retention_ns = max_timeout_ns.max(initial_timeout_ns).max(1);

        let mut hosts = Vec::with_capacity(targets.len());
        let mut addr_index = HashMap::with_capacity(targets.len());
        let mut ping_q = EventQueue::with_capacity(targets.len() * arena_size);
        let timeout_q = EventQueue::with_capacity(targets.len() * arena_size);

        let now0 = clock.now_ns();
        for (i, target) in targets.iter().enumerate() {
            let host = HostRecord::new(
                i,
                target.display_name.clone(),
                target.address,
                initial_timeout_ns,
                arena_size,
                i * arena_size,
                i * arena_size,
            );
            addr_index.insert(target.address, i);
            hosts.push(host);
            let slot = i * arena_size; // slot_of(0) == 0
            ping_q.enqueue(slot, now0, i, 0);
        }

        Ok(Self {
            clock,
            transport,
            codec,
            seqmap: SeqMap::new(retention_ns),
            last_send_ns: now0 - to_ns(config.interval()),
            next_report_ns: now0 + to_ns(config.report_interval()),
            config,
            hosts,
            addr_index,
            ping_q,
            timeout_q,
        })
    }

    /// Runs until both queues drain (default/count mode) or a `finish`
    /// signal is observed (loop mode). Already-scheduled events are not
    /// drained on signal exit, per the cancellation model.
    pub fn run(&mut self, reporter: &mut dyn Reporter) -> RunSummary {
        loop {
            let now = self.clock.now_ns();

            while let Some(t) = self.timeout_q.peek_head_time() {
                if t > now {
                    break;
                }
                let (_, host_index, ping_index) = self.timeout_q.dequeue_head().unwrap();
                self.handle_timeout(host_index, ping_index, reporter);
            }

            if let Some(event_time) = self.ping_q.peek_head_time() {
                if event_time <= now && now - self.last_send_ns >= to_ns(self.config.interval()) {
                    let (_, host_index, ping_index) = self.ping_q.dequeue_head().unwrap();
                    self.transmit(host_index, ping_index);
                    if !matches!(self.config.mode(), ProbeMode::Default) {
                        self.schedule_next_ping(host_index, ping_index, event_time);
                    }
                }
            }

            if self.ping_q.is_empty() && self.timeout_q.is_empty() {
                break;
            }

            let wait_ns = self.compute_wait_ns(now);
            match self.transport.wait_recv(Duration::from_nanos(wait_ns.max(0) as u64)) {
                Ok(RecvEvent::Packet { family, src, data }) => self.handle_packet(family, src, &data, reporter),
                Ok(RecvEvent::Timeout) => {}
                Err(e) => log::warn!("receive error: {}", e),
            }
            loop {
                match self.transport.wait_recv(Duration::from_nanos(0)) {
                    Ok(RecvEvent::Packet { family, src, data }) => self.handle_packet(family, src, &data, reporter),
                    _ => break,
                }
            }

            if signals::take_status_snapshot() {
                reporter.on_interval_tick(&self.hosts);
            }
            if signals::finish_requested() {
                break;
            }

            let now = self.clock.now_ns();
            if now >= self.next_report_ns {
                reporter.on_interval_tick(&self.hosts);
                for h in &mut self.hosts {
                    h.reset_interval();
                }
                let step = to_ns(self.config.report_interval()).max(1);
                while self.next_report_ns <= now {
                    self.next_report_ns += step;
                }
            }

            if self.config.fast_reachable {
                if let Some(k) = self.config.min_reachable {
                    let reachable = self.hosts.iter().filter(|h| h.is_reachable()).count();
                    if reachable >= k {
                        break;
                    }
                }
            }
        }

        reporter.on_finish(&self.hosts);
        RunSummary {
            total_hosts: self.hosts.len(),
            reachable_hosts: self.hosts.iter().filter(|h| h.is_reachable()).count(),
        }
    }

    fn transmit(&mut self, host_index: usize, ping_index: u64) {
        let now = self.clock.now_ns();
        let family = family_of(self.hosts[host_index].resolved_address);
        let seq = self.seqmap.add(host_index, ping_index, now);
        let packet = self.codec.encode_request(family, seq);

        self.hosts[host_index].on_sent(now);
        let addr = self.hosts[host_index].resolved_address;
        match self.transport.send_to(family, addr, &packet) {
            Ok(_) => {
                self.hosts[host_index].set_resp(ping_index, RespState::Waiting);
                let slot = self.hosts[host_index].timeout_slot_base + self.hosts[host_index].slot_of(ping_index);
                let timeout_at = now + self.hosts[host_index].current_timeout_ns;
                self.timeout_q.enqueue(slot, timeout_at, host_index, ping_index);
            }
            Err(_) => {
                self.hosts[host_index].on_send_error(ping_index);
                // Count/loop chaining for this ping_index already happens
                // once in the send step regardless of outcome; see the
                // call site in `run`.
            }
        }
        self.last_send_ns = now;
    }

    fn schedule_next_ping(&mut self, host_index: usize, completed_ping_index: u64, event_time: TimeNs) {
        let next = completed_ping_index + 1;
        if let ProbeMode::Count(n) = self.config.mode() {
            if next >= n as u64 {
                return;
            }
        }
        let at = event_time + to_ns(self.config.per_host_interval());
        let slot = self.hosts[host_index].send_slot_base + self.hosts[host_index].slot_of(next);
        self.ping_q.enqueue(slot, at, host_index, next);
    }

    fn handle_timeout(&mut self, host_index: usize, ping_index: u64, reporter: &mut dyn Reporter) {
        self.hosts[host_index].on_timeout(ping_index);
        reporter.on_probe_result(&self.hosts[host_index], ping_index, &ProbeOutcome::Timeout);

        match self.config.mode() {
            ProbeMode::Default => {
                let host = &mut self.hosts[host_index];
                host.retry_attempts += 1;
                if host.retry_attempts < self.config.retries + 1 {
                    host.current_timeout_ns = ((host.current_timeout_ns as f64) * self.config.backoff_factor) as TimeNs;
                    self.transmit(host_index, ping_index);
                }
            }
            ProbeMode::Count(_) | ProbeMode::Loop => {
                // Terminal for this probe: in count/loop mode the next
                // probe was already chained in the send step, independent
                // of whether this one eventually timed out.
            }
        }
    }

    fn compute_wait_ns(&self, now: TimeNs) -> TimeNs {
        let mut earliest = self.next_report_ns;
        if let Some(t) = self.timeout_q.peek_head_time() {
            earliest = earliest.min(t);
        }
        if let Some(t) = self.ping_q.peek_head_time() {
            if t <= now {
                // Already due, but still blocked by the global interval
                // guard: the earliest it can actually fire is
                // last_send_ns + interval, not `now`. Folding the raw
                // (past) due time into `earliest` here would make the
                // wait collapse to zero and spin the loop until wall time
                // catches up on its own.
                let fires_at = self.last_send_ns + to_ns(self.config.interval());
                earliest = earliest.min(fires_at.max(now));
            } else {
                earliest = earliest.min(t);
            }
        }
        (earliest - now).max(0)
    }

    fn handle_packet(&mut self, family: IpFamily, src: IpAddr, data: &[u8], reporter: &mut dyn Reporter) {
        let decoded = match family {
            IpFamily::V4 => self.codec.decode_v4(data),
            IpFamily::V6 => self.codec.decode_v6(data),
        };
        let decoded = match decoded {
            Ok(d) => d,
            Err(_) => return,
        };

        match decoded {
            Decoded::EchoReply { seq, .. } => self.accept_reply(seq, src, None, reporter),
            Decoded::TimestampReply { seq, fields, .. } => self.accept_reply(seq, src, Some(fields), reporter),
            Decoded::EmbeddedError { seq, kind, .. } => self.handle_embedded_error(seq, kind, src, reporter),
            Decoded::Other => {}
        }
    }

    fn accept_reply(
        &mut self,
        seq: u16,
        src: IpAddr,
        timestamp: Option<crate::icmp_codec::TimestampFields>,
        reporter: &mut dyn Reporter,
    ) {
        let now = self.clock.now_ns();
        let entry = match self.seqmap.fetch(seq, now) {
            Some(e) => e,
            None => return, // unknown seq, discard silently
        };
        let host_index = entry.host_index;
        let ping_index = entry.ping_index;

        if self.config.check_source && self.hosts[host_index].resolved_address != src {
            return;
        }

        let rtt = now - entry.send_time_ns;
        if rtt < 0 || rtt > self.hosts[host_index].current_timeout_ns {
            return; // late reply, discard silently
        }

        match self.hosts[host_index].resp(ping_index) {
            RespState::Rtt(_) => {
                self.hosts[host_index].on_duplicate();
                reporter.on_probe_result(&self.hosts[host_index], ping_index, &ProbeOutcome::Duplicate);
            }
            _ => {
                let slot = self.hosts[host_index].timeout_slot_base + self.hosts[host_index].slot_of(ping_index);
                self.timeout_q.remove(slot);
                self.hosts[host_index].on_reply_accepted(ping_index, rtt);
                reporter.on_probe_result(
                    &self.hosts[host_index],
                    ping_index,
                    &ProbeOutcome::Reply { rtt_ns: rtt, timestamp },
                );
            }
        }
    }

    fn handle_embedded_error(
        &mut self,
        seq: u16,
        kind: crate::icmp_codec::IcmpErrorKind,
        src: IpAddr,
        reporter: &mut dyn Reporter,
    ) {
        let now = self.clock.now_ns();
        if let Some(entry) = self.seqmap.fetch(seq, now) {
            self.hosts[entry.host_index].on_other_icmp();
            reporter.on_probe_result(
                &self.hosts[entry.host_index],
                entry.ping_index,
                &ProbeOutcome::OtherIcmp { kind, source: src },
            );
            // Outstanding probe stays pending: it is allowed to time out on
            // its own schedule rather than being resolved here.
        }
    }

    pub fn hosts(&self) -> &[HostRecord] {
        &self.hosts
    }

    #[cfg(test)]
    pub fn host_by_addr(&self, addr: IpAddr) -> Option<&HostRecord> {
        self.addr_index.get(&addr).map(|&i| &self.hosts[i])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::socket::fake::FakeTransport;
    use std::net::Ipv4Addr;

    struct NullReporter;
    impl Reporter for NullReporter {
        fn on_probe_result(&mut self, _: &HostRecord, _: u64, _: &ProbeOutcome) {}
        fn on_interval_tick(&mut self, _: &[HostRecord]) {}
        fn on_finish(&mut self, _: &[HostRecord]) {}
    }

    fn target(addr: &str) -> ResolvedTarget {
        ResolvedTarget {
            display_name: addr.to_string(),
            address: addr.parse().unwrap(),
        }
    }

    fn reply_for(codec: &IcmpCodec, seq: u16) -> Vec<u8> {
        let mut pkt = codec.encode_request(IpFamily::V4, seq);
        pkt[0] = crate::icmp_codec::ICMP_ECHO_REPLY;
        byteorder::BigEndian::write_u16(&mut pkt[2..4], 0);
        let sum = crate::icmp_codec::checksum(&pkt);
        byteorder::BigEndian::write_u16(&mut pkt[2..4], sum);
        let mut datagram = vec![0x45u8, 0, 0, 0, 0, 0, 0, 0, 64, 1, 0, 0, 127, 0, 0, 1, 127, 0, 0, 1];
        datagram.extend_from_slice(&pkt);
        datagram
    }

    #[test]
    fn default_mode_accepts_an_immediate_reply() {
        let mut cfg = EngineConfig::default();
        cfg.interval_ms = 0;
        let targets = vec![target("127.0.0.1")];
        let clock = ManualClock::new();
        let mut transport = FakeTransport::default();

        // Seed the reply before running: the engine's first iteration
        // sends, and the very next wait_recv call drains this queued
        // datagram. The ident/seq must match what the engine is about to
        // send, so build the codec with the same derived ident.
        let ident = (std::process::id() & 0xffff) as u16;
        let codec = IcmpCodec::new(ident, cfg.payload_size, false, false).unwrap();
        transport.push_reply(IpFamily::V4, Ipv4Addr::LOCALHOST.into(), reply_for(&codec, 0));

        let mut engine = Engine::new(cfg, &targets, clock, transport).unwrap();
        let mut reporter = NullReporter;
        let summary = engine.run(&mut reporter);

        assert_eq!(summary.total_hosts, 1);
        assert_eq!(summary.reachable_hosts, 1);
        let host = engine.host_by_addr(Ipv4Addr::LOCALHOST.into()).unwrap();
        assert_eq!(host.cumulative.recv_unique, 1);
        assert_eq!(host.cumulative.sent, 1);
    }

    #[test]
    fn default_mode_exhausts_retries_on_silence() {
        let mut cfg = EngineConfig::default();
        cfg.interval_ms = 0;
        cfg.initial_timeout_ms = 10;
        cfg.retries = 2;
        cfg.backoff_factor = 1.0;
        let targets = vec![target("192.0.2.1")];
        let clock = std::rc::Rc::new(ManualClock::new());
        let mut transport = FakeTransport::default();
        transport.advance_clock_on_timeout = Some(clock.clone());

        let mut engine = Engine::new(cfg, &targets, clock, transport).unwrap();
        let mut reporter = NullReporter;
        let summary = engine.run(&mut reporter);

        assert_eq!(summary.reachable_hosts, 0);
        let host = engine.host_by_addr("192.0.2.1".parse().unwrap()).unwrap();
        assert_eq!(host.cumulative.sent, 3); // initial attempt + 2 retries
        assert_eq!(host.cumulative.timeouts, 3);
    }

    #[test]
    fn count_mode_sends_exactly_the_requested_number() {
        let mut cfg = EngineConfig::default();
        cfg.interval_ms = 0;
        cfg.per_host_interval_ms = 0;
        cfg.count = Some(5);
        let targets = vec![target("192.0.2.1")];
        let clock = std::rc::Rc::new(ManualClock::new());
        let mut transport = FakeTransport::default();
        transport.advance_clock_on_timeout = Some(clock.clone());
        let mut engine = Engine::new(cfg, &targets, clock, transport).unwrap();
        let mut reporter = NullReporter;
        let summary = engine.run(&mut reporter);
        assert_eq!(summary.reachable_hosts, 0);
        let host = engine.host_by_addr("192.0.2.1".parse().unwrap()).unwrap();
        assert_eq!(host.cumulative.sent, 5);
        assert_eq!(host.cumulative.timeouts, 5);
    }
}
