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

//! The reporter interface the engine drives, plus the console
//! implementation that ships with the binary.

use std::collections::HashSet;
use std::net::IpAddr;

use crate::clock::TimeNs;
use crate::host::HostRecord;
use crate::icmp_codec::{IcmpErrorKind, TimestampFields};

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ProbeOutcome {
    Reply {
        rtt_ns: TimeNs,
        timestamp: Option<TimestampFields>,
    },
    Duplicate,
    Timeout,
    SendError,
    OtherIcmp { kind: IcmpErrorKind, source: IpAddr },
}

pub trait Reporter {
    fn on_probe_result(&mut self, host: &HostRecord, ping_index: u64, outcome: &ProbeOutcome);
    fn on_interval_tick(&mut self, hosts: &[HostRecord]);
    fn on_finish(&mut self, hosts: &[HostRecord]);
}

/// Prints the textual output a user invoking the binary actually sees.
pub struct ConsoleReporter {
    quiet: bool,
    verbose: bool,
    reported_alive: HashSet<usize>,
}

impl ConsoleReporter {
    pub fn new(quiet: bool, verbose: bool) -> Self {
        Self {
            quiet,
            verbose,
            reported_alive: HashSet::new(),
        }
    }

    fn summary_line(name: &str, h: &HostRecord) -> String {
        let c = &h.cumulative;
        if c.recv_unique > c.sent {
            // A late reply accepted after its probe already timed out can
            // push recv_unique above sent, which breaks the usual
            // xmt/rcv/%loss arithmetic. Switch to a %return rendering
            // instead of printing a nonsensical negative loss.
            let pct = 100.0 * c.recv_unique as f64 / c.sent.max(1) as f64;
            format!("{} : xmt={}, rcv={}, {:.0}% return", name, c.sent, c.recv_unique, pct)
        } else {
            let (min, avg, max) = (
                c.min_rtt_ns.unwrap_or(0) as f64 / 1_000_000.0,
                c.avg_rtt_ns().unwrap_or(0) as f64 / 1_000_000.0,
                c.max_rtt_ns.unwrap_or(0) as f64 / 1_000_000.0,
            );
            format!(
                "{} : xmt/rcv/%loss = {}/{}/{:.0}%, min/avg/max = {:.3}/{:.3}/{:.3}",
                name, c.sent, c.recv_unique, c.loss_percent(), min, avg, max
            )
        }
    }
}

impl Reporter for ConsoleReporter {
    fn on_probe_result(&mut self, host: &HostRecord, ping_index: u64, outcome: &ProbeOutcome) {
        match outcome {
            ProbeOutcome::Reply { rtt_ns, timestamp } => {
                if self.reported_alive.insert(host.index) && !self.quiet {
                    println!("{} is alive", host.display_name);
                }
                if let Some(fields) = timestamp {
                    println!(
                        "Originate={} Receive={} Transmit={}",
                        fields.originate_ms, fields.receive_ms, fields.transmit_ms
                    );
                }
                if self.verbose {
                    log::debug!("{} ping_index={} rtt={}ns", host.display_name, ping_index, rtt_ns);
                }
            }
            ProbeOutcome::Duplicate => {
                if self.verbose {
                    log::debug!("{} ping_index={} duplicate reply", host.display_name, ping_index);
                }
            }
            ProbeOutcome::Timeout => {
                if self.verbose {
                    log::debug!("{} ping_index={} timed out", host.display_name, ping_index);
                }
            }
            ProbeOutcome::SendError => {
                log::warn!("{} ping_index={} send failed", host.display_name, ping_index);
            }
            ProbeOutcome::OtherIcmp { kind, source } => {
                log::warn!("{} ping_index={} icmp error {:?} from {}", host.display_name, ping_index, kind, source);
            }
        }
    }

    fn on_interval_tick(&mut self, hosts: &[HostRecord]) {
        if self.quiet {
            return;
        }
        for h in hosts {
            println!("{}", Self::summary_line(&h.display_name, h));
        }
    }

    fn on_finish(&mut self, hosts: &[HostRecord]) {
        for h in hosts {
            if !h.is_reachable() {
                eprintln!("{} is unreachable", h.display_name);
            }
        }
        for h in hosts {
            println!("{}", Self::summary_line(&h.display_name, h));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn host() -> HostRecord {
        HostRecord::new(0, "203.0.113.1".into(), IpAddr::V4(Ipv4Addr::new(203, 0, 113, 1)), 1_000_000_000, 1, 0, 1)
    }

    #[test]
    fn summary_line_uses_return_sentinel_when_recv_unique_exceeds_sent() {
        let mut h = host();
        h.on_sent(0);
        h.on_reply_accepted(0, 10_000_000);
        h.cumulative.recv_unique = 2; // force the otherwise-unreachable condition
        let line = ConsoleReporter::summary_line(&h.display_name, &h);
        assert!(line.contains("% return"), "line was: {}", line);
    }

    #[test]
    fn summary_line_uses_loss_format_in_the_normal_case() {
        let mut h = host();
        h.on_sent(0);
        h.on_reply_accepted(0, 10_000_000);
        let line = ConsoleReporter::summary_line(&h.display_name, &h);
        assert!(line.contains("xmt/rcv/%loss"), "line was: {}", line);
    }

    #[test]
    fn reported_alive_only_once() {
        let mut reporter = ConsoleReporter::new(false, false);
        let h = host();
        assert!(reporter.reported_alive.insert(h.index) == true);
        assert!(!reporter.reported_alive.insert(h.index));
    }
}
