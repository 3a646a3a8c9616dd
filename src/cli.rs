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

//! Command-line surface: one `clap` struct, translated into an
//! `EngineConfig` plus the raw target tokens the binary still has to
//! resolve.

use std::net::IpAddr;

use clap::Parser;

use crate::config::EngineConfig;

#[derive(Debug, Parser)]
#[clap(name = "fping", about = "Parallel ICMP reachability prober")]
pub struct Opts {
    /// Hosts or addresses to probe.
    pub targets: Vec<String>,

    #[clap(short, long = "file")]
    pub file: Option<String>,

    /// CIDR (a.b.c.d/n) or range (a.b.c.d-e) to expand into targets.
    #[clap(long = "generate")]
    pub generate: Vec<String>,

    #[clap(short, long, default_value = "25")]
    pub interval: u64,

    #[clap(short, long, default_value = "1000")]
    pub period: u64,

    #[clap(short, long, default_value = "1000")]
    pub timeout: u64,

    #[clap(short, long, default_value = "3")]
    pub retry: u32,

    #[clap(short = 'B', long, default_value = "1.0")]
    pub backoff: f64,

    #[clap(short, long)]
    pub count: Option<u32>,

    #[clap(short = 'l', long = "loop")]
    pub loop_forever: bool,

    #[clap(short = 'b', long = "size", default_value = "56")]
    pub size: usize,

    #[clap(long)]
    pub random: bool,

    #[clap(long)]
    pub ttl: Option<u8>,

    #[clap(long)]
    pub tos: Option<u8>,

    #[clap(short = 'M', long = "dont-fragment")]
    pub dont_fragment: bool,

    #[clap(long)]
    pub fwmark: Option<u32>,

    #[clap(short = 'I', long = "iface")]
    pub iface: Option<String>,

    #[clap(short = 'S', long = "src")]
    pub src: Option<IpAddr>,

    #[clap(short = 'T', long = "icmp-timestamp")]
    pub icmp_timestamp: bool,

    #[clap(short = 'A', long = "check-source")]
    pub check_source: bool,

    #[clap(long = "report-interval", default_value = "1000")]
    pub report_interval: u64,

    #[clap(short = 'm', long = "min-reachable")]
    pub min_reachable: Option<usize>,

    #[clap(short = 'x', long = "fast-reachable")]
    pub fast_reachable: bool,

    #[clap(short, long)]
    pub quiet: bool,

    #[clap(short, long)]
    pub verbose: bool,

    /// Optional RON config file overlay; CLI flags left at their default
    /// value are replaced by whatever the file specifies.
    #[clap(long)]
    pub config: Option<String>,
}

impl Opts {
    /// Builds the engine configuration from parsed flags, then lets a
    /// `--config` file (if any) fully replace it — the file is meant for
    /// scripted/reproducible invocations, not for incremental overrides.
    pub fn to_engine_config(&self) -> Result<EngineConfig, crate::config::ConfigError> {
        if let Some(path) = &self.config {
            let cfg = EngineConfig::from_filepath(path)?;
            cfg.validate()?;
            return Ok(cfg);
        }

        let cfg = EngineConfig {
            interval_ms: self.interval,
            per_host_interval_ms: self.period,
            initial_timeout_ms: self.timeout,
            retries: self.retry,
            backoff_factor: self.backoff,
            count: self.count,
            loop_forever: self.loop_forever,
            payload_size: self.size,
            random_payload: self.random,
            ttl: self.ttl,
            tos: self.tos,
            dont_fragment: self.dont_fragment,
            fwmark: self.fwmark,
            bind_iface: self.iface.clone(),
            source_addr: self.src,
            icmp_timestamp: self.icmp_timestamp,
            check_source: self.check_source,
            report_interval_ms: self.report_interval,
            min_reachable: self.min_reachable,
            fast_reachable: self.fast_reachable,
            quiet: self.quiet,
            verbose: self.verbose,
        };
        cfg.validate()?;
        Ok(cfg)
    }
}
