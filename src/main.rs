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

#[macro_use]
extern crate log;
extern crate env_logger;

use clap::Parser;

use fping_rs::cli::Opts;
use fping_rs::clock::MonotonicClock;
use fping_rs::error::AppError;
use fping_rs::reporter::ConsoleReporter;
use fping_rs::socket::{RawIcmpTransport, SocketOptions};
use fping_rs::targets::{self, ResolvedTarget};
use fping_rs::{engine, signals};

fn main() {
    env_logger::init();
    signals::install();
    std::process::exit(run(Opts::parse()));
}

fn run(opts: Opts) -> i32 {
    let config = match opts.to_engine_config() {
        Ok(cfg) => cfg,
        Err(e) => return report_fatal(AppError::Config(e)),
    };

    let (targets, resolution_failed) = match ingest_targets(&opts) {
        Ok(t) => t,
        Err(e) => return report_fatal(e),
    };
    if targets.is_empty() {
        return report_fatal(AppError::InvalidArgs("no targets specified".to_string()));
    }

    let need_v4 = targets.iter().any(|t| t.address.is_ipv4());
    let need_v6 = targets.iter().any(|t| t.address.is_ipv6());
    let socket_opts = SocketOptions {
        ttl: config.ttl.map(u32::from),
        tos: config.tos.map(u32::from),
        dont_fragment: config.dont_fragment,
        fwmark: config.fwmark,
        bind_iface: config.bind_iface.clone(),
        source_addr: config.source_addr,
    };
    let transport = match RawIcmpTransport::new(need_v4, need_v6, &socket_opts) {
        Ok(t) => t,
        Err(e) => return report_fatal(AppError::SocketSetup(e)),
    };

    let required_reachable = config.min_reachable.unwrap_or(targets.len());
    let mut reporter = ConsoleReporter::new(config.quiet, config.verbose);

    let mut engine = match engine::Engine::new(config, &targets, MonotonicClock::new(), transport) {
        Ok(e) => e,
        Err(e) => {
            error!("invalid codec configuration: {}", e);
            return 3;
        }
    };

    let summary = engine.run(&mut reporter);

    if resolution_failed {
        return 2;
    }
    if summary.reachable_hosts < required_reachable {
        1
    } else {
        0
    }
}

fn report_fatal(err: AppError) -> i32 {
    eprintln!("fping: {}", err);
    err.exit_code()
}

/// Resolves positional targets, `-f` file targets, and `--generate`
/// ranges into one flat list, tracking whether any individual token
/// failed to resolve (a non-fatal, exit-2-at-the-end condition).
fn ingest_targets(opts: &Opts) -> Result<(Vec<ResolvedTarget>, bool), AppError> {
    let mut targets = Vec::new();
    let mut resolution_failed = false;

    for token in &opts.targets {
        match targets::resolve_target(token) {
            Ok(t) => targets.push(t),
            Err(e) => {
                warn!("{}", e);
                resolution_failed = true;
            }
        }
    }

    if let Some(path) = &opts.file {
        let contents = std::fs::read_to_string(path).map_err(AppError::TargetFile)?;
        for line in contents.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match targets::resolve_target(line) {
                Ok(t) => targets.push(t),
                Err(e) => {
                    warn!("{}", e);
                    resolution_failed = true;
                }
            }
        }
    }

    for pattern in &opts.generate {
        let expanded = targets::expand_range(pattern)?;
        targets.extend(expanded);
    }

    Ok((targets, resolution_failed))
}
