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

//! Engine configuration: the typed form of the CLI option table. Primarily
//! built from parsed CLI flags (`cli::Opts::to_engine_config`), with an
//! optional RON-file overlay for scripted invocations, read the same way
//! the daemon config used to be read.

use std::fs;
use std::net::IpAddr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("could not parse config: {0}")]
    Parse(#[from] ron::Error),
    #[error("backoff factor {0} is out of the allowed range 1.0..=5.0")]
    BackoffOutOfRange(f64),
    #[error("payload size {0} exceeds the maximum of 65507 bytes")]
    PayloadTooLarge(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeMode {
    Default,
    Count(u32),
    Loop,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    pub interval_ms: u64,
    pub per_host_interval_ms: u64,
    pub initial_timeout_ms: u64,
    pub retries: u32,
    pub backoff_factor: f64,
    pub count: Option<u32>,
    pub loop_forever: bool,
    pub payload_size: usize,
    pub random_payload: bool,
    pub ttl: Option<u8>,
    pub tos: Option<u8>,
    pub dont_fragment: bool,
    pub fwmark: Option<u32>,
    pub bind_iface: Option<String>,
    pub source_addr: Option<IpAddr>,
    pub icmp_timestamp: bool,
    pub check_source: bool,
    pub report_interval_ms: u64,
    pub min_reachable: Option<usize>,
    pub fast_reachable: bool,
    pub quiet: bool,
    pub verbose: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            interval_ms: 25,
            per_host_interval_ms: 1000,
            initial_timeout_ms: 1000,
            retries: 3,
            backoff_factor: 1.0,
            count: None,
            loop_forever: false,
            payload_size: crate::icmp_codec::DEFAULT_PAYLOAD_LEN,
            random_payload: false,
            ttl: None,
            tos: None,
            dont_fragment: false,
            fwmark: None,
            bind_iface: None,
            source_addr: None,
            icmp_timestamp: false,
            check_source: false,
            report_interval_ms: 1000,
            min_reachable: None,
            fast_reachable: false,
            quiet: false,
            verbose: false,
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(1.0..=5.0).contains(&self.backoff_factor) {
            return Err(ConfigError::BackoffOutOfRange(self.backoff_factor));
        }
        if self.payload_size > crate::icmp_codec::MAX_PAYLOAD_LEN {
            return Err(ConfigError::PayloadTooLarge(self.payload_size));
        }
        Ok(())
    }

    pub fn mode(&self) -> ProbeMode {
        if self.loop_forever {
            ProbeMode::Loop
        } else if let Some(n) = self.count {
            ProbeMode::Count(n)
        } else {
            ProbeMode::Default
        }
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn per_host_interval(&self) -> Duration {
        Duration::from_millis(self.per_host_interval_ms)
    }

    pub fn initial_timeout(&self) -> Duration {
        Duration::from_millis(self.initial_timeout_ms)
    }

    pub fn report_interval(&self) -> Duration {
        Duration::from_millis(self.report_interval_ms)
    }

    /// The preallocated per-host event-slot arena size, per §4.6's
    /// "Schedule initialization".
    pub fn arena_size(&self) -> usize {
        match self.mode() {
            ProbeMode::Count(n) => n.max(1) as usize,
            ProbeMode::Loop => {
                let timeout = self.initial_timeout_ms.max(1);
                let period = self.per_host_interval_ms.max(1);
                1 + ((timeout + period - 1) / period) as usize
            }
            ProbeMode::Default => 1,
        }
    }

    pub fn from_str(contents: &str) -> Result<Self, ConfigError> {
        Ok(ron::de::from_str(contents)?)
    }

    pub fn from_filepath(filepath: &str) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(filepath)?;
        Self::from_str(&contents)
    }
}
