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

//! Target ingestion: turns CLI tokens into resolved addresses. This is an
//! external collaborator of the core engine (the engine only ever sees
//! `add_target`-style resolved addresses), implemented here so the crate
//! is a runnable binary.

use std::net::{IpAddr, Ipv4Addr};

use thiserror::Error;

pub const MAX_TARGET_NAME_LEN: usize = 255;
pub const MAX_GENERATED_ADDRESSES: usize = 131_072;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TargetError {
    #[error("target name too long")]
    NameTooLong,
    #[error("address family unsupported: {0}")]
    AddressFamilyUnsupported(String),
    #[error("could not resolve '{0}'")]
    ResolutionFailure(String),
    #[error("range/prefix '{0}' would expand to more than {MAX_GENERATED_ADDRESSES} addresses")]
    RangeTooLarge(String),
    #[error("invalid range/prefix syntax: {0}")]
    InvalidRange(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedTarget {
    pub display_name: String,
    pub address: IpAddr,
}

/// Resolves a single CLI token (literal address or hostname) to an
/// address, performing DNS resolution only when the token does not parse
/// as a literal.
pub fn resolve_target(token: &str) -> Result<ResolvedTarget, TargetError> {
    if token.len() > MAX_TARGET_NAME_LEN {
        return Err(TargetError::NameTooLong);
    }
    if let Ok(addr) = token.parse::<IpAddr>() {
        return Ok(ResolvedTarget {
            display_name: token.to_string(),
            address: addr,
        });
    }
    let addr = dns_lookup::lookup_host(token)
        .ok()
        .and_then(|addrs| addrs.into_iter().next())
        .ok_or_else(|| TargetError::ResolutionFailure(token.to_string()))?;
    Ok(ResolvedTarget {
        display_name: token.to_string(),
        address: addr,
    })
}

/// Expands a `--generate` token: either an `a.b.c.d/n` CIDR prefix or an
/// `a.b.c.d-e` last-octet range. Network and broadcast addresses are
/// excluded for prefixes shorter than `/31`.
pub fn expand_range(token: &str) -> Result<Vec<ResolvedTarget>, TargetError> {
    if let Some((base, prefix)) = token.split_once('/') {
        return expand_cidr(base, prefix, token);
    }
    if let Some((base, last)) = token.rsplit_once('-') {
        if let Some(dot) = base.rfind('.') {
            let prefix_str = &base[..dot];
            let first_octet_str = &base[dot + 1..];
            return expand_octet_range(prefix_str, first_octet_str, last, token);
        }
    }
    Err(TargetError::InvalidRange(token.to_string()))
}

fn expand_cidr(base: &str, prefix: &str, token: &str) -> Result<Vec<ResolvedTarget>, TargetError> {
    let base_addr: Ipv4Addr = base
        .parse()
        .map_err(|_| TargetError::InvalidRange(token.to_string()))?;
    let prefix_len: u32 = prefix
        .parse()
        .map_err(|_| TargetError::InvalidRange(token.to_string()))?;
    if prefix_len > 32 {
        return Err(TargetError::InvalidRange(token.to_string()));
    }

    let host_bits = 32 - prefix_len;
    let count: u64 = 1u64 << host_bits;
    if count > MAX_GENERATED_ADDRESSES as u64 {
        return Err(TargetError::RangeTooLarge(token.to_string()));
    }

    let base_u32 = u32::from(base_addr);
    let mask = if prefix_len == 0 { 0 } else { u32::MAX << host_bits };
    let network = base_u32 & mask;

    let (first, last) = if prefix_len >= 31 {
        (network, network + (count as u32 - 1))
    } else {
        (network + 1, network + (count as u32 - 2))
    };

    let mut out = Vec::new();
    let mut addr = first;
    while addr <= last {
        let ip = Ipv4Addr::from(addr);
        out.push(ResolvedTarget {
            display_name: ip.to_string(),
            address: IpAddr::V4(ip),
        });
        if addr == u32::MAX {
            break;
        }
        addr += 1;
    }
    Ok(out)
}

fn expand_octet_range(
    prefix: &str,
    first_str: &str,
    last_str: &str,
    token: &str,
) -> Result<Vec<ResolvedTarget>, TargetError> {
    let first: u8 = first_str
        .parse()
        .map_err(|_| TargetError::InvalidRange(token.to_string()))?;
    let last: u8 = last_str
        .parse()
        .map_err(|_| TargetError::InvalidRange(token.to_string()))?;
    if last < first {
        return Err(TargetError::InvalidRange(token.to_string()));
    }
    let count = (last - first) as usize + 1;
    if count > MAX_GENERATED_ADDRESSES {
        return Err(TargetError::RangeTooLarge(token.to_string()));
    }

    let mut out = Vec::with_capacity(count);
    for octet in first..=last {
        let addr_str = format!("{}.{}", prefix, octet);
        let addr: Ipv4Addr = addr_str
            .parse()
            .map_err(|_| TargetError::InvalidRange(token.to_string()))?;
        out.push(ResolvedTarget {
            display_name: addr.to_string(),
            address: IpAddr::V4(addr),
        });
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn literal_ipv4_resolves_without_dns() {
        let t = resolve_target("127.0.0.1").unwrap();
        assert_eq!(t.address, IpAddr::V4(Ipv4Addr::LOCALHOST));
        assert_eq!(t.display_name, "127.0.0.1");
    }

    #[test]
    fn literal_ipv6_resolves_without_dns() {
        let t = resolve_target("::1").unwrap();
        assert_eq!(t.address, "::1".parse::<IpAddr>().unwrap());
    }

    #[test]
    fn overlong_name_is_rejected() {
        let name = "a".repeat(MAX_TARGET_NAME_LEN + 1);
        assert_eq!(resolve_target(&name), Err(TargetError::NameTooLong));
    }

    #[test]
    fn slash_30_excludes_network_and_broadcast() {
        let out = expand_range("192.168.1.0/30").unwrap();
        let addrs: Vec<String> = out.iter().map(|t| t.display_name.clone()).collect();
        assert_eq!(addrs, vec!["192.168.1.1", "192.168.1.2"]);
    }

    #[test]
    fn slash_31_includes_both_addresses() {
        let out = expand_range("192.168.1.0/31").unwrap();
        let addrs: Vec<String> = out.iter().map(|t| t.display_name.clone()).collect();
        assert_eq!(addrs, vec!["192.168.1.0", "192.168.1.1"]);
    }

    #[test]
    fn octet_range_expands_inclusive() {
        let out = expand_range("10.0.0.5-7").unwrap();
        let addrs: Vec<String> = out.iter().map(|t| t.display_name.clone()).collect();
        assert_eq!(addrs, vec!["10.0.0.5", "10.0.0.6", "10.0.0.7"]);
    }

    #[test]
    fn oversized_prefix_is_rejected() {
        assert_eq!(
            expand_range("10.0.0.0/8"),
            Err(TargetError::RangeTooLarge("10.0.0.0/8".to_string()))
        );
    }

    #[test]
    fn malformed_range_is_rejected() {
        assert!(expand_range("not-a-range").is_err());
    }
}
