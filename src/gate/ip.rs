// Copyright 2026 the vakt authors
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

//! CIDR-aware client IP allowlist.

use std::net::IpAddr;

use tracing::warn;

use crate::config::IpWhitelistConfig;

/// Outcome of matching a client address against the configured list.
#[derive(Debug, PartialEq, Eq)]
pub enum IpDecision {
    /// Address matched a literal or CIDR entry, or the filter is disabled.
    Allowed,
    /// No entry matched.
    Denied,
    /// The configured entry set could not be interpreted for this family.
    Invalid,
}

#[derive(Debug)]
enum Entry {
    Literal(IpAddr),
    CidrV4 { net: u32, mask: u32 },
    CidrV6 { net: u128, mask: u128 },
}

/// Allow/deny decision against configured literals and CIDR blocks.
///
/// An enabled filter with an empty (or fully unparseable) entry list denies
/// every client.
#[derive(Debug)]
pub struct IpFilter {
    enabled: bool,
    entries: Vec<Entry>,
}

impl IpFilter {
    /// Parses the configured entries; malformed ones are logged and skipped.
    pub fn from_config(config: &IpWhitelistConfig) -> Self {
        let mut entries = Vec::with_capacity(config.entries.len());
        for raw in &config.entries {
            match parse_entry(raw) {
                Some(entry) => entries.push(entry),
                None => warn!(entry = %raw, "ignoring unparseable ip_whitelist entry"),
            }
        }
        Self {
            enabled: config.enabled,
            entries,
        }
    }

    /// Matches `addr` against the list.
    pub fn check(&self, addr: IpAddr) -> IpDecision {
        if !self.enabled {
            return IpDecision::Allowed;
        }

        for entry in &self.entries {
            let hit = match (entry, addr) {
                (Entry::Literal(a), b) => *a == b,
                (Entry::CidrV4 { net, mask }, IpAddr::V4(v4)) => {
                    u32::from(v4) & mask == *net
                }
                (Entry::CidrV6 { net, mask }, IpAddr::V6(v6)) => {
                    u128::from(v6) & mask == *net
                }
                _ => false,
            };
            if hit {
                return IpDecision::Allowed;
            }
        }

        IpDecision::Denied
    }
}

fn parse_entry(raw: &str) -> Option<Entry> {
    match raw.split_once('/') {
        None => raw.parse::<IpAddr>().ok().map(Entry::Literal),
        Some((addr, prefix)) => {
            let prefix: u8 = prefix.parse().ok()?;
            match addr.parse::<IpAddr>().ok()? {
                IpAddr::V4(v4) => {
                    if prefix > 32 {
                        return None;
                    }
                    let mask = if prefix == 0 {
                        0
                    } else {
                        u32::MAX << (32 - prefix)
                    };
                    Some(Entry::CidrV4 {
                        net: u32::from(v4) & mask,
                        mask,
                    })
                }
                IpAddr::V6(v6) => {
                    if prefix > 128 {
                        return None;
                    }
                    let mask = if prefix == 0 {
                        0
                    } else {
                        u128::MAX << (128 - prefix)
                    };
                    Some(Entry::CidrV6 {
                        net: u128::from(v6) & mask,
                        mask,
                    })
                }
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::{IpDecision, IpFilter};
    use crate::config::IpWhitelistConfig;

    fn filter(enabled: bool, entries: &[&str]) -> IpFilter {
        IpFilter::from_config(&IpWhitelistConfig {
            enabled,
            entries: entries.iter().map(|e| (*e).to_owned()).collect(),
        })
    }

    #[test]
    fn disabled_filter_allows_everything() {
        let f = filter(false, &[]);
        assert_eq!(IpDecision::Allowed, f.check("203.0.113.7".parse().unwrap()));
    }

    #[test]
    fn enabled_empty_list_denies_all() {
        let f = filter(true, &[]);
        assert_eq!(IpDecision::Denied, f.check("127.0.0.1".parse().unwrap()));
    }

    #[test]
    fn literal_and_cidr_v4_match() {
        let f = filter(true, &["127.0.0.1", "10.1.0.0/16"]);
        assert_eq!(IpDecision::Allowed, f.check("127.0.0.1".parse().unwrap()));
        assert_eq!(IpDecision::Allowed, f.check("10.1.200.9".parse().unwrap()));
        assert_eq!(IpDecision::Denied, f.check("10.2.0.1".parse().unwrap()));
        assert_eq!(IpDecision::Denied, f.check("127.0.0.2".parse().unwrap()));
    }

    #[test]
    fn cidr_v6_match() {
        let f = filter(true, &["2001:db8::/32"]);
        assert_eq!(
            IpDecision::Allowed,
            f.check("2001:db8::dead:beef".parse().unwrap())
        );
        assert_eq!(IpDecision::Denied, f.check("2001:db9::1".parse().unwrap()));
    }

    #[test]
    fn malformed_entries_are_skipped_not_fatal() {
        let f = filter(true, &["not-an-ip", "300.0.0.1/8", "10.0.0.0/40", "192.168.0.1"]);
        assert_eq!(IpDecision::Allowed, f.check("192.168.0.1".parse().unwrap()));
        assert_eq!(IpDecision::Denied, f.check("10.0.0.1".parse().unwrap()));
    }

    #[test]
    fn zero_prefix_matches_all_of_family() {
        let f = filter(true, &["0.0.0.0/0"]);
        assert_eq!(IpDecision::Allowed, f.check("8.8.8.8".parse().unwrap()));
        // family mismatch is not a match
        assert_eq!(IpDecision::Denied, f.check("::1".parse().unwrap()));
    }
}
