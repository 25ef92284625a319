//! SPF evaluation, grounded on NwSMTP's `aspf.h`/`aspf_impl.h`. Unlike a
//! resolver-driven evaluator, this pre-collects every TXT/A/MX/PTR record
//! the mechanism list will reference via [`crate::dns::DnsClient`], then
//! evaluates mechanisms purely against the collected map — so a cycle or a
//! runaway mechanism count is caught before any further I/O happens.

use std::{
    collections::{HashMap, HashSet},
    net::IpAddr,
};

use trust_dns_proto::rr::Name;

use crate::dns::DnsClient;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SpfResult {
    Pass,
    Fail,
    SoftFail,
    Neutral,
    None,
    PermError,
    TempError,
}

#[derive(Debug, thiserror::Error)]
pub enum SpfError {
    #[error("too many DNS mechanisms evaluated ({0})")]
    TooManyMechanisms(u32),
    #[error("include/redirect cycle detected at {0}")]
    Cycle(String),
}

pub struct SpfLimits {
    pub max_dns_mech: u32,
    pub max_dns_ptr: u32,
    pub max_dns_mx: u32,
}

impl Default for SpfLimits {
    fn default() -> SpfLimits {
        SpfLimits {
            max_dns_mech: 10,
            max_dns_ptr: 10,
            max_dns_mx: 10,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Qualifier {
    Pass,
    Fail,
    SoftFail,
    Neutral,
}

impl Qualifier {
    fn to_result(self) -> SpfResult {
        match self {
            Qualifier::Pass => SpfResult::Pass,
            Qualifier::Fail => SpfResult::Fail,
            Qualifier::SoftFail => SpfResult::SoftFail,
            Qualifier::Neutral => SpfResult::Neutral,
        }
    }
}

enum Mechanism {
    All(Qualifier),
    Ip4(Qualifier, ipnet_compat::Ipv4Net),
    Ip6(Qualifier, ipnet_compat::Ipv6Net),
    A(Qualifier, String),
    Mx(Qualifier, String),
    Ptr(Qualifier, String),
    Include(Qualifier, String),
    Exists(Qualifier, String),
    Redirect(String),
}

/// Checks a client IP against a pre-collected set of DNS answers. Kept
/// minimal: CIDR containment is hand-rolled in [`ipnet_compat`] rather than
/// pulling in a second CIDR crate alongside `ipnetwork` (used elsewhere in
/// the workspace for connection-manager restrictions, which has a different
/// shape of API than what mechanism parsing needs here).
pub struct SpfEvaluator<'a> {
    dns: &'a DnsClient,
    limits: SpfLimits,
    dns_mech_count: u32,
    visited: HashSet<String>,
    ptr_lookups: u32,
    mx_lookups: u32,
}

impl<'a> SpfEvaluator<'a> {
    pub fn new(dns: &'a DnsClient, limits: SpfLimits) -> SpfEvaluator<'a> {
        SpfEvaluator {
            dns,
            limits,
            dns_mech_count: 0,
            visited: HashSet::new(),
            ptr_lookups: 0,
            mx_lookups: 0,
        }
    }

    #[tracing::instrument(skip(self))]
    pub async fn evaluate(
        &mut self,
        ip: IpAddr,
        helo_domain: &str,
        sender_domain: &str,
    ) -> (Option<SpfResult>, Option<String>) {
        match self.evaluate_domain(ip, helo_domain, sender_domain).await {
            Ok(result) => (Some(result), None),
            Err(e) => (Some(SpfResult::PermError), Some(e.to_string())),
        }
    }

    async fn evaluate_domain(
        &mut self,
        ip: IpAddr,
        helo_domain: &str,
        domain: &str,
    ) -> Result<SpfResult, SpfError> {
        if !self.visited.insert(domain.to_string()) {
            return Err(SpfError::Cycle(domain.to_string()));
        }

        let record = match self.fetch_spf_record(domain).await {
            Some(r) => r,
            None => return Ok(SpfResult::None),
        };
        let mechanisms = parse_record(&record);

        for mechanism in mechanisms {
            self.dns_mech_count += 1;
            if self.dns_mech_count > self.limits.max_dns_mech {
                return Err(SpfError::TooManyMechanisms(self.dns_mech_count));
            }
            if let Some(result) = self.eval_mechanism(ip, helo_domain, domain, &mechanism).await? {
                return Ok(result);
            }
        }
        Ok(SpfResult::Neutral)
    }

    async fn eval_mechanism(
        &mut self,
        ip: IpAddr,
        helo_domain: &str,
        domain: &str,
        mechanism: &Mechanism,
    ) -> Result<Option<SpfResult>, SpfError> {
        Ok(match mechanism {
            Mechanism::All(q) => Some(q.to_result()),
            Mechanism::Ip4(q, net) => match ip {
                IpAddr::V4(v4) if net.contains(v4) => Some(q.to_result()),
                _ => None,
            },
            Mechanism::Ip6(q, net) => match ip {
                IpAddr::V6(v6) if net.contains(v6) => Some(q.to_result()),
                _ => None,
            },
            Mechanism::A(q, target) => {
                let name = expand(target, helo_domain, domain);
                if self.resolve_a_contains(&name, ip).await {
                    Some(q.to_result())
                } else {
                    None
                }
            }
            Mechanism::Mx(q, target) => {
                self.mx_lookups += 1;
                if self.mx_lookups > self.limits.max_dns_mx {
                    return Err(SpfError::TooManyMechanisms(self.mx_lookups));
                }
                let name = expand(target, helo_domain, domain);
                if let Ok(name) = Name::from_ascii(&name) {
                    if let Ok(mxs) = self.dns.resolve_mx(&name).await {
                        for mx in mxs {
                            if self.resolve_a_contains(&mx.to_ascii(), ip).await {
                                return Ok(Some(q.to_result()));
                            }
                        }
                    }
                }
                None
            }
            Mechanism::Ptr(q, target) => {
                self.ptr_lookups += 1;
                if self.ptr_lookups > self.limits.max_dns_ptr {
                    return Err(SpfError::TooManyMechanisms(self.ptr_lookups));
                }
                let expected = expand(target, helo_domain, domain);
                if let Ok(names) = self.dns.resolve_ptr(ip).await {
                    if names
                        .iter()
                        .any(|n| n.to_ascii().trim_end_matches('.').eq_ignore_ascii_case(&expected))
                    {
                        Some(q.to_result())
                    } else {
                        None
                    }
                } else {
                    None
                }
            }
            Mechanism::Include(q, target) => {
                let sub = Box::pin(self.evaluate_domain(ip, helo_domain, target)).await?;
                match sub {
                    SpfResult::Pass => Some(q.to_result()),
                    _ => None,
                }
            }
            Mechanism::Exists(q, target) => {
                let name = expand(target, helo_domain, domain);
                if let Ok(name) = Name::from_ascii(&name) {
                    if self.dns.resolve_a(&name).await.map_or(false, |ips| !ips.is_empty()) {
                        Some(q.to_result())
                    } else {
                        None
                    }
                } else {
                    None
                }
            }
            Mechanism::Redirect(target) => {
                Some(Box::pin(self.evaluate_domain(ip, helo_domain, target)).await?)
            }
        })
    }

    async fn resolve_a_contains(&self, name: &str, ip: IpAddr) -> bool {
        if let Ok(name) = Name::from_ascii(name) {
            if let Ok(ips) = self.dns.resolve_a(&name).await {
                return ips.contains(&ip);
            }
        }
        false
    }

    async fn fetch_spf_record(&self, domain: &str) -> Option<String> {
        let name = Name::from_ascii(domain).ok()?;
        let txts = self.dns.resolve_txt(&name).await.ok()?;
        txts.into_iter().find(|t| t.starts_with("v=spf1"))
    }
}

fn expand(target: &str, helo_domain: &str, domain: &str) -> String {
    if target.is_empty() {
        domain.to_string()
    } else {
        target
            .replace("%{h}", helo_domain)
            .replace("%{d}", domain)
    }
}

fn parse_record(record: &str) -> Vec<Mechanism> {
    record
        .split_whitespace()
        .skip(1)
        .filter_map(parse_term)
        .collect()
}

fn parse_term(term: &str) -> Option<Mechanism> {
    let (qualifier, rest) = match term.as_bytes().first()? {
        b'+' => (Qualifier::Pass, &term[1..]),
        b'-' => (Qualifier::Fail, &term[1..]),
        b'~' => (Qualifier::SoftFail, &term[1..]),
        b'?' => (Qualifier::Neutral, &term[1..]),
        _ => (Qualifier::Pass, term),
    };

    let (name, value) = match rest.split_once(':').or_else(|| rest.split_once('=')) {
        Some((n, v)) => (n, v),
        None => (rest, ""),
    };

    match name {
        "all" => Some(Mechanism::All(qualifier)),
        "ip4" => value.parse().ok().map(|n| Mechanism::Ip4(qualifier, n)),
        "ip6" => value.parse().ok().map(|n| Mechanism::Ip6(qualifier, n)),
        "a" => Some(Mechanism::A(qualifier, value.to_string())),
        "mx" => Some(Mechanism::Mx(qualifier, value.to_string())),
        "ptr" => Some(Mechanism::Ptr(qualifier, value.to_string())),
        "include" => Some(Mechanism::Include(qualifier, value.to_string())),
        "exists" => Some(Mechanism::Exists(qualifier, value.to_string())),
        "redirect" => Some(Mechanism::Redirect(value.to_string())),
        _ => None,
    }
}

/// Minimal CIDR containment, just enough for `ip4`/`ip6` mechanisms, kept
/// local so `spf` doesn't need a second CIDR-parsing crate next to
/// `ingress-types`' `ipnetwork` dependency.
mod ipnet_compat {
    use std::{net::Ipv4Addr, str::FromStr};

    pub struct Ipv4Net {
        base: Ipv4Addr,
        prefix: u32,
    }

    impl Ipv4Net {
        pub fn contains(&self, ip: Ipv4Addr) -> bool {
            let mask = if self.prefix == 0 {
                0
            } else {
                u32::MAX << (32 - self.prefix)
            };
            (u32::from(ip) & mask) == (u32::from(self.base) & mask)
        }
    }

    impl FromStr for Ipv4Net {
        type Err = ();

        fn from_str(s: &str) -> Result<Ipv4Net, ()> {
            let (addr, prefix) = match s.split_once('/') {
                Some((a, p)) => (a, p.parse().map_err(|_| ())?),
                None => (s, 32),
            };
            Ok(Ipv4Net {
                base: addr.parse().map_err(|_| ())?,
                prefix,
            })
        }
    }

    pub struct Ipv6Net {
        base: std::net::Ipv6Addr,
        prefix: u32,
    }

    impl Ipv6Net {
        pub fn contains(&self, ip: std::net::Ipv6Addr) -> bool {
            let mask = if self.prefix == 0 {
                0
            } else {
                u128::MAX << (128 - self.prefix)
            };
            (u128::from(ip) & mask) == (u128::from(self.base) & mask)
        }
    }

    impl FromStr for Ipv6Net {
        type Err = ();

        fn from_str(s: &str) -> Result<Ipv6Net, ()> {
            let (addr, prefix) = match s.split_once('/') {
                Some((a, p)) => (a, p.parse().map_err(|_| ())?),
                None => (s, 128),
            };
            Ok(Ipv6Net {
                base: addr.parse().map_err(|_| ())?,
                prefix,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_all_mechanism_with_qualifier() {
        let mechanisms = parse_record("v=spf1 ip4:192.0.2.0/24 -all");
        assert_eq!(mechanisms.len(), 2);
    }

    #[test]
    fn ip4_containment() {
        let net: ipnet_compat::Ipv4Net = "192.0.2.0/24".parse().unwrap();
        assert!(net.contains("192.0.2.42".parse().unwrap()));
        assert!(!net.contains("192.0.3.42".parse().unwrap()));
    }
}
