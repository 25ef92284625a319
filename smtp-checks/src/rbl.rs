//! DNS-based reputation blocklist lookups. Grounded on NwSMTP's
//! `rbl.cpp`/`rbl.h`.

use std::net::{IpAddr, Ipv4Addr};

use trust_dns_proto::rr::Name;

use crate::dns::DnsClient;

/// An ordered list of RBL zones, queried in order until the first positive
/// hit. Any DNS error for a given zone is treated as "not listed" rather
/// than surfaced — a broken RBL must never block mail.
pub struct RblList {
    zones: Vec<String>,
}

/// `reply` is the message text only (no reply code prefix) — the caller
/// is the one that knows which [`smtp_message::ReplyCode`] to pair it with.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RblHit {
    pub zone: String,
    pub reply: String,
}

impl RblList {
    pub fn new(zones: Vec<String>) -> RblList {
        RblList { zones }
    }

    #[tracing::instrument(skip(self, dns))]
    pub async fn check(&self, dns: &DnsClient, client_ip: IpAddr) -> Option<RblHit> {
        let client_ip = match client_ip {
            IpAddr::V4(v4) => v4,
            IpAddr::V6(_) => return None,
        };
        for zone in &self.zones {
            if dns.resolve_a(&lookup_name(client_ip, zone)).await.map_or(false, |ips| !ips.is_empty()) {
                return Some(RblHit {
                    zone: zone.clone(),
                    reply: format!(
                        "Service unavailable; Client host [{}] blocked using {}; \
                         see https://www.spamhaus.org/query/ip/{}",
                        client_ip, zone, client_ip
                    ),
                });
            }
        }
        None
    }
}

fn lookup_name(ip: Ipv4Addr, zone: &str) -> Name {
    let o = ip.octets();
    Name::from_ascii(format!("{}.{}.{}.{}.{}.", o[3], o[2], o[1], o[0], zone))
        .expect("RBL zone names are ASCII")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_reversed_lookup_name() {
        let name = lookup_name(Ipv4Addr::new(192, 0, 2, 1), "zen.spamhaus.org");
        assert_eq!(name.to_ascii(), "1.2.0.192.zen.spamhaus.org.");
    }
}
