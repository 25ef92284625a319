//! Greylisting probes, layered on [`crate::rate_control`]. Grounded on
//! NwSMTP's greylisting callers in `atormoz.cpp`.

use std::{
    hash::{Hash, Hasher},
    net::SocketAddr,
    time::Duration,
};

use smtp_envelope::GreylistingKey;

use crate::rate_control::{Command, RcClient, RcError, Request};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum GreylistingVerdict {
    TooEarly,
    TooLate,
    Ok,
}

pub struct GreylistingClient {
    hosts: Vec<SocketAddr>,
    ttl: Duration,
    window_begin: Duration,
    window_end: Duration,
}

impl GreylistingClient {
    pub fn new(hosts: Vec<SocketAddr>, ttl: Duration, window_begin: Duration, window_end: Duration) -> GreylistingClient {
        GreylistingClient {
            hosts,
            ttl,
            window_begin,
            window_end,
        }
    }

    fn host_for(&self, key_hash: u64) -> SocketAddr {
        self.hosts[(key_hash as usize) % self.hosts.len()]
    }

    /// Returns the verdict plus how many times this key has already been
    /// seen (`Response.counters[0]`, 0 on a key's first probe) — a repeat
    /// hit inside the accepted window is what later marks an envelope as
    /// having passed greylisting on a retry rather than a first attempt.
    #[tracing::instrument(skip(self))]
    pub async fn probe(&self, key: &GreylistingKey, timeout: Duration) -> Result<(GreylistingVerdict, u32), RcError> {
        let key_hash = hash_key(key);
        let host = self.host_for(key_hash);
        let client = RcClient::connect(host).await?;
        let request = Request {
            id: RcClient::make_request_id(&key_hash.to_string()),
            command: Command::Get as i32,
            namespace: "greylisting".to_string(),
            key: key_hash.to_string(),
            ttl_seconds: self.ttl.as_secs() as u32,
            comment: String::new(),
            parameters: Vec::new(),
        };
        let response = client.start(request, timeout).await?;
        let age = Duration::from_secs(response.age_seconds as u64);
        let prior_hits = response.counters.get(0).copied().unwrap_or(0);
        let verdict = if age < self.window_begin {
            GreylistingVerdict::TooEarly
        } else if age > self.window_end {
            GreylistingVerdict::TooLate
        } else {
            GreylistingVerdict::Ok
        };
        Ok((verdict, prior_hits))
    }

    #[tracing::instrument(skip(self))]
    pub async fn mark(&self, key: &GreylistingKey, accepted: bool, timeout: Duration) -> Result<(), RcError> {
        let key_hash = hash_key(key);
        let host = self.host_for(key_hash);
        let client = RcClient::connect(host).await?;
        let request = Request {
            id: RcClient::make_request_id(&key_hash.to_string()),
            command: Command::Add as i32,
            namespace: "greylisting".to_string(),
            key: key_hash.to_string(),
            ttl_seconds: self.ttl.as_secs() as u32,
            comment: String::new(),
            parameters: vec![1, if accepted { 1 } else { 0 }],
        };
        client.start(request, timeout).await?;
        Ok(())
    }
}

fn hash_key(key: &GreylistingKey) -> u64 {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    key.hash(&mut hasher);
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    #[test]
    fn same_key_hashes_identically() {
        let key = GreylistingKey {
            remote_ip: Some(IpAddr::V4(Ipv4Addr::new(192, 0, 2, 1))),
            envelope_from: Some("a@example.org".to_string()),
            envelope_to: Some("b@example.org".to_string()),
            ..GreylistingKey::default()
        };
        assert_eq!(hash_key(&key), hash_key(&key.clone()));
    }

    #[test]
    fn differing_header_fields_hash_differently() {
        let base = GreylistingKey {
            remote_ip: Some(IpAddr::V4(Ipv4Addr::new(192, 0, 2, 1))),
            envelope_from: Some("a@example.org".to_string()),
            envelope_to: Some("b@example.org".to_string()),
            ..GreylistingKey::default()
        };
        let with_subject = GreylistingKey {
            header_subject: Some("hello".to_string()),
            ..base.clone()
        };
        assert_ne!(hash_key(&base), hash_key(&with_subject));
    }
}
