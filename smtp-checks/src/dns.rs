//! A small resolver client speaking raw DNS over UDP, used by `rbl` and
//! `spf` for the record types they need beyond what `trust-dns-resolver`'s
//! higher-level API conveniently exposes (PTR for RBL zone names, on-the-fly
//! TXT/A/MX lookups for SPF mechanism evaluation). Grounded on NwSMTP's
//! `net/dns.hpp`.

use std::{
    collections::HashSet,
    net::{IpAddr, SocketAddr},
    sync::Mutex,
    time::Duration,
};

use rand::Rng;
use smol::net::UdpSocket;
use trust_dns_proto::{
    op::{Message, MessageType, OpCode, Query},
    rr::{Name, RData, Record, RecordType},
    serialize::binary::{BinDecodable, BinEncodable},
};

#[derive(Debug, thiserror::Error)]
pub enum DnsError {
    #[error("failed to encode DNS query: {0}")]
    Encode(#[source] trust_dns_proto::error::ProtoError),
    #[error("failed to decode DNS response: {0}")]
    Decode(#[source] trust_dns_proto::error::ProtoError),
    #[error("I/O error talking to resolver: {0}")]
    Io(#[source] std::io::Error),
    #[error("no query id available")]
    IdsExhausted,
    #[error("query timed out after {0} attempts")]
    TimedOut(u32),
}

/// Defaults: 2s per attempt, 15 retries.
pub struct DnsClient {
    socket: UdpSocket,
    resolver: SocketAddr,
    attempt_timeout: Duration,
    retries: u32,
    in_flight: Mutex<HashSet<u16>>,
}

impl DnsClient {
    pub async fn new(resolver: SocketAddr) -> Result<DnsClient, DnsError> {
        let bind_addr = if resolver.is_ipv4() {
            "0.0.0.0:0"
        } else {
            "[::]:0"
        };
        let socket = UdpSocket::bind(bind_addr).await.map_err(DnsError::Io)?;
        Ok(DnsClient {
            socket,
            resolver,
            attempt_timeout: Duration::from_secs(2),
            retries: 15,
            in_flight: Mutex::new(HashSet::new()),
        })
    }

    pub fn with_timeouts(mut self, attempt_timeout: Duration, retries: u32) -> DnsClient {
        self.attempt_timeout = attempt_timeout;
        self.retries = retries;
        self
    }

    fn alloc_id(&self) -> Result<u16, DnsError> {
        let mut in_flight = self.in_flight.lock().unwrap();
        for _ in 0..32 {
            let id = rand::thread_rng().gen::<u16>();
            if in_flight.insert(id) {
                return Ok(id);
            }
        }
        Err(DnsError::IdsExhausted)
    }

    fn cancel(&self, id: u16) {
        self.in_flight.lock().unwrap().remove(&id);
    }

    #[tracing::instrument(skip(self))]
    pub async fn query(&self, name: &Name, rtype: RecordType) -> Result<Vec<Record>, DnsError> {
        let id = self.alloc_id()?;
        let result = self.query_with_id(id, name, rtype).await;
        self.cancel(id);
        result
    }

    async fn query_with_id(
        &self,
        id: u16,
        name: &Name,
        rtype: RecordType,
    ) -> Result<Vec<Record>, DnsError> {
        let mut message = Message::new();
        message.set_id(id);
        message.set_message_type(MessageType::Query);
        message.set_op_code(OpCode::Query);
        message.set_recursion_desired(true);
        message.add_query(Query::query(name.clone(), rtype));
        let wire = message.to_bytes().map_err(DnsError::Encode)?;

        let mut last_err = None;
        for _attempt in 0..self.retries {
            if let Err(e) = self.socket.send_to(&wire, self.resolver).await {
                last_err = Some(DnsError::Io(e));
                continue;
            }

            let mut buf = [0u8; 4096];
            let attempt_timeout = self.attempt_timeout;
            let recv = smol::future::or(
                async {
                    let (n, _from) = self
                        .socket
                        .recv_from(&mut buf)
                        .await
                        .map_err(DnsError::Io)?;
                    Ok(n)
                },
                async {
                    smol::Timer::after(attempt_timeout).await;
                    Err(DnsError::TimedOut(1))
                },
            )
            .await;

            match recv {
                Ok(n) => {
                    let response = Message::from_bytes(&buf[..n]).map_err(DnsError::Decode)?;
                    if response.id() != id {
                        continue;
                    }
                    return Ok(response.answers().to_vec());
                }
                Err(e) => {
                    last_err = Some(e);
                    continue;
                }
            }
        }
        Err(last_err.unwrap_or(DnsError::TimedOut(self.retries)))
    }

    pub async fn resolve_a(&self, name: &Name) -> Result<Vec<IpAddr>, DnsError> {
        let records = self.query(name, RecordType::A).await?;
        Ok(records_to_ips(records))
    }

    pub async fn resolve_ptr(&self, ip: IpAddr) -> Result<Vec<Name>, DnsError> {
        let name = ptr_name(ip);
        let records = self.query(&name, RecordType::PTR).await?;
        Ok(records
            .into_iter()
            .filter_map(|r| match r.data() {
                Some(RData::PTR(n)) => Some(n.clone()),
                _ => None,
            })
            .collect())
    }

    pub async fn resolve_mx(&self, name: &Name) -> Result<Vec<Name>, DnsError> {
        let records = self.query(name, RecordType::MX).await?;
        Ok(records
            .into_iter()
            .filter_map(|r| match r.data() {
                Some(RData::MX(mx)) => Some(mx.exchange().clone()),
                _ => None,
            })
            .collect())
    }

    pub async fn resolve_txt(&self, name: &Name) -> Result<Vec<String>, DnsError> {
        let records = self.query(name, RecordType::TXT).await?;
        Ok(records
            .into_iter()
            .filter_map(|r| match r.data() {
                Some(RData::TXT(txt)) => Some(
                    txt.txt_data()
                        .iter()
                        .map(|b| String::from_utf8_lossy(b).into_owned())
                        .collect::<String>(),
                ),
                _ => None,
            })
            .collect())
    }
}

fn records_to_ips(records: Vec<Record>) -> Vec<IpAddr> {
    records
        .into_iter()
        .filter_map(|r| match r.data() {
            Some(RData::A(ip)) => Some(IpAddr::V4(*ip)),
            Some(RData::AAAA(ip)) => Some(IpAddr::V6(*ip)),
            _ => None,
        })
        .collect()
}

fn ptr_name(ip: IpAddr) -> Name {
    match ip {
        IpAddr::V4(v4) => {
            let o = v4.octets();
            Name::from_ascii(format!("{}.{}.{}.{}.in-addr.arpa.", o[3], o[2], o[1], o[0]))
                .expect("reverse-lookup name is always valid ASCII")
        }
        IpAddr::V6(v6) => {
            let mut nibbles = String::new();
            for segment in v6.segments().iter().rev() {
                for i in 0..4 {
                    let nibble = (segment >> (i * 4)) & 0xf;
                    nibbles.push_str(&format!("{:x}.", nibble));
                }
            }
            Name::from_ascii(format!("{}ip6.arpa.", nibbles))
                .expect("reverse-lookup name is always valid ASCII")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn ptr_name_is_reversed_octets() {
        let name = ptr_name(IpAddr::V4(Ipv4Addr::new(192, 0, 2, 1)));
        assert_eq!(name.to_ascii(), "1.2.0.192.in-addr.arpa.");
    }
}
