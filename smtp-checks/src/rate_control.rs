//! UDP client for the rate-control/greylisting backend. Grounded on
//! NwSMTP's `atormoz.cpp`/`atormoz.h`.

use std::{
    hash::{Hash, Hasher},
    net::SocketAddr,
    time::Duration,
};

use prost::Message as _;
use smol::net::UdpSocket;

include!(concat!(env!("OUT_DIR"), "/rc.rs"));

const DATAGRAM_SIZE: usize = 512;

#[derive(Debug, thiserror::Error)]
pub enum RcError {
    #[error("I/O error talking to rate-control peer: {0}")]
    Io(#[source] std::io::Error),
    #[error("request did not fit in a {DATAGRAM_SIZE}-byte datagram")]
    TooLarge,
    #[error("response failed to decode")]
    BadResponse,
    #[error("response id did not match request id")]
    BadResponseId,
    #[error("request timed out")]
    TimedOut,
}

pub struct RcClient {
    socket: UdpSocket,
    peer: SocketAddr,
}

impl RcClient {
    pub async fn connect(peer: SocketAddr) -> Result<RcClient, RcError> {
        let bind_addr = if peer.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
        let socket = UdpSocket::bind(bind_addr).await.map_err(RcError::Io)?;
        Ok(RcClient { socket, peer })
    }

    /// Derives a request id from the key, current time, pid and thread id,
    /// matching NwSMTP's collision-avoidance scheme without needing a
    /// shared counter.
    pub fn make_request_id(key: &str) -> u64 {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        key.hash(&mut hasher);
        std::process::id().hash(&mut hasher);
        std::thread::current().id().hash(&mut hasher);
        std::time::SystemTime::now().hash(&mut hasher);
        hasher.finish()
    }

    #[tracing::instrument(skip(self, request))]
    pub async fn start(&self, request: Request, timeout: Duration) -> Result<Response, RcError> {
        let mut buf = Vec::with_capacity(DATAGRAM_SIZE);
        request.encode(&mut buf).map_err(|_| RcError::TooLarge)?;
        if buf.len() > DATAGRAM_SIZE {
            return Err(RcError::TooLarge);
        }

        self.socket.send_to(&buf, self.peer).await.map_err(RcError::Io)?;

        let mut recv_buf = [0u8; DATAGRAM_SIZE];
        let recv = smol::future::or(
            async {
                let (n, _from) = self
                    .socket
                    .recv_from(&mut recv_buf)
                    .await
                    .map_err(RcError::Io)?;
                Ok(n)
            },
            async {
                smol::Timer::after(timeout).await;
                Err(RcError::TimedOut)
            },
        )
        .await?;

        let response =
            Response::decode(&recv_buf[..recv]).map_err(|_| RcError::BadResponse)?;
        if response.id != request.id {
            return Err(RcError::BadResponseId);
        }
        Ok(response)
    }
}
