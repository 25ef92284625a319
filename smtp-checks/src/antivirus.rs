//! Anti-virus (AV) client: a 4x big-endian-`u32` framed protocol over
//! persistent TCP, dialed through [`crate::host_switch`]. Grounded on
//! NwSMTP's `avir_client.cpp`/`avir_client.h`.

use std::{net::SocketAddr, time::Duration};

use futures::{AsyncReadExt, AsyncWriteExt};
use smol::net::TcpStream;

use crate::host_switch::HostSwitch;

const COMMAND_SCAN: u32 = 1;

bitflags::bitflags! {
    pub struct ResponseFlags: u32 {
        const READ_ERR       = 0x0001;
        const WRITE_ERR      = 0x0002;
        const NOMEM          = 0x0004;
        const CRC_ERR        = 0x0008;
        const READSOCKET     = 0x0010;
        const KNOWN_VIRUS    = 0x0020;
        const UNKNOWN_VIRUS  = 0x0040;
        const MODIFICATION   = 0x0080;
        const CURED          = 0x0100;
        const TIMEOUT        = 0x0200;
        const SYMLINK        = 0x0400;
        const NO_REGFILE     = 0x0800;
        const SKIPPED        = 0x1000;
        const TOO_BIG        = 0x2000;
        const TOO_COMPRESSED = 0x4000;
        const BAD_CALL       = 0x8000;
        const IS_CLEAN       = 0x0010_0000;
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AvError {
    #[error("I/O error talking to anti-virus peer: {0}")]
    Io(#[source] std::io::Error),
    #[error("connection/command/read timed out")]
    TimedOut,
    #[error("response was truncated")]
    Truncated,
    #[error("exhausted retries against both primary and secondary")]
    Exhausted,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ScanVerdict {
    Clean,
    Infected,
    Suspicious,
    Skipped,
    TooBig,
    Abnormal,
}

pub struct AntivirusClient {
    hosts: HostSwitch<SocketAddr>,
    try_count: u32,
    timeout: Duration,
}

impl AntivirusClient {
    pub fn new(hosts: HostSwitch<SocketAddr>, try_count: u32, timeout: Duration) -> AntivirusClient {
        AntivirusClient {
            hosts,
            try_count,
            timeout,
        }
    }

    #[tracing::instrument(skip(self, body))]
    pub async fn scan(&self, body: &[u8], options: u32) -> Result<ScanVerdict, AvError> {
        let mut last_err = None;
        for _attempt in 0..self.try_count {
            match self.try_once(body, options).await {
                Ok(verdict) => return Ok(verdict),
                Err(e) => {
                    self.hosts.fault();
                    last_err = Some(e);
                }
            }
        }
        Err(last_err.unwrap_or(AvError::Exhausted))
    }

    async fn try_once(&self, body: &[u8], options: u32) -> Result<ScanVerdict, AvError> {
        let addr = self.hosts.get_primary();
        let stream = smol::future::or(
            async { TcpStream::connect(addr).await.map_err(AvError::Io) },
            async {
                smol::Timer::after(self.timeout).await;
                Err(AvError::TimedOut)
            },
        )
        .await?;
        let mut stream = stream;

        let mut header = [0u8; 16];
        header[0..4].copy_from_slice(&COMMAND_SCAN.to_be_bytes());
        header[4..8].copy_from_slice(&options.to_be_bytes());
        header[8..12].copy_from_slice(&0u32.to_be_bytes());
        header[12..16].copy_from_slice(&(body.len() as u32).to_be_bytes());

        stream.write_all(&header).await.map_err(AvError::Io)?;
        stream.write_all(body).await.map_err(AvError::Io)?;

        let mut response = [0u8; 4];
        smol::future::or(
            async {
                stream
                    .read_exact(&mut response)
                    .await
                    .map_err(|_| AvError::Truncated)
            },
            async {
                smol::Timer::after(self.timeout).await;
                Err(AvError::TimedOut)
            },
        )
        .await?;

        let flags = ResponseFlags::from_bits_truncate(u32::from_be_bytes(response));
        Ok(classify(flags))
    }
}

fn classify(flags: ResponseFlags) -> ScanVerdict {
    if flags.intersects(ResponseFlags::KNOWN_VIRUS | ResponseFlags::UNKNOWN_VIRUS) {
        ScanVerdict::Infected
    } else if flags.intersects(ResponseFlags::MODIFICATION | ResponseFlags::CURED) {
        ScanVerdict::Suspicious
    } else if flags.contains(ResponseFlags::TOO_BIG) {
        ScanVerdict::TooBig
    } else if flags.contains(ResponseFlags::SKIPPED) {
        ScanVerdict::Skipped
    } else if flags.contains(ResponseFlags::IS_CLEAN) {
        ScanVerdict::Clean
    } else {
        ScanVerdict::Abnormal
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_virus_bit_wins_over_clean() {
        let flags = ResponseFlags::IS_CLEAN | ResponseFlags::KNOWN_VIRUS;
        assert_eq!(classify(flags), ScanVerdict::Infected);
    }

    #[test]
    fn unknown_virus_is_infected() {
        assert_eq!(classify(ResponseFlags::UNKNOWN_VIRUS), ScanVerdict::Infected);
    }

    #[test]
    fn cured_is_suspicious() {
        assert_eq!(classify(ResponseFlags::CURED), ScanVerdict::Suspicious);
    }

    #[test]
    fn unknown_bits_are_abnormal() {
        assert_eq!(classify(ResponseFlags::empty()), ScanVerdict::Abnormal);
        assert_eq!(classify(ResponseFlags::READ_ERR), ScanVerdict::Abnormal);
    }
}
