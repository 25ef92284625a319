//! Spam-scorer (SO) client: a line-oriented, NUL-terminated protocol over a
//! persistent TCP connection, dialed through [`crate::host_switch`].
//! Grounded on NwSMTP's `so_client.cpp`/`.h`.

use std::{net::SocketAddr, time::Duration};

use futures::{AsyncReadExt, AsyncWriteExt};
use smol::net::TcpStream;
use smtp_envelope::Envelope;

use crate::host_switch::HostSwitch;

#[derive(Debug, thiserror::Error)]
pub enum SoError {
    #[error("I/O error talking to spam scorer: {0}")]
    Io(#[source] std::io::Error),
    #[error("connection/command/read timed out")]
    TimedOut,
    #[error("peer rejected the session with code {0}")]
    Rejected(u32),
    #[error("exhausted retries against both primary and secondary")]
    Exhausted,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SpamVerdict {
    Ham,
    Spam,
    Deliver,
}

#[derive(Clone, Debug)]
pub struct RecipientScore {
    pub suid: i64,
    pub status: String,
}

#[derive(Clone, Debug)]
pub struct ScoringResult {
    pub verdict: SpamVerdict,
    pub recipients: Vec<RecipientScore>,
}

pub struct SpamScorerClient {
    hosts: HostSwitch<SocketAddr>,
    try_count: u32,
    timeout: Duration,
}

impl SpamScorerClient {
    pub fn new(hosts: HostSwitch<SocketAddr>, try_count: u32, timeout: Duration) -> SpamScorerClient {
        SpamScorerClient {
            hosts,
            try_count,
            timeout,
        }
    }

    #[tracing::instrument(skip(self, envelope))]
    pub async fn scan(
        &self,
        envelope: &Envelope,
        remote_host: &str,
        remote_ip: &str,
        helo: &str,
    ) -> Result<ScoringResult, SoError> {
        let mut last_err = None;
        for _attempt in 0..self.try_count {
            match self.try_once(envelope, remote_host, remote_ip, helo).await {
                Ok(result) => return Ok(result),
                Err(e) => {
                    self.hosts.fault();
                    last_err = Some(e);
                }
            }
        }
        Err(last_err.unwrap_or(SoError::Exhausted))
    }

    async fn try_once(
        &self,
        envelope: &Envelope,
        remote_host: &str,
        remote_ip: &str,
        helo: &str,
    ) -> Result<ScoringResult, SoError> {
        let addr = self.hosts.get_primary();
        let stream = smol::future::or(
            async { TcpStream::connect(addr).await.map_err(SoError::Io) },
            async {
                smol::Timer::after(self.timeout).await;
                Err(SoError::TimedOut)
            },
        )
        .await?;
        let mut stream = stream;

        write_line(&mut stream, &format!("CONNECT {} {}", remote_host, remote_ip)).await?;
        write_line(&mut stream, &format!("HELO {}", helo)).await?;
        if let Some(sender) = &envelope.sender {
            write_line(
                &mut stream,
                &format!("MAILFROM {} SIZE={}", sender, envelope.total_size),
            )
            .await?;
        }
        for recipient in &envelope.recipients {
            write_line(
                &mut stream,
                &format!("RCPTTO {} ID={}", recipient.email, recipient.suid),
            )
            .await?;
        }
        let first_64k: usize = envelope
            .altered_body
            .iter()
            .map(|c| c.len())
            .sum::<usize>()
            .min(64 * 1024);
        write_line(&mut stream, &format!("DATA SIZE={}", first_64k)).await?;
        for chunk in &envelope.altered_body {
            stream.write_all(chunk.as_bytes()).await.map_err(SoError::Io)?;
        }

        let mut response = Vec::new();
        stream.read_to_end(&mut response).await.map_err(SoError::Io)?;
        parse_response(&response)
    }
}

async fn write_line(stream: &mut TcpStream, line: &str) -> Result<(), SoError> {
    stream.write_all(line.as_bytes()).await.map_err(SoError::Io)?;
    stream.write_all(b"\0").await.map_err(SoError::Io)
}

fn parse_response(response: &[u8]) -> Result<ScoringResult, SoError> {
    let text = String::from_utf8_lossy(response);
    for line in text.lines() {
        if let Some(rest) = line.strip_prefix("REJECT ") {
            if let Ok(code) = rest.trim().parse::<u32>() {
                if code == 1 || code == 2 {
                    return Err(SoError::Rejected(code));
                }
            }
        }
    }

    let mut verdict = SpamVerdict::Ham;
    let mut recipients = Vec::new();
    for line in text.lines() {
        if let Some(rest) = line.strip_prefix("SPAM ") {
            let mut fields = rest.split(',');
            if let Some(flag) = fields.next() {
                verdict = if flag.trim() == "0" {
                    SpamVerdict::Ham
                } else {
                    SpamVerdict::Spam
                };
            }
            let rest: Vec<&str> = fields.collect();
            for pair in rest.chunks(2) {
                if let [suid, status] = pair {
                    if let Ok(suid) = suid.trim().parse::<i64>() {
                        recipients.push(RecipientScore {
                            suid,
                            status: status.trim().to_string(),
                        });
                    }
                }
            }
        }
        if line.contains("X-Spam-Flag: DLVR") {
            verdict = SpamVerdict::Deliver;
        }
    }

    Ok(ScoringResult { verdict, recipients })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_spam_line_with_per_recipient_status() {
        let response = b"SPAM 1,42,listed\nX-Spam-Flag: DLVR\n";
        let result = parse_response(response).unwrap();
        assert_eq!(result.verdict, SpamVerdict::Deliver);
        assert_eq!(result.recipients[0].suid, 42);
    }

    #[test]
    fn reject_code_two_is_an_error() {
        let response = b"REJECT 2\n";
        assert!(matches!(parse_response(response), Err(SoError::Rejected(2))));
    }
}
