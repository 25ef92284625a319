//! Authentication and recipient-lookup backend client: backs `AUTH`'s
//! credential check, the authenticated-`MAIL FROM` karma capture, and
//! `RCPT TO`'s recipient lookup. A line-oriented, NUL-terminated protocol
//! over a persistent TCP connection, dialed through [`crate::host_switch`] —
//! the same transport shape as [`crate::spam_scorer`], in place of the
//! original HTTP/XML blackbox transport, since every other check client in
//! this system talks a socket-framed internal protocol. Grounded on
//! NwSMTP's `bb_client_auth.cpp`, `bb_client_mailfrom.cpp`,
//! `bb_client_rcpt.cpp` and `bb_parser.cpp`/`.h`.

use std::{net::SocketAddr, time::Duration};

use chrono::Utc;
use futures::{AsyncReadExt, AsyncWriteExt};
use smol::net::TcpStream;

use crate::host_switch::HostSwitch;

/// `bb_parser.h`'s `g_time_treshold`: how soon after registration a new
/// account is temp-banned from sending mail.
const NEW_USER_THRESHOLD: i64 = 10;
/// `bb_parser.h`'s `karma_status` values treated as fine outright.
const OK_KARMA_STATUSES: [i32; 2] = [0, 2];
/// Karma values that are never penalised even with an otherwise-bad status.
const WHITELISTED_KARMAS: [i32; 2] = [85, 100];

#[derive(Debug, thiserror::Error)]
pub enum AuthBackendError {
    #[error("I/O error talking to the auth backend: {0}")]
    Io(#[source] std::io::Error),
    #[error("connection/command/read timed out")]
    TimedOut,
    #[error("response was truncated or malformed")]
    Truncated,
    #[error("exhausted retries against both primary and secondary")]
    Exhausted,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum AuthOutcome {
    Accepted { suid: String },
    Rejected,
    Tempfail,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum MailFromOutcome {
    Match { karma: i32, karma_status: i32, born_date: i64 },
    Mismatch,
}

/// `RCPT TO`'s recipient-backend verdict, matching spec's
/// accept/reject/tempfail/policy-reject/new-user-tempban taxonomy exactly.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum RecipientDecision {
    Accept { suid: Option<i64> },
    Reject(String),
    Tempfail(String),
    PolicyReject(String),
    NewUserTempban,
}

pub struct AuthBackendClient {
    hosts: HostSwitch<SocketAddr>,
    try_count: u32,
    timeout: Duration,
}

impl AuthBackendClient {
    pub fn new(hosts: HostSwitch<SocketAddr>, try_count: u32, timeout: Duration) -> AuthBackendClient {
        AuthBackendClient {
            hosts,
            try_count,
            timeout,
        }
    }

    #[tracing::instrument(skip(self, password))]
    pub async fn authenticate(&self, user: &str, password: &str) -> Result<AuthOutcome, AuthBackendError> {
        let mut last_err = None;
        for _attempt in 0..self.try_count {
            match self.connect().await {
                Ok(mut stream) => match Self::authenticate_once(&mut stream, user, password).await {
                    Ok(value) => return Ok(value),
                    Err(e) => {
                        self.hosts.fault();
                        last_err = Some(e);
                    }
                },
                Err(e) => {
                    self.hosts.fault();
                    last_err = Some(e);
                }
            }
        }
        Err(last_err.unwrap_or(AuthBackendError::Exhausted))
    }

    #[tracing::instrument(skip(self))]
    pub async fn verify_mailfrom(&self, suid: &str, addr: &str) -> Result<MailFromOutcome, AuthBackendError> {
        let mut last_err = None;
        for _attempt in 0..self.try_count {
            match self.connect().await {
                Ok(mut stream) => match Self::verify_mailfrom_once(&mut stream, suid, addr).await {
                    Ok(value) => return Ok(value),
                    Err(e) => {
                        self.hosts.fault();
                        last_err = Some(e);
                    }
                },
                Err(e) => {
                    self.hosts.fault();
                    last_err = Some(e);
                }
            }
        }
        Err(last_err.unwrap_or(AuthBackendError::Exhausted))
    }

    #[tracing::instrument(skip(self))]
    pub async fn lookup_recipient(&self, addr: &str) -> Result<RecipientDecision, AuthBackendError> {
        let mut last_err = None;
        for _attempt in 0..self.try_count {
            match self.connect().await {
                Ok(mut stream) => match Self::lookup_recipient_once(&mut stream, addr).await {
                    Ok(found) => return Ok(classify_recipient(found, Utc::now().timestamp())),
                    Err(e) => {
                        self.hosts.fault();
                        last_err = Some(e);
                    }
                },
                Err(e) => {
                    self.hosts.fault();
                    last_err = Some(e);
                }
            }
        }
        Err(last_err.unwrap_or(AuthBackendError::Exhausted))
    }

    async fn connect(&self) -> Result<TcpStream, AuthBackendError> {
        let addr = self.hosts.get_primary();
        smol::future::or(
            async { TcpStream::connect(addr).await.map_err(AuthBackendError::Io) },
            async {
                smol::Timer::after(self.timeout).await;
                Err(AuthBackendError::TimedOut)
            },
        )
        .await
    }

    async fn authenticate_once(
        stream: &mut TcpStream,
        user: &str,
        password: &str,
    ) -> Result<AuthOutcome, AuthBackendError> {
        write_line(stream, &format!("AUTH {} {}", user, password)).await?;
        let line = read_line(stream).await?;
        if let Some(suid) = line.strip_prefix("OK ") {
            Ok(AuthOutcome::Accepted {
                suid: suid.trim().to_string(),
            })
        } else if line.trim() == "TEMPFAIL" {
            Ok(AuthOutcome::Tempfail)
        } else {
            Ok(AuthOutcome::Rejected)
        }
    }

    async fn verify_mailfrom_once(
        stream: &mut TcpStream,
        suid: &str,
        addr: &str,
    ) -> Result<MailFromOutcome, AuthBackendError> {
        write_line(stream, &format!("MAILFROM {} {}", suid, addr)).await?;
        let line = read_line(stream).await?;
        let rest = match line.strip_prefix("OK ") {
            Some(rest) => rest,
            None => return Ok(MailFromOutcome::Mismatch),
        };
        let mut fields = rest.split_whitespace();
        let karma = fields.next().and_then(|f| f.parse().ok());
        let karma_status = fields.next().and_then(|f| f.parse().ok());
        let born_date = fields.next().and_then(|f| f.parse().ok());
        match (karma, karma_status, born_date) {
            (Some(karma), Some(karma_status), Some(born_date)) => Ok(MailFromOutcome::Match {
                karma,
                karma_status,
                born_date,
            }),
            _ => Err(AuthBackendError::Truncated),
        }
    }

    async fn lookup_recipient_once(
        stream: &mut TcpStream,
        addr: &str,
    ) -> Result<Option<FoundRecipient>, AuthBackendError> {
        write_line(stream, &format!("RCPT {}", addr)).await?;
        let line = read_line(stream).await?;
        if line.trim() == "NOTFOUND" {
            return Ok(None);
        }
        let rest = match line.strip_prefix("FOUND ") {
            Some(rest) => rest,
            None => return Err(AuthBackendError::Truncated),
        };
        let mut fields = rest.split_whitespace();
        let suid = fields.next().and_then(|f| f.parse().ok());
        let ena = fields.next().and_then(|f| f.parse().ok());
        let login_rule = fields.next().and_then(|f| f.parse().ok());
        let karma = fields.next().and_then(|f| f.parse().ok());
        let karma_status = fields.next().and_then(|f| f.parse().ok());
        let reg_time = fields.next().and_then(|f| f.parse().ok());
        match (suid, ena, login_rule, karma, karma_status, reg_time) {
            (Some(suid), Some(ena), Some(login_rule), Some(karma), Some(karma_status), Some(reg_time)) => {
                Ok(Some(FoundRecipient {
                    suid,
                    ena,
                    login_rule,
                    karma,
                    karma_status,
                    reg_time,
                }))
            }
            _ => Err(AuthBackendError::Truncated),
        }
    }
}

struct FoundRecipient {
    suid: i64,
    ena: i32,
    login_rule: i32,
    karma: i32,
    karma_status: i32,
    reg_time: i64,
}

/// `bb_client_rcpt.cpp`'s decision, collapsed to spec's simpler rule: a
/// bare "no account" lookup still accepts (aliases resolve independently),
/// found accounts are blocked/tempbanned/karma-checked in that order.
fn classify_recipient(found: Option<FoundRecipient>, now: i64) -> RecipientDecision {
    let found = match found {
        Some(found) => found,
        None => return RecipientDecision::Accept { suid: None },
    };

    if found.ena == 0 || found.login_rule == 0 {
        return RecipientDecision::PolicyReject("User blocked".to_string());
    }
    if now < found.reg_time + NEW_USER_THRESHOLD {
        return RecipientDecision::NewUserTempban;
    }
    let ok_status = OK_KARMA_STATUSES.contains(&found.karma_status);
    let whitelisted = WHITELISTED_KARMAS.contains(&found.karma);
    if !ok_status && !whitelisted {
        return RecipientDecision::PolicyReject("User has bad karma".to_string());
    }

    RecipientDecision::Accept {
        suid: Some(found.suid),
    }
}

async fn write_line(stream: &mut TcpStream, line: &str) -> Result<(), AuthBackendError> {
    stream.write_all(line.as_bytes()).await.map_err(AuthBackendError::Io)?;
    stream.write_all(b"\0").await.map_err(AuthBackendError::Io)
}

async fn read_line(stream: &mut TcpStream) -> Result<String, AuthBackendError> {
    let mut response = Vec::new();
    stream
        .read_to_end(&mut response)
        .await
        .map_err(AuthBackendError::Io)?;
    let text = String::from_utf8_lossy(&response);
    text.lines()
        .next()
        .map(str::to_string)
        .ok_or(AuthBackendError::Truncated)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blocked_user_is_policy_rejected() {
        let found = FoundRecipient {
            suid: 1,
            ena: 0,
            login_rule: 1,
            karma: 100,
            karma_status: 2,
            reg_time: 0,
        };
        assert_eq!(
            classify_recipient(Some(found), 1_000_000),
            RecipientDecision::PolicyReject("User blocked".to_string())
        );
    }

    #[test]
    fn brand_new_account_is_tempbanned() {
        let found = FoundRecipient {
            suid: 1,
            ena: 1,
            login_rule: 1,
            karma: 100,
            karma_status: 2,
            reg_time: 1000,
        };
        assert_eq!(classify_recipient(Some(found), 1001), RecipientDecision::NewUserTempban);
    }

    #[test]
    fn bad_karma_without_whitelist_is_policy_rejected() {
        let found = FoundRecipient {
            suid: 1,
            ena: 1,
            login_rule: 1,
            karma: 50,
            karma_status: 1,
            reg_time: 0,
        };
        assert_eq!(
            classify_recipient(Some(found), 1_000_000),
            RecipientDecision::PolicyReject("User has bad karma".to_string())
        );
    }

    #[test]
    fn whitelisted_karma_overrides_bad_status() {
        let found = FoundRecipient {
            suid: 7,
            ena: 1,
            login_rule: 1,
            karma: 85,
            karma_status: 1,
            reg_time: 0,
        };
        assert_eq!(
            classify_recipient(Some(found), 1_000_000),
            RecipientDecision::Accept { suid: Some(7) }
        );
    }

    #[test]
    fn unknown_recipient_accepts_for_alias_resolution() {
        assert_eq!(classify_recipient(None, 1_000_000), RecipientDecision::Accept { suid: None });
    }
}
