//! Small vocabulary types shared between `ingress-config` and
//! `ingress-orchestrator`. Deliberately thin: the bulk of the data model
//! (`Envelope`, `Recipient`, ...) lives in `smtp-envelope`, and the
//! configuration surface itself lives in `ingress-config`.

use std::sync::atomic::{AtomicU64, Ordering};

use ipnetwork::IpNetwork;
use smtp_message::Email;

/// Process-unique identifier handed out to every accepted connection, used
/// to correlate log lines across the lifetime of a session (the SMTP success
/// reply itself carries no per-message identifier; the pairing of session id
/// and envelope id is recoverable from the log stream alone).
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, serde::Serialize, serde::Deserialize)]
pub struct SessionId(pub u64);

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

impl SessionId {
    pub fn next() -> SessionId {
        SessionId(NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One entry of the aliases file: a local address that expands to one or
/// more destination addresses, applied during RCPT TO resolution.
#[derive(Clone, Debug, Eq, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct AliasEntry {
    pub source: String,
    pub destinations: Vec<Email>,
}

/// One entry of the IP-restriction file: a per-network override of the
/// connection manager's default per-IP limit (`None` means "blocked").
#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
pub struct IpRestriction {
    pub net: IpNetwork,
    pub limit: Option<u32>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_ids_are_distinct_and_increasing() {
        let a = SessionId::next();
        let b = SessionId::next();
        assert!(b.0 > a.0);
    }
}
