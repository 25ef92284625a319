use std::sync::atomic::{AtomicU32, Ordering};

use chrono::{DateTime, Utc};
use smtp_message::Email;

use crate::{chunk::Chunk, recipient::Recipient};

/// A process-unique, monotonically-increasing envelope identifier. Built
/// from a timestamp plus a counter (not random) so it can double as the
/// trailing component of a synthesized `Message-Id:`/`Received:` line, the
/// way NwSMTP derives its own `msg_id_`.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct EnvelopeId {
    pub received_at: DateTime<Utc>,
    pub seq: u32,
}

static NEXT_SEQ: AtomicU32 = AtomicU32::new(1);

impl EnvelopeId {
    pub fn new(now: DateTime<Utc>) -> EnvelopeId {
        EnvelopeId {
            received_at: now,
            seq: NEXT_SEQ.fetch_add(1, Ordering::Relaxed),
        }
    }
}

impl std::fmt::Display for EnvelopeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}.{}",
            self.received_at.format("%Y%m%d%H%M%S"),
            self.seq
        )
    }
}

/// The in-flight state of one message, from `MAIL FROM` through delivery.
/// Grounded on NwSMTP's `envelope.h`.
#[derive(Debug)]
pub struct Envelope {
    pub id: EnvelopeId,
    pub sender: Option<Email>,
    pub recipients: Vec<Recipient>,

    /// Headers synthesized by the orchestrator (`Received:`, `Message-Id:`,
    /// `X-Spam-Flag:`, `Authentication-Results:`, ...).
    pub added_headers: Vec<Chunk>,
    /// Header fields copied through from the original message, in their
    /// original relative order, minus anything in `remove_headers_list`.
    pub retained_headers: Vec<Chunk>,
    /// The body, after CRLF-collapse and dot-unstuffing, as it will be
    /// relayed downstream.
    pub altered_body: Vec<Chunk>,
    /// The body exactly as received on the wire, kept only as long as a
    /// check (DKIM, SO, AV) still needs the untouched bytes.
    pub original_body: Vec<Chunk>,

    pub body_start: usize,
    pub total_size: usize,
    pub is_spam: bool,
    pub no_local_relay: bool,

    pub received_at: DateTime<Utc>,

    /// Populated only once an SMTP AUTH has succeeded for this session.
    pub karma: Option<i64>,
    pub karma_status: Option<String>,
    pub born_date: Option<DateTime<Utc>>,
}

impl Envelope {
    pub fn new(now: DateTime<Utc>) -> Envelope {
        Envelope {
            id: EnvelopeId::new(now),
            sender: None,
            recipients: Vec::new(),
            added_headers: Vec::new(),
            retained_headers: Vec::new(),
            altered_body: Vec::new(),
            original_body: Vec::new(),
            body_start: 0,
            total_size: 0,
            is_spam: false,
            no_local_relay: false,
            received_at: now,
            karma: None,
            karma_status: None,
            born_date: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_ids_increase_monotonically() {
        let now = Utc::now();
        let a = EnvelopeId::new(now);
        let b = EnvelopeId::new(now);
        assert!(b.seq > a.seq);
    }
}
