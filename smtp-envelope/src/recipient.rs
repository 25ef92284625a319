use smtp_message::Email;

/// The outcome of delivering to one [`Recipient`], decided independently per
/// recipient as the orchestrator pipeline runs.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum DeliveryStatus {
    Accept,
    Reject(String),
    Tempfail(String),
    Discard,
}

/// A reference to an in-flight or completed greylisting probe for one
/// recipient, as returned by `smtp-checks::greylisting`.
#[derive(Clone, Debug)]
pub struct GreylistingProbe {
    pub age: std::time::Duration,
    pub hit_count: u32,
}

/// A reference to an in-flight or completed rate-control probe for one
/// recipient, as returned by `smtp-checks::rate_control`.
#[derive(Clone, Debug)]
pub struct RateControlProbe {
    pub exceeded: bool,
}

/// One resolved recipient of an [`Envelope`](crate::Envelope). Recipients
/// are deduplicated by `suid`: resolving the same underlying mailbox twice
/// (e.g. through an alias and directly) merges into one `Recipient` rather
/// than creating two.
#[derive(Clone, Debug)]
pub struct Recipient {
    pub email: Email,
    pub suid: i64,
    pub uid: String,
    pub status: DeliveryStatus,
    pub remote_reply: Option<String>,
    pub spam_status: Option<String>,
    pub greylisting_probe: Option<GreylistingProbe>,
    pub rate_control_probe: Option<RateControlProbe>,
}

impl Recipient {
    pub fn new(email: Email, suid: i64, uid: String) -> Recipient {
        Recipient {
            email,
            suid,
            uid,
            status: DeliveryStatus::Accept,
            remote_reply: None,
            spam_status: None,
            greylisting_probe: None,
            rate_control_probe: None,
        }
    }
}

/// Inserts `recipient` into `recipients`, merging with an existing entry
/// that shares the same `suid` instead of duplicating it.
pub fn add_recipient_deduped(recipients: &mut Vec<Recipient>, recipient: Recipient) {
    if !recipients.iter().any(|r| r.suid == recipient.suid) {
        recipients.push(recipient);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use smtp_message::Email;

    fn email(s: &str) -> Email {
        Email::parse_bracketed(s.as_bytes()).unwrap().into_owned()
    }

    #[test]
    fn dedups_by_suid() {
        let mut recipients = Vec::new();
        add_recipient_deduped(
            &mut recipients,
            Recipient::new(email("<a@example.org>"), 42, "u1".into()),
        );
        add_recipient_deduped(
            &mut recipients,
            Recipient::new(email("<alias-of-a@example.org>"), 42, "u1".into()),
        );
        assert_eq!(recipients.len(), 1);
    }
}
