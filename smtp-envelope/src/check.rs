use std::net::IpAddr;

use chrono::{DateTime, Utc};

/// The outcome of one `smtp-checks` probe run against a session or envelope,
/// logged verbatim regardless of which check produced it. Grounded on
/// NwSMTP's uniform `check_data_t` result shape shared by `dnsbl.cpp`,
/// `aspf.h` and `adkim.cpp`.
#[derive(Clone, Debug)]
pub struct CheckResult {
    pub session_id: u64,
    pub remote_ip_or_host: String,
    pub decision: CheckDecision,
    pub reply: Option<String>,
    pub checked_at: DateTime<Utc>,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CheckDecision {
    Pass,
    Fail,
    SoftFail,
    Neutral,
    TempError,
    PermError,
}

/// The key greylisting buckets probes under. Each field is populated only
/// when the matching `greylisting_use_*` setting turns it on, so two
/// configurations scoping the key differently never collide with each
/// other's buckets. Grounded on NwSMTP's `greylisting_options` (`use_ip`,
/// `use_envelope_from`, `use_envelope_to`, `use_header_from`,
/// `use_header_to`, `use_header_messageid`, `use_header_subject`,
/// `use_header_date`, `use_body`).
#[derive(Clone, Debug, Default, Eq, PartialEq, Hash)]
pub struct GreylistingKey {
    pub remote_ip: Option<IpAddr>,
    pub envelope_from: Option<String>,
    pub envelope_to: Option<String>,
    pub header_from: Option<String>,
    pub header_to: Option<String>,
    pub header_message_id: Option<String>,
    pub header_subject: Option<String>,
    pub header_date: Option<String>,
    pub body_hash: Option<[u8; 32]>,
}
