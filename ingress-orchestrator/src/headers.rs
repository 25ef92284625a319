use std::net::IpAddr;

use chrono::{DateTime, Utc};
use smtp_envelope::{Chunk, Envelope};
use smtp_message::{Email, Hostname, Localpart};
use smtp_pool::{parse_headers, Streambuf};

/// `user@host`, or just `user` for a bare localpart with no `@domain`.
/// `Email`/`Hostname`/`Localpart` have no `Display` impl of their own (the
/// wire codec writes `IoSlice`s instead), so this is the one place that
/// needs to turn one into a human-readable string: log lines, greylisting
/// keys and synthesized headers.
pub fn email_to_string(email: &Email) -> String {
    let local = match &email.localpart {
        Localpart::Ascii { raw } | Localpart::Utf8 { raw } => raw.clone(),
        Localpart::QuotedAscii { raw } | Localpart::QuotedUtf8 { raw } => format!("\"{}\"", raw),
    };
    match &email.hostname {
        Some(Hostname::AsciiDomain { raw })
        | Some(Hostname::Utf8Domain { raw, .. })
        | Some(Hostname::Ipv4 { raw, .. })
        | Some(Hostname::Ipv6 { raw, .. }) => format!("{}@{}", local, raw),
        None => local,
    }
}

/// One header field found (or not) while scanning the message, case folded.
pub struct ParsedHeaders {
    pub retained: Vec<Chunk>,
    /// Every received header as a `(name, value)` pair, in original order,
    /// regardless of `remove_headers` — DKIM verification canonicalizes
    /// against the headers exactly as signed, before any stripping.
    pub raw_pairs: Vec<(String, String)>,
    pub has_to: bool,
    pub has_from: bool,
    pub has_message_id: bool,
    pub has_date: bool,
    pub has_subject: bool,
    pub has_xyandexspam: bool,
    pub dkim_signatures: usize,
    pub body_start: usize,
}

/// Scans the received headers, keeping every field not named in
/// `remove_headers_list` (when `remove_headers` is set) in their original
/// relative order, and records which of the headers the orchestrator may
/// need to synthesize are already present.
pub fn scan_headers(
    buf: &Streambuf,
    remove_headers: bool,
    remove_headers_list: &[String],
) -> ParsedHeaders {
    let (fields, body_start) = parse_headers(buf, 0);

    let mut retained = Vec::with_capacity(fields.len());
    let mut raw_pairs = Vec::with_capacity(fields.len());
    let mut has_to = false;
    let mut has_from = false;
    let mut has_message_id = false;
    let mut has_date = false;
    let mut has_subject = false;
    let mut has_xyandexspam = false;
    let mut dkim_signatures = 0;

    let mut scratch = Vec::new();
    for field in &fields {
        let name = buf.contiguous(
            field.name_range.start,
            field.name_range.end,
            &mut scratch,
        );
        let name = String::from_utf8_lossy(name).into_owned();

        let mut value_scratch = Vec::new();
        let value = buf.contiguous(
            field.value_range.start,
            field.value_range.end,
            &mut value_scratch,
        );
        raw_pairs.push((name.clone(), String::from_utf8_lossy(value).into_owned()));

        match name.to_ascii_lowercase().as_str() {
            "to" => has_to = true,
            "from" => has_from = true,
            "message-id" => has_message_id = true,
            "date" => has_date = true,
            "subject" => has_subject = true,
            "x-yandex-spam" => has_xyandexspam = true,
            "dkim-signature" => dkim_signatures += 1,
            _ => {}
        }

        let drop_field = remove_headers
            && remove_headers_list
                .iter()
                .any(|h| h.eq_ignore_ascii_case(&name));
        if drop_field {
            continue;
        }

        let mut scratch = Vec::new();
        let bytes = buf.contiguous(field.full_range.start, field.full_range.end, &mut scratch);
        retained.push(Chunk::from(bytes::Bytes::copy_from_slice(bytes)));
    }

    ParsedHeaders {
        retained,
        raw_pairs,
        has_to,
        has_from,
        has_message_id,
        has_date,
        has_subject,
        has_xyandexspam,
        dkim_signatures,
        body_start,
    }
}

/// Appends the headers the orchestrator must synthesize when they are
/// missing from the received message (stage 2), plus any the later stages
/// stamp unconditionally (`Received:`).
pub fn synthesize_missing(
    envelope: &mut Envelope,
    parsed: &ParsedHeaders,
    hostname: &str,
    remote_host: &str,
    remote_ip: IpAddr,
    protocol: &str,
    now: DateTime<Utc>,
) {
    envelope.added_headers.push(Chunk::from(format!(
        "Received: from {} ({}) by {} with {} id {}; {}\r\n",
        remote_host,
        remote_ip,
        hostname,
        protocol,
        envelope.id,
        now.to_rfc2822()
    )));
    envelope
        .added_headers
        .push(Chunk::from(format!("X-Yandex-Front: {}\r\n", hostname)));
    envelope.added_headers.push(Chunk::from(format!(
        "X-Yandex-TimeMark: {}\r\n",
        now.timestamp()
    )));

    if !parsed.has_message_id {
        envelope.added_headers.push(Chunk::from(format!(
            "Message-Id: <{}@{}>\r\n",
            envelope.id, hostname
        )));
    }
    if !parsed.has_date {
        envelope
            .added_headers
            .push(Chunk::from(format!("Date: {}\r\n", now.to_rfc2822())));
    }
    if !parsed.has_from {
        envelope.added_headers.push(Chunk::from(format!(
            "From: <{}>\r\n",
            envelope
                .sender
                .as_ref()
                .map(email_to_string)
                .unwrap_or_default()
        )));
    }
    if !parsed.has_to {
        let to = envelope
            .recipients
            .iter()
            .map(|r| email_to_string(&r.email))
            .collect::<Vec<_>>()
            .join(", ");
        envelope
            .added_headers
            .push(Chunk::from(format!("To: {}\r\n", to)));
    }
}

/// Concatenates everything stage 9 needs into the final relayed message:
/// synthesized headers, then retained headers, a blank line, then the
/// (possibly altered) body.
pub fn compose(envelope: &Envelope) -> Vec<Chunk> {
    let mut out = Vec::with_capacity(
        envelope.added_headers.len() + envelope.retained_headers.len() + envelope.altered_body.len() + 1,
    );
    out.extend(envelope.added_headers.iter().cloned());
    out.extend(envelope.retained_headers.iter().cloned());
    out.push(Chunk::Static(b"\r\n"));
    out.extend(envelope.altered_body.iter().cloned());
    out
}
