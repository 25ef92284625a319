//! The per-message check pipeline run from `handle_mail`, once the message
//! itself has already been read into an [`Envelope`] (header parsing and the
//! message-size check happen at ingestion time, before this runs).
//!
//! Each stage can terminate the transaction early (reject or tempfail); a
//! stage that only *annotates* the envelope (greylisting, the spam scorer)
//! falls through to the next one. Every outbound network check — rate
//! control, the spam scorer, the antivirus scanner, DKIM/SPF DNS lookups —
//! is independently timeout-bounded: a wedged backend degrades a single
//! check, never the whole pipeline.

use std::{borrow::Cow, net::SocketAddr};

use ingress_config::Settings;
use smtp_checks::{
    antivirus::ScanVerdict,
    dkim::{BodyHasher, DkimStatus, DkimVerifier},
    greylisting::GreylistingVerdict,
    rate_control::{Command, RcClient, Request},
    spam_scorer::SpamVerdict,
    spf::{SpfEvaluator, SpfLimits, SpfResult},
};
use smtp_envelope::{Chunk, Envelope, GreylistingKey};
use smtp_message::{EnhancedReplyCode, Hostname, MaybeUtf8, Reply, ReplyCode};

use crate::{checks::CheckClients, conn_state::ConnState, headers};

/// Extra per-message facts gathered while scanning headers at ingestion
/// time, that the pipeline needs but that don't belong on [`Envelope`]
/// itself (they describe the *received* message, not the one being relayed).
pub struct MessageFacts<'a> {
    pub raw_headers: &'a [(String, String)],
    pub has_xyandexspam: bool,
    pub dkim_signature_count: usize,
    pub helo_domain: &'a str,
}

pub enum Verdict {
    /// Compose the final message and hand it to the relay stage.
    Deliver(Vec<Chunk>),
    /// Accept the transaction but drop the message on the floor (antivirus
    /// "discard" policy).
    Discard,
    Reject(Reply<Cow<'static, str>>),
    TempFail(Reply<Cow<'static, str>>),
}

pub(crate) fn reply(code: ReplyCode, ecode: EnhancedReplyCode, text: impl Into<String>) -> Reply<Cow<'static, str>> {
    let text = text.into();
    let line = if text.is_ascii() {
        MaybeUtf8::Ascii(Cow::Owned(text))
    } else {
        MaybeUtf8::Utf8(Cow::Owned(text))
    };
    Reply {
        code,
        ecode: Some(ecode),
        text: vec![line],
    }
}

pub(crate) fn tempfail(text: impl Into<String>) -> Reply<Cow<'static, str>> {
    reply(
        ReplyCode::LOCAL_ERROR,
        EnhancedReplyCode::TRANSIENT_UNDEFINED,
        text,
    )
}

pub(crate) fn reject(text: impl Into<String>) -> Reply<Cow<'static, str>> {
    reply(
        ReplyCode::TRANSACTION_FAILED,
        EnhancedReplyCode::PERMANENT_UNDEFINED,
        text,
    )
}

/// Runs stages 3 through 9 of the pipeline; stage 10 (actual relay delivery)
/// is driven by the caller, which is the only place holding the relay
/// `smtp_client::Sender`s.
pub async fn run(
    envelope: &mut Envelope,
    conn: &mut ConnState,
    settings: &Settings,
    checks: &CheckClients,
    facts: &MessageFacts<'_>,
) -> Verdict {
    let skip_so_and_av = settings.so_trust_xyandexspam && facts.has_xyandexspam;

    if let Some(verdict) = greylist(envelope, conn, settings, checks, facts).await {
        return verdict;
    }

    if !skip_so_and_av && (!envelope.is_spam || settings.enable_so_after_greylisting) {
        if let Some(verdict) = spam_score(envelope, conn, settings, checks, facts.helo_domain).await {
            return verdict;
        }
    }

    if !skip_so_and_av {
        if let Some(verdict) = scan_virus(envelope, settings, checks).await {
            return verdict;
        }
    }

    if let Some(verdict) = rate_control_mark(envelope, settings, checks).await {
        return verdict;
    }

    let dkim_result = if facts.dkim_signature_count > 0 {
        verify_dkim(envelope, conn, settings, facts.raw_headers).await
    } else {
        None
    };

    let spf_result = evaluate_spf(envelope, conn, settings, facts.helo_domain).await;

    stamp_authentication_results(envelope, spf_result, dkim_result);

    Verdict::Deliver(headers::compose(envelope))
}

/// Stage 4: probes greylisting for every recipient, in order. A single
/// `too_early`/`too_late` verdict tempfails the whole message; a repeat hit
/// (the key has been seen before within the accepted window) marks the
/// envelope as spam for stage 5 to act on.
async fn greylist(
    envelope: &mut Envelope,
    conn: &ConnState,
    settings: &Settings,
    checks: &CheckClients,
    facts: &MessageFacts<'_>,
) -> Option<Verdict> {
    let client = checks.greylisting.as_ref()?;
    let sender = envelope
        .sender
        .as_ref()
        .map(headers::email_to_string)
        .unwrap_or_default();

    let header = |name: &str| -> Option<String> {
        facts
            .raw_headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.clone())
    };
    let header_from = settings.greylisting_use_header_from.then(|| header("from")).flatten();
    let header_to = settings.greylisting_use_header_to.then(|| header("to")).flatten();
    let header_message_id = settings
        .greylisting_use_header_messageid
        .then(|| header("message-id"))
        .flatten();
    let header_subject = settings
        .greylisting_use_header_subject
        .then(|| header("subject"))
        .flatten();
    let header_date = settings.greylisting_use_header_date.then(|| header("date")).flatten();
    let body_hash = if settings.greylisting_use_body {
        let mut hasher = BodyHasher::new();
        for chunk in &envelope.original_body {
            hasher.push(chunk.as_bytes());
        }
        hasher.finish().try_into().ok()
    } else {
        None
    };

    let mut accepted = true;
    let mut verdict_out = None;
    for recipient in &envelope.recipients {
        let key = GreylistingKey {
            remote_ip: settings.greylisting_use_ip.then_some(conn.remote_ip),
            envelope_from: settings.greylisting_use_envelope_from.then(|| sender.clone()),
            envelope_to: settings
                .greylisting_use_envelope_to
                .then(|| headers::email_to_string(&recipient.email)),
            header_from: header_from.clone(),
            header_to: header_to.clone(),
            header_message_id: header_message_id.clone(),
            header_subject: header_subject.clone(),
            header_date: header_date.clone(),
            body_hash,
        };
        match client.probe(&key, settings.rc_timeout).await {
            Ok((GreylistingVerdict::TooEarly, _)) => {
                accepted = false;
                verdict_out = Some(Verdict::TempFail(tempfail(
                    "4.7.1 Greylisted, please try again later",
                )));
            }
            Ok((GreylistingVerdict::TooLate, _)) => {
                accepted = false;
                verdict_out = Some(Verdict::TempFail(tempfail(
                    "4.7.1 Greylisting window expired, please try again",
                )));
            }
            Ok((GreylistingVerdict::Ok, prior_hits)) => {
                if prior_hits > 0 {
                    envelope.is_spam = true;
                }
            }
            Err(_) => {
                // A wedged greylisting backend must not block mail outright;
                // fall through and let the remaining checks decide.
            }
        }
        let _ = client.mark(&key, accepted, settings.rc_timeout).await;
        if verdict_out.is_some() {
            break;
        }
    }
    verdict_out
}

/// Stage 5: the spam scorer. A "malicious" verdict (the backend rejects the
/// transaction outright) is a hard reject; "spam" flags the envelope and, if
/// configured, stamps `X-Yandex-Spam`.
async fn spam_score(
    envelope: &mut Envelope,
    conn: &ConnState,
    settings: &Settings,
    checks: &CheckClients,
    helo: &str,
) -> Option<Verdict> {
    let client = checks.so.as_ref()?;
    match client
        .scan(envelope, &conn.remote_host, &conn.remote_ip.to_string(), helo)
        .await
    {
        Ok(result) => {
            if result.verdict == SpamVerdict::Spam {
                envelope.is_spam = true;
                if settings.add_xyg_after_greylisting {
                    envelope
                        .added_headers
                        .push(Chunk::from("X-Yandex-Spam: 4\r\n".to_string()));
                }
                for scored in result.recipients {
                    if let Some(recipient) = envelope
                        .recipients
                        .iter_mut()
                        .find(|r| r.suid == scored.suid)
                    {
                        recipient.spam_status = Some(scored.status);
                    }
                }
            }
            None
        }
        Err(smtp_checks::spam_scorer::SoError::Rejected(_)) => {
            Some(Verdict::Reject(reject("5.7.1 Message rejected as spam")))
        }
        Err(_) => Some(Verdict::TempFail(tempfail(
            "4.7.1 Spam scoring backend unavailable",
        ))),
    }
}

/// Stage 6: the antivirus scanner. `Infected`/`Suspicious` are handled per
/// [`VirusAction`](ingress_config::VirusAction); a scan error tempfails
/// rather than risk relaying an unscanned message.
async fn scan_virus(
    envelope: &Envelope,
    settings: &Settings,
    checks: &CheckClients,
) -> Option<Verdict> {
    let client = checks.av.as_ref()?;
    let body = smtp_envelope::join(&envelope.altered_body);
    match client.scan(&body, 0).await {
        Ok(ScanVerdict::Infected) | Ok(ScanVerdict::Suspicious) => {
            match settings.action_virus {
                ingress_config::VirusAction::Reject => {
                    Some(Verdict::Reject(reject("5.7.1 Message contains a virus")))
                }
                ingress_config::VirusAction::Discard => Some(Verdict::Discard),
            }
        }
        Ok(ScanVerdict::Abnormal) => Some(Verdict::TempFail(tempfail(
            "4.7.1 Antivirus scanner returned an abnormal status",
        ))),
        Ok(_) => None,
        Err(_) => Some(Verdict::TempFail(tempfail(
            "4.7.1 Antivirus backend unavailable",
        ))),
    }
}

/// Stage 7: marks every surviving recipient against the generic rate
/// control counter (distinct from the greylisting namespace). Exceeding
/// `rc_limit` within `rc_ttl` tempfails the message; a backend error is
/// treated the same way, since admitting mail nobody could rate-limit is
/// unsafe by default.
async fn rate_control_mark(
    envelope: &Envelope,
    settings: &Settings,
    checks: &CheckClients,
) -> Option<Verdict> {
    if !settings.rc_check || checks.rc_hosts.is_empty() {
        return None;
    }
    for recipient in &envelope.recipients {
        let key = headers::email_to_string(&recipient.email);
        let host = rc_host_for(&checks.rc_hosts, &key);
        let client = match RcClient::connect(host).await {
            Ok(c) => c,
            Err(_) => {
                return Some(Verdict::TempFail(tempfail(
                    "4.7.1 Rate control backend unavailable",
                )));
            }
        };
        let request = Request {
            id: RcClient::make_request_id(&key),
            command: Command::Add as i32,
            namespace: "rate_control".to_string(),
            key: key.clone(),
            ttl_seconds: settings.rc_ttl.as_secs() as u32,
            comment: String::new(),
            parameters: vec![1],
        };
        match client.start(request, settings.rc_timeout).await {
            Ok(response) => {
                let hits = response.counters.get(0).copied().unwrap_or(0);
                if hits > settings.rc_limit {
                    return Some(Verdict::TempFail(tempfail(format!(
                        "4.7.1 Rate limit exceeded for {}",
                        key
                    ))));
                }
            }
            Err(_) => {
                return Some(Verdict::TempFail(tempfail(
                    "4.7.1 Rate control backend unavailable",
                )));
            }
        }
    }
    None
}

fn rc_host_for(hosts: &[SocketAddr], key: &str) -> SocketAddr {
    let hash = RcClient::make_request_id(key);
    hosts[(hash as usize) % hosts.len()]
}

/// Stage 8: verifies every `DKIM-Signature` header found at ingestion time.
/// Only the first signature is checked — multiple independent signatures
/// (common with mailing-list resigning) are out of scope here; the
/// connection still relays, just without a multi-signature verdict.
async fn verify_dkim(
    envelope: &Envelope,
    conn: &ConnState,
    settings: &Settings,
    raw_headers: &[(String, String)],
) -> Option<(DkimStatus, Option<String>)> {
    let mut hasher = BodyHasher::new();
    for chunk in &envelope.original_body {
        hasher.push(chunk.as_bytes());
    }
    let body_hash = hasher.finish();

    let verifier = DkimVerifier::new(&conn.dns);
    smol::future::or(
        async { verifier.verify(raw_headers, &body_hash).await.ok() },
        async {
            smol::Timer::after(settings.dkim_timeout).await;
            None
        },
    )
    .await
}

/// Stage 9's SPF half. Evaluated synchronously here rather than kicked off
/// at `MAIL FROM` time and awaited later: doing so would need a task handle
/// stored on [`Envelope`], which stays a plain, `Debug`-able data record.
/// The cost is that SPF no longer overlaps with the rest of the DATA phase,
/// but it stays independently timeout-bounded just like DKIM.
async fn evaluate_spf(
    envelope: &Envelope,
    conn: &ConnState,
    settings: &Settings,
    helo_domain: &str,
) -> Option<SpfResult> {
    let sender = envelope.sender.as_ref()?;
    let sender_domain = match &sender.hostname {
        Some(Hostname::AsciiDomain { raw }) | Some(Hostname::Utf8Domain { raw, .. }) => raw.clone(),
        _ => return None,
    };

    let mut evaluator = SpfEvaluator::new(&conn.dns, SpfLimits::default());
    smol::future::or(
        async {
            let (result, _explanation) = evaluator
                .evaluate(conn.remote_ip, helo_domain, &sender_domain)
                .await;
            result
        },
        async {
            smol::Timer::after(settings.spf_timeout).await;
            None
        },
    )
    .await
}

/// Stamps the single synthesized `Authentication-Results` header stage 9
/// calls for, from whatever SPF/DKIM results are available (either may be
/// `None` — not attempted, cancelled on timeout, or there was no signature
/// to check).
fn stamp_authentication_results(
    envelope: &mut Envelope,
    spf: Option<SpfResult>,
    dkim: Option<(DkimStatus, Option<String>)>,
) {
    if spf.is_none() && dkim.is_none() {
        return;
    }
    let mut parts = Vec::new();
    if let Some(result) = spf {
        parts.push(format!("spf={}", spf_result_str(result)));
    }
    if let Some((status, identity)) = dkim {
        match identity {
            Some(identity) => parts.push(format!(
                "dkim={} header.i={}",
                dkim_status_str(status),
                identity
            )),
            None => parts.push(format!("dkim={}", dkim_status_str(status))),
        }
    }
    envelope.added_headers.push(Chunk::from(format!(
        "Authentication-Results: {}\r\n",
        parts.join("; ")
    )));
}

fn spf_result_str(result: SpfResult) -> &'static str {
    match result {
        SpfResult::Pass => "pass",
        SpfResult::Fail => "fail",
        SpfResult::SoftFail => "softfail",
        SpfResult::Neutral => "neutral",
        SpfResult::None => "none",
        SpfResult::PermError => "permerror",
        SpfResult::TempError => "temperror",
    }
}

fn dkim_status_str(status: DkimStatus) -> &'static str {
    match status {
        DkimStatus::Pass => "pass",
        DkimStatus::Fail => "fail",
        DkimStatus::Neutral => "neutral",
        DkimStatus::None => "none",
    }
}
