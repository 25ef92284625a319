//! The `smtp_server::Config`/`smtp_client::Config` implementations that wire
//! the check pipeline into `smtp_server::interact`: this is where a raw
//! connection turns into a relayed (or rejected) message.

use std::{
    hash::{Hash, Hasher},
    io,
    net::SocketAddr,
    pin::Pin,
    sync::{Arc, RwLock},
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{TimeZone, Utc};
use futures::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use ingress_config::Settings;
use ingress_types::AliasEntry;
use smtp_checks::auth_backend::{AuthOutcome, MailFromOutcome, RecipientDecision};
use smtp_client::{Client, Protocol};
use smtp_envelope::{add_recipient_deduped, Chunk, DeliveryStatus, Envelope, Recipient};
use smtp_message::{
    DataUnescaper, Email, EnhancedReplyCode, EscapedDataReader, Hostname, ReplyCode,
};
use smtp_pool::{EomParser, EomResult, Pool, Streambuf};
use smtp_server::{AuthCredentials, AuthDecision, ConnectionMetadata, Decision, MailMetadata};

use crate::{checks::CheckClients, conn_state::ConnState, headers, pipeline};

const READ_CHUNK: usize = 16 * 1024;

/// A relay target plus the pair `smtp-checks::HostSwitch` fails over
/// between, paired together since a `Sender` can only be produced from the
/// `Client` that dialed it.
struct Relay<C, P>
where
    C: trust_dns_resolver::proto::DnsHandle<Error = trust_dns_resolver::error::ResolveError>,
    P: trust_dns_resolver::ConnectionProvider<Conn = C>,
{
    client: Client<C, P, RelayConfig>,
    hosts: smtp_checks::HostSwitch<SocketAddr>,
}

/// Ties the per-message pipeline to `smtp_server::interact`: one instance is
/// shared (via `Arc`) across every accepted connection. Built once at
/// startup by the `ingress` binary, which is the only place with the
/// async-constructed DNS resolver and TLS acceptor this needs.
pub struct Orchestrator<C, P>
where
    C: trust_dns_resolver::proto::DnsHandle<Error = trust_dns_resolver::error::ResolveError>,
    P: trust_dns_resolver::ConnectionProvider<Conn = C>,
{
    settings: Arc<Settings>,
    checks: Arc<CheckClients>,
    pool: Arc<Pool>,
    acceptor: Option<async_tls::TlsAcceptor>,
    /// The alias table, reloaded wholesale on SIGHUP. A `RwLock` rather than
    /// something fancier: lookups are a handful of string comparisons, never
    /// held across an `.await`.
    aliases: RwLock<Vec<AliasEntry>>,
    local_relay: Option<Relay<C, P>>,
    fallback_relay: Option<Relay<C, P>>,
}

impl<C, P> Orchestrator<C, P>
where
    C: trust_dns_resolver::proto::DnsHandle<Error = trust_dns_resolver::error::ResolveError>,
    P: trust_dns_resolver::ConnectionProvider<Conn = C>,
{
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        settings: Arc<Settings>,
        checks: Arc<CheckClients>,
        pool: Arc<Pool>,
        acceptor: Option<async_tls::TlsAcceptor>,
        aliases: Vec<AliasEntry>,
        local_relay: Option<(Client<C, P, RelayConfig>, smtp_checks::HostSwitch<SocketAddr>)>,
        fallback_relay: Option<(Client<C, P, RelayConfig>, smtp_checks::HostSwitch<SocketAddr>)>,
    ) -> Orchestrator<C, P> {
        Orchestrator {
            settings,
            checks,
            pool,
            acceptor,
            aliases: RwLock::new(aliases),
            local_relay: local_relay.map(|(client, hosts)| Relay { client, hosts }),
            fallback_relay: fallback_relay.map(|(client, hosts)| Relay { client, hosts }),
        }
    }

    /// Re-reads the alias table. Called from the `ingress` binary's SIGHUP
    /// handler; never touches the rest of `Settings`.
    pub fn reload_aliases(&self, aliases: Vec<AliasEntry>) {
        *self.aliases.write().expect("alias table lock poisoned") = aliases;
    }

    /// Stage 10: hands the composed message to whichever relay applies,
    /// converting it from "a list of envelope-owned chunks" to the
    /// already-escaped, CRLF-dot-CRLF-terminated reader `Sender::send`
    /// requires.
    async fn relay(&self, mut envelope: Envelope, composed: Vec<Chunk>) -> Decision {
        let preferred = self.settings.use_local_relay && !envelope.no_local_relay;
        let relays: Vec<&Relay<C, P>> = if preferred {
            [self.local_relay.as_ref(), self.fallback_relay.as_ref()]
                .into_iter()
                .flatten()
                .collect()
        } else {
            [self.fallback_relay.as_ref(), self.local_relay.as_ref()]
                .into_iter()
                .flatten()
                .collect()
        };
        if relays.is_empty() {
            return Decision::Reject(pipeline::tempfail("4.3.0 No relay is configured"));
        }

        let raw = smtp_envelope::join(&composed);
        let escaped = escape_for_relay(&raw).await;

        // Every recipient starts out pending; each relay attempt only
        // carries the recipients still pending into it, so one relay
        // rejecting/tempfailing a subset doesn't stop the others from being
        // retried against the next relay (the fallback, on a partial LMTP
        // accept).
        let mut pending: Vec<Email> = envelope.recipients.iter().map(|r| r.email.clone()).collect();
        let mut last_error: Option<String> = None;

        for relay in relays {
            if pending.is_empty() {
                break;
            }

            let mut sender = match relay.client.connect_via_relay(&relay.hosts).await {
                Ok(sender) => sender,
                Err(error) => {
                    tracing::warn!(%error, "failed to connect to the relay");
                    last_error = Some(error.to_string());
                    continue;
                }
            };

            match sender
                .send(
                    envelope.sender.as_ref(),
                    &pending,
                    futures::io::Cursor::new(escaped.clone()),
                )
                .await
            {
                Ok(results) => {
                    let mut still_pending = Vec::new();
                    for (email, result) in pending.into_iter().zip(results) {
                        match result {
                            Ok(()) => {
                                if let Some(recipient) = envelope
                                    .recipients
                                    .iter_mut()
                                    .find(|r| r.email == email)
                                {
                                    recipient.status = DeliveryStatus::Accept;
                                }
                            }
                            Err(error) => {
                                last_error = Some(error.to_string());
                                still_pending.push(email);
                            }
                        }
                    }
                    pending = still_pending;
                }
                Err(error) => {
                    tracing::warn!(%error, "relay transaction failed");
                    last_error = Some(error.to_string());
                }
            }
        }

        for email in &pending {
            if let Some(recipient) = envelope.recipients.iter_mut().find(|r| &r.email == email) {
                recipient.status = DeliveryStatus::Tempfail(
                    last_error.clone().unwrap_or_else(|| "relay unreachable".into()),
                );
            }
        }

        if envelope.recipients.iter().any(|r| r.status == DeliveryStatus::Accept) {
            Decision::Accept
        } else {
            Decision::Reject(pipeline::tempfail("4.3.0 Relay rejected every recipient"))
        }
    }
}

#[async_trait]
impl<C, P> smtp_server::Config for Orchestrator<C, P>
where
    C: trust_dns_resolver::proto::DnsHandle<Error = trust_dns_resolver::error::ResolveError>,
    P: trust_dns_resolver::ConnectionProvider<Conn = C>,
{
    type ConnectionUserMeta = ConnState;
    type MailUserMeta = Envelope;

    async fn new_mail(&self, _conn_meta: &mut ConnectionMetadata<ConnState>) -> Envelope {
        Envelope::new(Utc::now())
    }

    fn can_do_tls(&self, conn_meta: &ConnectionMetadata<ConnState>) -> bool {
        self.settings.use_tls
            && self.acceptor.is_some()
            && !conn_meta.is_encrypted
            && conn_meta.hello.as_ref().map(|h| h.is_ehlo).unwrap_or(false)
    }

    fn use_auth(&self) -> bool {
        self.settings.use_auth
    }

    fn use_auth_after_tls(&self) -> bool {
        self.settings.use_auth_after_tls
    }

    fn hard_error_limit(&self) -> u32 {
        self.settings.smtpd_hard_error_limit as u32
    }

    async fn handle_auth(
        &self,
        credentials: AuthCredentials,
        conn_meta: &mut ConnectionMetadata<ConnState>,
    ) -> AuthDecision {
        let auth_backend = match &self.checks.auth_backend {
            Some(client) => client,
            None => return AuthDecision::Reject,
        };
        match auth_backend
            .authenticate(&credentials.authzid, &credentials.password)
            .await
        {
            Ok(AuthOutcome::Accepted { suid }) => {
                conn_meta.user.authenticated_suid = Some(suid);
                AuthDecision::Authenticated
            }
            Ok(AuthOutcome::Rejected) => AuthDecision::Reject,
            Ok(AuthOutcome::Tempfail) => AuthDecision::Tempfail,
            Err(error) => {
                tracing::warn!(%error, "auth backend unavailable");
                AuthDecision::Tempfail
            }
        }
    }

    async fn tls_accept<IO>(
        &self,
        io: IO,
        _conn_meta: &mut ConnectionMetadata<ConnState>,
    ) -> io::Result<duplexify::Duplex<Pin<Box<dyn Send + AsyncRead>>, Pin<Box<dyn Send + AsyncWrite>>>>
    where
        IO: 'static + Unpin + Send + AsyncRead + AsyncWrite,
    {
        let acceptor = self
            .acceptor
            .clone()
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "TLS is not configured"))?;
        let stream = acceptor.accept(io).await?;
        let (r, w) = stream.split();
        Ok(duplexify::Duplex::new(
            Box::pin(r) as Pin<Box<dyn Send + AsyncRead>>,
            Box::pin(w) as Pin<Box<dyn Send + AsyncWrite>>,
        ))
    }

    async fn filter_from(
        &self,
        from: &mut Option<Email<&str>>,
        meta: &mut MailMetadata<Envelope>,
        conn_meta: &mut ConnectionMetadata<ConnState>,
    ) -> Decision {
        if self.settings.rbl_check {
            if !conn_meta.user.rbl_checked {
                conn_meta.user.rbl_checked = true;
                if let Some(rbl) = &self.checks.rbl {
                    let remote_ip = conn_meta.user.remote_ip;
                    if let Some(hit) = rbl.check(&conn_meta.user.dns, remote_ip).await {
                        tracing::info!(zone = %hit.zone, %remote_ip, "RBL hit on MAIL FROM");
                        conn_meta.user.rbl_reply = Some(hit.reply);
                    }
                }
            }
            if let Some(text) = conn_meta.user.rbl_reply.clone() {
                return Decision::Reject(pipeline::reply(
                    ReplyCode::TRANSACTION_FAILED,
                    EnhancedReplyCode::new_permanent(7, 1),
                    text,
                ));
            }
        }

        if let (Some(_), Some(suid)) =
            (&conn_meta.authenticated_as, conn_meta.user.authenticated_suid.clone())
        {
            if let Some(auth_backend) = &self.checks.auth_backend {
                if let Some(from_addr) = from.as_ref() {
                    let addr = headers::email_to_string(&from_addr.clone().into_owned());
                    match auth_backend.verify_mailfrom(&suid, &addr).await {
                        Ok(MailFromOutcome::Match {
                            karma,
                            karma_status,
                            born_date,
                        }) => {
                            meta.user.karma = Some(karma as i64);
                            meta.user.karma_status = Some(karma_status.to_string());
                            meta.user.born_date = Some(Utc.timestamp(born_date, 0));
                        }
                        Ok(MailFromOutcome::Mismatch) => {
                            return Decision::Reject(pipeline::reply(
                                ReplyCode::MAILBOX_NAME_INCORRECT,
                                EnhancedReplyCode::PERMANENT_UNDEFINED,
                                "5.1.8 Envelope sender does not match the authenticated user",
                            ));
                        }
                        Err(error) => {
                            tracing::warn!(%error, "auth backend mailfrom check unavailable");
                            return Decision::Reject(pipeline::tempfail(
                                "4.3.0 Auth backend is unavailable",
                            ));
                        }
                    }
                }
            }
        }

        meta.user.sender = from.clone().map(Email::into_owned);
        Decision::Accept
    }

    async fn filter_to(
        &self,
        to: &mut Email<&str>,
        meta: &mut MailMetadata<Envelope>,
        _conn_meta: &mut ConnectionMetadata<ConnState>,
    ) -> Decision {
        if meta.user.recipients.len() >= self.settings.smtpd_recipient_limit {
            return Decision::Reject(pipeline::reject(
                "5.5.3 Too many recipients for this message",
            ));
        }

        if self.settings.bb_check {
            if let Some(auth_backend) = &self.checks.auth_backend {
                let addr = headers::email_to_string(&to.clone().into_owned());
                match auth_backend.lookup_recipient(&addr).await {
                    Ok(RecipientDecision::Accept { .. }) => {}
                    Ok(RecipientDecision::Reject(reason)) => {
                        return Decision::Reject(pipeline::reply(
                            ReplyCode::MAILBOX_UNAVAILABLE,
                            EnhancedReplyCode::PERMANENT_BAD_DEST_MAILBOX,
                            format!("5.1.1 {}", reason),
                        ));
                    }
                    Ok(RecipientDecision::Tempfail(reason)) => {
                        return Decision::Reject(pipeline::tempfail(format!("4.3.0 {}", reason)));
                    }
                    Ok(RecipientDecision::PolicyReject(reason)) => {
                        return Decision::Reject(pipeline::reply(
                            ReplyCode::POLICY_REASON,
                            EnhancedReplyCode::PERMANENT_UNDEFINED,
                            format!("5.7.1 {}", reason),
                        ));
                    }
                    Ok(RecipientDecision::NewUserTempban) => {
                        return Decision::Reject(pipeline::tempfail(
                            "4.7.1 New account is temporarily restricted from receiving mail",
                        ));
                    }
                    Err(error) => {
                        tracing::warn!(%error, "auth backend recipient lookup unavailable");
                        return Decision::Reject(pipeline::tempfail(
                            "4.3.0 Auth backend is unavailable",
                        ));
                    }
                }
            }
        }

        let targets: Vec<Email> = if to.hostname.is_none() {
            let local = headers::email_to_string(&to.clone().into_owned());
            let aliases = self.aliases.read().expect("alias table lock poisoned");
            match aliases.iter().find(|a| a.source == local) {
                Some(entry) => {
                    meta.user.no_local_relay = true;
                    entry.destinations.clone()
                }
                None => vec![to.clone().into_owned()],
            }
        } else {
            vec![to.clone().into_owned()]
        };

        for target in targets {
            let email = headers::email_to_string(&target);
            let suid = recipient_suid(&email);
            add_recipient_deduped(
                &mut meta.user.recipients,
                Recipient::new(target, suid, suid.to_string()),
            );
        }

        Decision::Accept
    }

    async fn handle_mail<'a, R>(
        &self,
        stream: &mut EscapedDataReader<'a, R>,
        meta: MailMetadata<Envelope>,
        conn_meta: &mut ConnectionMetadata<ConnState>,
    ) -> Decision
    where
        R: Send + Unpin + AsyncRead,
    {
        let mut envelope = meta.user;

        let mut buf = Streambuf::new(self.pool.clone());
        let mut total = 0usize;
        let mut over_limit = false;
        let mut ignore = [0u8; READ_CHUNK];
        loop {
            let dst: &mut [u8] = if over_limit {
                &mut ignore
            } else {
                buf.prepare(READ_CHUNK)
            };
            let read = match read_with_timeout(stream, dst, self.settings.smtpd_data_timeout).await
            {
                Ok(read) => read,
                Err(error) => {
                    return Decision::Kill {
                        reply: Some(pipeline::tempfail("4.4.2 Timed out receiving message data")),
                        res: Err(error),
                    };
                }
            };
            if read == 0 {
                break;
            }
            if !over_limit {
                buf.commit(read);
                total += read;
                if total > self.settings.message_size_limit {
                    over_limit = true;
                }
            }
        }
        stream.complete();

        if over_limit {
            return Decision::Reject(pipeline::reject("5.3.4 Message size exceeds the limit"));
        }

        // `EscapedDataReader` only finds the `.\r\n` terminator; it never
        // strips the dot-stuffing escape, so the boundary it found still has
        // to be re-derived from what actually landed in `buf`, and the body
        // itself still has to be unescaped before anything downstream reads
        // it as real content.
        let mut eom = EomParser::new();
        let body_end = match eom.scan(&buf) {
            EomResult::Found { body_end, .. } => body_end,
            EomResult::NotFound => buf.len(),
        };

        let mut raw_body = Vec::with_capacity(body_end);
        raw_body.extend_from_slice(buf.contiguous(0, body_end, &mut Vec::new()));
        let unescape_res = DataUnescaper::new(true).unescape(&mut raw_body);
        // `unescape` holds back a trailing `\r`/`\r\n` as "unhandled", on the
        // assumption that the caller will feed it a following chunk that
        // might turn it into a dot-stuffing escape. There is no following
        // chunk here — `body_end` already marks the true end of the body —
        // so that held-back tail is genuine content, not a pending escape,
        // and has to be appended rather than dropped.
        let tail_len = raw_body.len() - unescape_res.unhandled_idx;
        if unescape_res.unhandled_idx != unescape_res.written {
            raw_body.copy_within(unescape_res.unhandled_idx.., unescape_res.written);
        }
        raw_body.truncate(unescape_res.written + tail_len);

        let mut buf = Streambuf::new(self.pool.clone());
        let mut written = 0;
        while written < raw_body.len() {
            let chunk = &raw_body[written..];
            let dst = buf.prepare(chunk.len());
            let n = dst.len().min(chunk.len());
            dst[..n].copy_from_slice(&chunk[..n]);
            buf.commit(n);
            written += n;
        }

        let parsed = headers::scan_headers(
            &buf,
            self.settings.remove_headers,
            &self.settings.remove_headers_list,
        );

        envelope.body_start = parsed.body_start;
        envelope.total_size = buf.len();
        envelope.retained_headers = parsed.retained.clone();
        envelope.original_body = buf
            .slice_chunks(parsed.body_start, buf.len())
            .into_iter()
            .map(Chunk::Owned)
            .collect();
        envelope.altered_body = if self.settings.remove_extra_cr {
            let mut collapsed = Vec::with_capacity(envelope.original_body.len());
            let mut collapser = smtp_pool::CrlfCollapser::new();
            for chunk in &envelope.original_body {
                collapser.push(chunk.as_bytes(), &mut collapsed);
            }
            collapser.finish(&mut collapsed);
            vec![Chunk::Owned(Bytes::from(collapsed))]
        } else {
            envelope.original_body.clone()
        };

        let remote_host = conn_meta.user.remote_host.clone();
        let remote_ip = conn_meta.user.remote_ip;
        let is_ehlo = conn_meta.hello.as_ref().map(|h| h.is_ehlo).unwrap_or(false);
        let protocol = match (is_ehlo, conn_meta.is_encrypted) {
            (true, true) => "ESMTPS",
            (true, false) => "ESMTP",
            (false, _) => "SMTP",
        };
        headers::synthesize_missing(
            &mut envelope,
            &parsed,
            &self.settings.hostname,
            &remote_host,
            remote_ip,
            protocol,
            Utc::now(),
        );

        let helo_domain = conn_meta
            .hello
            .as_ref()
            .map(|h| hostname_to_string(&h.hostname))
            .unwrap_or_default();

        let facts = pipeline::MessageFacts {
            raw_headers: &parsed.raw_pairs,
            has_xyandexspam: parsed.has_xyandexspam,
            dkim_signature_count: parsed.dkim_signatures,
            helo_domain: &helo_domain,
        };

        let verdict = pipeline::run(
            &mut envelope,
            &mut conn_meta.user,
            &self.settings,
            &self.checks,
            &facts,
        )
        .await;

        match verdict {
            pipeline::Verdict::Deliver(composed) => self.relay(envelope, composed).await,
            pipeline::Verdict::Discard => Decision::Accept,
            pipeline::Verdict::Reject(reply) => Decision::Reject(reply),
            pipeline::Verdict::TempFail(reply) => Decision::Reject(reply),
        }
    }

    fn hostname(&self) -> std::borrow::Cow<'static, str> {
        std::borrow::Cow::Owned(self.settings.hostname.clone())
    }

    fn banner(&self) -> std::borrow::Cow<'static, str> {
        match &self.settings.smtp_banner {
            Some(banner) => std::borrow::Cow::Owned(banner.clone()),
            None => std::borrow::Cow::Borrowed("Service ready"),
        }
    }
}

/// Races a read against `timeout`, since `handle_mail` is solely responsible
/// for bounding how long a client may dribble `DATA` in: `interact` itself
/// applies no timeout once `DATA` has started.
async fn read_with_timeout<R>(stream: &mut R, buf: &mut [u8], timeout: Duration) -> io::Result<usize>
where
    R: AsyncRead + Unpin,
{
    smol::future::or(async { stream.read(buf).await }, async {
        smol::Timer::after(timeout).await;
        Err(io::Error::new(
            io::ErrorKind::TimedOut,
            "timed out reading message data",
        ))
    })
    .await
}

/// Runs `raw` through the dot-stuffing/CRLF-dot-CRLF escaping
/// `smtp_client::Sender::send` requires of its `mail` argument. Writing to
/// an in-memory `Cursor` cannot fail, so the only way this would return an
/// error is a bug in `EscapingDataWriter` itself.
async fn escape_for_relay(raw: &[u8]) -> Vec<u8> {
    let mut sink = futures::io::Cursor::new(Vec::with_capacity(raw.len() + 5));
    {
        let mut writer = smtp_message::EscapingDataWriter::new(&mut sink);
        writer
            .write_all(raw)
            .await
            .expect("writing to an in-memory Cursor cannot fail");
        writer
            .finish()
            .await
            .expect("writing to an in-memory Cursor cannot fail");
    }
    sink.into_inner()
}

fn hostname_to_string<S: AsRef<str>>(hostname: &Hostname<S>) -> String {
    hostname.raw().as_ref().to_string()
}

/// A stable per-destination id used to dedupe recipients reached through
/// more than one path (direct `RCPT TO` vs. alias expansion). Not a
/// cryptographic hash, just a deterministic one: `DefaultHasher` is a
/// process-stable `SipHash`, good enough for in-memory deduplication across
/// a single connection's lifetime.
fn recipient_suid(email: &str) -> i64 {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    email.hash(&mut hasher);
    (hasher.finish() & 0x7fff_ffff_ffff_ffff) as i64
}

/// `smtp_client::Config` for the local/fallback relay connections: plain
/// SMTP to an internal smarthost, no TLS (an internal relay is assumed to
/// sit on a trusted network; see `DESIGN.md`).
pub struct RelayConfig {
    pub ehlo_hostname: String,
    pub protocol: Protocol,
    pub command_timeout: chrono::Duration,
    pub data_timeout: chrono::Duration,
}

impl RelayConfig {
    pub fn new(ehlo_hostname: String, protocol: Protocol, settings: &Settings) -> RelayConfig {
        RelayConfig {
            ehlo_hostname,
            protocol,
            command_timeout: chrono_duration(settings.relay_cmd_timeout),
            data_timeout: chrono_duration(settings.relay_data_timeout),
        }
    }
}

fn chrono_duration(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::minutes(5))
}

#[async_trait]
impl smtp_client::Config for RelayConfig {
    fn ehlo_hostname(&self) -> Hostname<String> {
        Hostname::AsciiDomain {
            raw: self.ehlo_hostname.clone(),
        }
    }

    fn protocol(&self) -> Protocol {
        self.protocol
    }

    fn can_do_tls(&self) -> bool {
        false
    }

    async fn tls_connect<IO>(&self, _io: IO) -> io::Result<smtp_client::DynAsyncReadWrite>
    where
        IO: 'static + Unpin + Send + AsyncRead + AsyncWrite,
    {
        Err(io::Error::new(
            io::ErrorKind::Other,
            "TLS to the relay is not configured",
        ))
    }

    fn command_write_timeout(&self) -> chrono::Duration {
        self.command_timeout
    }

    fn ehlo_reply_timeout(&self) -> chrono::Duration {
        self.command_timeout
    }

    fn mail_reply_timeout(&self) -> chrono::Duration {
        self.command_timeout
    }

    fn rcpt_reply_timeout(&self) -> chrono::Duration {
        self.command_timeout
    }

    fn data_init_reply_timeout(&self) -> chrono::Duration {
        self.command_timeout
    }

    fn data_block_write_timeout(&self) -> chrono::Duration {
        self.data_timeout
    }

    fn data_end_reply_timeout(&self) -> chrono::Duration {
        self.data_timeout
    }
}
