use std::{
    cmp,
    collections::BTreeMap,
    fmt,
    future::Future,
    io,
    io::IoSlice,
    net::{IpAddr, SocketAddr},
    ops::Range,
    pin::Pin,
    sync::Arc,
};

use async_trait::async_trait;
use bitflags::bitflags;
use chrono::Utc;
use futures::{pin_mut, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use rand::prelude::SliceRandom;
use smol::net::TcpStream;
use smtp_checks::HostSwitch;
use tracing::trace;
use trust_dns_resolver::{
    error::{ResolveError, ResolveErrorKind},
    proto::error::ProtoError,
    AsyncResolver, IntoName,
};

use smtp_message::{
    nom, Command, Email, EnhancedReplyCodeSubject, Hostname, Parameters, Reply, ReplyCodeKind,
};

/// Which variant of the LMTP/SMTP command set a [`Sender`] speaks. LMTP (RFC
/// 2033) is identical to SMTP on the wire except for the greeting verb
/// (`LHLO` instead of `EHLO`) and for returning one reply per accepted
/// recipient after the final `.` instead of a single reply for the whole
/// transaction.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Protocol {
    Smtp,
    Lmtp,
}

const SMTP_PORT: u16 = 25;

const RDBUF_SIZE: usize = 16 * 1024;
const DATABUF_SIZE: usize = 16 * 1024;
const MINIMUM_FREE_BUFSPACE: usize = 128;

const ZERO_DURATION: std::time::Duration = std::time::Duration::from_secs(0);

pub type DynAsyncReadWrite =
    duplexify::Duplex<Pin<Box<dyn Send + AsyncRead>>, Pin<Box<dyn Send + AsyncWrite>>>;

#[derive(Eq, Hash, PartialEq)]
pub struct Destination {
    host: Hostname,
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.host.fmt(f)
    }
}

#[async_trait]
pub trait Config {
    fn ehlo_hostname(&self) -> Hostname<String>;

    /// Defaults to plain SMTP; override to speak LMTP to the downstream
    /// peer instead.
    fn protocol(&self) -> Protocol {
        Protocol::Smtp
    }

    fn can_do_tls(&self) -> bool {
        true
    }

    // TODO: make this parameterized on the destination
    fn must_do_tls(&self) -> bool {
        false
    }

    /// Note: If this function can only fail, make can_do_tls return false
    async fn tls_connect<IO>(&self, io: IO) -> io::Result<DynAsyncReadWrite>
    where
        IO: 'static + Unpin + Send + AsyncRead + AsyncWrite;

    fn banner_read_timeout(&self) -> chrono::Duration {
        chrono::Duration::minutes(5)
    }

    fn command_write_timeout(&self) -> chrono::Duration {
        chrono::Duration::minutes(5)
    }

    fn ehlo_reply_timeout(&self) -> chrono::Duration {
        chrono::Duration::minutes(5)
    }

    fn starttls_reply_timeout(&self) -> chrono::Duration {
        chrono::Duration::minutes(2)
    }

    fn mail_reply_timeout(&self) -> chrono::Duration {
        chrono::Duration::minutes(5)
    }

    fn rcpt_reply_timeout(&self) -> chrono::Duration {
        chrono::Duration::minutes(5)
    }

    fn data_init_reply_timeout(&self) -> chrono::Duration {
        chrono::Duration::minutes(2)
    }

    fn data_block_write_timeout(&self) -> chrono::Duration {
        chrono::Duration::minutes(3)
    }

    fn data_end_reply_timeout(&self) -> chrono::Duration {
        chrono::Duration::minutes(10)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Retrieving MX DNS records for ‘{0}’")]
    DnsMx(String, #[source] ResolveError),

    #[error("Converting hostname ‘{0}’ to to-be-resolved name")]
    HostToTrustDns(String, #[source] ProtoError),

    #[error("Retrieving IP DNS records for ‘{1}’")]
    DnsIp(trust_dns_resolver::Name, #[source] ResolveError),

    #[error("Connecting to ‘{0}’ port ‘{1}’")]
    Connecting(IpAddr, u16, #[source] io::Error),

    #[error("Receiving reply bytes")]
    ReceivingReplyBytes(#[source] io::Error),

    #[error("Timed out while waiting for a reply")]
    TimedOutWaitingForReply,

    #[error("Connection aborted")]
    ConnectionAborted,

    #[error("Reply does not fit in buffer: ‘{0}’")]
    TooLongReply(String),

    #[error("Syntax error parsing as a reply: ‘{0}’")]
    SyntaxError(String),

    #[error("Timed out while sending a command")]
    TimedOutSendingCommand,

    #[error("Sending command")]
    SendingCommand(#[source] io::Error),

    #[error("Negotiating TLS")]
    NegotiatingTls(#[source] io::Error),

    #[error("Cannot do TLS with remote server")]
    CannotDoTls,

    // TODO: add the command as error context
    #[error("Mail-level transient issue: {0}")]
    TransientMail(Reply),

    #[error("Mailbox-level transient issue: {0}")]
    TransientMailbox(Reply),

    #[error("Mail system-level transient issue: {0}")]
    TransientMailSystem(Reply),

    #[error("Mail-level permanent issue: {0}")]
    PermanentMail(Reply),

    #[error("Mailbox-level permanent issue: {0}")]
    PermanentMailbox(Reply),

    #[error("Mail system-level permanent issue: {0}")]
    PermanentMailSystem(Reply),

    #[error("Unexpected reply code: {0}")]
    UnexpectedReplyCode(Reply),

    #[error("Timed out while sending data")]
    TimedOutSendingData,

    #[error("Sending data")]
    SendingData(#[source] io::Error),

    #[error("Reading the mail from the provided reader")]
    ReadingMail(#[source] io::Error),
}

pub enum TransportErrorSeverity {
    Local,
    NetworkTransient,
    MailTransient,
    MailboxTransient,
    MailSystemTransient,
    MailPermanent,
    MailboxPermanent,
    MailSystemPermanent,
}

impl TransportError {
    pub fn severity(&self) -> TransportErrorSeverity {
        // TODO: Re-run over all these failure modes and check that the kind assignment
        // is correct. Maybe add categories like ProtocolPermanent for invalid
        // hostnames, or LocalTransient for local errors like “too many sockets opened”?
        match self {
            TransportError::DnsMx(_, _) => TransportErrorSeverity::NetworkTransient,
            TransportError::HostToTrustDns(_, _) => TransportErrorSeverity::Local,
            TransportError::DnsIp(_, _) => TransportErrorSeverity::NetworkTransient,
            TransportError::Connecting(_, _, _) => TransportErrorSeverity::NetworkTransient,
            TransportError::ReceivingReplyBytes(_) => TransportErrorSeverity::NetworkTransient,
            TransportError::TimedOutWaitingForReply => TransportErrorSeverity::NetworkTransient,
            TransportError::ConnectionAborted => TransportErrorSeverity::NetworkTransient,
            TransportError::TooLongReply(_) => TransportErrorSeverity::NetworkTransient,
            TransportError::SyntaxError(_) => TransportErrorSeverity::MailSystemTransient,
            TransportError::TimedOutSendingCommand => TransportErrorSeverity::NetworkTransient,
            TransportError::SendingCommand(_) => TransportErrorSeverity::NetworkTransient,
            TransportError::NegotiatingTls(_) => TransportErrorSeverity::NetworkTransient, /* TODO: MailSystemPermanent? */
            TransportError::CannotDoTls => TransportErrorSeverity::NetworkTransient, /* TODO: MailSystemPermanent? */
            TransportError::TransientMail(_) => TransportErrorSeverity::MailTransient,
            TransportError::TransientMailbox(_) => TransportErrorSeverity::MailboxTransient,
            TransportError::TransientMailSystem(_) => TransportErrorSeverity::MailSystemTransient,
            TransportError::PermanentMail(_) => TransportErrorSeverity::MailPermanent,
            TransportError::PermanentMailbox(_) => TransportErrorSeverity::MailboxPermanent,
            TransportError::PermanentMailSystem(_) => TransportErrorSeverity::MailSystemPermanent,
            TransportError::UnexpectedReplyCode(_) => TransportErrorSeverity::NetworkTransient,
            TransportError::TimedOutSendingData => TransportErrorSeverity::NetworkTransient,
            TransportError::SendingData(_) => TransportErrorSeverity::NetworkTransient,
            TransportError::ReadingMail(_) => TransportErrorSeverity::Local,
        }
    }
}

async fn read_for_reply<T>(
    fut: impl Future<Output = io::Result<T>>,
    waiting_for_reply_since: &chrono::DateTime<Utc>,
    timeout: chrono::Duration,
) -> Result<T, TransportError> {
    smol::future::or(
        async { fut.await.map_err(TransportError::ReceivingReplyBytes) },
        async {
            // TODO: this should be smol::Timer::at, but we would need to convert from
            // Chrono::DateTime<Utc> to std::time::Instant and I can't find how right now
            let max_delay: std::time::Duration = (*waiting_for_reply_since + timeout - Utc::now())
                .to_std()
                .unwrap_or(ZERO_DURATION);
            smol::Timer::after(max_delay).await;
            Err(TransportError::TimedOutWaitingForReply)
        },
    )
    .await
}

async fn read_reply<IO>(
    io: &mut IO,
    rdbuf: &mut [u8; RDBUF_SIZE],
    unhandled: &mut Range<usize>,
    timeout: chrono::Duration,
) -> Result<Reply, TransportError>
where
    IO: Unpin + Send + AsyncRead + AsyncWrite,
{
    let start = Utc::now();
    // TODO: try to think of unifying this logic with the one in smtp-server?
    if (*unhandled).is_empty() {
        *unhandled = 0..read_for_reply(io.read(rdbuf), &start, timeout).await?;
        if (*unhandled).is_empty() {
            return Err(TransportError::ConnectionAborted);
        }
    }
    loop {
        trace!(
            buf = String::from_utf8_lossy(&rdbuf[unhandled.clone()]).as_ref(),
            "Trying to parse from buffer"
        );
        match Reply::<&str>::parse(&rdbuf[unhandled.clone()]) {
            Err(nom::Err::Incomplete(n)) => {
                // Don't have enough data to handle command, let's fetch more
                if unhandled.start != 0 {
                    // Do we have to copy the data to the beginning of the buffer?
                    let missing = match n {
                        nom::Needed::Unknown => MINIMUM_FREE_BUFSPACE,
                        nom::Needed::Size(s) => cmp::max(MINIMUM_FREE_BUFSPACE, s.into()),
                    };
                    if missing > rdbuf.len() - unhandled.end {
                        rdbuf.copy_within(unhandled.clone(), 0);
                        unhandled.end = unhandled.len();
                        unhandled.start = 0;
                    }
                }
                if unhandled.end == rdbuf.len() {
                    // If we reach here, it means that unhandled is already
                    // basically the full buffer. Which means that we have to
                    // error out that the reply is too big.
                    // TODO: maybe there's something intelligent to be done here, like parsing reply
                    // line per reply line?
                    return Err(TransportError::TooLongReply(
                        String::from_utf8_lossy(&rdbuf[unhandled.clone()]).to_string(),
                    ));
                } else {
                    let read =
                        read_for_reply(io.read(&mut rdbuf[unhandled.end..]), &start, timeout)
                            .await?;
                    if read == 0 {
                        return Err(TransportError::ConnectionAborted);
                    }
                    unhandled.end += read;
                }
            }
            Err(_) => {
                // Syntax error
                // TODO: maybe we can recover better than this?
                return Err(TransportError::SyntaxError(
                    String::from_utf8_lossy(&rdbuf[unhandled.clone()]).to_string(),
                ));
            }
            Ok((rem, reply)) => {
                // Got a reply
                unhandled.start = unhandled.end - rem.len();
                // TODO: when polonius is ready, we can remove this allocation by returning a
                // borrow of the input buffer (with NLL it conflicts with the mutable borrow of
                // rdbuf in the other match arm)
                return Ok(reply.into_owned());
            }
        }
    }
}

fn verify_reply(r: Reply, expected: ReplyCodeKind) -> Result<(), TransportError> {
    use EnhancedReplyCodeSubject::*;
    use ReplyCodeKind::*;
    use TransportError::*;
    match (r.code.kind(), r.ecode.as_ref().map(|e| e.subject())) {
        (k, _) if k == expected => Ok(()),
        (TransientNegative, Some(Mailbox)) => Err(TransientMailbox(r)),
        (PermanentNegative, Some(Mailbox)) => Err(PermanentMailbox(r)),
        (TransientNegative, Some(MailSystem)) => Err(TransientMailSystem(r)),
        (PermanentNegative, Some(MailSystem)) => Err(PermanentMailSystem(r)),
        (TransientNegative, _) => Err(TransientMail(r)),
        (PermanentNegative, _) => Err(PermanentMail(r)),
        (_, _) => Err(UnexpectedReplyCode(r)),
    }
}

async fn send_command<IO>(
    io: &mut IO,
    cmd: Command<&str>,
    timeout: chrono::Duration,
) -> Result<(), TransportError>
where
    IO: Unpin + Send + AsyncRead + AsyncWrite,
{
    trace!(
        cmd = String::from_utf8_lossy(
            // TODO: there _must_ be a better way to do that
            &cmd.as_io_slices()
                .flat_map(|s| s.to_vec().into_iter())
                .collect::<Vec<_>>()
        )
        .as_ref(),
        "Sending command"
    );
    smol::future::or(
        async {
            io.write_all_vectored(&mut cmd.as_io_slices().collect::<Vec<_>>())
                .await
                .map_err(TransportError::SendingCommand)?;
            Ok(())
        },
        async {
            smol::Timer::after(timeout.to_std().unwrap_or(ZERO_DURATION)).await;
            Err(TransportError::TimedOutSendingCommand)
        },
    )
    .await
}

pub struct Client<C, P, Cfg>
where
    C: trust_dns_resolver::proto::DnsHandle<Error = trust_dns_resolver::error::ResolveError>,
    P: trust_dns_resolver::ConnectionProvider<Conn = C>,
    Cfg: Config,
{
    resolver: AsyncResolver<C, P>,
    cfg: Arc<Cfg>,
}

impl<C, P, Cfg> Client<C, P, Cfg>
where
    C: trust_dns_resolver::proto::DnsHandle<Error = trust_dns_resolver::error::ResolveError>,
    P: trust_dns_resolver::ConnectionProvider<Conn = C>,
    Cfg: Config,
{
    /// Note: Passing as `resolver` something that is configured with
    /// `Ipv6andIpv4` may lead to unexpected behavior, as the client will
    /// attempt to connect to both the Ipv6 and the Ipv4 address if whichever
    /// comes first doesn't successfully connect. In particular, it means that
    /// performance could be degraded.
    pub fn new(resolver: AsyncResolver<C, P>, cfg: Arc<Cfg>) -> Client<C, P, Cfg> {
        Client { resolver, cfg }
    }

    pub async fn get_destination(&self, host: &Hostname) -> Result<Destination, TransportError> {
        // TODO: already resolve here, but that means having to handle DNS expiration
        // down the road
        Ok(Destination { host: host.clone() })
    }

    pub async fn connect(&self, dest: &Destination) -> Result<Sender<Cfg>, TransportError> {
        match dest.host {
            Hostname::Ipv4 { ip, .. } => self.connect_to_ip(IpAddr::V4(ip), SMTP_PORT).await,
            Hostname::Ipv6 { ip, .. } => self.connect_to_ip(IpAddr::V6(ip), SMTP_PORT).await,
            Hostname::AsciiDomain { ref raw } => self.connect_to_mx(&raw).await,
            Hostname::Utf8Domain { ref punycode, .. } => self.connect_to_mx(&punycode).await,
        }
    }

    pub async fn connect_to_mx(&self, host: &str) -> Result<Sender<Cfg>, TransportError> {
        // TODO: consider adding a `.` at the end of `host`... but is it
        // actually allowed?
        // Run MX lookup
        let lookup = self.resolver.mx_lookup(host).await;
        let lookup = match lookup {
            Ok(l) => l,
            Err(e) => {
                if let ResolveErrorKind::NoRecordsFound { .. } = e.kind() {
                    // If there are no MX records, try A/AAAA records
                    return self
                        .connect_to_host(
                            host.into_name()
                                .map_err(|e| TransportError::HostToTrustDns(host.to_owned(), e))?,
                            SMTP_PORT,
                        )
                        .await;
                } else {
                    return Err(TransportError::DnsMx(host.to_owned(), e));
                }
            }
        };

        // Retrieve the actual records
        let mut mx_records = BTreeMap::new();
        for record in lookup.iter() {
            mx_records
                .entry(record.preference())
                .or_insert_with(|| Vec::with_capacity(1))
                .push(record.exchange());
        }

        // If there are no MX records, try A/AAAA records
        if mx_records.is_empty() {
            // TODO: is this actually required? trust_dns_resolver should return
            // NoRecordsFound anyway
            return self
                .connect_to_host(
                    host.into_name()
                        .map_err(|e| TransportError::HostToTrustDns(host.to_owned(), e))?,
                    SMTP_PORT,
                )
                .await;
        }

        // By increasing order of priority, try each MX
        // TODO: definitely should not return the first error but the first least severe
        // error
        let mut first_error = None;
        for (_, mut mxes) in mx_records {
            // Among a single priority level, randomize the order
            // TODO: consider giving a way to seed for reproducibility?
            mxes.shuffle(&mut rand::thread_rng());

            // Then try to connect to each address
            // TODO: sometimes the DNS server already returns the IP alongside the MX record
            // in the answer to the MX request, in which case we could directly
            // connect_to_ip
            for mx in mxes {
                match self.connect_to_host(mx.clone(), SMTP_PORT).await {
                    Ok(sender) => return Ok(sender),
                    Err(e) => first_error = first_error.or(Some(e)),
                }
            }
        }

        // The below unwrap is safe because, to reach it:
        // - there must be some MX records or we'd have returned in the if above
        // - there have been no error as otherwise first_error wouldn't be None
        // - there must have only be errors as otherwise we'd have returned in the match
        //   above
        // Hence, if it triggers it means that \exists N, N > 1 \wedge N = 0, where N is
        // the number of errors.
        //   QED.
        Err(first_error.unwrap())
    }

    async fn connect_to_host(
        &self,
        name: trust_dns_resolver::Name,
        port: u16,
    ) -> Result<Sender<Cfg>, TransportError> {
        // Lookup the IP addresses associated with this name
        let lookup = self
            .resolver
            .lookup_ip(name.clone())
            .await
            .map_err(|e| TransportError::DnsIp(name, e))?;

        // Following the order given by the DNS server, attempt connecting
        // TODO: definitely should not return the first error but the first least severe
        // error
        let mut first_error = None;
        for ip in lookup.iter() {
            match self.connect_to_ip(ip, port).await {
                Ok(sender) => return Ok(sender),
                Err(e) => first_error = first_error.or(Some(e)),
            }
        }

        // See comment on connect_to_mx above for why this unwrap is correct
        Err(first_error.unwrap())
    }

    pub async fn connect_to_ip(
        &self,
        ip: IpAddr,
        port: u16,
    ) -> Result<Sender<Cfg>, TransportError> {
        // TODO: introduce a connection uuid to associate log messages together
        trace!("Connecting to ip {}:{}", ip, port);
        // TODO: bind to specified outgoing IP address with net2 (first bind the builder
        // to the outgoing IP, then connect)
        let io = TcpStream::connect((ip, port))
            .await
            .map_err(|e| TransportError::Connecting(ip, port, e))?;
        let (reader, writer) = io.split();
        self.connect_to_stream(duplexify::Duplex::new(Box::pin(reader), Box::pin(writer)))
            .await
    }

    // TODO: add a connect_to_{host,ip}_smtps

    /// Dials a fixed relay pair through [`HostSwitch`] instead of resolving
    /// MX/A/AAAA records, for deployments that hand off to a local or
    /// fallback smarthost rather than delivering directly. Reports a dial
    /// failure back to `relay` via [`HostSwitch::fault`] so that a
    /// persistently-down primary gets failed over for subsequent calls.
    pub async fn connect_via_relay(
        &self,
        relay: &HostSwitch<SocketAddr>,
    ) -> Result<Sender<Cfg>, TransportError> {
        let addr = relay.get_primary();
        match self.connect_to_ip(addr.ip(), addr.port()).await {
            Ok(sender) => Ok(sender),
            Err(e) => {
                relay.fault();
                Err(e)
            }
        }
    }

    pub async fn connect_to_stream(
        &self,
        io: DynAsyncReadWrite,
    ) -> Result<Sender<Cfg>, TransportError> {
        let mut sender = Sender {
            io,
            rdbuf: [0; RDBUF_SIZE],
            unhandled: 0..0,
            extensions: Extensions::empty(),
            cfg: self.cfg.clone(),
        };
        // TODO: Are there interesting things to do with replies apart from checking
        // they're successful? Maybe logging them or something like that?

        // Read the banner
        let reply = read_reply(
            &mut sender.io,
            &mut sender.rdbuf,
            &mut sender.unhandled,
            self.cfg.banner_read_timeout(),
        )
        .await?;
        verify_reply(reply, ReplyCodeKind::PositiveCompletion)?;

        // Send EHLO
        // TODO: fallback to HELO if EHLO fails (also record somewhere that this
        // destination doesn't support HELO)
        self.send_ehlo(&mut sender).await?;

        // Send STARTTLS if possible
        let mut did_tls = false;
        if sender.extensions.contains(Extensions::STARTTLS) && self.cfg.can_do_tls() {
            // Send STARTTLS and check the reply
            send_command(
                &mut sender.io,
                Command::Starttls,
                self.cfg.command_write_timeout(),
            )
            .await?;
            let reply = read_reply(
                &mut sender.io,
                &mut sender.rdbuf,
                &mut sender.unhandled,
                self.cfg.starttls_reply_timeout(),
            )
            .await?;
            if let Ok(()) = verify_reply(reply, ReplyCodeKind::PositiveCompletion) {
                // TODO: pipelining is forbidden across starttls, check unhandled.empty()
                // Negotiate STARTTLS
                sender.io = self
                    .cfg
                    .tls_connect(sender.io)
                    .await
                    .map_err(TransportError::NegotiatingTls)?;
                // TODO: in case this call fails, maybe log? also, if
                // we have must_do_tls, this server should probably be
                // removed from the retry list as no matching ciphers
                // is probably a permanent error.
                //
                // TODO: Retry without TLS enabled! Currently servers that support starttls but
                // only with ancient ciphers are unreachable
                //
                // TODO: Split out the error condition “network error” from “negotiation failed”
                // so as to know whether we should try STARTTLS again next time

                // Send EHLO again
                self.send_ehlo(&mut sender).await?;
                did_tls = true;
            } else {
                // Server failed to accept STARTTLS. Let's fall through and
                // continue without it (unless must_do_tls is enabled)
                // TODO: maybe log? also, if we have must_do_tls and this
                // returns a permanent error we definitely should bounce
            }
        }
        if !did_tls && self.cfg.must_do_tls() {
            return Err(TransportError::CannotDoTls);
        }

        // TODO: AUTH

        Ok(sender)
    }

    async fn send_ehlo(&self, sender: &mut Sender<Cfg>) -> Result<(), TransportError> {
        let ehlo = Command::Ehlo {
            hostname: self.cfg.ehlo_hostname().to_ref(),
        };
        match self.cfg.protocol() {
            Protocol::Smtp => {
                send_command(&mut sender.io, ehlo, self.cfg.command_write_timeout()).await?;
            }
            Protocol::Lmtp => {
                // RFC 2033: identical framing to EHLO, the verb is LHLO.
                // `Command` has no dedicated variant for it, so the EHLO
                // slices are reused with the verb swapped out.
                let mut slices: Vec<IoSlice> = ehlo.as_io_slices().collect();
                slices[0] = IoSlice::new(b"LHLO ");
                let timeout = self.cfg.command_write_timeout();
                smol::future::or(
                    async {
                        sender
                            .io
                            .write_all_vectored(&mut slices)
                            .await
                            .map_err(TransportError::SendingCommand)
                    },
                    async {
                        smol::Timer::after(timeout.to_std().unwrap_or(ZERO_DURATION)).await;
                        Err(TransportError::TimedOutSendingCommand)
                    },
                )
                .await?;
            }
        }

        // Parse the reply and verify it
        let reply = read_reply(
            &mut sender.io,
            &mut sender.rdbuf,
            &mut sender.unhandled,
            self.cfg.ehlo_reply_timeout(),
        )
        .await?;
        sender.extensions = Extensions::empty();
        for line in reply.text.iter() {
            if line.as_str().eq_ignore_ascii_case("STARTTLS") {
                sender.extensions.insert(Extensions::STARTTLS);
            } else if line.as_str().eq_ignore_ascii_case("PIPELINING") {
                sender.extensions.insert(Extensions::PIPELINING);
            }
        }
        verify_reply(reply, ReplyCodeKind::PositiveCompletion)?;

        Ok(())
    }
}

bitflags! {
    struct Extensions: u8 {
        const STARTTLS = 0b1;
        const PIPELINING = 0b10;
    }
}

pub struct Sender<Cfg> {
    io: DynAsyncReadWrite,
    rdbuf: [u8; RDBUF_SIZE],
    unhandled: Range<usize>,
    extensions: Extensions,
    cfg: Arc<Cfg>,
}

impl<Cfg> Sender<Cfg>
where
    Cfg: Config,
{
    /// Sends a single mail to one or more recipients in one transaction.
    ///
    /// `mail` must be a reader of the *already escaped and
    /// CRLF-dot-CRLF-terminated* message! If this is not the format
    /// you have, please looking into the `smtp-message` crate's
    /// utilities.
    ///
    /// Returns one outcome per entry of `to`, in the same order. A
    /// recipient rejected at the `RCPT TO` stage gets its error recorded
    /// right there and never reaches the `DATA` phase. If every recipient
    /// is rejected, `DATA` is skipped entirely and the per-recipient
    /// errors are returned without a further protocol error. When talking
    /// LMTP (`Config::protocol` returns [`Protocol::Lmtp`]), the final
    /// reply is read once per *accepted* recipient per RFC 2033; over
    /// plain SMTP a single final reply applies to all of them.
    pub async fn send<Reader>(
        &mut self,
        from: Option<&Email>,
        to: &[Email],
        mail: Reader,
    ) -> Result<Vec<Result<(), TransportError>>, TransportError>
    where
        Reader: AsyncRead,
    {
        macro_rules! read_reply {
            ($expected:expr, $timeout:expr) => {
                async {
                    let reply =
                        read_reply(&mut self.io, &mut self.rdbuf, &mut self.unhandled, $timeout)
                            .await?;
                    verify_reply(reply, $expected)
                }
            };
        }

        let mail_cmd = Command::Mail {
            path: None,
            email: from.map(|f| f.to_ref()),
            params: Parameters(Vec::new()),
        };
        let rcpt_cmds: Vec<Command<&str>> = to
            .iter()
            .map(|email| Command::Rcpt {
                path: None,
                email: email.to_ref(),
                params: Parameters(Vec::new()),
            })
            .collect();

        if self.extensions.contains(Extensions::PIPELINING) {
            // RFC 2920: MAIL FROM and every RCPT TO can be written as one
            // batch; replies are still read back one at a time, in the
            // order the commands were written.
            let mut slices: Vec<IoSlice> = mail_cmd.as_io_slices().collect();
            for cmd in &rcpt_cmds {
                slices.extend(cmd.as_io_slices());
            }
            let timeout = self.cfg.command_write_timeout();
            smol::future::or(
                async {
                    self.io
                        .write_all_vectored(&mut slices)
                        .await
                        .map_err(TransportError::SendingCommand)
                },
                async {
                    smol::Timer::after(timeout.to_std().unwrap_or(ZERO_DURATION)).await;
                    Err(TransportError::TimedOutSendingCommand)
                },
            )
            .await?;
        } else {
            send_command(&mut self.io, mail_cmd, self.cfg.command_write_timeout()).await?;
        }

        // MAIL FROM's reply: a rejection here is fatal to the whole
        // transaction, there is nobody left to report it to per recipient.
        read_reply!(
            ReplyCodeKind::PositiveCompletion,
            self.cfg.mail_reply_timeout()
        )
        .await?;

        if !self.extensions.contains(Extensions::PIPELINING) {
            for cmd in rcpt_cmds {
                send_command(&mut self.io, cmd, self.cfg.command_write_timeout()).await?;
            }
        }

        // RCPT TO replies, one per recipient, in order.
        let mut results = Vec::with_capacity(to.len());
        for _ in 0..to.len() {
            results.push(
                read_reply!(
                    ReplyCodeKind::PositiveCompletion,
                    self.cfg.rcpt_reply_timeout()
                )
                .await,
            );
        }

        let accepted: Vec<usize> = results
            .iter()
            .enumerate()
            .filter(|(_, r)| r.is_ok())
            .map(|(i, _)| i)
            .collect();
        if accepted.is_empty() {
            return Ok(results);
        }

        // DATA
        send_command(
            &mut self.io,
            Command::Data,
            self.cfg.command_write_timeout(),
        )
        .await?;
        read_reply!(
            ReplyCodeKind::PositiveIntermediate,
            self.cfg.data_init_reply_timeout()
        )
        .await?;

        // Send the contents of the email
        {
            pin_mut!(mail);
            let cfg = self.cfg.clone();
            let mut databuf = [0; DATABUF_SIZE];
            loop {
                match mail.read(&mut databuf).await {
                    Ok(0) => {
                        // End of stream
                        break;
                    }
                    Ok(n) => {
                        // Got n bytes, try sending with a timeout
                        smol::future::or(
                            async {
                                self.io
                                    .write_all(&databuf[..n])
                                    .await
                                    .map_err(TransportError::SendingData)
                            },
                            async {
                                smol::Timer::after(
                                    cfg.data_block_write_timeout()
                                        .to_std()
                                        .unwrap_or(ZERO_DURATION),
                                )
                                .await;
                                Err(TransportError::TimedOutSendingData)
                            },
                        )
                        .await?;
                    }
                    Err(e) => return Err(TransportError::ReadingMail(e)),
                }
            }
        }

        // Wait for the final reply/replies and fill in the outcome of every
        // accepted recipient.
        match self.cfg.protocol() {
            Protocol::Smtp => {
                let reply = read_reply(
                    &mut self.io,
                    &mut self.rdbuf,
                    &mut self.unhandled,
                    self.cfg.data_end_reply_timeout(),
                )
                .await?;
                for i in accepted {
                    results[i] = verify_reply(reply.clone(), ReplyCodeKind::PositiveCompletion);
                }
            }
            Protocol::Lmtp => {
                for i in accepted {
                    results[i] = read_reply!(
                        ReplyCodeKind::PositiveCompletion,
                        self.cfg.data_end_reply_timeout()
                    )
                    .await;
                }
            }
        }

        Ok(results)
    }
}

// TODO: is it important to call QUIT before closing the TCP stream?

#[cfg(test)]
mod tests {
    use super::*;

    use futures::{executor, io::Cursor};

    struct TestConfig {
        protocol: Protocol,
    }

    #[async_trait]
    impl Config for TestConfig {
        fn ehlo_hostname(&self) -> Hostname<String> {
            Hostname::AsciiDomain {
                raw: "test.example.org".to_owned(),
            }
        }

        fn protocol(&self) -> Protocol {
            self.protocol
        }

        async fn tls_connect<IO>(&self, _io: IO) -> io::Result<DynAsyncReadWrite>
        where
            IO: 'static + Unpin + Send + AsyncRead + AsyncWrite,
        {
            Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "tls not exercised in these tests",
            ))
        }
    }

    fn email(s: &str) -> Email {
        Email::parse_bracketed(format!("<{}>", s).as_bytes()).unwrap()
    }

    fn make_sender(
        input: &'static [u8],
        cfg: Arc<TestConfig>,
        extensions: Extensions,
    ) -> (Sender<TestConfig>, &'static mut Vec<u8>) {
        let resp = Box::leak(Box::new(Vec::new()));
        let resp2 = unsafe { &mut *(resp as *mut _) };
        let reader: Pin<Box<dyn Send + AsyncRead>> = Box::pin(Cursor::new(input));
        let writer: Pin<Box<dyn Send + AsyncWrite>> = Box::pin(Cursor::new(resp2));
        let sender = Sender {
            io: duplexify::Duplex::new(reader, writer),
            rdbuf: [0; RDBUF_SIZE],
            unhandled: 0..0,
            extensions,
            cfg,
        };
        (sender, resp)
    }

    #[test]
    fn smtp_rejected_recipient_does_not_block_the_accepted_one() {
        let cfg = Arc::new(TestConfig {
            protocol: Protocol::Smtp,
        });
        let wire = b"250 2.1.0 Ok\r\n\
                     250 2.1.5 Ok\r\n\
                     550 5.2.1 Mailbox unavailable\r\n\
                     354 End data with <CR><LF>.<CR><LF>\r\n\
                     250 2.0.0 Queued as 1234\r\n";
        let (mut sender, resp) = make_sender(wire, cfg, Extensions::empty());

        let to = vec![email("alice@example.org"), email("bob@example.org")];
        let mail = Cursor::new(&b"Subject: hi\r\n\r\nHello\r\n.\r\n"[..]);
        let results =
            executor::block_on(sender.send(None, &to, mail)).expect("transport-level success");

        assert_eq!(results.len(), 2);
        assert!(results[0].is_ok());
        match results[1] {
            Err(TransportError::PermanentMailbox(_)) => (),
            ref other => panic!("expected a permanent mailbox error, got {:?}", other),
        }

        assert_eq!(
            &**resp,
            &b"MAIL FROM:<>\r\n\
               RCPT TO:<alice@example.org>\r\n\
               RCPT TO:<bob@example.org>\r\n\
               DATA\r\n\
               Subject: hi\r\n\r\nHello\r\n.\r\n"[..]
        );
    }

    #[test]
    fn lmtp_gives_each_recipient_its_own_final_reply() {
        let cfg = Arc::new(TestConfig {
            protocol: Protocol::Lmtp,
        });
        let wire = b"250 2.1.0 Ok\r\n\
                     250 2.1.5 Ok\r\n\
                     250 2.1.5 Ok\r\n\
                     354 End data with <CR><LF>.<CR><LF>\r\n\
                     250 2.0.0 Delivered\r\n\
                     550 5.2.1 Mailbox full\r\n";
        let (mut sender, _resp) = make_sender(wire, cfg, Extensions::empty());

        let to = vec![email("alice@example.org"), email("bob@example.org")];
        let mail = Cursor::new(&b".\r\n"[..]);
        let results =
            executor::block_on(sender.send(None, &to, mail)).expect("transport-level success");

        assert_eq!(results.len(), 2);
        assert!(results[0].is_ok());
        match results[1] {
            Err(TransportError::PermanentMailbox(_)) => (),
            ref other => panic!("expected a permanent mailbox error, got {:?}", other),
        }
    }

    #[test]
    fn pipelining_batches_mail_and_rcpt_into_one_write() {
        let cfg = Arc::new(TestConfig {
            protocol: Protocol::Smtp,
        });
        let wire = b"250 2.1.0 Ok\r\n\
                     250 2.1.5 Ok\r\n\
                     250 2.1.5 Ok\r\n\
                     354 End data with <CR><LF>.<CR><LF>\r\n\
                     250 2.0.0 Queued\r\n";
        let (mut sender, resp) = make_sender(wire, cfg, Extensions::PIPELINING);

        let to = vec![email("alice@example.org"), email("bob@example.org")];
        let mail = Cursor::new(&b".\r\n"[..]);
        let results =
            executor::block_on(sender.send(None, &to, mail)).expect("transport-level success");

        assert!(results.iter().all(Result::is_ok));
        assert_eq!(
            &**resp,
            &b"MAIL FROM:<>\r\n\
               RCPT TO:<alice@example.org>\r\n\
               RCPT TO:<bob@example.org>\r\n\
               DATA\r\n\
               .\r\n"[..]
        );
    }

    #[test]
    fn all_recipients_rejected_skips_data() {
        let cfg = Arc::new(TestConfig {
            protocol: Protocol::Smtp,
        });
        let wire = b"250 2.1.0 Ok\r\n\
                     550 5.2.1 Mailbox unavailable\r\n";
        let (mut sender, resp) = make_sender(wire, cfg, Extensions::empty());

        let to = vec![email("alice@example.org")];
        let mail = Cursor::new(&b".\r\n"[..]);
        let results =
            executor::block_on(sender.send(None, &to, mail)).expect("transport-level success");

        assert_eq!(results.len(), 1);
        assert!(results[0].is_err());
        assert_eq!(
            &**resp,
            &b"MAIL FROM:<>\r\nRCPT TO:<alice@example.org>\r\n"[..]
        );
    }
}
