use std::net::IpAddr;

use ingress_types::SessionId;
use smtp_checks::dns::DnsClient;

/// Per-connection state threaded through as `smtp_server::Config`'s
/// `ConnectionUserMeta`. Built once by the `ingress` binary's accept loop
/// (which is also where [`super::connection_manager::ConnectionManager`] is
/// consulted) and handed to `smtp_server::interact`.
///
/// `dns` is intentionally one instance per connection rather than a
/// process-wide shared client: SPF/DKIM/RBL lookups for one session must
/// never serialize behind another session's in-flight query.
pub struct ConnState {
    pub session_id: SessionId,
    pub remote_ip: IpAddr,
    pub remote_host: String,
    pub dns: DnsClient,

    /// Cached result of the RBL probe, run once per connection on the first
    /// `MAIL FROM` and reused across any subsequent message on the same
    /// session (`RSET` included).
    pub rbl_checked: bool,
    pub rbl_reply: Option<String>,

    /// The suid the auth backend handed back from `AUTH`, kept alongside
    /// `ConnectionMetadata::authenticated_as` (which only carries the login
    /// the client typed) so `filter_from`'s mailfrom-karma capture can
    /// address the backend by suid.
    pub authenticated_suid: Option<String>,
}

impl ConnState {
    pub fn new(
        session_id: SessionId,
        remote_ip: IpAddr,
        remote_host: String,
        dns: DnsClient,
    ) -> ConnState {
        ConnState {
            session_id,
            remote_ip,
            remote_host,
            dns,
            rbl_checked: false,
            rbl_reply: None,
            authenticated_suid: None,
        }
    }
}
