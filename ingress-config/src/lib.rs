//! Native configuration for the ingress SMTP node: a `structopt` CLI plus a
//! `serde`-deserialized settings file, in place of a compiled-policy-blob
//! configuration system this node has no use for (see `DESIGN.md`).

use std::{net::SocketAddr, path::PathBuf, time::Duration};

use ingress_types::{AliasEntry, IpRestriction};
use serde::Deserialize;
use structopt::StructOpt;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read configuration file {path:?}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse configuration file {path:?}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("failed to read aliases file {path:?}")]
    Aliases {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to read IP restriction file {path:?}")]
    IpConfig {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, StructOpt)]
#[structopt(name = "ingress", about = "A highly configurable SMTP ingress node.")]
pub struct Opt {
    /// Path to the TOML settings file.
    #[structopt(long, parse(from_os_str))]
    pub config: PathBuf,
}

/// What to do with a message the anti-virus check flagged as infected or
/// suspicious.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum VirusAction {
    Discard,
    Reject,
}

fn default_recipient_limit() -> usize {
    100
}

fn default_hard_error_limit() -> usize {
    20
}

/// The full configuration surface of the ingress node, one field per key,
/// `snake_case` names matching the key names verbatim.
#[derive(Debug, Deserialize)]
pub struct Settings {
    pub listen: Vec<SocketAddr>,
    #[serde(default)]
    pub ssl_listen: Vec<SocketAddr>,
    #[serde(default)]
    pub smtp_banner: Option<String>,
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Local identity advertised in the SMTP banner, EHLO reply and
    /// synthesized `Received`/`Message-Id` headers. Defaults to the
    /// machine's own hostname.
    #[serde(default = "default_hostname")]
    pub hostname: String,

    #[serde(default)]
    pub rbl_check: bool,
    #[serde(default)]
    pub rbl_hosts: Vec<String>,

    /// Recursive resolver used for SPF/RBL/PTR lookups, so the
    /// `ingress-orchestrator` crate has a concrete address to build
    /// `smtp-checks::dns::DnsClient` from.
    #[serde(default = "default_dns_resolver")]
    pub dns_resolver: SocketAddr,

    pub bb_primary: Option<SocketAddr>,
    pub bb_secondary: Option<SocketAddr>,
    #[serde(with = "humantime_serde", default = "default_short_timeout")]
    pub bb_timeout: Duration,
    #[serde(default = "default_try")]
    pub bb_try: u32,
    /// Gates `RCPT TO`'s recipient-backend lookup independently of
    /// `use_auth`, which only gates the `AUTH` verb and `MAIL FROM`'s
    /// authenticated-sender check.
    #[serde(default)]
    pub bb_check: bool,

    pub so_primary: Option<SocketAddr>,
    pub so_secondary: Option<SocketAddr>,
    #[serde(with = "humantime_serde", default = "default_connect_timeout")]
    pub so_connect_timeout: Duration,
    #[serde(with = "humantime_serde", default = "default_data_timeout")]
    pub so_data_timeout: Duration,
    #[serde(default = "default_try")]
    pub so_try: u32,
    #[serde(default)]
    pub so_check: bool,
    #[serde(default)]
    pub so_trust_xyandexspam: bool,

    pub av_primary: Option<SocketAddr>,
    pub av_secondary: Option<SocketAddr>,
    #[serde(with = "humantime_serde", default = "default_connect_timeout")]
    pub av_connect_timeout: Duration,
    #[serde(with = "humantime_serde", default = "default_data_timeout")]
    pub av_data_timeout: Duration,
    #[serde(default = "default_try")]
    pub av_try: u32,
    #[serde(default)]
    pub av_check: bool,
    #[serde(default = "default_virus_action")]
    pub action_virus: VirusAction,

    #[serde(default)]
    pub rc_host_list: Vec<String>,
    #[serde(default = "default_rc_port")]
    pub rc_port: u16,
    #[serde(with = "humantime_serde", default = "default_short_timeout")]
    pub rc_timeout: Duration,
    #[serde(default)]
    pub rc_verbose: bool,
    #[serde(default)]
    pub rc_check: bool,
    /// Requests per `rc_ttl` window tolerated before the session pipeline
    /// tempfails the recipient. The rate-control wire protocol itself is a
    /// generic counter store with no notion of a limit, so the actual
    /// threshold has to live on this side.
    #[serde(default = "default_rc_limit")]
    pub rc_limit: u32,
    #[serde(with = "humantime_serde", default = "default_rc_ttl")]
    pub rc_ttl: Duration,

    #[serde(with = "humantime_serde", default = "default_greylisting_ttl")]
    pub greylisting_ttl: Duration,
    #[serde(with = "humantime_serde", default = "default_greylisting_window_begin")]
    pub greylisting_window_begin: Duration,
    #[serde(with = "humantime_serde", default = "default_greylisting_window_end")]
    pub greylisting_window_end: Duration,

    /// Which fields compose the greylisting key, mirroring NwSMTP's
    /// `greylisting_options` toggles one for one.
    #[serde(default = "default_true")]
    pub greylisting_use_ip: bool,
    #[serde(default = "default_true")]
    pub greylisting_use_envelope_from: bool,
    #[serde(default = "default_true")]
    pub greylisting_use_envelope_to: bool,
    #[serde(default)]
    pub greylisting_use_header_from: bool,
    #[serde(default)]
    pub greylisting_use_header_to: bool,
    #[serde(default)]
    pub greylisting_use_header_messageid: bool,
    #[serde(default)]
    pub greylisting_use_header_subject: bool,
    #[serde(default)]
    pub greylisting_use_header_date: bool,
    #[serde(default)]
    pub greylisting_use_body: bool,

    #[serde(with = "humantime_serde", default = "default_short_timeout")]
    pub spf_timeout: Duration,
    #[serde(with = "humantime_serde", default = "default_short_timeout")]
    pub dkim_timeout: Duration,

    pub aliases: Option<PathBuf>,

    #[serde(default = "default_recipient_limit")]
    pub smtpd_recipient_limit: usize,
    pub smtpd_client_connection_count_limit: Option<u32>,
    pub smtpd_connection_count_limit: Option<u32>,
    #[serde(default = "default_hard_error_limit")]
    pub smtpd_hard_error_limit: usize,

    #[serde(with = "humantime_serde", default = "default_connect_timeout")]
    pub relay_connect_timeout: Duration,
    #[serde(with = "humantime_serde", default = "default_short_timeout")]
    pub relay_cmd_timeout: Duration,
    #[serde(with = "humantime_serde", default = "default_data_timeout")]
    pub relay_data_timeout: Duration,
    #[serde(with = "humantime_serde", default = "default_command_timeout")]
    pub smtpd_command_timeout: Duration,
    #[serde(with = "humantime_serde", default = "default_data_timeout")]
    pub smtpd_data_timeout: Duration,

    #[serde(default)]
    pub allow_percent_hack: bool,

    pub fallback_relay_host: Option<SocketAddr>,
    pub local_relay_host: Option<SocketAddr>,
    #[serde(default)]
    pub use_local_relay: bool,

    #[serde(default = "default_message_size_limit")]
    pub message_size_limit: usize,
    #[serde(default)]
    pub remove_headers: bool,
    #[serde(default)]
    pub remove_headers_list: Vec<String>,
    #[serde(default)]
    pub remove_extra_cr: bool,

    pub ip_config_file: Option<PathBuf>,

    #[serde(default)]
    pub use_tls: bool,
    pub tls_key_file: Option<PathBuf>,
    pub tls_cert_file: Option<PathBuf>,
    pub tls_ca_file: Option<PathBuf>,

    #[serde(default)]
    pub use_auth: bool,
    #[serde(default)]
    pub use_auth_after_tls: bool,

    #[serde(default)]
    pub use_greylisting: bool,
    pub greylisting_config_file: Option<PathBuf>,
    #[serde(default)]
    pub enable_so_after_greylisting: bool,
    #[serde(default)]
    pub add_xyg_after_greylisting: bool,
}

fn default_dns_resolver() -> SocketAddr {
    SocketAddr::from(([8, 8, 8, 8], 53))
}

fn default_rc_limit() -> u32 {
    100
}

fn default_rc_ttl() -> Duration {
    Duration::from_secs(60)
}

fn default_greylisting_ttl() -> Duration {
    Duration::from_secs(36 * 3600)
}

fn default_greylisting_window_begin() -> Duration {
    Duration::from_secs(5 * 60)
}

fn default_greylisting_window_end() -> Duration {
    Duration::from_secs(2 * 3600)
}

fn default_true() -> bool {
    true
}

fn default_workers() -> usize {
    num_cpus_hint()
}

fn num_cpus_hint() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

fn default_hostname() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "localhost".to_string())
}

fn default_try() -> u32 {
    2
}

fn default_rc_port() -> u16 {
    11311
}

fn default_short_timeout() -> Duration {
    Duration::from_secs(1)
}

fn default_connect_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_command_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_data_timeout() -> Duration {
    Duration::from_secs(5 * 60)
}

fn default_message_size_limit() -> usize {
    40 * 1024 * 1024
}

fn default_virus_action() -> VirusAction {
    VirusAction::Reject
}

impl Settings {
    pub fn load(path: &std::path::Path) -> Result<Settings, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_owned(),
            source,
        })?;
        toml::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_owned(),
            source,
        })
    }

    /// Re-reads the aliases file. A SIGHUP only reloads the alias/IP-restriction
    /// tables, never the rest of `Settings`.
    pub fn load_aliases(&self) -> Result<Vec<AliasEntry>, ConfigError> {
        let path = match &self.aliases {
            Some(p) => p,
            None => return Ok(Vec::new()),
        };
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Aliases {
            path: path.clone(),
            source,
        })?;
        Ok(parse_aliases(&raw))
    }

    pub fn load_ip_restrictions(&self) -> Result<Vec<IpRestriction>, ConfigError> {
        let path = match &self.ip_config_file {
            Some(p) => p,
            None => return Ok(Vec::new()),
        };
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::IpConfig {
            path: path.clone(),
            source,
        })?;
        Ok(parse_ip_restrictions(&raw))
    }
}

/// One alias per non-empty, non-comment line: `source: dest1,dest2,...`.
fn parse_aliases(raw: &str) -> Vec<AliasEntry> {
    raw.lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .filter_map(|l| {
            let (source, dests) = l.split_once(':')?;
            let destinations = dests
                .split(',')
                .map(str::trim)
                .filter(|d| !d.is_empty())
                .filter_map(|d| smtp_message::Email::parse_bracketed(d.as_bytes()).ok())
                .map(|e| e.into_owned())
                .collect();
            Some(AliasEntry {
                source: source.trim().to_owned(),
                destinations,
            })
        })
        .collect()
}

/// One restriction per non-empty, non-comment line: `network[ limit]`. A
/// missing limit means the network is blocked outright.
fn parse_ip_restrictions(raw: &str) -> Vec<IpRestriction> {
    raw.lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .filter_map(|l| {
            let mut parts = l.split_whitespace();
            let net = parts.next()?.parse().ok()?;
            let limit = parts.next().and_then(|s| s.parse().ok());
            Some(IpRestriction { net, limit })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_aliases() {
        let raw = "# comment\npostmaster: a@example.org, b@example.org\n\nabuse:c@example.org\n";
        let aliases = parse_aliases(raw);
        assert_eq!(aliases.len(), 2);
        assert_eq!(aliases[0].source, "postmaster");
        assert_eq!(aliases[0].destinations.len(), 2);
    }

    #[test]
    fn parses_ip_restrictions() {
        let raw = "10.0.0.0/8 50\n# blocked\n192.0.2.0/24\n";
        let restrictions = parse_ip_restrictions(raw);
        assert_eq!(restrictions.len(), 2);
        assert_eq!(restrictions[0].limit, Some(50));
        assert_eq!(restrictions[1].limit, None);
    }
}
