use std::{net::SocketAddr, time::Duration};

use ingress_config::Settings;
use smtp_checks::{
    antivirus::AntivirusClient, auth_backend::AuthBackendClient, greylisting::GreylistingClient,
    host_switch::HostSwitch, rbl::RblList, spam_scorer::SpamScorerClient,
};

/// The process-wide singletons the session pipeline fans out to, built once
/// at startup from [`Settings`] and shared via `Arc` across every session.
/// `None` for a check means its corresponding `*_check`/`use_*` flag is off.
pub struct CheckClients {
    pub rbl: Option<RblList>,
    pub greylisting: Option<GreylistingClient>,
    pub so: Option<SpamScorerClient>,
    pub av: Option<AntivirusClient>,
    pub auth_backend: Option<AuthBackendClient>,
    pub rc_hosts: Vec<SocketAddr>,
}

/// Builds a [`HostSwitch`] from an optional primary/secondary pair. A lone
/// primary with no configured secondary is its own fallback: `HostSwitch`
/// always wants two hosts, and retrying the same address after two faults
/// is equivalent to "no failover available", which is the honest behaviour
/// here.
pub(crate) fn host_switch(
    primary: Option<SocketAddr>,
    secondary: Option<SocketAddr>,
) -> Option<HostSwitch<SocketAddr>> {
    let primary = primary?;
    let secondary = secondary.unwrap_or(primary);
    Some(HostSwitch::new(
        primary,
        secondary,
        Duration::from_secs(60),
        Duration::from_secs(10 * 60),
    ))
}

/// Degenerates a single relay address (`Settings::local_relay_host` /
/// `fallback_relay_host`, which carry no secondary) into the same
/// [`HostSwitch`] shape the `so`/`av` checks use, so the `ingress` binary
/// doesn't need its own copy of this fallback-to-self logic.
pub fn relay_host_switch(addr: Option<SocketAddr>) -> Option<HostSwitch<SocketAddr>> {
    host_switch(addr, None)
}

impl CheckClients {
    pub fn from_settings(settings: &Settings) -> CheckClients {
        let rbl = if settings.rbl_check && !settings.rbl_hosts.is_empty() {
            Some(RblList::new(settings.rbl_hosts.clone()))
        } else {
            None
        };

        let rc_hosts: Vec<SocketAddr> = settings
            .rc_host_list
            .iter()
            .filter_map(|h| {
                format!("{}:{}", h, settings.rc_port)
                    .parse()
                    .ok()
                    .or_else(|| h.parse().ok())
            })
            .collect();

        let greylisting = if settings.use_greylisting && !rc_hosts.is_empty() {
            Some(GreylistingClient::new(
                rc_hosts.clone(),
                settings.greylisting_ttl,
                settings.greylisting_window_begin,
                settings.greylisting_window_end,
            ))
        } else {
            None
        };

        let so = if settings.so_check {
            host_switch(settings.so_primary, settings.so_secondary)
                .map(|hosts| SpamScorerClient::new(hosts, settings.so_try, settings.so_data_timeout))
        } else {
            None
        };

        let av = if settings.av_check {
            host_switch(settings.av_primary, settings.av_secondary)
                .map(|hosts| AntivirusClient::new(hosts, settings.av_try, settings.av_data_timeout))
        } else {
            None
        };

        let auth_backend = if settings.use_auth || settings.bb_check {
            host_switch(settings.bb_primary, settings.bb_secondary)
                .map(|hosts| AuthBackendClient::new(hosts, settings.bb_try, settings.bb_timeout))
        } else {
            None
        };

        CheckClients {
            rbl,
            greylisting,
            so,
            av,
            auth_backend,
            rc_hosts,
        }
    }
}
