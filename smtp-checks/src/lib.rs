pub mod antivirus;
pub mod auth_backend;
pub mod dkim;
pub mod dns;
pub mod greylisting;
pub mod host_switch;
pub mod rate_control;
pub mod rbl;
pub mod spam_scorer;
pub mod spf;

pub use host_switch::HostSwitch;
pub use rate_control::{Command, RcClient, RcError, Request, Response};
