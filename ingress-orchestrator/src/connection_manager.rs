use std::{
    collections::{HashMap, HashSet},
    net::IpAddr,
    sync::Mutex,
};

use ingress_types::SessionId;

/// Holds the set of live sessions and a per-source-IP counter. Mirrors
/// `smtp-pool::pool::Pool`'s own lock granularity: one short-held
/// `std::sync::Mutex` per table, never held across an `.await`.
pub struct ConnectionManager {
    per_ip: Mutex<HashMap<IpAddr, u32>>,
    sessions: Mutex<HashSet<SessionId>>,
}

/// Why [`ConnectionManager::start`] refused to admit a session.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[allow(dead_code)]
pub enum AdmissionError {
    PerIpLimit,
    TotalLimit,
}

impl AdmissionError {
    /// The `421` reply text this refusal should be reported with, per the
    /// "returns a formatted 421 reply" contract.
    pub fn reply_text(&self) -> &'static str {
        match self {
            AdmissionError::PerIpLimit => {
                "4.7.0 Too many connections from this address, try again later"
            }
            AdmissionError::TotalLimit => "4.3.2 Too many connections, try again later",
        }
    }
}

impl ConnectionManager {
    pub fn new() -> ConnectionManager {
        ConnectionManager {
            per_ip: Mutex::new(HashMap::new()),
            sessions: Mutex::new(HashSet::new()),
        }
    }

    /// Atomically admits `session`, bumping the per-IP counter. Refuses
    /// insertion (and leaves every counter unchanged) when either limit
    /// would be exceeded.
    pub fn start(
        &self,
        session: SessionId,
        ip: IpAddr,
        per_ip_limit: Option<u32>,
        total_limit: Option<u32>,
    ) -> Result<(), AdmissionError> {
        let mut sessions = self.sessions.lock().expect("connection manager poisoned");
        if let Some(total_limit) = total_limit {
            if sessions.len() as u32 >= total_limit {
                return Err(AdmissionError::TotalLimit);
            }
        }

        let mut per_ip = self.per_ip.lock().expect("connection manager poisoned");
        let count = per_ip.entry(ip).or_insert(0);
        if let Some(per_ip_limit) = per_ip_limit {
            if *count >= per_ip_limit {
                return Err(AdmissionError::PerIpLimit);
            }
        }

        *count += 1;
        sessions.insert(session);
        Ok(())
    }

    /// Idempotent: calling `stop` twice for the same session, or for one
    /// that was never admitted, is a no-op.
    pub fn stop(&self, session: SessionId, ip: IpAddr) {
        let mut sessions = self.sessions.lock().expect("connection manager poisoned");
        if !sessions.remove(&session) {
            return;
        }
        let mut per_ip = self.per_ip.lock().expect("connection manager poisoned");
        if let Some(count) = per_ip.get_mut(&ip) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                per_ip.remove(&ip);
            }
        }
    }

    /// Drains every live session for shutdown. Cancellation of the actual
    /// in-flight `interact` futures happens in the `ingress` binary's accept
    /// loop, which holds the join handles this table does not.
    pub fn stop_all(&self) -> Vec<SessionId> {
        let mut sessions = self.sessions.lock().expect("connection manager poisoned");
        self.per_ip
            .lock()
            .expect("connection manager poisoned")
            .clear();
        sessions.drain().collect()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.lock().expect("connection manager poisoned").len()
    }
}

impl Default for ConnectionManager {
    fn default() -> ConnectionManager {
        ConnectionManager::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn admits_up_to_the_per_ip_limit() {
        let mgr = ConnectionManager::new();
        let a = ip("192.0.2.1");
        assert!(mgr.start(SessionId::next(), a, Some(2), None).is_ok());
        assert!(mgr.start(SessionId::next(), a, Some(2), None).is_ok());
        assert_eq!(
            mgr.start(SessionId::next(), a, Some(2), None),
            Err(AdmissionError::PerIpLimit)
        );
    }

    #[test]
    fn stop_is_idempotent_and_frees_the_slot() {
        let mgr = ConnectionManager::new();
        let a = ip("192.0.2.1");
        let s = SessionId::next();
        mgr.start(s, a, Some(1), None).unwrap();
        mgr.stop(s, a);
        mgr.stop(s, a);
        assert!(mgr.start(SessionId::next(), a, Some(1), None).is_ok());
    }

    #[test]
    fn enforces_the_total_limit_across_distinct_ips() {
        let mgr = ConnectionManager::new();
        mgr.start(SessionId::next(), ip("192.0.2.1"), None, Some(1))
            .unwrap();
        assert_eq!(
            mgr.start(SessionId::next(), ip("192.0.2.2"), None, Some(1)),
            Err(AdmissionError::TotalLimit)
        );
    }

    #[test]
    fn stop_all_drains_every_session() {
        let mgr = ConnectionManager::new();
        mgr.start(SessionId::next(), ip("192.0.2.1"), None, None)
            .unwrap();
        mgr.start(SessionId::next(), ip("192.0.2.2"), None, None)
            .unwrap();
        assert_eq!(mgr.stop_all().len(), 2);
        assert_eq!(mgr.session_count(), 0);
    }
}
