//! Primary/secondary endpoint failover shared by `spam_scorer`, `antivirus`
//! and `smtp-client`'s downstream relay dialing. Grounded on NwSMTP's
//! `host_seq_resolver.h`.

use std::{
    sync::Mutex,
    time::{Duration, Instant},
};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Active {
    Primary,
    Secondary,
}

struct State {
    active: Active,
    /// Pending deadline: while primary is active, the moment a lone fault
    /// is forgotten; while secondary is active, the moment we revert.
    switch_time: Option<Instant>,
}

/// Wraps a primary and a secondary endpoint of type `T`. `get_primary()`
/// returns the currently-active endpoint and advances the state machine;
/// `fault()` reports a failure of the currently-active endpoint. The switch
/// never promotes the secondary unless `fault()` is called twice with the
/// first call more than `fallback` earlier than the second. The value
/// returned from one `get_primary()` call is the value callers of that
/// request should keep using even if `fault()` races in from another task.
pub struct HostSwitch<T> {
    primary: T,
    secondary: T,
    fallback: Duration,
    return_after: Duration,
    state: Mutex<State>,
}

impl<T: Clone> HostSwitch<T> {
    pub fn new(primary: T, secondary: T, fallback: Duration, return_after: Duration) -> HostSwitch<T> {
        HostSwitch {
            primary,
            secondary,
            fallback,
            return_after,
            state: Mutex::new(State {
                active: Active::Primary,
                switch_time: None,
            }),
        }
    }

    pub fn get_primary(&self) -> T {
        let now = Instant::now();
        let mut state = self.state.lock().unwrap();
        match state.active {
            Active::Secondary => {
                if let Some(switch_time) = state.switch_time {
                    if now > switch_time {
                        state.active = Active::Primary;
                        state.switch_time = None;
                    }
                }
            }
            Active::Primary => {
                if let Some(switch_time) = state.switch_time {
                    if now > switch_time {
                        state.switch_time = None;
                    }
                }
            }
        }
        match state.active {
            Active::Primary => self.primary.clone(),
            Active::Secondary => self.secondary.clone(),
        }
    }

    pub fn fault(&self) {
        let now = Instant::now();
        let mut state = self.state.lock().unwrap();
        match state.active {
            Active::Primary => match state.switch_time {
                None => state.switch_time = Some(now + self.fallback),
                Some(switch_time) if now <= switch_time => {
                    state.active = Active::Secondary;
                    state.switch_time = Some(now + self.return_after);
                }
                Some(_) => state.switch_time = Some(now + self.fallback),
            },
            Active::Secondary => {
                state.switch_time = Some(now + self.return_after);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread::sleep;

    #[test]
    fn single_fault_is_forgotten_after_fallback() {
        let hs = HostSwitch::new("a", "b", Duration::from_millis(10), Duration::from_secs(60));
        hs.fault();
        sleep(Duration::from_millis(20));
        assert_eq!(hs.get_primary(), "a");
    }

    #[test]
    fn second_fault_before_fallback_promotes_secondary() {
        let hs = HostSwitch::new("a", "b", Duration::from_secs(60), Duration::from_millis(10));
        hs.fault();
        hs.fault();
        assert_eq!(hs.get_primary(), "b");
        sleep(Duration::from_millis(20));
        assert_eq!(hs.get_primary(), "a");
    }
}
