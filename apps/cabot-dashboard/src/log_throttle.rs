use std::{
    collections::HashMap,
    time::{Duration, Instant},
};

use parking_lot::Mutex;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum LogKind {
    UnknownClientPoll,
    UnknownClientReport,
    ObserverSendFailure,
}

impl LogKind {
    fn interval(self) -> Duration {
        match self {
            LogKind::UnknownClientPoll => Duration::from_secs(30),
            LogKind::UnknownClientReport => Duration::from_secs(30),
            LogKind::ObserverSendFailure => Duration::from_secs(10),
        }
    }
}

#[derive(Eq, PartialEq, Hash)]
struct LogKey {
    kind: LogKind,
    key: String,
}

/// Per `(kind, key)` rate limiter for repetitive warnings.
#[derive(Default)]
pub struct LogThrottle {
    last_logged: Mutex<HashMap<LogKey, Instant>>,
}

impl LogThrottle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn should_log(&self, kind: LogKind, key: &str) -> bool {
        self.should_log_at(kind, key, Instant::now())
    }

    fn should_log_at(&self, kind: LogKind, key: &str, now: Instant) -> bool {
        let mut guard = self.last_logged.lock();
        let key = LogKey {
            kind,
            key: key.to_string(),
        };
        if let Some(last) = guard.get(&key) {
            if now.duration_since(*last) < kind.interval() {
                return false;
            }
        }
        guard.insert(key, now);
        true
    }
}
