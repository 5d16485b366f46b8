// src/ingest/log_gate.rs
use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};

/// Cooldown gate for repeated warnings. A message for a key passes when it is the
/// first, when the cooldown since the last pass has expired, or when the text changed.
#[derive(Debug)]
pub struct WarnGate {
    cooldown: Duration,
    last: Mutex<HashMap<String, (DateTime<Utc>, String)>>,
}

impl WarnGate {
    pub fn new(cooldown_secs: i64) -> Self {
        Self {
            cooldown: Duration::seconds(cooldown_secs),
            last: Mutex::new(HashMap::new()),
        }
    }

    /// Returns true if the warning should be emitted, and records it if so.
    pub fn should_warn(&self, key: &str, msg: &str, now: DateTime<Utc>) -> bool {
        let mut g = self.last.lock().expect("warn gate mutex poisoned");
        let pass = match g.get(key) {
            None => true,
            Some((at, last_msg)) => now - *at >= self.cooldown || last_msg != msg,
        };
        if pass {
            g.insert(key.to_string(), (now, msg.to_string()));
        }
        pass
    }
}

impl Default for WarnGate {
    fn default() -> Self {
        Self::new(60)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_message_suppressed_within_window() {
        let gate = WarnGate::new(60);
        let t0 = Utc::now();
        assert!(gate.should_warn("bw", "boom", t0));
        assert!(!gate.should_warn("bw", "boom", t0 + Duration::seconds(30)));

        // Different message or different key passes.
        assert!(gate.should_warn("bw", "other", t0 + Duration::seconds(31)));
        assert!(gate.should_warn("prn", "boom", t0 + Duration::seconds(31)));

        // After the window the first message passes again.
        assert!(gate.should_warn("bw", "other", t0 + Duration::seconds(92)));
    }
}
