//! OS alarm backend abstraction.
//!
//! The engine talks to the platform's alarm service through [`AlarmBackend`]
//! so scheduling logic stays testable. The in-memory backend mirrors the
//! one platform failure mode the engine must handle: exact alarms being
//! denied by policy.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use thiserror::Error;

/// The platform refused to schedule an exact alarm.
#[derive(Debug, Error)]
#[error("exact alarm scheduling denied by policy")]
pub struct AlarmDenied;

/// Platform alarm service seam.
pub trait AlarmBackend {
    /// Schedule (or move) the alarm identified by `identifier`.
    ///
    /// `exact` asks for a precise wake-up; backends may refuse with
    /// [`AlarmDenied`], in which case the caller retries inexact.
    fn schedule(&mut self, identifier: &str, at: DateTime<Utc>, exact: bool)
        -> Result<(), AlarmDenied>;

    /// Cancel the alarm identified by `identifier`, if pending.
    fn cancel(&mut self, identifier: &str);
}

/// In-memory backend for tests and dry runs.
#[derive(Debug, Default)]
pub struct MemoryAlarms {
    pending: BTreeMap<String, (DateTime<Utc>, bool)>,
    deny_exact: bool,
}

impl MemoryAlarms {
    pub fn new() -> Self {
        Self::default()
    }

    /// Backend that refuses exact alarms, like a device with the exact-alarm
    /// permission revoked.
    pub fn denying_exact() -> Self {
        Self {
            pending: BTreeMap::new(),
            deny_exact: true,
        }
    }

    pub fn pending(&self) -> impl Iterator<Item = (&str, DateTime<Utc>, bool)> {
        self.pending
            .iter()
            .map(|(id, (at, exact))| (id.as_str(), *at, *exact))
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn get(&self, identifier: &str) -> Option<(DateTime<Utc>, bool)> {
        self.pending.get(identifier).copied()
    }
}

impl AlarmBackend for MemoryAlarms {
    fn schedule(
        &mut self,
        identifier: &str,
        at: DateTime<Utc>,
        exact: bool,
    ) -> Result<(), AlarmDenied> {
        if exact && self.deny_exact {
            return Err(AlarmDenied);
        }
        self.pending.insert(identifier.to_string(), (at, exact));
        Ok(())
    }

    fn cancel(&mut self, identifier: &str) {
        self.pending.remove(identifier);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn schedule_replaces_by_identifier() {
        let mut alarms = MemoryAlarms::new();
        let t1 = Utc.with_ymd_and_hms(2026, 3, 2, 19, 0, 0).unwrap();
        let t2 = Utc.with_ymd_and_hms(2026, 3, 3, 19, 0, 0).unwrap();
        alarms.schedule("periodic:7", t1, true).unwrap();
        alarms.schedule("periodic:7", t2, true).unwrap();
        assert_eq!(alarms.pending_count(), 1);
        assert_eq!(alarms.get("periodic:7"), Some((t2, true)));
    }

    #[test]
    fn denying_backend_still_accepts_inexact() {
        let mut alarms = MemoryAlarms::denying_exact();
        let at = Utc.with_ymd_and_hms(2026, 3, 2, 19, 0, 0).unwrap();
        assert!(alarms.schedule("periodic:7", at, true).is_err());
        alarms.schedule("periodic:7", at, false).unwrap();
        assert_eq!(alarms.get("periodic:7"), Some((at, false)));
    }

    #[test]
    fn cancel_removes_pending_alarm() {
        let mut alarms = MemoryAlarms::new();
        let at = Utc.with_ymd_and_hms(2026, 3, 2, 19, 0, 0).unwrap();
        alarms.schedule("periodic:7", at, true).unwrap();
        alarms.cancel("periodic:7");
        assert_eq!(alarms.pending_count(), 0);
    }
}
