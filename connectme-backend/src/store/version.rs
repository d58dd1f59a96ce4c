use chrono::{DateTime, SecondsFormat, Utc};
use connectme_types::VersionInfo;
use parking_lot::RwLock;

fn format_modified(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Dataset version marker. Advances on every applied mutation; the value is
/// the mutation time in epoch milliseconds, bumped when two mutations land in
/// the same millisecond so it never repeats.
pub struct VersionPublisher {
    current: RwLock<VersionInfo>,
}

impl VersionPublisher {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            current: RwLock::new(VersionInfo {
                version: now.timestamp_millis(),
                last_modified: format_modified(now),
            }),
        }
    }

    pub fn current(&self) -> VersionInfo {
        self.current.read().clone()
    }

    pub fn advance(&self, now: DateTime<Utc>) -> VersionInfo {
        let mut current = self.current.write();
        current.version = now.timestamp_millis().max(current.version + 1);
        current.last_modified = format_modified(now);
        current.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_advance_is_strictly_monotonic() {
        let at = Utc.with_ymd_and_hms(2025, 1, 1, 12, 0, 0).unwrap();
        let publisher = VersionPublisher::new(at);
        let first = publisher.current();
        assert_eq!(first.last_modified, "2025-01-01T12:00:00.000Z");

        let second = publisher.advance(at);
        let third = publisher.advance(at);
        assert!(second.version > first.version);
        assert!(third.version > second.version);
        assert!(third.is_stale(&first));
    }

    #[test]
    fn test_clock_going_backwards_still_advances() {
        let at = Utc.with_ymd_and_hms(2025, 1, 1, 12, 0, 0).unwrap();
        let publisher = VersionPublisher::new(at);
        let earlier = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let next = publisher.advance(earlier);
        assert_eq!(next.version, at.timestamp_millis() + 1);
    }
}
