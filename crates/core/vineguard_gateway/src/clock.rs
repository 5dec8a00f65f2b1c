use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

/// The gateway wall clock.
///
/// A trait so that enrichment and health snapshots can be exercised with a
/// pinned instant: the serialised `receivedAt` is part of the wire contract
/// and must be reproducible in tests.
pub trait Clock: Send + Sync {
    fn now(&self) -> OffsetDateTime;
}

#[derive(Clone, Copy, Debug)]
pub struct WallClock;

impl Clock for WallClock {
    fn now(&self) -> OffsetDateTime {
        OffsetDateTime::now_utc()
    }
}

/// RFC 3339 rendering with the `Z` suffix for UTC, as published upstream.
pub fn to_rfc3339(timestamp: OffsetDateTime) -> String {
    timestamp
        .format(&Rfc3339)
        .unwrap_or_else(|_| timestamp.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn renders_utc_with_z_suffix() {
        let instant = datetime!(2024-01-01 00:00:00 UTC);
        assert_eq!(to_rfc3339(instant), "2024-01-01T00:00:00Z");
    }

    #[test]
    fn subseconds_are_kept_when_present() {
        let instant = datetime!(2024-06-15 10:30:00.25 UTC);
        assert_eq!(to_rfc3339(instant), "2024-06-15T10:30:00.25Z");
    }
}
