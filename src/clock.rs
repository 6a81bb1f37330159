use chrono::{DateTime, Duration, Utc};

pub type AbsoluteTimestamp = DateTime<Utc>;

/// Wall-clock access for decision deadlines. Everything that reasons about
/// expiry takes an explicit `now` so sweeps can be replayed at any instant.
pub struct ClockManager;

impl ClockManager {
    pub fn utc_now() -> AbsoluteTimestamp {
        Utc::now()
    }

    /// Fractional hours as a chrono duration (millisecond precision).
    pub fn hours(hours: f64) -> Duration {
        Duration::milliseconds((hours * 3_600_000.0).round() as i64)
    }
}
