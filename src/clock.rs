use chrono::{DateTime, Utc};
use std::thread;
use std::time::Duration;

/// Wall-clock source. The scheduler never reads the system time directly,
/// so runs can be replayed on virtual time.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
    fn sleep(&self, duration: Duration);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn sleep(&self, duration: Duration) {
        thread::sleep(duration);
    }
}

/// Converts a possibly negative chrono duration into a std duration.
pub fn until(from: DateTime<Utc>, to: DateTime<Utc>) -> Duration {
    (to - from).to_std().unwrap_or(Duration::ZERO)
}

/// Longest single wait the scheduler will ever ask for.
const MAX_WAIT_SECS: f64 = 7.0 * 86_400.0;

/// Float seconds to a duration, clamping negative, NaN and unbounded values.
pub fn seconds(secs: f64) -> Duration {
    if secs.is_nan() || secs <= 0.0 {
        Duration::ZERO
    } else {
        Duration::from_secs_f64(secs.min(MAX_WAIT_SECS))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_seconds_clamps() {
        assert_eq!(seconds(-1.0), Duration::ZERO);
        assert_eq!(seconds(f64::NAN), Duration::ZERO);
        assert_eq!(seconds(f64::INFINITY), Duration::from_secs(7 * 86_400));
        assert_eq!(seconds(1.5), Duration::from_millis(1500));
    }

    #[test]
    fn test_until_saturates_in_the_past() {
        let a = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let b = Utc.with_ymd_and_hms(2024, 1, 1, 0, 1, 0).unwrap();
        assert_eq!(until(a, b), Duration::from_secs(60));
        assert_eq!(until(b, a), Duration::ZERO);
    }
}
