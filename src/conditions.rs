use chrono::{DateTime, Utc};

/// Weather and sky-brightness provider.
pub trait Conditions: Send + Sync {
    /// True while the weather station reports conditions unsafe for opening.
    fn weather_alert(&self) -> bool;
    fn is_daytime(&self, at: DateTime<Utc>) -> bool;
    /// The first sunset strictly after `after`.
    fn next_sunset(&self, after: DateTime<Utc>) -> DateTime<Utc>;
}
