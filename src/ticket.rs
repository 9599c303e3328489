use crate::astrometry::Equatorial;
use crate::devices::CameraKind;
use crate::satellite::TrackingMode;
use chrono::{DateTime, FixedOffset, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TicketError {
    #[error("failed to read tickets from {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse tickets: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("ticket {name:?} is invalid: {reason}")]
    Invalid { name: String, reason: String },
}

#[derive(Deserialize)]
#[serde(untagged)]
enum OneOrMany<T> {
    One(T),
    Many(Vec<T>),
}

impl<T> From<OneOrMany<T>> for Vec<T> {
    fn from(value: OneOrMany<T>) -> Self {
        match value {
            OneOrMany::One(item) => vec![item],
            OneOrMany::Many(items) => items,
        }
    }
}

/// Accepts either a scalar or a list and normalizes to a list.
fn one_or_many<'de, D, T>(deserializer: D) -> Result<Vec<T>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    OneOrMany::deserialize(deserializer).map(Vec::from)
}

/// One observation request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ticket {
    /// Target name, or the satellite designator for satellite tickets.
    pub name: String,
    /// Right ascension in hours. Unused for satellite tickets.
    #[serde(default)]
    pub ra: Option<f64>,
    #[serde(default)]
    pub dec: Option<f64>,
    pub start_time: DateTime<FixedOffset>,
    pub end_time: DateTime<FixedOffset>,
    #[serde(rename = "filter", deserialize_with = "one_or_many")]
    pub filters: Vec<String>,
    #[serde(rename = "exp_time", deserialize_with = "one_or_many")]
    pub exp_times: Vec<f64>,
    pub num: u32,
    #[serde(default)]
    pub camera: Option<CameraKind>,
    #[serde(default)]
    pub cycle_filter: bool,
    #[serde(default)]
    pub self_guide: bool,
    #[serde(default)]
    pub initial_focus: bool,
    #[serde(default)]
    pub satellite_tracking: bool,
    #[serde(default)]
    pub satellite_tracking_mode: Option<TrackingMode>,
}

/// One exposure in a ticket's plan.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PlannedExposure<'a> {
    pub filter: &'a str,
    pub exp_secs: f64,
}

impl Ticket {
    pub fn start_utc(&self) -> DateTime<Utc> {
        self.start_time.with_timezone(&Utc)
    }

    pub fn end_utc(&self) -> DateTime<Utc> {
        self.end_time.with_timezone(&Utc)
    }

    pub fn target(&self) -> Option<Equatorial> {
        Some(Equatorial::new(self.ra?, self.dec?))
    }

    pub fn tracking_mode(&self) -> Option<TrackingMode> {
        self.satellite_tracking
            .then(|| self.satellite_tracking_mode.unwrap_or(TrackingMode::StationaryLead))
    }

    /// Name used for image files and directories. Satellite tickets carry
    /// their tracking mode.
    pub fn image_prefix(&self) -> String {
        match self.tracking_mode() {
            Some(mode) => format!("{}_Mode{}", self.name, u8::from(mode)),
            None => self.name.clone(),
        }
    }

    /// Exposures in the order they are taken: round-robin over the filters
    /// when cycling, otherwise `num` exposures per filter.
    pub fn planned_exposures(&self) -> Vec<PlannedExposure<'_>> {
        let n_filters = self.filters.len();
        let n_exps = self.exp_times.len();
        if n_filters == 0 || n_exps == 0 {
            return Vec::new();
        }

        if self.cycle_filter {
            (0..self.num as usize)
                .map(|i| PlannedExposure {
                    filter: &self.filters[i % n_filters],
                    exp_secs: self.exp_times[i % n_exps],
                })
                .collect()
        } else {
            self.filters
                .iter()
                .enumerate()
                .flat_map(|(i, filter)| {
                    let exp_secs = self.exp_times[if n_exps == 1 { 0 } else { i % n_exps }];
                    (0..self.num).map(move |_| PlannedExposure {
                        filter: filter.as_str(),
                        exp_secs,
                    })
                })
                .collect()
        }
    }

    pub fn total_exposures(&self) -> u32 {
        if self.cycle_filter {
            self.num
        } else {
            self.num.saturating_mul(self.filters.len() as u32)
        }
    }

    pub fn validate(&self) -> Result<(), TicketError> {
        let invalid = |reason: &str| TicketError::Invalid {
            name: self.name.clone(),
            reason: reason.to_string(),
        };

        if self.name.trim().is_empty() || self.name.contains(['/', '\\']) {
            return Err(invalid("name must be a non-empty file-safe string"));
        }
        if self.end_time <= self.start_time {
            return Err(invalid("end_time must be after start_time"));
        }
        if self.filters.is_empty() {
            return Err(invalid("at least one filter is required"));
        }
        if self.exp_times.is_empty() || self.exp_times.iter().any(|e| !e.is_finite() || *e <= 0.0) {
            return Err(invalid("exposure times must be positive"));
        }
        if !self.cycle_filter && self.exp_times.len() > 1 && self.exp_times.len() != self.filters.len() {
            return Err(invalid("exposure times must match the filters when not cycling"));
        }
        if self.num == 0 {
            return Err(invalid("num must be at least 1"));
        }
        if !self.satellite_tracking && self.target().is_none() {
            return Err(invalid("ra and dec are required for sidereal targets"));
        }
        Ok(())
    }
}

/// Parses a JSON document holding one ticket or a list of tickets.
pub fn parse_tickets(json: &str) -> Result<Vec<Ticket>, TicketError> {
    let tickets: Vec<Ticket> = serde_json::from_str::<OneOrMany<Ticket>>(json)?.into();
    for ticket in &tickets {
        ticket.validate()?;
    }
    Ok(tickets)
}

pub fn load_tickets(path: &Path) -> Result<Vec<Ticket>, TicketError> {
    let json = fs::read_to_string(path).map_err(|source| TicketError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    parse_tickets(&json)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SCALAR: &str = r#"{
        "name": "M31",
        "ra": 0.712,
        "dec": 41.27,
        "start_time": "2024-03-01T20:00:00-05:00",
        "end_time": "2024-03-01T23:00:00-05:00",
        "filter": "r",
        "exp_time": 30,
        "num": 3
    }"#;

    #[test]
    fn test_scalar_fields_normalize_to_lists() {
        let tickets = parse_tickets(SCALAR).unwrap();
        assert_eq!(tickets.len(), 1);
        assert_eq!(tickets[0].filters, vec!["r".to_string()]);
        assert_eq!(tickets[0].exp_times, vec![30.0]);
        assert_eq!(tickets[0].start_utc().to_rfc3339(), "2024-03-02T01:00:00+00:00");
    }

    #[test]
    fn test_cycle_plan_alternates_filters() {
        let mut ticket = parse_tickets(SCALAR).unwrap().remove(0);
        ticket.filters = vec!["b".into(), "v".into()];
        ticket.exp_times = vec![10.0, 20.0];
        ticket.num = 3;
        ticket.cycle_filter = true;
        let plan: Vec<_> = ticket.planned_exposures().iter().map(|p| (p.filter, p.exp_secs)).collect();
        assert_eq!(plan, vec![("b", 10.0), ("v", 20.0), ("b", 10.0)]);
        assert_eq!(ticket.total_exposures(), 3);

        ticket.cycle_filter = false;
        let plan: Vec<_> = ticket.planned_exposures().iter().map(|p| p.filter).collect();
        assert_eq!(plan, vec!["b", "b", "b", "v", "v", "v"]);
        assert_eq!(ticket.total_exposures(), 6);
    }

    #[test]
    fn test_satellite_ticket_needs_no_coordinates() {
        let json = r#"[{
            "name": "ISS",
            "start_time": "2024-03-01T20:00:00+00:00",
            "end_time": "2024-03-01T20:30:00+00:00",
            "filter": ["clr"],
            "exp_time": [1.5],
            "num": 10,
            "satellite_tracking": true,
            "satellite_tracking_mode": 2
        }]"#;
        let ticket = parse_tickets(json).unwrap().remove(0);
        assert_eq!(ticket.tracking_mode(), Some(TrackingMode::ContinuousFollow));
        assert_eq!(ticket.image_prefix(), "ISS_Mode2");
    }

    #[test]
    fn test_rejects_inverted_window() {
        let json = SCALAR.replace("23:00:00", "19:00:00");
        assert!(matches!(parse_tickets(&json), Err(TicketError::Invalid { .. })));
    }
}
