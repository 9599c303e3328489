use crate::devices::{FocusRequest, SlewStatus};
use crate::restarts::RestartRecord;
use crate::safety::{SafetyEvent, SafetyEventRecord, SafetyLevel, SafetyLog};
use crate::satellite::SatelliteEphemeris;
use crate::signal::ShutdownHandle;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Why the scheduler stopped working through the plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunEnding {
    Completed,
    /// Weather cleared too late, or never, to use the remaining window.
    WeatherWindowClosed,
    ShutdownRequested,
    /// Startup or pre-flight failed, or a critical shutdown ran.
    Aborted,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TicketReport {
    pub name: String,
    pub taken: u32,
    pub total: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub tickets: Vec<TicketReport>,
    pub restarts: RestartRecord,
    pub critical_shutdowns: u32,
    pub safety_events: Vec<SafetyEventRecord>,
    pub ending: RunEnding,
}

impl RunReport {
    pub fn ticket(&self, name: &str) -> Option<&TicketReport> {
        self.tickets.iter().find(|t| t.name == name)
    }
}

/// Mutable run bookkeeping. Only the scheduler thread writes to it.
pub struct RunState {
    pub(super) current_ticket: Option<usize>,
    pub(super) calibrated: Vec<bool>,
    pub(super) shutdown: ShutdownHandle,
    pub(super) focus_enabled: bool,
    pub(super) continuous_focus: bool,
    pub(super) focused: bool,
    pub(super) focus_request: Option<FocusRequest>,
    pub(super) guiding: bool,
    pub(super) last_slew: Option<SlewStatus>,
    pub(super) satellite: Option<Arc<dyn SatelliteEphemeris>>,
    pub(super) restarts: RestartRecord,
    pub(super) safety: SafetyLog,
    pub(super) critical_shutdowns: u32,
    pub(super) tickets: Vec<TicketReport>,
    pub(super) ending: Option<RunEnding>,
    pub(super) threads_stopped: bool,
}

impl RunState {
    pub(super) fn new(ticket_count: usize, focus: bool, shutdown: ShutdownHandle) -> Self {
        Self {
            current_ticket: None,
            calibrated: vec![false; ticket_count],
            shutdown,
            focus_enabled: focus,
            continuous_focus: focus,
            focused: false,
            focus_request: None,
            guiding: false,
            last_slew: None,
            satellite: None,
            restarts: RestartRecord::new(),
            safety: SafetyLog::new(),
            critical_shutdowns: 0,
            tickets: Vec::new(),
            ending: None,
            threads_stopped: false,
        }
    }

    /// Records why the run ended. The first reason wins.
    pub(super) fn end(&mut self, ending: RunEnding) {
        self.ending.get_or_insert(ending);
    }

    pub(super) fn record(&mut self, event: SafetyEvent, level: SafetyLevel, at: DateTime<Utc>) {
        self.safety.record(event, level, at);
    }

    pub fn current_ticket(&self) -> Option<usize> {
        self.current_ticket
    }

    pub fn is_calibrated(&self, index: usize) -> bool {
        self.calibrated.get(index).copied().unwrap_or(false)
    }

    pub fn focus_enabled(&self) -> bool {
        self.focus_enabled
    }

    pub fn continuous_focus(&self) -> bool {
        self.continuous_focus
    }

    pub fn last_slew(&self) -> Option<SlewStatus> {
        self.last_slew
    }

    pub fn restarts(&self) -> &RestartRecord {
        &self.restarts
    }

    pub fn safety_log(&self) -> &SafetyLog {
        &self.safety
    }

    pub fn report(&self) -> RunReport {
        RunReport {
            tickets: self.tickets.clone(),
            restarts: self.restarts.clone(),
            critical_shutdowns: self.critical_shutdowns,
            safety_events: self.safety.events().to_vec(),
            ending: self.ending.unwrap_or(RunEnding::Completed),
        }
    }
}
