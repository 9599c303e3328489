//! Fault injection for the simulated drivers.
//!
//! Faults are either scripted (the next N operations of a device fail in a
//! given way) or drawn from a per-operation failure rate using a fixed-seed
//! generator, so every run is reproducible.

use crate::devices::DeviceKind;
use heapless::Vec;
use serde::{Deserialize, Serialize};

const MAX_SCRIPTED_FAULTS: usize = 16;

const DEFAULT_SEED: u64 = 0x1234_5678_9ABC_DEF0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operation {
    Connect,
    Command,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FaultKind {
    /// The connection handshake fails.
    ConnectFailure,
    /// A command reports an error.
    CommandFailure,
    /// The driver panics mid-command, taking its actor down.
    Panic,
}

impl FaultKind {
    fn applies_to(self, operation: Operation) -> bool {
        match self {
            FaultKind::ConnectFailure => operation == Operation::Connect,
            FaultKind::CommandFailure | FaultKind::Panic => operation == Operation::Command,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScriptedFault {
    pub kind: DeviceKind,
    pub fault: FaultKind,
    pub remaining: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FaultInjectionStats {
    pub total_faults_injected: u32,
    pub connect_failures: u32,
    pub command_failures: u32,
    pub panics: u32,
    pub manual_cleared_faults: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FaultInjectionConfig {
    pub enabled: bool,
    /// Chance, in percent, that any command fails on its own.
    pub command_failure_percent: f32,
    pub seed: u64,
}

impl Default for FaultInjectionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            command_failure_percent: 0.0,
            seed: DEFAULT_SEED,
        }
    }
}

#[derive(Debug)]
pub struct FaultInjector {
    config: FaultInjectionConfig,
    scripted: Vec<ScriptedFault, MAX_SCRIPTED_FAULTS>,
    stats: FaultInjectionStats,
    rng_state: u64,
}

impl FaultInjector {
    pub fn new() -> Self {
        Self::with_config(FaultInjectionConfig::default())
    }

    pub fn with_config(config: FaultInjectionConfig) -> Self {
        Self {
            rng_state: config.seed,
            config,
            scripted: Vec::new(),
            stats: FaultInjectionStats::default(),
        }
    }

    /// Makes the next `count` matching operations on `kind` fail. Returns
    /// false if the script is full.
    pub fn script(&mut self, kind: DeviceKind, fault: FaultKind, count: u32) -> bool {
        if count == 0 {
            return true;
        }
        self.scripted
            .push(ScriptedFault {
                kind,
                fault,
                remaining: count,
            })
            .is_ok()
    }

    /// Decides whether this operation fails, and how.
    pub fn check(&mut self, kind: DeviceKind, operation: Operation) -> Option<FaultKind> {
        if !self.config.enabled {
            return None;
        }

        let scripted = self
            .scripted
            .iter()
            .position(|s| s.kind == kind && s.fault.applies_to(operation));
        let fault = if let Some(index) = scripted {
            let entry = &mut self.scripted[index];
            entry.remaining -= 1;
            let fault = entry.fault;
            if entry.remaining == 0 {
                self.scripted.swap_remove(index);
            }
            Some(fault)
        } else if operation == Operation::Command && self.should_fail(self.config.command_failure_percent) {
            Some(FaultKind::CommandFailure)
        } else {
            None
        };

        if let Some(fault) = fault {
            self.update_stats(fault);
        }
        fault
    }

    /// Drops scripted faults for one device, or for all of them.
    pub fn clear(&mut self, kind: Option<DeviceKind>) {
        let before = self.scripted.len();
        match kind {
            Some(kind) => self.scripted.retain(|s| s.kind != kind),
            None => self.scripted.clear(),
        }
        self.stats.manual_cleared_faults += (before - self.scripted.len()) as u32;
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        self.config.enabled = enabled;
    }

    pub fn stats(&self) -> &FaultInjectionStats {
        &self.stats
    }

    pub fn pending(&self) -> &[ScriptedFault] {
        &self.scripted
    }

    fn update_stats(&mut self, fault: FaultKind) {
        self.stats.total_faults_injected += 1;
        match fault {
            FaultKind::ConnectFailure => self.stats.connect_failures += 1,
            FaultKind::CommandFailure => self.stats.command_failures += 1,
            FaultKind::Panic => self.stats.panics += 1,
        }
    }

    fn should_fail(&mut self, rate_percent: f32) -> bool {
        rate_percent > 0.0 && self.random_float() < rate_percent / 100.0
    }

    // Linear congruential generator, Numerical Recipes parameters.
    fn next_random(&mut self) -> u64 {
        self.rng_state = self
            .rng_state
            .wrapping_mul(1_664_525)
            .wrapping_add(1_013_904_223);
        self.rng_state
    }

    fn random_float(&mut self) -> f32 {
        (self.next_random() as f32) / (u64::MAX as f32)
    }
}

impl Default for FaultInjector {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scripted_fault_is_consumed() {
        let mut injector = FaultInjector::new();
        assert!(injector.script(DeviceKind::Camera, FaultKind::CommandFailure, 2));
        assert_eq!(injector.check(DeviceKind::Camera, Operation::Connect), None);
        assert_eq!(
            injector.check(DeviceKind::Camera, Operation::Command),
            Some(FaultKind::CommandFailure)
        );
        assert_eq!(
            injector.check(DeviceKind::Camera, Operation::Command),
            Some(FaultKind::CommandFailure)
        );
        assert_eq!(injector.check(DeviceKind::Camera, Operation::Command), None);
        assert_eq!(injector.stats().command_failures, 2);
    }

    #[test]
    fn test_faults_are_per_device() {
        let mut injector = FaultInjector::new();
        injector.script(DeviceKind::Focuser, FaultKind::ConnectFailure, 1);
        assert_eq!(injector.check(DeviceKind::Dome, Operation::Connect), None);
        assert_eq!(
            injector.check(DeviceKind::Focuser, Operation::Connect),
            Some(FaultKind::ConnectFailure)
        );
    }

    #[test]
    fn test_disabled_injector_never_fails() {
        let mut injector = FaultInjector::with_config(FaultInjectionConfig {
            command_failure_percent: 100.0,
            ..FaultInjectionConfig::default()
        });
        injector.script(DeviceKind::Camera, FaultKind::Panic, 1);
        injector.set_enabled(false);
        assert_eq!(injector.check(DeviceKind::Camera, Operation::Command), None);
    }

    #[test]
    fn test_random_failures_follow_rate() {
        let mut injector = FaultInjector::with_config(FaultInjectionConfig {
            command_failure_percent: 50.0,
            ..FaultInjectionConfig::default()
        });
        let failures = (0..1000)
            .filter(|_| injector.check(DeviceKind::Telescope, Operation::Command).is_some())
            .count();
        assert!(failures > 300 && failures < 700, "failures = {failures}");
    }

    #[test]
    fn test_clear_counts_removed_scripts() {
        let mut injector = FaultInjector::new();
        injector.script(DeviceKind::Camera, FaultKind::Panic, 1);
        injector.script(DeviceKind::Dome, FaultKind::CommandFailure, 1);
        injector.clear(Some(DeviceKind::Camera));
        assert_eq!(injector.pending().len(), 1);
        injector.clear(None);
        assert!(injector.pending().is_empty());
        assert_eq!(injector.stats().manual_cleared_faults, 2);
    }
}
