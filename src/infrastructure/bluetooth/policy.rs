//! Scan/Connect Policy
//!
//! Decides which advertisement becomes the target, when scanning is
//! paused and resumed, and when a dropped session goes back to scanning.

use crate::domain::models::DiscoveredPeripheral;
use crate::infrastructure::bluetooth::scheduler::{TimerKind, TimerSpec};
use std::time::Duration;
use tracing::{debug, info};

/// Alternate between scanning for `window` and idling for `pause`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanDutyCycle {
    pub window: Duration,
    pub pause: Duration,
}

/// What the caller should do with the radio after a scan timer fires
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanAction {
    Pause,
    Resume,
}

#[derive(Debug)]
pub struct ScanPolicy {
    target_name: String,
    keep_scanning: bool,
    duty_cycle: Option<ScanDutyCycle>,
    auto_reconnect: bool,
    reconnect_delay: Duration,
    scan_timer: Option<TimerSpec>,
    reconnect_timer: Option<TimerSpec>,
    generation: u64,
}

impl ScanPolicy {
    pub fn new(
        target_name: String,
        duty_cycle: Option<ScanDutyCycle>,
        auto_reconnect: bool,
        reconnect_delay: Duration,
    ) -> Self {
        Self {
            target_name,
            keep_scanning: false,
            duty_cycle,
            auto_reconnect,
            reconnect_delay,
            scan_timer: None,
            reconnect_timer: None,
            generation: 0,
        }
    }

    pub fn keep_scanning(&self) -> bool {
        self.keep_scanning
    }

    /// Exact match on the advertised local name
    pub fn matches(&self, peripheral: &DiscoveredPeripheral) -> bool {
        peripheral.advertised_name.as_deref() == Some(self.target_name.as_str())
    }

    /// Scanning (re)started
    pub fn begin_scanning(&mut self) {
        self.keep_scanning = true;
        self.reconnect_timer = None;
        self.scan_timer = match self.duty_cycle {
            Some(cycle) => Some(self.arm(TimerKind::ScanWindow, cycle.window)),
            None => None,
        };
    }

    /// First match wins; further advertisements are ignored until scanning
    /// begins again.
    pub fn select(&mut self, peripheral: &DiscoveredPeripheral) -> bool {
        if !self.keep_scanning || !self.matches(peripheral) {
            return false;
        }
        info!(
            peripheral = %peripheral.id,
            rssi = ?peripheral.rssi,
            "Found {}, connecting", self.target_name
        );
        self.keep_scanning = false;
        self.scan_timer = None;
        true
    }

    pub fn on_scan_timer(&mut self, kind: TimerKind, generation: u64) -> Option<ScanAction> {
        let armed = self.scan_timer?;
        if armed.kind != kind || armed.generation != generation {
            return None;
        }
        let cycle = self.duty_cycle?;

        match kind {
            TimerKind::ScanWindow => {
                debug!("Pausing scan");
                self.scan_timer = Some(self.arm(TimerKind::ScanPause, cycle.pause));
                Some(ScanAction::Pause)
            }
            TimerKind::ScanPause if self.keep_scanning => {
                debug!("Resuming scan");
                self.scan_timer = Some(self.arm(TimerKind::ScanWindow, cycle.window));
                Some(ScanAction::Resume)
            }
            _ => {
                self.scan_timer = None;
                None
            }
        }
    }

    /// Session dropped; arm the reconnect timer if the adapter can scan
    pub fn enter_disconnected(&mut self, adapter_ready: bool) {
        self.scan_timer = None;
        self.keep_scanning = self.auto_reconnect;
        self.reconnect_timer = if self.keep_scanning && adapter_ready {
            Some(self.arm(TimerKind::Reconnect, self.reconnect_delay))
        } else {
            None
        };
    }

    /// Consume an expired reconnect timer; true if it is still current
    pub fn take_reconnect(&mut self, generation: u64) -> bool {
        match self.reconnect_timer {
            Some(armed) if armed.generation == generation => {
                self.reconnect_timer = None;
                true
            }
            _ => false,
        }
    }

    /// Explicit stop: no further scanning until restarted
    pub fn halt(&mut self) {
        self.keep_scanning = false;
        self.reset_timers();
    }

    pub fn reset_timers(&mut self) {
        self.generation += 1;
        self.scan_timer = None;
        self.reconnect_timer = None;
    }

    pub fn timers(&self) -> impl Iterator<Item = TimerSpec> + '_ {
        self.scan_timer.into_iter().chain(self.reconnect_timer)
    }

    fn arm(&mut self, kind: TimerKind, period: Duration) -> TimerSpec {
        self.generation += 1;
        TimerSpec {
            kind,
            generation: self.generation,
            period,
            repeating: false,
        }
    }
}
