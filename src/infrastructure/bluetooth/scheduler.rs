//! Poll Scheduler
//!
//! Issues the poll command to the target characteristic on a fixed
//! interval once the session reaches `Polling`.
//!
//! Timers are declarative: the scheduler (and the scan policy) only
//! describe which timers should be armed via [`TimerSpec`]. The driver
//! turns those into real deadlines and feeds expirations back tagged with
//! the generation they were armed with. Every arm or cancel bumps the
//! generation, so an expiry from a cancelled timer is recognised and
//! dropped.

use crate::domain::models::CharacteristicHandle;
use crate::infrastructure::bluetooth::adapter::BleAdapter;
use std::time::Duration;
use tracing::{debug, trace};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKind {
    Poll,
    ScanWindow,
    ScanPause,
    Reconnect,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerSpec {
    pub kind: TimerKind,
    pub generation: u64,
    pub period: Duration,
    pub repeating: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NotifyState {
    Unknown,
    Pending,
    Confirmed,
}

#[derive(Debug, Clone)]
struct PollJob {
    characteristic: CharacteristicHandle,
    command: Vec<u8>,
    with_response: bool,
    notify: NotifyState,
}

#[derive(Debug)]
pub struct PollScheduler {
    interval: Duration,
    job: Option<PollJob>,
    generation: u64,
}

impl PollScheduler {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            job: None,
            generation: 0,
        }
    }

    /// Arm the recurring poll for `characteristic`
    pub fn start(
        &mut self,
        characteristic: CharacteristicHandle,
        command: Vec<u8>,
        with_response: bool,
        notify_confirmed: bool,
    ) {
        self.generation += 1;
        debug!(
            generation = self.generation,
            interval_ms = self.interval.as_millis() as u64,
            "Poll timer armed"
        );
        self.job = Some(PollJob {
            characteristic,
            command,
            with_response,
            notify: if notify_confirmed {
                NotifyState::Confirmed
            } else {
                NotifyState::Unknown
            },
        });
    }

    /// Disarm; returns whether a poll was armed
    pub fn cancel(&mut self) -> bool {
        self.generation += 1;
        let was_armed = self.job.take().is_some();
        if was_armed {
            debug!(generation = self.generation, "Poll timer cancelled");
        }
        was_armed
    }

    #[cfg(test)]
    pub fn is_armed(&self) -> bool {
        self.job.is_some()
    }

    pub fn timer(&self) -> Option<TimerSpec> {
        self.job.as_ref().map(|_| TimerSpec {
            kind: TimerKind::Poll,
            generation: self.generation,
            period: self.interval,
            repeating: true,
        })
    }

    /// Record a notify ack/error for the polled characteristic
    pub fn notify_updated(&mut self, enabled: bool, ok: bool) {
        if let Some(job) = self.job.as_mut() {
            job.notify = if enabled && ok {
                NotifyState::Confirmed
            } else {
                NotifyState::Unknown
            };
        }
    }

    /// Run one poll; returns whether a write was issued
    pub fn tick(&mut self, generation: u64, adapter: &mut dyn BleAdapter) -> bool {
        if generation != self.generation {
            trace!(generation, current = self.generation, "Stale poll tick");
            return false;
        }
        let Some(job) = self.job.as_mut() else {
            return false;
        };

        if job.notify == NotifyState::Unknown {
            adapter.set_notify(&job.characteristic, true);
            job.notify = NotifyState::Pending;
        }
        trace!(command = ?job.command, "Poll write");
        adapter.write(&job.characteristic, &job.command, job.with_response);
        true
    }
}
