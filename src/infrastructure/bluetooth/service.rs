//! Bluetooth Service Module
//!
//! Drives a [`Session`] on a single task: adapter events, control commands
//! and timer expiries are pulled one at a time, so the session never sees
//! two callbacks concurrently. Timers are re-synced from
//! [`Session::timers`] after every step.

use crate::domain::error::{ConfigError, ErrorKind};
use crate::domain::models::{AppEvent, MessageSeverity, MetricSample, SessionState, StatusMessage};
use crate::domain::settings::Settings;
use crate::infrastructure::bluetooth::adapter::{AdapterEvent, BleAdapter};
use crate::infrastructure::bluetooth::scheduler::{TimerKind, TimerSpec};
use crate::infrastructure::bluetooth::session::{Session, SessionConfig, SessionObserver};
use std::collections::HashMap;
use tokio::sync::mpsc;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, error, info, trace, warn};

/// Control requests accepted by a running [`BluetoothService`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceCommand {
    Start,
    Stop,
    CancelConnect,
    Shutdown,
}

/// Cloneable handle for steering the service from other tasks
#[derive(Debug, Clone)]
pub struct SessionHandle {
    commands: mpsc::UnboundedSender<ServiceCommand>,
}

impl SessionHandle {
    pub fn start(&self) -> bool {
        self.send(ServiceCommand::Start)
    }

    pub fn stop(&self) -> bool {
        self.send(ServiceCommand::Stop)
    }

    pub fn cancel_connect(&self) -> bool {
        self.send(ServiceCommand::CancelConnect)
    }

    pub fn shutdown(&self) -> bool {
        self.send(ServiceCommand::Shutdown)
    }

    /// Returns false once the service has exited
    fn send(&self, command: ServiceCommand) -> bool {
        self.commands.send(command).is_ok()
    }
}

/// Forwards session output to the application event channel
pub struct ChannelObserver {
    event_sender: mpsc::UnboundedSender<AppEvent>,
}

impl ChannelObserver {
    pub fn new(event_sender: mpsc::UnboundedSender<AppEvent>) -> Self {
        Self { event_sender }
    }

    fn send(&self, event: AppEvent) {
        // Receiver gone means the app is shutting down.
        let _ = self.event_sender.send(event);
    }
}

impl SessionObserver for ChannelObserver {
    fn on_metric_sample(&mut self, sample: MetricSample) {
        self.send(AppEvent::MetricSample(sample));
    }

    fn on_session_state_changed(&mut self, state: SessionState) {
        self.send(AppEvent::SessionState(state));
    }

    fn on_fatal_error(&mut self, error: ErrorKind) {
        self.send(AppEvent::LogMessage(StatusMessage::from_error(&error)));
    }

    fn on_recoverable_error(&mut self, error: ErrorKind) {
        self.send(AppEvent::LogMessage(StatusMessage {
            message: error.to_string(),
            severity: MessageSeverity::Warning,
        }));
    }
}

#[derive(Debug, Clone, Copy)]
struct ArmedTimer {
    spec: TimerSpec,
    /// None once a one-shot timer has fired
    deadline: Option<Instant>,
}

/// Main service: owns the session, its adapter and its observer
pub struct BluetoothService<A: BleAdapter, O: SessionObserver> {
    session: Session,
    adapter: A,
    observer: O,
    events: mpsc::UnboundedReceiver<AdapterEvent>,
    commands: mpsc::UnboundedReceiver<ServiceCommand>,
    commands_open: bool,
    timers: HashMap<TimerKind, ArmedTimer>,
}

impl<A: BleAdapter, O: SessionObserver> BluetoothService<A, O> {
    /// Validate `settings` and build the service
    ///
    /// `events` must be the receiving end of the queue `adapter` reports
    /// into. A configuration error is reported to `observer` as fatal
    /// before being returned.
    pub fn new(
        settings: &Settings,
        adapter: A,
        events: mpsc::UnboundedReceiver<AdapterEvent>,
        mut observer: O,
    ) -> Result<(Self, SessionHandle), ConfigError> {
        let config = match SessionConfig::from_settings(settings) {
            Ok(config) => config,
            Err(e) => {
                error!("Invalid configuration: {}", e);
                observer.on_fatal_error(ErrorKind::Config(e.clone()));
                return Err(e);
            }
        };
        info!(
            target_name = %config.target_name,
            service = %config.service_uuid,
            characteristic = %config.characteristic_uuid,
            "Session configured"
        );

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let service = Self {
            session: Session::new(config),
            adapter,
            observer,
            events,
            commands: command_rx,
            commands_open: true,
            timers: HashMap::new(),
        };
        Ok((
            service,
            SessionHandle {
                commands: command_tx,
            },
        ))
    }

    #[cfg(test)]
    pub fn session(&self) -> &Session {
        &self.session
    }

    #[cfg(test)]
    pub fn observer(&self) -> &O {
        &self.observer
    }

    /// Run until shut down or the adapter event queue closes
    pub async fn run(mut self) {
        info!("Bluetooth service running");
        while self.step().await {}
        info!("Bluetooth service stopped");
    }

    /// Process exactly one command, adapter event or timer expiry
    ///
    /// Returns false when the service should exit.
    pub async fn step(&mut self) -> bool {
        let next_deadline = self.next_deadline();
        // Placeholder only; the branch is disabled without a deadline.
        let deadline = next_deadline.unwrap_or_else(Instant::now);

        let keep_running = tokio::select! {
            biased;

            command = self.commands.recv(), if self.commands_open => match command {
                Some(command) => self.apply_command(command),
                None => {
                    debug!("All session handles dropped");
                    self.commands_open = false;
                    true
                }
            },
            event = self.events.recv() => match event {
                Some(event) => {
                    trace!(peripheral = ?event.peripheral(), "Adapter event");
                    self.session
                        .handle_event(event, &mut self.adapter, &mut self.observer);
                    true
                }
                None => {
                    warn!("Adapter event queue closed");
                    false
                }
            },
            _ = sleep_until(deadline), if next_deadline.is_some() => {
                self.fire_due_timers();
                true
            }
        };

        self.sync_timers();
        keep_running
    }

    fn apply_command(&mut self, command: ServiceCommand) -> bool {
        debug!(?command, "Service command");
        match command {
            ServiceCommand::Start => self.session.start(&mut self.adapter, &mut self.observer),
            ServiceCommand::Stop => self.session.stop(&mut self.adapter, &mut self.observer),
            ServiceCommand::CancelConnect => self
                .session
                .cancel_connect(&mut self.adapter, &mut self.observer),
            ServiceCommand::Shutdown => {
                self.session.stop(&mut self.adapter, &mut self.observer);
                return false;
            }
        }
        true
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.timers.values().filter_map(|t| t.deadline).min()
    }

    fn fire_due_timers(&mut self) {
        let now = Instant::now();
        let mut due = Vec::new();

        for timer in self.timers.values_mut() {
            let Some(deadline) = timer.deadline else {
                continue;
            };
            if deadline > now {
                continue;
            }
            timer.deadline = timer.spec.repeating.then(|| deadline + timer.spec.period);
            due.push(timer.spec);
        }

        for spec in due {
            self.session.on_timer(
                spec.kind,
                spec.generation,
                &mut self.adapter,
                &mut self.observer,
            );
        }
    }

    fn sync_timers(&mut self) {
        let wanted = self.session.timers();
        let now = Instant::now();

        self.timers.retain(|kind, armed| {
            wanted
                .iter()
                .any(|w| w.kind == *kind && w.generation == armed.spec.generation)
        });

        for spec in wanted {
            self.timers.entry(spec.kind).or_insert_with(|| {
                debug!(kind = ?spec.kind, generation = spec.generation, "Timer armed");
                ArmedTimer {
                    spec,
                    deadline: Some(now + spec.period),
                }
            });
        }
    }
}
