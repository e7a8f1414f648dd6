//! BLE Session State Machine
//!
//! Owns the single polling session and applies adapter events to it one at
//! a time. Every adapter request made here is fire-and-forget; the
//! transition it leads to happens when the matching [`AdapterEvent`] comes
//! back.
//!
//! ```text
//! Idle ─▶ Scanning ─▶ Connecting ─▶ DiscoveringServices ─▶ DiscoveringCharacteristics
//!           ▲   ▲          │                                        │
//!           │   └──failed──┘                                        ▼
//!           │                                        Subscribing ─▶ Polling
//!           │                                                          │
//!           └───────────── reconnect ───────────── Disconnected ◀──────┘
//! ```

use crate::domain::error::{ConfigError, ErrorKind};
use crate::domain::models::{
    AdapterState, CharacteristicHandle, DiscoveredPeripheral, MetricSample, PeripheralId,
    ServiceHandle, SessionState, SpeedUnit,
};
use crate::domain::settings::Settings;
use crate::infrastructure::bluetooth::adapter::{AdapterEvent, BleAdapter};
use crate::infrastructure::bluetooth::policy::{ScanAction, ScanDutyCycle, ScanPolicy};
use crate::infrastructure::bluetooth::protocol::{self, ResponseFormat};
use crate::infrastructure::bluetooth::scheduler::{PollScheduler, TimerKind, TimerSpec};
use std::time::Duration;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

/// Receives everything the session produces
pub trait SessionObserver {
    fn on_metric_sample(&mut self, sample: MetricSample);
    fn on_session_state_changed(&mut self, state: SessionState);
    fn on_fatal_error(&mut self, error: ErrorKind);
    fn on_recoverable_error(&mut self, error: ErrorKind);
}

/// Validated session configuration, fixed at construction
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub target_name: String,
    pub service_uuid: Uuid,
    pub characteristic_uuid: Uuid,
    pub poll_command: Vec<u8>,
    pub poll_interval: Duration,
    pub enable_payload: Vec<u8>,
    pub response_format: ResponseFormat,
    pub unit: SpeedUnit,
    pub write_with_response: bool,
    pub subscribe_retries: u32,
    pub auto_reconnect: bool,
    pub reconnect_delay: Duration,
    pub scan_duty_cycle: Option<ScanDutyCycle>,
}

impl SessionConfig {
    pub fn from_settings(s: &Settings) -> Result<Self, ConfigError> {
        if s.target_name.is_empty() {
            return Err(ConfigError::EmptyTargetName);
        }
        if s.poll_interval_ms == 0 {
            return Err(ConfigError::ZeroPollInterval);
        }
        if s.scan_window_ms == Some(0) || (s.scan_window_ms.is_some() && s.scan_pause_ms == 0) {
            return Err(ConfigError::ZeroScanDutyCycle);
        }

        let response_format = ResponseFormat {
            frame_len: s.response_frame_len,
            value_offset: s.response_value_offset,
            terminator: s.response_terminator,
        };
        response_format.validate()?;

        let enable_payload = if s.enable_payload.trim().is_empty() {
            Vec::new()
        } else {
            protocol::encode(&s.enable_payload).map_err(ConfigError::EnablePayload)?
        };

        Ok(Self {
            target_name: s.target_name.clone(),
            service_uuid: protocol::parse_uuid(&s.target_service_id)?,
            characteristic_uuid: protocol::parse_uuid(&s.target_characteristic_id)?,
            poll_command: protocol::encode(&s.poll_command).map_err(ConfigError::PollCommand)?,
            poll_interval: Duration::from_millis(s.poll_interval_ms),
            enable_payload,
            response_format,
            unit: s.unit,
            write_with_response: s.write_with_response,
            subscribe_retries: s.subscribe_retries,
            auto_reconnect: s.auto_reconnect,
            reconnect_delay: Duration::from_millis(s.reconnect_delay_ms),
            scan_duty_cycle: s.scan_window_ms.map(|window| ScanDutyCycle {
                window: Duration::from_millis(window),
                pause: Duration::from_millis(s.scan_pause_ms),
            }),
        })
    }
}

pub struct Session {
    config: SessionConfig,
    state: SessionState,
    adapter_state: AdapterState,
    enabled: bool,
    target_peripheral: Option<PeripheralId>,
    target_characteristic: Option<CharacteristicHandle>,
    /// Link we asked the adapter to drop; its disconnect callback is expected
    releasing: Option<PeripheralId>,
    pending_services: Vec<ServiceHandle>,
    subscribe_attempts: u32,
    /// The enable payload write has not been acknowledged yet
    enable_write_pending: bool,
    policy: ScanPolicy,
    scheduler: PollScheduler,
}

impl Session {
    pub fn new(config: SessionConfig) -> Self {
        let policy = ScanPolicy::new(
            config.target_name.clone(),
            config.scan_duty_cycle,
            config.auto_reconnect,
            config.reconnect_delay,
        );
        let scheduler = PollScheduler::new(config.poll_interval);

        Self {
            config,
            state: SessionState::Idle,
            adapter_state: AdapterState::Unknown,
            enabled: true,
            target_peripheral: None,
            target_characteristic: None,
            releasing: None,
            pending_services: Vec::new(),
            subscribe_attempts: 0,
            enable_write_pending: false,
            policy,
            scheduler,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    #[cfg(test)]
    pub fn target_peripheral(&self) -> Option<&PeripheralId> {
        self.target_peripheral.as_ref()
    }

    #[cfg(test)]
    pub fn target_characteristic(&self) -> Option<&CharacteristicHandle> {
        self.target_characteristic.as_ref()
    }

    pub fn keep_scanning(&self) -> bool {
        self.policy.keep_scanning()
    }

    /// Timers that should currently be armed
    pub fn timers(&self) -> Vec<TimerSpec> {
        self.scheduler
            .timer()
            .into_iter()
            .chain(self.policy.timers())
            .collect()
    }

    /// Apply one adapter callback
    pub fn handle_event(
        &mut self,
        event: AdapterEvent,
        adapter: &mut dyn BleAdapter,
        observer: &mut dyn SessionObserver,
    ) {
        if let AdapterEvent::Disconnected { peripheral, .. } = &event {
            if self.releasing.as_ref() == Some(peripheral) {
                debug!(%peripheral, "Released link closed");
                self.releasing = None;
                return;
            }
        }

        match event {
            AdapterEvent::StateChanged(state) => self.on_adapter_state(state, adapter, observer),
            AdapterEvent::ScanFailed { reason } => {
                if self.state != SessionState::Scanning {
                    debug!(%reason, "Scan failure outside Scanning ignored");
                    return;
                }
                error!("Scan failed: {}", reason);
                observer.on_fatal_error(ErrorKind::ScanFailed(reason));
                self.teardown();
                self.transition(SessionState::Idle, adapter, observer);
            }
            AdapterEvent::PeripheralDiscovered(peripheral) => {
                self.on_discovered(peripheral, adapter, observer)
            }
            AdapterEvent::Connected(peripheral) => {
                if self.state != SessionState::Connecting || !self.is_target(&peripheral) {
                    debug!(%peripheral, state = ?self.state, "Stale connect ignored");
                    return;
                }
                info!(%peripheral, "Connected");
                self.releasing = None;
                self.transition(SessionState::DiscoveringServices, adapter, observer);
            }
            AdapterEvent::ConnectFailed { peripheral, reason } => {
                if self.state != SessionState::Connecting || !self.is_target(&peripheral) {
                    debug!(%peripheral, "Stale connect failure ignored");
                    return;
                }
                self.on_connect_failed(peripheral, reason, adapter, observer);
            }
            AdapterEvent::Disconnected { peripheral, reason } => {
                if !self.is_target(&peripheral) {
                    debug!(%peripheral, "Disconnect of non-target ignored");
                    return;
                }
                if self.state == SessionState::Connecting {
                    let reason = reason.unwrap_or_else(|| "disconnected".to_string());
                    self.on_connect_failed(peripheral, reason, adapter, observer);
                } else if self.state.is_linked() {
                    warn!(%peripheral, ?reason, "Peripheral disconnected");
                    if let Some(reason) = reason {
                        observer.on_recoverable_error(ErrorKind::LinkLost(reason));
                    }
                    self.transition(SessionState::Disconnected, adapter, observer);
                }
            }
            AdapterEvent::ServicesDiscovered {
                peripheral,
                services,
            } => {
                if self.state != SessionState::DiscoveringServices || !self.is_target(&peripheral)
                {
                    debug!(%peripheral, "Stale service discovery ignored");
                    return;
                }
                self.on_services(services, adapter, observer);
            }
            AdapterEvent::ServiceDiscoveryFailed { peripheral, reason } => {
                if self.state != SessionState::DiscoveringServices || !self.is_target(&peripheral)
                {
                    debug!(%peripheral, "Stale service discovery failure ignored");
                    return;
                }
                self.fail_session(
                    ErrorKind::DiscoveryFailed(format!("services: {reason}")),
                    adapter,
                    observer,
                );
            }
            AdapterEvent::CharacteristicsDiscovered {
                service,
                characteristics,
            } => {
                if !self.take_pending_service(&service) {
                    debug!(service = %service.uuid, "Stale characteristic discovery ignored");
                    return;
                }
                self.on_characteristics(characteristics, adapter, observer);
            }
            AdapterEvent::CharacteristicDiscoveryFailed { service, reason } => {
                if !self.take_pending_service(&service) {
                    debug!(service = %service.uuid, "Stale characteristic failure ignored");
                    return;
                }
                self.fail_session(
                    ErrorKind::DiscoveryFailed(format!("characteristics of {}: {reason}", service.uuid)),
                    adapter,
                    observer,
                );
            }
            AdapterEvent::NotifyStateUpdated {
                characteristic,
                enabled,
                result,
            } => {
                if !self.is_target_characteristic(&characteristic) {
                    debug!(characteristic = %characteristic.uuid, "Stale notify ack ignored");
                    return;
                }
                self.on_notify_state(characteristic, enabled, result, adapter, observer);
            }
            AdapterEvent::WriteCompleted {
                characteristic,
                result,
            } => {
                if !self.is_target_characteristic(&characteristic) {
                    debug!(characteristic = %characteristic.uuid, "Stale write ack ignored");
                    return;
                }
                // Requests complete in order, so the first ack after
                // subscribing belongs to the enable write.
                let enable_write = std::mem::take(&mut self.enable_write_pending);
                let Err(reason) = result else {
                    trace!(enable_write, "Write acknowledged");
                    return;
                };
                let error = if enable_write {
                    ErrorKind::EnableWriteFailed(reason)
                } else {
                    ErrorKind::PollWriteFailed(reason)
                };
                warn!("{}", error);
                observer.on_recoverable_error(error);
            }
            AdapterEvent::ValueUpdated {
                characteristic,
                value,
            } => {
                let receiving = matches!(
                    self.state,
                    SessionState::Subscribing | SessionState::Polling
                );
                if !receiving || !self.is_target_characteristic(&characteristic) {
                    debug!(characteristic = %characteristic.uuid, "Stale value ignored");
                    return;
                }
                let sample = self.decode_sample(value, observer);
                observer.on_metric_sample(sample);
            }
        }
    }

    /// Apply one timer expiry
    pub fn on_timer(
        &mut self,
        kind: TimerKind,
        generation: u64,
        adapter: &mut dyn BleAdapter,
        observer: &mut dyn SessionObserver,
    ) {
        match kind {
            TimerKind::Poll => {
                if self.state == SessionState::Polling {
                    self.scheduler.tick(generation, adapter);
                }
            }
            TimerKind::ScanWindow | TimerKind::ScanPause => {
                if self.state != SessionState::Scanning {
                    return;
                }
                match self.policy.on_scan_timer(kind, generation) {
                    Some(ScanAction::Pause) => adapter.stop_scan(),
                    Some(ScanAction::Resume) => adapter.scan(),
                    None => {}
                }
            }
            TimerKind::Reconnect => {
                if self.state == SessionState::Disconnected
                    && self.policy.take_reconnect(generation)
                    && self.adapter_state == AdapterState::PoweredOn
                    && self.policy.keep_scanning()
                {
                    info!("Reconnecting");
                    self.transition(SessionState::Scanning, adapter, observer);
                }
            }
        }
    }

    /// Allow the session to run; scans right away if the adapter is ready
    pub fn start(&mut self, adapter: &mut dyn BleAdapter, observer: &mut dyn SessionObserver) {
        self.enabled = true;
        if matches!(self.state, SessionState::Idle | SessionState::Disconnected)
            && self.adapter_state == AdapterState::PoweredOn
        {
            self.transition(SessionState::Scanning, adapter, observer);
        }
    }

    /// Tear everything down and stay Idle until [`Session::start`]
    pub fn stop(&mut self, adapter: &mut dyn BleAdapter, observer: &mut dyn SessionObserver) {
        info!("Stopping session");
        self.enabled = false;
        if self.state == SessionState::Scanning {
            adapter.stop_scan();
        }
        if self.state == SessionState::Connecting || self.state.is_linked() {
            self.release_link(adapter);
        }
        self.policy.halt();
        self.teardown();
        self.transition(SessionState::Idle, adapter, observer);
    }

    /// Abandon a connect attempt that never completes and resume scanning
    pub fn cancel_connect(
        &mut self,
        adapter: &mut dyn BleAdapter,
        observer: &mut dyn SessionObserver,
    ) {
        if self.state != SessionState::Connecting {
            debug!(state = ?self.state, "No connect attempt to cancel");
            return;
        }
        info!("Cancelling connect attempt");
        self.release_link(adapter);
        self.target_peripheral = None;
        self.transition(SessionState::Scanning, adapter, observer);
    }

    fn on_adapter_state(
        &mut self,
        state: AdapterState,
        adapter: &mut dyn BleAdapter,
        observer: &mut dyn SessionObserver,
    ) {
        info!(?state, "Adapter state changed");
        self.adapter_state = state;

        if state.is_unavailable() {
            error!(?state, "Bluetooth adapter unavailable");
            observer.on_fatal_error(ErrorKind::AdapterUnavailable(state));
            if self.state != SessionState::Idle {
                // Links and pending requests die with the adapter.
                self.releasing = None;
                self.teardown();
                self.transition(SessionState::Idle, adapter, observer);
            }
            return;
        }

        if state != AdapterState::PoweredOn {
            return;
        }
        match self.state {
            SessionState::Idle if self.enabled => {
                self.transition(SessionState::Scanning, adapter, observer)
            }
            SessionState::Disconnected if self.policy.keep_scanning() => {
                self.transition(SessionState::Scanning, adapter, observer)
            }
            _ => debug!(state = ?self.state, "Adapter ready, nothing to do"),
        }
    }

    fn on_discovered(
        &mut self,
        peripheral: DiscoveredPeripheral,
        adapter: &mut dyn BleAdapter,
        observer: &mut dyn SessionObserver,
    ) {
        if self.state != SessionState::Scanning {
            trace!(peripheral = %peripheral.id, state = ?self.state, "Advertisement ignored");
            return;
        }
        if !self.policy.select(&peripheral) {
            trace!(
                peripheral = %peripheral.id,
                name = ?peripheral.advertised_name,
                "Not the target"
            );
            return;
        }
        self.target_peripheral = Some(peripheral.id);
        self.transition(SessionState::Connecting, adapter, observer);
    }

    fn on_connect_failed(
        &mut self,
        peripheral: PeripheralId,
        reason: String,
        adapter: &mut dyn BleAdapter,
        observer: &mut dyn SessionObserver,
    ) {
        warn!(%peripheral, %reason, "Connection failed, resuming scan");
        observer.on_recoverable_error(ErrorKind::ConnectFailed {
            peripheral: peripheral.to_string(),
            reason,
        });
        self.target_peripheral = None;
        self.transition(SessionState::Scanning, adapter, observer);
    }

    fn on_services(
        &mut self,
        services: Vec<ServiceHandle>,
        adapter: &mut dyn BleAdapter,
        observer: &mut dyn SessionObserver,
    ) {
        info!("Found {} services", services.len());
        let wanted = self.config.service_uuid;
        self.pending_services = services.into_iter().filter(|s| s.uuid == wanted).collect();

        if self.pending_services.is_empty() {
            self.fail_session(
                ErrorKind::DiscoveryFailed(format!("service {wanted} not found")),
                adapter,
                observer,
            );
            return;
        }
        self.transition(SessionState::DiscoveringCharacteristics, adapter, observer);
    }

    fn on_characteristics(
        &mut self,
        characteristics: Vec<CharacteristicHandle>,
        adapter: &mut dyn BleAdapter,
        observer: &mut dyn SessionObserver,
    ) {
        let wanted = self.config.characteristic_uuid;
        if let Some(found) = characteristics.into_iter().find(|c| c.uuid == wanted) {
            info!(characteristic = %found.uuid, "Found target characteristic");
            self.pending_services.clear();
            self.target_characteristic = Some(found);
            self.transition(SessionState::Subscribing, adapter, observer);
        } else if self.pending_services.is_empty() {
            self.fail_session(
                ErrorKind::DiscoveryFailed(format!("characteristic {wanted} not found")),
                adapter,
                observer,
            );
        }
    }

    fn on_notify_state(
        &mut self,
        characteristic: CharacteristicHandle,
        enabled: bool,
        result: Result<(), String>,
        adapter: &mut dyn BleAdapter,
        observer: &mut dyn SessionObserver,
    ) {
        match self.state {
            SessionState::Subscribing => match result {
                Ok(()) if enabled => {
                    info!("Notifications enabled");
                    self.transition(SessionState::Polling, adapter, observer);
                }
                Ok(()) => debug!("Notifications disabled while subscribing"),
                Err(reason) if self.subscribe_attempts <= self.config.subscribe_retries => {
                    warn!(
                        attempt = self.subscribe_attempts,
                        %reason,
                        "Notification subscription failed, retrying"
                    );
                    self.subscribe_attempts += 1;
                    adapter.set_notify(&characteristic, true);
                }
                Err(reason) => {
                    error!(
                        "Failed to enable notifications after {} attempts",
                        self.subscribe_attempts
                    );
                    self.fail_session(ErrorKind::SubscribeFailed(reason), adapter, observer);
                }
            },
            SessionState::Polling => {
                self.scheduler.notify_updated(enabled, result.is_ok());
                if let Err(reason) = result {
                    warn!(%reason, "Notification subscription failed while polling");
                    observer.on_recoverable_error(ErrorKind::SubscribeFailed(reason));
                }
            }
            _ => debug!(state = ?self.state, "Notify ack ignored"),
        }
    }

    fn decode_sample(&self, value: Vec<u8>, observer: &mut dyn SessionObserver) -> MetricSample {
        match protocol::decode(&value, &self.config.response_format) {
            Ok(decoded) => {
                debug!(value = decoded, unit = self.config.unit.suffix(), "Speed sample");
                MetricSample::decoded(value, decoded, self.config.unit)
            }
            Err(e) => {
                warn!("Dropping malformed frame {:02X?}: {}", value, e);
                observer.on_recoverable_error(ErrorKind::Decode(e.clone()));
                MetricSample::malformed(value, e, self.config.unit)
            }
        }
    }

    /// Report a failure of the current link and drop it
    fn fail_session(
        &mut self,
        error: ErrorKind,
        adapter: &mut dyn BleAdapter,
        observer: &mut dyn SessionObserver,
    ) {
        warn!("Session failed: {}", error);
        observer.on_recoverable_error(error);
        self.release_link(adapter);
        self.transition(SessionState::Disconnected, adapter, observer);
    }

    fn release_link(&mut self, adapter: &mut dyn BleAdapter) {
        if let Some(peripheral) = self.target_peripheral.clone() {
            adapter.disconnect(&peripheral);
            self.releasing = Some(peripheral);
        }
    }

    fn teardown(&mut self) {
        self.scheduler.cancel();
        self.policy.reset_timers();
        self.target_characteristic = None;
        self.target_peripheral = None;
        self.pending_services.clear();
        self.subscribe_attempts = 0;
        self.enable_write_pending = false;
    }

    fn transition(
        &mut self,
        next: SessionState,
        adapter: &mut dyn BleAdapter,
        observer: &mut dyn SessionObserver,
    ) {
        if self.state == next {
            return;
        }
        info!(from = ?self.state, to = ?next, "Session state change");
        self.state = next;

        match next {
            SessionState::Idle => {}
            SessionState::Scanning => {
                self.policy.begin_scanning();
                adapter.scan();
            }
            SessionState::Connecting => {
                adapter.stop_scan();
                if let Some(peripheral) = &self.target_peripheral {
                    adapter.connect(peripheral);
                }
            }
            SessionState::DiscoveringServices => {
                if let Some(peripheral) = &self.target_peripheral {
                    adapter.discover_services(peripheral);
                }
            }
            SessionState::DiscoveringCharacteristics => {
                for service in &self.pending_services {
                    adapter.discover_characteristics(service);
                }
            }
            SessionState::Subscribing => {
                if let Some(characteristic) = &self.target_characteristic {
                    self.subscribe_attempts = 1;
                    adapter.set_notify(characteristic, true);
                    if !self.config.enable_payload.is_empty() {
                        self.enable_write_pending = true;
                        adapter.write(characteristic, &self.config.enable_payload, true);
                    }
                }
            }
            SessionState::Polling => {
                if let Some(characteristic) = self.target_characteristic.clone() {
                    self.scheduler.start(
                        characteristic,
                        self.config.poll_command.clone(),
                        self.config.write_with_response,
                        true,
                    );
                }
            }
            SessionState::Disconnected => {
                self.teardown();
                self.policy
                    .enter_disconnected(self.adapter_state == AdapterState::PoweredOn);
            }
        }

        observer.on_session_state_changed(next);
    }

    fn is_target(&self, peripheral: &PeripheralId) -> bool {
        self.target_peripheral.as_ref() == Some(peripheral)
    }

    fn is_target_characteristic(&self, characteristic: &CharacteristicHandle) -> bool {
        self.target_characteristic.as_ref() == Some(characteristic)
    }

    fn take_pending_service(&mut self, service: &ServiceHandle) -> bool {
        if self.state != SessionState::DiscoveringCharacteristics {
            return false;
        }
        match self.pending_services.iter().position(|s| s == service) {
            Some(index) => {
                self.pending_services.swap_remove(index);
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::error::DecodeError;
    use crate::infrastructure::bluetooth::mock::{AdapterCall, MockBleAdapter, RecordingObserver};

    struct Harness {
        session: Session,
        adapter: MockBleAdapter,
        observer: RecordingObserver,
    }

    impl Harness {
        fn new() -> Self {
            Self::with_settings(Settings::default())
        }

        fn with_settings(settings: Settings) -> Self {
            let config = SessionConfig::from_settings(&settings).unwrap();
            Self {
                session: Session::new(config),
                adapter: MockBleAdapter::new(),
                observer: RecordingObserver::default(),
            }
        }

        fn send(&mut self, event: AdapterEvent) {
            self.session
                .handle_event(event, &mut self.adapter, &mut self.observer);
        }

        fn timer(&self, kind: TimerKind) -> Option<TimerSpec> {
            self.session.timers().into_iter().find(|t| t.kind == kind)
        }

        fn fire(&mut self, kind: TimerKind) {
            let spec = self.timer(kind).expect("timer not armed");
            self.session
                .on_timer(kind, spec.generation, &mut self.adapter, &mut self.observer);
        }

        fn to_scanning(&mut self) {
            self.send(AdapterEvent::StateChanged(AdapterState::PoweredOn));
        }

        fn to_connecting(&mut self) {
            self.to_scanning();
            self.send(AdapterEvent::PeripheralDiscovered(advert("OBDBLE")));
        }

        fn to_discovering_services(&mut self) {
            self.to_connecting();
            self.send(AdapterEvent::Connected(peripheral()));
        }

        fn to_subscribing(&mut self) {
            self.to_discovering_services();
            self.send(AdapterEvent::ServicesDiscovered {
                peripheral: peripheral(),
                services: vec![service()],
            });
            self.send(AdapterEvent::CharacteristicsDiscovered {
                service: service(),
                characteristics: vec![characteristic()],
            });
        }

        fn to_polling(&mut self) {
            self.to_subscribing();
            self.send(notify_ack(Ok(())));
            self.send(write_ack(Ok(())));
            assert_eq!(self.session.state(), SessionState::Polling);
        }
    }

    fn peripheral() -> PeripheralId {
        PeripheralId::from("AA:BB:CC:DD:EE:FF")
    }

    fn advert(name: &str) -> DiscoveredPeripheral {
        DiscoveredPeripheral {
            id: peripheral(),
            advertised_name: Some(name.to_string()),
            rssi: Some(-58),
        }
    }

    fn service() -> ServiceHandle {
        ServiceHandle {
            peripheral: peripheral(),
            uuid: protocol::parse_uuid(protocol::SERVICE_UUID).unwrap(),
        }
    }

    fn characteristic() -> CharacteristicHandle {
        CharacteristicHandle {
            peripheral: peripheral(),
            service_uuid: service().uuid,
            uuid: protocol::parse_uuid(protocol::DATA_CHAR_UUID).unwrap(),
        }
    }

    fn notify_ack(result: Result<(), String>) -> AdapterEvent {
        AdapterEvent::NotifyStateUpdated {
            characteristic: characteristic(),
            enabled: true,
            result,
        }
    }

    fn write_ack(result: Result<(), String>) -> AdapterEvent {
        AdapterEvent::WriteCompleted {
            characteristic: characteristic(),
            result,
        }
    }

    fn value(bytes: &[u8]) -> AdapterEvent {
        AdapterEvent::ValueUpdated {
            characteristic: characteristic(),
            value: bytes.to_vec(),
        }
    }

    #[test]
    fn end_to_end_reaches_first_sample() {
        let mut h = Harness::new();

        h.send(AdapterEvent::StateChanged(AdapterState::PoweredOn));
        assert_eq!(h.adapter.take_calls(), vec![AdapterCall::Scan]);

        h.send(AdapterEvent::PeripheralDiscovered(advert("OBDBLE")));
        assert_eq!(
            h.adapter.take_calls(),
            vec![AdapterCall::StopScan, AdapterCall::Connect(peripheral())]
        );

        h.send(AdapterEvent::Connected(peripheral()));
        assert_eq!(
            h.adapter.take_calls(),
            vec![AdapterCall::DiscoverServices(peripheral())]
        );

        let other_service = ServiceHandle {
            peripheral: peripheral(),
            uuid: protocol::parse_uuid("180A").unwrap(),
        };
        h.send(AdapterEvent::ServicesDiscovered {
            peripheral: peripheral(),
            services: vec![other_service, service()],
        });
        assert_eq!(
            h.adapter.take_calls(),
            vec![AdapterCall::DiscoverCharacteristics(service())]
        );

        let other_char = CharacteristicHandle {
            uuid: protocol::parse_uuid("FFF2").unwrap(),
            ..characteristic()
        };
        h.send(AdapterEvent::CharacteristicsDiscovered {
            service: service(),
            characteristics: vec![other_char, characteristic()],
        });
        assert_eq!(
            h.adapter.take_calls(),
            vec![
                AdapterCall::SetNotify(characteristic(), true),
                AdapterCall::Write(characteristic(), vec![0x01], true),
            ]
        );

        h.send(value(b"410D0D\r"));
        assert_eq!(h.observer.samples.len(), 1);
        assert_eq!(h.observer.samples[0].decoded_value, Some(13));
        assert_eq!(h.observer.samples[0].raw_bytes, b"410D0D\r".to_vec());

        h.send(notify_ack(Ok(())));
        assert_eq!(
            h.observer.states,
            vec![
                SessionState::Scanning,
                SessionState::Connecting,
                SessionState::DiscoveringServices,
                SessionState::DiscoveringCharacteristics,
                SessionState::Subscribing,
                SessionState::Polling,
            ]
        );
        assert_eq!(h.session.target_characteristic(), Some(&characteristic()));
        assert!(h.observer.fatal.is_empty());
        assert!(h.observer.recoverable.is_empty());
    }

    #[test]
    fn non_matching_name_does_not_connect() {
        let mut h = Harness::new();
        h.to_scanning();
        h.adapter.take_calls();

        h.send(AdapterEvent::PeripheralDiscovered(advert("Headphones")));
        h.send(AdapterEvent::PeripheralDiscovered(DiscoveredPeripheral {
            id: PeripheralId::from("anon"),
            advertised_name: None,
            rssi: None,
        }));

        assert_eq!(h.session.state(), SessionState::Scanning);
        assert!(h.adapter.calls().is_empty());
        assert!(h.session.keep_scanning());
    }

    #[test]
    fn second_match_while_connecting_is_ignored() {
        let mut h = Harness::new();
        h.to_connecting();
        h.send(AdapterEvent::PeripheralDiscovered(DiscoveredPeripheral {
            id: PeripheralId::from("11:22:33:44:55:66"),
            advertised_name: Some("OBDBLE".to_string()),
            rssi: Some(-40),
        }));

        assert_eq!(h.session.state(), SessionState::Connecting);
        assert_eq!(h.session.target_peripheral(), Some(&peripheral()));
        assert_eq!(
            h.adapter.count(|c| matches!(c, AdapterCall::Connect(_))),
            1
        );
        assert!(!h.session.keep_scanning());
    }

    #[test]
    fn disconnect_while_polling_stops_the_poll_timer() {
        let mut h = Harness::new();
        h.to_polling();
        let poll = h.timer(TimerKind::Poll).unwrap();

        h.session
            .on_timer(TimerKind::Poll, poll.generation, &mut h.adapter, &mut h.observer);
        assert_eq!(h.adapter.writes(), 2, "enable payload plus one poll");
        h.adapter.take_calls();

        h.send(AdapterEvent::Disconnected {
            peripheral: peripheral(),
            reason: Some("link loss".to_string()),
        });
        assert_eq!(h.session.state(), SessionState::Disconnected);
        assert!(h.session.target_characteristic().is_none());
        assert!(h.session.target_peripheral().is_none());
        assert!(h.timer(TimerKind::Poll).is_none());
        assert_eq!(
            h.observer.recoverable,
            vec![ErrorKind::LinkLost("link loss".to_string())]
        );

        // One more tick from the old timer: nothing is written.
        h.session
            .on_timer(TimerKind::Poll, poll.generation, &mut h.adapter, &mut h.observer);
        assert_eq!(h.adapter.writes(), 0);

        // Late notification for the old handle is dropped too.
        h.send(value(b"410D0D\r"));
        assert!(h.observer.samples.is_empty());
    }

    #[test]
    fn connect_failure_resumes_scanning() {
        let mut h = Harness::new();
        h.to_connecting();
        h.adapter.take_calls();

        h.send(AdapterEvent::ConnectFailed {
            peripheral: peripheral(),
            reason: "peer removed pairing".to_string(),
        });

        assert_eq!(h.session.state(), SessionState::Scanning);
        assert_eq!(h.adapter.calls(), vec![AdapterCall::Scan]);
        assert!(h.session.target_peripheral().is_none());
        assert!(h.session.keep_scanning());
        assert!(matches!(
            h.observer.recoverable.as_slice(),
            [ErrorKind::ConnectFailed { .. }]
        ));

        // And the next advertisement is picked up again.
        h.send(AdapterEvent::PeripheralDiscovered(advert("OBDBLE")));
        assert_eq!(h.session.state(), SessionState::Connecting);
    }

    #[test]
    fn disconnect_while_connecting_counts_as_failure() {
        let mut h = Harness::new();
        h.to_connecting();
        h.send(AdapterEvent::Disconnected {
            peripheral: peripheral(),
            reason: None,
        });
        assert_eq!(h.session.state(), SessionState::Scanning);
        assert_eq!(h.observer.recoverable.len(), 1);
    }

    #[test]
    fn adapter_loss_returns_to_idle() {
        let mut h = Harness::new();
        h.to_scanning();
        h.send(AdapterEvent::StateChanged(AdapterState::PoweredOff));

        assert_eq!(h.session.state(), SessionState::Idle);
        assert_eq!(
            h.observer.fatal,
            vec![ErrorKind::AdapterUnavailable(AdapterState::PoweredOff)]
        );

        h.adapter.take_calls();
        h.send(AdapterEvent::StateChanged(AdapterState::PoweredOn));
        assert_eq!(h.session.state(), SessionState::Scanning);
        assert_eq!(h.adapter.calls(), vec![AdapterCall::Scan]);
    }

    #[test]
    fn adapter_loss_while_polling_tears_down() {
        let mut h = Harness::new();
        h.to_polling();
        h.send(AdapterEvent::StateChanged(AdapterState::Unauthorized));

        assert_eq!(h.session.state(), SessionState::Idle);
        assert!(h.session.timers().is_empty());
        assert!(h.session.target_characteristic().is_none());
    }

    #[test]
    fn unavailable_adapter_in_idle_is_reported() {
        let mut h = Harness::new();
        h.send(AdapterEvent::StateChanged(AdapterState::Unsupported));
        assert_eq!(h.session.state(), SessionState::Idle);
        assert_eq!(h.observer.fatal.len(), 1);
        assert!(h.adapter.calls().is_empty());
    }

    #[test]
    fn missing_service_drops_the_link() {
        let mut h = Harness::new();
        h.to_discovering_services();
        h.adapter.take_calls();

        h.send(AdapterEvent::ServicesDiscovered {
            peripheral: peripheral(),
            services: vec![],
        });

        assert_eq!(h.session.state(), SessionState::Disconnected);
        assert_eq!(h.adapter.calls(), vec![AdapterCall::Disconnect(peripheral())]);
        assert!(matches!(
            h.observer.recoverable.as_slice(),
            [ErrorKind::DiscoveryFailed(_)]
        ));
    }

    #[test]
    fn service_discovery_error_drops_the_link() {
        let mut h = Harness::new();
        h.to_discovering_services();
        h.send(AdapterEvent::ServiceDiscoveryFailed {
            peripheral: peripheral(),
            reason: "GATT error 0x85".to_string(),
        });
        assert_eq!(h.session.state(), SessionState::Disconnected);
    }

    #[test]
    fn characteristics_exhausted_without_match() {
        let mut h = Harness::new();
        h.to_discovering_services();
        let second = ServiceHandle {
            peripheral: peripheral(),
            uuid: service().uuid,
        };
        h.send(AdapterEvent::ServicesDiscovered {
            peripheral: peripheral(),
            services: vec![service(), second.clone()],
        });
        assert_eq!(
            h.adapter
                .count(|c| matches!(c, AdapterCall::DiscoverCharacteristics(_))),
            2
        );

        h.send(AdapterEvent::CharacteristicsDiscovered {
            service: service(),
            characteristics: vec![],
        });
        assert_eq!(h.session.state(), SessionState::DiscoveringCharacteristics);

        h.send(AdapterEvent::CharacteristicsDiscovered {
            service: second,
            characteristics: vec![],
        });
        assert_eq!(h.session.state(), SessionState::Disconnected);
    }

    #[test]
    fn characteristic_discovery_error_drops_the_link() {
        let mut h = Harness::new();
        h.to_discovering_services();
        h.send(AdapterEvent::ServicesDiscovered {
            peripheral: peripheral(),
            services: vec![service()],
        });
        h.send(AdapterEvent::CharacteristicDiscoveryFailed {
            service: service(),
            reason: "insufficient authentication".to_string(),
        });
        assert_eq!(h.session.state(), SessionState::Disconnected);
        assert_eq!(
            h.adapter.count(|c| matches!(c, AdapterCall::Disconnect(_))),
            1
        );
    }

    #[test]
    fn subscription_is_retried_then_abandoned() {
        let mut h = Harness::new();
        h.to_subscribing();
        h.adapter.take_calls();

        for _ in 0..3 {
            h.send(notify_ack(Err("not permitted".to_string())));
            assert_eq!(h.session.state(), SessionState::Subscribing);
        }
        assert_eq!(
            h.adapter.count(|c| matches!(c, AdapterCall::SetNotify(_, true))),
            3
        );

        h.send(notify_ack(Err("not permitted".to_string())));
        assert_eq!(h.session.state(), SessionState::Disconnected);
        assert!(matches!(
            h.observer.recoverable.last(),
            Some(ErrorKind::SubscribeFailed(_))
        ));
    }

    #[test]
    fn poll_write_failure_keeps_polling() {
        let mut h = Harness::new();
        h.to_polling();

        h.send(AdapterEvent::WriteCompleted {
            characteristic: characteristic(),
            result: Err("busy".to_string()),
        });
        assert_eq!(h.session.state(), SessionState::Polling);
        assert_eq!(
            h.observer.recoverable,
            vec![ErrorKind::PollWriteFailed("busy".to_string())]
        );

        h.adapter.take_calls();
        h.fire(TimerKind::Poll);
        assert_eq!(h.adapter.writes(), 1);
    }

    #[test]
    fn enable_write_failure_is_reported() {
        let mut h = Harness::new();
        h.to_subscribing();
        h.send(AdapterEvent::WriteCompleted {
            characteristic: characteristic(),
            result: Err("rejected".to_string()),
        });
        assert_eq!(h.session.state(), SessionState::Subscribing);
        assert_eq!(
            h.observer.recoverable,
            vec![ErrorKind::EnableWriteFailed("rejected".to_string())]
        );
    }

    #[test]
    fn enable_write_failure_after_notify_ack_is_not_a_poll_failure() {
        let mut h = Harness::new();
        h.to_subscribing();
        h.send(notify_ack(Ok(())));
        assert_eq!(h.session.state(), SessionState::Polling);

        h.send(write_ack(Err("enable rejected".to_string())));
        assert_eq!(h.session.state(), SessionState::Polling);
        assert_eq!(
            h.observer.recoverable,
            vec![ErrorKind::EnableWriteFailed("enable rejected".to_string())]
        );

        // Later failures belong to poll writes.
        h.fire(TimerKind::Poll);
        h.send(write_ack(Err("busy".to_string())));
        assert_eq!(
            h.observer.recoverable.last(),
            Some(&ErrorKind::PollWriteFailed("busy".to_string()))
        );
    }

    #[test]
    fn empty_enable_payload_leaves_write_failures_to_polling() {
        let mut h = Harness::with_settings(Settings {
            enable_payload: String::new(),
            ..Settings::default()
        });
        h.to_subscribing();
        assert_eq!(h.adapter.writes(), 0);
        h.send(notify_ack(Ok(())));

        h.fire(TimerKind::Poll);
        h.send(write_ack(Err("busy".to_string())));
        assert_eq!(
            h.observer.recoverable,
            vec![ErrorKind::PollWriteFailed("busy".to_string())]
        );
    }

    #[test]
    fn malformed_frame_is_reported_per_sample() {
        let mut h = Harness::new();
        h.to_polling();

        h.send(value(b"41"));
        h.send(value(b"410DXY\r"));
        h.send(value(b"410D1E\r"));

        assert_eq!(h.session.state(), SessionState::Polling);
        let samples = &h.observer.samples;
        assert_eq!(samples.len(), 3);
        assert_eq!(
            samples[0].decode_error,
            Some(DecodeError::UnexpectedLength {
                expected: 7,
                actual: 2
            })
        );
        assert_eq!(
            samples[1].decode_error,
            Some(DecodeError::NonHexPayload([b'X', b'Y']))
        );
        assert_eq!(samples[2].decoded_value, Some(30));
        assert_eq!(
            h.observer.recoverable,
            vec![
                ErrorKind::Decode(DecodeError::UnexpectedLength {
                    expected: 7,
                    actual: 2
                }),
                ErrorKind::Decode(DecodeError::NonHexPayload([b'X', b'Y'])),
            ]
        );
    }

    #[test]
    fn reconnect_timer_resumes_scanning() {
        let mut h = Harness::new();
        h.to_polling();
        h.send(AdapterEvent::Disconnected {
            peripheral: peripheral(),
            reason: None,
        });
        assert!(h.session.keep_scanning());
        h.adapter.take_calls();

        h.fire(TimerKind::Reconnect);
        assert_eq!(h.session.state(), SessionState::Scanning);
        assert_eq!(h.adapter.calls(), vec![AdapterCall::Scan]);
    }

    #[test]
    fn adapter_ready_event_resumes_scanning_from_disconnected() {
        let mut h = Harness::new();
        h.to_polling();
        h.send(AdapterEvent::Disconnected {
            peripheral: peripheral(),
            reason: None,
        });
        h.send(AdapterEvent::StateChanged(AdapterState::PoweredOn));
        assert_eq!(h.session.state(), SessionState::Scanning);
        assert!(h.timer(TimerKind::Reconnect).is_none());
    }

    #[test]
    fn no_reconnect_when_disabled() {
        let settings = Settings {
            auto_reconnect: false,
            ..Settings::default()
        };
        let mut h = Harness::with_settings(settings);
        h.to_polling();
        h.send(AdapterEvent::Disconnected {
            peripheral: peripheral(),
            reason: None,
        });
        h.send(AdapterEvent::StateChanged(AdapterState::PoweredOn));

        assert_eq!(h.session.state(), SessionState::Disconnected);
        assert!(h.session.timers().is_empty());
    }

    #[test]
    fn released_link_disconnect_does_not_hit_new_attempt() {
        let mut h = Harness::new();
        h.to_discovering_services();
        h.send(AdapterEvent::ServicesDiscovered {
            peripheral: peripheral(),
            services: vec![],
        });
        assert_eq!(h.session.state(), SessionState::Disconnected);

        h.fire(TimerKind::Reconnect);
        h.send(AdapterEvent::PeripheralDiscovered(advert("OBDBLE")));
        assert_eq!(h.session.state(), SessionState::Connecting);

        // Callback for the link dropped earlier arrives only now.
        h.send(AdapterEvent::Disconnected {
            peripheral: peripheral(),
            reason: None,
        });
        assert_eq!(h.session.state(), SessionState::Connecting);

        h.send(AdapterEvent::Connected(peripheral()));
        assert_eq!(h.session.state(), SessionState::DiscoveringServices);
    }

    #[test]
    fn stop_tears_down_and_stays_idle() {
        let mut h = Harness::new();
        h.to_polling();
        h.adapter.take_calls();

        h.session.stop(&mut h.adapter, &mut h.observer);
        assert_eq!(h.session.state(), SessionState::Idle);
        assert_eq!(h.adapter.calls(), vec![AdapterCall::Disconnect(peripheral())]);
        assert!(h.session.timers().is_empty());

        h.send(AdapterEvent::Disconnected {
            peripheral: peripheral(),
            reason: None,
        });
        h.send(AdapterEvent::StateChanged(AdapterState::PoweredOn));
        assert_eq!(h.session.state(), SessionState::Idle);

        h.session.start(&mut h.adapter, &mut h.observer);
        assert_eq!(h.session.state(), SessionState::Scanning);
    }

    #[test]
    fn stop_while_scanning_stops_the_radio() {
        let mut h = Harness::new();
        h.to_scanning();
        h.adapter.take_calls();
        h.session.stop(&mut h.adapter, &mut h.observer);
        assert_eq!(h.adapter.calls(), vec![AdapterCall::StopScan]);
    }

    #[test]
    fn cancel_connect_resumes_scanning() {
        let mut h = Harness::new();
        h.to_connecting();
        h.adapter.take_calls();

        h.session.cancel_connect(&mut h.adapter, &mut h.observer);
        assert_eq!(h.session.state(), SessionState::Scanning);
        assert_eq!(
            h.adapter.calls(),
            vec![AdapterCall::Disconnect(peripheral()), AdapterCall::Scan]
        );

        // Late success for the abandoned attempt changes nothing.
        h.send(AdapterEvent::Connected(peripheral()));
        assert_eq!(h.session.state(), SessionState::Scanning);
    }

    #[test]
    fn scan_duty_cycle_pauses_and_resumes_radio() {
        let settings = Settings {
            scan_window_ms: Some(2000),
            scan_pause_ms: 10_000,
            ..Settings::default()
        };
        let mut h = Harness::with_settings(settings);
        h.to_scanning();
        h.adapter.take_calls();

        h.fire(TimerKind::ScanWindow);
        assert_eq!(h.adapter.take_calls(), vec![AdapterCall::StopScan]);
        assert_eq!(h.session.state(), SessionState::Scanning);

        h.fire(TimerKind::ScanPause);
        assert_eq!(h.adapter.take_calls(), vec![AdapterCall::Scan]);
    }

    #[test]
    fn scan_failure_is_fatal() {
        let mut h = Harness::new();
        h.to_scanning();
        h.send(AdapterEvent::ScanFailed {
            reason: "no permission".to_string(),
        });
        assert_eq!(h.session.state(), SessionState::Idle);
        assert_eq!(
            h.observer.fatal,
            vec![ErrorKind::ScanFailed("no permission".to_string())]
        );
    }

    #[test]
    fn config_rejects_invalid_settings() {
        let bad_command = Settings {
            poll_command: "speed".to_string(),
            ..Settings::default()
        };
        assert!(matches!(
            SessionConfig::from_settings(&bad_command),
            Err(ConfigError::PollCommand(_))
        ));

        let bad_uuid = Settings {
            target_service_id: "xyz".to_string(),
            ..Settings::default()
        };
        assert_eq!(
            SessionConfig::from_settings(&bad_uuid).unwrap_err(),
            ConfigError::InvalidUuid("xyz".to_string())
        );

        let zero_interval = Settings {
            poll_interval_ms: 0,
            ..Settings::default()
        };
        assert_eq!(
            SessionConfig::from_settings(&zero_interval).unwrap_err(),
            ConfigError::ZeroPollInterval
        );

        let zero_window = Settings {
            scan_window_ms: Some(0),
            scan_pause_ms: 0,
            ..Settings::default()
        };
        assert_eq!(
            SessionConfig::from_settings(&zero_window).unwrap_err(),
            ConfigError::ZeroScanDutyCycle
        );

        let zero_pause = Settings {
            scan_window_ms: Some(2000),
            scan_pause_ms: 0,
            ..Settings::default()
        };
        assert_eq!(
            SessionConfig::from_settings(&zero_pause).unwrap_err(),
            ConfigError::ZeroScanDutyCycle
        );

        // The pause only matters with a window configured.
        let continuous = Settings {
            scan_window_ms: None,
            scan_pause_ms: 0,
            ..Settings::default()
        };
        assert!(SessionConfig::from_settings(&continuous).is_ok());

        let bad_format = Settings {
            response_frame_len: 1,
            ..Settings::default()
        };
        assert!(matches!(
            SessionConfig::from_settings(&bad_format),
            Err(ConfigError::ResponseFormat { .. })
        ));
    }

    #[test]
    fn config_encodes_commands() {
        let config = SessionConfig::from_settings(&Settings::default()).unwrap();
        assert_eq!(config.poll_command, vec![0x01, 0x0D]);
        assert_eq!(config.enable_payload, vec![0x01]);
        assert_eq!(config.poll_interval, Duration::from_millis(1000));
        assert!(config.scan_duty_cycle.is_none());

        let no_enable = Settings {
            enable_payload: String::new(),
            ..Settings::default()
        };
        let config = SessionConfig::from_settings(&no_enable).unwrap();
        assert!(config.enable_payload.is_empty());
    }
}
