use crate::domain::error::ErrorKind;
use crate::domain::models::{
    CharacteristicHandle, MetricSample, PeripheralId, ServiceHandle, SessionState,
};
use crate::infrastructure::bluetooth::adapter::BleAdapter;
use crate::infrastructure::bluetooth::session::SessionObserver;
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdapterCall {
    Scan,
    StopScan,
    Connect(PeripheralId),
    Disconnect(PeripheralId),
    DiscoverServices(PeripheralId),
    DiscoverCharacteristics(ServiceHandle),
    SetNotify(CharacteristicHandle, bool),
    Write(CharacteristicHandle, Vec<u8>, bool),
}

/// Adapter that only records requests; tests deliver the callbacks.
#[derive(Debug, Clone, Default)]
pub struct MockBleAdapter {
    calls: Arc<Mutex<Vec<AdapterCall>>>,
}

impl MockBleAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<AdapterCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn take_calls(&self) -> Vec<AdapterCall> {
        std::mem::take(&mut *self.calls.lock().unwrap())
    }

    pub fn count(&self, pred: impl Fn(&AdapterCall) -> bool) -> usize {
        self.calls.lock().unwrap().iter().filter(|c| pred(*c)).count()
    }

    pub fn writes(&self) -> usize {
        self.count(|c| matches!(c, AdapterCall::Write(..)))
    }

    fn record(&self, call: AdapterCall) {
        self.calls.lock().unwrap().push(call);
    }
}

impl BleAdapter for MockBleAdapter {
    fn scan(&mut self) {
        self.record(AdapterCall::Scan);
    }

    fn stop_scan(&mut self) {
        self.record(AdapterCall::StopScan);
    }

    fn connect(&mut self, peripheral: &PeripheralId) {
        self.record(AdapterCall::Connect(peripheral.clone()));
    }

    fn disconnect(&mut self, peripheral: &PeripheralId) {
        self.record(AdapterCall::Disconnect(peripheral.clone()));
    }

    fn discover_services(&mut self, peripheral: &PeripheralId) {
        self.record(AdapterCall::DiscoverServices(peripheral.clone()));
    }

    fn discover_characteristics(&mut self, service: &ServiceHandle) {
        self.record(AdapterCall::DiscoverCharacteristics(service.clone()));
    }

    fn set_notify(&mut self, characteristic: &CharacteristicHandle, enabled: bool) {
        self.record(AdapterCall::SetNotify(characteristic.clone(), enabled));
    }

    fn write(&mut self, characteristic: &CharacteristicHandle, value: &[u8], with_response: bool) {
        self.record(AdapterCall::Write(
            characteristic.clone(),
            value.to_vec(),
            with_response,
        ));
    }
}

/// Observer that keeps everything it is told.
#[derive(Debug, Default)]
pub struct RecordingObserver {
    pub samples: Vec<MetricSample>,
    pub states: Vec<SessionState>,
    pub fatal: Vec<ErrorKind>,
    pub recoverable: Vec<ErrorKind>,
}

impl SessionObserver for RecordingObserver {
    fn on_metric_sample(&mut self, sample: MetricSample) {
        self.samples.push(sample);
    }

    fn on_session_state_changed(&mut self, state: SessionState) {
        self.states.push(state);
    }

    fn on_fatal_error(&mut self, error: ErrorKind) {
        self.fatal.push(error);
    }

    fn on_recoverable_error(&mut self, error: ErrorKind) {
        self.recoverable.push(error);
    }
}
