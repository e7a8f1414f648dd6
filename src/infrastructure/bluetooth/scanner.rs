//! BLE Scanner Module
//!
//! Starts and stops discovery on the host adapter and turns the adapter's
//! central event stream into [`AdapterEvent`]s.

use crate::domain::models::{AdapterState, DiscoveredPeripheral, PeripheralId};
use crate::infrastructure::bluetooth::adapter::AdapterEvent;
use btleplug::api::{Central, CentralEvent, CentralState, Peripheral as _, ScanFilter};
use btleplug::platform::Adapter;
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

pub fn adapter_state(state: CentralState) -> AdapterState {
    match state {
        CentralState::PoweredOn => AdapterState::PoweredOn,
        CentralState::PoweredOff => AdapterState::PoweredOff,
        _ => AdapterState::Unknown,
    }
}

/// State to assume when the adapter refuses to report one
pub fn adapter_state_from_error(error: &btleplug::Error) -> AdapterState {
    match error {
        btleplug::Error::PermissionDenied => AdapterState::Unauthorized,
        btleplug::Error::NotSupported(_) => AdapterState::Unsupported,
        _ => AdapterState::Unknown,
    }
}

/// BLE scanner bound to one host adapter
pub struct BleScanner {
    adapter: Adapter,
    event_sender: mpsc::UnboundedSender<AdapterEvent>,
    event_pump: Option<JoinHandle<()>>,
}

impl BleScanner {
    pub fn new(adapter: Adapter, event_sender: mpsc::UnboundedSender<AdapterEvent>) -> Self {
        Self {
            adapter,
            event_sender,
            event_pump: None,
        }
    }

    /// Forward advertisements, link drops and radio power changes until the
    /// adapter stream ends
    pub fn spawn_event_pump(&mut self) {
        if self.event_pump.is_some() {
            return;
        }
        let adapter = self.adapter.clone();
        let sender = self.event_sender.clone();

        self.event_pump = Some(tokio::spawn(async move {
            let mut events = match adapter.events().await {
                Ok(events) => events,
                Err(e) => {
                    warn!("Could not subscribe to adapter events: {}", e);
                    let _ = sender.send(AdapterEvent::ScanFailed {
                        reason: e.to_string(),
                    });
                    return;
                }
            };

            while let Some(event) = events.next().await {
                match event {
                    CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id) => {
                        let Ok(peripheral) = adapter.peripheral(&id).await else {
                            continue;
                        };
                        let properties = peripheral.properties().await.ok().flatten();
                        let (advertised_name, rssi) = match properties {
                            Some(props) => (props.local_name, props.rssi),
                            None => (None, None),
                        };
                        trace!(peripheral = %id, ?advertised_name, ?rssi, "Advertisement");

                        let discovered = DiscoveredPeripheral {
                            id: PeripheralId(id.to_string()),
                            advertised_name,
                            rssi,
                        };
                        if sender
                            .send(AdapterEvent::PeripheralDiscovered(discovered))
                            .is_err()
                        {
                            break;
                        }
                    }
                    CentralEvent::DeviceDisconnected(id) => {
                        debug!(peripheral = %id, "Device disconnected");
                        let _ = sender.send(AdapterEvent::Disconnected {
                            peripheral: PeripheralId(id.to_string()),
                            reason: None,
                        });
                    }
                    CentralEvent::StateUpdate(state) => {
                        let state = adapter_state(state);
                        info!(?state, "Adapter state update");
                        if sender.send(AdapterEvent::StateChanged(state)).is_err()
                        {
                            break;
                        }
                    }
                    _ => {}
                }
            }
            debug!("Adapter event stream ended");
        }));
    }

    /// Start an unfiltered scan; failures arrive as [`AdapterEvent::ScanFailed`]
    pub fn start(&self) {
        info!("Starting BLE scan");
        let adapter = self.adapter.clone();
        let sender = self.event_sender.clone();
        tokio::spawn(async move {
            if let Err(e) = adapter.start_scan(ScanFilter::default()).await {
                warn!("Failed to start scan: {}", e);
                let _ = sender.send(AdapterEvent::ScanFailed {
                    reason: e.to_string(),
                });
            }
        });
    }

    pub fn stop(&self) {
        info!("Stopping BLE scan");
        let adapter = self.adapter.clone();
        tokio::spawn(async move {
            if let Err(e) = adapter.stop_scan().await {
                debug!("Failed to stop scan cleanly: {}", e);
            }
        });
    }
}

impl Drop for BleScanner {
    fn drop(&mut self) {
        if let Some(pump) = self.event_pump.take() {
            pump.abort();
        }
    }
}
