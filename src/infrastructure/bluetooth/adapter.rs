//! BLE Adapter Port
//!
//! The session never talks to a radio stack directly. It issues
//! fire-and-forget requests through [`BleAdapter`] and later receives each
//! result as an [`AdapterEvent`] on the event queue the adapter was built
//! with.

use crate::domain::models::{
    AdapterState, CharacteristicHandle, DiscoveredPeripheral, PeripheralId, ServiceHandle,
};

/// Everything the adapter can report, one variant per callback
#[derive(Debug, Clone)]
pub enum AdapterEvent {
    StateChanged(AdapterState),
    ScanFailed {
        reason: String,
    },
    PeripheralDiscovered(DiscoveredPeripheral),
    Connected(PeripheralId),
    ConnectFailed {
        peripheral: PeripheralId,
        reason: String,
    },
    /// Also delivered unsolicited on link loss
    Disconnected {
        peripheral: PeripheralId,
        reason: Option<String>,
    },
    ServicesDiscovered {
        peripheral: PeripheralId,
        services: Vec<ServiceHandle>,
    },
    ServiceDiscoveryFailed {
        peripheral: PeripheralId,
        reason: String,
    },
    CharacteristicsDiscovered {
        service: ServiceHandle,
        characteristics: Vec<CharacteristicHandle>,
    },
    CharacteristicDiscoveryFailed {
        service: ServiceHandle,
        reason: String,
    },
    NotifyStateUpdated {
        characteristic: CharacteristicHandle,
        enabled: bool,
        result: Result<(), String>,
    },
    WriteCompleted {
        characteristic: CharacteristicHandle,
        result: Result<(), String>,
    },
    ValueUpdated {
        characteristic: CharacteristicHandle,
        value: Vec<u8>,
    },
}

impl AdapterEvent {
    /// Peripheral this event concerns, if any
    pub fn peripheral(&self) -> Option<&PeripheralId> {
        match self {
            Self::StateChanged(_) | Self::ScanFailed { .. } => None,
            Self::PeripheralDiscovered(p) => Some(&p.id),
            Self::Connected(peripheral)
            | Self::ConnectFailed { peripheral, .. }
            | Self::Disconnected { peripheral, .. }
            | Self::ServicesDiscovered { peripheral, .. }
            | Self::ServiceDiscoveryFailed { peripheral, .. } => Some(peripheral),
            Self::CharacteristicsDiscovered { service, .. }
            | Self::CharacteristicDiscoveryFailed { service, .. } => Some(&service.peripheral),
            Self::NotifyStateUpdated { characteristic, .. }
            | Self::WriteCompleted { characteristic, .. }
            | Self::ValueUpdated { characteristic, .. } => Some(&characteristic.peripheral),
        }
    }
}

/// Radio stack operations used by the session
///
/// Every method returns immediately; completion (or failure) arrives later
/// as an [`AdapterEvent`].
pub trait BleAdapter {
    /// Scan for all peripherals, no service filter
    fn scan(&mut self);
    fn stop_scan(&mut self);
    fn connect(&mut self, peripheral: &PeripheralId);
    fn disconnect(&mut self, peripheral: &PeripheralId);
    fn discover_services(&mut self, peripheral: &PeripheralId);
    fn discover_characteristics(&mut self, service: &ServiceHandle);
    fn set_notify(&mut self, characteristic: &CharacteristicHandle, enabled: bool);
    fn write(&mut self, characteristic: &CharacteristicHandle, value: &[u8], with_response: bool);
}
