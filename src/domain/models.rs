use crate::domain::error::{DecodeError, ErrorKind};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Power/authorization state reported by the BLE adapter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdapterState {
    PoweredOff,
    Unsupported,
    Unauthorized,
    // btleplug has no resetting state; kept for adapters that report one
    #[allow(dead_code)]
    Resetting,
    Unknown,
    PoweredOn,
}

impl AdapterState {
    /// Off, unsupported, or unauthorized; nothing can be done until the
    /// adapter changes state externally.
    pub fn is_unavailable(self) -> bool {
        matches!(
            self,
            Self::PoweredOff | Self::Unsupported | Self::Unauthorized
        )
    }
}

/// Opaque, stable identifier of a peripheral as handed out by the adapter
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PeripheralId(pub String);

impl fmt::Display for PeripheralId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeripheralId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// One advertisement seen while scanning
#[derive(Debug, Clone)]
pub struct DiscoveredPeripheral {
    pub id: PeripheralId,
    pub advertised_name: Option<String>,
    pub rssi: Option<i16>,
}

/// A GATT service on a specific peripheral
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ServiceHandle {
    pub peripheral: PeripheralId,
    pub uuid: Uuid,
}

/// A GATT characteristic on a specific peripheral
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CharacteristicHandle {
    pub peripheral: PeripheralId,
    pub service_uuid: Uuid,
    pub uuid: Uuid,
}

/// Lifecycle of the single polling session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Scanning,
    Connecting,
    DiscoveringServices,
    DiscoveringCharacteristics,
    Subscribing,
    Polling,
    Disconnected,
}

impl SessionState {
    /// States in which a link to the target exists (or existed until the
    /// disconnect callback arrives).
    pub fn is_linked(self) -> bool {
        matches!(
            self,
            Self::DiscoveringServices
                | Self::DiscoveringCharacteristics
                | Self::Subscribing
                | Self::Polling
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpeedUnit {
    #[default]
    KilometersPerHour,
    MilesPerHour,
}

impl SpeedUnit {
    pub fn suffix(self) -> &'static str {
        match self {
            Self::KilometersPerHour => "km/h",
            Self::MilesPerHour => "mph",
        }
    }
}

const KM_PER_MILE: f64 = 1.609_344;

/// One decoded notification frame
#[derive(Debug, Clone, PartialEq)]
pub struct MetricSample {
    pub raw_bytes: Vec<u8>,
    pub decoded_value: Option<u8>,
    pub unit: SpeedUnit,
    pub decode_error: Option<DecodeError>,
}

impl MetricSample {
    pub fn decoded(raw_bytes: Vec<u8>, value: u8, unit: SpeedUnit) -> Self {
        Self {
            raw_bytes,
            decoded_value: Some(value),
            unit,
            decode_error: None,
        }
    }

    pub fn malformed(raw_bytes: Vec<u8>, error: DecodeError, unit: SpeedUnit) -> Self {
        Self {
            raw_bytes,
            decoded_value: None,
            unit,
            decode_error: Some(error),
        }
    }

    /// Decoded value converted to `unit`
    pub fn value_in(&self, unit: SpeedUnit) -> Option<f64> {
        let value = f64::from(self.decoded_value?);
        Some(match (self.unit, unit) {
            (SpeedUnit::KilometersPerHour, SpeedUnit::MilesPerHour) => value / KM_PER_MILE,
            (SpeedUnit::MilesPerHour, SpeedUnit::KilometersPerHour) => value * KM_PER_MILE,
            _ => value,
        })
    }
}

/// Events forwarded from the session to the application
#[derive(Debug, Clone)]
pub enum AppEvent {
    MetricSample(MetricSample),
    SessionState(SessionState),
    LogMessage(StatusMessage),
}

#[derive(Debug, Clone)]
pub struct StatusMessage {
    pub message: String,
    pub severity: MessageSeverity,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageSeverity {
    Warning,
    Error,
}

impl StatusMessage {
    pub fn from_error(error: &ErrorKind) -> Self {
        Self {
            message: error.to_string(),
            severity: if error.is_fatal() {
                MessageSeverity::Error
            } else {
                MessageSeverity::Warning
            },
        }
    }
}
