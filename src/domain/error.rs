use crate::domain::models::AdapterState;
use thiserror::Error;

/// Failure to turn a configured command string into wire bytes.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EncodeError {
    #[error("command {0:?} contains no hex byte pairs")]
    EmptyOrInvalid(String),
}

/// Failure to decode one notification frame.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("unexpected frame length: expected {expected}, got {actual}")]
    UnexpectedLength { expected: usize, actual: usize },

    #[error("non-hex payload bytes {0:02X?}")]
    NonHexPayload([u8; 2]),
}

/// Invalid settings; surfaced once at startup.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid UUID {0:?}")]
    InvalidUuid(String),

    #[error("target name must not be empty")]
    EmptyTargetName,

    #[error("poll interval must be greater than zero")]
    ZeroPollInterval,

    #[error("scan window and scan pause must both be greater than zero")]
    ZeroScanDutyCycle,

    #[error("response frame of {frame_len} bytes cannot hold a value at offset {value_offset}")]
    ResponseFormat {
        frame_len: usize,
        value_offset: usize,
    },

    #[error("invalid poll command: {0}")]
    PollCommand(EncodeError),

    #[error("invalid enable payload: {0}")]
    EnablePayload(EncodeError),
}

/// Everything the session reports to its observer.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ErrorKind {
    #[error("Bluetooth adapter unavailable ({0:?})")]
    AdapterUnavailable(AdapterState),

    #[error("scan failed: {0}")]
    ScanFailed(String),

    #[error("connection to {peripheral} failed: {reason}")]
    ConnectFailed { peripheral: String, reason: String },

    #[error("discovery failed: {0}")]
    DiscoveryFailed(String),

    #[error("notification subscription failed: {0}")]
    SubscribeFailed(String),

    #[error("enable write failed: {0}")]
    EnableWriteFailed(String),

    #[error("poll write failed: {0}")]
    PollWriteFailed(String),

    #[error("link lost: {0}")]
    LinkLost(String),

    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl ErrorKind {
    /// Fatal errors stop the session until something external changes.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::AdapterUnavailable(_) | Self::ScanFailed(_) | Self::Config(_)
        )
    }
}
