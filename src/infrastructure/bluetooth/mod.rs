//! Bluetooth Module
//!
//! Finds the OBD-II BLE dongle, keeps a session to it and polls vehicle
//! speed.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                     BluetoothService                      │
//! │  (single task: commands, adapter events, timer expiries)  │
//! └─────────────────────┬────────────────────────────────────┘
//!                       │
//!                       ▼
//! ┌──────────────────────────────────────────────────────────┐
//! │                         Session                           │
//! │            (state machine, owns policy + scheduler)       │
//! └───────┬──────────────────┬─────────────────┬─────────────┘
//!         │                  │                 │
//!         ▼                  ▼                 ▼
//! ┌──────────────┐  ┌────────────────┐  ┌────────────┐
//! │ ScanPolicy   │  │ PollScheduler  │  │  Protocol  │
//! │ - matching   │  │ - poll timer   │  │ - encode   │
//! │ - duty cycle │  │ - generations  │  │ - decode   │
//! │ - reconnect  │  │                │  │ - UUIDs    │
//! └──────────────┘  └────────────────┘  └────────────┘
//!
//!   BleAdapter (port) ◀── BtleplugAdapter (connection + scanner)
//! ```
//!
//! ## Modules
//!
//! - [`adapter`] - Adapter port and the events it reports
//! - [`protocol`] - Command encoding, response decoding, UUID parsing
//! - [`session`] - Session state machine and observer trait
//! - [`scheduler`] - Poll timer
//! - [`policy`] - Scan/connect policy
//! - [`scanner`] - btleplug discovery and central events
//! - [`connection`] - btleplug-backed adapter implementation
//! - [`service`] - Main service driver

pub mod adapter;
pub mod connection;
pub mod policy;
pub mod protocol;
pub mod scanner;
pub mod scheduler;
pub mod service;
pub mod session;

#[cfg(test)]
pub mod mock;

// Re-export main service for convenience
pub use connection::BtleplugAdapter;
pub use service::{BluetoothService, ChannelObserver, SessionHandle};
