//! Bluetooth Module
//!
//! BLE link to a hub running Pybricks firmware.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                   PybricksTransport                      │
//! │        (controller Transport / Session adapter)          │
//! └─────────────────────┬───────────────────────────────────┘
//!                       │
//!         ┌─────────────┼─────────────┐
//!         │             │             │
//!         ▼             ▼             ▼
//! ┌───────────┐  ┌────────────┐  ┌───────────┐
//! │  Scanner  │  │ Connection │  │ Protocol  │
//! │           │  │            │  │           │
//! │ - find by │  │ - GATT     │  │ - UUIDs   │
//! │   name    │  │ - writes   │  │ - upload  │
//! │           │  │            │  │ - stdin   │
//! └───────────┘  └────────────┘  └───────────┘
//! ```
//!
//! [`protocol`] is platform independent. The WinRT scanner, connection and
//! transport are only built on Windows.

pub mod protocol;

#[cfg(windows)]
pub mod connection;
#[cfg(windows)]
pub mod scanner;
#[cfg(windows)]
pub mod service;

#[cfg(windows)]
pub use service::PybricksTransport;
