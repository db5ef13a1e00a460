//! Transport seam
//!
//! The controller only knows how to find a device by name and drive a session
//! through it. BLE, the simulator and test fakes all plug in here.

use std::fmt;
use std::future::Future;
use std::time::Duration;

/// Discovery and session factory for one kind of link.
pub trait Transport: Send + Sync + 'static {
    /// Opaque reference to a discovered device.
    type Device: fmt::Debug + Send + 'static;
    type Session: Session;

    /// Look for a device advertising `name`. `Ok(None)` means not found in time.
    fn find_device(
        &self,
        name: &str,
        timeout: Duration,
    ) -> impl Future<Output = anyhow::Result<Option<Self::Device>>> + Send;

    /// Open a session to a previously discovered device.
    fn open(
        &self,
        device: Self::Device,
        timeout: Duration,
    ) -> impl Future<Output = anyhow::Result<Self::Session>> + Send;
}

/// An open link to one device.
pub trait Session: Send + Sync + 'static {
    /// Stage and start the payload on the device. Any staging storage is
    /// released before this returns, whatever the outcome.
    fn transfer_payload(
        &self,
        payload: &[u8],
        timeout: Duration,
    ) -> impl Future<Output = anyhow::Result<()>> + Send;

    fn write(&self, bytes: &[u8]) -> impl Future<Output = anyhow::Result<()>> + Send;

    fn close(&self) -> impl Future<Output = anyhow::Result<()>> + Send;

    /// Whether the underlying link still looks alive.
    fn is_connected(&self) -> bool {
        true
    }
}

/// Bounded wait for each phase of the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    pub discovery: Duration,
    pub connect: Duration,
    pub transfer: Duration,
    /// Per command write; a slow link must not stall teardown.
    pub write: Duration,
    pub disconnect: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            discovery: Duration::from_secs(20),
            connect: Duration::from_secs(20),
            transfer: Duration::from_secs(30),
            write: Duration::from_secs(2),
            disconnect: Duration::from_secs(5),
        }
    }
}
