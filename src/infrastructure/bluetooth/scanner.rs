//! BLE Scanner Module
//!
//! Finds a Pybricks hub by the local name it advertises.

use crate::domain::models::ScannedDevice;
use anyhow::Result;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info};
use windows::Devices::Bluetooth::Advertisement::{
    BluetoothLEAdvertisementReceivedEventArgs, BluetoothLEAdvertisementWatcher,
    BluetoothLEScanningMode,
};
use windows::Foundation::TypedEventHandler;

/// Advertisement watcher that reports devices with a matching name
pub struct BleScanner {
    watcher: Option<BluetoothLEAdvertisementWatcher>,
}

impl BleScanner {
    pub fn new() -> Self {
        Self { watcher: None }
    }

    /// Start scanning; every advertisement named `name` is sent to `found`
    pub fn start(&mut self, name: &str, found: mpsc::UnboundedSender<ScannedDevice>) -> Result<()> {
        self.stop()?;
        info!("Starting BLE scan for hub {:?}", name);

        let watcher = BluetoothLEAdvertisementWatcher::new()?;
        watcher.SetScanningMode(BluetoothLEScanningMode::Active)?;

        let target = name.to_string();
        let handler = TypedEventHandler::new(
            move |_: windows::core::Ref<BluetoothLEAdvertisementWatcher>,
                  args: windows::core::Ref<BluetoothLEAdvertisementReceivedEventArgs>| {
                if let Some(args) = args.as_ref() {
                    let local_name = args.Advertisement()?.LocalName()?.to_string();
                    if local_name == target {
                        let device = ScannedDevice {
                            name: local_name,
                            address: args.BluetoothAddress()?,
                            signal_strength: args.RawSignalStrengthInDBm()?,
                        };
                        let _ = found.send(device);
                    }
                }
                Ok(())
            },
        );

        watcher.Received(&handler)?;
        watcher.Start()?;
        self.watcher = Some(watcher);
        Ok(())
    }

    pub fn stop(&mut self) -> Result<()> {
        if let Some(watcher) = self.watcher.take() {
            debug!("Stopping BLE scan");
            watcher.Stop()?;
        }
        Ok(())
    }

    /// Scan until the first match or until `timeout` passes
    pub async fn find(name: &str, timeout: Duration) -> Result<Option<ScannedDevice>> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut scanner = Self::new();
        scanner.start(name, tx)?;

        let found = tokio::time::timeout(timeout, rx.recv()).await.ok().flatten();
        scanner.stop()?;

        if let Some(device) = &found {
            info!(
                "Found {} at {:#X} ({} dBm)",
                device.name, device.address, device.signal_strength
            );
        }
        Ok(found)
    }
}

impl Drop for BleScanner {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}
