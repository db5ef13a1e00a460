//! BLE Connection Module
//!
//! Opens the GATT link to a Pybricks hub and exposes the command/event
//! characteristic.

use crate::infrastructure::bluetooth::protocol::{
    self, HubCapabilities, PybricksCommand, COMMAND_EVENT_CHAR_UUID, HUB_CAPABILITIES_CHAR_UUID,
    SERVICE_UUID,
};
use anyhow::{bail, Result};
use tracing::{info, warn};
use windows::core::GUID;
use windows::Devices::Bluetooth::GenericAttributeProfile::{
    GattCharacteristic, GattCommunicationStatus, GattSession, GattWriteOption,
};
use windows::Devices::Bluetooth::{BluetoothCacheMode, BluetoothConnectionStatus, BluetoothLEDevice};
use windows::Storage::Streams::{DataReader, DataWriter, IBuffer};

pub fn parse_uuid(uuid_str: &str) -> Result<GUID> {
    let bytes = protocol::parse_uuid_bytes(uuid_str)?;
    Ok(GUID::from_u128(u128::from_be_bytes(bytes)))
}

fn buffer_to_vec(buffer: &IBuffer) -> Result<Vec<u8>> {
    let reader = DataReader::FromBuffer(buffer)?;
    let mut bytes = vec![0u8; reader.UnconsumedBufferLength()? as usize];
    reader.ReadBytes(&mut bytes)?;
    Ok(bytes)
}

/// An open GATT link to one hub
pub struct BleConnection {
    device: BluetoothLEDevice,
    gatt_session: Option<GattSession>,
    command: GattCharacteristic,
    capabilities: HubCapabilities,
}

impl BleConnection {
    /// Connect to a hub by Bluetooth address
    pub async fn open(address: u64) -> Result<Self> {
        info!("Connecting to hub {:#X}", address);
        let device = BluetoothLEDevice::FromBluetoothAddressAsync(address)?.await?;

        // Keeps Windows from dropping the link between writes
        let gatt_session = match Self::create_gatt_session(&device).await {
            Ok(session) => Some(session),
            Err(e) => {
                warn!("Failed to create GattSession, continuing anyway: {}", e);
                None
            }
        };

        let service_uuid = parse_uuid(SERVICE_UUID)?;
        let services = device
            .GetGattServicesForUuidWithCacheModeAsync(service_uuid, BluetoothCacheMode::Uncached)?
            .await?;
        if services.Status()? != GattCommunicationStatus::Success {
            bail!("Failed to get GATT services: {:?}", services.Status()?);
        }
        let services = services.Services()?;
        if services.Size()? == 0 {
            bail!("Pybricks service not found, is the hub running Pybricks firmware?");
        }
        let service = services.GetAt(0)?;

        let chars = service.GetCharacteristicsAsync()?.await?;
        if chars.Status()? != GattCommunicationStatus::Success {
            bail!("Failed to get characteristics");
        }
        let chars = chars.Characteristics()?;

        let command_uuid = parse_uuid(COMMAND_EVENT_CHAR_UUID)?;
        let caps_uuid = parse_uuid(HUB_CAPABILITIES_CHAR_UUID)?;
        let mut command = None;
        let mut caps_char = None;
        for i in 0..chars.Size()? {
            let c = chars.GetAt(i)?;
            let uuid = c.Uuid()?;
            if uuid == command_uuid {
                command = Some(c);
            } else if uuid == caps_uuid {
                caps_char = Some(c);
            }
        }
        let command =
            command.ok_or_else(|| anyhow::anyhow!("Command characteristic not found"))?;

        let capabilities = match caps_char {
            Some(c) => Self::read_capabilities(&c).await.unwrap_or_else(|e| {
                warn!("Could not read hub capabilities: {}", e);
                HubCapabilities::default()
            }),
            None => HubCapabilities::default(),
        };
        info!(
            "Hub connected, max write {} bytes",
            capabilities.max_write_size
        );

        Ok(Self {
            device,
            gatt_session,
            command,
            capabilities,
        })
    }

    async fn create_gatt_session(device: &BluetoothLEDevice) -> Result<GattSession> {
        let device_id = device.BluetoothDeviceId()?;
        let session = GattSession::FromDeviceIdAsync(&device_id)?.await?;
        session.SetMaintainConnection(true)?;
        Ok(session)
    }

    async fn read_capabilities(c: &GattCharacteristic) -> Result<HubCapabilities> {
        let result = c.ReadValueAsync()?.await?;
        if result.Status()? != GattCommunicationStatus::Success {
            bail!("Read failed: {:?}", result.Status()?);
        }
        protocol::parse_capabilities(&buffer_to_vec(&result.Value()?)?)
    }

    pub fn capabilities(&self) -> &HubCapabilities {
        &self.capabilities
    }

    /// One write-with-response on the command characteristic
    pub async fn write_command(&self, command: &PybricksCommand) -> Result<()> {
        let writer = DataWriter::new()?;
        writer.WriteBytes(&command.encode())?;
        let buffer = writer.DetachBuffer()?;

        let status = self
            .command
            .WriteValueWithOptionAsync(&buffer, GattWriteOption::WriteWithResponse)?
            .await?;
        if status != GattCommunicationStatus::Success {
            bail!("Write of {:?} failed: {:?}", command.opcode(), status);
        }
        Ok(())
    }

    pub fn is_connected(&self) -> bool {
        self.device
            .ConnectionStatus()
            .map(|s| s == BluetoothConnectionStatus::Connected)
            .unwrap_or(false)
    }

    /// Release the GATT session and the device handle
    pub fn close(&self) -> Result<()> {
        if let Some(session) = &self.gatt_session {
            session.Close()?;
        }
        self.device.Close()?;
        Ok(())
    }
}
