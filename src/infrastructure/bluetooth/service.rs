//! Pybricks Transport
//!
//! Plugs the WinRT scanner and connection into the controller.

use crate::controller::{Session, Transport};
use crate::domain::models::ScannedDevice;
use crate::infrastructure::bluetooth::{
    connection::BleConnection,
    protocol::{self, PybricksCommand},
    scanner::BleScanner,
};
use anyhow::Result;
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Debug, Default, Clone, Copy)]
pub struct PybricksTransport;

impl Transport for PybricksTransport {
    type Device = ScannedDevice;
    type Session = PybricksSession;

    async fn find_device(&self, name: &str, timeout: Duration) -> Result<Option<ScannedDevice>> {
        BleScanner::find(name, timeout).await
    }

    async fn open(&self, device: ScannedDevice, _timeout: Duration) -> Result<PybricksSession> {
        let connection = BleConnection::open(device.address).await?;
        Ok(PybricksSession { connection })
    }
}

pub struct PybricksSession {
    connection: BleConnection,
}

impl Session for PybricksSession {
    async fn transfer_payload(&self, payload: &[u8], _timeout: Duration) -> Result<()> {
        // The staged chunks live only for this call
        let commands = protocol::upload_sequence(payload, self.connection.capabilities())?;
        info!(
            "Uploading {} bytes in {} writes",
            payload.len(),
            commands.len()
        );
        for command in &commands {
            self.connection.write_command(command).await?;
        }
        Ok(())
    }

    async fn write(&self, bytes: &[u8]) -> Result<()> {
        for command in protocol::stdin_writes(bytes, self.connection.capabilities()) {
            self.connection.write_command(&command).await?;
        }
        debug!("stdin write {:02X?}", bytes);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if let Err(e) = self
            .connection
            .write_command(&PybricksCommand::StopUserProgram)
            .await
        {
            warn!("Could not stop hub program: {}", e);
        }
        self.connection.close()
    }

    fn is_connected(&self) -> bool {
        self.connection.is_connected()
    }
}
