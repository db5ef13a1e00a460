//! Simulated hub
//!
//! An in-process stand-in for the hub: it advertises a name, accepts a program
//! upload and then interprets command bytes exactly like the bundled hub
//! program does. Used when no BLE backend is available.

use crate::controller::{Session, Transport};
use crate::domain::commands::{CommandMap, MotorAction, MotorChannel};
use crate::domain::models::ScannedDevice;
use anyhow::{bail, Result};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::{debug, info};

/// Remote side of the link: one byte in, one motor action out, no reply.
#[derive(Debug)]
pub struct HubInterpreter {
    commands: Arc<CommandMap>,
    program: Option<Vec<u8>>,
    motors: HashMap<MotorChannel, MotorAction>,
}

impl HubInterpreter {
    pub fn new(commands: Arc<CommandMap>) -> Self {
        Self {
            commands,
            program: None,
            motors: HashMap::new(),
        }
    }

    pub fn load_program(&mut self, program: &[u8]) {
        self.program = Some(program.to_vec());
        self.motors.clear();
    }

    pub fn is_running(&self) -> bool {
        self.program.is_some()
    }

    /// Apply one stdin byte. Unknown bytes and bytes before a program runs are ignored.
    pub fn feed(&mut self, byte: u8) -> Option<(MotorChannel, MotorAction)> {
        self.program.as_ref()?;
        let command = self.commands.resolve(byte as char)?;
        let (channel, action) = self.commands.lookup(command)?;
        self.motors.insert(channel, action);
        Some((channel, action))
    }

    pub fn motor(&self, channel: MotorChannel) -> Option<MotorAction> {
        self.motors.get(&channel).copied()
    }

    fn stop_program(&mut self) {
        self.program = None;
        self.motors.clear();
    }
}

/// Latencies of the simulated link.
#[derive(Debug, Clone, Copy)]
pub struct SimulatedTimings {
    pub discovery: Duration,
    pub connect: Duration,
    pub transfer: Duration,
}

impl Default for SimulatedTimings {
    fn default() -> Self {
        Self {
            discovery: Duration::from_millis(800),
            connect: Duration::from_millis(400),
            transfer: Duration::from_millis(300),
        }
    }
}

fn lock(hub: &Mutex<HubInterpreter>) -> MutexGuard<'_, HubInterpreter> {
    hub.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Clone)]
pub struct SimulatedHub {
    name: String,
    timings: SimulatedTimings,
    interpreter: Arc<Mutex<HubInterpreter>>,
}

impl SimulatedHub {
    pub fn new(name: impl Into<String>, commands: Arc<CommandMap>) -> Self {
        Self {
            name: name.into(),
            timings: SimulatedTimings::default(),
            interpreter: Arc::new(Mutex::new(HubInterpreter::new(commands))),
        }
    }

    pub fn with_timings(mut self, timings: SimulatedTimings) -> Self {
        self.timings = timings;
        self
    }

    pub fn motor(&self, channel: MotorChannel) -> Option<MotorAction> {
        lock(&self.interpreter).motor(channel)
    }

    pub fn is_running(&self) -> bool {
        lock(&self.interpreter).is_running()
    }
}

impl Transport for SimulatedHub {
    type Device = ScannedDevice;
    type Session = SimulatedSession;

    async fn find_device(&self, name: &str, timeout: Duration) -> Result<Option<ScannedDevice>> {
        if name != self.name {
            tokio::time::sleep(timeout).await;
            return Ok(None);
        }
        tokio::time::sleep(self.timings.discovery).await;
        Ok(Some(ScannedDevice {
            name: self.name.clone(),
            address: 0x00_16_53_00_5C_01,
            signal_strength: -48,
        }))
    }

    async fn open(&self, device: ScannedDevice, _timeout: Duration) -> Result<SimulatedSession> {
        tokio::time::sleep(self.timings.connect).await;
        info!(name = %device.name, "simulated hub connected");
        Ok(SimulatedSession {
            interpreter: self.interpreter.clone(),
            transfer_delay: self.timings.transfer,
            connected: AtomicBool::new(true),
        })
    }
}

pub struct SimulatedSession {
    interpreter: Arc<Mutex<HubInterpreter>>,
    transfer_delay: Duration,
    connected: AtomicBool,
}

impl Session for SimulatedSession {
    async fn transfer_payload(&self, payload: &[u8], _timeout: Duration) -> Result<()> {
        if !self.is_connected() {
            bail!("simulated hub is not connected");
        }
        tokio::time::sleep(self.transfer_delay).await;
        lock(&self.interpreter).load_program(payload);
        info!(bytes = payload.len(), "simulated hub running program");
        Ok(())
    }

    async fn write(&self, bytes: &[u8]) -> Result<()> {
        if !self.is_connected() {
            bail!("simulated hub is not connected");
        }
        let mut hub = lock(&self.interpreter);
        for byte in bytes {
            match hub.feed(*byte) {
                Some((channel, action)) => {
                    info!("motor {} ({}) -> {:?}", channel.port(), channel.role(), action)
                }
                None => debug!(byte, "simulated hub ignored byte"),
            }
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.connected.store(false, Ordering::SeqCst);
        lock(&self.interpreter).stop_program();
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn interpreter() -> HubInterpreter {
        HubInterpreter::new(Arc::new(CommandMap::standard()))
    }

    #[test]
    fn bytes_before_program_are_ignored() {
        let mut hub = interpreter();
        assert_eq!(hub.feed(b'w'), None);
        assert_eq!(hub.motor(MotorChannel::B), None);
    }

    #[test]
    fn press_then_release_holds_arm() {
        let mut hub = interpreter();
        hub.load_program(b"program");
        assert_eq!(
            hub.feed(b'w'),
            Some((MotorChannel::B, MotorAction::Run { speed: -200 }))
        );
        hub.feed(b'e');
        assert_eq!(hub.motor(MotorChannel::B), Some(MotorAction::Hold));
        assert_eq!(hub.motor(MotorChannel::A), None);
    }

    #[test]
    fn unknown_bytes_change_nothing() {
        let mut hub = interpreter();
        hub.load_program(b"program");
        hub.feed(b'i');
        assert_eq!(hub.feed(b'x'), None);
        assert_eq!(hub.feed(0xFF), None);
        assert_eq!(
            hub.motor(MotorChannel::E),
            Some(MotorAction::Run { speed: 100 })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn wrong_name_is_not_found() {
        let hub = SimulatedHub::new("PY-SC", Arc::new(CommandMap::standard()));
        let found = hub
            .find_device("OTHER", Duration::from_secs(20))
            .await
            .unwrap();
        assert!(found.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn closed_session_rejects_writes() {
        let hub = SimulatedHub::new("PY-SC", Arc::new(CommandMap::standard()));
        let device = hub
            .find_device("PY-SC", Duration::from_secs(20))
            .await
            .unwrap()
            .unwrap();
        let session = hub.open(device, Duration::from_secs(20)).await.unwrap();
        session
            .transfer_payload(b"program", Duration::from_secs(30))
            .await
            .unwrap();
        session.write(b"c").await.unwrap();
        assert_eq!(
            hub.motor(MotorChannel::C),
            Some(MotorAction::Run { speed: 100 })
        );

        session.close().await.unwrap();
        assert!(!hub.is_running());
        assert!(session.write(b"c").await.is_err());
    }
}
