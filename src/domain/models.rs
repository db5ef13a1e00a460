use std::fmt;

/// Lifecycle state of the connection controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Idle,
    Discovering,
    Establishing,
    Transferring,
    Ready,
    Disconnecting,
    /// Terminal; nothing leaves this state.
    Closed,
}

impl ConnectionState {
    /// Short label for status lines.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Idle => "DISCONNECTED",
            Self::Discovering => "SEARCHING",
            Self::Establishing => "CONNECTING",
            Self::Transferring => "LOADING PROGRAM",
            Self::Ready => "READY",
            Self::Disconnecting => "DISCONNECTING",
            Self::Closed => "CLOSED",
        }
    }

    /// True while a connect sequence is in flight.
    pub fn is_connecting(&self) -> bool {
        matches!(
            self,
            Self::Discovering | Self::Establishing | Self::Transferring
        )
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// A device found during discovery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScannedDevice {
    pub name: String,
    pub address: u64,
    pub signal_strength: i16,
}

/// Events posted by the background context for the front end to drain.
#[derive(Debug, Clone)]
pub enum ControllerEvent {
    StateChanged(ConnectionState),
    LogMessage(StatusMessage),
}

#[derive(Debug, Clone)]
pub struct StatusMessage {
    pub message: String,
    pub severity: MessageSeverity,
}

impl StatusMessage {
    pub fn new(message: impl Into<String>, severity: MessageSeverity) -> Self {
        Self {
            message: message.into(),
            severity,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageSeverity {
    Info,
    Success,
    Warning,
    Error,
}
