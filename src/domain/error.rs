use thiserror::Error;

/// Reasons a connect sequence can fail. Each carries the message shown to the user.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnectError {
    #[error("device not found: no hub named {name:?} is advertising")]
    DeviceNotFound { name: String },

    #[error("connection timed out: check that the hub is on and running Pybricks")]
    ConnectTimeout,

    #[error("program transfer timed out")]
    TransferTimeout,

    #[error("transport failure: {0}")]
    TransportFailure(String),

    #[error("controller is busy or closing")]
    BusyOrClosing,
}

impl ConnectError {
    /// Wrap a transport error, keeping its context chain in the message.
    pub fn transport(err: &anyhow::Error) -> Self {
        Self::TransportFailure(format!("{:#}", err))
    }
}
