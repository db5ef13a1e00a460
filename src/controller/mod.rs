//! Connection Controller
//!
//! Finds the hub, opens a session, uploads the program and then forwards
//! one-byte motor commands to it.
//!
//! ## Architecture
//!
//! ```text
//!  front end thread                    background thread
//! ┌──────────────────┐   Request    ┌─────────────────────────┐
//! │    Controller     │ ───────────▶ │     BackgroundTask      │
//! │ connect / send /  │  (mpsc, FIFO) │ current_thread runtime  │
//! │ disconnect/close  │              │  ├─ ConnectSequence task │
//! └──────────────────┘              │  └─ Transport / Session │
//!          ▲                          └───────────┬─────────────┘
//!          │         ControllerEvent (mpsc)        │
//!          └───────────────────────────────────────┘
//! ```
//!
//! The front end never touches the session. It reads state changes and status
//! messages from the event channel and gets the outcome of `connect` through a
//! one-shot reply closure.

mod shared;
pub mod transport;
mod worker;

pub use transport::{Session, Timeouts, Transport};
pub use worker::BackgroundTask;

use crate::domain::commands::CommandMap;
use crate::domain::error::ConnectError;
use crate::domain::models::{ConnectionState, ControllerEvent};
use anyhow::Context;
use shared::Shared;
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use worker::Request;

/// Static inputs of a controller: what to look for, how long to wait, what to upload.
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    pub device_name: String,
    pub timeouts: Timeouts,
    pub payload: Arc<[u8]>,
}

type ReplyFn = Box<dyn FnOnce(Result<(), ConnectError>) + Send + 'static>;

/// Outcome delivery for one `connect` call.
///
/// Fires exactly once. If it is dropped unsent, for example because the
/// background context stopped mid-attempt, it reports `BusyOrClosing`.
pub struct ConnectReply {
    callback: Option<ReplyFn>,
}

impl ConnectReply {
    pub fn new(callback: impl FnOnce(Result<(), ConnectError>) + Send + 'static) -> Self {
        Self {
            callback: Some(Box::new(callback)),
        }
    }

    pub fn send(mut self, result: Result<(), ConnectError>) {
        if let Some(callback) = self.callback.take() {
            callback(result);
        }
    }
}

impl Drop for ConnectReply {
    fn drop(&mut self) {
        if let Some(callback) = self.callback.take() {
            callback(Err(ConnectError::BusyOrClosing));
        }
    }
}

pub type EventReceiver = mpsc::UnboundedReceiver<ControllerEvent>;

/// Front-end handle. Every method returns immediately.
pub struct Controller<T: Transport> {
    shared: Arc<Shared<T::Session>>,
    requests: mpsc::UnboundedSender<Request>,
    commands: Arc<CommandMap>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl<T: Transport> Controller<T> {
    /// Build a controller and its background task without starting anything.
    ///
    /// The task must be driven on a single-threaded runtime; [`Controller::spawn`]
    /// is the usual way to do that.
    pub fn new(
        transport: T,
        config: ControllerConfig,
        commands: Arc<CommandMap>,
    ) -> (Self, EventReceiver, BackgroundTask<T>) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (request_tx, request_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared::new(event_tx));
        let task = BackgroundTask::new(transport, config, shared.clone(), request_rx);

        let controller = Self {
            shared,
            requests: request_tx,
            commands,
            thread: Mutex::new(None),
        };
        (controller, event_rx, task)
    }

    /// Start the controller with its own thread running a `current_thread` runtime.
    pub fn spawn(
        transport: T,
        config: ControllerConfig,
        commands: Arc<CommandMap>,
    ) -> anyhow::Result<(Self, EventReceiver)> {
        let (controller, events, task) = Self::new(transport, config, commands);

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .context("Failed to create tokio runtime for the controller")?;

        let handle = std::thread::Builder::new()
            .name("hub-controller".to_string())
            .spawn(move || runtime.block_on(task.run()))
            .context("Failed to start controller thread")?;

        *controller
            .thread
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(handle);
        Ok((controller, events))
    }

    /// Start a connect sequence. `on_done` runs exactly once: synchronously if
    /// the request is rejected, otherwise on the background thread.
    pub fn connect(&self, on_done: impl FnOnce(Result<(), ConnectError>) + Send + 'static) {
        let reply = ConnectReply::new(on_done);

        if self.shared.is_closing() {
            reply.send(Err(ConnectError::BusyOrClosing));
            return;
        }
        if !self
            .shared
            .advance(ConnectionState::Idle, ConnectionState::Discovering)
        {
            debug!(state = %self.shared.state(), "connect rejected, controller busy");
            reply.send(Err(ConnectError::BusyOrClosing));
            return;
        }

        // A failed send drops the reply, which reports BusyOrClosing.
        if self.requests.send(Request::Connect(reply)).is_err() {
            warn!("controller background task is gone");
            self.shared.transition(ConnectionState::Closed);
        }
    }

    /// Forward one command character. Silently dropped unless the hub is ready
    /// and the character belongs to the command map.
    pub fn send(&self, command: char) {
        let Some(command) = self.commands.resolve(command) else {
            debug!(?command, "ignoring unknown command");
            return;
        };
        if !self.shared.is_connected() {
            return;
        }
        let _ = self.requests.send(Request::Send(command));
    }

    /// Drop the session, or cancel a connect attempt in flight. No-op otherwise.
    pub fn disconnect(&self) {
        let state = self.shared.state();
        if state != ConnectionState::Ready && !state.is_connecting() {
            return;
        }
        self.shared.set_connected(false);
        let _ = self.requests.send(Request::Disconnect);
    }

    /// Reject future connects, tear down any session and stop the background
    /// context. Does not wait; see [`Controller::join`].
    pub fn close(&self) {
        if !self.shared.begin_closing() {
            return;
        }
        info!("closing controller");
        self.shared.set_connected(false);
        self.shared.transition(ConnectionState::Closed);
        let _ = self.requests.send(Request::Disconnect);
        let _ = self.requests.send(Request::Shutdown);
    }

    /// Wait for the background thread started by [`Controller::spawn`] to exit.
    pub fn join(&self) {
        let handle = self
            .thread
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                warn!("controller thread panicked");
            }
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.state()
    }

    pub fn is_ready(&self) -> bool {
        self.shared.is_connected()
    }
}

impl<T: Transport> Drop for Controller<T> {
    fn drop(&mut self) {
        self.close();
    }
}
