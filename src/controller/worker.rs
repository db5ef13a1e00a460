//! Background side of the controller
//!
//! Requests arrive in submission order on one channel. Writes and teardown run
//! inline so they stay ordered; a connect sequence runs as its own task so the
//! loop can still take a disconnect or shutdown while it is in flight.

use super::shared::Shared;
use super::transport::{Session, Transport};
use super::{ConnectReply, ControllerConfig};
use crate::domain::commands::Command;
use crate::domain::error::ConnectError;
use crate::domain::models::{ConnectionState, MessageSeverity};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, error, info, warn};

pub(crate) enum Request {
    Connect(ConnectReply),
    Send(Command),
    Disconnect,
    Shutdown,
}

struct PendingConnect {
    handle: JoinHandle<()>,
    abort: watch::Sender<bool>,
}

/// Drives every I/O operation of one controller. Run it on a single-threaded
/// runtime; [`super::Controller::spawn`] does that on a dedicated thread.
pub struct BackgroundTask<T: Transport> {
    transport: Arc<T>,
    config: Arc<ControllerConfig>,
    shared: Arc<Shared<T::Session>>,
    requests: mpsc::UnboundedReceiver<Request>,
    pending: Option<PendingConnect>,
}

impl<T: Transport> BackgroundTask<T> {
    pub(crate) fn new(
        transport: T,
        config: ControllerConfig,
        shared: Arc<Shared<T::Session>>,
        requests: mpsc::UnboundedReceiver<Request>,
    ) -> Self {
        Self {
            transport: Arc::new(transport),
            config: Arc::new(config),
            shared,
            requests,
            pending: None,
        }
    }

    /// Process requests until shutdown, then release everything.
    pub async fn run(mut self) {
        info!(device = %self.config.device_name, "controller background task started");

        while let Some(request) = self.requests.recv().await {
            match request {
                Request::Connect(reply) => self.start_connect(reply),
                Request::Send(command) => self.dispatch(command).await,
                Request::Disconnect => self.disconnect().await,
                Request::Shutdown => break,
            }
        }

        self.disconnect().await;
        self.shared.transition(ConnectionState::Closed);
        info!("controller background task stopped");
    }

    fn start_connect(&mut self, reply: ConnectReply) {
        if let Some(pending) = &self.pending {
            if !pending.handle.is_finished() {
                warn!("connect requested while another attempt is running");
                reply.send(Err(ConnectError::BusyOrClosing));
                return;
            }
        }

        let (abort, aborted) = watch::channel(false);
        let sequence = ConnectSequence {
            transport: self.transport.clone(),
            config: self.config.clone(),
            shared: self.shared.clone(),
            aborted,
        };
        let handle = tokio::spawn(sequence.run(reply));
        self.pending = Some(PendingConnect { handle, abort });
    }

    async fn dispatch(&mut self, command: Command) {
        if self.shared.state() != ConnectionState::Ready {
            debug!(%command, "dropping command, hub not ready");
            return;
        }
        let Some(session) = self.shared.session() else {
            debug!(%command, "dropping command, no session");
            return;
        };

        match time::timeout(self.config.timeouts.write, session.write(&command.encode())).await {
            Ok(Ok(())) => debug!(%command, "command sent"),
            Ok(Err(e)) => {
                warn!(%command, "command write failed: {:#}", e);
                if !session.is_connected() {
                    self.shared
                        .log("Connection to hub lost", MessageSeverity::Warning);
                    self.teardown().await;
                }
            }
            Err(_) => warn!(%command, "command write timed out"),
        }
    }

    /// Cancel any connect attempt in flight, then tear down the session.
    async fn disconnect(&mut self) {
        if let Some(mut pending) = self.pending.take() {
            if !pending.handle.is_finished() {
                info!("cancelling connect attempt");
                // Nothing is open yet while discovering; the attempt settles at Idle itself
                if self.shared.state() != ConnectionState::Discovering {
                    self.shared.transition(ConnectionState::Disconnecting);
                }
                pending.abort.send_replace(true);
                if time::timeout(self.config.timeouts.disconnect, &mut pending.handle)
                    .await
                    .is_err()
                {
                    warn!("connect attempt did not stop in time, aborting it");
                    pending.handle.abort();
                }
                self.shared.transition(ConnectionState::Idle);
            }
        }
        self.teardown().await;
    }

    /// Best-effort session close. Failures are logged and swallowed.
    async fn teardown(&mut self) {
        let Some(session) = self.shared.take_session() else {
            return;
        };

        self.shared.transition(ConnectionState::Disconnecting);
        close_quietly(session.as_ref(), self.config.timeouts.disconnect).await;
        self.shared.transition(ConnectionState::Idle);
        self.shared.log("Disconnected from hub", MessageSeverity::Info);
    }
}

async fn close_quietly<S: Session>(session: &S, limit: Duration) {
    match time::timeout(limit, session.close()).await {
        Ok(Ok(())) => info!("session closed"),
        Ok(Err(e)) => warn!("ignoring error while closing session: {:#}", e),
        Err(_) => warn!("session close timed out"),
    }
}

enum Phase<T> {
    Done(T),
    TimedOut,
    Aborted,
}

struct ConnectSequence<T: Transport> {
    transport: Arc<T>,
    config: Arc<ControllerConfig>,
    shared: Arc<Shared<T::Session>>,
    aborted: watch::Receiver<bool>,
}

impl<T: Transport> ConnectSequence<T> {
    async fn run(self, reply: ConnectReply) {
        let result = match self.establish().await {
            Ok(session) => self.finish(session).await,
            Err(err) => Err(err),
        };

        match &result {
            Ok(()) => {
                info!("hub ready");
                self.shared
                    .log("System ready, control enabled", MessageSeverity::Success);
            }
            Err(err) => {
                error!("connect failed: {}", err);
                self.shared.transition(ConnectionState::Idle);
                self.shared.log(err.to_string(), MessageSeverity::Error);
            }
        }
        reply.send(result);
    }

    async fn establish(&self) -> Result<Arc<T::Session>, ConnectError> {
        let name = self.config.device_name.as_str();
        let timeouts = self.config.timeouts;

        info!(hub = name, "searching for hub");
        self.shared
            .log(format!("Searching for hub {}...", name), MessageSeverity::Info);

        let find = self.transport.find_device(name, timeouts.discovery);
        let device = match self.phase(timeouts.discovery, find).await {
            Phase::Done(Ok(Some(device))) => device,
            Phase::Done(Ok(None)) | Phase::TimedOut => {
                return Err(ConnectError::DeviceNotFound {
                    name: name.to_string(),
                })
            }
            Phase::Done(Err(e)) => return Err(ConnectError::transport(&e)),
            Phase::Aborted => return Err(self.abort_error()),
        };

        info!(?device, "hub found");
        self.shared
            .log(format!("Found {}", name), MessageSeverity::Info);
        self.step(ConnectionState::Discovering, ConnectionState::Establishing)?;

        let open = self.transport.open(device, timeouts.connect);
        let session = match self.phase(timeouts.connect, open).await {
            Phase::Done(Ok(session)) => Arc::new(session),
            Phase::Done(Err(e)) => return Err(ConnectError::transport(&e)),
            Phase::TimedOut => return Err(ConnectError::ConnectTimeout),
            Phase::Aborted => return Err(self.abort_error()),
        };

        if let Err(err) = self.step(ConnectionState::Establishing, ConnectionState::Transferring) {
            close_quietly(session.as_ref(), timeouts.disconnect).await;
            return Err(err);
        }

        info!(bytes = self.config.payload.len(), "uploading program");
        self.shared
            .log("Uploading program to hub...", MessageSeverity::Info);

        let transfer = session.transfer_payload(&self.config.payload, timeouts.transfer);
        let outcome = match self.phase(timeouts.transfer, transfer).await {
            Phase::Done(Ok(())) => Ok(()),
            Phase::Done(Err(e)) => Err(ConnectError::transport(&e)),
            Phase::TimedOut => Err(ConnectError::TransferTimeout),
            Phase::Aborted => Err(self.abort_error()),
        };

        match outcome {
            Ok(()) => Ok(session),
            Err(err) => {
                close_quietly(session.as_ref(), timeouts.disconnect).await;
                Err(err)
            }
        }
    }

    /// Publish the session and declare readiness.
    async fn finish(&self, session: Arc<T::Session>) -> Result<(), ConnectError> {
        self.shared.store_session(session);
        if self.shared.advance(ConnectionState::Transferring, ConnectionState::Ready) {
            self.shared.set_connected(true);
            return Ok(());
        }

        if let Some(session) = self.shared.take_session() {
            close_quietly(session.as_ref(), self.config.timeouts.disconnect).await;
        }
        Err(self.abort_error())
    }

    fn step(&self, from: ConnectionState, to: ConnectionState) -> Result<(), ConnectError> {
        if self.shared.advance(from, to) {
            Ok(())
        } else {
            Err(self.abort_error())
        }
    }

    fn abort_error(&self) -> ConnectError {
        if self.shared.is_closing() {
            ConnectError::BusyOrClosing
        } else {
            ConnectError::TransportFailure("connect cancelled by disconnect".to_string())
        }
    }

    /// Run one phase under its own deadline, giving up early on abort.
    async fn phase<F: Future>(&self, limit: Duration, fut: F) -> Phase<F::Output> {
        tokio::select! {
            biased;
            _ = aborted(self.aborted.clone()) => Phase::Aborted,
            result = time::timeout(limit, fut) => match result {
                Ok(value) => Phase::Done(value),
                Err(_) => Phase::TimedOut,
            },
        }
    }
}

async fn aborted(mut rx: watch::Receiver<bool>) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}
