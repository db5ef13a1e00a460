//! State shared between the front end and the background context.

use crate::domain::models::{ConnectionState, ControllerEvent, MessageSeverity, StatusMessage};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;
use tracing::debug;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) struct Shared<S> {
    state: Mutex<ConnectionState>,
    closing: AtomicBool,
    connected: AtomicBool,
    /// Only the background context stores or takes the session.
    session: Mutex<Option<Arc<S>>>,
    events: mpsc::UnboundedSender<ControllerEvent>,
}

impl<S> Shared<S> {
    pub(crate) fn new(events: mpsc::UnboundedSender<ControllerEvent>) -> Self {
        Self {
            state: Mutex::new(ConnectionState::Idle),
            closing: AtomicBool::new(false),
            connected: AtomicBool::new(false),
            session: Mutex::new(None),
            events,
        }
    }

    pub(crate) fn state(&self) -> ConnectionState {
        *lock(&self.state)
    }

    /// Move from `from` to `to`. Fails if another party changed the state first
    /// or the controller is closed.
    pub(crate) fn advance(&self, from: ConnectionState, to: ConnectionState) -> bool {
        {
            let mut state = lock(&self.state);
            if *state != from || from == ConnectionState::Closed {
                return false;
            }
            *state = to;
        }
        self.emit_state(from, to);
        true
    }

    /// Unconditional move, except that `Closed` is never left.
    pub(crate) fn transition(&self, to: ConnectionState) -> bool {
        let from = {
            let mut state = lock(&self.state);
            if *state == ConnectionState::Closed || *state == to {
                return false;
            }
            std::mem::replace(&mut *state, to)
        };
        self.emit_state(from, to);
        true
    }

    fn emit_state(&self, from: ConnectionState, to: ConnectionState) {
        debug!(%from, %to, "state change");
        let _ = self.events.send(ControllerEvent::StateChanged(to));
    }

    /// Sets the closing flag. Returns `true` only for the first caller.
    pub(crate) fn begin_closing(&self) -> bool {
        !self.closing.swap(true, Ordering::SeqCst)
    }

    pub(crate) fn is_closing(&self) -> bool {
        self.closing.load(Ordering::SeqCst)
    }

    pub(crate) fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    pub(crate) fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub(crate) fn store_session(&self, session: Arc<S>) {
        *lock(&self.session) = Some(session);
    }

    pub(crate) fn session(&self) -> Option<Arc<S>> {
        lock(&self.session).clone()
    }

    /// Detach the session and clear readiness in one step.
    pub(crate) fn take_session(&self) -> Option<Arc<S>> {
        self.set_connected(false);
        lock(&self.session).take()
    }

    pub(crate) fn log(&self, message: impl Into<String>, severity: MessageSeverity) {
        let _ = self
            .events
            .send(ControllerEvent::LogMessage(StatusMessage::new(message, severity)));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shared() -> (Shared<()>, mpsc::UnboundedReceiver<ControllerEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Shared::new(tx), rx)
    }

    #[test]
    fn advance_requires_expected_state() {
        let (shared, mut events) = shared();
        assert!(!shared.advance(ConnectionState::Discovering, ConnectionState::Establishing));
        assert!(shared.advance(ConnectionState::Idle, ConnectionState::Discovering));
        assert_eq!(shared.state(), ConnectionState::Discovering);
        assert!(matches!(
            events.try_recv(),
            Ok(ControllerEvent::StateChanged(ConnectionState::Discovering))
        ));
        assert!(events.try_recv().is_err());
    }

    #[test]
    fn closed_is_absorbing() {
        let (shared, _events) = shared();
        assert!(shared.transition(ConnectionState::Closed));
        assert!(!shared.transition(ConnectionState::Idle));
        assert!(!shared.advance(ConnectionState::Closed, ConnectionState::Idle));
        assert_eq!(shared.state(), ConnectionState::Closed);
    }

    #[test]
    fn closing_flag_is_set_once() {
        let (shared, _events) = shared();
        assert!(shared.begin_closing());
        assert!(!shared.begin_closing());
        assert!(shared.is_closing());
    }

    #[test]
    fn take_session_clears_ready_flag() {
        let (shared, _events) = shared();
        shared.store_session(Arc::new(()));
        shared.set_connected(true);
        assert!(shared.take_session().is_some());
        assert!(!shared.is_connected());
        assert!(shared.take_session().is_none());
    }
}
