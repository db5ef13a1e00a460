/// Lifecycle tests for the connection controller.
///
/// A spy transport records every discovery and session call. The background
/// task runs on the test runtime with a paused clock, so phase timings are
/// exact and the tests finish instantly.
use anyhow::{bail, Result};
use hub_remote::controller::{
    BackgroundTask, Controller, ControllerConfig, EventReceiver, Session, Timeouts, Transport,
};
use hub_remote::domain::commands::CommandMap;
use hub_remote::domain::error::ConnectError;
use hub_remote::domain::models::{ConnectionState, ControllerEvent};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::{sleep, Instant};

const HUB: &str = "PY-SC";
const PAYLOAD: &[u8] = b"hub program";

#[derive(Debug, Default)]
struct Calls {
    finds: usize,
    opens: usize,
    transfers: Vec<Vec<u8>>,
    writes: Vec<Vec<u8>>,
    closes: usize,
}

impl Calls {
    fn total(&self) -> usize {
        self.finds + self.opens + self.transfers.len() + self.writes.len() + self.closes
    }
}

/// `None` delays never complete.
#[derive(Clone)]
struct Behaviour {
    find: Option<Duration>,
    found: bool,
    open: Option<Duration>,
    transfer: Option<Duration>,
    fail_transfer: bool,
    fail_writes: bool,
}

impl Default for Behaviour {
    fn default() -> Self {
        Self {
            find: Some(Duration::from_secs(2)),
            found: true,
            open: Some(Duration::from_secs(1)),
            transfer: Some(Duration::from_millis(500)),
            fail_transfer: false,
            fail_writes: false,
        }
    }
}

async fn wait(delay: Option<Duration>) {
    match delay {
        Some(delay) => sleep(delay).await,
        None => std::future::pending::<()>().await,
    }
}

#[derive(Clone)]
struct SpyTransport {
    calls: Arc<Mutex<Calls>>,
    behaviour: Behaviour,
}

impl SpyTransport {
    fn new(behaviour: Behaviour) -> Self {
        Self {
            calls: Arc::new(Mutex::new(Calls::default())),
            behaviour,
        }
    }
}

impl Transport for SpyTransport {
    type Device = String;
    type Session = SpySession;

    async fn find_device(&self, name: &str, _timeout: Duration) -> Result<Option<String>> {
        self.calls.lock().unwrap().finds += 1;
        wait(self.behaviour.find).await;
        Ok(self.behaviour.found.then(|| name.to_string()))
    }

    async fn open(&self, _device: String, _timeout: Duration) -> Result<SpySession> {
        self.calls.lock().unwrap().opens += 1;
        wait(self.behaviour.open).await;
        Ok(SpySession {
            calls: self.calls.clone(),
            behaviour: self.behaviour.clone(),
            link_up: AtomicBool::new(true),
        })
    }
}

struct SpySession {
    calls: Arc<Mutex<Calls>>,
    behaviour: Behaviour,
    link_up: AtomicBool,
}

impl Session for SpySession {
    async fn transfer_payload(&self, payload: &[u8], _timeout: Duration) -> Result<()> {
        self.calls.lock().unwrap().transfers.push(payload.to_vec());
        wait(self.behaviour.transfer).await;
        if self.behaviour.fail_transfer {
            bail!("hub rejected program");
        }
        Ok(())
    }

    async fn write(&self, bytes: &[u8]) -> Result<()> {
        self.calls.lock().unwrap().writes.push(bytes.to_vec());
        if self.behaviour.fail_writes {
            self.link_up.store(false, Ordering::SeqCst);
            bail!("link lost");
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.calls.lock().unwrap().closes += 1;
        bail!("already gone")
    }

    fn is_connected(&self) -> bool {
        self.link_up.load(Ordering::SeqCst)
    }
}

struct Harness {
    controller: Controller<SpyTransport>,
    events: EventReceiver,
    calls: Arc<Mutex<Calls>>,
}

impl Harness {
    fn start(behaviour: Behaviour) -> Self {
        let transport = SpyTransport::new(behaviour);
        let calls = transport.calls.clone();
        let config = ControllerConfig {
            device_name: HUB.to_string(),
            timeouts: Timeouts::default(),
            payload: PAYLOAD.into(),
        };
        let (controller, events, task): (_, _, BackgroundTask<SpyTransport>) =
            Controller::new(transport, config, Arc::new(CommandMap::standard()));
        tokio::spawn(task.run());
        Self {
            controller,
            events,
            calls,
        }
    }

    /// Start a connect and return its outcome plus the number of callbacks.
    fn connect(&self) -> (oneshot::Receiver<Result<(), ConnectError>>, Arc<AtomicUsize>) {
        let (tx, rx) = oneshot::channel();
        let count = Arc::new(AtomicUsize::new(0));
        let counter = count.clone();
        self.controller.connect(move |result| {
            counter.fetch_add(1, Ordering::SeqCst);
            let _ = tx.send(result);
        });
        (rx, count)
    }

    fn states(&mut self) -> Vec<ConnectionState> {
        let mut states = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            if let ControllerEvent::StateChanged(state) = event {
                states.push(state);
            }
        }
        states
    }

    fn writes(&self) -> Vec<Vec<u8>> {
        self.calls.lock().unwrap().writes.clone()
    }

    async fn connected(&mut self) {
        let (rx, _) = self.connect();
        rx.await.unwrap().unwrap();
        self.states();
    }
}

/// Give the background task time to drain its queue.
async fn settle() {
    sleep(Duration::from_millis(10)).await;
}

#[tokio::test(start_paused = true)]
async fn full_connect_walks_every_phase() {
    let mut h = Harness::start(Behaviour::default());
    let started = Instant::now();

    let (rx, count) = h.connect();
    assert_eq!(rx.await.unwrap(), Ok(()));

    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_millis(3500), "{:?}", elapsed);
    assert!(elapsed < Duration::from_millis(3600), "{:?}", elapsed);
    assert_eq!(
        h.states(),
        vec![
            ConnectionState::Discovering,
            ConnectionState::Establishing,
            ConnectionState::Transferring,
            ConnectionState::Ready,
        ]
    );
    assert_eq!(h.controller.state(), ConnectionState::Ready);
    assert!(h.controller.is_ready());

    settle().await;
    assert_eq!(count.load(Ordering::SeqCst), 1);
    assert_eq!(h.calls.lock().unwrap().transfers, vec![PAYLOAD.to_vec()]);
}

#[tokio::test(start_paused = true)]
async fn send_after_ready_writes_one_byte() {
    let mut h = Harness::start(Behaviour::default());
    h.connected().await;

    h.controller.send('w');
    settle().await;

    assert_eq!(h.writes(), vec![vec![0x77]]);
}

#[tokio::test(start_paused = true)]
async fn commands_keep_submission_order() {
    let mut h = Harness::start(Behaviour::default());
    h.connected().await;

    for c in ['w', 'e', 'a', 'q'] {
        h.controller.send(c);
    }
    settle().await;

    assert_eq!(h.writes(), vec![vec![b'w'], vec![b'e'], vec![b'a'], vec![b'q']]);
}

#[tokio::test(start_paused = true)]
async fn unknown_commands_have_no_effect() {
    let mut h = Harness::start(Behaviour::default());
    h.connected().await;

    for c in ['x', 'W', ' ', 'é', '\n'] {
        h.controller.send(c);
    }
    settle().await;

    assert!(h.writes().is_empty());
    assert_eq!(h.controller.state(), ConnectionState::Ready);
}

#[tokio::test(start_paused = true)]
async fn send_before_ready_never_reaches_transport() {
    let h = Harness::start(Behaviour::default());

    h.controller.send('w');
    let (rx, _) = h.connect();
    h.controller.send('s');
    sleep(Duration::from_millis(2500)).await;
    h.controller.send('d');

    rx.await.unwrap().unwrap();
    settle().await;
    assert!(h.writes().is_empty());
}

#[tokio::test(start_paused = true)]
async fn discovery_timeout_reports_not_found_once() {
    let mut h = Harness::start(Behaviour {
        find: None,
        ..Default::default()
    });
    let started = Instant::now();

    let (rx, count) = h.connect();
    let result = rx.await.unwrap();

    assert_eq!(
        result,
        Err(ConnectError::DeviceNotFound {
            name: HUB.to_string()
        })
    );
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_secs(20), "{:?}", elapsed);
    assert!(elapsed < Duration::from_secs(21), "{:?}", elapsed);
    assert_eq!(
        h.states(),
        vec![ConnectionState::Discovering, ConnectionState::Idle]
    );

    sleep(Duration::from_secs(60)).await;
    assert_eq!(count.load(Ordering::SeqCst), 1);
    assert_eq!(h.calls.lock().unwrap().opens, 0);
}

#[tokio::test(start_paused = true)]
async fn scanner_giving_up_is_not_found() {
    let h = Harness::start(Behaviour {
        found: false,
        ..Default::default()
    });

    let (rx, _) = h.connect();
    assert!(matches!(
        rx.await.unwrap(),
        Err(ConnectError::DeviceNotFound { .. })
    ));
    assert_eq!(h.controller.state(), ConnectionState::Idle);
}

#[tokio::test(start_paused = true)]
async fn open_timeout_leaves_no_session() {
    let h = Harness::start(Behaviour {
        open: None,
        ..Default::default()
    });

    let (rx, _) = h.connect();
    assert_eq!(rx.await.unwrap(), Err(ConnectError::ConnectTimeout));
    assert_eq!(h.controller.state(), ConnectionState::Idle);
    assert!(h.calls.lock().unwrap().transfers.is_empty());
}

#[tokio::test(start_paused = true)]
async fn transfer_timeout_closes_half_open_session() {
    let h = Harness::start(Behaviour {
        transfer: None,
        ..Default::default()
    });

    let (rx, _) = h.connect();
    assert_eq!(rx.await.unwrap(), Err(ConnectError::TransferTimeout));
    assert_eq!(h.controller.state(), ConnectionState::Idle);
    assert_eq!(h.calls.lock().unwrap().closes, 1);
}

#[tokio::test(start_paused = true)]
async fn transfer_failure_is_reported_with_reason() {
    let h = Harness::start(Behaviour {
        fail_transfer: true,
        ..Default::default()
    });

    let (rx, _) = h.connect();
    match rx.await.unwrap() {
        Err(ConnectError::TransportFailure(reason)) => {
            assert!(reason.contains("hub rejected program"))
        }
        other => panic!("unexpected {:?}", other),
    }
    assert_eq!(h.calls.lock().unwrap().closes, 1);
    assert!(!h.controller.is_ready());
}

#[tokio::test(start_paused = true)]
async fn second_connect_while_busy_is_rejected() {
    let h = Harness::start(Behaviour::default());

    let (first, _) = h.connect();
    let (second, second_count) = h.connect();

    assert_eq!(second_count.load(Ordering::SeqCst), 1);
    assert_eq!(second.await.unwrap(), Err(ConnectError::BusyOrClosing));
    assert_eq!(first.await.unwrap(), Ok(()));
    assert_eq!(h.calls.lock().unwrap().finds, 1);
}

#[tokio::test(start_paused = true)]
async fn disconnect_without_session_is_noop() {
    let mut h = Harness::start(Behaviour::default());

    h.controller.disconnect();
    h.controller.disconnect();
    settle().await;

    assert_eq!(h.calls.lock().unwrap().total(), 0);
    assert!(h.states().is_empty());
    assert_eq!(h.controller.state(), ConnectionState::Idle);
}

#[tokio::test(start_paused = true)]
async fn disconnect_returns_to_idle_and_allows_reconnect() {
    let mut h = Harness::start(Behaviour::default());
    h.connected().await;

    h.controller.disconnect();
    h.controller.send('w');
    settle().await;

    // close() errors in the spy; disconnect still completes
    assert_eq!(
        h.states(),
        vec![ConnectionState::Disconnecting, ConnectionState::Idle]
    );
    assert_eq!(h.calls.lock().unwrap().closes, 1);
    assert!(h.writes().is_empty());

    h.controller.disconnect();
    settle().await;
    assert_eq!(h.calls.lock().unwrap().closes, 1);

    h.connected().await;
    assert_eq!(h.calls.lock().unwrap().transfers.len(), 2);
}

#[tokio::test(start_paused = true)]
async fn disconnect_during_transfer_cancels_attempt() {
    let h = Harness::start(Behaviour {
        transfer: None,
        ..Default::default()
    });

    let (rx, count) = h.connect();
    sleep(Duration::from_millis(3100)).await;
    assert_eq!(h.controller.state(), ConnectionState::Transferring);

    h.controller.disconnect();
    assert!(matches!(
        rx.await.unwrap(),
        Err(ConnectError::TransportFailure(_))
    ));
    settle().await;

    assert_eq!(count.load(Ordering::SeqCst), 1);
    assert_eq!(h.controller.state(), ConnectionState::Idle);
    assert_eq!(h.calls.lock().unwrap().closes, 1);
}

#[tokio::test(start_paused = true)]
async fn disconnect_during_discovery_returns_straight_to_idle() {
    let mut h = Harness::start(Behaviour {
        find: None,
        ..Default::default()
    });

    let (rx, count) = h.connect();
    sleep(Duration::from_secs(1)).await;
    assert_eq!(h.controller.state(), ConnectionState::Discovering);

    h.controller.disconnect();
    assert!(matches!(
        rx.await.unwrap(),
        Err(ConnectError::TransportFailure(_))
    ));
    settle().await;

    assert_eq!(count.load(Ordering::SeqCst), 1);
    assert_eq!(
        h.states(),
        vec![ConnectionState::Discovering, ConnectionState::Idle]
    );
    let calls = h.calls.lock().unwrap();
    assert_eq!(calls.opens, 0);
    assert_eq!(calls.closes, 0);
}

#[tokio::test(start_paused = true)]
async fn close_is_idempotent() {
    let mut h = Harness::start(Behaviour::default());
    h.connected().await;

    h.controller.close();
    h.controller.close();
    settle().await;
    h.controller.close();
    settle().await;

    assert_eq!(h.calls.lock().unwrap().closes, 1);
    assert_eq!(h.controller.state(), ConnectionState::Closed);
    assert_eq!(h.states(), vec![ConnectionState::Closed]);
}

#[tokio::test(start_paused = true)]
async fn connect_after_close_is_rejected_synchronously() {
    let h = Harness::start(Behaviour::default());
    h.controller.close();

    let (mut rx, count) = h.connect();
    assert_eq!(count.load(Ordering::SeqCst), 1);
    assert_eq!(rx.try_recv().unwrap(), Err(ConnectError::BusyOrClosing));
    settle().await;
    assert_eq!(h.calls.lock().unwrap().total(), 0);
}

#[tokio::test(start_paused = true)]
async fn close_during_discovery_reports_busy_or_closing() {
    let h = Harness::start(Behaviour {
        find: None,
        ..Default::default()
    });

    let (rx, count) = h.connect();
    sleep(Duration::from_secs(1)).await;
    h.controller.close();

    assert_eq!(rx.await.unwrap(), Err(ConnectError::BusyOrClosing));
    settle().await;
    assert_eq!(count.load(Ordering::SeqCst), 1);
    assert_eq!(h.controller.state(), ConnectionState::Closed);
}

#[tokio::test(start_paused = true)]
async fn lost_link_tears_session_down() {
    let mut h = Harness::start(Behaviour {
        fail_writes: true,
        ..Default::default()
    });
    h.connected().await;

    h.controller.send('o');
    settle().await;

    assert_eq!(h.controller.state(), ConnectionState::Idle);
    assert!(!h.controller.is_ready());
    assert_eq!(h.calls.lock().unwrap().closes, 1);

    h.controller.send('c');
    settle().await;
    assert_eq!(h.writes().len(), 1);
}
