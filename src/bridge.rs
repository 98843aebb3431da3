//! Push-event connection to the backend's `/ws` channel.
//!
//! ```text
//!   connecting --handshake ok--> open
//!   connecting --handshake failed--> reconnecting
//!   open --closed/error--> reconnecting
//!   reconnecting --backoff elapsed--> connecting
//!   any --teardown--> closed (terminal)
//! ```
//!
//! The bridge only asks the scheduler to reconcile; it never writes the view
//! model. Its connection state is published on a watch channel.

use crate::config::DashboardConfig;
use crate::error::BridgeError;
use crate::filters::FilterCriteria;
use crate::scheduler::{RefreshReason, RefreshScheduler};
use crate::state::StateStore;
use futures_util::StreamExt;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};
use url::Url;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    #[default]
    Connecting,
    Open,
    Reconnecting,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEvent {
    HandshakeSucceeded,
    ConnectionLost,
    BackoffElapsed,
    Teardown,
}

impl ConnectionState {
    /// Next state for `event`. Events that make no sense in the current state
    /// leave it unchanged; `Closed` never changes.
    pub fn on(self, event: ConnectionEvent) -> ConnectionState {
        use ConnectionEvent::*;
        use ConnectionState::*;
        match (self, event) {
            (Closed, _) => Closed,
            (_, Teardown) => Closed,
            (Connecting, HandshakeSucceeded) => Open,
            (Connecting, ConnectionLost) | (Open, ConnectionLost) => Reconnecting,
            (Reconnecting, BackoffElapsed) => Connecting,
            (state, _) => state,
        }
    }
}

/// Exponential reconnect delay with equal jitter: each delay lies in
/// `[base/2, base]`, and `base` doubles up to `cap`.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    cap: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, cap: Duration) -> Self {
        Self {
            initial,
            cap,
            current: initial.min(cap),
        }
    }

    pub fn next_delay<R: Rng + ?Sized>(&mut self, rng: &mut R) -> Duration {
        let base = self.current;
        self.current = self.current.saturating_mul(2).min(self.cap);
        let half = base / 2;
        let spread = (base - half).as_millis() as u64;
        half + Duration::from_millis(rng.gen_range(0..=spread))
    }

    pub fn reset(&mut self) {
        self.current = self.initial.min(self.cap);
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventClass {
    BuildLifecycle,
    Other,
}

/// `{type, ...payload}` as sent on the push channel.
#[derive(Debug, Clone, Deserialize)]
pub struct PushEvent {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(flatten)]
    pub payload: Map<String, Value>,
}

impl PushEvent {
    pub fn class(&self) -> EventClass {
        if self.kind.contains("build_") {
            EventClass::BuildLifecycle
        } else {
            EventClass::Other
        }
    }
}

pub struct RealtimeBridge {
    url: Url,
    scheduler: RefreshScheduler,
    store: StateStore,
    backoff: Backoff,
}

pub struct BridgeHandle {
    state: watch::Receiver<ConnectionState>,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl BridgeHandle {
    pub fn watch(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    /// Caller-initiated teardown; waits for the connection task to finish.
    pub async fn close(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.task.await {
            warn!("Push channel task ended abnormally: {}", e);
        }
    }
}

enum PumpEnd {
    Lost,
    Teardown,
}

struct StateMachine {
    state: ConnectionState,
    tx: watch::Sender<ConnectionState>,
}

impl StateMachine {
    fn apply(&mut self, event: ConnectionEvent) {
        let next = self.state.on(event);
        if next != self.state {
            debug!("Push channel {:?} -> {:?} on {:?}", self.state, next, event);
            self.state = next;
            self.tx.send_replace(next);
        }
    }
}

async fn connect(url: &Url) -> Result<WsStream, BridgeError> {
    if !matches!(url.scheme(), "ws" | "wss") {
        return Err(BridgeError::InvalidUrl(url.to_string()));
    }
    let (ws, _) = connect_async(url.as_str()).await?;
    Ok(ws)
}

impl RealtimeBridge {
    pub fn new(url: Url, scheduler: RefreshScheduler, store: StateStore, settings: &DashboardConfig) -> Self {
        Self {
            url,
            scheduler,
            store,
            backoff: Backoff::new(settings.backoff_initial(), settings.backoff_cap()),
        }
    }

    pub fn spawn(self) -> BridgeHandle {
        let (state_tx, state_rx) = watch::channel(ConnectionState::Connecting);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(self.run(state_tx, shutdown_rx));
        BridgeHandle {
            state: state_rx,
            shutdown: shutdown_tx,
            task,
        }
    }

    async fn run(mut self, state_tx: watch::Sender<ConnectionState>, mut shutdown: watch::Receiver<bool>) {
        let mut fsm = StateMachine {
            state: ConnectionState::Connecting,
            tx: state_tx,
        };
        let mut rng = StdRng::from_entropy();

        loop {
            info!("Connecting to push channel {}", self.url);
            let connected = tokio::select! {
                res = connect(&self.url) => res,
                _ = shutdown.changed() => {
                    fsm.apply(ConnectionEvent::Teardown);
                    return;
                }
            };

            match connected {
                Ok(ws) => {
                    info!("Push channel open");
                    fsm.apply(ConnectionEvent::HandshakeSucceeded);
                    self.backoff.reset();
                    if let PumpEnd::Teardown = self.pump(ws, &mut shutdown).await {
                        fsm.apply(ConnectionEvent::Teardown);
                        return;
                    }
                    fsm.apply(ConnectionEvent::ConnectionLost);
                }
                Err(e) => {
                    warn!("Push channel handshake failed: {}", e);
                    fsm.apply(ConnectionEvent::ConnectionLost);
                }
            }

            let delay = self.backoff.next_delay(&mut rng);
            info!("Reconnecting to push channel in {:?}", delay);
            tokio::select! {
                _ = sleep(delay) => fsm.apply(ConnectionEvent::BackoffElapsed),
                _ = shutdown.changed() => {
                    fsm.apply(ConnectionEvent::Teardown);
                    return;
                }
            }
        }
    }

    async fn pump(&self, mut ws: WsStream, shutdown: &mut watch::Receiver<bool>) -> PumpEnd {
        loop {
            tokio::select! {
                msg = ws.next() => match msg {
                    Some(Ok(Message::Text(text))) => self.handle_message(&text),
                    Some(Ok(Message::Binary(bytes))) => match std::str::from_utf8(&bytes) {
                        Ok(text) => self.handle_message(text),
                        Err(_) => warn!("Dropping non-UTF-8 binary push message"),
                    },
                    Some(Ok(Message::Close(frame))) => {
                        warn!("Push channel closed by server: {:?}", frame);
                        return PumpEnd::Lost;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!("Push channel error: {}", e);
                        return PumpEnd::Lost;
                    }
                    None => {
                        warn!("Push channel ended");
                        return PumpEnd::Lost;
                    }
                },
                _ = shutdown.changed() => {
                    if let Err(e) = ws.close(None).await {
                        debug!("Close handshake failed: {}", e);
                    }
                    return PumpEnd::Teardown;
                }
            }
        }
    }

    fn handle_message(&self, text: &str) {
        let event: PushEvent = match serde_json::from_str(text) {
            Ok(ev) => ev,
            Err(e) => {
                warn!("Dropping malformed push message: {}", e);
                return;
            }
        };
        match event.class() {
            EventClass::BuildLifecycle => {
                debug!("Push event {} requests reconciliation", event.kind);
                let filters: FilterCriteria = self.store.snapshot().filters.clone();
                self.scheduler.request_refresh(RefreshReason::EventTriggered, filters);
            }
            EventClass::Other => debug!("Ignoring push event {}", event.kind),
        }
    }
}
