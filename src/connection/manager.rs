//! Connection manager owning the single shared broker session
//!
//! Every operation that touches the session (dialing, writing, teardown,
//! liveness checks) runs under one mutex, so reconnects from the receive
//! loop and the heartbeat can never race each other into a second socket.
//! The blocking receive is the deliberate exception: the read half is handed
//! to the session loop and read outside the lock, so keepalive and
//! acknowledgment writes are never starved by a pending read.

use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use doorlink_shared::state_machine::{LinkEvent, LinkStateMachine};
use doorlink_shared::{subscribe_line, KEEPALIVE};
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{watch, Mutex};
use tokio::time::{sleep, timeout};
use tracing::{info, warn};

use crate::config::GatewayConfig;

/// Read half of the live session, tagged with the generation it belongs to
/// so the receive loop can recognize a link replaced underneath it.
pub struct SessionReader {
    pub half: OwnedReadHalf,
    pub generation: u64,
}

/// Outcome of one keepalive probe.
#[derive(Debug)]
pub enum ProbeOutcome {
    /// Probe written to a live session.
    Sent,
    /// No live session existed.
    NotConnected,
    /// The write to the session failed; the session has been torn down.
    SendFailed(std::io::Error),
}

/// Everything guarded by the connection lock.
struct LinkState {
    lifecycle: LinkStateMachine,
    writer: Option<OwnedWriteHalf>,
    /// Read half of a freshly dialed session, waiting for the session loop.
    pending_reader: Option<OwnedReadHalf>,
}

/// Manages the persistent broker session.
pub struct ConnectionManager {
    config: Arc<GatewayConfig>,
    state: Mutex<LinkState>,
    /// Publishes the generation of each newly established link.
    generation_tx: watch::Sender<u64>,
}

impl ConnectionManager {
    pub fn new(config: Arc<GatewayConfig>) -> Self {
        let (generation_tx, _) = watch::channel(0);
        Self {
            config,
            state: Mutex::new(LinkState {
                lifecycle: LinkStateMachine::new(),
                writer: None,
                pending_reader: None,
            }),
            generation_tx,
        }
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    /// Dial the broker, replacing any previous session.
    ///
    /// The prior session (if any) is closed best-effort first. On success
    /// the subscription line for every configured topic has been written and
    /// the fresh read half is stashed for the session loop. On failure the
    /// state is left disconnected.
    pub async fn connect(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        self.connect_locked(&mut state).await
    }

    async fn connect_locked(&self, state: &mut LinkState) -> Result<()> {
        state.lifecycle.apply(LinkEvent::DialStarted);
        close_socket(state).await;

        let dial = TcpStream::connect(self.config.broker_addr.as_str());
        let stream = match timeout(self.config.connect_timeout, dial).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                state.lifecycle.apply(LinkEvent::DialFailed);
                return Err(e).with_context(|| format!("dialing broker {}", self.config.broker_addr));
            }
            Err(_) => {
                state.lifecycle.apply(LinkEvent::DialFailed);
                return Err(anyhow!(
                    "dialing broker {} timed out after {:?}",
                    self.config.broker_addr,
                    self.config.connect_timeout
                ));
            }
        };

        // Reads carry no deadline from here on; liveness is the heartbeat's
        // job, not the socket's.
        let (reader, mut writer) = stream.into_split();

        let line = subscribe_line(&self.config.uid, &self.config.topics());
        if let Err(e) = writer.write_all(line.as_bytes()).await {
            state.lifecycle.apply(LinkEvent::DialFailed);
            return Err(e).context("writing subscription");
        }

        state.lifecycle.apply(LinkEvent::DialSucceeded);
        let generation = state.lifecycle.generation();
        state.writer = Some(writer);
        state.pending_reader = Some(reader);
        let _ = self.generation_tx.send(generation);

        info!(
            generation,
            topics = %self.config.topics().join(","),
            "broker session established and subscribed"
        );
        Ok(())
    }

    /// Bounded startup dialing. Returns the number of attempts used on
    /// success; after the configured attempt count is exhausted the caller
    /// is expected to exit non-zero.
    pub async fn connect_with_retries(&self) -> Result<u32> {
        let attempts = self.config.startup_attempts;
        for attempt in 1..=attempts {
            match self.connect().await {
                Ok(()) => return Ok(attempt),
                Err(e) => {
                    warn!(attempt, max = attempts, error = %e, "startup dial failed");
                    if attempt < attempts {
                        sleep(self.config.startup_backoff).await;
                    }
                }
            }
        }
        Err(anyhow!(
            "broker {} unreachable after {attempts} attempts",
            self.config.broker_addr
        ))
    }

    /// Write one protocol line to the live session.
    pub async fn send(&self, line: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        if !state.lifecycle.is_connected() {
            bail!("no live broker session");
        }
        let writer = state
            .writer
            .as_mut()
            .ok_or_else(|| anyhow!("no live broker session"))?;
        writer
            .write_all(line.as_bytes())
            .await
            .context("writing to broker")
    }

    /// Check liveness and write the keepalive probe under a single lock
    /// acquisition. A failed write tears the session down so the caller can
    /// redial.
    pub async fn probe(&self) -> ProbeOutcome {
        let mut state = self.state.lock().await;
        if !state.lifecycle.is_connected() {
            return ProbeOutcome::NotConnected;
        }
        let Some(writer) = state.writer.as_mut() else {
            return ProbeOutcome::NotConnected;
        };
        match writer.write_all(KEEPALIVE).await {
            Ok(()) => ProbeOutcome::Sent,
            Err(e) => {
                state.lifecycle.apply(LinkEvent::ProbeFailed);
                close_socket(&mut state).await;
                ProbeOutcome::SendFailed(e)
            }
        }
    }

    /// Whether a live session currently exists.
    pub async fn is_live(&self) -> bool {
        self.state.lock().await.lifecycle.is_connected()
    }

    /// Generation of the most recently established link.
    pub async fn generation(&self) -> u64 {
        self.state.lock().await.lifecycle.generation()
    }

    /// Watch receiver that yields the generation of each new link.
    pub fn generation_watch(&self) -> watch::Receiver<u64> {
        self.generation_tx.subscribe()
    }

    /// Take the read half of a freshly established session, if one waits.
    pub async fn take_reader(&self) -> Option<SessionReader> {
        let mut state = self.state.lock().await;
        let generation = state.lifecycle.generation();
        state
            .pending_reader
            .take()
            .map(|half| SessionReader { half, generation })
    }

    /// Reconnect on behalf of the receive loop, unless a newer session has
    /// already replaced the one that failed (heartbeat won the race).
    pub async fn reconnect_if_current(&self, observed: u64, event: LinkEvent) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.lifecycle.generation() != observed {
            return Ok(());
        }
        state.lifecycle.apply(event);
        self.connect_locked(&mut state).await
    }

    /// Best-effort session teardown for shutdown paths.
    pub async fn teardown(&self) {
        let mut state = self.state.lock().await;
        state.lifecycle.apply(LinkEvent::Shutdown);
        close_socket(&mut state).await;
    }
}

/// Half-close and drop the session sockets; the peer may already be gone,
/// so errors are swallowed.
async fn close_socket(state: &mut LinkState) {
    if let Some(mut writer) = state.writer.take() {
        let _ = writer.shutdown().await;
    }
    state.pending_reader = None;
}
