//! UDP unlock actuation
//!
//! Each unlock runs as its own short-lived task with a dedicated socket, so
//! a slow or unreachable controller can never stall the broker receive loop.
//! The socket is owned by the attempt and closes when the attempt ends,
//! whatever the exit path.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use doorlink_shared::ack_line;
use tokio::net::UdpSocket;
use tokio::time::timeout;
use tracing::{info, warn};

use crate::config::{DeviceConfig, GatewayConfig};
use crate::connection::ConnectionManager;

/// Per-device unlock attempt counter, wrapping modulo 256.
///
/// Controller firmware expects the configured frame verbatim and ignores
/// the sequence byte; the counter is still advanced on every attempt so a
/// frame revision can pick it up without changing attempt bookkeeping.
#[derive(Debug, Default)]
pub struct SequenceCounter(AtomicU8);

impl SequenceCounter {
    /// Current value; advances (wrapping) as a side effect.
    pub fn next(&self) -> u8 {
        self.0.fetch_add(1, Ordering::Relaxed)
    }
}

/// Sends unlock datagrams and acknowledges completions to the broker.
pub struct UnlockActuator {
    config: Arc<GatewayConfig>,
    manager: Arc<ConnectionManager>,
    /// Attempt counters keyed by device id; never reset while running.
    counters: HashMap<String, SequenceCounter>,
}

impl UnlockActuator {
    pub fn new(config: Arc<GatewayConfig>, manager: Arc<ConnectionManager>) -> Self {
        let counters = config
            .devices
            .iter()
            .map(|d| (d.id.clone(), SequenceCounter::default()))
            .collect();
        Self {
            config,
            manager,
            counters,
        }
    }

    /// Fire one unlock attempt and, on success, acknowledge to the broker.
    ///
    /// A failed attempt is not retried here; the operator resending the
    /// broker command produces a fresh attempt.
    pub async fn unlock(&self, device: &DeviceConfig) -> Result<()> {
        let sequence = self
            .counters
            .get(&device.id)
            .map(SequenceCounter::next)
            .unwrap_or_default();

        self.send_datagram(device).await?;
        info!(device = %device.id, sequence, "unlock datagram sent");

        self.acknowledge(device).await;
        Ok(())
    }

    /// One datagram on a dedicated socket. The socket drops at the end of
    /// this scope on success, timeout, and error alike.
    async fn send_datagram(&self, device: &DeviceConfig) -> Result<()> {
        let socket = UdpSocket::bind(self.config.udp_bind)
            .await
            .with_context(|| format!("binding udp socket at {}", self.config.udp_bind))?;

        let send = socket.send_to(&device.unlock_frame, device.controller_addr);
        match timeout(self.config.udp_timeout, send).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(e)) => {
                Err(e).with_context(|| format!("udp send to {}", device.controller_addr))
            }
            Err(_) => Err(anyhow!(
                "udp send to {} timed out after {:?}",
                device.controller_addr,
                self.config.udp_timeout
            )),
        }
    }

    async fn acknowledge(&self, device: &DeviceConfig) {
        let line = ack_line(&self.config.uid, &device.topic);
        if let Err(e) = self.manager.send(&line).await {
            // The unlock already happened; a lost ack is not worth a retry.
            warn!(device = %device.id, error = %e, "acknowledgment send failed");
        }
    }
}
