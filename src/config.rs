//! Gateway configuration: broker endpoint, client identity, timing knobs,
//! and the static device table. Loaded once at startup, validated eagerly,
//! and shared read-only across every component.
//!
//! The TOML file layer is kept separate from the runtime types: the file
//! structs carry raw strings and seconds, the runtime structs carry parsed
//! addresses, `Duration`s, and the hex-decoded unlock frames.

use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use bytes::Bytes;
use serde::Deserialize;

// ── TOML file structs ────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct ConfigFile {
    /// Broker endpoint, `host:port`.
    broker: String,

    /// Client identity token presented on subscribe and acknowledgments.
    uid: String,

    /// Local address the UDP actuation sockets bind to.
    udp_bind: String,

    #[serde(default = "default_connect_timeout")]
    connect_timeout_secs: u64,

    #[serde(default = "default_heartbeat_interval")]
    heartbeat_interval_secs: u64,

    #[serde(default = "default_udp_timeout")]
    udp_timeout_secs: u64,

    #[serde(default = "default_reconnect_backoff")]
    reconnect_backoff_secs: u64,

    #[serde(default = "default_peer_closed_backoff")]
    peer_closed_backoff_secs: u64,

    #[serde(default = "default_startup_attempts")]
    startup_attempts: u32,

    #[serde(default = "default_startup_backoff")]
    startup_backoff_secs: u64,

    #[serde(default)]
    devices: Vec<DeviceFile>,
}

#[derive(Debug, Deserialize)]
struct DeviceFile {
    id: String,

    /// Controller endpoint, `ip:port`.
    controller: String,

    /// Broker topic mapping 1:1 to this device.
    topic: String,

    /// Unlock frame as a hex string; sent verbatim over UDP.
    unlock_frame: String,
}

fn default_connect_timeout() -> u64 {
    15
}
fn default_heartbeat_interval() -> u64 {
    30
}
fn default_udp_timeout() -> u64 {
    5
}
fn default_reconnect_backoff() -> u64 {
    5
}
fn default_peer_closed_backoff() -> u64 {
    2
}
fn default_startup_attempts() -> u32 {
    5
}
fn default_startup_backoff() -> u64 {
    3
}

// ── Runtime types ────────────────────────────────────────────────────

/// One physical access-control device.
#[derive(Debug, Clone)]
pub struct DeviceConfig {
    pub id: String,
    pub controller_addr: SocketAddr,
    pub topic: String,
    pub unlock_frame: Bytes,
}

/// Validated gateway configuration.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub broker_addr: String,
    pub uid: String,
    pub udp_bind: SocketAddr,
    pub connect_timeout: Duration,
    pub heartbeat_interval: Duration,
    pub udp_timeout: Duration,
    pub reconnect_backoff: Duration,
    pub peer_closed_backoff: Duration,
    pub startup_attempts: u32,
    pub startup_backoff: Duration,
    pub devices: Vec<DeviceConfig>,
}

impl GatewayConfig {
    /// Load and validate a configuration file.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        Self::from_toml(&raw)
    }

    /// Parse and validate configuration from TOML text.
    pub fn from_toml(raw: &str) -> Result<Self> {
        let file: ConfigFile = toml::from_str(raw).context("parsing config file")?;

        if file.devices.is_empty() {
            bail!("config declares no devices; nothing to subscribe to");
        }

        let devices = file
            .devices
            .into_iter()
            .map(|d| {
                let controller_addr = d
                    .controller
                    .parse()
                    .with_context(|| format!("device {}: bad controller address", d.id))?;
                let unlock_frame = hex::decode(&d.unlock_frame)
                    .map(Bytes::from)
                    .with_context(|| format!("device {}: bad unlock frame hex", d.id))?;
                Ok(DeviceConfig {
                    id: d.id,
                    controller_addr,
                    topic: d.topic,
                    unlock_frame,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            broker_addr: file.broker,
            uid: file.uid,
            udp_bind: file
                .udp_bind
                .parse()
                .context("bad udp_bind address")?,
            connect_timeout: Duration::from_secs(file.connect_timeout_secs),
            heartbeat_interval: Duration::from_secs(file.heartbeat_interval_secs),
            udp_timeout: Duration::from_secs(file.udp_timeout_secs),
            reconnect_backoff: Duration::from_secs(file.reconnect_backoff_secs),
            peer_closed_backoff: Duration::from_secs(file.peer_closed_backoff_secs),
            startup_attempts: file.startup_attempts,
            startup_backoff: Duration::from_secs(file.startup_backoff_secs),
            devices,
        })
    }

    /// All configured topics, in declaration order.
    pub fn topics(&self) -> Vec<&str> {
        self.devices.iter().map(|d| d.topic.as_str()).collect()
    }
}
