//! Periodic keepalive for the broker session
//!
//! The broker stays silent between commands, so a session that looks open
//! but whose peer is silently gone is otherwise undetectable. The probe is
//! the only liveness detector for that case: every interval it proves the
//! session writable, and redials when it cannot.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, warn};

use super::manager::{ConnectionManager, ProbeOutcome};

/// Spawn the keepalive task. It runs for the lifetime of the process;
/// failures are logged and never terminate it.
pub fn spawn_heartbeat(manager: Arc<ConnectionManager>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(manager.config().heartbeat_interval);
        // The first tick fires immediately; wait a full interval instead.
        ticker.tick().await;

        loop {
            ticker.tick().await;

            match manager.probe().await {
                ProbeOutcome::Sent => debug!("keepalive sent"),
                ProbeOutcome::NotConnected => {
                    warn!("no live broker session, redialing");
                    if let Err(e) = manager.connect().await {
                        warn!(error = %e, "redial failed");
                    }
                }
                ProbeOutcome::SendFailed(e) => {
                    warn!(error = %e, "keepalive write failed, redialing");
                    if let Err(e) = manager.connect().await {
                        warn!(error = %e, "redial failed");
                    }
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::testing::{config_with, device};
    use std::time::Duration;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;
    use tokio::time::timeout;

    async fn manager_for(broker: std::net::SocketAddr) -> Arc<ConnectionManager> {
        let config = config_with(
            &broker.to_string(),
            vec![device(
                "garage",
                "fxJB63mYW006",
                "127.0.0.1:14301".parse().expect("addr"),
            )],
        );
        Arc::new(ConnectionManager::new(Arc::new(config)))
    }

    #[tokio::test]
    async fn probes_arrive_on_a_live_session() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        let manager = manager_for(addr).await;

        manager.connect().await.expect("connect");
        let (mut peer, _) = listener.accept().await.expect("accept");

        let mut buf = vec![0u8; 256];
        let n = peer.read(&mut buf).await.expect("read");
        assert!(buf[..n].starts_with(b"cmd=1"));

        let heartbeat = spawn_heartbeat(manager);

        // Test interval is 50ms; a probe must show up well within a second.
        let n = timeout(Duration::from_secs(1), peer.read(&mut buf))
            .await
            .expect("probe deadline")
            .expect("read");
        assert_eq!(&buf[..n], b"ping\r\n");

        heartbeat.abort();
    }

    #[tokio::test]
    async fn dead_session_is_redialed() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        let manager = manager_for(addr).await;

        // Never connected: the first tick must notice and dial.
        let heartbeat = spawn_heartbeat(manager.clone());

        let (mut peer, _) = timeout(Duration::from_secs(1), listener.accept())
            .await
            .expect("redial deadline")
            .expect("accept");
        let mut buf = vec![0u8; 256];
        let n = peer.read(&mut buf).await.expect("read");
        assert!(buf[..n].starts_with(b"cmd=1&uid=testuid"));
        assert!(manager.is_live().await);

        heartbeat.abort();
    }
}
