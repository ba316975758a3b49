//! Top-level broker receive loop
//!
//! The single reader of the session: bytes come in, frames come out in wire
//! order, and each frame goes to the router before the next read. Receive
//! failures trigger reconnection with backoff here, with the link
//! generation guarding against racing heartbeat reconnects. The loop never
//! terminates from a bad iteration; only process shutdown stops it from
//! outside.

use std::sync::Arc;
use std::time::Duration;

use doorlink_shared::codec::LineDecoder;
use doorlink_shared::state_machine::LinkEvent;
use tokio::io::AsyncReadExt;
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{debug, error, warn};

use crate::command::CommandRouter;
use crate::connection::ConnectionManager;

/// Upper bound on a single receive.
const READ_CHUNK: usize = 4096;

pub struct SessionLoop {
    manager: Arc<ConnectionManager>,
    router: CommandRouter,
    decoder: LineDecoder,
    generation_rx: watch::Receiver<u64>,
    reader: Option<crate::connection::SessionReader>,
}

impl SessionLoop {
    pub fn new(manager: Arc<ConnectionManager>, router: CommandRouter) -> Self {
        let generation_rx = manager.generation_watch();
        Self {
            manager,
            router,
            decoder: LineDecoder::new(),
            generation_rx,
            reader: None,
        }
    }

    /// Run for the lifetime of the process.
    pub async fn run(mut self) {
        let mut chunk = vec![0u8; READ_CHUNK];
        let peer_closed_backoff = self.manager.config().peer_closed_backoff;
        let receive_error_backoff = self.manager.config().reconnect_backoff;

        loop {
            let Some(mut reader) = self.reader.take() else {
                self.acquire_reader().await;
                continue;
            };

            // A racing reconnect may have replaced the session since this
            // reader was handed out.
            if *self.generation_rx.borrow_and_update() != reader.generation {
                debug!("dropping stale session reader");
                continue;
            }

            let outcome = tokio::select! {
                result = reader.half.read(&mut chunk) => Some(result),
                _ = self.generation_rx.changed() => None,
            };

            match outcome {
                None => {
                    // Fresh link underneath us; adopt it next iteration.
                    debug!("session replaced mid-read");
                }
                Some(Ok(0)) => {
                    warn!("broker closed the connection");
                    self.recover(reader.generation, LinkEvent::PeerClosed, peer_closed_backoff)
                        .await;
                }
                Some(Ok(n)) => {
                    self.ingest(&chunk[..n]);
                    self.reader = Some(reader);
                }
                Some(Err(e)) => {
                    error!(error = %e, "broker receive failed");
                    self.recover(reader.generation, LinkEvent::ReceiveFailed, receive_error_backoff)
                        .await;
                }
            }
        }
    }

    /// Ensure a live session and adopt its read half.
    async fn acquire_reader(&mut self) {
        if let Some(reader) = self.manager.take_reader().await {
            self.reader = Some(reader);
            return;
        }

        match self.manager.connect().await {
            Ok(()) => self.reader = self.manager.take_reader().await,
            Err(e) => {
                warn!(error = %e, "broker dial failed, backing off");
                sleep(self.manager.config().reconnect_backoff).await;
            }
        }
    }

    /// Feed received bytes through the framer and route every complete
    /// command in wire order.
    fn ingest(&mut self, data: &[u8]) {
        self.decoder.extend(data);
        loop {
            match self.decoder.next_frame() {
                Ok(Some(frame)) => self.router.route(&frame),
                Ok(None) => break,
                Err(e) => {
                    // A peer that never sends a delimiter; drop the garbage
                    // and keep the session.
                    error!(error = %e, buffered = self.decoder.buffered(), "framing failed");
                    self.decoder.clear();
                    break;
                }
            }
        }
    }

    /// Reconnect after a receive-side failure, unless a racing path already
    /// replaced the session.
    async fn recover(&mut self, generation: u64, event: LinkEvent, backoff: Duration) {
        if self.manager.generation().await != generation {
            return;
        }
        if let Err(e) = self.manager.reconnect_if_current(generation, event).await {
            warn!(error = %e, "redial failed, backing off");
        }
        sleep(backoff).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::UnlockActuator;
    use crate::config::testing::{config_with, device};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, UdpSocket};
    use tokio::time::timeout;

    async fn read_line(stream: &mut tokio::net::TcpStream) -> String {
        let mut line = Vec::new();
        let mut byte = [0u8; 1];
        loop {
            let n = timeout(Duration::from_secs(2), stream.read(&mut byte))
                .await
                .expect("read deadline")
                .expect("read");
            assert!(n > 0, "peer closed while reading a line");
            line.push(byte[0]);
            if line.ends_with(b"\r\n") {
                return String::from_utf8(line).expect("utf8");
            }
        }
    }

    /// Full path: split frames in, UDP datagram out, acknowledgment back.
    #[tokio::test]
    async fn commands_flow_from_broker_to_controller_and_back() {
        let broker = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let controller = UdpSocket::bind("127.0.0.1:0").await.expect("bind");

        let dev = device(
            "first-floor",
            "bnv7cDLpM006",
            controller.local_addr().expect("addr"),
        );
        let config = Arc::new(config_with(
            &broker.local_addr().expect("addr").to_string(),
            vec![dev.clone()],
        ));

        let manager = Arc::new(ConnectionManager::new(config.clone()));
        manager.connect().await.expect("connect");

        let actuator = Arc::new(UnlockActuator::new(config.clone(), manager.clone()));
        let router = CommandRouter::new(config.clone(), actuator);
        let session = SessionLoop::new(manager.clone(), router);
        let session_task = tokio::spawn(session.run());

        let (mut peer, _) = broker.accept().await.expect("accept");
        let subscribe = read_line(&mut peer).await;
        assert_eq!(subscribe, "cmd=1&uid=testuid&topic=bnv7cDLpM006\r\n");

        // Deliver the activate command split mid-delimiter.
        peer.write_all(b"cmd=2&uid=testuid&topic=bnv7cDLpM006&msg=on\r")
            .await
            .expect("write");
        peer.flush().await.expect("flush");
        sleep(Duration::from_millis(50)).await;
        peer.write_all(b"\n").await.expect("write");

        // The controller receives the configured frame...
        let mut buf = vec![0u8; 1024];
        let (n, _) = timeout(Duration::from_secs(2), controller.recv_from(&mut buf))
            .await
            .expect("datagram deadline")
            .expect("recv");
        assert_eq!(&buf[..n], dev.unlock_frame.as_ref());

        // ...and the broker receives the acknowledgment.
        let ack = read_line(&mut peer).await;
        assert_eq!(ack, "cmd=2&uid=testuid&topic=bnv7cDLpM006&msg=off\r\n");

        session_task.abort();
    }

    /// Peer close triggers a reconnect and a fresh subscription.
    #[tokio::test]
    async fn peer_close_leads_to_a_new_subscribed_session() {
        let broker = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let controller_addr = "127.0.0.1:14301".parse().expect("addr");

        let config = Arc::new(config_with(
            &broker.local_addr().expect("addr").to_string(),
            vec![device("garage", "fxJB63mYW006", controller_addr)],
        ));

        let manager = Arc::new(ConnectionManager::new(config.clone()));
        manager.connect().await.expect("connect");

        let actuator = Arc::new(UnlockActuator::new(config.clone(), manager.clone()));
        let router = CommandRouter::new(config.clone(), actuator);
        let session_task = tokio::spawn(SessionLoop::new(manager.clone(), router).run());

        let (mut peer, _) = broker.accept().await.expect("accept");
        let _ = read_line(&mut peer).await;
        drop(peer);

        // The loop notices the close, backs off, and redials.
        let (mut peer, _) = timeout(Duration::from_secs(2), broker.accept())
            .await
            .expect("redial deadline")
            .expect("accept");
        let subscribe = read_line(&mut peer).await;
        assert!(subscribe.starts_with("cmd=1&uid=testuid"));
        assert_eq!(manager.generation().await, 2);

        session_task.abort();
    }

    /// Multiple commands in one TCP segment are all processed.
    #[tokio::test]
    async fn coalesced_frames_are_all_processed() {
        let broker = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let first = UdpSocket::bind("127.0.0.1:0").await.expect("bind");
        let second = UdpSocket::bind("127.0.0.1:0").await.expect("bind");

        let config = Arc::new(config_with(
            &broker.local_addr().expect("addr").to_string(),
            vec![
                device("garage", "fxJB63mYW006", first.local_addr().expect("addr")),
                device(
                    "first-floor",
                    "bnv7cDLpM006",
                    second.local_addr().expect("addr"),
                ),
            ],
        ));

        let manager = Arc::new(ConnectionManager::new(config.clone()));
        manager.connect().await.expect("connect");

        let actuator = Arc::new(UnlockActuator::new(config.clone(), manager.clone()));
        let router = CommandRouter::new(config.clone(), actuator);
        let session_task = tokio::spawn(SessionLoop::new(manager.clone(), router).run());

        let (mut peer, _) = broker.accept().await.expect("accept");
        let _ = read_line(&mut peer).await;

        peer.write_all(
            b"cmd=2&uid=testuid&topic=fxJB63mYW006&msg=on\r\n\
              cmd=2&uid=testuid&topic=bnv7cDLpM006&msg=on\r\n",
        )
        .await
        .expect("write");

        let mut buf = vec![0u8; 1024];
        timeout(Duration::from_secs(2), first.recv_from(&mut buf))
            .await
            .expect("first datagram deadline")
            .expect("recv");
        timeout(Duration::from_secs(2), second.recv_from(&mut buf))
            .await
            .expect("second datagram deadline")
            .expect("recv");

        session_task.abort();
    }
}
