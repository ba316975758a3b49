//! Doorlink Shared Protocol Types
//!
//! This crate provides the broker wire-format helpers, the line framing
//! codec, and the link lifecycle state machine shared by the gateway's
//! connection, heartbeat, and actuation paths.

pub mod codec;
pub mod command;
pub mod state_machine;

/// Line terminator of the broker's text protocol.
pub const LINE_DELIMITER: &[u8] = b"\r\n";

/// Keepalive probe, sent verbatim.
pub const KEEPALIVE: &[u8] = b"ping\r\n";

/// Build the subscription line announcing every configured topic.
///
/// Wire shape: `cmd=1&uid=<UID>&topic=<t1>,<t2>,...\r\n`
pub fn subscribe_line<S: AsRef<str>>(uid: &str, topics: &[S]) -> String {
    let joined = topics
        .iter()
        .map(|t| t.as_ref())
        .collect::<Vec<_>>()
        .join(",");
    format!("cmd=1&uid={uid}&topic={joined}\r\n")
}

/// Build the acknowledgment line reporting a completed unlock for a topic.
///
/// Wire shape: `cmd=2&uid=<UID>&topic=<topic>&msg=off\r\n`
pub fn ack_line(uid: &str, topic: &str) -> String {
    format!("cmd=2&uid={uid}&topic={topic}&msg=off\r\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subscribe_line_joins_topics() {
        let line = subscribe_line("abc123", &["t1", "t2", "t3"]);
        assert_eq!(line, "cmd=1&uid=abc123&topic=t1,t2,t3\r\n");
    }

    #[test]
    fn subscribe_line_single_topic() {
        let line = subscribe_line("abc123", &["only"]);
        assert_eq!(line, "cmd=1&uid=abc123&topic=only\r\n");
    }

    #[test]
    fn ack_line_reports_off() {
        let line = ack_line("abc123", "bnv7cDLpM006");
        assert_eq!(line, "cmd=2&uid=abc123&topic=bnv7cDLpM006&msg=off\r\n");
    }
}
