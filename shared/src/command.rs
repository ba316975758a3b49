//! Decoded broker command lines
//!
//! Commands arrive as text of the general shape
//! `cmd=<n>&uid=<uid>&topic=<topic>&msg=<value>`. Decoding is permissive:
//! invalid byte sequences map to replacement characters instead of failing
//! the receive loop, and unknown shapes simply match nothing downstream.

/// Opcode prefix identifying a device activation.
const ACTIVATE_PREFIX: &str = "cmd=2";

/// Parameter that arms the activation; anything else is a no-op.
const ACTIVATE_PARAM: &str = "msg=on";

/// One decoded command line from the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    line: String,
}

impl Command {
    /// Decode a raw frame permissively.
    pub fn decode(frame: &[u8]) -> Self {
        Self {
            line: String::from_utf8_lossy(frame).trim().to_string(),
        }
    }

    /// The decoded text.
    pub fn as_str(&self) -> &str {
        &self.line
    }

    /// Whether the command text mentions the given topic anywhere.
    pub fn mentions_topic(&self, topic: &str) -> bool {
        self.line.contains(topic)
    }

    /// Whether this is an activate command: a `cmd=2`-prefixed line whose
    /// parameters include `msg=on`.
    pub fn is_activate(&self) -> bool {
        self.line.starts_with(ACTIVATE_PREFIX) && self.line.contains(ACTIVATE_PARAM)
    }

    /// Value of a `key=value` parameter, if present.
    pub fn param(&self, key: &str) -> Option<&str> {
        self.line.split('&').find_map(|pair| {
            let (k, v) = pair.split_once('=')?;
            (k == key).then_some(v)
        })
    }
}
