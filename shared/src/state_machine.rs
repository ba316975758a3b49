//! Link Lifecycle State Machine
//!
//! Tracks the broker session through Disconnected -> Connecting -> Connected
//! and hands out a generation number per established link, so racing
//! reconnect paths (receive loop vs. heartbeat) can tell a stale link from
//! the live one.

/// Lifecycle phase of the broker link
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkPhase {
    /// No session exists
    Disconnected,
    /// A dial attempt is in flight
    Connecting,
    /// A live session exists
    Connected,
}

/// Events that can drive a lifecycle transition
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// A dial attempt started
    DialStarted,
    /// The dial attempt produced a live, subscribed session
    DialSucceeded,
    /// The dial attempt failed (socket, timeout, or subscribe error)
    DialFailed,
    /// The peer closed the session (zero-length read)
    PeerClosed,
    /// A receive on the session failed
    ReceiveFailed,
    /// The keepalive probe could not be written
    ProbeFailed,
    /// Explicit local teardown
    Shutdown,
}

/// Result of applying an event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    /// The event was valid and the link entered a new phase
    Entered(LinkPhase),
    /// The event does not apply in the current phase and was ignored
    Ignored { phase: LinkPhase, event: LinkEvent },
}

/// The link lifecycle state machine
#[derive(Debug)]
pub struct LinkStateMachine {
    phase: LinkPhase,
    generation: u64,
}

impl Default for LinkStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl LinkStateMachine {
    /// Create a new state machine in the Disconnected phase
    pub fn new() -> Self {
        Self {
            phase: LinkPhase::Disconnected,
            generation: 0,
        }
    }

    /// Current phase
    pub fn phase(&self) -> LinkPhase {
        self.phase
    }

    /// Generation of the current (or most recent) established link.
    /// Starts at zero and increments once per successful dial.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Whether a live session exists
    pub fn is_connected(&self) -> bool {
        self.phase == LinkPhase::Connected
    }

    /// Apply an event and return the resulting transition
    pub fn apply(&mut self, event: LinkEvent) -> Transition {
        use LinkEvent::*;
        use LinkPhase::*;

        let next = match (self.phase, &event) {
            // A dial may start from any phase: reconnects replace live links
            (_, DialStarted) => Some(Connecting),

            (Connecting, DialSucceeded) => Some(Connected),
            (Connecting, DialFailed) => Some(Disconnected),

            // Loss events only mean something while a session exists
            (Connected, PeerClosed | ReceiveFailed | ProbeFailed) => Some(Disconnected),

            (_, Shutdown) => Some(Disconnected),

            _ => None,
        };

        match next {
            Some(phase) => {
                if phase == LinkPhase::Connected {
                    self.generation += 1;
                }
                self.phase = phase;
                Transition::Entered(phase)
            }
            None => Transition::Ignored {
                phase: self.phase,
                event,
            },
        }
    }
}
