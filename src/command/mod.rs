//! Inbound command routing and device actuation

mod router;
mod unlock;

pub use router::CommandRouter;
pub use unlock::UnlockActuator;
