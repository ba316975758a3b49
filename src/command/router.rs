//! Routes decoded broker lines to device actuation
//!
//! Matching is deliberately permissive: a device matches when its topic
//! token appears anywhere in the command text, first match wins. Only the
//! activate shape dispatches an unlock; everything else is logged and
//! ignored, never an error.

use std::sync::Arc;

use doorlink_shared::command::Command;
use tracing::{debug, error, info};

use crate::config::{DeviceConfig, GatewayConfig};

use super::UnlockActuator;

pub struct CommandRouter {
    config: Arc<GatewayConfig>,
    actuator: Arc<UnlockActuator>,
}

impl CommandRouter {
    pub fn new(config: Arc<GatewayConfig>, actuator: Arc<UnlockActuator>) -> Self {
        Self { config, actuator }
    }

    /// Handle one framed broker line. Unlocks are dispatched fire-and-forget
    /// on their own tasks; the caller's receive loop is never blocked.
    pub fn route(&self, frame: &[u8]) {
        let command = Command::decode(frame);
        info!(command = %command.as_str(), "broker command received");

        let Some(device) = self.match_device(&command) else {
            debug!(
                topic = command.param("topic").unwrap_or("-"),
                "no configured device for command"
            );
            return;
        };

        if !command.is_activate() {
            debug!(device = %device.id, "command is not an activation, ignoring");
            return;
        }

        info!(device = %device.id, topic = %device.topic, "unlock command accepted");
        let actuator = self.actuator.clone();
        let device = device.clone();
        tokio::spawn(async move {
            if let Err(e) = actuator.unlock(&device).await {
                error!(device = %device.id, error = %e, "unlock attempt failed");
            }
        });
    }

    /// First configured device whose topic appears in the command text.
    fn match_device(&self, command: &Command) -> Option<&DeviceConfig> {
        self.config
            .devices
            .iter()
            .find(|d| command.mentions_topic(&d.topic))
    }
}
