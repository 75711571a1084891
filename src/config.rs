use std::{fs, path::Path, time::Duration};

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::{
    s21::Timing,
    transport::{TransportConfig, TransportError},
};

/*
{
   "transport": "serial:/dev/ttyUSB0",
   "poll_interval_ms": 2000,
   "ack_timeout_ms": 800,
   "reply_timeout_ms": 500,
   "inter_byte_timeout_ms": 100,
   "settle_ms": 500,
   "max_missed_cycles": 5,
   "control_attempts": 3
}
*/

/// Driver settings, loadable from a JSON file. Missing fields keep their
/// defaults.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct DriverConfig {
    pub transport: Option<String>,
    pub poll_interval_ms: u64,
    pub ack_timeout_ms: u64,
    pub reply_timeout_ms: u64,
    pub inter_byte_timeout_ms: u64,
    pub settle_ms: u64,
    pub max_missed_cycles: u32,
    pub control_attempts: u32,
}

impl Default for DriverConfig {
    fn default() -> Self {
        let timing = Timing::default();

        Self {
            transport: None,
            poll_interval_ms: 2000,
            ack_timeout_ms: timing.ack_timeout.as_millis() as u64,
            reply_timeout_ms: timing.reply_timeout.as_millis() as u64,
            inter_byte_timeout_ms: timing.inter_byte_timeout.as_millis() as u64,
            settle_ms: timing.settle.as_millis() as u64,
            max_missed_cycles: 5,
            control_attempts: 3,
        }
    }
}

impl DriverConfig {
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        Self::from_json(&contents).with_context(|| format!("invalid config {}", path.display()))
    }

    pub fn from_json(json: &str) -> anyhow::Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn timing(&self) -> Timing {
        Timing {
            ack_timeout: Duration::from_millis(self.ack_timeout_ms),
            reply_timeout: Duration::from_millis(self.reply_timeout_ms),
            inter_byte_timeout: Duration::from_millis(self.inter_byte_timeout_ms),
            settle: Duration::from_millis(self.settle_ms),
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn transport_config(&self) -> Result<Option<TransportConfig>, TransportError> {
        self.transport.as_deref().map(str::parse).transpose()
    }
}
