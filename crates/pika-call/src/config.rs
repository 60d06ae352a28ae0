use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::media::IceServer;

const CONFIG_FILE_NAME: &str = "pika_call.json";
const SETTLE_OVERRIDE_ENV: &str = "PIKA_CALL_SETTLE_MS";

pub const DEFAULT_TOPIC_PREFIX: &str = "call";
const DEFAULT_STUN_URL: &str = "stun:stun.l.google.com:19302";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct CallConfig {
    pub topic_prefix: String,
    pub ice_servers: Vec<IceServer>,
    /// Pause between subscription confirmation and the Initiator's first Offer.
    pub settle_delay_ms: u64,
    pub offer_retry_delay_ms: u64,
    pub subscribe_timeout_ms: u64,
    pub answer_timeout_ms: u64,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            topic_prefix: DEFAULT_TOPIC_PREFIX.to_string(),
            ice_servers: vec![IceServer {
                urls: vec![DEFAULT_STUN_URL.to_string()],
                username: None,
                credential: None,
            }],
            settle_delay_ms: 1_000,
            offer_retry_delay_ms: 1_000,
            subscribe_timeout_ms: 5_000,
            answer_timeout_ms: 45_000,
        }
    }
}

impl CallConfig {
    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    pub fn offer_retry_delay(&self) -> Duration {
        Duration::from_millis(self.offer_retry_delay_ms)
    }

    pub fn subscribe_timeout(&self) -> Duration {
        Duration::from_millis(self.subscribe_timeout_ms)
    }

    pub fn answer_timeout(&self) -> Duration {
        Duration::from_millis(self.answer_timeout_ms)
    }

    fn apply_env_overrides(mut self) -> Self {
        if let Some(ms) = std::env::var(SETTLE_OVERRIDE_ENV)
            .ok()
            .and_then(|v| v.trim().parse::<u64>().ok())
        {
            self.settle_delay_ms = ms;
        }
        self
    }
}

/// Reads `pika_call.json` from `data_dir`. A missing or malformed file yields
/// the defaults.
pub fn load_call_config(data_dir: &str) -> CallConfig {
    let path = Path::new(data_dir).join(CONFIG_FILE_NAME);
    let config = match std::fs::read(&path) {
        Ok(bytes) => serde_json::from_slice::<CallConfig>(&bytes).unwrap_or_else(|err| {
            tracing::warn!(path = %path.display(), %err, "ignoring malformed call config");
            CallConfig::default()
        }),
        Err(_) => CallConfig::default(),
    };
    config.apply_env_overrides()
}
