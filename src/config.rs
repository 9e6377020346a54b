/// Node configuration.
///
/// Every field has a compiled-in default; a JSON document (for example
/// `node.json` on the data partition) overrides any subset of them.
use core::time::Duration;

use heapless::String;
use serde::Deserialize;

use crate::beacon::BeaconSettings;
use crate::board;
use crate::engine::OpResolver;
use crate::error::NodeError;
use crate::model::ModelSettings;

/// Maximum length for model ids and directory names
pub type NameString = String<32>;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Beacon period in milliseconds
    pub beacon_interval_ms: u32,
    /// Request and response channel capacity of the storage worker
    pub storage_queue_capacity: usize,
    /// Request and response channel capacity of the model worker
    pub model_queue_capacity: usize,
    /// Scratch arena bytes per loaded model
    pub arena_size: usize,
    /// Peer directory slots
    pub max_peers: usize,
    /// Model RUN every beacon interval
    pub default_model: NameString,
    /// Directory holding `<model id>.bin` files
    pub model_dir: NameString,
    /// Bytes of beacon model input
    pub model_input_len: usize,
    /// Expire peers not heard for this long; 0 disables expiry
    pub peer_timeout_ms: u32,
    /// Bound on beacon model calls; 0 waits indefinitely
    pub request_timeout_ms: u32,
    /// Received-frame channel capacity
    pub rx_queue_capacity: usize,
    /// Status report period; 0 disables the monitor
    pub status_interval_ms: u32,
    /// Stack size of every node thread
    pub task_stack_size: usize,
}

impl NodeConfig {
    pub fn new() -> Self {
        Self {
            beacon_interval_ms: 5000,
            storage_queue_capacity: 10,
            model_queue_capacity: 5,
            arena_size: board::MODEL_ARENA_SIZE,
            max_peers: 20,
            default_model: name("capability"),
            model_dir: name("models"),
            model_input_len: 256,
            peer_timeout_ms: 0,
            request_timeout_ms: 0,
            rx_queue_capacity: 16,
            status_interval_ms: 10_000,
            task_stack_size: 64 * 1024,
        }
    }

    /// Parse a JSON document over the defaults and validate the result.
    pub fn from_json(json: &[u8]) -> Result<Self, NodeError> {
        let (config, _) = serde_json_core::from_slice::<NodeConfig>(trim_trailing_whitespace(json))
            .map_err(|e| {
                log::warn!("config parse error: {:?}", e);
                NodeError::Config("malformed JSON")
            })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), NodeError> {
        let checks = [
            (self.beacon_interval_ms == 0, "beacon_interval_ms must be non-zero"),
            (self.storage_queue_capacity == 0, "storage_queue_capacity must be non-zero"),
            (self.model_queue_capacity == 0, "model_queue_capacity must be non-zero"),
            (self.rx_queue_capacity == 0, "rx_queue_capacity must be non-zero"),
            (self.max_peers == 0, "max_peers must be non-zero"),
            (self.arena_size == 0, "arena_size must be non-zero"),
            (self.model_input_len == 0, "model_input_len must be non-zero"),
            (self.task_stack_size == 0, "task_stack_size must be non-zero"),
            (self.default_model.is_empty(), "default_model must not be empty"),
        ];
        match checks.iter().find(|(failed, _)| *failed) {
            Some((_, reason)) => Err(NodeError::Config(*reason)),
            None => Ok(()),
        }
    }

    pub fn model_settings(&self) -> ModelSettings {
        ModelSettings {
            arena_size: self.arena_size,
            capacity: self.model_queue_capacity,
            stack_size: self.task_stack_size,
            resolver: OpResolver::with_defaults(),
        }
    }

    pub fn beacon_settings(&self) -> BeaconSettings {
        BeaconSettings {
            model_id: self.default_model.as_str().into(),
            interval: Duration::from_millis(self.beacon_interval_ms.into()),
            request_timeout: match self.request_timeout_ms {
                0 => None,
                ms => Some(Duration::from_millis(ms.into())),
            },
            peer_timeout_ms: self.peer_timeout_ms,
        }
    }

    /// Monitor period, `None` when disabled.
    pub fn status_interval(&self) -> Option<Duration> {
        match self.status_interval_ms {
            0 => None,
            ms => Some(Duration::from_millis(ms.into())),
        }
    }
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self::new()
    }
}

fn name(s: &str) -> NameString {
    let mut out = NameString::new();
    // Defaults are short literals.
    let _ = out.push_str(s);
    out
}

fn trim_trailing_whitespace(data: &[u8]) -> &[u8] {
    let end = data
        .iter()
        .rposition(|b| !b.is_ascii_whitespace())
        .map_or(0, |i| i + 1);
    &data[..end]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = NodeConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.beacon_interval_ms, 5000);
        assert_eq!(config.storage_queue_capacity, 10);
        assert_eq!(config.model_queue_capacity, 5);
        assert_eq!(config.max_peers, 20);
        assert_eq!(config.default_model.as_str(), "capability");
        assert_eq!(config.arena_size, board::MODEL_ARENA_SIZE);
    }

    #[test]
    fn json_overrides_subset() {
        let json = br#"{"beacon_interval_ms":1000,"max_peers":4,"default_model":"tiny"}
"#;
        let config = NodeConfig::from_json(json).unwrap();
        assert_eq!(config.beacon_interval_ms, 1000);
        assert_eq!(config.max_peers, 4);
        assert_eq!(config.default_model.as_str(), "tiny");
        // untouched fields keep defaults
        assert_eq!(config.model_queue_capacity, 5);
        assert_eq!(config.model_dir.as_str(), "models");
    }

    #[test]
    fn empty_object_yields_defaults() {
        assert_eq!(NodeConfig::from_json(b"{}").unwrap(), NodeConfig::default());
    }

    #[test]
    fn invalid_values_are_rejected() {
        assert_eq!(
            NodeConfig::from_json(br#"{"model_queue_capacity":0}"#),
            Err(NodeError::Config("model_queue_capacity must be non-zero"))
        );
        assert_eq!(
            NodeConfig::from_json(br#"{"default_model":""}"#),
            Err(NodeError::Config("default_model must not be empty"))
        );
        assert_eq!(
            NodeConfig::from_json(b"not json"),
            Err(NodeError::Config("malformed JSON"))
        );
    }

    #[test]
    fn timeouts_of_zero_disable() {
        let mut config = NodeConfig::default();
        assert_eq!(config.beacon_settings().request_timeout, None);
        assert!(config.status_interval().is_some());

        config.request_timeout_ms = 250;
        config.status_interval_ms = 0;
        assert_eq!(
            config.beacon_settings().request_timeout,
            Some(Duration::from_millis(250))
        );
        assert_eq!(config.status_interval(), None);
    }
}
