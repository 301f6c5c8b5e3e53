use std::path::Path;

use fragstream_decode::ChannelConfig;
use serde::{Deserialize, Serialize};

use crate::error::EngineError;
use crate::scheduler::SchedulerConfig;

/// Engine configuration. Every section has defaults, so an empty file is a
/// valid configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Decode workers and the culling parameters they apply.
    pub channel: ChannelConfig,
    pub scheduler: SchedulerConfig,
}

impl EngineConfig {
    /// Load from a `.json` file, or YAML for any other extension.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, EngineError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| EngineError::Config(format!("{}: {e}", path.display())))?;
        let is_json = path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
        let config = if is_json {
            Self::from_json(&text)
        } else {
            Self::from_yaml(&text)
        }?;
        tracing::debug!(path = %path.display(), "loaded engine config");
        Ok(config)
    }

    pub fn from_yaml(text: &str) -> Result<Self, EngineError> {
        if text.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(text).map_err(|e| EngineError::Config(e.to_string()))
    }

    pub fn from_json(text: &str) -> Result<Self, EngineError> {
        serde_json::from_str(text).map_err(|e| EngineError::Config(e.to_string()))
    }
}
