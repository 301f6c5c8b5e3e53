use serde::{Deserialize, Serialize};

/// Decode channel configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    /// Number of background worker threads. Models are sharded across them.
    pub workers: usize,
    pub cull: CullConfig,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            workers: 2,
            cull: CullConfig::default(),
        }
    }
}

/// Culling and level-of-detail parameters used by refresh.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CullConfig {
    /// Batches whose nearest point is further than this use the coarse LOD.
    pub lod_distance: f32,
    /// Maximum number of batches reported visible per refresh, nearest first.
    pub max_visible_batches: usize,
    /// Cell size (world units) of the spatial grid used to prefilter batches.
    pub cell_size: f32,
}

impl Default for CullConfig {
    fn default() -> Self {
        Self {
            lod_distance: 50.0,
            max_visible_batches: 4096,
            cell_size: 16.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_defaults() {
        let config = ChannelConfig::default();
        assert_eq!(config.workers, 2);
        assert_eq!(config.cull.lod_distance, 50.0);
        assert_eq!(config.cull.max_visible_batches, 4096);
        assert_eq!(config.cull.cell_size, 16.0);
    }
}
