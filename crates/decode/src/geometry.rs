use std::collections::BTreeMap;
use std::sync::Arc;

use fragstream_common::{Bounds, ModelId};
use fragstream_format::{Batch, FragmentModel};

use crate::cull::{BatchGrid, Lod, VisibilitySet};

/// Decoded model held by a worker on behalf of one model id.
#[derive(Debug)]
pub struct DecodedGeometry {
    pub model: FragmentModel,
    pub grid: BatchGrid,
}

impl DecodedGeometry {
    pub fn new(model: FragmentModel, cell_size: f32) -> Self {
        let grid = BatchGrid::build(&model, cell_size);
        Self { model, grid }
    }
}

/// What the caller gets back from `decode`/`refresh`: a read-only view of the
/// decoded batches plus the visibility computed for them.
#[derive(Debug, Clone)]
pub struct GeometryHandle {
    pub model_id: ModelId,
    /// Per-model counter, bumped by every decode or refresh result.
    pub revision: u64,
    pub geometry: Arc<DecodedGeometry>,
    pub visibility: VisibilitySet,
}

impl GeometryHandle {
    pub fn bounds(&self) -> Bounds {
        self.geometry.model.bounds
    }

    pub fn batch_count(&self) -> usize {
        self.geometry.model.batches.len()
    }

    pub fn element_index(&self) -> BTreeMap<u64, u32> {
        self.geometry.model.element_index()
    }

    /// Visible batches with their level of detail, nearest first.
    pub fn visible_batches(&self) -> impl Iterator<Item = (&Batch, Lod)> + '_ {
        self.visibility
            .visible
            .iter()
            .filter_map(|v| self.geometry.model.batch(v.batch).map(|b| (b, v.lod)))
    }
}
