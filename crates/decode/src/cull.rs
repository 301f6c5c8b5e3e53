use std::collections::HashMap;

use fragstream_common::CameraState;
use fragstream_format::FragmentModel;
use glam::Vec3;
use serde::{Deserialize, Serialize};

use crate::config::CullConfig;
use crate::geometry::DecodedGeometry;

/// Level of detail chosen for a visible batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Lod {
    /// Full triangle data.
    Full,
    /// Bounding-box proxy only.
    Coarse,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct VisibleBatch {
    pub batch: u32,
    pub lod: Lod,
    /// Distance from the eye to the batch's bounding sphere surface.
    pub distance: f32,
}

/// Result of a culling pass.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VisibilitySet {
    /// Camera the set was computed for; `None` right after decode.
    pub camera: Option<CameraState>,
    pub visible: Vec<VisibleBatch>,
    pub culled: usize,
}

impl VisibilitySet {
    /// Every batch visible at full detail, used before any camera is known.
    pub fn all(model: &FragmentModel) -> Self {
        Self {
            camera: None,
            visible: model
                .batches
                .iter()
                .map(|b| VisibleBatch {
                    batch: b.id,
                    lod: Lod::Full,
                    distance: 0.0,
                })
                .collect(),
            culled: 0,
        }
    }

    pub fn is_visible(&self, batch: u32) -> bool {
        self.visible.iter().any(|v| v.batch == batch)
    }

    pub fn lod_of(&self, batch: u32) -> Option<Lod> {
        self.visible.iter().find(|v| v.batch == batch).map(|v| v.lod)
    }
}

/// A 2D cell coordinate in the batch grid (ignoring Y).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CellCoord {
    pub x: i32,
    pub z: i32,
}

impl CellCoord {
    pub fn new(x: i32, z: i32) -> Self {
        Self { x, z }
    }
}

/// Fixed-size XZ grid of batch centres.
///
/// Lets a refresh skip batches that are obviously out of range without
/// touching their bounds.
#[derive(Debug, Clone)]
pub struct BatchGrid {
    cell_size: f32,
    cells: HashMap<CellCoord, Vec<u32>>,
    /// Largest bounding-sphere radius of any batch, used to widen queries.
    max_radius: f32,
}

impl BatchGrid {
    pub fn build(model: &FragmentModel, cell_size: f32) -> Self {
        let cell_size = if cell_size > 0.0 { cell_size } else { 16.0 };
        let mut grid = Self {
            cell_size,
            cells: HashMap::new(),
            max_radius: 0.0,
        };
        for batch in &model.batches {
            let coord = grid.position_to_cell(batch.bounds.center());
            grid.cells.entry(coord).or_default().push(batch.id);
            grid.max_radius = grid.max_radius.max(batch.bounds.radius());
        }
        grid
    }

    pub fn cell_size(&self) -> f32 {
        self.cell_size
    }

    pub fn position_to_cell(&self, pos: Vec3) -> CellCoord {
        CellCoord {
            x: (pos.x / self.cell_size).floor() as i32,
            z: (pos.z / self.cell_size).floor() as i32,
        }
    }

    /// Number of non-empty cells.
    pub fn cell_count(&self) -> usize {
        self.cells.len()
    }

    /// Batch ids whose centre cell lies within `radius` of `center`,
    /// widened by the largest batch radius.
    pub fn candidates_within(&self, center: Vec3, radius: f32) -> Vec<u32> {
        let reach = radius + self.max_radius;
        let cells_reach = (reach / self.cell_size).ceil();
        let origin = self.position_to_cell(center);

        let mut out = Vec::new();
        // Scanning a huge square is slower than scanning every occupied cell.
        let span = (2.0 * cells_reach + 1.0).powi(2);
        if !span.is_finite() || span > self.cells.len() as f32 {
            let limit = cells_reach as i64;
            for (coord, ids) in &self.cells {
                let dx = (i64::from(coord.x) - i64::from(origin.x)).abs();
                let dz = (i64::from(coord.z) - i64::from(origin.z)).abs();
                if !cells_reach.is_finite() || (dx <= limit && dz <= limit) {
                    out.extend_from_slice(ids);
                }
            }
        } else {
            let r = cells_reach as i32;
            for dx in -r..=r {
                for dz in -r..=r {
                    let coord = CellCoord::new(origin.x + dx, origin.z + dz);
                    if let Some(ids) = self.cells.get(&coord) {
                        out.extend_from_slice(ids);
                    }
                }
            }
        }
        out
    }
}

/// Compute visible batches and their level of detail for a camera.
pub fn compute_visibility(
    geometry: &DecodedGeometry,
    camera: &CameraState,
    config: &CullConfig,
) -> VisibilitySet {
    let model = &geometry.model;
    let forward = camera.forward();
    let half_cone = camera.half_cone_angle();

    let mut visible: Vec<VisibleBatch> = geometry
        .grid
        .candidates_within(camera.eye, camera.far)
        .into_iter()
        .filter_map(|id| model.batch(id))
        .filter_map(|batch| {
            let center = batch.bounds.center();
            let radius = batch.bounds.radius();
            let to_center = center - camera.eye;
            let dist = to_center.length();
            let surface = (dist - radius).max(0.0);

            if surface > camera.far {
                return None;
            }
            if dist > radius {
                let cos = (to_center.dot(forward) / dist).clamp(-1.0, 1.0);
                let angle = cos.acos();
                let angular_radius = (radius / dist).clamp(0.0, 1.0).asin();
                if angle - angular_radius > half_cone {
                    return None;
                }
            }
            let lod = if surface <= config.lod_distance {
                Lod::Full
            } else {
                Lod::Coarse
            };
            Some(VisibleBatch {
                batch: batch.id,
                lod,
                distance: surface,
            })
        })
        .collect();

    visible.sort_by(|a, b| {
        a.distance
            .total_cmp(&b.distance)
            .then_with(|| a.batch.cmp(&b.batch))
    });
    visible.truncate(config.max_visible_batches);

    let culled = model.batches.len().saturating_sub(visible.len());
    tracing::trace!(visible = visible.len(), culled, "visibility computed");

    VisibilitySet {
        camera: Some(*camera),
        visible,
        culled,
    }
}
