use fragstream_common::Bounds;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A decoded fragment model: drawable batches plus per-element metadata.
///
/// Uses BTreeMap everywhere so that serialization order (and therefore the
/// encoded payload) is canonical.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FragmentModel {
    /// Schema of the source exchange file, e.g. `IFC4`.
    pub schema: String,
    /// Human-readable model name taken from the source project.
    pub name: String,
    /// SHA-256 of the exchange bytes this payload was produced from.
    pub source_hash: String,
    pub bounds: Bounds,
    pub batches: Vec<Batch>,
    /// Elements keyed by their source record id.
    pub elements: BTreeMap<u64, Element>,
}

/// A group of triangles drawn with a single call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Batch {
    pub id: u32,
    /// Product class shared by every element in the batch.
    pub class: String,
    pub positions: Vec<[f32; 3]>,
    pub indices: Vec<u32>,
    pub items: Vec<BatchItem>,
    pub bounds: Bounds,
}

/// Index range of one element inside a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchItem {
    pub element: u64,
    pub index_start: u32,
    pub index_count: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Element {
    pub global_id: String,
    pub class: String,
    pub name: Option<String>,
    /// Batch holding this element's triangles, if it has any geometry.
    pub batch: Option<u32>,
    pub bounds: Bounds,
    /// Property sets by name, each mapping property name to value.
    pub properties: BTreeMap<String, BTreeMap<String, PropertyValue>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PropertyValue {
    Text(String),
    Integer(i64),
    Real(f64),
    Boolean(bool),
    Null,
}

impl Batch {
    pub fn triangle_count(&self) -> usize {
        self.indices.len() / 3
    }

    /// Check index ranges against the vertex and index buffers.
    pub fn is_consistent(&self) -> bool {
        let vertex_count = self.positions.len() as u64;
        if self.indices.len() % 3 != 0 {
            return false;
        }
        if self.indices.iter().any(|&i| u64::from(i) >= vertex_count) {
            return false;
        }
        self.items.iter().all(|item| {
            u64::from(item.index_start) + u64::from(item.index_count) <= self.indices.len() as u64
        })
    }
}

impl FragmentModel {
    pub fn element_count(&self) -> usize {
        self.elements.len()
    }

    pub fn triangle_count(&self) -> usize {
        self.batches.iter().map(Batch::triangle_count).sum()
    }

    /// Batch id for an element, via the element-to-batch index.
    pub fn batch_for_element(&self, element: u64) -> Option<u32> {
        self.elements.get(&element).and_then(|e| e.batch)
    }

    pub fn batch(&self, id: u32) -> Option<&Batch> {
        self.batches.iter().find(|b| b.id == id)
    }

    /// Element-to-batch index for every element that has geometry.
    pub fn element_index(&self) -> BTreeMap<u64, u32> {
        self.elements
            .iter()
            .filter_map(|(id, e)| e.batch.map(|b| (*id, b)))
            .collect()
    }
}
