//! Turns parsed STEP records into fragment model parts: element metadata,
//! triangle meshes grouped into batches, and property sets.

use std::collections::{BTreeMap, HashMap, HashSet};

use fragstream_common::Bounds;
use fragstream_format::{Batch, BatchItem, Element, PropertyValue};
use glam::{Mat4, Vec3};

use crate::runtime::SchemaRuntime;
use crate::step::{StepFile, StepRecord, StepValue};

/// Elements per batch before a new batch of the same class is started.
pub const MAX_ITEMS_PER_BATCH: usize = 128;

/// Products processed between two progress checkpoints.
pub const GEOMETRY_CHUNK: usize = 256;

/// Placement chains deeper than this are treated as cyclic.
const MAX_PLACEMENT_DEPTH: usize = 64;

// IfcProduct attribute positions.
const ATTR_GLOBAL_ID: usize = 0;
const ATTR_NAME: usize = 2;
const ATTR_PLACEMENT: usize = 5;

/// Triangulated geometry of one element in world space.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ElementMesh {
    pub element: u64,
    pub class: String,
    pub positions: Vec<Vec3>,
    pub indices: Vec<u32>,
}

impl ElementMesh {
    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }
}

/// Record ids of every product in the file, ascending.
pub fn product_ids(file: &StepFile, runtime: &SchemaRuntime) -> Vec<u64> {
    file.records
        .values()
        .filter(|r| runtime.is_product(&r.keyword))
        .map(|r| r.id)
        .collect()
}

/// Element metadata for every product, without geometry or properties.
pub fn elements(file: &StepFile, products: &[u64]) -> BTreeMap<u64, Element> {
    products
        .iter()
        .filter_map(|id| file.get(*id))
        .map(|record| {
            let element = Element {
                global_id: record
                    .arg(ATTR_GLOBAL_ID)
                    .and_then(StepValue::as_str)
                    .unwrap_or_default()
                    .to_owned(),
                class: record.keyword.clone(),
                name: record
                    .arg(ATTR_NAME)
                    .and_then(StepValue::as_str)
                    .map(str::to_owned),
                ..Element::default()
            };
            (record.id, element)
        })
        .collect()
}

/// Project name, falling back to the header file name.
pub fn model_name(file: &StepFile) -> String {
    file.records_of("IFCPROJECT")
        .next()
        .and_then(|p| p.arg(ATTR_NAME))
        .and_then(StepValue::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_owned)
        .or_else(|| (!file.file_name.is_empty()).then(|| file.file_name.clone()))
        .unwrap_or_else(|| "model".to_owned())
}

/// Walks products and builds their meshes, sharing placement lookups.
pub struct GeometryExtractor<'a> {
    file: &'a StepFile,
    runtime: &'a SchemaRuntime,
    placements: HashMap<u64, Mat4>,
}

impl<'a> GeometryExtractor<'a> {
    pub fn new(file: &'a StepFile, runtime: &'a SchemaRuntime) -> Self {
        Self {
            file,
            runtime,
            placements: HashMap::new(),
        }
    }

    pub fn mesh(&mut self, product: u64) -> Option<ElementMesh> {
        let file = self.file;
        let record = file.get(product)?;
        let transform = match record.arg(ATTR_PLACEMENT).and_then(StepValue::as_ref_id) {
            Some(id) => self.placement(id, 0),
            None => Mat4::IDENTITY,
        };

        let mut mesh = ElementMesh {
            element: product,
            class: record.keyword.clone(),
            ..ElementMesh::default()
        };
        for loop_id in self.reachable_loops(record) {
            let Some(points) = file
                .get(loop_id)
                .and_then(|l| l.arg(0))
                .and_then(StepValue::as_list)
            else {
                continue;
            };
            let corners: Vec<Vec3> = points
                .iter()
                .filter_map(StepValue::as_ref_id)
                .filter_map(|id| self.point(id))
                .map(|p| transform.transform_point3(p))
                .collect();
            fan_triangulate(&corners, &mut mesh);
        }
        Some(mesh)
    }

    /// Every `IFCPOLYLOOP` reachable from the product's arguments, in a stable
    /// order. Other products are not entered.
    fn reachable_loops(&self, product: &StepRecord) -> Vec<u64> {
        let mut loops = Vec::new();
        let mut seen = HashSet::new();
        let mut stack: Vec<u64> = Vec::new();
        push_refs(&product.args, &mut stack);
        stack.reverse();
        seen.insert(product.id);

        while let Some(id) = stack.pop() {
            if !seen.insert(id) {
                continue;
            }
            let Some(record) = self.file.get(id) else {
                continue;
            };
            if record.keyword == "IFCPOLYLOOP" {
                loops.push(id);
                continue;
            }
            if self.runtime.is_product(&record.keyword) || record.keyword == "IFCCARTESIANPOINT" {
                continue;
            }
            let start = stack.len();
            push_refs(&record.args, &mut stack);
            stack[start..].reverse();
        }
        loops
    }

    fn point(&self, id: u64) -> Option<Vec3> {
        let record = self.file.get(id)?;
        if record.keyword != "IFCCARTESIANPOINT" {
            return None;
        }
        coords(record.arg(0)?)
    }

    fn direction(&self, value: Option<&StepValue>) -> Option<Vec3> {
        let record = self.file.get(value?.as_ref_id()?)?;
        if record.keyword != "IFCDIRECTION" {
            return None;
        }
        coords(record.arg(0)?)
    }

    /// World transform of an `IFCLOCALPLACEMENT`, following `PlacementRelTo`.
    fn placement(&mut self, id: u64, depth: usize) -> Mat4 {
        if let Some(m) = self.placements.get(&id) {
            return *m;
        }
        if depth > MAX_PLACEMENT_DEPTH {
            tracing::warn!(record = id, "placement chain too deep, ignoring parent");
            return Mat4::IDENTITY;
        }
        let file = self.file;
        let Some(record) = file.get(id) else {
            return Mat4::IDENTITY;
        };
        if record.keyword != "IFCLOCALPLACEMENT" {
            return Mat4::IDENTITY;
        }
        let parent = record.arg(0).and_then(StepValue::as_ref_id);
        let relative = record.arg(1).and_then(StepValue::as_ref_id);

        let local = relative.map_or(Mat4::IDENTITY, |r| self.axis_placement(r));
        let world = match parent {
            Some(p) => self.placement(p, depth + 1) * local,
            None => local,
        };
        self.placements.insert(id, world);
        world
    }

    fn axis_placement(&self, id: u64) -> Mat4 {
        let Some(record) = self.file.get(id) else {
            return Mat4::IDENTITY;
        };
        let location = record
            .arg(0)
            .and_then(StepValue::as_ref_id)
            .and_then(|p| self.point(p))
            .unwrap_or(Vec3::ZERO);
        if record.keyword != "IFCAXIS2PLACEMENT3D" {
            return Mat4::from_translation(location);
        }

        let z = self
            .direction(record.arg(1))
            .and_then(|d| d.try_normalize())
            .unwrap_or(Vec3::Z);
        let x_hint = self.direction(record.arg(2)).unwrap_or(Vec3::X);
        let x = (x_hint - z * x_hint.dot(z))
            .try_normalize()
            .unwrap_or_else(|| z.any_orthonormal_vector());
        let y = z.cross(x);
        Mat4::from_cols(x.extend(0.0), y.extend(0.0), z.extend(0.0), location.extend(1.0))
    }
}

fn push_refs(values: &[StepValue], out: &mut Vec<u64>) {
    for value in values {
        match value {
            StepValue::Ref(id) => out.push(*id),
            StepValue::List(items) | StepValue::Typed(_, items) => push_refs(items, out),
            _ => {}
        }
    }
}

fn coords(value: &StepValue) -> Option<Vec3> {
    let c: Vec<f32> = value
        .as_list()?
        .iter()
        .filter_map(StepValue::as_f64)
        .map(|v| v as f32)
        .collect();
    match c.as_slice() {
        [x, y] => Some(Vec3::new(*x, *y, 0.0)),
        [x, y, z, ..] => Some(Vec3::new(*x, *y, *z)),
        _ => None,
    }
}

fn fan_triangulate(corners: &[Vec3], mesh: &mut ElementMesh) {
    if corners.len() < 3 {
        return;
    }
    let base = mesh.positions.len() as u32;
    mesh.positions.extend_from_slice(corners);
    for i in 1..(corners.len() as u32 - 1) {
        mesh.indices.extend_from_slice(&[base, base + i, base + i + 1]);
    }
}

/// Group meshes into per-class batches and record each element's batch and
/// bounds. Batch ids follow class name order, then element id order.
pub fn build_batches(meshes: Vec<ElementMesh>, elements: &mut BTreeMap<u64, Element>) -> Vec<Batch> {
    let mut by_class: BTreeMap<String, Vec<ElementMesh>> = BTreeMap::new();
    for mesh in meshes.into_iter().filter(|m| !m.is_empty()) {
        by_class.entry(mesh.class.clone()).or_default().push(mesh);
    }

    let mut batches = Vec::new();
    for (class, mut group) in by_class {
        group.sort_by_key(|m| m.element);
        for chunk in group.chunks(MAX_ITEMS_PER_BATCH) {
            let id = batches.len() as u32;
            let mut batch = Batch {
                id,
                class: class.clone(),
                ..Batch::default()
            };
            for mesh in chunk {
                let base = batch.positions.len() as u32;
                let index_start = batch.indices.len() as u32;
                batch
                    .positions
                    .extend(mesh.positions.iter().map(|p| p.to_array()));
                batch.indices.extend(mesh.indices.iter().map(|i| base + i));
                batch.items.push(BatchItem {
                    element: mesh.element,
                    index_start,
                    index_count: mesh.indices.len() as u32,
                });

                let bounds = Bounds::from_points(&mesh.positions);
                batch.bounds = batch.bounds.union(&bounds);
                if let Some(element) = elements.get_mut(&mesh.element) {
                    element.batch = Some(id);
                    element.bounds = bounds;
                }
            }
            batches.push(batch);
        }
    }
    batches
}

/// Attach property sets to elements via `IFCRELDEFINESBYPROPERTIES`.
///
/// Returns the number of property values attached.
pub fn attach_properties(file: &StepFile, elements: &mut BTreeMap<u64, Element>) -> usize {
    let mut attached = 0;
    for rel in file.records_of("IFCRELDEFINESBYPROPERTIES") {
        let Some(pset) = rel
            .arg(5)
            .and_then(StepValue::as_ref_id)
            .and_then(|id| file.get(id))
            .filter(|r| r.keyword == "IFCPROPERTYSET")
        else {
            continue;
        };
        let set_name = pset
            .arg(2)
            .and_then(StepValue::as_str)
            .unwrap_or_default()
            .to_owned();

        let mut values = BTreeMap::new();
        for prop in pset
            .arg(4)
            .and_then(StepValue::as_list)
            .unwrap_or_default()
            .iter()
            .filter_map(StepValue::as_ref_id)
            .filter_map(|id| file.get(id))
            .filter(|r| r.keyword == "IFCPROPERTYSINGLEVALUE")
        {
            let Some(name) = prop.arg(0).and_then(StepValue::as_str) else {
                continue;
            };
            values.insert(name.to_owned(), property_value(prop.arg(2)));
        }

        let related = rel.arg(4).and_then(StepValue::as_list).unwrap_or_default();
        for target in related.iter().filter_map(StepValue::as_ref_id) {
            if let Some(element) = elements.get_mut(&target) {
                attached += values.len();
                element
                    .properties
                    .entry(set_name.clone())
                    .or_default()
                    .extend(values.clone());
            }
        }
    }
    attached
}

fn property_value(value: Option<&StepValue>) -> PropertyValue {
    match value {
        Some(StepValue::Typed(_, inner)) => property_value(inner.first()),
        Some(StepValue::Str(s)) => PropertyValue::Text(s.clone()),
        Some(StepValue::Integer(i)) => PropertyValue::Integer(*i),
        Some(StepValue::Real(r)) => PropertyValue::Real(*r),
        Some(StepValue::Enum(e)) => match e.as_str() {
            "T" | "TRUE" => PropertyValue::Boolean(true),
            "F" | "FALSE" => PropertyValue::Boolean(false),
            "U" | "UNKNOWN" => PropertyValue::Null,
            other => PropertyValue::Text(other.to_owned()),
        },
        _ => PropertyValue::Null,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::step;

    const WALL: &str = "ISO-10303-21;
HEADER;
FILE_NAME('wall.ifc','',(''),(''),'','','');
FILE_SCHEMA(('IFC4'));
ENDSEC;
DATA;
#1=IFCPROJECT('0001',$,'Tower',$,$,$,$,$,$);
#10=IFCCARTESIANPOINT((0.,0.,0.));
#11=IFCCARTESIANPOINT((4.,0.,0.));
#12=IFCCARTESIANPOINT((4.,0.,3.));
#13=IFCCARTESIANPOINT((0.,0.,3.));
#14=IFCPOLYLOOP((#10,#11,#12,#13));
#15=IFCFACEOUTERBOUND(#14,.T.);
#16=IFCFACE((#15));
#17=IFCCLOSEDSHELL((#16));
#18=IFCFACETEDBREP(#17);
#19=IFCSHAPEREPRESENTATION(#30,'Body','Brep',(#18));
#20=IFCPRODUCTDEFINITIONSHAPE($,$,(#19));
#30=IFCGEOMETRICREPRESENTATIONCONTEXT($,'Model',3,1.E-5,#31,$);
#31=IFCAXIS2PLACEMENT3D(#10,$,$);
#40=IFCCARTESIANPOINT((10.,0.,0.));
#41=IFCAXIS2PLACEMENT3D(#40,$,$);
#42=IFCLOCALPLACEMENT($,#41);
#50=IFCWALL('2O2Fr$t4X7Zf8NOew3FLOH',$,'Wall-1',$,$,#42,#20,$,$);
#51=IFCSLAB('3cUkl32yn9qRSPvBJVyWYp',$,'Slab-1',$,$,$,$,$,$);
#60=IFCPROPERTYSINGLEVALUE('IsExternal',$,IFCBOOLEAN(.T.),$);
#61=IFCPROPERTYSINGLEVALUE('Width',$,IFCLENGTHMEASURE(0.25),$);
#62=IFCPROPERTYSINGLEVALUE('Mark',$,IFCLABEL('W1'),$);
#63=IFCPROPERTYSET('pset',$,'Pset_WallCommon',$,(#60,#61,#62));
#64=IFCRELDEFINESBYPROPERTIES('rel',$,$,$,(#50),#63);
ENDSEC;
END-ISO-10303-21;
";

    fn parsed() -> StepFile {
        step::parse(WALL.as_bytes(), &mut |_| true).unwrap().unwrap()
    }

    #[test]
    fn finds_products_and_metadata() {
        let file = parsed();
        let runtime = SchemaRuntime::builtin();
        let products = product_ids(&file, &runtime);
        assert_eq!(products, vec![50, 51]);

        let elements = elements(&file, &products);
        let wall = &elements[&50];
        assert_eq!(wall.class, "IFCWALL");
        assert_eq!(wall.global_id, "2O2Fr$t4X7Zf8NOew3FLOH");
        assert_eq!(wall.name.as_deref(), Some("Wall-1"));
        assert_eq!(model_name(&file), "Tower");
    }

    #[test]
    fn quad_loop_is_fan_triangulated_and_placed() {
        let file = parsed();
        let runtime = SchemaRuntime::builtin();
        let mut extractor = GeometryExtractor::new(&file, &runtime);

        let mesh = extractor.mesh(50).unwrap();
        assert_eq!(mesh.positions.len(), 4);
        assert_eq!(mesh.indices, vec![0, 1, 2, 0, 2, 3]);
        // Local placement shifts the wall by 10 on X.
        assert_eq!(mesh.positions[0], Vec3::new(10.0, 0.0, 0.0));
        assert_eq!(mesh.positions[2], Vec3::new(14.0, 0.0, 3.0));

        let slab = extractor.mesh(51).unwrap();
        assert!(slab.is_empty());
    }

    #[test]
    fn rotated_placement_applies_axes() {
        let src = WALL.replace(
            "#41=IFCAXIS2PLACEMENT3D(#40,$,$);",
            "#41=IFCAXIS2PLACEMENT3D(#40,$,#43);\n#43=IFCDIRECTION((0.,1.,0.));",
        );
        let file = step::parse(src.as_bytes(), &mut |_| true).unwrap().unwrap();
        let runtime = SchemaRuntime::builtin();
        let mesh = GeometryExtractor::new(&file, &runtime).mesh(50).unwrap();
        // Local X now points along world Y.
        let p = mesh.positions[1];
        assert!((p - Vec3::new(10.0, 4.0, 0.0)).length() < 1e-5, "{p:?}");
    }

    #[test]
    fn batches_group_by_class() {
        let file = parsed();
        let runtime = SchemaRuntime::builtin();
        let products = product_ids(&file, &runtime);
        let mut elements = elements(&file, &products);
        let mut extractor = GeometryExtractor::new(&file, &runtime);
        let meshes: Vec<ElementMesh> = products.iter().filter_map(|p| extractor.mesh(*p)).collect();

        let batches = build_batches(meshes, &mut elements);
        assert_eq!(batches.len(), 1);
        let batch = &batches[0];
        assert_eq!(batch.class, "IFCWALL");
        assert!(batch.is_consistent());
        assert_eq!(batch.items.len(), 1);
        assert_eq!(elements[&50].batch, Some(0));
        assert_eq!(elements[&51].batch, None);
        assert!(!elements[&50].bounds.is_empty());
    }

    #[test]
    fn large_class_splits_into_several_batches() {
        let mut elements = BTreeMap::new();
        let meshes: Vec<ElementMesh> = (0..(MAX_ITEMS_PER_BATCH as u64 + 5))
            .map(|id| {
                elements.insert(id, Element::default());
                ElementMesh {
                    element: id,
                    class: "IFCBEAM".into(),
                    positions: vec![Vec3::ZERO, Vec3::X, Vec3::Y],
                    indices: vec![0, 1, 2],
                }
            })
            .collect();
        let batches = build_batches(meshes, &mut elements);
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[1].items.len(), 5);
        assert_eq!(batches[1].indices[..3], [0, 1, 2]);
        assert!(batches.iter().all(Batch::is_consistent));
    }

    #[test]
    fn properties_are_attached() {
        let file = parsed();
        let runtime = SchemaRuntime::builtin();
        let mut elements = elements(&file, &product_ids(&file, &runtime));

        assert_eq!(attach_properties(&file, &mut elements), 3);
        let pset = &elements[&50].properties["Pset_WallCommon"];
        assert_eq!(pset["IsExternal"], PropertyValue::Boolean(true));
        assert_eq!(pset["Width"], PropertyValue::Real(0.25));
        assert_eq!(pset["Mark"], PropertyValue::Text("W1".into()));
        assert!(elements[&51].properties.is_empty());
    }
}
