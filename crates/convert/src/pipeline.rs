//! The staged conversion run executed on a job's background thread.

use fragstream_common::Bounds;
use fragstream_format::FragmentModel;

use crate::error::ConversionError;
use crate::extract::{self, GEOMETRY_CHUNK, GeometryExtractor};
use crate::job::{Progress, Stage};
use crate::runtime::{RuntimeLocator, SchemaRuntime};
use crate::step;

/// Progress checkpoints per stage, as fractions of the whole run.
const PARSE_END: f32 = 0.4;
const GEOMETRY_END: f32 = 0.7;
const PROPERTIES_END: f32 = 0.85;

/// The caller asked the run to stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interrupted;

#[derive(Debug)]
pub enum RunError {
    Interrupted,
    Failed(ConversionError),
}

impl From<Interrupted> for RunError {
    fn from(_: Interrupted) -> Self {
        Self::Interrupted
    }
}

impl From<ConversionError> for RunError {
    fn from(e: ConversionError) -> Self {
        Self::Failed(e)
    }
}

/// Receives progress, and is the only place a run may be interrupted.
pub type Reporter<'a> = dyn FnMut(Progress) -> Result<(), Interrupted> + 'a;

/// Convert exchange bytes into an encoded fragment payload.
pub fn run(
    bytes: &[u8],
    locator: &RuntimeLocator,
    report: &mut Reporter<'_>,
) -> Result<Vec<u8>, RunError> {
    report(Progress::new(Stage::Parsing, 0.0))?;
    let runtime = SchemaRuntime::load(locator)?;

    let file = {
        let _span = tracing::info_span!("convert_parse", bytes = bytes.len()).entered();
        let parsed = step::parse(bytes, &mut |fraction| {
            let value = fraction.clamp(0.0, 1.0) * PARSE_END;
            report(Progress::new(Stage::Parsing, value)).is_ok()
        })
        .map_err(|e| ConversionError::Parse {
            stage: Stage::Parsing,
            line: e.line,
            message: e.message,
        })?;
        match parsed {
            Some(file) => file,
            None => return Err(RunError::Interrupted),
        }
    };

    if !runtime.supports_schema(&file.schema) {
        return Err(ConversionError::Parse {
            stage: Stage::Parsing,
            line: 0,
            message: format!(
                "schema {:?} is not supported by runtime {}",
                file.schema, runtime.name
            ),
        }
        .into());
    }
    tracing::debug!(schema = %file.schema, records = file.records.len(), "parsed exchange file");

    report(Progress::new(Stage::GeometryExtraction, PARSE_END))?;
    let products = extract::product_ids(&file, &runtime);
    let mut elements = extract::elements(&file, &products);
    let meshes = {
        let _span = tracing::info_span!("convert_geometry", products = products.len()).entered();
        let mut extractor = GeometryExtractor::new(&file, &runtime);
        let mut meshes = Vec::with_capacity(products.len());
        let chunks = products.len().div_ceil(GEOMETRY_CHUNK).max(1);
        for (i, chunk) in products.chunks(GEOMETRY_CHUNK).enumerate() {
            meshes.extend(chunk.iter().filter_map(|id| extractor.mesh(*id)));
            let done = (i + 1) as f32 / chunks as f32;
            let value = PARSE_END + done * (GEOMETRY_END - PARSE_END);
            report(Progress::new(Stage::GeometryExtraction, value))?;
        }
        meshes
    };
    let batches = extract::build_batches(meshes, &mut elements);

    report(Progress::new(Stage::PropertyExtraction, GEOMETRY_END))?;
    let attached = {
        let _span = tracing::info_span!("convert_properties").entered();
        extract::attach_properties(&file, &mut elements)
    };

    report(Progress::new(Stage::Serialization, PROPERTIES_END))?;
    let model = FragmentModel {
        schema: file.schema.clone(),
        name: extract::model_name(&file),
        source_hash: fragstream_format::sha256_hex(bytes),
        bounds: batches
            .iter()
            .fold(Bounds::EMPTY, |acc, b| acc.union(&b.bounds)),
        batches,
        elements,
    };
    let payload = {
        let _span = tracing::info_span!("convert_serialize").entered();
        fragstream_format::encode(&model).map_err(ConversionError::from)?
    };
    tracing::info!(
        elements = model.element_count(),
        batches = model.batches.len(),
        triangles = model.triangle_count(),
        properties = attached,
        payload_bytes = payload.len(),
        "conversion finished"
    );

    report(Progress::new(Stage::Serialization, 1.0))?;
    Ok(payload)
}
