//! Fragment payload envelope.
//!
//! Layout:
//! ```text
//! offset  size  field
//! 0       4     magic b"FRAG"
//! 4       4     format version (u32 LE)
//! 8       32    sha256 of body
//! 40      8     body length (u64 LE)
//! 48      n     body = zstd(CBOR(FragmentModel))
//! ```

use crate::model::FragmentModel;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::io::{Read, Write};
use std::path::Path;

pub const MAGIC: [u8; 4] = *b"FRAG";
/// Current payload format version.
pub const FORMAT_VERSION: u32 = 1;
pub const HEADER_LEN: usize = 48;

/// Largest decompressed body `decode` accepts.
pub const MAX_DECODED_BODY: u64 = 1 << 30;

/// Fixed so that output bytes never depend on caller settings.
const ZSTD_LEVEL: i32 = 3;

/// Errors from encoding or decoding fragment payloads.
#[derive(Debug, thiserror::Error)]
pub enum FormatError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("CBOR serialization error: {0}")]
    CborEncode(String),
    #[error("CBOR deserialization error: {0}")]
    CborDecode(String),
    #[error("not a fragment payload (bad magic)")]
    BadMagic,
    #[error("unsupported payload version v{found}, expected v{expected}")]
    UnsupportedVersion { found: u32, expected: u32 },
    #[error("payload truncated: need {needed} bytes, have {actual}")]
    Truncated { needed: usize, actual: usize },
    #[error("integrity check failed: expected {expected}, got {actual}")]
    IntegrityMismatch { expected: String, actual: String },
    #[error("payload body expands beyond {limit} bytes")]
    BodyTooLarge { limit: u64 },
    #[error("batch {0} references geometry outside its buffers")]
    InconsistentBatch(u32),
}

/// Parsed envelope header.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayloadHeader {
    pub version: u32,
    pub body_sha256: String,
    pub body_len: u64,
}

/// Encode a model into payload bytes.
pub fn encode(model: &FragmentModel) -> Result<Vec<u8>, FormatError> {
    let _span = tracing::debug_span!("fragment_encode", batches = model.batches.len()).entered();
    let cbor_bytes = cbor_serialize(model)?;
    let body = zstd_compress(&cbor_bytes)?;
    let digest = sha256(&body);

    let mut out = Vec::with_capacity(HEADER_LEN + body.len());
    out.extend_from_slice(&MAGIC);
    out.extend_from_slice(&FORMAT_VERSION.to_le_bytes());
    out.extend_from_slice(&digest);
    out.extend_from_slice(&(body.len() as u64).to_le_bytes());
    out.extend_from_slice(&body);

    tracing::debug!(
        raw = cbor_bytes.len(),
        compressed = body.len(),
        "encoded fragment payload"
    );
    Ok(out)
}

/// Read and validate the envelope header without decompressing the body.
pub fn peek_header(bytes: &[u8]) -> Result<PayloadHeader, FormatError> {
    if bytes.len() < MAGIC.len() || bytes[..4] != MAGIC {
        return Err(FormatError::BadMagic);
    }
    if bytes.len() < HEADER_LEN {
        return Err(FormatError::Truncated {
            needed: HEADER_LEN,
            actual: bytes.len(),
        });
    }
    let version = u32::from_le_bytes(read_array(&bytes[4..8]));
    if version != FORMAT_VERSION {
        return Err(FormatError::UnsupportedVersion {
            found: version,
            expected: FORMAT_VERSION,
        });
    }
    let body_len = u64::from_le_bytes(read_array(&bytes[40..48]));
    Ok(PayloadHeader {
        version,
        body_sha256: hex(&bytes[8..40]),
        body_len,
    })
}

/// Decode payload bytes, verifying integrity and batch consistency.
pub fn decode(bytes: &[u8]) -> Result<FragmentModel, FormatError> {
    decode_with_limit(bytes, MAX_DECODED_BODY)
}

/// [`decode`] with a caller-chosen cap on the decompressed body size.
pub fn decode_with_limit(bytes: &[u8], max_body: u64) -> Result<FragmentModel, FormatError> {
    let _span = tracing::debug_span!("fragment_decode", len = bytes.len()).entered();
    let header = peek_header(bytes)?;

    let needed = usize::try_from(header.body_len)
        .ok()
        .and_then(|len| len.checked_add(HEADER_LEN))
        .unwrap_or(usize::MAX);
    if bytes.len() < needed {
        return Err(FormatError::Truncated {
            needed,
            actual: bytes.len(),
        });
    }
    let body = &bytes[HEADER_LEN..needed];

    let actual = sha256_hex(body);
    if actual != header.body_sha256 {
        return Err(FormatError::IntegrityMismatch {
            expected: header.body_sha256,
            actual,
        });
    }

    let cbor_bytes = zstd_decompress(body, max_body)?;
    let model: FragmentModel = cbor_deserialize(&cbor_bytes)?;
    if let Some(bad) = model.batches.iter().find(|b| !b.is_consistent()) {
        return Err(FormatError::InconsistentBatch(bad.id));
    }
    Ok(model)
}

/// Write payload bytes verbatim to disk.
pub fn export_to(path: impl AsRef<Path>, payload: &[u8]) -> Result<(), FormatError> {
    if let Some(parent) = path.as_ref().parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    std::fs::write(path.as_ref(), payload)?;
    Ok(())
}

/// Read a payload from disk and check its header.
pub fn import_from(path: impl AsRef<Path>) -> Result<Vec<u8>, FormatError> {
    let bytes = std::fs::read(path.as_ref())?;
    peek_header(&bytes)?;
    Ok(bytes)
}

pub fn sha256_hex(data: &[u8]) -> String {
    hex(&sha256(data))
}

fn sha256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

fn read_array<const N: usize>(slice: &[u8]) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(&slice[..N]);
    out
}

fn cbor_serialize<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>, FormatError> {
    let mut buf = Vec::new();
    ciborium::into_writer(value, &mut buf).map_err(|e| FormatError::CborEncode(e.to_string()))?;
    Ok(buf)
}

fn cbor_deserialize<T: for<'de> Deserialize<'de>>(data: &[u8]) -> Result<T, FormatError> {
    ciborium::from_reader(data).map_err(|e| FormatError::CborDecode(e.to_string()))
}

fn zstd_compress(data: &[u8]) -> Result<Vec<u8>, FormatError> {
    let mut encoder = zstd::Encoder::new(Vec::new(), ZSTD_LEVEL)?;
    encoder.write_all(data)?;
    Ok(encoder.finish()?)
}

fn zstd_decompress(data: &[u8], limit: u64) -> Result<Vec<u8>, FormatError> {
    let decoder = zstd::Decoder::new(data)?;
    let mut buf = Vec::new();
    decoder.take(limit.saturating_add(1)).read_to_end(&mut buf)?;
    if buf.len() as u64 > limit {
        return Err(FormatError::BodyTooLarge { limit });
    }
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Batch, BatchItem, Element, PropertyValue};
    use fragstream_common::Bounds;
    use glam::Vec3;
    use std::collections::BTreeMap;

    fn sample_model() -> FragmentModel {
        let mut pset = BTreeMap::new();
        pset.insert("IsExternal".to_string(), PropertyValue::Boolean(true));
        pset.insert("FireRating".to_string(), PropertyValue::Text("REI60".into()));
        let mut properties = BTreeMap::new();
        properties.insert("Pset_WallCommon".to_string(), pset);

        let bounds = Bounds::new(Vec3::ZERO, Vec3::new(1.0, 1.0, 0.0));
        let mut elements = BTreeMap::new();
        elements.insert(
            12,
            Element {
                global_id: "2O2Fr$t4X7Zf8NOew3FLOH".into(),
                class: "IFCWALL".into(),
                name: Some("Wall-001".into()),
                batch: Some(0),
                bounds,
                properties,
            },
        );

        FragmentModel {
            schema: "IFC4".into(),
            name: "sample".into(),
            source_hash: sha256_hex(b"source"),
            bounds,
            batches: vec![Batch {
                id: 0,
                class: "IFCWALL".into(),
                positions: vec![[0.0, 0.0, 0.0], [1.0, 0.0, 0.0], [0.0, 1.0, 0.0]],
                indices: vec![0, 1, 2],
                items: vec![BatchItem {
                    element: 12,
                    index_start: 0,
                    index_count: 3,
                }],
                bounds,
            }],
            elements,
        }
    }

    #[test]
    fn encode_decode_preserves_model() {
        let model = sample_model();
        let bytes = encode(&model).unwrap();
        assert_eq!(&bytes[..4], b"FRAG");
        let decoded = decode(&bytes).unwrap();
        assert_eq!(decoded, model);
    }

    #[test]
    fn encoding_is_deterministic() {
        let model = sample_model();
        assert_eq!(encode(&model).unwrap(), encode(&model.clone()).unwrap());
    }

    #[test]
    fn header_reports_body() {
        let bytes = encode(&sample_model()).unwrap();
        let header = peek_header(&bytes).unwrap();
        assert_eq!(header.version, FORMAT_VERSION);
        assert_eq!(header.body_len as usize, bytes.len() - HEADER_LEN);
        assert_eq!(header.body_sha256, sha256_hex(&bytes[HEADER_LEN..]));
    }

    #[test]
    fn bad_magic_rejected() {
        let mut bytes = encode(&sample_model()).unwrap();
        bytes[0] = b'X';
        assert!(matches!(decode(&bytes), Err(FormatError::BadMagic)));
        assert!(matches!(decode(b""), Err(FormatError::BadMagic)));
    }

    #[test]
    fn version_mismatch_fail_closed() {
        let mut bytes = encode(&sample_model()).unwrap();
        bytes[4..8].copy_from_slice(&999u32.to_le_bytes());
        match decode(&bytes) {
            Err(FormatError::UnsupportedVersion { found, expected }) => {
                assert_eq!(found, 999);
                assert_eq!(expected, FORMAT_VERSION);
            }
            other => panic!("expected UnsupportedVersion, got: {other:?}"),
        }
    }

    #[test]
    fn truncated_body_rejected() {
        let bytes = encode(&sample_model()).unwrap();
        let cut = &bytes[..bytes.len() - 4];
        assert!(matches!(decode(cut), Err(FormatError::Truncated { .. })));
        assert!(matches!(
            decode(&bytes[..20]),
            Err(FormatError::Truncated { .. })
        ));
    }

    #[test]
    fn corruption_detected() {
        let mut bytes = encode(&sample_model()).unwrap();
        if let Some(byte) = bytes.last_mut() {
            *byte ^= 0xff;
        }
        assert!(matches!(
            decode(&bytes),
            Err(FormatError::IntegrityMismatch { .. })
        ));
    }

    #[test]
    fn inconsistent_batch_rejected() {
        let mut model = sample_model();
        model.batches[0].indices = vec![0, 1, 7];
        let bytes = encode(&model).unwrap();
        assert!(matches!(
            decode(&bytes),
            Err(FormatError::InconsistentBatch(0))
        ));
    }

    #[test]
    fn oversized_body_rejected() {
        let mut model = sample_model();
        model.name = "a".repeat(1 << 20);
        let bytes = encode(&model).unwrap();
        assert!(bytes.len() < 64 * 1024);

        assert!(matches!(
            decode_with_limit(&bytes, 64 * 1024),
            Err(FormatError::BodyTooLarge { limit: 65536 })
        ));
        assert_eq!(decode(&bytes).unwrap().name.len(), 1 << 20);
    }

    #[test]
    fn export_import_is_bit_for_bit() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("out").join("sample.frag");
        let bytes = encode(&sample_model()).unwrap();

        export_to(&path, &bytes).unwrap();
        let loaded = import_from(&path).unwrap();
        assert_eq!(loaded, bytes);
    }

    #[test]
    fn import_rejects_foreign_file() {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(tmp.path(), b"ISO-10303-21;").unwrap();
        assert!(matches!(
            import_from(tmp.path()),
            Err(FormatError::BadMagic)
        ));
    }
}
