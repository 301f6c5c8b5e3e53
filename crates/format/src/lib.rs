//! Fragment payload: the compact geometry representation handed to the
//! decode channel.
//!
//! # Invariants
//! - Encoding is deterministic: the same model always yields the same bytes.
//! - A payload is self-describing and re-loadable from its bytes alone.
//! - Corrupted or truncated payloads fail closed.

mod codec;
mod model;

pub use codec::{
    FORMAT_VERSION, FormatError, HEADER_LEN, MAGIC, MAX_DECODED_BODY, PayloadHeader, decode,
    decode_with_limit, encode, export_to, import_from, peek_header, sha256_hex,
};
pub use model::{Batch, BatchItem, Element, FragmentModel, PropertyValue};
