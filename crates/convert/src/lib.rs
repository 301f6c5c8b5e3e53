//! Conversion pipeline: turns ISO-10303-21 exchange files into fragment
//! payloads on a background thread.
//!
//! # Invariants
//! - Progress values delivered to a job never decrease, and each job ends in
//!   exactly one terminal outcome.
//! - After `cancel` returns, no progress is delivered and no output exists.
//! - The same input and options always produce the same payload bytes.

mod error;
mod extract;
mod job;
mod pipeline;
mod runtime;
pub mod step;

pub use error::ConversionError;
pub use job::{
    CancelToken, ConversionJob, ConvertOptions, Converter, JobOutcome, Progress, ProgressCallback,
    Stage,
};
pub use runtime::{RuntimeLocator, SchemaRuntime};
