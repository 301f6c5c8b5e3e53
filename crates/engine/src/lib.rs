//! Engine layer: which models are loaded, when their visibility is
//! recomputed, and how everything is torn down.
//!
//! # Invariants
//! - At most one model per id; an id can be reused only after disposal.
//! - At most one refresh round is in flight; triggers arriving meanwhile
//!   coalesce into one follow-up round that reads the current camera.
//! - A result for a disposed model is discarded on arrival.
//! - Shutdown is idempotent and runs on drop.

mod config;
mod error;
mod models;
pub mod registry;
pub mod scheduler;

pub use config::EngineConfig;
pub use error::EngineError;
pub use models::FragmentModels;
pub use registry::{DecodeState, DetachSignal, GeometryRelease, Model, ModelRegistry, RegistryError};
pub use scheduler::{SchedulerConfig, SchedulerStats, UpdateScheduler};
