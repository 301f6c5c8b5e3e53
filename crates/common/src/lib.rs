//! Shared types for the fragment streaming engine.
//!
//! # Invariants
//! - Model ids are caller-supplied and compared by value.
//! - Cameras are owned by the caller; everything else holds them weakly.

pub mod camera;
pub mod events;
pub mod types;

pub use camera::{CameraHandle, CameraState, WeakCamera};
pub use events::{EventList, ListenerId};
pub use types::{Bounds, JobId, ModelId};
