//! Decode channel: a message-passing boundary to background workers that
//! decode fragment payloads and recompute visibility.
//!
//! # Invariants
//! - Decode and refresh never run on the caller's thread.
//! - Every request gets exactly one reply, even when the channel closes or a
//!   worker crashes.
//! - Requests for one model are handled in issue order; requests for
//!   different models carry no relative ordering.
//! - Decoded geometry is owned channel-side until `dispose` or `close`.

mod channel;
mod config;
mod cull;
mod geometry;
mod worker;

pub use channel::{ChannelError, DecodeChannel, Pending, RequestId};
pub use config::{ChannelConfig, CullConfig};
pub use cull::{BatchGrid, CellCoord, Lod, VisibilitySet, VisibleBatch, compute_visibility};
pub use geometry::{DecodedGeometry, GeometryHandle};
pub use worker::{DecodeBackend, FragmentWorker, WorkerEntry};
