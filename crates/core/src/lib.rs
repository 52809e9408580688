//! Memory-access tracing and multi-level cache simulation core.
//!
//! This crate implements the part of a full-system CPU emulator that decides,
//! for every guest load, store, and instruction fetch, whether to drop the
//! access, drive it through a simulated cache hierarchy, or emit a trace
//! record for it directly. It provides:
//! 1. **Pipeline:** filtering, page-crossing splitting, and dispatch
//!    ([`pipeline`]).
//! 2. **Cache hierarchy:** set-associative and fully-associative cache
//!    levels chained by miss handlers, with random replacement
//!    ([`cache`], [`lfsr`]).
//! 3. **Trace sink:** the line-formatted output used for both direct
//!    records and last-level-cache miss records ([`trace`]).
//!
//! The crate has no knowledge of any particular emulator; it is driven
//! entirely through the [`pipeline::TracePipeline`] API and the
//! [`pipeline::AddressTranslator`] collaborator trait. An embedder that
//! needs a C-ABI surface wraps this crate; see `tracecache-ffi`.

/// Common types shared across the crate: addresses, access kinds, errors.
pub mod common;
/// Cache hierarchy: levels, storage variants, statistics, the arena.
pub mod cache;
/// Cache geometry and region-window configuration parsing.
pub mod config;
/// Galois linear-feedback shift register used for victim selection.
pub mod lfsr;
/// Top-level access pipeline: filtering, page-splitting, dispatch.
pub mod pipeline;
/// Trace sink: the formatted-line writer shared by direct and miss records.
pub mod trace;

pub use crate::cache::CacheHierarchy;
pub use crate::common::access::AccessKind;
pub use crate::common::addr::{PhysAddr, VirtAddr};
pub use crate::common::error::ConfigError;
pub use crate::pipeline::{AddressTranslator, TracePipeline};
