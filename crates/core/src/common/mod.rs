//! Address types, access kinds, and error taxonomy.
//!
//! This module defines the small strong types shared by the pipeline and the
//! cache hierarchy. It provides:
//! 1. **Address types:** [`addr::VirtAddr`] / [`addr::PhysAddr`] to keep
//!    guest-virtual and host-translated-physical addresses from mixing.
//! 2. **Access kinds:** [`access::AccessKind`], the load/store/fetch
//!    discriminant threaded through the whole pipeline.
//! 3. **Errors:** [`error::ConfigError`], the only error type the core ever
//!    surfaces, and only at startup.

/// Virtual and physical address newtypes.
pub mod addr;
/// The load/store/fetch discriminant.
pub mod access;
/// Startup configuration errors.
pub mod error;
