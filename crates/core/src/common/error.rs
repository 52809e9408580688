//! Startup configuration errors.
//!
//! This is the only error type the core ever surfaces, and only while
//! building the cache hierarchy or setting the filter region — never from
//! the per-access pipeline, which is fail-silent once started.

use thiserror::Error;

/// Fatal misconfiguration detected while parsing a region string, a cache
/// geometry string, or wiring a cache level onto a missing parent.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// `set_region` received a string that isn't `"<hex_start>:<hex_end>"`.
    #[error("malformed region string {0:?}; expected \"<hex_start>:<hex_end>\"")]
    MalformedRegion(String),

    /// A cache geometry string isn't `"sets:ways:linesize"` with the
    /// required power-of-two constraints.
    #[error("malformed cache geometry string {0:?}; expected \"sets:ways:linesize\"")]
    MalformedGeometry(String),

    /// Cache geometry parsed but violated a structural constraint (sets or
    /// line size not a power of two, or line size below 8 bytes).
    #[error("invalid cache geometry {geometry:?}: {reason}")]
    InvalidGeometry {
        /// The offending geometry string.
        geometry: String,
        /// Human-readable reason.
        reason: &'static str,
    },

    /// `init_l2` was called before `init_l1`, or `init_l3` before `init_l2`.
    #[error("{level} requires {parent} to be initialized first")]
    MissingParent {
        /// The level being built (`"L2"` or `"L3"`).
        level: &'static str,
        /// The level it depends on (`"L1"` or `"L2"`).
        parent: &'static str,
    },

    /// The trace sink file could not be opened.
    #[error("failed to open trace sink {path:?}: {source}")]
    SinkOpen {
        /// The path that failed to open.
        path: String,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },
}
