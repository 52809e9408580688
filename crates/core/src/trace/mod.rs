//! The trace emitter: record formats and the process-wide sink.
//!
//! Two kinds of record share one line format (see [`sink::TraceSink`]):
//! direct records emitted by the pipeline's filter path, and cache-miss
//! records emitted by the designated tracing level. Both go through the
//! same sink, which is the only stateful I/O surface in this crate.

/// The formatted-line writer shared by direct records, miss records, and
/// the teardown statistics block.
pub mod sink;
