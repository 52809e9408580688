//! The cache hierarchy arena and the tracer registry that dispatches
//! into it.
//!
//! Cache levels never own their successor: a `CacheHierarchy` owns every
//! level in one `Vec`, and each level's miss handler is an index into that
//! vector. This is the idiomatic-Rust rendition of "a non-owning reference
//! to its successor" — it sidesteps `Rc<RefCell<_>>` entirely, which would
//! otherwise be forced by L2 being the miss handler of both L1 instances at
//! once.

use super::CacheLevel;
#[cfg(test)]
use super::CacheStats;
use crate::common::access::AccessKind;
use crate::common::error::ConfigError;
use crate::config::GeometryConfig;
use crate::trace::sink::TraceSink;

/// Which L1 levels are wired into the fan-out dispatch, in registration
/// order (L1-I before L1-D, fixed for reproducibility — see
/// `CacheHierarchy::trace`).
#[derive(Debug, Default)]
struct TracerRegistry {
    l1_i: Option<usize>,
    l1_d: Option<usize>,
}

/// Owns every cache level and resolves the miss-handler chain by index.
///
/// Built incrementally with [`CacheHierarchy::init_l1`],
/// [`CacheHierarchy::init_l2`], [`CacheHierarchy::init_l3`], then
/// [`CacheHierarchy::finalize`]. `L1-I → L2 → L3` is the only chain shape;
/// cycles are impossible because each init call requires its parent to
/// already be present and levels are never re-wired afterward.
#[derive(Debug, Default)]
pub struct CacheHierarchy {
    levels: Vec<CacheLevel>,
    registry: TracerRegistry,
    l2: Option<usize>,
    l3: Option<usize>,
    trace_code: bool,
}

impl CacheHierarchy {
    /// Creates an empty hierarchy. `trace_code` gates whether `init_l1`
    /// wires L1-I into the tracer registry (see the data model's
    /// `trace_code` field); L1-I is still built either way.
    pub fn new(trace_code: bool) -> Self {
        Self {
            levels: Vec::new(),
            registry: TracerRegistry::default(),
            l2: None,
            l3: None,
            trace_code,
        }
    }

    /// Whether any cache level has been built. The pipeline consults this
    /// to decide between the cache path and the direct emitter.
    pub fn is_enabled(&self) -> bool {
        !self.levels.is_empty()
    }

    fn push_level(&mut self, level: CacheLevel) -> usize {
        self.levels.push(level);
        self.levels.len() - 1
    }

    /// Parses `cfg` and builds L1-I and L1-D with identical geometry,
    /// registering them with the tracer registry (L1-I only if `trace_code`
    /// is set).
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if `cfg` doesn't parse as valid geometry.
    pub fn init_l1(&mut self, cfg: &str) -> Result<(), ConfigError> {
        let geometry = GeometryConfig::parse(cfg)?;
        let i_idx = self.push_level(CacheLevel::new("L1-I", geometry));
        let d_idx = self.push_level(CacheLevel::new("L1-D", geometry));
        if self.trace_code {
            self.registry.l1_i = Some(i_idx);
        }
        self.registry.l1_d = Some(d_idx);
        Ok(())
    }

    /// Parses `cfg`, builds L2, and sets it as the miss handler of both L1
    /// instances.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingParent`] if L1 has not been built yet,
    /// or a parse error if `cfg` is malformed.
    pub fn init_l2(&mut self, cfg: &str) -> Result<(), ConfigError> {
        if self.registry.l1_d.is_none() {
            return Err(ConfigError::MissingParent {
                level: "L2",
                parent: "L1",
            });
        }
        let geometry = GeometryConfig::parse(cfg)?;
        let idx = self.push_level(CacheLevel::new("L2", geometry));
        if let Some(i) = self.registry.l1_i {
            self.levels[i].set_miss_handler(idx);
        }
        if let Some(d) = self.registry.l1_d {
            self.levels[d].set_miss_handler(idx);
        }
        self.l2 = Some(idx);
        Ok(())
    }

    /// Parses `cfg`, builds L3, and sets it as L2's miss handler.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingParent`] if L2 has not been built yet,
    /// or a parse error if `cfg` is malformed.
    pub fn init_l3(&mut self, cfg: &str) -> Result<(), ConfigError> {
        let Some(l2) = self.l2 else {
            return Err(ConfigError::MissingParent {
                level: "L3",
                parent: "L2",
            });
        };
        let geometry = GeometryConfig::parse(cfg)?;
        let idx = self.push_level(CacheLevel::new("L3", geometry));
        self.levels[l2].set_miss_handler(idx);
        self.l3 = Some(idx);
        Ok(())
    }

    /// Marks the deepest level as the tracing tap: L3 if present, else L2,
    /// else both L1 instances.
    pub fn finalize(&mut self) {
        if let Some(l3) = self.l3 {
            self.levels[l3].set_trace_miss(true);
        } else if let Some(l2) = self.l2 {
            self.levels[l2].set_trace_miss(true);
        } else {
            if let Some(i) = self.registry.l1_i {
                self.levels[i].set_trace_miss(true);
            }
            if let Some(d) = self.registry.l1_d {
                self.levels[d].set_trace_miss(true);
            }
        }
    }

    /// Name of the deepest built level, for the finalize header line.
    pub fn deepest_level_name(&self) -> Option<&str> {
        if let Some(l3) = self.l3 {
            Some(self.levels[l3].name())
        } else if let Some(l2) = self.l2 {
            Some(self.levels[l2].name())
        } else if let Some(d) = self.registry.l1_d {
            Some(self.levels[d].name())
        } else {
            None
        }
    }

    /// Fans out an access to whichever L1 instance declares interest in
    /// `kind`: L1-I for `Fetch`, L1-D for `Load`/`Store`. Iteration order is
    /// fixed (L1-I before L1-D) for reproducibility, though only one is ever
    /// interested in a given access.
    pub fn trace(&mut self, vaddr: u64, paddr: u64, size: u64, kind: AccessKind, sink: &mut TraceSink) {
        match kind {
            AccessKind::Fetch => {
                if let Some(i) = self.registry.l1_i {
                    let _ = self.access_level(i, vaddr, paddr, size, false, sink);
                }
            }
            AccessKind::Load | AccessKind::Store => {
                if let Some(d) = self.registry.l1_d {
                    let store = kind.is_store();
                    let _ = self.access_level(d, vaddr, paddr, size, store, sink);
                }
            }
        }
    }

    /// The full per-level access algorithm: accounting, hit/miss decision,
    /// miss-callback emission, victim selection, and writeback/fill
    /// propagation to the miss handler. Recurses into the miss handler by
    /// index, never by reference, so levels shared by multiple parents need
    /// no interior mutability.
    ///
    /// Returns whether the access hit.
    fn access_level(
        &mut self,
        idx: usize,
        vaddr: u64,
        paddr: u64,
        size: u64,
        store: bool,
        sink: &mut TraceSink,
    ) -> bool {
        self.levels[idx].record_access(store, size);

        if self.levels[idx].try_hit(paddr, store) {
            return true;
        }

        let line_bytes = self.levels[idx].line_bytes();
        let line_mask = line_bytes - 1;
        let aligned_vaddr = vaddr & !line_mask;
        let aligned_paddr = paddr & !line_mask;

        if self.levels[idx].trace_miss() {
            sink.write_miss(aligned_vaddr, aligned_paddr, line_bytes, store);
        }
        self.levels[idx].record_miss(store);

        let eviction = self.levels[idx].victimize(vaddr, paddr, store);
        let miss_handler = self.levels[idx].miss_handler();

        if let Some(ev) = eviction {
            self.levels[idx].record_writeback();
            if let Some(mh) = miss_handler {
                let _ = self.access_level(mh, ev.src.val(), ev.paddr.val(), line_bytes, true, sink);
            }
        }

        if let Some(mh) = miss_handler {
            let _ = self.access_level(mh, aligned_vaddr, aligned_paddr, line_bytes, false, sink);
        }

        if store {
            self.levels[idx].mark_dirty(paddr);
        }

        false
    }

    /// Writes each built level's statistics block to `sink`, in top-down
    /// order (L1s, L2, L3), suppressing levels that saw zero accesses.
    pub fn shutdown(&mut self, sink: &mut TraceSink) {
        let order: Vec<usize> = [self.registry.l1_i, self.registry.l1_d, self.l2, self.l3]
            .into_iter()
            .flatten()
            .collect();
        for idx in order {
            let level = &self.levels[idx];
            if level.stats().total_accesses() > 0 {
                sink.write_stats_block(level.name(), level.stats());
            }
        }
    }

    /// Flushes any resident dirty lines without destroying the levels.
    /// Exposed for tests that want to assert writeback behavior without a
    /// full teardown.
    #[cfg(test)]
    fn stats_of(&self, idx: usize) -> &CacheStats {
        self.levels[idx].stats()
    }
}
