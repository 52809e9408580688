//! The top-level access pipeline: filtering, page-crossing splitting, and
//! dispatch to either the direct emitter or the cache hierarchy.
//!
//! [`TracePipeline`] is the single object an embedder constructs and owns;
//! every other type in this crate exists to serve it. It has no knowledge
//! of any particular host — address translation is injected through
//! [`AddressTranslator`], and the sink is an ordinary file or stdout opened
//! by [`TracePipeline::finalize`].

use crate::cache::CacheHierarchy;
use crate::common::access::AccessKind;
use crate::common::error::ConfigError;
use crate::config::RegionConfig;
use crate::trace::sink::TraceSink;

/// Resolves a guest virtual page to its physical address.
///
/// This is the one collaborator the pipeline depends on and does not own.
/// Implementors model the emulator's MMU; returning `None` models a
/// translation fault, which the pipeline treats as a silently dropped
/// access (no record, no cache update) — an access that would fault is not
/// a memory event worth logging.
pub trait AddressTranslator {
    /// Translates `page_vaddr` (already page-aligned) to a physical page
    /// address, or `None` on a translation fault.
    fn guest_paddr(&mut self, page_vaddr: u64) -> Option<u64>;
}

impl<F> AddressTranslator for F
where
    F: FnMut(u64) -> Option<u64>,
{
    fn guest_paddr(&mut self, page_vaddr: u64) -> Option<u64> {
        self(page_vaddr)
    }
}

/// The process-wide tracing context: filter configuration, the cache
/// hierarchy, the sink, and the started/stopped toggle.
///
/// Owns everything the spec's "process-wide mutable state" design note
/// allows to live as a single long-lived object rather than scattered
/// globals; an embedder with a C-ABI surface wraps exactly one instance in
/// a lazily-initialized singleton (see the `tracecache-ffi` crate).
pub struct TracePipeline {
    started: bool,
    emit: bool,
    region: RegionConfig,
    ram_base_set: bool,
    hierarchy: CacheHierarchy,
    sink: Option<TraceSink>,
    translator: Option<Box<dyn AddressTranslator + Send>>,
    debug_thread_id: Option<std::thread::ThreadId>,
}

impl TracePipeline {
    /// Creates a new, unstarted pipeline. `trace_code` mirrors the data
    /// model's field of the same name: when false, L1-I is still built by
    /// `init_l1` but not wired into the tracer registry.
    pub fn new(trace_code: bool) -> Self {
        Self {
            started: false,
            emit: true,
            region: RegionConfig::default(),
            ram_base_set: false,
            hierarchy: CacheHierarchy::new(trace_code),
            sink: None,
            translator: None,
            debug_thread_id: None,
        }
    }

    /// Registers the address-translation collaborator. Must be called
    /// before `started` is set, or every access faults.
    pub fn set_translator(&mut self, translator: impl AddressTranslator + Send + 'static) {
        self.translator = Some(Box::new(translator));
    }

    /// Gates whether the sink receives records at all; see
    /// [`TracePipeline::log_filtered`].
    pub fn set_emit(&mut self, emit: bool) {
        self.emit = emit;
    }

    /// Toggles the pipeline on. While stopped, every entry point is a
    /// no-op.
    pub fn start(&mut self) {
        self.started = true;
    }

    /// Toggles the pipeline off.
    pub fn stop(&mut self) {
        self.started = false;
    }

    /// Parses and installs the physical-address filter window.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MalformedRegion`] if `s` isn't
    /// `"<hex_start>:<hex_end>"`. Re-running this overwrites the previous
    /// bounds; records already emitted are unaffected.
    pub fn set_region(&mut self, s: &str) -> Result<(), ConfigError> {
        self.region = RegionConfig::parse(s)?;
        Ok(())
    }

    /// Records the host virtual address of guest RAM. Idempotent: only the
    /// first call has any effect, including the sink write.
    pub fn set_ram_base(&mut self, addr: u64, size: u64) {
        if self.ram_base_set {
            return;
        }
        self.ram_base_set = true;
        if let Some(sink) = self.sink.as_mut() {
            sink.write_ram_base(addr, size);
        }
    }

    /// Builds L1-I and L1-D.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if `cfg` is malformed.
    pub fn init_l1(&mut self, cfg: &str) -> Result<(), ConfigError> {
        self.hierarchy.init_l1(cfg)
    }

    /// Builds L2 and wires it as the L1 levels' miss handler.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if L1 is missing or `cfg` is malformed.
    pub fn init_l2(&mut self, cfg: &str) -> Result<(), ConfigError> {
        self.hierarchy.init_l2(cfg)
    }

    /// Builds L3 and wires it as L2's miss handler.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if L2 is missing or `cfg` is malformed.
    pub fn init_l3(&mut self, cfg: &str) -> Result<(), ConfigError> {
        self.hierarchy.init_l3(cfg)
    }

    /// Opens the sink, marks the deepest built cache level as the tracing
    /// tap, and writes the header line naming it.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::SinkOpen`] if `sink_path` cannot be opened.
    pub fn finalize(&mut self, sink_path: Option<&str>) -> Result<(), ConfigError> {
        let mut sink = TraceSink::open(sink_path)?;
        self.hierarchy.finalize();
        if let Some(name) = self.hierarchy.deepest_level_name() {
            sink.write_trace_header(name);
        }
        self.sink = Some(sink);
        Ok(())
    }

    /// Tears down the cache hierarchy, flushing each level's statistics to
    /// the sink, then closes the sink.
    pub fn shutdown(&mut self) {
        if let Some(mut sink) = self.sink.take() {
            self.hierarchy.shutdown(&mut sink);
        }
    }

    /// Entry point for a guest data load.
    pub fn on_load(&mut self, vaddr: u64, size: u64) {
        self.pipe(vaddr, size, AccessKind::Load);
    }

    /// Entry point for a guest data store.
    pub fn on_store(&mut self, vaddr: u64, size: u64) {
        self.pipe(vaddr, size, AccessKind::Store);
    }

    /// Entry point for a guest instruction fetch.
    pub fn on_fetch(&mut self, vaddr: u64, size: u64) {
        self.pipe(vaddr, size, AccessKind::Fetch);
    }

    fn pipe(&mut self, vaddr: u64, size: u64, kind: AccessKind) {
        if !self.started {
            return;
        }
        self.assert_single_threaded();

        let misaligned = (size - 1) & vaddr != 0;
        let crosses_page = (vaddr & 0xFFF) + size >= 0x1000;
        if misaligned && crosses_page {
            let half = size / 2;
            self.pipe(vaddr, half, kind);
            self.pipe(vaddr + half, half, kind);
            return;
        }

        let page_vaddr = vaddr & !0xFFF;
        let Some(translator) = self.translator.as_deref_mut() else {
            return;
        };
        let Some(page_paddr) = translator.guest_paddr(page_vaddr) else {
            return;
        };
        let paddr = page_paddr | (vaddr & 0xFFF);

        if self.hierarchy.is_enabled() {
            if let Some(sink) = self.sink.as_mut() {
                self.hierarchy.trace(vaddr, paddr, size, kind, sink);
            }
        } else {
            self.log_filtered(vaddr, paddr, size, kind.is_store());
        }
    }

    fn log_filtered(&mut self, vaddr: u64, paddr: u64, size: u64, store: bool) {
        if !self.emit {
            return;
        }
        let Some(sink) = self.sink.as_mut() else {
            return;
        };
        if paddr < self.region.start || paddr >= self.region.end {
            return;
        }
        sink.write_direct(paddr, size, vaddr, store);
    }

    #[cfg(debug_assertions)]
    fn assert_single_threaded(&mut self) {
        let current = std::thread::current().id();
        match self.debug_thread_id {
            None => self.debug_thread_id = Some(current),
            Some(id) => debug_assert_eq!(id, current, "TracePipeline used from more than one thread"),
        }
    }

    #[cfg(not(debug_assertions))]
    fn assert_single_threaded(&mut self) {}

    #[cfg(test)]
    fn sink_lines(&self) -> Vec<String> {
        self.sink.as_ref().map(TraceSink::lines).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity() -> impl AddressTranslator + Send + 'static {
        |p: u64| Some(p)
    }

    fn started_pipeline() -> TracePipeline {
        let mut p = TracePipeline::new(true);
        p.set_translator(identity());
        p.start();
        p
    }

    #[test]
    fn s1_no_cache_simple_load() {
        let mut p = started_pipeline();
        p.finalize(None).unwrap();
        p.on_load(0x1000, 8);
        assert_eq!(p.sink_lines(), vec!["L 0x1000 size 8 => 0x1000"]);
    }

    #[test]
    fn s2_no_cache_store_outside_region_emits_nothing() {
        let mut p = started_pipeline();
        p.finalize(None).unwrap();
        p.set_region("2000:3000").unwrap();
        p.on_store(0x1000, 4);
        assert!(p.sink_lines().is_empty());
    }

    #[test]
    fn s3_page_split_produces_two_aligned_halves() {
        let mut p = started_pipeline();
        p.finalize(None).unwrap();
        p.on_load(0xFFE, 4);
        assert_eq!(
            p.sink_lines(),
            vec!["L 0xffe size 2 => 0xffe", "L 0x1000 size 2 => 0x1000"]
        );
    }

    #[test]
    fn not_started_is_a_no_op() {
        let mut p = TracePipeline::new(true);
        p.set_translator(identity());
        // started defaults to false; on_load must not panic even with no
        // sink or translator configured beyond this.
        p.on_load(0x1000, 8);
    }

    #[test]
    fn set_ram_base_is_idempotent() {
        let mut p = started_pipeline();
        p.finalize(None).unwrap();
        p.set_ram_base(0x8000_0000, 0x1000);
        p.set_ram_base(0x9000_0000, 0x2000);
        // Second call is ignored; nothing here panics and state stays
        // consistent for a third call.
        p.set_ram_base(0x1, 0x1);
    }

    #[test]
    fn missing_translator_drops_the_access() {
        let mut p = TracePipeline::new(true);
        p.start();
        p.finalize(None).unwrap();
        // No translator registered: every access is a translation fault
        // and must not panic.
        p.on_load(0x1000, 8);
    }
}

/// Property tests for the quantified invariants of `[8 TESTABLE PROPERTIES]`
/// that govern the pipeline itself: page-crossing splits cover the original
/// access exactly once (invariant 7), and every direct trace record falls
/// within the configured region window (invariant 6).
#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    fn parse_record(line: &str) -> (u64, u64) {
        let parts: Vec<&str> = line.split_whitespace().collect();
        let paddr = u64::from_str_radix(parts[1].trim_start_matches("0x"), 16).unwrap();
        let size: u64 = parts[3].parse().unwrap();
        (paddr, size)
    }

    /// Generates `(vaddr, size)` pairs that are guaranteed, by construction,
    /// to satisfy `pipe`'s split condition: unaligned with respect to their
    /// own size, and crossing the 4 KiB boundary at `0x1000`.
    fn arb_splitting_access() -> impl Strategy<Value = (u64, u64)> {
        (1u32..6).prop_flat_map(|size_pow| {
            let size = 1u64 << size_pow;
            (Just(size), 1u64..size).prop_map(move |(size, r)| (0x1000 - size + r, size))
        })
    }

    proptest! {
        #[test]
        fn page_split_covers_the_access_exactly_once((vaddr, size) in arb_splitting_access()) {
            let mut p = TracePipeline::new(true);
            p.set_translator(|pa: u64| Some(pa));
            p.start();
            p.finalize(None).unwrap();
            p.on_load(vaddr, size);

            let mut spans: Vec<(u64, u64)> = p.sink_lines().iter().map(|l| parse_record(l)).collect();
            spans.sort_unstable();

            prop_assert_eq!(spans.len(), 2);
            prop_assert_eq!(spans[0], (vaddr, size / 2));
            prop_assert_eq!(spans[1], (vaddr + size / 2, size / 2));
            prop_assert_eq!(spans[0].1 + spans[1].1, size);
        }

        #[test]
        fn direct_records_always_fall_within_the_region_window(
            region_start in 0u64..0x1_0000,
            region_len in 1u64..0x1_0000,
            vaddr in 0u64..0x2_0000,
            size_pow in 0u32..4,
        ) {
            let size = 1u64 << size_pow;
            let mut p = TracePipeline::new(true);
            p.set_translator(|pa: u64| Some(pa));
            p.start();
            p.finalize(None).unwrap();
            p.set_region(&format!("{region_start:x}:{:x}", region_start + region_len)).unwrap();
            p.on_load(vaddr, size);

            for line in p.sink_lines() {
                let (paddr, _) = parse_record(&line);
                prop_assert!(paddr >= region_start && paddr < region_start + region_len);
            }
        }
    }
}
