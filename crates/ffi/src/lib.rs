//! C-ABI entry points for the tracecache memory-access tracer.
//!
//! This crate is the thin shell an emulator links against: it owns exactly
//! one [`TracePipeline`], wraps it in a lazily-initialized, mutex-guarded
//! singleton, and translates between C calling conventions (raw pointers,
//! `extern "C"` function pointers, process exit codes) and the safe API of
//! `tracecache-core`. All policy — filtering, splitting, cache simulation —
//! lives there; this crate only marshals.
//!
//! The guest physical-address translator is deliberately out of scope for
//! the core and is supplied by the embedder as a raw function pointer via
//! [`tracecache_set_translator`].

use std::cell::Cell;
use std::ffi::{c_char, c_void, CStr};
use std::sync::{Mutex, OnceLock};

use tracecache_core::{AddressTranslator, ConfigError, TracePipeline};

static PIPELINE: OnceLock<Mutex<TracePipeline>> = OnceLock::new();

fn pipeline() -> &'static Mutex<TracePipeline> {
    PIPELINE.get_or_init(|| Mutex::new(TracePipeline::new(true)))
}

/// Locks the singleton, recovering rather than panicking if a previous
/// holder panicked while holding it — a poisoned lock still guards a
/// perfectly usable `TracePipeline` here, since every method is a plain
/// data mutation with no partial-update invariant to violate.
fn lock() -> std::sync::MutexGuard<'static, TracePipeline> {
    pipeline().lock().unwrap_or_else(|poisoned| {
        log::warn!("tracecache pipeline mutex was poisoned by a panicking caller; recovering");
        poisoned.into_inner()
    })
}

/// A guest physical-address translator supplied by the embedder.
///
/// `env` is opaque to this crate; it is whatever the embedder passed to
/// `tracecache_helper_load`/`_store`/`_fetch` for that call. Returns the
/// physical page address, or a negative value on a translation fault.
pub type TranslateFn = unsafe extern "C" fn(env: *mut c_void, page_vaddr: u64) -> i64;

static TRANSLATE_FN: OnceLock<TranslateFn> = OnceLock::new();

thread_local! {
    /// The `env` argument of the helper call currently in flight. Read by
    /// [`CTranslator::guest_paddr`] one frame down; valid only because the
    /// core's single-threaded-use contract holds.
    static CURRENT_ENV: Cell<*mut c_void> = Cell::new(std::ptr::null_mut());
}

struct CTranslator;

// SAFETY: CTranslator carries no data of its own; the raw pointer it reads
// is thread-local. Sound only under the core's single-threaded-use
// contract, which `assert_single_threaded` enforces in debug builds.
unsafe impl Send for CTranslator {}

impl AddressTranslator for CTranslator {
    fn guest_paddr(&mut self, page_vaddr: u64) -> Option<u64> {
        let func = *TRANSLATE_FN.get()?;
        let env = CURRENT_ENV.with(Cell::get);
        // SAFETY: `func` is an embedder-supplied C function pointer; the
        // embedder is responsible for its signature matching `TranslateFn`.
        let result = unsafe { func(env, page_vaddr) };
        (result >= 0).then_some(result as u64)
    }
}

/// Registers the embedder's translation callback. Must be called before the
/// first helper call, or every access is treated as a translation fault.
///
/// # Arguments
///
/// * `func` - The embedder's physical-address translation function. Only
///   the first call is honored; subsequent calls are ignored.
///
/// # Returns
///
/// Nothing; registration either installs `func` or is silently a no-op if
/// a translator is already registered.
#[no_mangle]
pub extern "C" fn tracecache_set_translator(func: TranslateFn) {
    if TRANSLATE_FN.set(func).is_ok() {
        lock().set_translator(CTranslator);
    }
}

fn with_env<R>(env: *mut c_void, f: impl FnOnce(&mut TracePipeline) -> R) -> R {
    CURRENT_ENV.with(|c| c.set(env));
    let mut guard = lock();
    f(&mut guard)
}

/// Entry point for a guest data load.
///
/// # Arguments
///
/// * `env` - Opaque emulator context, passed through unexamined to the
///   registered translation callback.
/// * `vaddr` - The guest virtual address being loaded from.
/// * `size` - The access width in bytes.
///
/// # Returns
///
/// Nothing; the pipeline either drops the access, simulates it against the
/// cache hierarchy, or emits a trace record, per `TracePipeline::on_load`.
#[no_mangle]
pub extern "C" fn tracecache_helper_load(env: *mut c_void, vaddr: u64, size: u64) {
    with_env(env, |p| p.on_load(vaddr, size));
}

/// Entry point for a guest data store.
///
/// # Arguments
///
/// * `env` - Opaque emulator context, passed through unexamined to the
///   registered translation callback.
/// * `vaddr` - The guest virtual address being stored to.
/// * `size` - The access width in bytes.
///
/// # Returns
///
/// Nothing; see `tracecache_helper_load`.
#[no_mangle]
pub extern "C" fn tracecache_helper_store(env: *mut c_void, vaddr: u64, size: u64) {
    with_env(env, |p| p.on_store(vaddr, size));
}

/// Entry point for a guest instruction fetch.
///
/// # Arguments
///
/// * `env` - Opaque emulator context, passed through unexamined to the
///   registered translation callback.
/// * `vaddr` - The guest virtual address being fetched from.
/// * `size` - The access width in bytes.
///
/// # Returns
///
/// Nothing; see `tracecache_helper_load`.
#[no_mangle]
pub extern "C" fn tracecache_helper_fetch(env: *mut c_void, vaddr: u64, size: u64) {
    with_env(env, |p| p.on_fetch(vaddr, size));
}

/// Toggles the pipeline on. While stopped every helper call is a no-op.
///
/// # Arguments
///
/// This function takes no arguments.
///
/// # Returns
///
/// Nothing.
#[no_mangle]
pub extern "C" fn tracecache_start() {
    lock().start();
}

/// Toggles the pipeline off.
///
/// # Arguments
///
/// This function takes no arguments.
///
/// # Returns
///
/// Nothing.
#[no_mangle]
pub extern "C" fn tracecache_stop() {
    lock().stop();
}

/// Gates whether the sink receives direct-access records at all.
///
/// # Arguments
///
/// * `emit` - When `false`, `log_filtered` becomes a no-op regardless of
///   the region window; cache simulation and its statistics continue
///   unaffected.
///
/// # Returns
///
/// Nothing.
#[no_mangle]
pub extern "C" fn tracecache_set_emit(emit: bool) {
    lock().set_emit(emit);
}

/// Parses and installs the physical-address filter window. Exits with
/// status 1 on a malformed region string, per the startup-misconfiguration
/// contract.
///
/// # Arguments
///
/// * `s` - `"<hex_start>:<hex_end>"`, each side unprefixed or
///   `0x`-prefixed hex.
///
/// # Returns
///
/// Nothing on success; does not return at all on a malformed string
/// (`fail` terminates the process with status 1).
///
/// # Safety
///
/// `s` must be a valid, NUL-terminated C string.
#[no_mangle]
pub unsafe extern "C" fn tracecache_set_region(s: *const c_char) {
    let parsed = read_cstr(s).and_then(|s| lock().set_region(s).err());
    if let Some(err) = parsed {
        fail(&err);
    }
}

/// Records the host virtual address of guest RAM. Idempotent.
///
/// # Arguments
///
/// * `addr` - The host virtual address of the start of guest RAM.
/// * `size` - The size of guest RAM in bytes.
///
/// # Returns
///
/// Nothing; only the first call has any effect, including the sink write.
#[no_mangle]
pub extern "C" fn tracecache_set_ram_base(addr: u64, size: u64) {
    lock().set_ram_base(addr, size);
}

/// Builds L1-I and L1-D from `"sets:ways:linesize"`. Exits with status 1 on
/// a malformed geometry string.
///
/// # Arguments
///
/// * `cfg` - `"sets:ways:linesize"`; `sets` and `linesize` must be powers
///   of two, `linesize >= 8`.
///
/// # Returns
///
/// Nothing on success; does not return at all on a malformed geometry
/// string.
///
/// # Safety
///
/// `cfg` must be a valid, NUL-terminated C string.
#[no_mangle]
pub unsafe extern "C" fn tracecache_init_l1(cfg: *const c_char) {
    init_level(cfg, TracePipeline::init_l1);
}

/// Builds L2 and wires it as both L1 levels' miss handler. Exits with
/// status 1 if L1 is missing or `cfg` is malformed.
///
/// # Arguments
///
/// * `cfg` - `"sets:ways:linesize"`, same grammar as `tracecache_init_l1`.
///
/// # Returns
///
/// Nothing on success; does not return at all if L1 is missing or `cfg`
/// is malformed.
///
/// # Safety
///
/// `cfg` must be a valid, NUL-terminated C string.
#[no_mangle]
pub unsafe extern "C" fn tracecache_init_l2(cfg: *const c_char) {
    init_level(cfg, TracePipeline::init_l2);
}

/// Builds L3 and wires it as L2's miss handler. Exits with status 1 if L2 is
/// missing or `cfg` is malformed.
///
/// # Arguments
///
/// * `cfg` - `"sets:ways:linesize"`, same grammar as `tracecache_init_l1`.
///
/// # Returns
///
/// Nothing on success; does not return at all if L2 is missing or `cfg`
/// is malformed.
///
/// # Safety
///
/// `cfg` must be a valid, NUL-terminated C string.
#[no_mangle]
pub unsafe extern "C" fn tracecache_init_l3(cfg: *const c_char) {
    init_level(cfg, TracePipeline::init_l3);
}

unsafe fn init_level(
    cfg: *const c_char,
    call: fn(&mut TracePipeline, &str) -> Result<(), ConfigError>,
) {
    let Some(cfg) = read_cstr(cfg) else {
        fail_str("malformed cache geometry string");
    };
    if let Err(err) = call(&mut lock(), cfg) {
        fail(&err);
    }
}

/// Opens the sink (a file path, or standard output if `path` is null or
/// `"-"`), marks the deepest built cache level as the tracing tap, and
/// writes its header line. Exits with status 1 if the sink cannot be
/// opened.
///
/// # Arguments
///
/// * `path` - A NUL-terminated file path, or null / `"-"` for standard
///   output.
///
/// # Returns
///
/// Nothing on success; does not return at all if the sink cannot be
/// opened.
///
/// # Safety
///
/// `path` must be null or point at a valid, NUL-terminated C string.
#[no_mangle]
pub unsafe extern "C" fn tracecache_finalize(path: *const c_char) {
    let path = (!path.is_null()).then(|| read_cstr(path)).flatten();
    if let Err(err) = lock().finalize(path) {
        fail(&err);
    }
}

/// Tears down the cache hierarchy, flushing statistics to the sink, and
/// closes it.
///
/// # Arguments
///
/// This function takes no arguments.
///
/// # Returns
///
/// Nothing.
#[no_mangle]
pub extern "C" fn tracecache_shutdown() {
    lock().shutdown();
}

/// # Safety
///
/// `s` must be null or point at a valid, NUL-terminated C string.
unsafe fn read_cstr<'a>(s: *const c_char) -> Option<&'a str> {
    if s.is_null() {
        return None;
    }
    CStr::from_ptr(s).to_str().ok()
}

fn fail(err: &ConfigError) -> ! {
    fail_str(&err.to_string())
}

fn fail_str(reason: &str) -> ! {
    eprintln!("tracecache: invalid configuration: {reason}");
    eprintln!("usage: region \"<hex_start>:<hex_end>\", cache geometry \"sets:ways:linesize\"");
    std::process::exit(1);
}

#[cfg(test)]
mod tests {
    use super::*;

    unsafe extern "C" fn identity_translate(_env: *mut c_void, page_vaddr: u64) -> i64 {
        page_vaddr as i64
    }

    #[test]
    fn translator_registration_resolves_addresses() {
        tracecache_set_translator(identity_translate);
        let mut t = CTranslator;
        CURRENT_ENV.with(|c| c.set(std::ptr::null_mut()));
        assert_eq!(t.guest_paddr(0x1000), Some(0x1000));
    }

    #[test]
    fn finalize_with_no_sink_path_opens_stdout() {
        lock().finalize(None).unwrap();
    }
}
