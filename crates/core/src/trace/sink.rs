//! The process-wide trace sink: a formatted-line writer shared by direct
//! access records, cache-miss records, and the teardown statistics block.
//!
//! Opening the sink is the one place this crate can fail after startup has
//! otherwise succeeded (see [`crate::common::error::ConfigError::SinkOpen`]);
//! every write after that is best-effort — a full disk must not crash the
//! emulator (`[7 ERROR HANDLING DESIGN]` of the design this implements).

use crate::cache::CacheStats;
use crate::common::error::ConfigError;
use std::fs::File;
use std::io::{self, BufWriter, Stdout, Write};

#[derive(Debug)]
enum Writer {
    File(BufWriter<File>),
    Stdout(Stdout),
    #[cfg(test)]
    Memory(Vec<u8>),
}

impl Write for Writer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Writer::File(w) => w.write(buf),
            Writer::Stdout(w) => w.write(buf),
            #[cfg(test)]
            Writer::Memory(w) => w.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Writer::File(w) => w.flush(),
            Writer::Stdout(w) => w.flush(),
            #[cfg(test)]
            Writer::Memory(w) => w.flush(),
        }
    }
}

/// The formatted-line sink. Writes are line-granular; a failed write after
/// the sink is open is logged once and otherwise swallowed, never
/// propagated to the caller.
#[derive(Debug)]
pub struct TraceSink {
    writer: Writer,
}

impl TraceSink {
    /// Opens `path` for writing, or standard output if `path` is `None` or
    /// `"-"`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::SinkOpen`] if the file cannot be created.
    pub fn open(path: Option<&str>) -> Result<Self, ConfigError> {
        let writer = match path {
            None | Some("-") => Writer::Stdout(io::stdout()),
            Some(path) => {
                let file = File::create(path).map_err(|source| ConfigError::SinkOpen {
                    path: path.to_string(),
                    source,
                })?;
                Writer::File(BufWriter::new(file))
            }
        };
        Ok(Self { writer })
    }

    /// An in-memory sink for tests; see [`TraceSink::lines`].
    #[cfg(test)]
    pub fn buffered() -> Self {
        Self {
            writer: Writer::Memory(Vec::new()),
        }
    }

    fn write_line(&mut self, line: &str) {
        if let Err(err) = writeln!(self.writer, "{line}") {
            log::warn!("trace sink write failed: {err}");
        }
    }

    /// Writes a direct access record (no cache in play).
    pub fn write_direct(&mut self, paddr: u64, size: u64, vaddr: u64, store: bool) {
        self.write_line(&format_record(store, paddr, size, vaddr));
    }

    /// Writes a cache-miss record at the designated tracing level.
    pub fn write_miss(&mut self, vaddr: u64, paddr: u64, size: u64, store: bool) {
        self.write_line(&format_record(store, paddr, size, vaddr));
    }

    /// Writes the `RAM base: 0x..., size: 0x...` line on the first
    /// `set_ram_base` call.
    pub fn write_ram_base(&mut self, addr: u64, size: u64) {
        self.write_line(&format!("RAM base: {addr:#x}, size: {size:#x}"));
    }

    /// Writes the one-line header naming the designated tracing level.
    pub fn write_trace_header(&mut self, level_name: &str) {
        self.write_line(&format!("tracing misses at {level_name}"));
    }

    /// Writes one level's teardown statistics block. Suppressed by the
    /// caller when the level saw zero accesses.
    pub fn write_stats_block(&mut self, name: &str, stats: &CacheStats) {
        self.write_line(&format!("======== {name} ========"));
        self.write_line(&format!("Bytes Read: {}", stats.bytes_read));
        self.write_line(&format!("Bytes Written: {}", stats.bytes_written));
        self.write_line(&format!("Read Accesses: {}", stats.read_accesses));
        self.write_line(&format!("Write Accesses: {}", stats.write_accesses));
        self.write_line(&format!("Read Misses: {}", stats.read_misses));
        self.write_line(&format!("Write Misses: {}", stats.write_misses));
        self.write_line(&format!("Writebacks: {}", stats.writebacks));
        self.write_line(&format!("Miss Rate: {:.3}", stats.miss_rate_pct()));
    }

    /// Flushes the underlying writer. Real files are buffered; tests that
    /// read a sink's output back from disk need this before reading.
    #[cfg(test)]
    fn flush_for_test(&mut self) {
        let _ = self.writer.flush();
    }

    /// The lines written so far, for test assertions. Only meaningful for a
    /// sink built with [`TraceSink::buffered`].
    #[cfg(test)]
    pub fn lines(&self) -> Vec<String> {
        let Writer::Memory(buf) = &self.writer else {
            return Vec::new();
        };
        String::from_utf8_lossy(buf)
            .lines()
            .map(str::to_string)
            .collect()
    }
}

fn format_record(store: bool, paddr: u64, size: u64, vaddr: u64) -> String {
    let letter = if store { 'S' } else { 'L' };
    if vaddr == 0 {
        format!("{letter} {paddr:#x} size {size}")
    } else {
        format!("{letter} {paddr:#x} size {size} => {vaddr:#x}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_line_with_vaddr() {
        assert_eq!(format_record(false, 0x1000, 8, 0x1000), "L 0x1000 size 8 => 0x1000");
    }

    #[test]
    fn store_line_with_vaddr() {
        assert_eq!(format_record(true, 0x40, 8, 0x40), "S 0x40 size 8 => 0x40");
    }

    #[test]
    fn zero_vaddr_omits_arrow() {
        assert_eq!(format_record(true, 0x40, 8, 0), "S 0x40 size 8");
    }

    #[test]
    fn stats_block_suppressed_by_caller_not_by_sink() {
        let mut sink = TraceSink::buffered();
        sink.write_stats_block("L1-D", &CacheStats::default());
        assert!(sink.lines()[0].contains("L1-D"));
    }

    #[test]
    fn miss_rate_formatted_to_three_decimals() {
        let mut sink = TraceSink::buffered();
        let mut stats = CacheStats::default();
        stats.read_accesses = 4;
        stats.read_misses = 1;
        sink.write_stats_block("L2", &stats);
        let lines = sink.lines();
        assert!(lines.iter().any(|l| l == "Miss Rate: 25.000"));
    }

    #[test]
    fn open_writes_through_to_a_real_file() {
        let _ = env_logger::builder().is_test(true).try_init();

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trace.log");
        let path_str = path.to_str().unwrap();

        let mut sink = TraceSink::open(Some(path_str)).unwrap();
        sink.write_direct(0x1000, 8, 0x1000, false);
        sink.flush_for_test();

        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents, "L 0x1000 size 8 => 0x1000\n");
    }

    #[test]
    fn open_rejects_an_unwritable_path() {
        let err = TraceSink::open(Some("/nonexistent-dir/trace.log")).unwrap_err();
        assert!(matches!(err, ConfigError::SinkOpen { .. }));
    }
}
