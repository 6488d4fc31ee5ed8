//! Fixed-capacity line buffer used for live log tailing of a job.
//!
//! ## Lifecycle
//! - **Idle**: created with the job; `add` is ignored and `snapshot` is empty.
//! - **Open**: after [`BoundedLogBuffer::prepare`]; lines are stored (and mirrored).
//! - **Closed**: after [`BoundedLogBuffer::close`]; the mirror file and scratch space
//!   are released, retained lines stay readable, further `add` calls are dropped.
//!
//! ## Invariants
//! - `len() <= capacity()` at all times.
//! - Eviction is strictly FIFO.
//! - A line is stored (and mirrored) under one lock, so concurrent producers
//!   never interleave partial lines.
use std::{
    collections::VecDeque,
    fs::{File, OpenOptions},
    io::{self, Write},
    path::{Path, PathBuf},
    sync::Mutex,
};

use tracing::{trace, warn};

use crate::lock::lock;

/// Separator placed between a prefix and the line by [`BoundedLogBuffer::add_prefixed`].
pub const PREFIX_SEPARATOR: &str = " : ";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    Open,
    Closed,
}

struct Lines {
    phase: Phase,
    lines: VecDeque<String>,
    mirror: Option<File>,
}

pub struct BoundedLogBuffer {
    capacity: usize,
    mirror_path: Option<PathBuf>,
    inner: Mutex<Lines>,
    /// Scratch space for prefixed lines; `None` outside the Open phase.
    scratch: Mutex<Option<String>>,
}

impl BoundedLogBuffer {
    /// Create a buffer keeping the last `capacity` lines (at least one).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            mirror_path: None,
            inner: Mutex::new(Lines {
                phase: Phase::Idle,
                lines: VecDeque::with_capacity(capacity),
                mirror: None,
            }),
            scratch: Mutex::new(None),
        }
    }

    /// Mirror every stored line to `path` (append-only) once prepared.
    ///
    /// An empty path disables the mirror.
    pub fn with_mirror(mut self, path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        self.mirror_path = (!path.as_os_str().is_empty()).then_some(path);
        self
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn mirror_path(&self) -> Option<&Path> {
        self.mirror_path.as_deref()
    }

    /// Acquire the scratch space and open the mirror file.
    ///
    /// The buffer is usable in memory even when opening the mirror fails;
    /// the error is returned so the caller can report it.
    pub fn prepare(&self) -> io::Result<()> {
        let mut inner = lock(&self.inner);
        if inner.phase != Phase::Idle {
            return Ok(());
        }
        inner.phase = Phase::Open;
        *lock(&self.scratch) = Some(String::with_capacity(256));

        if let Some(path) = &self.mirror_path {
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            inner.mirror = Some(file);
            trace!(target: "runq.core.buffer", path = %path.display(), "mirror opened");
        }
        Ok(())
    }

    /// Release the scratch space and the mirror file. Idempotent.
    pub fn close(&self) {
        let mut inner = lock(&self.inner);
        if inner.phase == Phase::Closed {
            return;
        }
        inner.phase = Phase::Closed;
        if let Some(mut file) = inner.mirror.take() {
            let _ = file.flush();
        }
        drop(inner);
        *lock(&self.scratch) = None;
    }

    pub fn is_open(&self) -> bool {
        lock(&self.inner).phase == Phase::Open
    }

    /// Append one line, evicting the oldest once over capacity.
    ///
    /// Returns `false` if the buffer is not open.
    pub fn add(&self, line: impl Into<String>) -> bool {
        let line = line.into();
        let mut inner = lock(&self.inner);
        if inner.phase != Phase::Open {
            return false;
        }

        if let Some(file) = inner.mirror.as_mut()
            && let Err(e) = writeln!(file, "{line}")
        {
            warn!(target: "runq.core.buffer", error = %e, "mirror write failed; mirror disabled");
            inner.mirror = None;
        }

        inner.lines.push_back(line);
        while inner.lines.len() > self.capacity {
            inner.lines.pop_front();
        }
        true
    }

    /// Append `prefix + " : " + line`.
    pub fn add_prefixed(&self, prefix: &str, line: &str) -> bool {
        let composed = {
            let mut scratch = lock(&self.scratch);
            let Some(buf) = scratch.as_mut() else {
                return false;
            };
            buf.clear();
            buf.push_str(prefix);
            buf.push_str(PREFIX_SEPARATOR);
            buf.push_str(line);
            buf.clone()
        };
        self.add(composed)
    }

    /// Current content joined with `\n`, optionally preceded by `header`.
    ///
    /// Empty if the buffer was never prepared.
    pub fn snapshot(&self, header: Option<&str>) -> String {
        let inner = lock(&self.inner);
        if inner.phase == Phase::Idle {
            return String::new();
        }

        let mut out = String::new();
        if let Some(header) = header {
            out.push_str(header);
            if !inner.lines.is_empty() {
                out.push('\n');
            }
        }
        for (i, line) in inner.lines.iter().enumerate() {
            if i > 0 {
                out.push('\n');
            }
            out.push_str(line);
        }
        out
    }

    /// Copy of the retained lines, oldest first.
    pub fn lines(&self) -> Vec<String> {
        lock(&self.inner).lines.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        lock(&self.inner).lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for BoundedLogBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = lock(&self.inner);
        f.debug_struct("BoundedLogBuffer")
            .field("capacity", &self.capacity)
            .field("len", &inner.lines.len())
            .field("phase", &inner.phase)
            .field("mirror_path", &self.mirror_path)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{collections::HashSet, sync::Arc, thread};

    fn open(capacity: usize) -> BoundedLogBuffer {
        let buf = BoundedLogBuffer::new(capacity);
        buf.prepare().unwrap();
        buf
    }

    #[test]
    fn evicts_oldest_first() {
        let buf = open(3);
        for i in 1..=5 {
            buf.add(format!("l{i}"));
        }
        assert_eq!(buf.lines(), vec!["l3", "l4", "l5"]);
        assert_eq!(buf.snapshot(None), "l3\nl4\nl5");
    }

    #[test]
    fn snapshot_is_empty_before_prepare() {
        let buf = BoundedLogBuffer::new(3);
        assert!(!buf.add("dropped"));
        assert_eq!(buf.snapshot(Some("header")), "");
        assert!(buf.is_empty());
    }

    #[test]
    fn snapshot_with_header() {
        let buf = open(4);
        assert_eq!(buf.snapshot(Some("== job")), "== job");
        buf.add("a");
        buf.add("b");
        assert_eq!(buf.snapshot(Some("== job")), "== job\na\nb");
    }

    #[test]
    fn prefixed_line_is_joined_with_separator() {
        let buf = open(4);
        assert!(buf.add_prefixed("stderr", "boom"));
        assert_eq!(buf.lines(), vec!["stderr : boom"]);
    }

    #[test]
    fn close_keeps_lines_and_drops_new_ones() {
        let buf = open(4);
        buf.add("kept");
        buf.close();
        buf.close();

        assert!(!buf.add("late"));
        assert!(!buf.add_prefixed("stderr", "late"));
        assert_eq!(buf.snapshot(None), "kept");
        assert!(!buf.is_open());
    }

    #[test]
    fn zero_capacity_is_clamped() {
        let buf = open(0);
        buf.add("a");
        buf.add("b");
        assert_eq!(buf.capacity(), 1);
        assert_eq!(buf.lines(), vec!["b"]);
    }

    #[test]
    fn mirror_receives_every_line() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("job.log");

        let buf = BoundedLogBuffer::new(2).with_mirror(&path);
        buf.prepare().unwrap();
        buf.add("one");
        buf.add("two");
        buf.add_prefixed("stderr", "three");
        buf.close();

        let written = std::fs::read_to_string(&path).unwrap();
        assert_eq!(written, "one\ntwo\nstderr : three\n");
        assert_eq!(buf.lines(), vec!["two", "stderr : three"]);
    }

    #[test]
    fn empty_mirror_path_is_ignored() {
        let buf = BoundedLogBuffer::new(2).with_mirror("");
        assert!(buf.mirror_path().is_none());
    }

    #[test]
    fn concurrent_producers_never_split_lines() {
        const PRODUCERS: usize = 8;
        const PER_PRODUCER: usize = 500;

        let buf = Arc::new(open(PRODUCERS * PER_PRODUCER));
        let handles: Vec<_> = (0..PRODUCERS)
            .map(|p| {
                let buf = Arc::clone(&buf);
                thread::spawn(move || {
                    let prefix = format!("producer-{p}");
                    for i in 0..PER_PRODUCER {
                        if i % 2 == 0 {
                            buf.add_prefixed(&prefix, &format!("line-{i}"));
                        } else {
                            buf.add(format!("{prefix} : line-{i}"));
                        }
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let expected: HashSet<String> = (0..PRODUCERS)
            .flat_map(|p| (0..PER_PRODUCER).map(move |i| format!("producer-{p} : line-{i}")))
            .collect();
        let lines = buf.lines();
        assert_eq!(lines.len(), PRODUCERS * PER_PRODUCER);
        for line in &lines {
            assert!(expected.contains(line), "split or corrupted line: {line:?}");
        }
    }

    #[test]
    fn eviction_count_holds_under_contention() {
        let buf = Arc::new(open(16));
        let handles: Vec<_> = (0..4)
            .map(|p| {
                let buf = Arc::clone(&buf);
                thread::spawn(move || {
                    for i in 0..1000 {
                        buf.add(format!("{p}-{i}"));
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(buf.len(), 16);
    }
}
