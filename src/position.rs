//! Source buffers and byte-offset/line-column positions.
//!
//! A `SourceBuffer` owns the bytes of one file (or one in-memory/ephemeral
//! source) and an incrementally maintained newline index, so that any other
//! component holding a `Position` can turn it back into the line of text it
//! names without re-scanning the whole buffer.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, RwLock};

use crate::Error;

/// A location in a source file. Zero-valued positions are synthetic — they
/// name no real byte in any buffer (e.g. a node invented by the checker).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct Position {
    pub filename: String,
    pub offset: usize,
    /// 1-based.
    pub line: usize,
    /// 1-based.
    pub column: usize,
}

impl Position {
    pub fn new(filename: impl Into<String>, offset: usize, line: usize, column: usize) -> Self {
        Self {
            filename: filename.into(),
            offset,
            line,
            column,
        }
    }

    /// A zero-valued, synthetic position carrying no real source location.
    pub fn synthetic() -> Self {
        Self::default()
    }

    pub fn is_synthetic(&self) -> bool {
        self.line == 0
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_synthetic() {
            write!(f, "<synthetic>")
        } else {
            write!(f, "{}:{}:{}", self.filename, self.line, self.column)
        }
    }
}

/// One file's worth of source bytes plus a newline index.
///
/// Invariants: append-only; `newline_offsets[i]` is the byte offset of the
/// `i`-th `\n` in the buffer. `on_disk` distinguishes a real file (servable
/// to a client by path) from an ephemeral/in-memory buffer, which must be
/// served through an opaque `sourceReference` handle instead.
#[derive(Debug, Clone)]
pub struct SourceBuffer {
    filename: String,
    bytes: Vec<u8>,
    newline_offsets: Vec<usize>,
    on_disk: bool,
}

impl SourceBuffer {
    pub fn new(filename: impl Into<String>, on_disk: bool) -> Self {
        Self {
            filename: filename.into(),
            bytes: Vec::new(),
            newline_offsets: Vec::new(),
            on_disk,
        }
    }

    pub fn from_bytes(filename: impl Into<String>, bytes: Vec<u8>, on_disk: bool) -> Self {
        let mut buf = Self::new(filename, on_disk);
        buf.write(&bytes);
        buf
    }

    /// Append bytes, updating the newline index in the same pass.
    pub fn write(&mut self, bytes: &[u8]) {
        let base = self.bytes.len();
        for (i, &b) in bytes.iter().enumerate() {
            if b == b'\n' {
                self.newline_offsets.push(base + i);
            }
        }
        self.bytes.extend_from_slice(bytes);
    }

    pub fn filename(&self) -> &str {
        &self.filename
    }

    pub fn on_disk(&self) -> bool {
        self.on_disk
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Byte offset at which line `line` starts (1-based line numbering).
    fn line_start_offset(&self, line: usize) -> Option<usize> {
        if line == 0 {
            return None;
        }
        if line == 1 {
            return Some(0);
        }
        // line N>1 starts one byte after the (N-2)-th newline (0-based index).
        self.newline_offsets.get(line - 2).map(|o| o + 1)
    }

    /// Translate a 1-based (line, column) pair into a `Position`.
    pub fn position(&self, line: usize, column: usize) -> Result<Position, Error> {
        let start = self
            .line_start_offset(line)
            .ok_or_else(|| Error::NotFound(format!("{}: no line {}", self.filename, line)))?;
        let offset = if column == 0 { start } else { start + column - 1 };
        if offset > self.bytes.len() {
            return Err(Error::NotFound(format!(
                "{}:{}:{}: past end of buffer",
                self.filename, line, column
            )));
        }
        Ok(Position::new(self.filename.clone(), offset, line, column))
    }

    /// The text of line `n` (1-based), excluding its trailing newline.
    pub fn line(&self, n: usize) -> Result<&str, Error> {
        let start = self
            .line_start_offset(n)
            .ok_or_else(|| Error::NotFound(format!("{}: no line {}", self.filename, n)))?;
        if start > self.bytes.len() {
            return Err(Error::NotFound(format!("{}: no line {}", self.filename, n)));
        }
        let end = self
            .newline_offsets
            .get(n - 1)
            .copied()
            .unwrap_or(self.bytes.len());
        std::str::from_utf8(&self.bytes[start..end])
            .map_err(|_| Error::InvalidArgument("buffer is not valid utf-8".into()))
    }

    /// The line (excluding its trailing newline) containing byte offset `o`.
    pub fn segment(&self, offset: usize) -> Result<&str, Error> {
        if offset > self.bytes.len() {
            return Err(Error::Transport("EOF".into()));
        }
        let line = self.line_for_offset(offset);
        self.line(line)
    }

    fn line_for_offset(&self, offset: usize) -> usize {
        // number of newlines strictly before `offset`, plus one.
        match self.newline_offsets.binary_search(&offset) {
            Ok(i) => i + 1,
            Err(i) => i + 1,
        }
    }

    /// Total number of lines currently in the buffer.
    pub fn line_count(&self) -> usize {
        self.newline_offsets.len() + 1
    }
}

/// A process-wide (or session-wide) registry of source buffers, keyed by
/// filename, shared through an `Arc` rather than true global state.
#[derive(Debug, Default)]
pub struct SourceRegistry {
    buffers: RwLock<HashMap<String, Arc<Mutex<SourceBuffer>>>>,
}

impl SourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, buffer: SourceBuffer) -> Arc<Mutex<SourceBuffer>> {
        let handle = Arc::new(Mutex::new(buffer));
        let filename = handle.lock().unwrap().filename().to_string();
        self.buffers.write().unwrap().insert(filename, handle.clone());
        handle
    }

    pub fn get(&self, filename: &str) -> Option<Arc<Mutex<SourceBuffer>>> {
        self.buffers.read().unwrap().get(filename).cloned()
    }

    pub fn filenames(&self) -> Vec<String> {
        let mut names: Vec<String> = self.buffers.read().unwrap().keys().cloned().collect();
        names.sort();
        names
    }
}

thread_local! {
    static AMBIENT_REGISTRY: std::cell::RefCell<Option<Arc<SourceRegistry>>> = std::cell::RefCell::new(None);
}

/// Install a registry as the ambient one for the current thread.
///
/// A convenience for subsystems that are only ever given a "context" and
/// need a `filename -> buffer` lookup without being handed the registry
/// explicitly. Session-owned state (an explicit `Arc<SourceRegistry>`) is
/// preferred everywhere the core controls its own call graph; this exists
/// for the few call sites (e.g. `Unparse` helpers) that do not.
pub fn install_ambient_registry(registry: Arc<SourceRegistry>) {
    AMBIENT_REGISTRY.with(|cell| *cell.borrow_mut() = Some(registry));
}

/// The ambient registry for the current thread, or a fresh empty one if
/// none has been installed.
pub fn ambient_registry() -> Arc<SourceRegistry> {
    AMBIENT_REGISTRY.with(|cell| {
        cell.borrow_mut()
            .get_or_insert_with(|| Arc::new(SourceRegistry::new()))
            .clone()
    })
}
