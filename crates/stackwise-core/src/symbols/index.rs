//! Sorted per-module symbol and line indices.
//!
//! Both indices answer the same question: which entry has the greatest start
//! that is still `<= offset`? Entries are sorted once at build time and
//! searched with `partition_point`, so lookups are O(log n) and allocate
//! nothing.

use std::fmt;
use std::path::Path;
use std::sync::Arc;

use once_cell::sync::Lazy;
use tracing::debug;

use crate::error::{TraceError, TraceResult};
use crate::format::{self, ImageSource, ObjectFormat};
use crate::symbols::ImageReader;
use crate::unwind::cfi::CfiTable;

static NO_FILE: Lazy<Arc<str>> = Lazy::new(|| Arc::from(""));

/// One function symbol, relative to the module's image base
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SymbolTableEntry
{
    /// Offset of the first byte from the image base
    pub start: u64,
    /// Raw (possibly mangled) name
    pub name: Arc<str>,
    /// Size in bytes when the symbol table records one
    ///
    /// Not used for matching: the nearest preceding symbol wins even past its
    /// recorded end.
    pub size: Option<u64>,
    /// Demangled name, computed once at build time; `None` if the raw name
    /// is not mangled
    pub demangled: Option<Arc<str>>,
}

impl SymbolTableEntry
{
    pub fn new(start: u64, name: &str, size: Option<u64>) -> Self
    {
        Self {
            start,
            name: Arc::from(name),
            size,
            demangled: None,
        }
    }
}

/// One row of a line table, relative to the module's image base
///
/// A row with `line == 0` terminates a sequence: offsets from its start up to
/// the next row have no line information.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LineNumberEntry
{
    pub start: u64,
    pub file: Arc<str>,
    pub line: u32,
}

impl LineNumberEntry
{
    pub fn new(start: u64, file: impl Into<Arc<str>>, line: u32) -> Self
    {
        Self {
            start,
            file: file.into(),
            line,
        }
    }

    /// End-of-sequence marker at `start`.
    pub fn terminator(start: u64) -> Self
    {
        Self {
            start,
            file: Arc::clone(&NO_FILE),
            line: 0,
        }
    }

    pub fn is_terminator(&self) -> bool
    {
        self.line == 0
    }
}

/// Symbol found for an offset, with the distance into it.
#[derive(Debug, Clone, Copy)]
pub struct SymbolMatch<'a>
{
    pub entry: &'a SymbolTableEntry,
    pub offset: u64,
}

/// Symbols sorted ascending by start
#[derive(Debug, Clone, Default)]
pub struct SymbolIndex
{
    entries: Vec<SymbolTableEntry>,
}

impl SymbolIndex
{
    /// Sort `entries` by start. The sort is stable: among equal starts, the
    /// entry that came last in the table wins lookups.
    pub fn new(mut entries: Vec<SymbolTableEntry>) -> Self
    {
        entries.sort_by_key(|entry| entry.start);
        Self { entries }
    }

    /// Nearest-enclosing symbol: greatest start `<= offset`.
    ///
    /// ```rust
    /// use stackwise_core::symbols::{SymbolIndex, SymbolTableEntry};
    ///
    /// let index = SymbolIndex::new(vec![
    ///     SymbolTableEntry::new(0x100, "f", None),
    ///     SymbolTableEntry::new(0x200, "g", None),
    /// ]);
    /// assert_eq!(&*index.lookup(0x150).unwrap().entry.name, "f");
    /// assert_eq!(&*index.lookup(0x200).unwrap().entry.name, "g");
    /// assert!(index.lookup(0x50).is_none());
    /// ```
    pub fn lookup(&self, offset: u64) -> Option<SymbolMatch<'_>>
    {
        let idx = self.entries.partition_point(|entry| entry.start <= offset);
        let entry = self.entries.get(idx.checked_sub(1)?)?;
        Some(SymbolMatch {
            entry,
            offset: offset - entry.start,
        })
    }

    pub fn entries(&self) -> &[SymbolTableEntry]
    {
        &self.entries
    }

    pub fn len(&self) -> usize
    {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool
    {
        self.entries.is_empty()
    }
}

/// Line rows sorted ascending by start
#[derive(Debug, Clone, Default)]
pub struct LineIndex
{
    entries: Vec<LineNumberEntry>,
}

impl LineIndex
{
    pub fn new(mut entries: Vec<LineNumberEntry>) -> Self
    {
        entries.sort_by_key(|entry| entry.start);
        Self { entries }
    }

    /// Row covering `offset`, or `None` below the first row or inside a gap.
    pub fn lookup(&self, offset: u64) -> Option<&LineNumberEntry>
    {
        let idx = self.entries.partition_point(|entry| entry.start <= offset);
        let entry = self.entries.get(idx.checked_sub(1)?)?;
        (!entry.is_terminator()).then_some(entry)
    }

    pub fn entries(&self) -> &[LineNumberEntry]
    {
        &self.entries
    }

    pub fn len(&self) -> usize
    {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool
    {
        self.entries.is_empty()
    }
}

/// Everything resolved about one module, built once and then immutable
pub struct ModuleIndex
{
    format: ObjectFormat,
    image_base: u64,
    symbols: SymbolIndex,
    lines: LineIndex,
    cfi: Option<Arc<CfiTable>>,
}

impl ModuleIndex
{
    /// Assemble an index from already-parsed tables.
    pub fn from_parts(format: ObjectFormat, image_base: u64, symbols: SymbolIndex, lines: LineIndex) -> Self
    {
        Self {
            format,
            image_base,
            symbols,
            lines,
            cfi: None,
        }
    }

    /// Read and parse the image at `path`.
    ///
    /// Errors are classified by the caller and cached; they never surface to
    /// capture callers.
    pub(crate) fn build(path: &Path, format: ObjectFormat, reader: &dyn ImageReader) -> TraceResult<Self>
    {
        let backend = format.backend().ok_or(TraceError::UnsupportedFormat)?;
        let data = reader.read_image(path)?;
        let bytes = backend.select_slice(format, &data)?;
        let file = format::parse_object(bytes, path)?;

        let image_base = backend.image_base(&file);
        let mut symbols = backend.parse_symbols(&file, image_base)?;
        format::demangle_entries(&mut symbols);

        let source = ImageSource { path, reader };
        let lines = backend.parse_lines(&file, image_base, &source)?;
        let cfi = CfiTable::from_file(&file, image_base).map(Arc::new);

        debug!(
            path = %path.display(),
            %format,
            image_base = format_args!("0x{image_base:x}"),
            symbols = symbols.len(),
            lines = lines.len(),
            cfi = cfi.is_some(),
            "built module index"
        );

        Ok(Self {
            format,
            image_base,
            symbols: SymbolIndex::new(symbols),
            lines: LineIndex::new(lines),
            cfi,
        })
    }

    pub fn format(&self) -> ObjectFormat
    {
        self.format
    }

    /// Link-time address corresponding to the module's runtime base.
    pub fn image_base(&self) -> u64
    {
        self.image_base
    }

    pub fn symbols(&self) -> &SymbolIndex
    {
        &self.symbols
    }

    pub fn lines(&self) -> &LineIndex
    {
        &self.lines
    }

    /// Call frame information from `.eh_frame`, if the image has any.
    pub fn cfi(&self) -> Option<&Arc<CfiTable>>
    {
        self.cfi.as_ref()
    }
}

impl fmt::Debug for ModuleIndex
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        f.debug_struct("ModuleIndex")
            .field("format", &self.format)
            .field("image_base", &format_args!("0x{:x}", self.image_base))
            .field("symbols", &self.symbols.len())
            .field("lines", &self.lines.len())
            .field("cfi", &self.cfi.is_some())
            .finish()
    }
}
