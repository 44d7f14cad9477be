//! DWARF line tables shared by every backend.
//!
//! Sections are copied into `Arc<[u8]>` buffers (decompressing when needed)
//! and handed to `addr2line`, whose location-range iterator yields every
//! `(address, length, location)` row of every sequence. The rows are turned
//! into a flat list of [`LineNumberEntry`] with explicit terminators wherever
//! the covered address ranges have gaps.

use std::collections::HashMap;
use std::sync::Arc;

use addr2line::Context;
use gimli::{Dwarf, EndianArcSlice, RunTimeEndian, SectionId};
use object::{Object, ObjectSection};
use tracing::debug;

use crate::error::{TraceError, TraceResult};
use crate::symbols::index::LineNumberEntry;

pub(crate) type OwnedReader = EndianArcSlice<RunTimeEndian>;

/// Mach-O keeps section names to 16 bytes, including the `__` prefix.
const MACHO_SECTION_NAME_LEN: usize = 16;

/// Whether the file carries a non-empty `.debug_line` section.
pub(crate) fn has_line_info(file: &object::File<'_>) -> bool
{
    find_section(file, SectionId::DebugLine.name()).is_some_and(|section| section.size() > 0)
}

/// Look a section up by its ELF name, then by its Mach-O spelling.
pub(crate) fn find_section<'data, 'file>(file: &'file object::File<'data>, name: &str) -> Option<object::Section<'data, 'file>>
{
    if let Some(section) = file.section_by_name(name) {
        return Some(section);
    }
    let stem = name.strip_prefix('.')?;
    let mut macho = format!("__{stem}");
    macho.truncate(MACHO_SECTION_NAME_LEN);
    file.section_by_name(&macho)
}

pub(crate) fn endian_of(file: &object::File<'_>) -> RunTimeEndian
{
    if file.is_little_endian() {
        RunTimeEndian::Little
    } else {
        RunTimeEndian::Big
    }
}

fn load_section(file: &object::File<'_>, id: SectionId, endian: RunTimeEndian) -> TraceResult<OwnedReader>
{
    let data: Arc<[u8]> = match find_section(file, id.name()) {
        Some(section) => {
            let bytes = section
                .uncompressed_data()
                .map_err(|err| TraceError::CorruptImage(format!("failed to read {}: {err}", id.name())))?;
            Arc::from(bytes.as_ref())
        }
        None => Arc::from(Vec::new()),
    };
    Ok(EndianArcSlice::new(data, endian))
}

/// Line table of `file`, relative to `image_base`.
///
/// Malformed DWARF yields an empty table: symbols stay usable even when the
/// debug info is not.
pub(crate) fn parse_dwarf_lines(file: &object::File<'_>, image_base: u64) -> TraceResult<Vec<LineNumberEntry>>
{
    let endian = endian_of(file);
    let dwarf = Dwarf::load(|id| load_section(file, id, endian))?;

    let context = match Context::from_dwarf(dwarf) {
        Ok(context) => context,
        Err(err) => {
            debug!(error = %err, "unusable DWARF, skipping line table");
            return Ok(Vec::new());
        }
    };
    let rows = match context.find_location_range(0, u64::MAX) {
        Ok(rows) => rows,
        Err(err) => {
            debug!(error = %err, "unusable DWARF line program, skipping line table");
            return Ok(Vec::new());
        }
    };

    let mut builder = LineTableBuilder::new(image_base);
    for (address, len, location) in rows {
        builder.push(address, len, location.file, location.line);
    }
    Ok(builder.finish())
}

struct Row
{
    start: u64,
    end: u64,
    file: Option<Arc<str>>,
    line: u32,
}

/// Accumulates location rows and emits sorted entries with terminators.
pub(crate) struct LineTableBuilder
{
    image_base: u64,
    files: HashMap<String, Arc<str>>,
    rows: Vec<Row>,
}

impl LineTableBuilder
{
    pub(crate) fn new(image_base: u64) -> Self
    {
        Self {
            image_base,
            files: HashMap::new(),
            rows: Vec::new(),
        }
    }

    /// Record that `[address, address + len)` maps to `file:line`.
    ///
    /// Rows without a file or line become gaps.
    pub(crate) fn push(&mut self, address: u64, len: u64, file: Option<&str>, line: Option<u32>)
    {
        let Some(start) = address.checked_sub(self.image_base) else {
            return;
        };
        if len == 0 {
            return;
        }

        let (file, line) = match (file, line) {
            (Some(name), Some(line)) if line != 0 => (Some(self.intern(name)), line),
            _ => (None, 0),
        };
        self.rows.push(Row {
            start,
            end: start.saturating_add(len),
            file,
            line,
        });
    }

    fn intern(&mut self, name: &str) -> Arc<str>
    {
        if let Some(shared) = self.files.get(name) {
            return Arc::clone(shared);
        }
        let shared: Arc<str> = Arc::from(name);
        self.files.insert(name.to_owned(), Arc::clone(&shared));
        shared
    }

    pub(crate) fn finish(mut self) -> Vec<LineNumberEntry>
    {
        self.rows.sort_by_key(|row| row.start);

        let mut entries = Vec::with_capacity(self.rows.len() + 1);
        for (i, row) in self.rows.iter().enumerate() {
            match &row.file {
                Some(file) => entries.push(LineNumberEntry::new(row.start, Arc::clone(file), row.line)),
                None => entries.push(LineNumberEntry::terminator(row.start)),
            }

            let next_start = self.rows.get(i + 1).map(|next| next.start);
            if next_start.is_none_or(|next| next > row.end) {
                entries.push(LineNumberEntry::terminator(row.end));
            }
        }
        entries
    }
}

#[cfg(test)]
mod tests
{
    use super::*;

    #[test]
    fn test_builder_inserts_terminators_at_gaps()
    {
        let mut builder = LineTableBuilder::new(0x1000);
        builder.push(0x1100, 0x80, Some("a.c"), Some(10));
        builder.push(0x1180, 0x20, Some("a.c"), Some(20));
        builder.push(0x1300, 0x10, Some("b.c"), Some(5));

        let entries = builder.finish();
        let summary: Vec<(u64, u32)> = entries.iter().map(|entry| (entry.start, entry.line)).collect();
        assert_eq!(summary, vec![(0x100, 10), (0x180, 20), (0x1a0, 0), (0x300, 5), (0x310, 0)]);
    }

    #[test]
    fn test_builder_interns_file_names()
    {
        let mut builder = LineTableBuilder::new(0);
        builder.push(0x10, 4, Some("main.rs"), Some(1));
        builder.push(0x14, 4, Some("main.rs"), Some(2));

        let entries = builder.finish();
        assert!(Arc::ptr_eq(&entries[0].file, &entries[1].file));
    }

    #[test]
    fn test_builder_drops_rows_below_base_and_lineless_rows()
    {
        let mut builder = LineTableBuilder::new(0x1000);
        builder.push(0x10, 4, Some("crt.c"), Some(1));
        builder.push(0x1000, 4, None, Some(3));

        let entries = builder.finish();
        assert_eq!(entries.len(), 2);
        assert!(entries.iter().all(LineNumberEntry::is_terminator));
    }
}
