//! PE backend.
//!
//! - Image base: optional-header `ImageBase`.
//! - Symbols: COFF symbol table, falling back to the export table.
//! - Lines: embedded DWARF (MinGW builds). PDB files are not read.

use object::{Object, ObjectSection};

use super::dwarf::{has_line_info, parse_dwarf_lines};
use super::{collect_text_symbols, FormatBackend, ImageSource, ObjectFormat, MAX_SYMBOLS};
use crate::error::{TraceError, TraceResult};
use crate::symbols::index::{LineNumberEntry, SymbolTableEntry};

const DOS_MAGIC: &[u8; 2] = b"MZ";
const PE_SIGNATURE: &[u8; 4] = b"PE\0\0";
const LFANEW_OFFSET: usize = 0x3c;

pub(crate) struct PeBackend;

impl FormatBackend for PeBackend
{
    fn detect(prefix: &[u8]) -> Option<ObjectFormat>
    {
        if prefix.len() < LFANEW_OFFSET + 4 || &prefix[..2] != DOS_MAGIC {
            return None;
        }

        let lfanew = u32::from_le_bytes(prefix[LFANEW_OFFSET..LFANEW_OFFSET + 4].try_into().ok()?) as usize;
        match prefix.get(lfanew..lfanew.checked_add(4)?) {
            Some(signature) if signature == PE_SIGNATURE => Some(ObjectFormat::Pe),
            Some(_) => None,
            // The NT header lies past the prefix; the full parse confirms it.
            None => Some(ObjectFormat::Pe),
        }
    }

    fn image_base(file: &object::File<'_>) -> u64
    {
        file.relative_address_base()
    }

    fn parse_symbols(file: &object::File<'_>, image_base: u64) -> TraceResult<Vec<SymbolTableEntry>>
    {
        let entries = collect_text_symbols(file, image_base, false)?;
        if !entries.is_empty() {
            return Ok(entries);
        }
        export_symbols(file, image_base)
    }

    fn parse_lines(file: &object::File<'_>, image_base: u64, _source: &ImageSource<'_>) -> TraceResult<Vec<LineNumberEntry>>
    {
        if has_line_info(file) {
            return parse_dwarf_lines(file, image_base);
        }
        Ok(Vec::new())
    }
}

/// Exported functions. Exports carry no size and may point at data, so only
/// addresses inside an executable section are kept.
fn export_symbols(file: &object::File<'_>, image_base: u64) -> TraceResult<Vec<SymbolTableEntry>>
{
    let exports = file
        .exports()
        .map_err(|err| TraceError::CorruptImage(format!("invalid export table: {err}")))?;
    if exports.len() > MAX_SYMBOLS {
        return Err(TraceError::CorruptImage(format!("export table exceeds {MAX_SYMBOLS} entries")));
    }

    let text_ranges: Vec<(u64, u64)> = file
        .sections()
        .filter(|section| section.kind() == object::SectionKind::Text)
        .map(|section| (section.address(), section.address().saturating_add(section.size())))
        .collect();

    let mut entries = Vec::with_capacity(exports.len());
    for export in exports {
        let address = export.address();
        if !text_ranges.iter().any(|(start, end)| (*start..*end).contains(&address)) {
            continue;
        }
        let Ok(name) = std::str::from_utf8(export.name()) else {
            continue;
        };
        let Some(start) = address.checked_sub(image_base) else {
            continue;
        };
        entries.push(SymbolTableEntry::new(start, name, None));
    }

    Ok(entries)
}
