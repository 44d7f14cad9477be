//! ELF backend.
//!
//! - Image base: lowest `PT_LOAD` virtual address, rounded down to a page.
//!   Relocatable objects have no segments and use 0.
//! - Symbols: `.symtab`, falling back to `.dynsym`.
//! - Lines: DWARF in the image, or in a separate debug file found through the
//!   build-id directory or `.gnu_debuglink`.

use std::path::{Path, PathBuf};

use object::{Object, ObjectSegment};
use tracing::debug;

use super::dwarf::{has_line_info, parse_dwarf_lines};
use super::{collect_text_symbols, parse_object, FormatBackend, ImageSource, ObjectFormat};
use crate::error::TraceResult;
use crate::symbols::index::{LineNumberEntry, SymbolTableEntry};

const ELF_MAGIC: &[u8; 4] = b"\x7fELF";
const ELFCLASS32: u8 = 1;
const ELFCLASS64: u8 = 2;
const PAGE_MASK: u64 = !0xfff;

/// Root of the system-wide separate debug info tree.
const DEBUG_ROOT: &str = "/usr/lib/debug";

pub(crate) struct ElfBackend;

impl FormatBackend for ElfBackend
{
    fn detect(prefix: &[u8]) -> Option<ObjectFormat>
    {
        if prefix.len() < 5 || &prefix[..4] != ELF_MAGIC {
            return None;
        }
        match prefix[4] {
            ELFCLASS32 => Some(ObjectFormat::Elf32),
            ELFCLASS64 => Some(ObjectFormat::Elf64),
            _ => None,
        }
    }

    fn image_base(file: &object::File<'_>) -> u64
    {
        // `segments()` only yields PT_LOAD entries for ELF.
        file.segments()
            .map(|segment| segment.address())
            .min()
            .map_or(0, |address| address & PAGE_MASK)
    }

    fn parse_symbols(file: &object::File<'_>, image_base: u64) -> TraceResult<Vec<SymbolTableEntry>>
    {
        collect_text_symbols(file, image_base, false)
    }

    fn parse_lines(file: &object::File<'_>, image_base: u64, source: &ImageSource<'_>) -> TraceResult<Vec<LineNumberEntry>>
    {
        if has_line_info(file) {
            return parse_dwarf_lines(file, image_base);
        }

        for candidate in debug_file_candidates(file, source.path) {
            let Ok(data) = source.reader.read_image(&candidate) else {
                continue;
            };
            let Ok(debug_file) = parse_object(&data, &candidate) else {
                continue;
            };
            if !has_line_info(&debug_file) {
                continue;
            }
            debug!(path = %candidate.display(), "using separate debug file");
            return parse_dwarf_lines(&debug_file, image_base);
        }

        Ok(Vec::new())
    }
}

/// Separate debug file locations, most specific first.
fn debug_file_candidates(file: &object::File<'_>, path: &Path) -> Vec<PathBuf>
{
    let mut candidates = Vec::new();

    if let Ok(Some(build_id)) = file.build_id() {
        if let Some(candidate) = build_id_path(build_id) {
            candidates.push(candidate);
        }
    }

    if let Ok(Some((name, _crc))) = file.gnu_debuglink() {
        if let Ok(name) = std::str::from_utf8(name) {
            let dir = path.parent().unwrap_or_else(|| Path::new("/"));
            candidates.push(dir.join(name));
            candidates.push(dir.join(".debug").join(name));
            let relative = dir.strip_prefix("/").unwrap_or(dir);
            candidates.push(Path::new(DEBUG_ROOT).join(relative).join(name));
        }
    }

    candidates
}

/// `/usr/lib/debug/.build-id/ab/cdef....debug`
fn build_id_path(build_id: &[u8]) -> Option<PathBuf>
{
    let (first, rest) = build_id.split_first()?;
    if rest.is_empty() {
        return None;
    }
    let tail: String = rest.iter().map(|byte| format!("{byte:02x}")).collect();
    Some(Path::new(DEBUG_ROOT).join(".build-id").join(format!("{first:02x}")).join(format!("{tail}.debug")))
}
