//! # Object Format Detection
//!
//! Classifies a module's binary layout from a fixed-size header prefix and
//! dispatches index building to the matching backend.
//!
//! ## Supported layouts
//!
//! | Format | Magic | Backend |
//! |---|---|---|
//! | ELF (32/64) | `\x7fELF` + `EI_CLASS` | [`elf`] |
//! | Mach-O thin (32/64) | `MH_MAGIC` / `MH_MAGIC_64`, either byte order | [`macho`] |
//! | Mach-O fat | `FAT_MAGIC` / `FAT_MAGIC_64` (always big-endian) | [`macho`] |
//! | PE | `MZ` (+ `PE\0\0` when the header offset fits the prefix) | [`pe`] |
//!
//! Anything else is [`ObjectFormat::Opaque`]: the module still resolves to
//! address/module-only frames.
//!
//! Detection reads exactly [`HEADER_PREFIX_LEN`] bytes and runs once per
//! module; the result is cached on the [`crate::registry::LoadedModule`].

pub mod dwarf;
pub mod elf;
pub mod macho;
pub mod pe;

use std::fmt;
use std::path::Path;

use object::{Object, ObjectSymbol, SymbolKind};
use tracing::debug;

use crate::error::{TraceError, TraceResult};
use crate::symbols::demangle::demangle_shared;
use crate::symbols::index::{LineNumberEntry, SymbolTableEntry};
use crate::symbols::ImageReader;

/// Number of header bytes read for detection.
pub const HEADER_PREFIX_LEN: usize = 64;

/// Upper bound on symbols accepted from one table.
///
/// A count above this is treated as a corrupt table rather than indexed.
pub const MAX_SYMBOLS: usize = 8 * 1024 * 1024;

/// Binary layout of a module
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectFormat
{
    Elf32,
    Elf64,
    MachO32,
    MachO64,
    /// Universal binary holding one slice per architecture
    MachOFat,
    Pe,
    /// Unrecognised; address/module-only resolution
    Opaque,
}

impl ObjectFormat
{
    /// Classify a header prefix.
    ///
    /// Short prefixes are fine: anything too short to carry a magic number is
    /// `Opaque`.
    ///
    /// ```rust
    /// use stackwise_core::format::ObjectFormat;
    ///
    /// assert_eq!(ObjectFormat::detect(b"\x7fELF\x02\x01\x01"), ObjectFormat::Elf64);
    /// assert_eq!(ObjectFormat::detect(&[0xcf, 0xfa, 0xed, 0xfe]), ObjectFormat::MachO64);
    /// assert_eq!(ObjectFormat::detect(b"#!/bin/sh\n"), ObjectFormat::Opaque);
    /// ```
    pub fn detect(prefix: &[u8]) -> Self
    {
        elf::ElfBackend::detect(prefix)
            .or_else(|| macho::MachOBackend::detect(prefix))
            .or_else(|| pe::PeBackend::detect(prefix))
            .unwrap_or(ObjectFormat::Opaque)
    }

    pub const fn is_opaque(self) -> bool
    {
        matches!(self, ObjectFormat::Opaque)
    }

    /// Short lowercase label, stable for CLI output.
    pub const fn name(self) -> &'static str
    {
        match self {
            ObjectFormat::Elf32 => "elf32",
            ObjectFormat::Elf64 => "elf64",
            ObjectFormat::MachO32 => "macho32",
            ObjectFormat::MachO64 => "macho64",
            ObjectFormat::MachOFat => "macho-fat",
            ObjectFormat::Pe => "pe",
            ObjectFormat::Opaque => "opaque",
        }
    }

    /// Backend that parses this format, `None` for opaque modules.
    pub(crate) const fn backend(self) -> Option<Backend>
    {
        match self {
            ObjectFormat::Elf32 | ObjectFormat::Elf64 => Some(Backend::Elf),
            ObjectFormat::MachO32 | ObjectFormat::MachO64 | ObjectFormat::MachOFat => Some(Backend::MachO),
            ObjectFormat::Pe => Some(Backend::Pe),
            ObjectFormat::Opaque => None,
        }
    }
}

impl fmt::Display for ObjectFormat
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        f.write_str(self.name())
    }
}

/// Where a backend may look for data that lives outside the image itself
/// (separate debug files, `.dSYM` bundles).
pub(crate) struct ImageSource<'a>
{
    pub path: &'a Path,
    pub reader: &'a dyn ImageReader,
}

/// Per-format parsing operations.
///
/// Symbol and line starts are returned relative to `image_base`, the
/// link-time address that corresponds to the module's runtime base.
pub(crate) trait FormatBackend
{
    /// Claim a header prefix for this backend.
    fn detect(prefix: &[u8]) -> Option<ObjectFormat>;

    /// Link-time address of the module's first byte.
    fn image_base(file: &object::File<'_>) -> u64;

    /// Function symbols, unsorted.
    fn parse_symbols(file: &object::File<'_>, image_base: u64) -> TraceResult<Vec<SymbolTableEntry>>;

    /// Line table rows, unsorted; empty when no debug info can be found.
    fn parse_lines(file: &object::File<'_>, image_base: u64, source: &ImageSource<'_>) -> TraceResult<Vec<LineNumberEntry>>;
}

/// Enum dispatch over the backends, chosen once per module.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Backend
{
    Elf,
    MachO,
    Pe,
}

impl Backend
{
    /// Narrow the raw file to the bytes `object` should parse.
    ///
    /// Only fat Mach-O files need this: the slice for the host architecture is
    /// picked out of the universal container.
    pub(crate) fn select_slice<'data>(self, format: ObjectFormat, data: &'data [u8]) -> TraceResult<&'data [u8]>
    {
        match (self, format) {
            (Backend::MachO, ObjectFormat::MachOFat) => macho::host_slice(data),
            _ => Ok(data),
        }
    }

    pub(crate) fn image_base(self, file: &object::File<'_>) -> u64
    {
        match self {
            Backend::Elf => elf::ElfBackend::image_base(file),
            Backend::MachO => macho::MachOBackend::image_base(file),
            Backend::Pe => pe::PeBackend::image_base(file),
        }
    }

    pub(crate) fn parse_symbols(self, file: &object::File<'_>, image_base: u64) -> TraceResult<Vec<SymbolTableEntry>>
    {
        match self {
            Backend::Elf => elf::ElfBackend::parse_symbols(file, image_base),
            Backend::MachO => macho::MachOBackend::parse_symbols(file, image_base),
            Backend::Pe => pe::PeBackend::parse_symbols(file, image_base),
        }
    }

    pub(crate) fn parse_lines(
        self,
        file: &object::File<'_>,
        image_base: u64,
        source: &ImageSource<'_>,
    ) -> TraceResult<Vec<LineNumberEntry>>
    {
        match self {
            Backend::Elf => elf::ElfBackend::parse_lines(file, image_base, source),
            Backend::MachO => macho::MachOBackend::parse_lines(file, image_base, source),
            Backend::Pe => pe::PeBackend::parse_lines(file, image_base, source),
        }
    }
}

/// Parse raw bytes with `object`, mapping failures to `CorruptImage`.
pub(crate) fn parse_object<'data>(data: &'data [u8], path: &Path) -> TraceResult<object::File<'data>>
{
    object::File::parse(data).map_err(|err| TraceError::CorruptImage(format!("failed to parse {}: {err}", path.display())))
}

/// Collect defined text symbols from the static table, falling back to the
/// dynamic table when the static one is stripped.
///
/// `strip_underscore` removes the single leading `_` that Mach-O prepends to
/// every C-level name.
pub(crate) fn collect_text_symbols(
    file: &object::File<'_>,
    image_base: u64,
    strip_underscore: bool,
) -> TraceResult<Vec<SymbolTableEntry>>
{
    let entries = collect_from(file.symbols(), image_base, strip_underscore)?;
    if !entries.is_empty() {
        return Ok(entries);
    }

    debug!("static symbol table empty, using dynamic symbols");
    collect_from(file.dynamic_symbols(), image_base, strip_underscore)
}

fn collect_from<'data, S>(symbols: impl Iterator<Item = S>, image_base: u64, strip_underscore: bool) -> TraceResult<Vec<SymbolTableEntry>>
where
    S: ObjectSymbol<'data>,
{
    let mut entries = Vec::new();
    for symbol in symbols {
        if symbol.kind() != SymbolKind::Text || !symbol.is_definition() {
            continue;
        }
        let Ok(name) = symbol.name() else {
            continue;
        };
        let name = if strip_underscore { name.strip_prefix('_').unwrap_or(name) } else { name };
        if name.is_empty() {
            continue;
        }
        let Some(start) = symbol.address().checked_sub(image_base) else {
            continue;
        };

        if entries.len() >= MAX_SYMBOLS {
            return Err(TraceError::CorruptImage(format!("symbol table exceeds {MAX_SYMBOLS} entries")));
        }

        let size = symbol.size();
        entries.push(SymbolTableEntry::new(start, name, (size != 0).then_some(size)));
    }

    Ok(entries)
}

/// Attach the precomputed demangled form to every entry.
pub(crate) fn demangle_entries(entries: &mut [SymbolTableEntry])
{
    for entry in entries {
        entry.demangled = demangle_shared(&entry.name);
    }
}

#[cfg(test)]
mod tests
{
    use super::*;

    fn prefix(bytes: &[u8]) -> [u8; HEADER_PREFIX_LEN]
    {
        let mut out = [0u8; HEADER_PREFIX_LEN];
        out[..bytes.len()].copy_from_slice(bytes);
        out
    }

    #[test]
    fn test_detect_elf_classes()
    {
        assert_eq!(ObjectFormat::detect(&prefix(b"\x7fELF\x01")), ObjectFormat::Elf32);
        assert_eq!(ObjectFormat::detect(&prefix(b"\x7fELF\x02")), ObjectFormat::Elf64);
        assert_eq!(ObjectFormat::detect(&prefix(b"\x7fELF\x07")), ObjectFormat::Opaque);
    }

    #[test]
    fn test_detect_macho_both_byte_orders()
    {
        assert_eq!(ObjectFormat::detect(&prefix(&[0xfe, 0xed, 0xfa, 0xce])), ObjectFormat::MachO32);
        assert_eq!(ObjectFormat::detect(&prefix(&[0xce, 0xfa, 0xed, 0xfe])), ObjectFormat::MachO32);
        assert_eq!(ObjectFormat::detect(&prefix(&[0xfe, 0xed, 0xfa, 0xcf])), ObjectFormat::MachO64);
        assert_eq!(ObjectFormat::detect(&prefix(&[0xcf, 0xfa, 0xed, 0xfe])), ObjectFormat::MachO64);
    }

    #[test]
    fn test_detect_fat_but_not_java_class()
    {
        assert_eq!(ObjectFormat::detect(&prefix(&[0xca, 0xfe, 0xba, 0xbe, 0, 0, 0, 2])), ObjectFormat::MachOFat);
        // Java class file: same magic, then minor/major version (major 52).
        assert_eq!(ObjectFormat::detect(&prefix(&[0xca, 0xfe, 0xba, 0xbe, 0, 0, 0, 52])), ObjectFormat::Opaque);
    }

    #[test]
    fn test_detect_pe()
    {
        let mut header = prefix(b"MZ");
        header[0x3c] = 0x40; // PE header right after the prefix
        assert_eq!(ObjectFormat::detect(&header), ObjectFormat::Pe);

        header[0x3c] = 0x20;
        header[0x20..0x24].copy_from_slice(b"PE\0\0");
        assert_eq!(ObjectFormat::detect(&header), ObjectFormat::Pe);

        header[0x20..0x24].copy_from_slice(b"NE\0\0");
        assert_eq!(ObjectFormat::detect(&header), ObjectFormat::Opaque);
    }

    #[test]
    fn test_detect_short_and_empty()
    {
        assert_eq!(ObjectFormat::detect(&[]), ObjectFormat::Opaque);
        assert_eq!(ObjectFormat::detect(b"\x7fEL"), ObjectFormat::Opaque);
        assert!(ObjectFormat::Opaque.backend().is_none());
        assert_eq!(ObjectFormat::MachOFat.backend(), Some(Backend::MachO));
    }
}
