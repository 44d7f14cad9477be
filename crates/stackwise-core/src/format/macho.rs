//! Mach-O backend (thin and universal).
//!
//! - Image base: `__TEXT` vmaddr (the runtime base reported by dyld is the
//!   address of the Mach header, which sits at the start of `__TEXT`).
//! - Symbols: the symbol table, with the single leading `_` removed.
//! - Lines: DWARF in the image, or in a sibling `.dSYM` bundle.
//!
//! Universal binaries are narrowed to the slice matching the host
//! architecture before parsing.

use std::path::{Path, PathBuf};

use object::read::macho::{FatArch, MachOFatFile32, MachOFatFile64};
use object::{Object, ObjectSegment};
use tracing::debug;

use super::dwarf::{has_line_info, parse_dwarf_lines};
use super::{collect_text_symbols, parse_object, FormatBackend, ImageSource, ObjectFormat, HEADER_PREFIX_LEN};
use crate::error::{TraceError, TraceResult};
use crate::symbols::index::{LineNumberEntry, SymbolTableEntry};
use crate::types::Architecture;

const MH_MAGIC: u32 = 0xfeed_face;
const MH_CIGAM: u32 = 0xcefa_edfe;
const MH_MAGIC_64: u32 = 0xfeed_facf;
const MH_CIGAM_64: u32 = 0xcffa_edfe;
const FAT_MAGIC: u32 = 0xcafe_babe;
const FAT_MAGIC_64: u32 = 0xcafe_babf;

/// Java class files share `FAT_MAGIC`; their next word is a class file
/// version (45 or higher), far above any real slice count.
const MAX_FAT_ARCHES: u32 = 30;

pub(crate) struct MachOBackend;

impl FormatBackend for MachOBackend
{
    fn detect(prefix: &[u8]) -> Option<ObjectFormat>
    {
        let magic = u32::from_be_bytes(prefix.get(..4)?.try_into().ok()?);
        match magic {
            MH_MAGIC | MH_CIGAM => Some(ObjectFormat::MachO32),
            MH_MAGIC_64 | MH_CIGAM_64 => Some(ObjectFormat::MachO64),
            FAT_MAGIC | FAT_MAGIC_64 => {
                let count = u32::from_be_bytes(prefix.get(4..8)?.try_into().ok()?);
                (1..=MAX_FAT_ARCHES).contains(&count).then_some(ObjectFormat::MachOFat)
            }
            _ => None,
        }
    }

    fn image_base(file: &object::File<'_>) -> u64
    {
        let text = file
            .segments()
            .find(|segment| matches!(segment.name(), Ok(Some("__TEXT"))))
            .map(|segment| segment.address());
        if let Some(address) = text {
            return address;
        }

        // Object files have a single unnamed segment.
        file.segments()
            .filter(|segment| segment.file_range().1 > 0)
            .map(|segment| segment.address())
            .min()
            .unwrap_or(0)
    }

    fn parse_symbols(file: &object::File<'_>, image_base: u64) -> TraceResult<Vec<SymbolTableEntry>>
    {
        collect_text_symbols(file, image_base, true)
    }

    fn parse_lines(file: &object::File<'_>, image_base: u64, source: &ImageSource<'_>) -> TraceResult<Vec<LineNumberEntry>>
    {
        if has_line_info(file) {
            return parse_dwarf_lines(file, image_base);
        }

        let Some(candidate) = dsym_path(source.path) else {
            return Ok(Vec::new());
        };
        let Ok(data) = source.reader.read_image(&candidate) else {
            return Ok(Vec::new());
        };

        let prefix = &data[..data.len().min(HEADER_PREFIX_LEN)];
        let bytes = match ObjectFormat::detect(prefix) {
            ObjectFormat::MachOFat => host_slice(&data)?,
            ObjectFormat::MachO32 | ObjectFormat::MachO64 => &data[..],
            _ => return Ok(Vec::new()),
        };
        let dsym = parse_object(bytes, &candidate)?;
        if !has_line_info(&dsym) {
            return Ok(Vec::new());
        }

        debug!(path = %candidate.display(), "using dSYM bundle");
        parse_dwarf_lines(&dsym, image_base)
    }
}

/// `<binary>.dSYM/Contents/Resources/DWARF/<binary name>`
fn dsym_path(path: &Path) -> Option<PathBuf>
{
    let name = path.file_name()?;
    let mut bundle = path.as_os_str().to_owned();
    bundle.push(".dSYM");
    Some(PathBuf::from(bundle).join("Contents").join("Resources").join("DWARF").join(name))
}

/// Bytes of the slice matching the host architecture.
pub(crate) fn host_slice(data: &[u8]) -> TraceResult<&[u8]>
{
    let host = Architecture::current().to_object();
    let magic = data.get(..4).and_then(|bytes| bytes.try_into().ok()).map(u32::from_be_bytes);

    if magic == Some(FAT_MAGIC_64) {
        let fat = MachOFatFile64::parse(data).map_err(fat_error)?;
        pick_slice(fat.arches(), data, host)
    } else {
        let fat = MachOFatFile32::parse(data).map_err(fat_error)?;
        pick_slice(fat.arches(), data, host)
    }
}

fn pick_slice<'data, A: FatArch>(arches: &[A], data: &'data [u8], host: object::Architecture) -> TraceResult<&'data [u8]>
{
    let arch = arches
        .iter()
        .find(|arch| arch.architecture() == host)
        .ok_or(TraceError::UnsupportedFormat)?;
    arch.data(data).map_err(fat_error)
}

fn fat_error(err: object::Error) -> TraceError
{
    TraceError::CorruptImage(format!("invalid universal binary: {err}"))
}

#[cfg(test)]
mod tests
{
    use super::*;

    #[test]
    fn test_dsym_path()
    {
        assert_eq!(
            dsym_path(Path::new("/Applications/Demo.app/Contents/MacOS/Demo")),
            Some(PathBuf::from("/Applications/Demo.app/Contents/MacOS/Demo.dSYM/Contents/Resources/DWARF/Demo"))
        );
    }

    #[test]
    fn test_host_slice_rejects_garbage()
    {
        let mut data = vec![0xca, 0xfe, 0xba, 0xbe, 0, 0, 0, 1];
        data.extend_from_slice(&[0; 12]);
        assert!(host_slice(&data).is_err());
    }
}
