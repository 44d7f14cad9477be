//! Where module lists come from.
//!
//! - [`ProcMaps`]: Linux `/proc/<pid>/maps`, one descriptor per mapped file
//! - [`DyldImages`]: macOS dyld image list, sized from the in-memory headers
//! - [`StaticModules`]: a fixed list supplied by the caller

use std::collections::HashMap;
use std::path::PathBuf;

use smallvec::SmallVec;
use tracing::{debug, trace};

use crate::error::TraceResult;
use crate::registry::ModuleDescriptor;
use crate::types::Address;

/// Provider of the current module list
pub trait ModuleSource: Send + Sync
{
    fn modules(&self) -> TraceResult<Vec<ModuleDescriptor>>;
}

/// Fixed module list
#[derive(Debug, Clone, Default)]
pub struct StaticModules
{
    modules: Vec<ModuleDescriptor>,
}

impl StaticModules
{
    pub fn new(modules: Vec<ModuleDescriptor>) -> Self
    {
        Self { modules }
    }
}

impl ModuleSource for StaticModules
{
    fn modules(&self) -> TraceResult<Vec<ModuleDescriptor>>
    {
        Ok(self.modules.clone())
    }
}

/// Modules of a Linux process, read from `/proc/<pid>/maps`
///
/// Every file-backed mapping contributes to the module for its path; the
/// module spans from the lowest mapping start to the highest mapping end.
/// Pseudo mappings (`[stack]`, `[vdso]`, anonymous memory) and deleted files
/// are skipped.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcMaps
{
    pid: Option<u32>,
}

impl ProcMaps
{
    /// Modules of the calling process.
    pub fn current() -> Self
    {
        Self { pid: None }
    }

    pub fn for_pid(pid: u32) -> Self
    {
        Self { pid: Some(pid) }
    }

    fn maps_path(&self) -> PathBuf
    {
        match self.pid {
            Some(pid) => PathBuf::from(format!("/proc/{pid}/maps")),
            None => PathBuf::from("/proc/self/maps"),
        }
    }
}

impl ModuleSource for ProcMaps
{
    fn modules(&self) -> TraceResult<Vec<ModuleDescriptor>>
    {
        let path = self.maps_path();
        let contents = std::fs::read_to_string(&path)?;
        let modules = parse_maps(&contents);
        debug!(path = %path.display(), modules = modules.len(), "read process maps");
        Ok(modules)
    }
}

/// Parse the text of a `maps` file into one descriptor per mapped file.
///
/// ```rust
/// use stackwise_core::registry::source::parse_maps;
///
/// let maps = "\
/// 55d0c0a00000-55d0c0a01000 r--p 00000000 08:01 1234 /usr/bin/demo
/// 55d0c0a01000-55d0c0a03000 r-xp 00001000 08:01 1234 /usr/bin/demo
/// 7ffd8a1f0000-7ffd8a211000 rw-p 00000000 00:00 0    [stack]
/// ";
/// let modules = parse_maps(maps);
/// assert_eq!(modules.len(), 1);
/// assert_eq!(modules[0].size, 0x3000);
/// ```
pub fn parse_maps(contents: &str) -> Vec<ModuleDescriptor>
{
    let mut ranges: HashMap<&str, (u64, u64)> = HashMap::new();
    let mut order: SmallVec<[&str; 32]> = SmallVec::new();

    for line in contents.lines() {
        let Some((start, end, path)) = parse_maps_line(line) else {
            continue;
        };
        match ranges.get_mut(path) {
            Some((low, high)) => {
                *low = (*low).min(start);
                *high = (*high).max(end);
            }
            None => {
                ranges.insert(path, (start, end));
                order.push(path);
            }
        }
    }

    order
        .into_iter()
        .filter_map(|path| {
            let (low, high) = ranges.get(path)?;
            Some(ModuleDescriptor::new(PathBuf::from(path), Address::from(*low), high - low))
        })
        .collect()
}

fn parse_maps_line(line: &str) -> Option<(u64, u64, &str)>
{
    let mut rest = line;
    let mut fields = [""; 5];
    for field in &mut fields {
        rest = rest.trim_start();
        let end = rest.find(char::is_whitespace).unwrap_or(rest.len());
        *field = &rest[..end];
        rest = &rest[end..];
    }
    let path = rest.trim();

    if !path.starts_with('/') {
        return None;
    }
    if path.ends_with(" (deleted)") {
        trace!(path, "skipping deleted mapping");
        return None;
    }

    let (start, end) = fields[0].split_once('-')?;
    let start = u64::from_str_radix(start, 16).ok()?;
    let end = u64::from_str_radix(end, 16).ok()?;
    (end > start).then_some((start, end, path))
}

/// Images registered with dyld in the calling process
///
/// Each image's extent is computed from the load commands of its in-memory
/// Mach-O header: from the `__TEXT` segment to the end of the highest segment.
#[cfg(target_os = "macos")]
#[derive(Debug, Clone, Copy, Default)]
pub struct DyldImages;

#[cfg(target_os = "macos")]
impl ModuleSource for DyldImages
{
    fn modules(&self) -> TraceResult<Vec<ModuleDescriptor>>
    {
        use std::ffi::CStr;

        let mut modules = Vec::new();
        // SAFETY: dyld keeps the header and name of each listed image valid
        // while the image stays loaded.
        unsafe {
            let count = libc::_dyld_image_count();
            for i in 0..count {
                let header = libc::_dyld_get_image_header(i);
                let name = libc::_dyld_get_image_name(i);
                if header.is_null() || name.is_null() {
                    continue;
                }
                let path = CStr::from_ptr(name).to_string_lossy().into_owned();
                let Some(size) = macho_image_size(header.cast()) else {
                    trace!(path, "skipping image with unreadable header");
                    continue;
                };
                modules.push(ModuleDescriptor::new(PathBuf::from(path), Address::from(header as u64), size));
            }
        }
        debug!(modules = modules.len(), "read dyld image list");
        Ok(modules)
    }
}

/// Extent of a loaded 64-bit Mach-O image, measured from its `__TEXT` start.
///
/// # Safety
///
/// `header` must point at a mapped Mach-O header followed by its load
/// commands.
#[cfg(target_os = "macos")]
unsafe fn macho_image_size(header: *const u8) -> Option<u64>
{
    const MH_MAGIC_64: u32 = 0xfeed_facf;
    const LC_SEGMENT_64: u32 = 0x19;
    const HEADER_SIZE_64: usize = 32;

    let read_u32 = |offset: usize| std::ptr::read_unaligned(header.add(offset).cast::<u32>());
    let read_u64 = |offset: usize| std::ptr::read_unaligned(header.add(offset).cast::<u64>());

    if read_u32(0) != MH_MAGIC_64 {
        return None;
    }
    let ncmds = read_u32(16) as usize;
    let sizeofcmds = read_u32(20) as usize;

    let mut text_start = None;
    let mut highest_end = 0u64;
    let mut offset = HEADER_SIZE_64;
    let limit = HEADER_SIZE_64 + sizeofcmds;
    for _ in 0..ncmds {
        if offset + 8 > limit {
            break;
        }
        let cmd = read_u32(offset);
        let cmdsize = read_u32(offset + 4) as usize;
        if cmdsize < 8 {
            break;
        }
        if cmd == LC_SEGMENT_64 && offset + 40 <= limit {
            let name = std::slice::from_raw_parts(header.add(offset + 8), 16);
            let vmaddr = read_u64(offset + 24);
            let vmsize = read_u64(offset + 32);
            if name.starts_with(b"__TEXT\0") {
                text_start = Some(vmaddr);
            }
            if !name.starts_with(b"__PAGEZERO\0") {
                highest_end = highest_end.max(vmaddr.saturating_add(vmsize));
            }
        }
        offset += cmdsize;
    }

    let start = text_start?;
    highest_end.checked_sub(start).filter(|size| *size > 0)
}

/// The module source for the host platform.
pub fn default_source() -> Box<dyn ModuleSource>
{
    #[cfg(target_os = "macos")]
    {
        Box::new(DyldImages)
    }
    #[cfg(not(target_os = "macos"))]
    {
        Box::new(ProcMaps::current())
    }
}
