//! Bounded access to module images.
//!
//! The resolver never opens files itself: every byte it parses comes through
//! an [`ImageReader`]. [`FsImageReader`] reads from the file system;
//! [`MemoryImages`] serves images that were injected up front (tests, or
//! images extracted from a core file).

use std::collections::HashMap;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::error::{TraceError, TraceResult};

/// Largest image the resolver agrees to load.
pub const MAX_IMAGE_SIZE: u64 = 4 * 1024 * 1024 * 1024;

/// Source of module bytes
pub trait ImageReader: Send + Sync
{
    /// Total size of the image in bytes.
    fn len(&self, path: &Path) -> TraceResult<u64>;

    /// Read up to `buf.len()` bytes starting at `offset`; returns the number
    /// of bytes read, which is short only at end of image.
    fn read_at(&self, path: &Path, offset: u64, buf: &mut [u8]) -> TraceResult<usize>;

    /// Read the header prefix used for format detection.
    fn read_prefix(&self, path: &Path, buf: &mut [u8]) -> TraceResult<usize>
    {
        self.read_at(path, 0, buf)
    }

    /// Read the whole image.
    ///
    /// An image that ends before its reported length is `CorruptImage`.
    fn read_image(&self, path: &Path) -> TraceResult<Arc<[u8]>>
    {
        let len = self.len(path)?;
        if len > MAX_IMAGE_SIZE {
            return Err(TraceError::CorruptImage(format!("{} is {len} bytes", path.display())));
        }
        let len = usize::try_from(len).map_err(|_| TraceError::CorruptImage(format!("{} is too large", path.display())))?;

        let mut data = vec![0u8; len];
        let mut filled = 0;
        while filled < len {
            let read = self.read_at(path, filled as u64, &mut data[filled..])?;
            if read == 0 {
                return Err(TraceError::CorruptImage(format!(
                    "{} truncated at {filled} of {len} bytes",
                    path.display()
                )));
            }
            filled += read;
        }
        Ok(data.into())
    }
}

/// Reads images from the file system
#[derive(Debug, Clone, Copy, Default)]
pub struct FsImageReader;

impl ImageReader for FsImageReader
{
    fn len(&self, path: &Path) -> TraceResult<u64>
    {
        Ok(std::fs::metadata(path)?.len())
    }

    fn read_at(&self, path: &Path, offset: u64, buf: &mut [u8]) -> TraceResult<usize>
    {
        let mut file = File::open(path)?;
        file.seek(SeekFrom::Start(offset))?;

        let mut filled = 0;
        while filled < buf.len() {
            match file.read(&mut buf[filled..])? {
                0 => break,
                read => filled += read,
            }
        }
        Ok(filled)
    }

    fn read_image(&self, path: &Path) -> TraceResult<Arc<[u8]>>
    {
        let len = self.len(path)?;
        if len > MAX_IMAGE_SIZE {
            return Err(TraceError::CorruptImage(format!("{} is {len} bytes", path.display())));
        }
        Ok(std::fs::read(path)?.into())
    }
}

/// In-memory images keyed by path
///
/// Counts every read so tests can assert that a module was (or was not)
/// touched again.
///
/// ```rust
/// use std::path::Path;
/// use stackwise_core::symbols::{ImageReader, MemoryImages};
///
/// let mut images = MemoryImages::new();
/// images.insert("/lib/libdemo.so", b"\x7fELF\x02".to_vec());
///
/// let mut prefix = [0u8; 64];
/// let read = images.read_prefix(Path::new("/lib/libdemo.so"), &mut prefix).unwrap();
/// assert_eq!(read, 5);
/// assert_eq!(images.reads(), 1);
/// ```
#[derive(Debug, Default)]
pub struct MemoryImages
{
    images: HashMap<PathBuf, Arc<[u8]>>,
    reads: AtomicUsize,
}

impl MemoryImages
{
    pub fn new() -> Self
    {
        Self::default()
    }

    /// Register an image under `path`, replacing any previous one.
    pub fn insert(&mut self, path: impl Into<PathBuf>, data: impl Into<Arc<[u8]>>)
    {
        self.images.insert(path.into(), data.into());
    }

    /// Number of read calls served so far.
    pub fn reads(&self) -> usize
    {
        self.reads.load(Ordering::SeqCst)
    }

    fn image(&self, path: &Path) -> TraceResult<&Arc<[u8]>>
    {
        self.images.get(path).ok_or_else(|| {
            TraceError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("{} not registered", path.display()),
            ))
        })
    }
}

impl ImageReader for MemoryImages
{
    fn len(&self, path: &Path) -> TraceResult<u64>
    {
        Ok(self.image(path)?.len() as u64)
    }

    fn read_at(&self, path: &Path, offset: u64, buf: &mut [u8]) -> TraceResult<usize>
    {
        self.reads.fetch_add(1, Ordering::SeqCst);
        let image = self.image(path)?;
        let Ok(start) = usize::try_from(offset) else {
            return Ok(0);
        };
        let Some(available) = image.get(start..) else {
            return Ok(0);
        };
        let read = available.len().min(buf.len());
        buf[..read].copy_from_slice(&available[..read]);
        Ok(read)
    }

    fn read_image(&self, path: &Path) -> TraceResult<Arc<[u8]>>
    {
        self.reads.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::clone(self.image(path)?))
    }
}

impl<R: ImageReader + ?Sized> ImageReader for Arc<R>
{
    fn len(&self, path: &Path) -> TraceResult<u64>
    {
        (**self).len(path)
    }

    fn read_at(&self, path: &Path, offset: u64, buf: &mut [u8]) -> TraceResult<usize>
    {
        (**self).read_at(path, offset, buf)
    }

    fn read_prefix(&self, path: &Path, buf: &mut [u8]) -> TraceResult<usize>
    {
        (**self).read_prefix(path, buf)
    }

    fn read_image(&self, path: &Path) -> TraceResult<Arc<[u8]>>
    {
        (**self).read_image(path)
    }
}
