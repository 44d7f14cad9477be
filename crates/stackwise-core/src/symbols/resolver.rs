//! Build-once symbol resolution per module.
//!
//! The resolver owns no per-module state: detected formats and built indices
//! live in `OnceCell`s on each [`LoadedModule`], so they are shared by every
//! caller that holds the same registry snapshot. What the resolver owns is
//! the [`ImageReader`] used to load module bytes and a build counter.
//!
//! ## Build modes
//!
//! - [`BuildMode::Blocking`]: build if needed, waiting for a build already in
//!   flight on another thread
//! - [`BuildMode::NonBlocking`]: return [`IndexLookup::Pending`] instead of
//!   waiting when another caller has already claimed the build
//! - [`BuildMode::CachedOnly`]: never build; used where allocation and I/O
//!   are off limits
//!
//! [`SymbolResolver::index_within`] bounds the wait instead: the build runs on
//! a worker thread and keeps going after the caller gives up, so a later
//! lookup finds it cached.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tracing::{debug, warn};

use crate::error::FailureKind;
use crate::format::{ObjectFormat, HEADER_PREFIX_LEN};
use crate::registry::{IndexState, LoadedModule};
use crate::symbols::index::{LineNumberEntry, ModuleIndex, SymbolMatch};
use crate::symbols::reader::{FsImageReader, ImageReader};

/// How [`SymbolResolver::index`] treats a module that is not indexed yet
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum BuildMode
{
    #[default]
    Blocking,
    NonBlocking,
    CachedOnly,
}

/// Answer of [`SymbolResolver::index`]
#[derive(Debug, Clone, Copy)]
pub enum IndexLookup<'m>
{
    Ready(&'m Arc<ModuleIndex>),
    /// A previous build failed; the failure is permanent for this module
    Unavailable(FailureKind),
    /// Another caller is building the index right now
    Pending,
    /// Not built, and the mode did not allow building
    NotBuilt,
}

impl<'m> IndexLookup<'m>
{
    pub fn ready(self) -> Option<&'m Arc<ModuleIndex>>
    {
        match self {
            IndexLookup::Ready(index) => Some(index),
            _ => None,
        }
    }
}

impl<'m> From<&'m IndexState> for IndexLookup<'m>
{
    fn from(state: &'m IndexState) -> Self
    {
        match state {
            IndexState::Indexed(index) => IndexLookup::Ready(index),
            IndexState::Unavailable(kind) => IndexLookup::Unavailable(*kind),
        }
    }
}

/// Resolves module offsets to symbols and lines
pub struct SymbolResolver
{
    reader: Arc<dyn ImageReader>,
    builds: AtomicUsize,
}

impl Default for SymbolResolver
{
    fn default() -> Self
    {
        Self::new()
    }
}

impl SymbolResolver
{
    /// Resolver that reads modules from the file system.
    pub fn new() -> Self
    {
        Self::with_reader(Arc::new(FsImageReader))
    }

    pub fn with_reader(reader: Arc<dyn ImageReader>) -> Self
    {
        Self {
            reader,
            builds: AtomicUsize::new(0),
        }
    }

    pub fn reader(&self) -> &Arc<dyn ImageReader>
    {
        &self.reader
    }

    /// Number of index builds this resolver has executed.
    pub fn build_count(&self) -> usize
    {
        self.builds.load(Ordering::SeqCst)
    }

    /// Format of `module`, detected from its header on first call.
    ///
    /// A module whose header cannot be read is classified as opaque.
    pub fn detect_format(&self, module: &LoadedModule) -> ObjectFormat
    {
        *module.format.get_or_init(|| {
            let mut prefix = [0u8; HEADER_PREFIX_LEN];
            match self.reader.read_prefix(module.path(), &mut prefix) {
                Ok(read) => ObjectFormat::detect(&prefix[..read]),
                Err(err) => {
                    debug!(path = %module.path().display(), error = %err, "module header unreadable");
                    ObjectFormat::Opaque
                }
            }
        })
    }

    /// Index of `module`, built according to `mode`.
    pub fn index<'m>(&self, module: &'m LoadedModule, mode: BuildMode) -> IndexLookup<'m>
    {
        if let Some(state) = module.index.get() {
            return state.into();
        }

        match mode {
            BuildMode::CachedOnly => return IndexLookup::NotBuilt,
            BuildMode::NonBlocking => {
                if module.claimed.swap(true, Ordering::AcqRel) {
                    return module.index.get().map_or(IndexLookup::Pending, IndexLookup::from);
                }
            }
            BuildMode::Blocking => module.claimed.store(true, Ordering::Release),
        }

        module.index.get_or_init(|| self.build(module)).into()
    }

    /// Index of `module`, waiting at most `timeout` for it to be built.
    ///
    /// Returns [`IndexLookup::Pending`] when the build is still running at
    /// the timeout.
    pub fn index_within<'m>(self: &Arc<Self>, module: &'m Arc<LoadedModule>, timeout: Duration) -> IndexLookup<'m>
    {
        if let Some(state) = module.index.get() {
            return state.into();
        }
        if timeout.is_zero() {
            return IndexLookup::Pending;
        }

        let (done_tx, done_rx) = mpsc::channel();
        let resolver = Arc::clone(self);
        let worker_module = Arc::clone(module);
        let spawned = thread::Builder::new().name("stackwise-index".into()).spawn(move || {
            resolver.index(&worker_module, BuildMode::Blocking);
            let _ = done_tx.send(());
        });
        if let Err(err) = spawned {
            debug!(error = %err, "could not spawn index builder, building inline");
            return self.index(module, BuildMode::Blocking);
        }

        match done_rx.recv_timeout(timeout) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => module.index.get().map_or(IndexLookup::Pending, IndexLookup::from),
            Err(RecvTimeoutError::Timeout) => {
                debug!(path = %module.path().display(), ?timeout, "index build outlasted the wait");
                IndexLookup::Pending
            }
        }
    }

    fn build(&self, module: &LoadedModule) -> IndexState
    {
        self.builds.fetch_add(1, Ordering::SeqCst);

        let format = self.detect_format(module);
        if format.is_opaque() {
            debug!(path = %module.path().display(), "opaque module, resolving to module only");
            return IndexState::Unavailable(FailureKind::UnsupportedFormat);
        }

        match ModuleIndex::build(module.path(), format, self.reader.as_ref()) {
            Ok(index) => IndexState::Indexed(Arc::new(index)),
            Err(err) => {
                warn!(path = %module.path().display(), %format, error = %err, "failed to index module");
                IndexState::Unavailable(err.kind())
            }
        }
    }

    /// Nearest-enclosing symbol for `offset` within `module`, building the
    /// index if needed.
    pub fn resolve<'m>(&self, module: &'m LoadedModule, offset: u64) -> Option<SymbolMatch<'m>>
    {
        self.index(module, BuildMode::Blocking).ready()?.symbols().lookup(offset)
    }

    /// Line row covering `offset` within `module`, building the index if
    /// needed. Independent of whether a symbol exists there.
    pub fn resolve_line<'m>(&self, module: &'m LoadedModule, offset: u64) -> Option<&'m LineNumberEntry>
    {
        self.index(module, BuildMode::Blocking).ready()?.lines().lookup(offset)
    }
}

impl std::fmt::Debug for SymbolResolver
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result
    {
        f.debug_struct("SymbolResolver").field("builds", &self.build_count()).finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests
{
    use std::path::PathBuf;

    use super::*;
    use crate::registry::ModuleDescriptor;
    use crate::symbols::reader::MemoryImages;
    use crate::symbols::{LineIndex, LineNumberEntry, SymbolIndex, SymbolTableEntry};
    use crate::types::Address;

    fn module(path: &str) -> LoadedModule
    {
        LoadedModule::new(ModuleDescriptor::new(PathBuf::from(path), Address::from(0x1000), 0x1000))
    }

    #[test]
    fn test_resolve_from_prebuilt_index()
    {
        let index = ModuleIndex::from_parts(
            ObjectFormat::Elf64,
            0,
            SymbolIndex::new(vec![SymbolTableEntry::new(0x100, "f", None), SymbolTableEntry::new(0x200, "g", None)]),
            LineIndex::new(vec![LineNumberEntry::new(0x100, "a.c", 10), LineNumberEntry::new(0x180, "a.c", 20)]),
        );
        let module = LoadedModule::with_index(
            ModuleDescriptor::new(PathBuf::from("/lib/a.so"), Address::from(0x1000), 0x1000),
            index,
        );
        let resolver = SymbolResolver::with_reader(Arc::new(MemoryImages::new()));

        assert_eq!(resolver.resolve(&module, 0x150).map(|m| &*m.entry.name), Some("f"));
        assert_eq!(resolver.resolve(&module, 0x200).map(|m| &*m.entry.name), Some("g"));
        assert!(resolver.resolve(&module, 0x50).is_none());
        assert_eq!(resolver.resolve_line(&module, 0x170).map(|e| e.line), Some(10));
        assert_eq!(resolver.resolve_line(&module, 0x180).map(|e| e.line), Some(20));
        assert_eq!(resolver.build_count(), 0);
    }

    #[test]
    fn test_opaque_module_cached_as_unavailable()
    {
        let mut images = MemoryImages::new();
        images.insert("/data/blob", vec![0u8; 128]);
        let images = Arc::new(images);
        let resolver = SymbolResolver::with_reader(Arc::clone(&images) as Arc<dyn ImageReader>);
        let module = module("/data/blob");

        assert!(matches!(
            resolver.index(&module, BuildMode::Blocking),
            IndexLookup::Unavailable(FailureKind::UnsupportedFormat)
        ));
        let reads = images.reads();
        assert!(matches!(resolver.index(&module, BuildMode::Blocking), IndexLookup::Unavailable(_)));
        assert_eq!(images.reads(), reads);
        assert_eq!(resolver.build_count(), 1);
    }

    #[test]
    fn test_missing_file_is_unsupported_and_never_retried()
    {
        let resolver = SymbolResolver::with_reader(Arc::new(MemoryImages::new()));
        let module = module("/gone/libx.so");

        assert_eq!(resolver.detect_format(&module), ObjectFormat::Opaque);
        assert!(matches!(
            resolver.index(&module, BuildMode::NonBlocking),
            IndexLookup::Unavailable(FailureKind::UnsupportedFormat)
        ));
        assert!(resolver.resolve(&module, 0).is_none());
        assert_eq!(resolver.build_count(), 1);
    }

    #[test]
    fn test_cached_only_never_builds()
    {
        let resolver = SymbolResolver::with_reader(Arc::new(MemoryImages::new()));
        let module = module("/lib/liby.so");

        assert!(matches!(resolver.index(&module, BuildMode::CachedOnly), IndexLookup::NotBuilt));
        assert_eq!(resolver.build_count(), 0);
        assert!(module.format().is_none());
    }

    #[test]
    fn test_index_within_waits_for_build()
    {
        let resolver = Arc::new(SymbolResolver::with_reader(Arc::new(MemoryImages::new())));
        let module = Arc::new(module("/gone/libz.so"));

        assert!(matches!(resolver.index_within(&module, Duration::ZERO), IndexLookup::Pending));
        assert_eq!(resolver.build_count(), 0);

        assert!(matches!(
            resolver.index_within(&module, Duration::from_secs(30)),
            IndexLookup::Unavailable(FailureKind::UnsupportedFormat)
        ));
        assert_eq!(resolver.build_count(), 1);
    }
}
