//! # Module Registry
//!
//! Immutable snapshot of the modules (executables and shared libraries)
//! mapped into a process, sorted by base address.
//!
//! A snapshot is built from a [`ModuleSource`] once and then only read:
//! [`ModuleRegistry::lookup`] is a binary search over non-overlapping ranges.
//! When the caller knows modules were loaded or unloaded it asks for a new
//! snapshot with [`ModuleRegistry::refresh`]; modules whose path and range
//! did not change are carried over, keeping their already-built indices.
//!
//! ## Example
//!
//! ```rust
//! use stackwise_core::registry::{ModuleDescriptor, ModuleRegistry, StaticModules};
//! use stackwise_core::types::Address;
//!
//! let source = StaticModules::new(vec![
//!     ModuleDescriptor::new("/usr/bin/demo".into(), Address::from(0x40_0000), 0x1000),
//!     ModuleDescriptor::new("/usr/lib/libdemo.so".into(), Address::from(0x7f00_0000), 0x2000),
//! ]);
//! let registry = ModuleRegistry::from_source(&source).unwrap();
//!
//! let module = registry.lookup(Address::from(0x7f00_0100)).unwrap();
//! assert_eq!(module.name(), "libdemo.so");
//! assert!(registry.lookup(Address::from(0x10)).is_none());
//! ```

pub mod source;

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use once_cell::sync::OnceCell;
use tracing::{debug, warn};

pub use source::{default_source, ModuleSource, ProcMaps, StaticModules};
#[cfg(target_os = "macos")]
pub use source::DyldImages;

use crate::error::{FailureKind, TraceResult};
use crate::format::ObjectFormat;
use crate::symbols::ModuleIndex;
use crate::types::Address;

/// What a module source reports for one module
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ModuleDescriptor
{
    pub path: PathBuf,
    pub base: Address,
    pub size: u64,
}

impl ModuleDescriptor
{
    pub fn new(path: PathBuf, base: Address, size: u64) -> Self
    {
        Self { path, base, size }
    }

    /// One past the last byte, saturating at the top of the address space.
    pub fn end(&self) -> Address
    {
        Address::from(self.base.value().saturating_add(self.size))
    }
}

/// Result of building a module's index, cached for the module's lifetime
#[derive(Debug, Clone)]
pub enum IndexState
{
    Indexed(Arc<ModuleIndex>),
    /// The module is never parsed again; frames in it resolve module-only
    Unavailable(FailureKind),
}

/// A module in a registry snapshot
///
/// Holds the lazily computed, build-once caches for the module: the detected
/// object format and the symbol/line index. Both are `OnceCell`s, so
/// concurrent first users run the work exactly once.
pub struct LoadedModule
{
    descriptor: ModuleDescriptor,
    name: String,
    pub(crate) format: OnceCell<ObjectFormat>,
    pub(crate) index: OnceCell<IndexState>,
    /// Set by the first caller that commits to building the index
    pub(crate) claimed: AtomicBool,
}

impl LoadedModule
{
    pub fn new(descriptor: ModuleDescriptor) -> Self
    {
        let name = descriptor
            .path
            .file_name()
            .map_or_else(|| descriptor.path.display().to_string(), |name| name.to_string_lossy().into_owned());
        Self {
            descriptor,
            name,
            format: OnceCell::new(),
            index: OnceCell::new(),
            claimed: AtomicBool::new(false),
        }
    }

    /// A module whose index is supplied up front instead of parsed from disk.
    pub fn with_index(descriptor: ModuleDescriptor, index: ModuleIndex) -> Self
    {
        Self::with_shared_index(descriptor, Arc::new(index))
    }

    /// A module reusing an index built for another load of the same file.
    ///
    /// Index offsets are relative to the image, so they hold at any base.
    pub fn with_shared_index(descriptor: ModuleDescriptor, index: Arc<ModuleIndex>) -> Self
    {
        let module = Self::new(descriptor);
        let _ = module.format.set(index.format());
        let _ = module.index.set(IndexState::Indexed(index));
        module.claimed.store(true, Ordering::Release);
        module
    }

    pub fn descriptor(&self) -> &ModuleDescriptor
    {
        &self.descriptor
    }

    pub fn path(&self) -> &Path
    {
        &self.descriptor.path
    }

    /// File name of the module, used in rendered traces.
    pub fn name(&self) -> &str
    {
        &self.name
    }

    pub fn base(&self) -> Address
    {
        self.descriptor.base
    }

    pub fn size(&self) -> u64
    {
        self.descriptor.size
    }

    pub fn end(&self) -> Address
    {
        self.descriptor.end()
    }

    pub fn contains(&self, address: Address) -> bool
    {
        address >= self.base() && address < self.end()
    }

    /// Offset of `address` from the module base, if it lies inside.
    pub fn offset_of(&self, address: Address) -> Option<u64>
    {
        if self.contains(address) {
            address.offset_from(self.base())
        } else {
            None
        }
    }

    /// Detected format, if detection has run.
    pub fn format(&self) -> Option<ObjectFormat>
    {
        self.format.get().copied()
    }

    /// Cached index state, if a build has finished.
    pub fn index_state(&self) -> Option<&IndexState>
    {
        self.index.get()
    }

    /// The built index, if one exists.
    pub fn index(&self) -> Option<&Arc<ModuleIndex>>
    {
        match self.index.get()? {
            IndexState::Indexed(index) => Some(index),
            IndexState::Unavailable(_) => None,
        }
    }
}

impl fmt::Debug for LoadedModule
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        f.debug_struct("LoadedModule")
            .field("path", &self.descriptor.path)
            .field("base", &self.descriptor.base)
            .field("size", &format_args!("0x{:x}", self.descriptor.size))
            .field("format", &self.format.get())
            .field("indexed", &self.index.get().map(|state| matches!(state, IndexState::Indexed(_))))
            .finish()
    }
}

/// Sorted, non-overlapping snapshot of loaded modules
#[derive(Debug, Default)]
pub struct ModuleRegistry
{
    modules: Vec<Arc<LoadedModule>>,
}

impl ModuleRegistry
{
    /// A snapshot with no modules; every lookup misses.
    pub fn empty() -> Self
    {
        Self::default()
    }

    /// Query `source` once and build a snapshot.
    pub fn from_source(source: &dyn ModuleSource) -> TraceResult<Self>
    {
        Ok(Self::from_descriptors(source.modules()?))
    }

    /// Build a snapshot from explicit descriptors.
    ///
    /// Empty modules are dropped. When two modules overlap, the one with the
    /// lower base is kept and the other is dropped with a warning.
    pub fn from_descriptors(descriptors: Vec<ModuleDescriptor>) -> Self
    {
        Self::assemble(descriptors, |descriptor| Arc::new(LoadedModule::new(descriptor)))
    }

    /// Registry over already constructed modules, such as ones carrying a
    /// prebuilt index.
    pub fn from_modules(modules: Vec<Arc<LoadedModule>>) -> Self
    {
        let mut by_descriptor: HashMap<ModuleDescriptor, Arc<LoadedModule>> =
            modules.into_iter().map(|module| (module.descriptor().clone(), module)).collect();
        let descriptors = by_descriptor.keys().cloned().collect();
        Self::assemble(descriptors, |descriptor| {
            by_descriptor
                .remove(&descriptor)
                .unwrap_or_else(|| Arc::new(LoadedModule::new(descriptor)))
        })
    }

    fn assemble(mut descriptors: Vec<ModuleDescriptor>, mut make: impl FnMut(ModuleDescriptor) -> Arc<LoadedModule>) -> Self
    {
        descriptors.retain(|descriptor| descriptor.size > 0);
        descriptors.sort_by(|a, b| a.base.cmp(&b.base).then_with(|| a.path.cmp(&b.path)));

        let mut modules: Vec<Arc<LoadedModule>> = Vec::with_capacity(descriptors.len());
        for descriptor in descriptors {
            if let Some(previous) = modules.last() {
                if descriptor.base < previous.end() {
                    warn!(
                        path = %descriptor.path.display(),
                        base = %descriptor.base,
                        overlaps = %previous.path().display(),
                        "dropping overlapping module"
                    );
                    continue;
                }
            }
            modules.push(make(descriptor));
        }

        debug!(modules = modules.len(), "built module registry");
        Self { modules }
    }

    /// Module whose range contains `address`.
    pub fn lookup(&self, address: Address) -> Option<&Arc<LoadedModule>>
    {
        let idx = self.modules.partition_point(|module| module.base() <= address);
        let module = self.modules.get(idx.checked_sub(1)?)?;
        module.contains(address).then_some(module)
    }

    /// All modules, sorted by base.
    pub fn modules(&self) -> &[Arc<LoadedModule>]
    {
        &self.modules
    }

    pub fn len(&self) -> usize
    {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool
    {
        self.modules.is_empty()
    }

    /// Build a new snapshot from `source`, reusing unchanged modules.
    ///
    /// A module is reused when path, base and size all match, so its format
    /// and index caches survive the refresh.
    pub fn refresh(&self, source: &dyn ModuleSource) -> TraceResult<Self>
    {
        Ok(self.refresh_from(source.modules()?))
    }

    /// [`Self::refresh`] with explicit descriptors.
    pub fn refresh_from(&self, descriptors: Vec<ModuleDescriptor>) -> Self
    {
        let existing: HashMap<&ModuleDescriptor, &Arc<LoadedModule>> =
            self.modules.iter().map(|module| (module.descriptor(), module)).collect();

        let mut reused = 0usize;
        let registry = Self::assemble(descriptors, |descriptor| match existing.get(&descriptor) {
            Some(module) => {
                reused += 1;
                Arc::clone(module)
            }
            None => Arc::new(LoadedModule::new(descriptor)),
        });
        debug!(reused, total = registry.len(), "refreshed module registry");
        registry
    }
}
