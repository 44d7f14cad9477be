//! # Symbol Resolution
//!
//! Maps module offsets to function names and source lines.
//!
//! ## Pipeline
//!
//! 1. **Detect**: the module's header prefix is classified once
//!    ([`crate::format::ObjectFormat`]) and cached on the module.
//! 2. **Index**: on first use the image is read through an [`ImageReader`],
//!    its symbol table, DWARF line table and `.eh_frame` are extracted, and
//!    names are demangled. The result is one immutable [`ModuleIndex`].
//! 3. **Lookup**: nearest-enclosing symbol and line row by binary search.
//!
//! A module that cannot be indexed (opaque format, unreadable or corrupt
//! file) is remembered as unavailable and never read again; its frames
//! resolve to module-only.

pub mod demangle;
pub mod index;
pub mod reader;
pub mod resolver;

pub use demangle::demangle;
pub use index::{LineIndex, LineNumberEntry, ModuleIndex, SymbolIndex, SymbolMatch, SymbolTableEntry};
pub use reader::{FsImageReader, ImageReader, MemoryImages, MAX_IMAGE_SIZE};
pub use resolver::{BuildMode, IndexLookup, SymbolResolver};

pub use crate::registry::IndexState;
