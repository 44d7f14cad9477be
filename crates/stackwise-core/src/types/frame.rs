//! A single frame of a captured stack trace.

use std::fmt;
use std::sync::Arc;

use super::Address;
use crate::registry::LoadedModule;

/// How far a frame has been enriched.
///
/// Stages only move forward. A stage may be skipped (a line can be known
/// without a symbol) but never reached without a module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ResolutionStage
{
    /// Only the raw address is known
    Captured,
    /// The containing module and the offset inside it are known
    ModuleLocated,
    /// A symbol covering the offset was found
    SymbolResolved,
    /// A source line covering the offset was found
    LineResolved,
}

/// Per-frame result reported to callers. Never an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResolutionOutcome
{
    Unresolved,
    ModuleOnly,
    SymbolOnly,
    SymbolAndLine,
}

impl fmt::Display for ResolutionOutcome
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        let label = match self {
            ResolutionOutcome::Unresolved => "unresolved",
            ResolutionOutcome::ModuleOnly => "module-only",
            ResolutionOutcome::SymbolOnly => "symbol-only",
            ResolutionOutcome::SymbolAndLine => "symbol+line",
        };
        write!(f, "{label}")
    }
}

/// One frame of a stack trace, innermost first
///
/// Created by the walker with only an address, then enriched in place by the
/// capture pipeline. The setters refuse to populate a later stage before the
/// module is known, so the fields always describe a consistent prefix of the
/// pipeline.
///
/// Names and file paths are `Arc<str>` handles into the module's index:
/// enriching a frame never allocates.
///
/// ## Example
///
/// ```rust
/// use stackwise_core::types::{Address, ResolutionOutcome, StackTraceFrame};
///
/// let mut frame = StackTraceFrame::new(0, Address::from(0x7fff_0000_1234));
/// assert_eq!(frame.outcome(), ResolutionOutcome::Unresolved);
///
/// // No module yet, so the symbol is refused.
/// assert!(!frame.set_symbol("main".into(), 0x10, None));
/// assert!(frame.symbol().is_none());
/// ```
#[derive(Debug, Clone, Default)]
pub struct StackTraceFrame
{
    index: usize,
    address: Address,
    return_address: bool,
    module: Option<Arc<LoadedModule>>,
    module_offset: Option<u64>,
    symbol: Option<Arc<str>>,
    symbol_offset: Option<u64>,
    demangled: Option<Arc<str>>,
    source_file: Option<Arc<str>>,
    line: Option<u32>,
}

impl StackTraceFrame
{
    /// Create an address-only frame.
    pub fn new(index: usize, address: Address) -> Self
    {
        Self {
            index,
            address,
            return_address: index > 0,
            ..Self::default()
        }
    }

    /// Override whether the address is treated as a return address.
    ///
    /// Addresses typed in by a user point at the instruction itself and
    /// should be looked up as-is.
    pub fn with_return_address(mut self, return_address: bool) -> Self
    {
        self.return_address = return_address;
        self
    }

    /// Reset a preallocated frame to the captured stage without allocating.
    pub(crate) fn reset(&mut self, index: usize, address: Address, return_address: bool)
    {
        self.index = index;
        self.address = address;
        self.return_address = return_address;
        self.module = None;
        self.module_offset = None;
        self.symbol = None;
        self.symbol_offset = None;
        self.demangled = None;
        self.source_file = None;
        self.line = None;
    }

    /// Position in the trace (0 = innermost).
    pub fn index(&self) -> usize
    {
        self.index
    }

    /// Raw program counter (frame 0) or return address (all others).
    pub fn address(&self) -> Address
    {
        self.address
    }

    /// Whether the address was read from the stack as a return address.
    pub fn is_return_address(&self) -> bool
    {
        self.return_address
    }

    /// Attach the containing module. This is the only way out of `Captured`.
    pub fn set_module(&mut self, module: Arc<LoadedModule>, offset: u64)
    {
        self.module = Some(module);
        self.module_offset = Some(offset);
    }

    /// Attach a symbol. Returns `false` (and changes nothing) without a module.
    pub fn set_symbol(&mut self, raw: Arc<str>, offset: u64, demangled: Option<Arc<str>>) -> bool
    {
        if self.module.is_none() {
            return false;
        }
        self.symbol = Some(raw);
        self.symbol_offset = Some(offset);
        self.demangled = demangled;
        true
    }

    /// Attach a source location. Returns `false` (and changes nothing) without a module.
    pub fn set_line(&mut self, file: Arc<str>, line: u32) -> bool
    {
        if self.module.is_none() {
            return false;
        }
        self.source_file = Some(file);
        self.line = Some(line);
        true
    }

    /// Drop the demangled name so renderers fall back to the raw symbol.
    pub(crate) fn clear_demangled(&mut self)
    {
        self.demangled = None;
    }

    pub fn module(&self) -> Option<&Arc<LoadedModule>>
    {
        self.module.as_ref()
    }

    pub fn module_offset(&self) -> Option<u64>
    {
        self.module_offset
    }

    /// Offset used for symbol and line lookup.
    ///
    /// A return address points at the instruction after the call, which may
    /// already belong to the next function or line. Looking up one byte
    /// earlier lands inside the call instruction.
    pub fn lookup_offset(&self) -> Option<u64>
    {
        let offset = self.module_offset?;
        if self.return_address {
            Some(offset.saturating_sub(1))
        } else {
            Some(offset)
        }
    }

    /// Raw (mangled) symbol name.
    pub fn symbol(&self) -> Option<&str>
    {
        self.symbol.as_deref()
    }

    /// Distance from the symbol start to [`Self::address`].
    pub fn symbol_offset(&self) -> Option<u64>
    {
        self.symbol_offset
    }

    pub fn demangled(&self) -> Option<&str>
    {
        self.demangled.as_deref()
    }

    /// Best available name: demangled, then raw.
    pub fn display_name(&self) -> Option<&str>
    {
        self.demangled().or_else(|| self.symbol())
    }

    pub fn source_file(&self) -> Option<&str>
    {
        self.source_file.as_deref()
    }

    pub fn line(&self) -> Option<u32>
    {
        self.line
    }

    /// Furthest stage this frame has reached.
    pub fn stage(&self) -> ResolutionStage
    {
        if self.line.is_some() {
            ResolutionStage::LineResolved
        } else if self.symbol.is_some() {
            ResolutionStage::SymbolResolved
        } else if self.module.is_some() {
            ResolutionStage::ModuleLocated
        } else {
            ResolutionStage::Captured
        }
    }

    /// Outcome summary. A line without a symbol still reports `ModuleOnly`.
    pub fn outcome(&self) -> ResolutionOutcome
    {
        match (&self.module, &self.symbol, self.line) {
            (None, _, _) => ResolutionOutcome::Unresolved,
            (Some(_), None, _) => ResolutionOutcome::ModuleOnly,
            (Some(_), Some(_), None) => ResolutionOutcome::SymbolOnly,
            (Some(_), Some(_), Some(_)) => ResolutionOutcome::SymbolAndLine,
        }
    }
}

#[cfg(test)]
mod tests
{
    use std::path::PathBuf;

    use super::*;
    use crate::registry::ModuleDescriptor;

    fn module() -> Arc<LoadedModule>
    {
        Arc::new(LoadedModule::new(ModuleDescriptor::new(PathBuf::from("/usr/lib/libdemo.so"), Address::from(0x40_0000), 0x1000)))
    }

    #[test]
    fn test_stages_advance_in_order()
    {
        let mut frame = StackTraceFrame::new(1, Address::from(0x40_0150));
        assert_eq!(frame.stage(), ResolutionStage::Captured);
        assert!(!frame.set_line("a.c".into(), 10));

        frame.set_module(module(), 0x150);
        assert_eq!(frame.stage(), ResolutionStage::ModuleLocated);
        assert_eq!(frame.outcome(), ResolutionOutcome::ModuleOnly);

        assert!(frame.set_line("a.c".into(), 10));
        assert_eq!(frame.stage(), ResolutionStage::LineResolved);
        assert_eq!(frame.outcome(), ResolutionOutcome::ModuleOnly);

        assert!(frame.set_symbol("f".into(), 0x50, None));
        assert_eq!(frame.outcome(), ResolutionOutcome::SymbolAndLine);
        assert_eq!(frame.display_name(), Some("f"));
    }

    #[test]
    fn test_return_address_lookup_offset()
    {
        let mut inner = StackTraceFrame::new(0, Address::from(0x40_0150));
        inner.set_module(module(), 0x150);
        assert_eq!(inner.lookup_offset(), Some(0x150));

        let mut outer = StackTraceFrame::new(1, Address::from(0x40_0200));
        outer.set_module(module(), 0x200);
        assert_eq!(outer.lookup_offset(), Some(0x1ff));
    }

    #[test]
    fn test_reset_clears_everything()
    {
        let mut frame = StackTraceFrame::new(3, Address::from(0x40_0150));
        frame.set_module(module(), 0x150);
        frame.set_symbol("f".into(), 0x50, Some("f()".into()));

        frame.reset(0, Address::from(0x10), false);
        assert_eq!(frame.index(), 0);
        assert_eq!(frame.stage(), ResolutionStage::Captured);
        assert!(frame.demangled().is_none());
    }
}
