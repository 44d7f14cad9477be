//! Symbol demangling.
//!
//! Best-effort conversion of linkage names into readable names:
//!
//! - **Rust**: legacy (`_ZN...17h<hash>E`) and v0 (`_R...`) via `rustc-demangle`,
//!   printed in the alternate form so the hash suffix is hidden
//! - **C++**: Itanium ABI (`_Z...`) via `cpp_demangle`
//! - **C** and anything unrecognised: returned unchanged
//!
//! Mach-O prefixes every name with one extra underscore (`__ZN...`); it is
//! tolerated here so raw Mach-O names can be passed straight in.
//!
//! Demangling never fails and never panics: on any error the input comes back
//! borrowed and untouched.

use std::borrow::Cow;
use std::sync::Arc;

use cpp_demangle::DemangleOptions;
use rustc_demangle::try_demangle;

use crate::types::SymbolLanguage;

/// Demangle `raw`, or return it unchanged.
///
/// ```rust
/// use stackwise_core::symbols::demangle::demangle;
///
/// assert_eq!(demangle("_ZN4core3fmt5write17h0123456789abcdefE"), "core::fmt::write");
/// assert_eq!(demangle("_ZN3foo3barEv"), "foo::bar()");
/// assert_eq!(demangle("main"), "main");
/// ```
pub fn demangle(raw: &str) -> Cow<'_, str>
{
    let name = strip_macho_underscore(raw);
    let demangled = match SymbolLanguage::detect(name) {
        SymbolLanguage::Rust => demangle_rust(name).or_else(|| demangle_cpp(name)),
        SymbolLanguage::Cpp => demangle_cpp(name).or_else(|| demangle_rust(name)),
        SymbolLanguage::C | SymbolLanguage::Unknown => None,
    };

    match demangled {
        Some(text) if text != raw => Cow::Owned(text),
        _ => Cow::Borrowed(raw),
    }
}

/// Demangled form as a shared string, or `None` when it equals the input.
///
/// Used at index build time so frames can reference the result without
/// allocating.
pub(crate) fn demangle_shared(raw: &str) -> Option<Arc<str>>
{
    match demangle(raw) {
        Cow::Owned(text) => Some(Arc::from(text)),
        Cow::Borrowed(_) => None,
    }
}

fn strip_macho_underscore(raw: &str) -> &str
{
    if raw.starts_with("__Z") || raw.starts_with("__R") {
        &raw[1..]
    } else {
        raw
    }
}

fn demangle_rust(name: &str) -> Option<String>
{
    try_demangle(name).ok().map(|demangled| format!("{demangled:#}"))
}

fn demangle_cpp(name: &str) -> Option<String>
{
    cpp_demangle::Symbol::new(name)
        .ok()
        .and_then(|symbol| symbol.demangle(&DemangleOptions::default()).ok())
}

#[cfg(test)]
mod tests
{
    use super::*;

    #[test]
    fn test_rust_v0()
    {
        let demangled = demangle("_RNvCs1234_7mycrate3foo");
        assert!(demangled.ends_with("mycrate::foo"), "{demangled}");
    }

    #[test]
    fn test_macho_prefixed_cpp()
    {
        assert_eq!(demangle("__ZN3foo3barEv"), "foo::bar()");
    }

    #[test]
    fn test_garbage_is_returned_borrowed()
    {
        for raw in ["_Z", "_ZN", "_R", "", "hello world", "_ZZZZZ"] {
            assert!(matches!(demangle(raw), Cow::Borrowed(text) if text == raw), "{raw}");
        }
    }

    #[test]
    fn test_shared_only_when_changed()
    {
        assert!(demangle_shared("memcpy").is_none());
        assert_eq!(demangle_shared("_ZN3foo3barEv").as_deref(), Some("foo::bar()"));
    }
}
