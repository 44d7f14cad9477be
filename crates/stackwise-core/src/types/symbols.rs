//! Symbol language classification.

use std::fmt;

/// Programming language a raw symbol name was most likely produced by.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SymbolLanguage
{
    /// Rust symbol (v0 `_R` mangling, or legacy `_ZN...17h<hash>E`).
    Rust,
    /// C++ symbol (Itanium mangling without Rust extensions).
    Cpp,
    /// C symbol or unmangled global.
    C,
    /// Unknown or mixed language.
    Unknown,
}

impl SymbolLanguage
{
    /// Classify a raw name by its mangling prefix.
    ///
    /// Mach-O adds one leading underscore to every name; it is ignored here.
    ///
    /// ```rust
    /// use stackwise_core::types::SymbolLanguage;
    ///
    /// assert_eq!(SymbolLanguage::detect("_RNvCs1234_7mycrate3foo"), SymbolLanguage::Rust);
    /// assert_eq!(SymbolLanguage::detect("__ZN3foo3barEv"), SymbolLanguage::Cpp);
    /// assert_eq!(SymbolLanguage::detect("memcpy"), SymbolLanguage::C);
    /// ```
    pub fn detect(raw: &str) -> Self
    {
        let name = if raw.starts_with("__Z") || raw.starts_with("__R") { &raw[1..] } else { raw };
        if name.is_empty() {
            return SymbolLanguage::Unknown;
        }
        if name.starts_with("_R") || is_legacy_rust(name) {
            SymbolLanguage::Rust
        } else if name.starts_with("_Z") {
            SymbolLanguage::Cpp
        } else if name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.' || c == '$') {
            SymbolLanguage::C
        } else {
            SymbolLanguage::Unknown
        }
    }
}

/// Legacy Rust mangling is Itanium-shaped with a trailing `17h<16 hex digits>E`.
fn is_legacy_rust(name: &str) -> bool
{
    if !name.starts_with("_ZN") || !name.ends_with('E') || name.len() < 20 {
        return false;
    }
    let body = &name[..name.len() - 1];
    let Some(hash) = body.get(body.len() - 17..) else {
        return false;
    };
    hash.starts_with('h') && hash[1..].chars().all(|c| c.is_ascii_hexdigit()) && body[..body.len() - 17].ends_with("17")
}

impl fmt::Display for SymbolLanguage
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        let label = match self {
            SymbolLanguage::Rust => "rust",
            SymbolLanguage::Cpp => "c++",
            SymbolLanguage::C => "c",
            SymbolLanguage::Unknown => "unknown",
        };
        write!(f, "{label}")
    }
}
