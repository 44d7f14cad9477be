//! Shared fixtures for the integration tests

#![allow(dead_code)]

use object::write::{Object, StandardSection, Symbol, SymbolSection};
use object::{Architecture, BinaryFormat, Endianness, SymbolFlags, SymbolKind, SymbolScope};

pub const MODULE_PATH: &str = "/virtual/lib/libdemo.so";
pub const MODULE_BASE: u64 = 0x40_0000;
pub const MODULE_SIZE: u64 = 0x1000;

pub const MANGLED_MAIN: &str = "_ZN4demo4main17h0123456789abcdefE";

/// Relocatable ELF with `.text` of 0x400 bytes and the given function symbols.
pub fn elf_image(functions: &[(&str, u64, u64)]) -> Vec<u8>
{
    let mut obj = Object::new(BinaryFormat::Elf, Architecture::X86_64, Endianness::Little);
    let text = obj.section_id(StandardSection::Text);
    obj.append_section_data(text, &[0x90; 0x400], 16);

    for &(name, value, size) in functions {
        obj.add_symbol(Symbol {
            name: name.as_bytes().to_vec(),
            value,
            size,
            kind: SymbolKind::Text,
            scope: SymbolScope::Linkage,
            weak: false,
            section: SymbolSection::Section(text),
            flags: SymbolFlags::None,
        });
    }
    obj.write().expect("write synthetic ELF")
}

/// `f` at 0x100 and `g` at 0x200, plus a mangled Rust function at 0x300.
pub fn demo_image() -> Vec<u8>
{
    elf_image(&[("f", 0x100, 0x100), ("g", 0x200, 0x100), (MANGLED_MAIN, 0x300, 0x80)])
}
