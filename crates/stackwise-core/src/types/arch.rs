//! CPU architecture and the DWARF register numbers the walker needs.

use std::fmt;

use gimli::Register;

/// CPU architecture of the process being traced
///
/// The walker only understands 64-bit targets with a conventional frame
/// record (`[fp]` = caller fp, `[fp + 8]` = return address). Anything else is
/// reported as `Unknown` and yields single-frame traces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Architecture
{
    /// 64-bit ARM (AArch64)
    ///
    /// Frame records are pushed by `stp x29, x30, [sp, #-16]!`, so the layout
    /// matches x86-64 once the prologue has run. The link register holds the
    /// return address of a leaf function that has not yet saved it.
    Arm64,
    /// 64-bit x86 (Intel/AMD)
    ///
    /// `push rbp; mov rbp, rsp` leaves the caller's `rbp` at `[rbp]` and the
    /// return address pushed by `call` at `[rbp + 8]`.
    X86_64,
    /// Any other architecture
    Unknown(&'static str),
}

impl Architecture
{
    /// Architecture of the running binary, fixed at compile time.
    ///
    /// ```rust
    /// use stackwise_core::types::Architecture;
    ///
    /// let arch = Architecture::current();
    /// assert!(!arch.to_string().is_empty());
    /// ```
    pub const fn current() -> Self
    {
        #[cfg(target_arch = "aarch64")]
        {
            Architecture::Arm64
        }

        #[cfg(target_arch = "x86_64")]
        {
            Architecture::X86_64
        }

        #[cfg(not(any(target_arch = "aarch64", target_arch = "x86_64")))]
        {
            Architecture::Unknown(std::env::consts::ARCH)
        }
    }

    /// Map an `object` architecture onto ours.
    pub fn from_object(arch: object::Architecture) -> Self
    {
        match arch {
            object::Architecture::Aarch64 => Architecture::Arm64,
            object::Architecture::X86_64 => Architecture::X86_64,
            _ => Architecture::Unknown("unknown"),
        }
    }

    /// The `object` architecture used to pick a slice out of a fat Mach-O.
    pub const fn to_object(self) -> object::Architecture
    {
        match self {
            Architecture::Arm64 => object::Architecture::Aarch64,
            Architecture::X86_64 => object::Architecture::X86_64,
            Architecture::Unknown(_) => object::Architecture::Unknown,
        }
    }

    /// Whether the frame-pointer walker understands this architecture.
    pub const fn is_supported(self) -> bool
    {
        matches!(self, Architecture::Arm64 | Architecture::X86_64)
    }

    /// DWARF number of the frame pointer register (`rbp` / `x29`).
    pub(crate) const fn fp_register(self) -> Option<Register>
    {
        match self {
            Architecture::Arm64 => Some(Register(29)),
            Architecture::X86_64 => Some(Register(6)),
            Architecture::Unknown(_) => None,
        }
    }

    /// DWARF number of the stack pointer register (`rsp` / `sp`).
    pub(crate) const fn sp_register(self) -> Option<Register>
    {
        match self {
            Architecture::Arm64 => Some(Register(31)),
            Architecture::X86_64 => Some(Register(7)),
            Architecture::Unknown(_) => None,
        }
    }

    /// DWARF number of the return-address column (`RA` / `x30`).
    pub(crate) const fn return_register(self) -> Option<Register>
    {
        match self {
            Architecture::Arm64 => Some(Register(30)),
            Architecture::X86_64 => Some(Register(16)),
            Architecture::Unknown(_) => None,
        }
    }
}

impl fmt::Display for Architecture
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        match self {
            Architecture::Arm64 => write!(f, "arm64"),
            Architecture::X86_64 => write!(f, "x86_64"),
            Architecture::Unknown(name) => write!(f, "{name}"),
        }
    }
}
