//! # Call Frame Information
//!
//! `.eh_frame` based unwinding for frames that do not keep a usable frame
//! pointer.
//!
//! A [`CfiTable`] is extracted once per module while its index is built and
//! evaluated with `gimli` for a single step at a time:
//!
//! 1. Find the FDE covering the program counter (translated back to the
//!    module's link-time address).
//! 2. Run its CFA program up to that address.
//! 3. Compute the CFA from its register rule, then recover the return
//!    address and frame pointer from their rules.
//!
//! Only register rules that can be answered from the walker's registers
//! (`pc`, `sp`, `fp`, `lr`) and from stack memory are supported; DWARF
//! expressions end the step.
//!
//! ## References
//!
//! - [DWARF CFI Specification](https://dwarfstd.org/doc/DWARF5.pdf#page=179)
//! - [gimli crate documentation](https://docs.rs/gimli/latest/gimli/)

use std::fmt;
use std::sync::Arc;

use gimli::{BaseAddresses, CfaRule, EhFrame, Register, RegisterRule, RunTimeEndian, UnwindContext, UnwindSection};
use object::{Object, ObjectSection};
use thiserror::Error;

use crate::format::dwarf::{endian_of, find_section};
use crate::types::{Address, Architecture};
use crate::unwind::memory::StackMemory;
use crate::unwind::FrameRegisters;

/// Result of one CFI step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CfiStep
{
    /// Registers of the calling frame
    Caller(FrameRegisters),
    /// The return address is explicitly undefined: this is the outermost frame
    EndOfStack,
    /// No FDE covers the address
    NoEntry,
}

/// Why a CFI step could not produce the caller's registers
///
/// Carries no heap data, so a failed step on the crash path stays
/// allocation-free.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CfiError
{
    #[error("malformed unwind info: {0}")]
    Gimli(gimli::Error),

    /// A rule refers to a register the walker does not track
    #[error("register {0} unavailable")]
    MissingRegister(u16),

    #[error("CFA expressions are not supported")]
    CfaExpression,

    #[error("unsupported register rule")]
    UnsupportedRule,

    #[error("no return address rule")]
    NoReturnAddress,

    #[error("no register map for {0}")]
    UnsupportedArch(Architecture),

    #[error("stack read at {0} out of bounds")]
    StackRead(Address),
}

/// Raw `.eh_frame` of one module plus what is needed to evaluate it
pub struct CfiTable
{
    eh_frame: Arc<[u8]>,
    eh_frame_address: u64,
    text_address: u64,
    image_base: u64,
    endian: RunTimeEndian,
    arch: Architecture,
}

impl CfiTable
{
    /// Extract `.eh_frame` (`__eh_frame` on Mach-O) from `file`.
    ///
    /// Returns `None` when the section is missing or empty, or when the file
    /// targets an architecture the walker does not handle.
    pub(crate) fn from_file(file: &object::File<'_>, image_base: u64) -> Option<Self>
    {
        let arch = Architecture::from_object(file.architecture());
        if !arch.is_supported() {
            return None;
        }

        let section = find_section(file, ".eh_frame")?;
        let data = section.data().ok().filter(|data| !data.is_empty())?;
        let text_address = find_section(file, ".text").map_or(0, |text| text.address());

        Some(Self {
            eh_frame: Arc::from(data),
            eh_frame_address: section.address(),
            text_address,
            image_base,
            endian: endian_of(file),
            arch,
        })
    }

    /// Table over raw little-endian `.eh_frame` bytes with absolute pointers.
    pub(crate) fn from_section(eh_frame: Vec<u8>, eh_frame_address: u64, image_base: u64, arch: Architecture) -> Self
    {
        Self {
            eh_frame: Arc::from(eh_frame),
            eh_frame_address,
            text_address: 0,
            image_base,
            endian: RunTimeEndian::Little,
            arch,
        }
    }

    pub fn arch(&self) -> Architecture
    {
        self.arch
    }

    /// Size of the raw section in bytes.
    pub fn len(&self) -> usize
    {
        self.eh_frame.len()
    }

    pub fn is_empty(&self) -> bool
    {
        self.eh_frame.is_empty()
    }

    /// Unwind one frame.
    ///
    /// `lookup_offset` is the module offset used to find the FDE; for return
    /// addresses the caller passes the offset of the call instruction, one
    /// byte before the return address.
    ///
    /// Reuses `ctx` and never allocates, so a context prepared ahead of time
    /// makes this usable from a crash handler.
    pub(crate) fn step(
        &self,
        ctx: &mut UnwindContext<usize>,
        lookup_offset: u64,
        regs: &FrameRegisters,
        memory: &dyn StackMemory,
    ) -> Result<CfiStep, CfiError>
    {
        let pc = self.image_base.wrapping_add(lookup_offset);
        let bases = BaseAddresses::default()
            .set_eh_frame(self.eh_frame_address)
            .set_text(self.text_address);
        let mut eh_frame = EhFrame::new(&self.eh_frame, self.endian);
        eh_frame.set_address_size(8);

        let fde = match eh_frame.fde_for_address(&bases, pc, |section, bases, offset| section.cie_from_offset(bases, offset)) {
            Ok(fde) => fde,
            Err(gimli::Error::NoUnwindInfoForAddress) => return Ok(CfiStep::NoEntry),
            Err(err) => return Err(CfiError::Gimli(err)),
        };
        let row = match fde.unwind_info_for_address(&eh_frame, &bases, ctx, pc) {
            Ok(row) => row,
            Err(gimli::Error::NoUnwindInfoForAddress) => return Ok(CfiStep::NoEntry),
            Err(err) => return Err(CfiError::Gimli(err)),
        };

        let cfa = match row.cfa() {
            CfaRule::RegisterAndOffset { register, offset } => {
                let base = read_register_value(self.arch, regs, *register).ok_or(CfiError::MissingRegister(register.0))?;
                base.wrapping_add_signed(*offset)
            }
            _ => return Err(CfiError::CfaExpression),
        };

        let (Some(ra_register), Some(fp_register)) = (self.arch.return_register(), self.arch.fp_register()) else {
            return Err(CfiError::UnsupportedArch(self.arch));
        };

        // Undefined rules are not stored, so "no rule" and "undefined" look the
        // same. Only a live AArch64 link register still holds a return address.
        let return_address = match row.register(ra_register) {
            RegisterRule::SameValue => regs.lr.ok_or(CfiError::NoReturnAddress)?,
            RegisterRule::Undefined => match regs.lr {
                Some(lr) if self.arch == Architecture::Arm64 => lr,
                _ => return Ok(CfiStep::EndOfStack),
            },
            rule => Address::from(evaluate_rule(self.arch, &rule, regs, cfa, memory)?),
        };

        let fp = match row.register(fp_register) {
            RegisterRule::Undefined | RegisterRule::SameValue => regs.fp,
            rule => Address::from(evaluate_rule(self.arch, &rule, regs, cfa, memory)?),
        };

        Ok(CfiStep::Caller(FrameRegisters {
            pc: return_address,
            sp: Address::from(cfa),
            fp,
            lr: None,
        }))
    }
}

impl fmt::Debug for CfiTable
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        f.debug_struct("CfiTable")
            .field("arch", &self.arch)
            .field("eh_frame_address", &format_args!("0x{:x}", self.eh_frame_address))
            .field("len", &self.eh_frame.len())
            .finish_non_exhaustive()
    }
}

/// Evaluate a DWARF register rule using the walker's registers and the
/// computed Canonical Frame Address.
fn evaluate_rule(
    arch: Architecture,
    rule: &RegisterRule<usize>,
    regs: &FrameRegisters,
    cfa: u64,
    memory: &dyn StackMemory,
) -> Result<u64, CfiError>
{
    match rule {
        RegisterRule::Offset(offset) => read_stack(memory, Address::from(cfa.wrapping_add_signed(*offset))),
        RegisterRule::ValOffset(offset) => Ok(cfa.wrapping_add_signed(*offset)),
        RegisterRule::Register(register) => {
            read_register_value(arch, regs, *register).ok_or(CfiError::MissingRegister(register.0))
        }
        _ => Err(CfiError::UnsupportedRule),
    }
}

/// Bounds are checked here so a bad rule never builds an error message.
fn read_stack(memory: &dyn StackMemory, address: Address) -> Result<u64, CfiError>
{
    if !address.is_aligned(8) || !memory.bounds().contains(address, 8) {
        return Err(CfiError::StackRead(address));
    }
    memory.read_u64(address).map_err(|_| CfiError::StackRead(address))
}

fn read_register_value(arch: Architecture, regs: &FrameRegisters, register: Register) -> Option<u64>
{
    if Some(register) == arch.sp_register() {
        Some(regs.sp.value())
    } else if Some(register) == arch.fp_register() {
        Some(regs.fp.value())
    } else if Some(register) == arch.return_register() {
        match arch {
            Architecture::X86_64 => Some(regs.pc.value()),
            _ => regs.lr.map(Address::value),
        }
    } else {
        None
    }
}

#[cfg(test)]
pub(crate) mod tests
{
    use gimli::write::{
        Address as WriteAddress, CallFrameInstruction, CommonInformationEntry, EhFrame as WriteEhFrame, EndianVec,
        FrameDescriptionEntry, FrameTable,
    };
    use gimli::{Encoding, Format, LittleEndian, X86_64};

    use super::*;
    use crate::unwind::StackSnapshot;

    /// Start of the single function described by [`x86_table`].
    pub(crate) const FUNCTION: u64 = 0x1000;
    pub(crate) const FUNCTION_LEN: u64 = 0x100;

    /// x86-64 `.eh_frame` with one FDE over `FUNCTION`. The CIE sets the
    /// call-site rules (`CFA = rsp + 8`, return address at `CFA - 8`);
    /// `instructions` apply from offset 4 onward.
    pub(crate) fn x86_table(instructions: Vec<CallFrameInstruction>) -> CfiTable
    {
        let encoding = Encoding {
            format: Format::Dwarf32,
            version: 1,
            address_size: 8,
        };
        let mut cie = CommonInformationEntry::new(encoding, 1, -8, X86_64::RA);
        cie.add_instruction(CallFrameInstruction::Cfa(X86_64::RSP, 8));
        cie.add_instruction(CallFrameInstruction::Offset(X86_64::RA, -8));

        let mut fde = FrameDescriptionEntry::new(WriteAddress::Constant(FUNCTION), FUNCTION_LEN as u32);
        for instruction in instructions {
            fde.add_instruction(4, instruction);
        }

        let mut frames = FrameTable::default();
        let cie = frames.add_cie(cie);
        frames.add_fde(cie, fde);

        let mut section = WriteEhFrame(EndianVec::new(LittleEndian));
        frames.write_eh_frame(&mut section).unwrap();
        CfiTable::from_section(section.0.into_vec(), 0x8000, 0, Architecture::X86_64)
    }

    fn regs() -> FrameRegisters
    {
        FrameRegisters {
            pc: Address::from(0x4000),
            sp: Address::from(0x7000),
            fp: Address::from(0x7100),
            lr: Some(Address::from(0x5000)),
        }
    }

    fn at(pc: u64, sp: u64, fp: u64) -> FrameRegisters
    {
        FrameRegisters {
            pc: Address::from(pc),
            sp: Address::from(sp),
            fp: Address::from(fp),
            lr: None,
        }
    }

    fn caller(pc: u64, sp: u64, fp: u64) -> CfiStep
    {
        CfiStep::Caller(at(pc, sp, fp))
    }

    #[test]
    fn test_register_map_x86_64()
    {
        let regs = regs();
        assert_eq!(read_register_value(Architecture::X86_64, &regs, Register(7)), Some(0x7000));
        assert_eq!(read_register_value(Architecture::X86_64, &regs, Register(6)), Some(0x7100));
        assert_eq!(read_register_value(Architecture::X86_64, &regs, Register(16)), Some(0x4000));
        assert_eq!(read_register_value(Architecture::X86_64, &regs, Register(3)), None);
    }

    #[test]
    fn test_register_map_arm64()
    {
        let regs = regs();
        assert_eq!(read_register_value(Architecture::Arm64, &regs, Register(31)), Some(0x7000));
        assert_eq!(read_register_value(Architecture::Arm64, &regs, Register(29)), Some(0x7100));
        assert_eq!(read_register_value(Architecture::Arm64, &regs, Register(30)), Some(0x5000));
    }

    #[test]
    fn test_offset_rule_reads_stack()
    {
        let stack = StackSnapshot::from_words(Address::from(0x7000), &[0, 0xdead_beef]);
        let value = evaluate_rule(Architecture::X86_64, &RegisterRule::Offset(-8), &regs(), 0x7010, &stack);
        assert_eq!(value, Ok(0xdead_beef));

        let value = evaluate_rule(Architecture::X86_64, &RegisterRule::ValOffset(16), &regs(), 0x7010, &stack);
        assert_eq!(value, Ok(0x7020));
    }

    #[test]
    fn test_step_after_prologue_restores_saved_fp()
    {
        // push rbp: CFA = rsp + 16, rbp saved at CFA - 16
        let table = x86_table(vec![
            CallFrameInstruction::CfaOffset(16),
            CallFrameInstruction::Offset(X86_64::RBP, -16),
        ]);
        let stack = StackSnapshot::from_words(Address::from(0x7000), &[0x7100, 0x2222]);
        let mut ctx = UnwindContext::new();

        let step = table.step(&mut ctx, 0x1010, &at(0x1010, 0x7000, 0xdead), &stack);
        assert_eq!(step, Ok(caller(0x2222, 0x7010, 0x7100)));
    }

    #[test]
    fn test_step_at_entry_uses_cie_rules()
    {
        let table = x86_table(vec![
            CallFrameInstruction::CfaOffset(16),
            CallFrameInstruction::Offset(X86_64::RBP, -16),
        ]);
        let stack = StackSnapshot::from_words(Address::from(0x7000), &[0x2222, 0]);
        let mut ctx = UnwindContext::new();

        // Before the push the return address is on top of the stack and rbp is untouched
        let step = table.step(&mut ctx, 0x1000, &at(0x1000, 0x7000, 0x7400), &stack);
        assert_eq!(step, Ok(caller(0x2222, 0x7008, 0x7400)));
    }

    #[test]
    fn test_step_val_offset_and_register_rules()
    {
        let stack = StackSnapshot::from_words(Address::from(0x7000), &[0, 0x2222]);
        let mut ctx = UnwindContext::new();

        let table = x86_table(vec![
            CallFrameInstruction::CfaOffset(16),
            CallFrameInstruction::ValOffset(X86_64::RBP, -8),
        ]);
        let step = table.step(&mut ctx, 0x1010, &at(0x1010, 0x7000, 0xdead), &stack);
        assert_eq!(step, Ok(caller(0x2222, 0x7010, 0x7008)));

        let table = x86_table(vec![
            CallFrameInstruction::CfaOffset(16),
            CallFrameInstruction::Register(X86_64::RBP, X86_64::RSP),
        ]);
        let step = table.step(&mut ctx, 0x1010, &at(0x1010, 0x7000, 0xdead), &stack);
        assert_eq!(step, Ok(caller(0x2222, 0x7010, 0x7000)));
    }

    #[test]
    fn test_step_with_cfa_on_frame_pointer()
    {
        let table = x86_table(vec![
            CallFrameInstruction::Cfa(X86_64::RBP, 16),
            CallFrameInstruction::Offset(X86_64::RBP, -16),
        ]);
        let stack = StackSnapshot::from_words(Address::from(0x7000), &[0x7100, 0x3333]);
        let mut ctx = UnwindContext::new();

        let step = table.step(&mut ctx, 0x1080, &at(0x1080, 0x6f00, 0x7000), &stack);
        assert_eq!(step, Ok(caller(0x3333, 0x7010, 0x7100)));
    }

    #[test]
    fn test_undefined_return_address_ends_stack()
    {
        let table = x86_table(vec![CallFrameInstruction::Undefined(X86_64::RA)]);
        let stack = StackSnapshot::from_words(Address::from(0x7000), &[0, 0]);
        let mut ctx = UnwindContext::new();

        let step = table.step(&mut ctx, 0x1010, &at(0x1010, 0x7000, 0), &stack);
        assert_eq!(step, Ok(CfiStep::EndOfStack));
    }

    #[test]
    fn test_address_outside_fde_has_no_entry()
    {
        let table = x86_table(Vec::new());
        let mut ctx = UnwindContext::new();

        let step = table.step(&mut ctx, 0x2000, &at(0x2000, 0x7000, 0), &StackSnapshot::default());
        assert_eq!(step, Ok(CfiStep::NoEntry));
    }

    #[test]
    fn test_read_outside_stack_fails()
    {
        let table = x86_table(vec![CallFrameInstruction::CfaOffset(16)]);
        let stack = StackSnapshot::from_words(Address::from(0x7000), &[0]);
        let mut ctx = UnwindContext::new();

        let step = table.step(&mut ctx, 0x1010, &at(0x1010, 0x7000, 0), &stack);
        assert_eq!(step, Err(CfiError::StackRead(Address::from(0x7008))));
    }
}
