//! Decoding just enough of the instruction encoding to synthesize single
//! stepping: given the word at the program counter and the current
//! register file, classify where execution goes next.
//!
//! The real Epiphany ISA has a much richer instruction set than this; we
//! only need to tell branches, calls, returns, and traps apart from
//! straight-line code; see Design Note 3.

use crate::addr::opcodes;

/// Where control flow goes after executing the instruction at `pc`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlFlow {
    /// Execution continues at the next sequential instruction.
    Fallthrough,
    /// A conditional or unconditional branch to an immediate target.
    Branch(u32),
    /// An indirect jump through a register; target is not known without
    /// reading the register file, so the caller must resolve it.
    IndirectJump,
    /// `rti`/`gie`-style return; the retained `IRET` register is the
    /// target.
    InterruptReturn,
    /// A `trap` instruction; `num` is the immediate trap number.
    Trap(u8),
    /// `idle`; the core is expected to block until an interrupt arrives.
    Idle,
}

/// 16-bit opcode field layouts relevant to control flow, as laid out in
/// the Epiphany instruction encoding.
mod fields {
    /// Bits [7:0] hold the sub-opcode for 16-bit branch/call encodings.
    pub const BRANCH_OPCODE_MASK: u16 = 0x0f;
    pub const BRANCH_OPCODE: u16 = 0x0;
    pub const BRANCH_COND_SHIFT: u16 = 4;
    pub const BRANCH_COND_MASK: u16 = 0xf0;
    pub const BRANCH_COND_ALWAYS: u16 = 0x0f << BRANCH_COND_SHIFT;

    pub const JR_OPCODE_MASK: u16 = 0xfff;
    pub const JR_OPCODE: u16 = 0x14d;
    pub const JALR_OPCODE: u16 = 0x94d;

    pub const RTI_OPCODE: u16 = 0x1d2;

    pub const TRAP_NUMBER_SHIFT: u16 = 10;
    pub const TRAP_NUMBER_MASK: u16 = 0x3f;
}

/// Extract the trap dispatch code from bits [15:10] of a `TRAP`
/// instruction word.
pub fn trap_number(word: u16) -> u8 {
    ((word >> fields::TRAP_NUMBER_SHIFT) & fields::TRAP_NUMBER_MASK) as u8
}

/// Decode the 16-bit instruction word `word` located at `pc`, using
/// `imm` (already sign-extended from the branch displacement field by
/// the caller) as the branch target offset when applicable.
///
/// `word` must be the raw instruction bits; this function does not
/// fetch memory itself so it can be unit tested without a `Target`.
pub fn classify(pc: u32, word: u16, imm: i32) -> ControlFlow {
    if word & 0x3ff == opcodes::TRAP & 0x3ff {
        return ControlFlow::Trap(trap_number(word));
    }
    if word == opcodes::IDLE {
        return ControlFlow::Idle;
    }
    if word == fields::RTI_OPCODE {
        return ControlFlow::InterruptReturn;
    }
    if word & fields::JR_OPCODE_MASK == fields::JR_OPCODE
        || word & fields::JR_OPCODE_MASK == fields::JALR_OPCODE
    {
        return ControlFlow::IndirectJump;
    }
    if word & fields::BRANCH_OPCODE_MASK == fields::BRANCH_OPCODE {
        let cond = word & fields::BRANCH_COND_MASK;
        let _ = cond; // both conditional and unconditional branches plant a
                      // shadow breakpoint at the target; the core decides at
                      // runtime which one actually gets hit.
        let target = (pc as i64 + imm as i64) as u32;
        return ControlFlow::Branch(target);
    }
    ControlFlow::Fallthrough
}

/// Byte length of the instruction whose first halfword is `word`: 2 for
/// the compact 16-bit encodings, 4 when the low bit pair marks a 32-bit
/// instruction.
pub fn instr_len(word: u16) -> u32 {
    if word & 0b11 == 0b11 {
        4
    } else {
        2
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn trap_is_recognised() {
        assert_eq!(classify(0x1000, opcodes::TRAP, 0), ControlFlow::Trap(0));
    }

    #[test]
    fn idle_is_recognised() {
        assert_eq!(classify(0x1000, opcodes::IDLE, 0), ControlFlow::Idle);
    }

    #[test]
    fn branch_target_uses_pc_relative_immediate() {
        match classify(0x2000, 0x0000, 0x10) {
            ControlFlow::Branch(target) => assert_eq!(target, 0x2010),
            other => panic!("expected branch, got {other:?}"),
        }
    }

    #[test]
    fn indirect_jump_is_recognised() {
        assert_eq!(classify(0x2000, fields::JR_OPCODE, 0), ControlFlow::IndirectJump);
        assert_eq!(classify(0x2000, fields::JALR_OPCODE, 0), ControlFlow::IndirectJump);
    }

    #[test]
    fn nop_falls_through() {
        assert_eq!(classify(0x2000, opcodes::NOP, 0), ControlFlow::Fallthrough);
    }

    #[test]
    fn instr_len_distinguishes_16_and_32_bit() {
        assert_eq!(instr_len(0b0000_0000_0000_0000), 2);
        assert_eq!(instr_len(0b0000_0000_0000_0011), 4);
    }
}
