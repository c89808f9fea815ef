//! Synthesized single-stepping: the hardware has no step bit, so the
//! server plants temporary breakpoints at the fall-through and (if
//! applicable) branch-target addresses, primes the IVT so an interrupt
//! also counts as a step-stop, resumes, and waits.

use std::time::{Duration, Instant};

use crate::addr::{opcodes, E_INSTR_BYTES};
use crate::error::MeshResult;
use crate::mmio::DeviceDriver;
use crate::opcode::{classify, instr_len, ControlFlow};
use crate::target::Target;
use crate::thread::Thread;

const STEP_POLL_TIMEOUT: Duration = Duration::from_millis(10);
/// `BKPT` is always a 16-bit opcode; the post-step PC lands just past
/// it regardless of how long the original instruction was.
const SHORT_INSTR_BYTES: u32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    /// The thread halted at the expected post-step address.
    Halted,
    /// The instruction was `IDLE` with no latched+enabled interrupt;
    /// nothing to step, report stopped with signal NONE.
    NothingToStep,
    /// Poll for halt exceeded the timeout.
    TimedOut,
}

/// Read the instruction word at `thread`'s PC and classify it without
/// executing anything, so callers can decide whether a step is even
/// meaningful (e.g. the `IDLE` special case in step 1 of the
/// synthesized-stepping algorithm).
pub fn classify_current<D: DeviceDriver>(target: &mut Target<D>, thread: &Thread, pc: u32) -> MeshResult<ControlFlow> {
    let word = thread.read_mem16(target, pc)?;
    // A real decoder would also need the 16 high bits for 32-bit
    // instructions and the branch displacement; exact displacement
    // decoding is out of scope here, so branches resolve to their own
    // PC (a 0-length "branch") when we cannot read the immediate,
    // falling back to the fallthrough breakpoint alone.
    Ok(classify(pc, word, 0))
}

/// Perform one synthesized step. Plants breakpoints at the fallthrough
/// (and branch target, if the instruction is a branch), breakpoint-fills
/// the IVT, resumes, and polls for halt.
pub fn step<D: DeviceDriver>(target: &mut Target<D>, thread: &mut Thread) -> MeshResult<StepOutcome> {
    let pc = thread_pc(target, thread)?;
    let flow = classify_current(target, thread, pc)?;

    if flow == ControlFlow::Idle {
        let imask = thread.read_mem32(target, crate::addr::reg::IMASK)?;
        let ilat = thread.read_mem32(target, crate::addr::reg::ILAT)?;
        if imask & ilat == 0 {
            return Ok(StepOutcome::NothingToStep);
        }
    }

    let word = thread.read_mem16(target, pc)?;
    let len = instr_len(word);
    let fallthrough_addr = pc + len;

    let mut planted = vec![(fallthrough_addr, thread.insert_bkpt(target, fallthrough_addr)?)];
    if let ControlFlow::Branch(target_addr) = flow {
        if target_addr != fallthrough_addr {
            planted.push((target_addr, thread.insert_bkpt(target, target_addr)?));
        }
    }

    thread.save_ivt(target)?;
    fill_ivt_with_breakpoints(target, thread)?;

    thread.resume(target)?;

    let deadline = Instant::now() + STEP_POLL_TIMEOUT;
    let halted = loop {
        if thread.halt(target)? {
            break true;
        }
        if Instant::now() >= deadline {
            break false;
        }
    };

    for (addr, original) in planted {
        thread.write_opcode(target, addr, original)?;
    }
    thread.restore_ivt(target)?;

    if !halted {
        return Ok(StepOutcome::TimedOut);
    }

    let halted_pc = thread_pc(target, thread)?;
    let backed_up = halted_pc.saturating_sub(SHORT_INSTR_BYTES);
    set_pc(target, thread, backed_up)?;

    Ok(StepOutcome::Halted)
}

fn fill_ivt_with_breakpoints<D: DeviceDriver>(target: &mut Target<D>, thread: &Thread) -> MeshResult<()> {
    for offset in (0..crate::addr::ivt::SIZE_BYTES).step_by(E_INSTR_BYTES as usize) {
        thread.write_mem16(target, offset, opcodes::BKPT)?;
    }
    Ok(())
}

fn thread_pc<D: DeviceDriver>(target: &mut Target<D>, thread: &Thread) -> MeshResult<u32> {
    thread.read_mem32(target, crate::addr::reg::PC)
}

fn set_pc<D: DeviceDriver>(target: &mut Target<D>, thread: &Thread, pc: u32) -> MeshResult<()> {
    thread.write_mem32(target, crate::addr::reg::PC, pc)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::addr::CoreId;
    use crate::mmio::{AddressValidation, MmioGateway};
    use crate::target::sim::SimDriver;
    use crate::target::PlatformDescription;

    fn setup() -> (Target<SimDriver>, Thread) {
        let platform = PlatformDescription {
            rows: 1,
            cols: 1,
            external_banks: vec![],
        };
        let gateway = MmioGateway::new(
            SimDriver::new(1, 1),
            platform.address_map(),
            AddressValidation::Passthrough,
        );
        (Target::new(gateway, platform), Thread::new(CoreId::new(0, 0)))
    }

    #[test]
    fn step_over_nop_advances_pc_by_instruction_length() {
        let (mut t, mut thread) = setup();
        thread.write_mem32(&mut t, crate::addr::reg::PC, 0x100).unwrap();
        thread.write_mem16(&mut t, 0x100, opcodes::NOP).unwrap();
        let outcome = step(&mut t, &mut thread).unwrap();
        assert_eq!(outcome, StepOutcome::Halted);
        assert_eq!(thread_pc(&mut t, &thread).unwrap(), 0x102);
    }

    #[test]
    fn idle_with_nothing_latched_needs_no_step() {
        let (mut t, mut thread) = setup();
        thread.write_mem32(&mut t, crate::addr::reg::PC, 0x100).unwrap();
        thread.write_mem16(&mut t, 0x100, opcodes::IDLE).unwrap();
        let outcome = step(&mut t, &mut thread).unwrap();
        assert_eq!(outcome, StepOutcome::NothingToStep);
    }
}
