//! A GDB "thread": one core, with its halt/run state machine and the
//! register/memory operations the dispatcher calls scoped to it.

use std::time::{Duration, Instant};

use crate::addr::{debugcmd, debugstatus_bits, ivt, reg, status_bits, CoreId};
use crate::error::MeshResult;
use crate::mmio::DeviceDriver;
use crate::target::Target;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Halted,
    Running,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActiveState {
    Active,
    Idle,
}

/// The action the dispatcher last told this thread to take; used to
/// decide, on a fresh stop, which thread's halt actually needs
/// reporting to the client (only threads that were told to continue).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LastAction {
    Stop,
    Continue,
}

/// A single core as seen by the GDB layer: its identity, the cached
/// run/active state the dispatcher relies on between polls, and a
/// pending signal slot used in non-stop mode.
pub struct Thread {
    pub core: CoreId,
    pub tid: i64,
    pub run_state: RunState,
    pub active_state: ActiveState,
    pub last_action: LastAction,
    pub pending_signal: Option<u8>,
    ivt_save: Option<[u8; ivt::SIZE_BYTES as usize]>,
}

impl Thread {
    pub fn new(core: CoreId) -> Self {
        Thread {
            core,
            tid: core.tid(),
            run_state: RunState::Halted,
            active_state: ActiveState::Active,
            last_action: LastAction::Stop,
            pending_signal: None,
            ivt_save: None,
        }
    }

    /// Halt the core: write HALT to `DEBUGCMD`, poll `DEBUGSTATUS` bit
    /// 0, retry once after a 1s grace period. Returns true only if
    /// halted with no pending external fetch.
    pub fn halt<D: DeviceDriver>(&mut self, target: &mut Target<D>) -> MeshResult<bool> {
        let first = self.try_halt(target, Duration::from_millis(1))?;
        if first {
            self.run_state = RunState::Halted;
            return Ok(true);
        }
        let second = self.try_halt(target, Duration::from_secs(1))?;
        if second {
            self.run_state = RunState::Halted;
        }
        Ok(second)
    }

    fn try_halt<D: DeviceDriver>(&mut self, target: &mut Target<D>, timeout: Duration) -> MeshResult<bool> {
        target.write_core_reg(self.core, reg::DEBUGCMD, debugcmd::HALT)?;
        let deadline = Instant::now() + timeout;
        loop {
            let status = target.read_core_reg(self.core, reg::DEBUGSTATUS)?;
            if status & debugstatus_bits::HALT_MASK != 0 {
                return Ok(status & debugstatus_bits::EXT_PEND_MASK == 0);
            }
            if Instant::now() >= deadline {
                return Ok(false);
            }
        }
    }

    pub fn resume<D: DeviceDriver>(&mut self, target: &mut Target<D>) -> MeshResult<bool> {
        match target.write_core_reg(self.core, reg::DEBUGCMD, debugcmd::RUN) {
            Ok(()) => {
                self.run_state = RunState::Running;
                Ok(true)
            }
            Err(_) => Ok(false),
        }
    }

    /// Clear `STATUS` bit 0 and mirror it into `FSTATUS`; only
    /// meaningful while halted.
    pub fn idle<D: DeviceDriver>(&mut self, target: &mut Target<D>) -> MeshResult<bool> {
        let mut status = target.read_core_reg(self.core, reg::STATUS)?;
        status &= !status_bits::ACTIVE_MASK;
        target.write_core_reg(self.core, reg::FSTATUS, status)?;
        self.active_state = ActiveState::Idle;
        Ok(true)
    }

    pub fn activate<D: DeviceDriver>(&mut self, target: &mut Target<D>) -> MeshResult<bool> {
        let mut status = target.read_core_reg(self.core, reg::STATUS)?;
        status |= status_bits::ACTIVE_MASK;
        target.write_core_reg(self.core, reg::FSTATUS, status)?;
        self.active_state = ActiveState::Active;
        Ok(true)
    }

    /// Save the 40-byte interrupt vector table for later restoration,
    /// used around synthesized single-stepping.
    pub fn save_ivt<D: DeviceDriver>(&mut self, target: &mut Target<D>) -> MeshResult<()> {
        let addr = target.abs2rel(self.core, 0);
        let bytes = target.gateway_mut().read_burst(addr, ivt::SIZE_BYTES)?;
        let mut buf = [0u8; ivt::SIZE_BYTES as usize];
        buf.copy_from_slice(&bytes);
        self.ivt_save = Some(buf);
        Ok(())
    }

    pub fn restore_ivt<D: DeviceDriver>(&mut self, target: &mut Target<D>) -> MeshResult<()> {
        if let Some(buf) = self.ivt_save.take() {
            let addr = target.abs2rel(self.core, 0);
            target.gateway_mut().write_burst(addr, &buf)?;
        }
        Ok(())
    }

    pub fn insert_bkpt<D: DeviceDriver>(&mut self, target: &mut Target<D>, local_addr: u32) -> MeshResult<u16> {
        let global = self.resolve_addr(target, local_addr);
        let original = target.gateway_mut().read_mem(global, 2)?;
        let original = u16::from_le_bytes(original.try_into().unwrap());
        target
            .gateway_mut()
            .write_mem(global, &crate::addr::opcodes::BKPT.to_le_bytes())?;
        Ok(original)
    }

    pub fn write_opcode<D: DeviceDriver>(&mut self, target: &mut Target<D>, local_addr: u32, opcode: u16) -> MeshResult<()> {
        let global = self.resolve_addr(target, local_addr);
        target.gateway_mut().write_mem(global, &opcode.to_le_bytes())
    }

    pub fn read_reg<D: DeviceDriver>(&self, target: &mut Target<D>, n: u32) -> MeshResult<u32> {
        target.read_reg(self.core, n)
    }

    pub fn write_reg<D: DeviceDriver>(&self, target: &mut Target<D>, n: u32, v: u32) -> MeshResult<()> {
        target.write_reg(self.core, n, v)
    }

    pub fn read_mem8<D: DeviceDriver>(&self, target: &mut Target<D>, local_addr: u32) -> MeshResult<u8> {
        let global = self.resolve_addr(target, local_addr);
        Ok(target.gateway_mut().read_mem(global, 1)?[0])
    }

    pub fn write_mem8<D: DeviceDriver>(&self, target: &mut Target<D>, local_addr: u32, v: u8) -> MeshResult<()> {
        let global = self.resolve_addr(target, local_addr);
        target.gateway_mut().write_mem(global, &[v])
    }

    pub fn read_mem16<D: DeviceDriver>(&self, target: &mut Target<D>, local_addr: u32) -> MeshResult<u16> {
        let global = self.resolve_addr(target, local_addr);
        let bytes = target.gateway_mut().read_mem(global, 2)?;
        Ok(u16::from_le_bytes(bytes.try_into().unwrap()))
    }

    pub fn write_mem16<D: DeviceDriver>(&self, target: &mut Target<D>, local_addr: u32, v: u16) -> MeshResult<()> {
        let global = self.resolve_addr(target, local_addr);
        target.gateway_mut().write_mem(global, &v.to_le_bytes())
    }

    pub fn read_mem32<D: DeviceDriver>(&self, target: &mut Target<D>, local_addr: u32) -> MeshResult<u32> {
        let global = self.resolve_addr(target, local_addr);
        let bytes = target.gateway_mut().read_mem(global, 4)?;
        Ok(u32::from_le_bytes(bytes.try_into().unwrap()))
    }

    pub fn write_mem32<D: DeviceDriver>(&self, target: &mut Target<D>, local_addr: u32, v: u32) -> MeshResult<()> {
        let global = self.resolve_addr(target, local_addr);
        target.gateway_mut().write_mem(global, &v.to_le_bytes())
    }

    pub fn read_block<D: DeviceDriver>(&self, target: &mut Target<D>, local_addr: u32, len: u32) -> MeshResult<Vec<u8>> {
        let global = self.resolve_addr(target, local_addr);
        target.gateway_mut().read_burst(global, len)
    }

    pub fn write_block<D: DeviceDriver>(&self, target: &mut Target<D>, local_addr: u32, data: &[u8]) -> MeshResult<()> {
        let global = self.resolve_addr(target, local_addr);
        target.gateway_mut().write_burst(global, data)
    }

    /// A local (< 1 MiB) address is shorthand for this thread's core;
    /// anything else is already a global address.
    fn resolve_addr<D: DeviceDriver>(&self, target: &Target<D>, addr: u32) -> u32 {
        if target.is_local_addr(addr) {
            target.abs2rel(self.core, addr)
        } else {
            addr
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::mmio::{AddressValidation, MmioGateway};
    use crate::target::sim::SimDriver;
    use crate::target::PlatformDescription;

    fn target() -> Target<SimDriver> {
        let platform = PlatformDescription {
            rows: 2,
            cols: 2,
            external_banks: vec![],
        };
        let gateway = MmioGateway::new(
            SimDriver::new(2, 2),
            platform.address_map(),
            AddressValidation::Passthrough,
        );
        Target::new(gateway, platform)
    }

    #[test]
    fn halt_then_resume_updates_run_state() {
        let mut t = target();
        let mut thread = Thread::new(CoreId::new(0, 0));
        assert!(thread.halt(&mut t).unwrap());
        assert_eq!(thread.run_state, RunState::Halted);
        assert!(thread.resume(&mut t).unwrap());
        assert_eq!(thread.run_state, RunState::Running);
    }

    #[test]
    fn insert_bkpt_returns_prior_opcode() {
        let mut t = target();
        let mut thread = Thread::new(CoreId::new(0, 0));
        thread.write_mem16(&mut t, 0x1000, 0x4242).unwrap();
        let saved = thread.insert_bkpt(&mut t, 0x1000).unwrap();
        assert_eq!(saved, 0x4242);
        assert_eq!(thread.read_mem16(&mut t, 0x1000).unwrap(), crate::addr::opcodes::BKPT);
    }

    #[test]
    fn ivt_save_restore_round_trips() {
        let mut t = target();
        let mut thread = Thread::new(CoreId::new(0, 0));
        thread.write_mem32(&mut t, 0x0, 0xaaaa_bbbb).unwrap();
        thread.save_ivt(&mut t).unwrap();
        thread.write_mem32(&mut t, 0x0, 0xffff_ffff).unwrap();
        thread.restore_ivt(&mut t).unwrap();
        assert_eq!(thread.read_mem32(&mut t, 0x0).unwrap(), 0xaaaa_bbbb);
    }

    #[test]
    fn idle_then_activate_toggles_state() {
        let mut t = target();
        let mut thread = Thread::new(CoreId::new(0, 0));
        thread.idle(&mut t).unwrap();
        assert_eq!(thread.active_state, ActiveState::Idle);
        thread.activate(&mut t).unwrap();
        assert_eq!(thread.active_state, ActiveState::Active);
    }

    #[test]
    fn tid_follows_core_formula() {
        let thread = Thread::new(CoreId::new(1, 1));
        assert_eq!(thread.tid, 203);
    }
}
