//! In-memory stand-in for the hardware driver: a `Vec<u8>` per core plus
//! enough register-write side effects (HALT/RUN, ILATST/ILATCL,
//! RESETCORE) to drive the server and its tests without real silicon.

use std::collections::HashMap;

use crate::addr::{debugcmd, debugstatus_bits, opcodes, reg, CoreId, CORE_MEM_SPACE};
use crate::error::MeshResult;
use crate::mmio::DeviceDriver;
use crate::opcode::instr_len;

#[derive(Clone)]
struct CoreMem {
    bytes: Vec<u8>,
}

impl CoreMem {
    fn new() -> Self {
        CoreMem {
            bytes: vec![0u8; CORE_MEM_SPACE as usize],
        }
    }
}

/// A fully in-process mesh: every core's local window lives in a
/// `Vec<u8>`, with a handful of registers given the write-side-effects
/// real hardware has (`DEBUGCMD` flips `DEBUGSTATUS`, `ILATST`/`ILATCL`
/// set/clear bits in `ILAT` rather than storing the written value
/// verbatim, DMA status registers auto-clear so the idle-polling loops
/// in [`crate::target::Target`] terminate immediately).
#[derive(Clone)]
pub struct SimDriver {
    rows: u8,
    cols: u8,
    cores: HashMap<CoreId, CoreMem>,
}

impl SimDriver {
    pub fn new(rows: u8, cols: u8) -> Self {
        let mut cores = HashMap::new();
        for row in 0..rows {
            for col in 0..cols {
                cores.insert(CoreId::new(row, col), CoreMem::new());
            }
        }
        SimDriver { rows, cols, cores }
    }

    fn locate(&self, addr: u32) -> (CoreId, u32) {
        let core_index = addr / CORE_MEM_SPACE;
        let row = (core_index / self.cols as u32) as u8;
        let col = (core_index % self.cols as u32) as u8;
        (CoreId::new(row, col), addr % CORE_MEM_SPACE)
    }

    fn read_u16(&self, core: CoreId, offset: u32) -> u16 {
        let mem = &self.cores.get(&core).expect("core exists").bytes;
        let bytes: [u8; 2] = mem[offset as usize..offset as usize + 2].try_into().unwrap();
        u16::from_le_bytes(bytes)
    }

    fn read_u32(&self, core: CoreId, offset: u32) -> u32 {
        let mem = &self.cores.get(&core).expect("core exists").bytes;
        let bytes: [u8; 4] = mem[offset as usize..offset as usize + 4].try_into().unwrap();
        u32::from_le_bytes(bytes)
    }

    fn write_u32(&mut self, core: CoreId, offset: u32, value: u32) {
        let mem = &mut self.cores.get_mut(&core).expect("core exists").bytes;
        mem[offset as usize..offset as usize + 4].copy_from_slice(&value.to_le_bytes());
    }

    /// There is no real pipeline here: a `RUN` command scans forward
    /// from `PC` as if each instruction retired instantly, stopping the
    /// moment it reaches a `BKPT` or `TRAP` (the only two opcodes that
    /// ever halt real hardware on their own), and leaves `PC` one
    /// short-instruction past the stopping opcode, exactly as the real
    /// core does. A run that never reaches one of those just leaves the
    /// core's `DEBUGSTATUS` halt bit clear, the same as real hardware
    /// spinning until an explicit `HALT`.
    fn run_to_next_stop(&mut self, core: CoreId) {
        let mut pc = self.read_u32(core, reg::PC);
        while pc + 2 <= CORE_MEM_SPACE {
            let word = self.read_u16(core, pc);
            if word == opcodes::BKPT || word & 0x3ff == opcodes::TRAP & 0x3ff {
                self.write_u32(core, reg::PC, pc.wrapping_add(2));
                let status = self.read_u32(core, reg::DEBUGSTATUS) | debugstatus_bits::HALT_MASK;
                self.write_u32(core, reg::DEBUGSTATUS, status & !debugstatus_bits::EXT_PEND_MASK);
                return;
            }
            pc = pc.wrapping_add(instr_len(word));
        }
    }

    fn apply_side_effects(&mut self, core: CoreId, offset: u32, value: u32) {
        match offset {
            o if o == reg::DEBUGCMD => {
                if value == debugcmd::HALT {
                    let mut status = self.read_u32(core, reg::DEBUGSTATUS);
                    status |= debugstatus_bits::HALT_MASK;
                    status &= !debugstatus_bits::EXT_PEND_MASK;
                    self.write_u32(core, reg::DEBUGSTATUS, status);
                } else {
                    let mut status = self.read_u32(core, reg::DEBUGSTATUS);
                    status &= !debugstatus_bits::HALT_MASK;
                    self.write_u32(core, reg::DEBUGSTATUS, status);
                    self.run_to_next_stop(core);
                }
            }
            o if o == reg::ILATST => {
                let ilat = self.read_u32(core, reg::ILAT);
                self.write_u32(core, reg::ILAT, ilat | value);
            }
            o if o == reg::ILATCL => {
                let ilat = self.read_u32(core, reg::ILAT);
                self.write_u32(core, reg::ILAT, ilat & !value);
            }
            o if o == reg::DMA0CONFIG || o == reg::DMA1CONFIG => {
                let status_reg = if o == reg::DMA0CONFIG {
                    reg::DMA0STATUS
                } else {
                    reg::DMA1STATUS
                };
                // A freshly (re)configured or cleared channel is idle
                // immediately in simulation; there is no transfer to wait on.
                self.write_u32(core, status_reg, 0);
            }
            o if o == reg::RESETCORE && value == 1 => {
                self.cores.insert(core, CoreMem::new());
            }
            _ => {}
        }
    }

    pub fn rows(&self) -> u8 {
        self.rows
    }

    pub fn cols(&self) -> u8 {
        self.cols
    }
}

impl DeviceDriver for SimDriver {
    fn read(&mut self, addr: u32, buf: &mut [u8]) -> MeshResult<()> {
        let (core, offset) = self.locate(addr);
        let mem = &self.cores.get(&core).expect("core exists").bytes;
        let end = offset as usize + buf.len();
        buf.copy_from_slice(&mem[offset as usize..end]);
        Ok(())
    }

    fn write(&mut self, addr: u32, data: &[u8]) -> MeshResult<()> {
        let (core, offset) = self.locate(addr);
        {
            let mem = &mut self.cores.get_mut(&core).expect("core exists").bytes;
            let end = offset as usize + data.len();
            mem[offset as usize..end].copy_from_slice(data);
        }
        if data.len() == 4 {
            let value = u32::from_le_bytes(data.try_into().unwrap());
            self.apply_side_effects(core, offset, value);
        }
        Ok(())
    }

    fn reset_platform(&mut self) -> MeshResult<()> {
        let rows = self.rows;
        let cols = self.cols;
        *self = SimDriver::new(rows, cols);
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn halt_sets_debugstatus_bit() {
        let mut d = SimDriver::new(2, 2);
        d.write(reg::DEBUGCMD, &debugcmd::HALT.to_le_bytes()).unwrap();
        let mut buf = [0u8; 4];
        d.read(reg::DEBUGSTATUS, &mut buf).unwrap();
        assert_eq!(u32::from_le_bytes(buf) & debugstatus_bits::HALT_MASK, 1);
    }

    #[test]
    fn reset_platform_zeroes_memory() {
        let mut d = SimDriver::new(2, 2);
        d.write(0x10, &[1, 2, 3, 4]).unwrap();
        d.reset_platform().unwrap();
        let mut buf = [0u8; 4];
        d.read(0x10, &mut buf).unwrap();
        assert_eq!(buf, [0, 0, 0, 0]);
    }

    #[test]
    fn ilatst_sets_bits_without_clobbering() {
        let mut d = SimDriver::new(1, 1);
        d.write(reg::ILATST, &0x1u32.to_le_bytes()).unwrap();
        d.write(reg::ILATST, &0x4u32.to_le_bytes()).unwrap();
        let mut buf = [0u8; 4];
        d.read(reg::ILAT, &mut buf).unwrap();
        assert_eq!(u32::from_le_bytes(buf), 0x5);
    }
}
