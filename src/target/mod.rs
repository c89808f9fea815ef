//! The capability set the server dispatcher programs against: resets,
//! register-scoped MMIO, and mesh topology queries. [`sim`] provides an
//! in-memory backend standing in for the out-of-scope hardware driver.

pub mod sim;

use std::time::{Duration, Instant};

use crate::addr::{debugcmd, debugstatus_bits, ilat_bits, reg, status_bits, CoreId};
use crate::error::{MeshError, MeshResult};
use crate::mmio::{AddressMap, DeviceDriver, MmioGateway};

/// Static description of the mesh this server is attached to: its
/// rectangular shape and the external memory banks visible outside it.
#[derive(Debug, Clone)]
pub struct PlatformDescription {
    pub rows: u8,
    pub cols: u8,
    pub external_banks: Vec<(u32, u32)>,
}

impl PlatformDescription {
    pub fn address_map(&self) -> AddressMap {
        AddressMap {
            rows: self.rows,
            cols: self.cols,
            external_banks: self.external_banks.clone(),
        }
    }

    pub fn core_count(&self) -> usize {
        self.rows as usize * self.cols as usize
    }

    pub fn contains(&self, core: CoreId) -> bool {
        core.row < self.rows && core.col < self.cols
    }
}

/// A capability set over an [`MmioGateway`]: resets, per-core register
/// access, and the classification predicates the RSP layer needs to
/// decide whether an address is "this core", "some other core", or
/// "external memory".
pub struct Target<D> {
    gateway: MmioGateway<D>,
    platform: PlatformDescription,
}

impl<D: DeviceDriver> Target<D> {
    pub fn new(gateway: MmioGateway<D>, platform: PlatformDescription) -> Self {
        Target { gateway, platform }
    }

    pub fn platform(&self) -> &PlatformDescription {
        &self.platform
    }

    pub fn list_cores(&self) -> Vec<CoreId> {
        (0..self.platform.rows)
            .flat_map(|row| (0..self.platform.cols).map(move |col| CoreId::new(row, col)))
            .collect()
    }

    pub fn rows(&self) -> u8 {
        self.platform.rows
    }

    pub fn cols(&self) -> u8 {
        self.platform.cols
    }

    /// Translate a core-local offset into the global address of that
    /// offset within `core`'s window.
    pub fn abs2rel(&self, core: CoreId, offset: u32) -> u32 {
        let core_index = core.row as u32 * self.platform.cols as u32 + core.col as u32;
        core_index * crate::addr::CORE_MEM_SPACE + offset
    }

    pub fn is_local_addr(&self, addr: u32) -> bool {
        crate::addr::AddrClass::is_local(addr)
    }

    pub fn is_core_mem(&self, addr: u32) -> bool {
        matches!(
            self.gateway_map_classify(addr),
            crate::addr::AddrClass::CoreMemory { .. }
        )
    }

    pub fn is_external_mem(&self, addr: u32) -> bool {
        matches!(
            self.gateway_map_classify(addr),
            crate::addr::AddrClass::ExternalMemory { .. }
        )
    }

    fn gateway_map_classify(&self, addr: u32) -> crate::addr::AddrClass {
        self.platform.address_map().classify(addr)
    }

    pub fn gateway_mut(&mut self) -> &mut MmioGateway<D> {
        &mut self.gateway
    }

    pub fn read_reg(&mut self, core: CoreId, index: u32) -> MeshResult<u32> {
        let offset = reg::rn(index);
        let addr = self.abs2rel(core, offset);
        let bytes = self.gateway.read_mem(addr, 4)?;
        Ok(u32::from_le_bytes(bytes.try_into().unwrap()))
    }

    pub fn write_reg(&mut self, core: CoreId, index: u32, value: u32) -> MeshResult<()> {
        let offset = reg::rn(index);
        let addr = self.abs2rel(core, offset);
        self.gateway.write_mem(addr, &value.to_le_bytes())
    }

    pub(crate) fn read_core_reg(&mut self, core: CoreId, offset: u32) -> MeshResult<u32> {
        let addr = self.abs2rel(core, offset);
        let bytes = self.gateway.read_mem(addr, 4)?;
        Ok(u32::from_le_bytes(bytes.try_into().unwrap()))
    }

    pub(crate) fn write_core_reg(&mut self, core: CoreId, offset: u32, value: u32) -> MeshResult<()> {
        let addr = self.abs2rel(core, offset);
        self.gateway.write_mem(addr, &value.to_le_bytes())
    }

    pub fn reset_platform(&mut self) -> MeshResult<()> {
        self.gateway.reset_platform()
    }

    /// Soft core reset per §4.2: stop DMAs, zero the general registers
    /// and architectural state, mask everything but SYNC.
    pub fn reset_core(&mut self, core: CoreId) -> MeshResult<()> {
        for dma_config in [reg::DMA0CONFIG, reg::DMA1CONFIG] {
            let mut cfg = self.read_core_reg(core, dma_config)?;
            cfg |= 0x1; // pause bit
            self.write_core_reg(core, dma_config, cfg)?;
        }
        for base in [reg::DMA0CONFIG, reg::DMA1CONFIG] {
            let block = [
                base,
                base + 0x04, // stride
                base + 0x08, // count
                base + 0x0c, // src addr
                base + 0x10, // dst addr
            ];
            for reg_off in block {
                self.write_core_reg(core, reg_off, 0)?;
            }
        }
        for dma_config in [reg::DMA0CONFIG, reg::DMA1CONFIG] {
            self.write_core_reg(core, dma_config, 0)?;
        }
        self.poll_dma_idle(core, reg::DMA0STATUS)?;
        self.poll_dma_idle(core, reg::DMA1STATUS)?;

        for n in 0..64 {
            self.write_reg(core, n, 0)?;
        }

        let mut config = self.read_core_reg(core, reg::CONFIG)?;
        config |= 0x1; // clock gating enable
        self.write_core_reg(core, reg::CONFIG, config)?;
        let mut mesh_config = self.read_core_reg(core, reg::MESHCONFIG)?;
        mesh_config |= 0x1;
        self.write_core_reg(core, reg::MESHCONFIG, mesh_config)?;

        for r in [
            reg::FSTATUS,
            reg::PC,
            reg::LC,
            reg::LS,
            reg::LE,
            reg::IRET,
            reg::CTIMER0,
            reg::CTIMER1,
            reg::MEMSTATUS,
            reg::MEMPROTECT,
        ] {
            self.write_core_reg(core, r, 0)?;
        }

        self.write_core_reg(core, reg::IMASK, !ilat_bits::SYNC)?;
        self.write_core_reg(core, reg::ILATCL, 0xffff_ffff)?;

        Ok(())
    }

    fn poll_dma_idle(&mut self, core: CoreId, status_reg: u32) -> MeshResult<()> {
        let deadline = Instant::now() + Duration::from_millis(10);
        loop {
            let status = self.read_core_reg(core, status_reg)?;
            if status & 0x1 == 0 {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(MeshError::hardware(core, "DMA channel did not idle within 10ms"));
            }
        }
    }

    /// Group reset per §4.2: halt the rectangle, require no outstanding
    /// external fetch, pause DMAs, pulse `RESETCORE`.
    pub fn reset_group(&mut self, origin: CoreId, rows: u8, cols: u8) -> MeshResult<()> {
        let cores = self.rectangle(origin, rows, cols);

        for &core in &cores {
            self.halt_with_retry(core)?;
        }

        let deadline = Instant::now() + Duration::from_millis(100);
        for &core in &cores {
            loop {
                let status = self.read_core_reg(core, reg::DEBUGSTATUS)?;
                if status & debugstatus_bits::EXT_PEND_MASK == 0 {
                    break;
                }
                if Instant::now() >= deadline {
                    return Err(MeshError::hardware(
                        core,
                        "external fetch still outstanding after 100ms",
                    ));
                }
            }
        }

        for &core in &cores {
            self.reset_core(core)?;
        }

        for &core in &cores {
            self.write_core_reg(core, reg::RESETCORE, 1)?;
            self.write_core_reg(core, reg::RESETCORE, 0)?;
        }

        Ok(())
    }

    /// Start a workgroup per §4.2: raise the SYNC interrupt on every
    /// core in the rectangle, halting first if a debugger is attached
    /// so the first instruction is not lost.
    pub fn start_group(&mut self, origin: CoreId, rows: u8, cols: u8, debugger_attached: bool) -> MeshResult<()> {
        let cores = self.rectangle(origin, rows, cols);
        if debugger_attached {
            for &core in &cores {
                self.halt_with_retry(core)?;
            }
        }
        for &core in &cores {
            self.write_core_reg(core, reg::ILATST, ilat_bits::SYNC)?;
        }
        Ok(())
    }

    fn halt_with_retry(&mut self, core: CoreId) -> MeshResult<bool> {
        self.write_core_reg(core, reg::DEBUGCMD, debugcmd::HALT)?;
        if self.poll_halted(core, Duration::from_millis(1))? {
            return Ok(true);
        }
        self.write_core_reg(core, reg::DEBUGCMD, debugcmd::HALT)?;
        self.poll_halted(core, Duration::from_secs(1))
    }

    fn poll_halted(&mut self, core: CoreId, timeout: Duration) -> MeshResult<bool> {
        let deadline = Instant::now() + timeout;
        loop {
            let status = self.read_core_reg(core, reg::DEBUGSTATUS)?;
            if status & debugstatus_bits::HALT_MASK != 0 {
                return Ok(status & debugstatus_bits::EXT_PEND_MASK == 0);
            }
            if Instant::now() >= deadline {
                return Ok(false);
            }
        }
    }

    fn rectangle(&self, origin: CoreId, rows: u8, cols: u8) -> Vec<CoreId> {
        (0..rows)
            .flat_map(|dr| (0..cols).map(move |dc| (dr, dc)))
            .map(|(dr, dc)| CoreId::new(origin.row + dr, origin.col + dc))
            .collect()
    }

    pub fn read_status(&mut self, core: CoreId) -> MeshResult<u32> {
        self.read_core_reg(core, reg::STATUS)
    }

    pub fn excause(&mut self, core: CoreId) -> MeshResult<u32> {
        Ok(status_bits::excause(self.read_status(core)?))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::mmio::AddressValidation;
    use crate::target::sim::SimDriver;

    fn target() -> Target<SimDriver> {
        let platform = PlatformDescription {
            rows: 2,
            cols: 2,
            external_banks: vec![],
        };
        let gateway = MmioGateway::new(
            SimDriver::new(platform.rows, platform.cols),
            platform.address_map(),
            AddressValidation::Passthrough,
        );
        Target::new(gateway, platform)
    }

    #[test]
    fn list_cores_covers_the_whole_rectangle() {
        let t = target();
        assert_eq!(t.list_cores().len(), 4);
    }

    #[test]
    fn abs2rel_is_injective_across_cores() {
        let t = target();
        let a = t.abs2rel(CoreId::new(0, 0), 0x10);
        let b = t.abs2rel(CoreId::new(0, 1), 0x10);
        assert_ne!(a, b);
    }

    #[test]
    fn reg_round_trips_through_gateway() {
        let mut t = target();
        let core = CoreId::new(1, 1);
        t.write_reg(core, 3, 0x1234_5678).unwrap();
        assert_eq!(t.read_reg(core, 3).unwrap(), 0x1234_5678);
    }

    #[test]
    fn reset_core_clears_general_registers() {
        let mut t = target();
        let core = CoreId::new(0, 0);
        t.write_reg(core, 5, 0xdead_beef).unwrap();
        t.reset_core(core).unwrap();
        assert_eq!(t.read_reg(core, 5).unwrap(), 0);
    }

    #[test]
    fn start_group_sets_sync_bit() {
        let mut t = target();
        t.start_group(CoreId::new(0, 0), 2, 2, false).unwrap();
        let ilat = t.read_core_reg(CoreId::new(1, 1), reg::ILAT).unwrap();
        assert_eq!(ilat & ilat_bits::SYNC, ilat_bits::SYNC);
    }
}
