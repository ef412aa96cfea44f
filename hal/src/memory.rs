// Licensed under the Apache-2.0 license

use hss_error::HssError;

/// Access to the physical address space as seen from the E51.
pub trait MemoryBus {
    fn read(&self, addr: u64, buf: &mut [u8]) -> Result<(), HssError>;

    fn write(&mut self, addr: u64, data: &[u8]) -> Result<(), HssError>;

    fn fill(&mut self, addr: u64, value: u8, len: u64) -> Result<(), HssError>;

    fn read_u32(&self, addr: u64) -> Result<u32, HssError> {
        let mut word = [0u8; 4];
        self.read(addr, &mut word)?;
        Ok(u32::from_le_bytes(word))
    }

    fn write_u32(&mut self, addr: u64, value: u32) -> Result<(), HssError> {
        self.write(addr, &value.to_le_bytes())
    }
}

/// Direct volatile access to the physical address space.
#[cfg(target_arch = "riscv64")]
pub struct PhysicalMemory;

#[cfg(target_arch = "riscv64")]
impl MemoryBus for PhysicalMemory {
    fn read(&self, addr: u64, buf: &mut [u8]) -> Result<(), HssError> {
        let src = addr as usize as *const u8;
        for (i, b) in buf.iter_mut().enumerate() {
            // SAFETY: the caller has checked the range against the PMP and memory map.
            *b = unsafe { core::ptr::read_volatile(src.add(i)) };
        }
        Ok(())
    }

    fn write(&mut self, addr: u64, data: &[u8]) -> Result<(), HssError> {
        let dst = addr as usize as *mut u8;
        for (i, &b) in data.iter().enumerate() {
            // SAFETY: see `read`.
            unsafe { core::ptr::write_volatile(dst.add(i), b) };
        }
        Ok(())
    }

    fn fill(&mut self, addr: u64, value: u8, len: u64) -> Result<(), HssError> {
        let dst = addr as usize as *mut u8;
        for i in 0..len as usize {
            // SAFETY: see `read`.
            unsafe { core::ptr::write_volatile(dst.add(i), value) };
        }
        Ok(())
    }

    fn read_u32(&self, addr: u64) -> Result<u32, HssError> {
        if addr % 4 != 0 {
            return Err(HssError::MemoryAccess);
        }
        // SAFETY: aligned register read.
        Ok(unsafe { core::ptr::read_volatile(addr as usize as *const u32) })
    }
}
