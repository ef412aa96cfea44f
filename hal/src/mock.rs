// Licensed under the Apache-2.0 license

//! Host-side implementations of the hardware traits, used by unit and
//! integration tests.

use crate::{BlockDevice, Clock, HartId, MemoryBus, PmpCsr, SerialPort, SoftwareInterrupt, Ticks};
use hss_error::HssError;
use std::cell::{Cell, RefCell};
use std::collections::VecDeque;

/// Clock that only moves when told to.
pub struct MockClock {
    now: Cell<Ticks>,
    ticks_per_sec: Ticks,
    step: Cell<Ticks>,
}

impl MockClock {
    pub fn new(ticks_per_sec: Ticks) -> Self {
        Self {
            now: Cell::new(0),
            ticks_per_sec,
            step: Cell::new(0),
        }
    }

    pub fn advance(&self, ticks: Ticks) {
        self.now.set(self.now.get() + ticks);
    }

    pub fn advance_secs(&self, secs: u64) {
        self.advance(secs * self.ticks_per_sec);
    }

    /// Every `now()` call moves the clock forward by `step` ticks afterwards.
    pub fn set_auto_step(&self, step: Ticks) {
        self.step.set(step);
    }
}

impl Clock for MockClock {
    fn now(&self) -> Ticks {
        let now = self.now.get();
        self.now.set(now + self.step.get());
        now
    }

    fn ticks_per_sec(&self) -> Ticks {
        self.ticks_per_sec
    }
}

/// Records every raised MSIP.
#[derive(Default)]
pub struct MockMsip {
    pub raised: RefCell<Vec<HartId>>,
}

impl SoftwareInterrupt for MockMsip {
    fn raise(&self, hart: HartId) {
        self.raised.borrow_mut().push(hart);
    }
}

/// A window of RAM at `base`.
pub struct RamBus {
    pub base: u64,
    pub data: Vec<u8>,
}

impl RamBus {
    pub fn new(base: u64, size: usize) -> Self {
        Self {
            base,
            data: vec![0; size],
        }
    }

    fn range(&self, addr: u64, len: usize) -> Result<core::ops::Range<usize>, HssError> {
        let start = addr
            .checked_sub(self.base)
            .ok_or(HssError::MemoryAccess)? as usize;
        let end = start.checked_add(len).ok_or(HssError::MemoryAccess)?;
        if end > self.data.len() {
            return Err(HssError::MemoryAccess);
        }
        Ok(start..end)
    }

    pub fn slice(&self, addr: u64, len: usize) -> &[u8] {
        let start = (addr - self.base) as usize;
        &self.data[start..start + len]
    }
}

impl MemoryBus for RamBus {
    fn read(&self, addr: u64, buf: &mut [u8]) -> Result<(), HssError> {
        let range = self.range(addr, buf.len())?;
        buf.copy_from_slice(&self.data[range]);
        Ok(())
    }

    fn write(&mut self, addr: u64, data: &[u8]) -> Result<(), HssError> {
        let range = self.range(addr, data.len())?;
        self.data[range].copy_from_slice(data);
        Ok(())
    }

    fn fill(&mut self, addr: u64, value: u8, len: u64) -> Result<(), HssError> {
        let range = self.range(addr, len as usize)?;
        self.data[range].fill(value);
        Ok(())
    }
}

/// Serial line fed from a script; a `None` entry reads as a timeout.
#[derive(Default)]
pub struct ScriptedSerial {
    pub rx: VecDeque<Option<u8>>,
    pub tx: Vec<u8>,
}

impl ScriptedSerial {
    pub fn queue(&mut self, bytes: &[u8]) {
        self.rx.extend(bytes.iter().map(|&b| Some(b)));
    }

    pub fn queue_timeout(&mut self) {
        self.rx.push_back(None);
    }
}

impl SerialPort for ScriptedSerial {
    fn read_byte(&mut self, _timeout_secs: u32) -> Option<u8> {
        self.rx.pop_front().flatten()
    }

    fn write_byte(&mut self, byte: u8) {
        self.tx.push(byte);
    }
}

/// In-memory disk.
pub struct RamDisk {
    pub block_size: usize,
    pub data: Vec<u8>,
    pub reads: usize,
}

impl RamDisk {
    pub fn new(block_size: usize, blocks: usize) -> Self {
        Self {
            block_size,
            data: vec![0; block_size * blocks],
            reads: 0,
        }
    }
}

impl BlockDevice for RamDisk {
    fn block_size(&self) -> usize {
        self.block_size
    }

    fn block_count(&self) -> u64 {
        (self.data.len() / self.block_size) as u64
    }

    fn read_blocks(&mut self, lba: u64, buffer: &mut [u8]) -> Result<(), HssError> {
        let start = lba as usize * self.block_size;
        let end = start + buffer.len();
        if buffer.len() % self.block_size != 0 || end > self.data.len() {
            return Err(HssError::BlockReadFailed);
        }
        self.reads += 1;
        buffer.copy_from_slice(&self.data[start..end]);
        Ok(())
    }
}

/// PMP CSR file for every hart; all entries start disabled.
#[derive(Default)]
pub struct MockPmp {
    pub cfg: [[u8; 16]; crate::NUM_PEERS],
    pub addr: [[u64; 16]; crate::NUM_PEERS],
}

impl PmpCsr for MockPmp {
    fn pmpcfg(&self, hart: HartId, index: usize) -> u8 {
        self.cfg[hart.index()][index]
    }

    fn pmpaddr(&self, hart: HartId, index: usize) -> u64 {
        self.addr[hart.index()][index]
    }
}
