// Licensed under the Apache-2.0 license

//! Decoded view of each U54's physical memory protection setup, used to
//! decide whether the boot loader may copy into a region on a hart's behalf.

use bitfield::bitfield;
use bitflags::bitflags;
use hss_config::PMP_ENTRIES;
use hss_hal::{HartId, PmpCsr, NUM_PEERS};
use log::info;
use num_enum::FromPrimitive;

bitflags! {
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct PmpCfg: u8 {
        const R = 1 << 0;
        const W = 1 << 1;
        const X = 1 << 2;
        const A = 0b11 << 3;
        const L = 1 << 7;
    }
}

bitfield! {
    /// Raw `pmpNcfg` byte.
    #[derive(Clone, Copy, Default)]
    pub struct PmpCfgByte(u8);
    u8;
    pub address_matching, set_address_matching: 4, 3;
    pub locked, _: 7, 7;
}

#[repr(u8)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, FromPrimitive)]
pub enum AddressMatching {
    #[default]
    Off = 0,
    Tor = 1,
    Na4 = 2,
    Napot = 3,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PmpEntry {
    pub mode: AddressMatching,
    pub perms: PmpCfg,
    pub base: u64,
    pub size: u64,
}

impl PmpEntry {
    /// Decodes one entry. TOR entries start where `previous` ends.
    pub fn decode(cfg: u8, addr: u64, previous: Option<&PmpEntry>) -> Self {
        let mode = AddressMatching::from_primitive(PmpCfgByte(cfg).address_matching());
        let cfg = PmpCfg::from_bits_retain(cfg);
        let mut entry = PmpEntry {
            mode,
            perms: cfg & (PmpCfg::R | PmpCfg::W | PmpCfg::X | PmpCfg::L),
            ..Default::default()
        };

        match mode {
            AddressMatching::Off => entry.perms = PmpCfg::empty(),
            AddressMatching::Tor => {
                entry.base = previous.map_or(0, |p| p.base.wrapping_add(p.size));
                entry.size = (addr << 2).wrapping_sub(entry.base);
            }
            AddressMatching::Na4 => {
                entry.base = addr << 2;
                entry.size = 4;
            }
            AddressMatching::Napot => {
                let (order, mask) = napot_order(addr);
                entry.base = (addr & !mask) << 2;
                entry.size = 1u64.checked_shl(order).unwrap_or(u64::MAX);
            }
        }
        entry
    }

    /// True when the entry is active and `[start, start + len)` lies inside it.
    fn covers(&self, start: u64, len: u64) -> bool {
        if self.mode == AddressMatching::Off {
            return false;
        }
        let end = start.saturating_add(len);
        let pmp_end = self.base.saturating_add(self.size);
        self.base <= start && pmp_end > end
    }
}

/// Returns log2 of the region size encoded in a NAPOT address, along with
/// the mask of trailing ones that carry the encoding.
fn napot_order(addr: u64) -> (u32, u64) {
    let mut order = 64 + 2;
    let mut mask = u64::MAX >> 1;
    while mask != 0 {
        if addr & mask == mask {
            return (order, mask);
        }
        order -= 1;
        mask >>= 1;
    }
    (order, 0)
}

pub struct PmpTable {
    entries: [[PmpEntry; PMP_ENTRIES]; NUM_PEERS],
}

impl Default for PmpTable {
    fn default() -> Self {
        Self {
            entries: [[PmpEntry::default(); PMP_ENTRIES]; NUM_PEERS],
        }
    }
}

impl PmpTable {
    /// Snapshots and decodes the PMP CSRs of every U54.
    pub fn init(&mut self, csr: &dyn PmpCsr) {
        info!("Initializing PMPs");
        for hart in HartId::U54S {
            let row = &mut self.entries[hart.index()];
            for i in 0..PMP_ENTRIES {
                let previous = if i == 0 { None } else { Some(row[i - 1]) };
                row[i] = PmpEntry::decode(csr.pmpcfg(hart, i), csr.pmpaddr(hart, i), previous.as_ref());
            }
        }
    }

    pub fn entry(&self, hart: HartId, index: usize) -> Option<&PmpEntry> {
        self.entries[hart.index()].get(index)
    }

    /// Writes are allowed unless the first active entry covering the region
    /// denies them.
    pub fn check_write(&self, hart: HartId, start: u64, len: u64) -> bool {
        self.first_match(hart, start, len)
            .map_or(true, |e| e.perms.contains(PmpCfg::W))
    }

    /// Reads are denied unless the first active entry covering the region
    /// allows them.
    pub fn check_read(&self, hart: HartId, start: u64, len: u64) -> bool {
        self.first_match(hart, start, len)
            .is_some_and(|e| e.perms.contains(PmpCfg::R))
    }

    fn first_match(&self, hart: HartId, start: u64, len: u64) -> Option<&PmpEntry> {
        self.entries[hart.index()]
            .iter()
            .find(|e| e.covers(start, len))
    }
}
