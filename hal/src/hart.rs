// Licensed under the Apache-2.0 license

use num_enum::{IntoPrimitive, TryFromPrimitive};

/// Harts of the MSS core complex. The E51 is the monitor hart that runs
/// these services; the U54s are the application harts.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, IntoPrimitive, TryFromPrimitive)]
pub enum HartId {
    E51 = 0,
    U54_1 = 1,
    U54_2 = 2,
    U54_3 = 3,
    U54_4 = 4,
}

pub const NUM_PEERS: usize = 5;
pub const NUM_U54S: usize = 4;

impl HartId {
    pub const U54S: [HartId; NUM_U54S] =
        [HartId::U54_1, HartId::U54_2, HartId::U54_3, HartId::U54_4];

    pub const ALL: [HartId; NUM_PEERS] = [
        HartId::E51,
        HartId::U54_1,
        HartId::U54_2,
        HartId::U54_3,
        HartId::U54_4,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn mask(self) -> u32 {
        1 << (self as u32)
    }

    pub fn name(self) -> &'static str {
        match self {
            HartId::E51 => "E51",
            HartId::U54_1 => "U54_1",
            HartId::U54_2 => "U54_2",
            HartId::U54_3 => "U54_3",
            HartId::U54_4 => "U54_4",
        }
    }
}

/// A hart, or every U54 at once.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HartTarget {
    One(HartId),
    AllU54s,
}

/// Bit mask covering every U54.
pub const ALL_U54_MASK: u32 = 0x1e;

impl HartTarget {
    pub fn includes(self, hart: HartId) -> bool {
        match self {
            HartTarget::One(h) => h == hart,
            HartTarget::AllU54s => hart != HartId::E51,
        }
    }

    pub fn mask(self) -> u32 {
        match self {
            HartTarget::One(h) => h.mask(),
            HartTarget::AllU54s => ALL_U54_MASK,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_masks() {
        let all = HartId::U54S.iter().fold(0, |m, h| m | h.mask());
        assert_eq!(all, ALL_U54_MASK);
        assert_eq!(HartTarget::One(HartId::U54_3).mask(), 0b1000);
        assert!(HartTarget::AllU54s.includes(HartId::U54_1));
        assert!(!HartTarget::AllU54s.includes(HartId::E51));
        assert_eq!(HartId::try_from(4u8), Ok(HartId::U54_4));
        assert!(HartId::try_from(5u8).is_err());
    }
}

/// Machine software interrupt (MSIP) lines in the CLINT.
pub trait SoftwareInterrupt {
    fn raise(&self, hart: HartId);
}

/// Read access to another hart's PMP configuration.
pub trait PmpCsr {
    fn pmpcfg(&self, hart: HartId, index: usize) -> u8;
    fn pmpaddr(&self, hart: HartId, index: usize) -> u64;
}
