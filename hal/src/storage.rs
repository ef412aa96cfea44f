// Licensed under the Apache-2.0 license

//! Generic interface for block storage (eMMC, SD card, QSPI).

use hss_error::HssError;

/// Drivers for boot media implement this to expose whole-block reads.
pub trait BlockDevice {
    /// Size of one logical block in bytes.
    fn block_size(&self) -> usize;

    /// Number of addressable blocks.
    fn block_count(&self) -> u64;

    /// Reads `buffer.len() / block_size()` blocks starting at `lba`.
    fn read_blocks(&mut self, lba: u64, buffer: &mut [u8]) -> Result<(), HssError>;
}
