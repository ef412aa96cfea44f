// Licensed under the Apache-2.0 license

#![cfg_attr(target_arch = "riscv64", no_std)]

use thiserror::Error;

/// Errors reported by the hart software services.
///
/// The discriminants are stable and are what gets written to the console
/// or mailbox when a service fails, so new variants are only ever appended.
#[repr(u32)]
#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
pub enum HssError {
    #[error("invalid argument")]
    InvalidArgument = 0xf000_0001,
    #[error("IPI queue full")]
    IpiQueueFull = 0xf000_0002,
    #[error("no free IPI completion slot")]
    IpiNoCompletionSlot = 0xf000_0003,
    #[error("boot image has bad magic")]
    BootImageBadMagic = 0xf000_0004,
    #[error("boot image header CRC mismatch")]
    BootImageBadHeaderCrc = 0xf000_0005,
    #[error("compressed boot images are not supported")]
    BootImageCompressed = 0xf000_0006,
    #[error("boot image truncated")]
    BootImageTruncated = 0xf000_0007,
    #[error("no boot image registered")]
    NoBootImage = 0xf000_0008,
    #[error("block device read failed")]
    BlockReadFailed = 0xf000_0009,
    #[error("GPT signature not found")]
    GptBadSignature = 0xf000_000a,
    #[error("unsupported GPT revision")]
    GptBadRevision = 0xf000_000b,
    #[error("GPT header CRC mismatch")]
    GptBadHeaderCrc = 0xf000_000c,
    #[error("GPT header LBA layout invalid")]
    GptBadLayout = 0xf000_000d,
    #[error("GPT partition entries CRC mismatch")]
    GptBadEntriesCrc = 0xf000_000e,
    #[error("partition not found")]
    PartitionNotFound = 0xf000_000f,
    #[error("transfer aborted")]
    TransferAborted = 0xf000_0010,
    #[error("transfer exceeds buffer")]
    TransferTooLarge = 0xf000_0011,
    #[error("maximum retries exceeded")]
    RetriesExceeded = 0xf000_0012,
    #[error("memory access out of range")]
    MemoryAccess = 0xf000_0013,
    #[error("unexpected MAC interrupt status")]
    MacUnexpectedInterrupt = 0xf000_0014,
    #[error("MAC ring has no free descriptor")]
    MacRingFull = 0xf000_0015,
    #[error("operation not valid in current state")]
    InvalidState = 0xf000_0016,
}

impl From<HssError> for u32 {
    fn from(err: HssError) -> u32 {
        err as u32
    }
}
