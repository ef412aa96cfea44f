// Licensed under the Apache-2.0 license

//! Hart Software Services: the E51 monitor firmware that loads a boot image,
//! hands the U54 application harts their payloads and then keeps servicing
//! them from a cooperative superloop.

#![cfg_attr(target_arch = "riscv64", no_std)]

pub mod boot;
pub mod gpt;
pub mod healthmon;
pub mod ipi;
pub mod mac;
pub mod sm;
pub mod tinycli;
pub mod ymodem;

use core::sync::atomic::{AtomicU32, Ordering};

use bitflags::bitflags;
use hss_config::HssConfig;
use hss_hal::{Clock, MemoryBus, SoftwareInterrupt};

use crate::boot::pmp::PmpTable;
use crate::ipi::Ipi;
use crate::sm::{Runnable, Scheduler};

bitflags! {
    /// System-wide milestones that services wait on.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct Event: u32 {
        const DDR_TRAINED = 1 << 0;
        const STARTUP_COMPLETE = 1 << 1;
        const BOOT_COMPLETE = 1 << 2;
        /// Set once the U54s have been released; some CLI commands warn after it.
        const POST_BOOT = 1 << 3;
        const USBDMSC_REQUESTED = 1 << 4;
    }
}

/// Latched event flags.
#[derive(Debug, Default)]
pub struct Triggers(AtomicU32);

impl Triggers {
    pub const fn new() -> Self {
        Self(AtomicU32::new(0))
    }

    pub fn notify(&self, event: Event) {
        self.0.fetch_or(event.bits(), Ordering::AcqRel);
    }

    pub fn clear(&self, event: Event) {
        self.0.fetch_and(!event.bits(), Ordering::AcqRel);
    }

    /// True when every flag in `event` is set.
    pub fn is_set(&self, event: Event) -> bool {
        Event::from_bits_retain(self.0.load(Ordering::Acquire)).contains(event)
    }
}

/// Everything a service may touch while it runs.
pub struct Platform<'a> {
    pub ipi: &'a mut Ipi,
    pub msip: &'a dyn SoftwareInterrupt,
    pub clock: &'a dyn Clock,
    pub memory: &'a mut dyn MemoryBus,
    pub pmp: &'a PmpTable,
    pub events: &'a Triggers,
    pub config: &'a HssConfig,
}

/// One pass of the E51 superloop: gather ACKs from the U54s, then run every
/// machine once.
pub fn superloop_pass<'a>(
    scheduler: &mut Scheduler,
    machines: &mut [&mut dyn Runnable<Platform<'a>>],
    platform: &mut Platform<'a>,
) {
    platform
        .ipi
        .poll_and_consume_acks(platform.msip, hss_hal::HartId::E51);
    let clock = platform.clock;
    scheduler.run_all(machines, platform, clock);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_triggers() {
        let t = Triggers::new();
        assert!(!t.is_set(Event::DDR_TRAINED));
        t.notify(Event::DDR_TRAINED);
        assert!(!t.is_set(Event::DDR_TRAINED | Event::STARTUP_COMPLETE));
        t.notify(Event::STARTUP_COMPLETE);
        assert!(t.is_set(Event::DDR_TRAINED | Event::STARTUP_COMPLETE));
        t.clear(Event::DDR_TRAINED);
        assert!(t.is_set(Event::STARTUP_COMPLETE));
        assert!(!t.is_set(Event::DDR_TRAINED));
    }
}
