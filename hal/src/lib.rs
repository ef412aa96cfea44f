// Licensed under the Apache-2.0 license

#![cfg_attr(target_arch = "riscv64", no_std)]
#![allow(static_mut_refs)]

mod clock;
pub use clock::*;
mod hart;
pub use hart::*;
mod memory;
pub use memory::*;
mod serial;
pub use serial::*;
mod storage;
pub use storage::*;

#[cfg(not(target_arch = "riscv64"))]
pub mod mock;

// Helpers to handle writing to the E51 console UART.

use core::fmt::{Display, Write};

pub static mut WRITER: Option<&'static mut dyn Write> = None;
pub static mut REBOOTER: Option<&'static mut dyn Reboot> = None;

/// Sets the global backing writer for `print` and `println` macros.
pub fn set_printer(writer: &'static mut dyn Write) {
    unsafe {
        WRITER = Some(writer);
    }
}

#[macro_export]
macro_rules! print {
    ($($arg:tt)*) => {
        unsafe {
            if let Some(writer) = $crate::WRITER.as_mut() {
                let _ = write!(writer, $($arg)*);
            }
        }
    };
}

#[macro_export]
macro_rules! println {
    ($($arg:tt)*) => {
        if let Some(writer) = unsafe { $crate::WRITER.as_mut() } {
            let _ = writeln!(writer, $($arg)*);
        }
    };
}

pub struct HexBytes<'a>(pub &'a [u8]);
impl Display for HexBytes<'_> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        for (i, &x) in self.0.iter().enumerate() {
            if i != 0 && f.alternate() {
                f.write_char(' ')?;
            }
            for c in [x >> 4, x & 0xf] {
                if c < 10 {
                    f.write_char((c + b'0') as char)?;
                } else {
                    f.write_char((c - 10 + b'a') as char)?;
                }
            }
        }
        Ok(())
    }
}

pub struct HexWord(pub u32);
impl Display for HexWord {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        HexBytes(&self.0.to_be_bytes()).fmt(f)
    }
}

/// Cold or warm restart of one or more harts.
pub trait Reboot {
    /// `hart_mask` has bit N set for hart N.
    fn reboot(&mut self, hart_mask: u32);
}

pub fn set_rebooter(rebooter: &'static mut dyn Reboot) {
    unsafe {
        REBOOTER = Some(rebooter);
    }
}

/// Requests a reboot through the installed rebooter. Returns false when none
/// has been installed.
pub fn reboot(hart_mask: u32) -> bool {
    unsafe {
        if let Some(rebooter) = REBOOTER.as_mut() {
            rebooter.reboot(hart_mask);
            return true;
        }
    }
    false
}
