// Licensed under the Apache-2.0 license

use strum_macros::{Display, EnumIter, EnumString};

/// Where the boot service loads the boot image from.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Display, EnumIter, EnumString)]
#[strum(ascii_case_insensitive)]
pub enum BootSource {
    /// eMMC, falling back to SD card.
    #[default]
    Mmc,
    Emmc,
    SdCard,
    Qspi,
    Spi,
    /// Image linked into the HSS itself.
    Payload,
    /// Image received over the console.
    Ymodem,
}

impl BootSource {
    pub fn uses_gpt(self) -> bool {
        matches!(self, BootSource::Mmc | BootSource::Emmc | BootSource::SdCard)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::str::FromStr;

    #[test]
    fn test_parse_boot_source() {
        assert_eq!(BootSource::from_str("sdcard"), Ok(BootSource::SdCard));
        assert_eq!(BootSource::from_str("EMMC"), Ok(BootSource::Emmc));
        assert!(BootSource::from_str("floppy").is_err());
        assert_eq!(BootSource::Qspi.to_string(), "Qspi");
        assert!(BootSource::Emmc.uses_gpt());
        assert!(!BootSource::Payload.uses_gpt());
    }
}
