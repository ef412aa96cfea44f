// Licensed under the Apache-2.0 license

//! Generator configuration file.
//!
//! ```toml
//! set-name = "PolarFire-SoC-HSS::TestImage"
//!
//! [hart-entry-points]
//! u54_1 = "0x80200000"
//! u54_2 = "0x80200000"
//!
//! [payloads."test/u-boot"]
//! exec-addr = "0x80200000"
//! owner-hart = "u54_1"
//! secondary-hart = ["u54_2"]
//! priv-mode = "prv_s"
//! ```
//!
//! Payloads are laid out in path order.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{anyhow, bail, Context, Result};
use hss_boot_image::PrivMode;
use hss_hal::HartId;
use serde::Deserialize;

/// Addresses may be written as TOML integers or as `0x` strings.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum Address {
    Number(u64),
    Text(String),
}

impl Address {
    pub fn value(&self) -> Result<u64> {
        match self {
            Address::Number(n) => Ok(*n),
            Address::Text(s) => {
                let s = s.trim();
                let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
                    Some(hex) => u64::from_str_radix(hex, 16),
                    None => s.parse(),
                };
                parsed.map_err(|e| anyhow!("bad address {:?}: {}", s, e))
            }
        }
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct PayloadConfig {
    pub exec_addr: Option<Address>,
    pub owner_hart: String,
    #[serde(default)]
    pub secondary_hart: Vec<String>,
    pub priv_mode: String,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct GeneratorConfig {
    pub set_name: Option<String>,
    #[serde(default)]
    pub hart_entry_points: BTreeMap<String, Address>,
    pub payloads: BTreeMap<String, PayloadConfig>,
}

impl GeneratorConfig {
    pub fn parse(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text)?;
        if config.payloads.is_empty() {
            bail!("no payloads listed");
        }
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("cannot read {}", path.display()))?;
        Self::parse(&text).with_context(|| format!("in {}", path.display()))
    }
}

/// Maps `u54_1`..`u54_4` onto hart ids.
pub fn parse_hart(name: &str) -> Result<HartId> {
    HartId::U54S
        .into_iter()
        .find(|h| h.name().eq_ignore_ascii_case(name))
        .ok_or_else(|| anyhow!("unknown hart {:?} (expected u54_1..u54_4)", name))
}

pub fn parse_priv_mode(name: &str) -> Result<PrivMode> {
    match name.to_ascii_lowercase().as_str() {
        "prv_m" => Ok(PrivMode::Machine),
        "prv_s" => Ok(PrivMode::Supervisor),
        "prv_u" => Ok(PrivMode::User),
        _ => bail!("unknown privilege mode {:?} (expected prv_m, prv_s or prv_u)", name),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
set-name = "PolarFire-SoC-HSS::TestImage"

[hart-entry-points]
u54_1 = "0x80200000"
u54_3 = 0xB0000000

[payloads."test/baremetal"]
exec-addr = "0xB0000000"
owner-hart = "u54_3"
priv-mode = "prv_m"

[payloads."test/u-boot"]
owner-hart = "u54_1"
secondary-hart = ["u54_2", "u54_4"]
priv-mode = "prv_s"
"#;

    #[test]
    fn test_parse_sample() {
        let config = GeneratorConfig::parse(SAMPLE).unwrap();
        assert_eq!(config.set_name.as_deref(), Some("PolarFire-SoC-HSS::TestImage"));
        assert_eq!(
            config.hart_entry_points["u54_3"].value().unwrap(),
            0xb000_0000
        );
        let names: Vec<_> = config.payloads.keys().cloned().collect();
        assert_eq!(names, ["test/baremetal", "test/u-boot"]);
        let uboot = &config.payloads["test/u-boot"];
        assert_eq!(uboot.exec_addr, None);
        assert_eq!(uboot.secondary_hart, ["u54_2", "u54_4"]);
    }

    #[test]
    fn test_rejects() {
        assert!(GeneratorConfig::parse("set-name = \"x\"\n[payloads]\n").is_err());
        assert!(GeneratorConfig::parse("[payloads.a]\nowner-hart = \"u54_1\"\npriv-mode = \"prv_s\"\nbogus = 1\n").is_err());
        assert!(Address::Text("0xzz".into()).value().is_err());
        assert_eq!(Address::Text("4096".into()).value().unwrap(), 4096);
    }

    #[test]
    fn test_names() {
        assert_eq!(parse_hart("u54_2").unwrap(), HartId::U54_2);
        assert!(parse_hart("e51").is_err());
        assert_eq!(parse_priv_mode("PRV_S").unwrap(), PrivMode::Supervisor);
        assert!(parse_priv_mode("prv_h").is_err());
    }
}
