// Licensed under the Apache-2.0 license

//! Host-side generator for HSS boot images.

pub mod config;
pub mod image;
pub mod payload;

use std::path::Path;

use anyhow::{Context, Result};
use log::info;

pub use config::GeneratorConfig;
pub use image::{ImageBuilder, ImageSummary};

pub const DEFAULT_SET_NAME_PREFIX: &str = "PolarFireSOC-HSS::";

/// Builds the image described by `config`. Payload paths are resolved
/// against `base_dir`. Without an explicit set name the payload names are
/// joined onto [`DEFAULT_SET_NAME_PREFIX`].
pub fn generate(
    config: &GeneratorConfig,
    base_dir: &Path,
    set_name_override: Option<&str>,
) -> Result<Vec<u8>> {
    let mut builder = ImageBuilder::new();

    for (hart, addr) in &config.hart_entry_points {
        let hart = config::parse_hart(hart)?;
        builder.set_entry_point(hart, addr.value()?)?;
    }

    let mut default_name = DEFAULT_SET_NAME_PREFIX.to_string();
    for (index, (path, payload)) in config.payloads.iter().enumerate() {
        let owner = config::parse_hart(&payload.owner_hart)?;
        let mode = config::parse_priv_mode(&payload.priv_mode)?;
        builder.set_priv_mode(owner, mode)?;
        for secondary in &payload.secondary_hart {
            builder.set_priv_mode(config::parse_hart(secondary)?, mode)?;
        }
        builder.set_hart_name(owner, path)?;

        let exec_addr = payload.exec_addr.as_ref().map(|a| a.value()).transpose()?;
        let full_path = base_dir.join(path);
        payload::add_payload(&mut builder, owner, &full_path.to_string_lossy(), exec_addr)
            .with_context(|| format!("payload {}", path))?;

        if index > 0 {
            default_name.push('+');
        }
        default_name.push_str(path);
    }

    let set_name = set_name_override
        .or(config.set_name.as_deref())
        .unwrap_or(&default_name);
    info!("Set-name is >>{}<<", set_name);
    builder.set_name(set_name)?;
    builder.build()
}

/// Reads the configuration at `config_path`, generates the image and writes
/// it to `output`.
pub fn generate_file(config_path: &Path, output: &Path, set_name_override: Option<&str>) -> Result<usize> {
    let config = GeneratorConfig::load(config_path)?;
    let base_dir = config_path.parent().unwrap_or(Path::new("."));
    let image = generate(&config, base_dir, set_name_override)?;
    std::fs::write(output, &image).with_context(|| format!("cannot write {}", output.display()))?;
    info!("Output filename is >>{}<<", output.display());
    Ok(image.len())
}
