// Licensed under the Apache-2.0 license

//! Turns payload files into image chunks.

use anyhow::{anyhow, bail, Context, Result};
use elf::abi::{EM_RISCV, ET_EXEC, PT_LOAD, SHF_ALLOC, SHT_NOBITS, SHT_NULL};
use elf::endian::AnyEndian;
use elf::ElfBytes;
use hss_hal::HartId;
use log::{debug, info};

use crate::image::ImageBuilder;

const ELF_MAGIC: &[u8; 4] = b"\x7fELF";

pub fn is_elf(bytes: &[u8]) -> bool {
    bytes.starts_with(ELF_MAGIC)
}

/// Adds every allocated section of a RISC-V executable that lies inside a
/// `PT_LOAD` segment: file-backed sections become chunks, `NOBITS`
/// sections become zero-init chunks. Returns the ELF entry point.
pub fn add_elf(builder: &mut ImageBuilder, owner: HartId, bytes: &[u8]) -> Result<u64> {
    let file = ElfBytes::<AnyEndian>::minimal_parse(bytes)?;
    if file.ehdr.e_machine != EM_RISCV {
        bail!(
            "machine type is {}, only RISC-V payloads are supported",
            file.ehdr.e_machine
        );
    }
    if file.ehdr.e_type != ET_EXEC {
        bail!(
            "ELF type is {}, only executable payloads are supported",
            file.ehdr.e_type
        );
    }
    debug!("entry point 0x{:x}", file.ehdr.e_entry);

    let segments = file
        .segments()
        .ok_or_else(|| anyhow!("no program headers"))?;
    let (sections, strtab) = file.section_headers_with_strtab()?;
    let sections = sections.ok_or_else(|| anyhow!("no section headers"))?;
    let strtab = strtab.ok_or_else(|| anyhow!("no section name table"))?;

    for phdr in segments.iter().filter(|p| p.p_type == PT_LOAD) {
        let start = phdr.p_vaddr;
        let end = phdr.p_vaddr + phdr.p_memsz;
        for shdr in sections.iter() {
            if shdr.sh_type == SHT_NULL
                || shdr.sh_flags & SHF_ALLOC as u64 == 0
                || shdr.sh_size == 0
                || shdr.sh_addr < start
                || shdr.sh_addr + shdr.sh_size > end
            {
                continue;
            }
            let name = strtab.get(shdr.sh_name as usize).unwrap_or("?");
            if shdr.sh_type == SHT_NOBITS {
                debug!("{}: zero-init 0x{:x} + 0x{:x}", name, shdr.sh_addr, shdr.sh_size);
                builder.add_zi_chunk(owner, shdr.sh_addr, shdr.sh_size)?;
            } else {
                let (data, compression) = file.section_data(&shdr)?;
                if compression.is_some() {
                    bail!("section {} is compressed", name);
                }
                debug!("{}: 0x{:x} + 0x{:x}", name, shdr.sh_addr, data.len());
                builder.add_chunk(owner, shdr.sh_addr, data.to_vec())?;
            }
        }
    }
    Ok(file.ehdr.e_entry)
}

/// Loads one configured payload. Raw blobs are placed at `exec_addr`.
pub fn add_payload(
    builder: &mut ImageBuilder,
    owner: HartId,
    path: &str,
    exec_addr: Option<u64>,
) -> Result<()> {
    let bytes = std::fs::read(path).with_context(|| format!("cannot read payload {}", path))?;
    if is_elf(&bytes) {
        info!("Processing ELF >>{}<<", path);
        add_elf(builder, owner, &bytes).with_context(|| format!("in ELF {}", path))?;
    } else {
        let exec_addr =
            exec_addr.ok_or_else(|| anyhow!("blob {} needs an exec-addr", path))?;
        info!("Processing blob >>{}<< at 0x{:x}", path, exec_addr);
        builder.add_chunk(owner, exec_addr, bytes)?;
    }
    Ok(())
}
