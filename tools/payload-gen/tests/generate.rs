// Licensed under the Apache-2.0 license

use std::fs;

use hss_boot_image::{BootImageView, PrivMode};
use hss_payload_generator::{generate_file, ImageSummary};

const TEXT_ADDR: u64 = 0x8020_0000;
const TEXT: [u8; 16] = [
    0x13, 0x00, 0x00, 0x00, 0x13, 0x00, 0x00, 0x00, 0x6f, 0x00, 0x00, 0x00, 0x73, 0x00, 0x50, 0x10,
];
const BSS_SIZE: u64 = 0x40;

fn put16(out: &mut Vec<u8>, v: u16) {
    out.extend_from_slice(&v.to_le_bytes());
}
fn put32(out: &mut Vec<u8>, v: u32) {
    out.extend_from_slice(&v.to_le_bytes());
}
fn put64(out: &mut Vec<u8>, v: u64) {
    out.extend_from_slice(&v.to_le_bytes());
}

#[allow(clippy::too_many_arguments)]
fn section_header(out: &mut Vec<u8>, name: u32, kind: u32, flags: u64, addr: u64, offset: u64, size: u64) {
    put32(out, name);
    put32(out, kind);
    put64(out, flags);
    put64(out, addr);
    put64(out, offset);
    put64(out, size);
    put32(out, 0);
    put32(out, 0);
    put64(out, 1);
    put64(out, 0);
}

/// Minimal RISC-V executable: one PT_LOAD segment holding `.text` and
/// `.bss`, plus the section name table.
fn riscv_elf(machine: u16) -> Vec<u8> {
    const PHOFF: u64 = 64;
    const TEXT_OFF: u64 = PHOFF + 56;
    const STRTAB_OFF: u64 = TEXT_OFF + 16;
    const STRTAB: &[u8] = b"\0.text\0.bss\0.shstrtab\0";
    const SHOFF: u64 = 160;

    let mut out = vec![];
    out.extend_from_slice(&[0x7f, b'E', b'L', b'F', 2, 1, 1, 0]);
    out.extend_from_slice(&[0; 8]);
    put16(&mut out, 2); // ET_EXEC
    put16(&mut out, machine);
    put32(&mut out, 1);
    put64(&mut out, TEXT_ADDR);
    put64(&mut out, PHOFF);
    put64(&mut out, SHOFF);
    put32(&mut out, 0);
    put16(&mut out, 64);
    put16(&mut out, 56);
    put16(&mut out, 1);
    put16(&mut out, 64);
    put16(&mut out, 4);
    put16(&mut out, 3);
    assert_eq!(out.len() as u64, PHOFF);

    put32(&mut out, 1); // PT_LOAD
    put32(&mut out, 7);
    put64(&mut out, TEXT_OFF);
    put64(&mut out, TEXT_ADDR);
    put64(&mut out, TEXT_ADDR);
    put64(&mut out, TEXT.len() as u64);
    put64(&mut out, TEXT.len() as u64 + BSS_SIZE);
    put64(&mut out, 0x1000);

    out.extend_from_slice(&TEXT);
    out.extend_from_slice(STRTAB);
    out.resize(SHOFF as usize, 0);

    section_header(&mut out, 0, 0, 0, 0, 0, 0);
    section_header(&mut out, 1, 1, 0x6, TEXT_ADDR, TEXT_OFF, TEXT.len() as u64);
    section_header(&mut out, 7, 8, 0x3, TEXT_ADDR + 16, STRTAB_OFF, BSS_SIZE);
    section_header(&mut out, 12, 3, 0, 0, STRTAB_OFF, STRTAB.len() as u64);
    out
}

#[test]
fn test_generate_elf_and_blob() {
    let dir = tempfile::tempdir().unwrap();
    fs::write(dir.path().join("app.elf"), riscv_elf(243)).unwrap();
    fs::write(dir.path().join("blob.bin"), [0x55u8; 100]).unwrap();
    let config = dir.path().join("payload.toml");
    fs::write(
        &config,
        r#"
[hart-entry-points]
u54_1 = "0x80200000"
u54_2 = "0x80200000"
u54_4 = "0xB0000000"

[payloads."app.elf"]
owner-hart = "u54_1"
secondary-hart = ["u54_2"]
priv-mode = "prv_s"

[payloads."blob.bin"]
exec-addr = "0xB0000000"
owner-hart = "u54_4"
priv-mode = "prv_m"
"#,
    )
    .unwrap();

    let output = dir.path().join("out.bin");
    let len = generate_file(&config, &output, None).unwrap();
    let bytes = fs::read(&output).unwrap();
    assert_eq!(bytes.len(), len);

    let view = BootImageView::parse(&bytes).unwrap();
    let header = view.header();
    assert_eq!(header.set_name(), "PolarFireSOC-HSS::app.elf+blob.bin");
    assert_eq!(header.hart[0].entry_point, TEXT_ADDR);
    assert_eq!(header.hart[0].priv_mode(), PrivMode::Supervisor);
    assert_eq!(header.hart[1].priv_mode(), PrivMode::Supervisor);
    assert_eq!(header.hart[2].priv_mode(), PrivMode::Illegal);
    assert_eq!(header.hart[3].priv_mode(), PrivMode::Machine);
    assert_eq!(header.hart[0].name(), "app.elf");

    let chunks: Vec<_> = view.chunks().collect();
    assert_eq!(chunks.len(), 2);
    assert_eq!((chunks[0].owner, chunks[0].exec_addr), (1, TEXT_ADDR));
    assert_eq!(view.chunk_data(&chunks[0]).unwrap(), &TEXT);
    assert_eq!((chunks[1].owner, chunks[1].size), (4, 100));
    assert_eq!(header.hart[3].first_chunk, 1);

    let zi: Vec<_> = view.zi_chunks().collect();
    assert_eq!(zi.len(), 1);
    assert_eq!((zi[0].exec_addr, zi[0].size), (TEXT_ADDR + 16, BSS_SIZE));

    let summary = ImageSummary::from_image(&bytes).unwrap();
    assert!(summary.chunks.iter().all(|c| c.crc_ok));
    let json = serde_json::to_value(&summary).unwrap();
    assert_eq!(json["zi_chunks"][0]["size"], BSS_SIZE);
}

#[test]
fn test_set_name_override_and_errors() {
    let dir = tempfile::tempdir().unwrap();
    fs::write(dir.path().join("x86.elf"), riscv_elf(62)).unwrap();
    fs::write(dir.path().join("raw.bin"), [1u8; 8]).unwrap();

    let good = dir.path().join("good.toml");
    fs::write(
        &good,
        "set-name = \"from-config\"\n[payloads.\"raw.bin\"]\nexec-addr = 0x1000\nowner-hart = \"u54_3\"\npriv-mode = \"prv_u\"\n",
    )
    .unwrap();
    let output = dir.path().join("out.bin");
    generate_file(&good, &output, Some("override")).unwrap();
    let bytes = fs::read(&output).unwrap();
    assert_eq!(BootImageView::parse(&bytes).unwrap().header().set_name(), "override");

    let wrong_machine = dir.path().join("machine.toml");
    fs::write(
        &wrong_machine,
        "[payloads.\"x86.elf\"]\nowner-hart = \"u54_1\"\npriv-mode = \"prv_s\"\n",
    )
    .unwrap();
    assert!(generate_file(&wrong_machine, &output, None).is_err());

    let no_addr = dir.path().join("noaddr.toml");
    fs::write(
        &no_addr,
        "[payloads.\"raw.bin\"]\nowner-hart = \"u54_1\"\npriv-mode = \"prv_s\"\n",
    )
    .unwrap();
    assert!(generate_file(&no_addr, &output, None).is_err());

    let clash = dir.path().join("clash.toml");
    fs::write(
        &clash,
        "[payloads.\"raw.bin\"]\nexec-addr = 0x1000\nowner-hart = \"u54_1\"\nsecondary-hart = [\"u54_1\"]\npriv-mode = \"prv_s\"\n",
    )
    .unwrap();
    // same hart twice at the same level is accepted
    assert!(generate_file(&clash, &output, None).is_ok());
}
