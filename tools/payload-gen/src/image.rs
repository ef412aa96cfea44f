// Licensed under the Apache-2.0 license

use std::fmt::Write as _;
use std::mem::size_of;

use anyhow::{anyhow, bail, Result};
use hss_boot_image::{
    c_str, padding, BootChunkDesc, BootImage, BootImageView, PrivMode, ZiChunkDesc, BOOT_IMAGE_PAD,
    BOOT_IMAGE_VERSION, BOOT_MAGIC, MAX_NAME_LEN, NUM_BOOT_HARTS,
};
use hss_hal::HartId;
use log::{debug, info};
use serde::Serialize;
use zerocopy::{FromZeros, IntoBytes};

/// Accumulates chunks and hart settings, then lays out a boot image.
pub struct ImageBuilder {
    header: BootImage,
    chunks: Vec<(BootChunkDesc, Vec<u8>)>,
    zi_chunks: Vec<ZiChunkDesc>,
}

impl Default for ImageBuilder {
    fn default() -> Self {
        Self::new()
    }
}

fn copy_name(dest: &mut [u8; MAX_NAME_LEN], name: &str) -> Result<()> {
    if name.len() >= MAX_NAME_LEN {
        bail!("name {:?} longer than {} bytes", name, MAX_NAME_LEN - 1);
    }
    dest.fill(0);
    dest[..name.len()].copy_from_slice(name.as_bytes());
    Ok(())
}

fn slot(hart: HartId) -> Result<usize> {
    match hart.index() {
        0 => Err(anyhow!("the E51 cannot own a payload")),
        i => Ok(i - 1),
    }
}

impl ImageBuilder {
    pub fn new() -> Self {
        let mut header = BootImage::new_zeroed();
        header.magic = BOOT_MAGIC;
        header.version = BOOT_IMAGE_VERSION;
        for hart in header.hart.iter_mut() {
            hart.priv_mode = PrivMode::Illegal.into();
        }
        Self {
            header,
            chunks: vec![],
            zi_chunks: vec![],
        }
    }

    pub fn set_name(&mut self, name: &str) -> Result<()> {
        copy_name(&mut self.header.set_name, name)
    }

    pub fn set_entry_point(&mut self, hart: HartId, entry_point: u64) -> Result<()> {
        self.header.hart[slot(hart)?].entry_point = entry_point;
        Ok(())
    }

    pub fn set_hart_name(&mut self, hart: HartId, name: &str) -> Result<()> {
        copy_name(&mut self.header.hart[slot(hart)?].name, name)
    }

    /// A hart runs at one privilege level; a second, different setting is
    /// a configuration error.
    pub fn set_priv_mode(&mut self, hart: HartId, mode: PrivMode) -> Result<()> {
        let desc = &mut self.header.hart[slot(hart)?];
        let current = desc.priv_mode();
        if current != PrivMode::Illegal && current != mode {
            bail!(
                "{} is already set to {:?}, cannot change it to {:?}",
                hart.name(),
                current,
                mode
            );
        }
        desc.priv_mode = mode.into();
        Ok(())
    }

    pub fn add_chunk(&mut self, owner: HartId, exec_addr: u64, data: Vec<u8>) -> Result<()> {
        if data.is_empty() {
            // a zero-size descriptor terminates the table
            debug!("skipping empty chunk at 0x{:x}", exec_addr);
            return Ok(());
        }
        let index = self.chunks.len() as u64;
        let desc = &mut self.header.hart[slot(owner)?];
        if desc.num_chunks == 0 {
            desc.first_chunk = index;
        }
        desc.last_chunk = index;
        desc.num_chunks += 1;

        let chunk = BootChunkDesc {
            owner: u8::from(owner).into(),
            exec_addr,
            size: data.len() as u64,
            crc32: crc32fast::hash(&data),
            ..Default::default()
        };
        debug!(
            "chunk {}: exec 0x{:016x} size 0x{:x} crc32 0x{:08x}",
            index, chunk.exec_addr, chunk.size, chunk.crc32
        );
        self.chunks.push((chunk, data));
        Ok(())
    }

    pub fn add_zi_chunk(&mut self, owner: HartId, exec_addr: u64, size: u64) -> Result<()> {
        slot(owner)?;
        if size == 0 {
            return Ok(());
        }
        debug!("zi chunk {}: exec 0x{:016x} size 0x{:x}", self.zi_chunks.len(), exec_addr, size);
        self.zi_chunks.push(ZiChunkDesc {
            owner: u8::from(owner).into(),
            exec_addr,
            size,
            ..Default::default()
        });
        Ok(())
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    /// Header, chunk table and sentinel, ZI table and sentinel, then the
    /// chunk data; each part padded to 8 bytes.
    pub fn build(mut self) -> Result<Vec<u8>> {
        let header_size = size_of::<BootImage>() + padding(size_of::<BootImage>(), BOOT_IMAGE_PAD);
        let chunk_table_size = size_of::<BootChunkDesc>() * (self.chunks.len() + 1);
        let zi_table_size = size_of::<ZiChunkDesc>() * (self.zi_chunks.len() + 1);

        let chunk_table_offset = header_size;
        let zi_table_offset =
            chunk_table_offset + chunk_table_size + padding(chunk_table_size, BOOT_IMAGE_PAD);
        let header_length = zi_table_offset + zi_table_size + padding(zi_table_size, BOOT_IMAGE_PAD);

        let mut load_addr = header_length;
        for (chunk, data) in self.chunks.iter_mut() {
            chunk.load_addr = load_addr as u64;
            load_addr += data.len() + padding(data.len(), BOOT_IMAGE_PAD);
        }

        self.header.chunk_table_offset = chunk_table_offset as u64;
        self.header.zi_chunk_table_offset = zi_table_offset as u64;
        self.header.header_length = header_length as u64;
        self.header.boot_image_length = load_addr as u64;
        self.header.header_crc = 0;
        self.header.header_crc = self.header.compute_header_crc();

        let mut out = Vec::with_capacity(load_addr);
        out.extend_from_slice(self.header.as_bytes());
        out.resize(chunk_table_offset, 0);
        for (chunk, _) in &self.chunks {
            out.extend_from_slice(chunk.as_bytes());
        }
        out.extend_from_slice(BootChunkDesc::default().as_bytes());
        out.resize(zi_table_offset, 0);
        for zi in &self.zi_chunks {
            out.extend_from_slice(zi.as_bytes());
        }
        out.extend_from_slice(ZiChunkDesc::default().as_bytes());
        out.resize(header_length, 0);
        for (_, data) in &self.chunks {
            out.extend_from_slice(data);
            out.resize(out.len() + padding(data.len(), BOOT_IMAGE_PAD), 0);
        }

        info!(
            "image: {} chunks, {} zi chunks, {} bytes (header {} bytes)",
            self.chunks.len(),
            self.zi_chunks.len(),
            out.len(),
            header_length
        );
        Ok(out)
    }
}

#[derive(Debug, Serialize)]
pub struct HartSummary {
    pub name: String,
    pub entry_point: u64,
    pub priv_mode: String,
    pub first_chunk: u64,
    pub last_chunk: u64,
    pub num_chunks: u64,
}

#[derive(Debug, Serialize)]
pub struct ChunkSummary {
    pub owner: u32,
    pub load_addr: u64,
    pub exec_addr: u64,
    pub size: u64,
    pub crc32: u32,
    pub crc_ok: bool,
}

#[derive(Debug, Serialize)]
pub struct ZiSummary {
    pub owner: u32,
    pub exec_addr: u64,
    pub size: u64,
}

/// Decoded image, as printed by `dump`.
#[derive(Debug, Serialize)]
pub struct ImageSummary {
    pub set_name: String,
    pub header_length: u64,
    pub header_crc: u32,
    pub boot_image_length: u64,
    pub hash: String,
    pub harts: Vec<HartSummary>,
    pub chunks: Vec<ChunkSummary>,
    pub zi_chunks: Vec<ZiSummary>,
}

impl ImageSummary {
    /// Validates `bytes` the way the firmware does and decodes every table.
    pub fn from_image(bytes: &[u8]) -> Result<Self> {
        let view = BootImageView::parse(bytes).map_err(|e| anyhow!("invalid boot image: {}", e))?;
        let header = view.header();

        let harts = header
            .hart
            .iter()
            .map(|h| HartSummary {
                name: c_str(&h.name).to_string(),
                entry_point: h.entry_point,
                priv_mode: format!("{:?}", h.priv_mode()),
                first_chunk: h.first_chunk,
                last_chunk: h.last_chunk,
                num_chunks: h.num_chunks,
            })
            .collect();
        let chunks = view
            .chunks()
            .map(|c| ChunkSummary {
                owner: c.owner,
                load_addr: c.load_addr,
                exec_addr: c.exec_addr,
                size: c.size,
                crc32: c.crc32,
                crc_ok: view.chunk_data(&c).map(crc32fast::hash) == Some(c.crc32),
            })
            .collect();
        let zi_chunks = view
            .zi_chunks()
            .map(|z| ZiSummary {
                owner: z.owner,
                exec_addr: z.exec_addr,
                size: z.size,
            })
            .collect();

        Ok(Self {
            set_name: header.set_name().to_string(),
            header_length: header.header_length,
            header_crc: header.header_crc,
            boot_image_length: header.boot_image_length,
            hash: hex::encode(header.hash),
            harts,
            chunks,
            zi_chunks,
        })
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        // writing to a String cannot fail
        let _ = self.render_into(&mut out);
        out
    }

    fn render_into(&self, out: &mut String) -> std::fmt::Result {
        writeln!(out, "set name:           >>{}<<", self.set_name)?;
        writeln!(out, "header length:      0x{:x}", self.header_length)?;
        writeln!(out, "header crc:         0x{:08x}", self.header_crc)?;
        writeln!(out, "boot image length:  {}", self.boot_image_length)?;
        for (i, hart) in self.harts.iter().enumerate().take(NUM_BOOT_HARTS) {
            writeln!(
                out,
                "u54_{}: >>{}<< entry 0x{:x} {} chunks {}..={} ({})",
                i + 1,
                hart.name,
                hart.entry_point,
                hart.priv_mode,
                hart.first_chunk,
                hart.last_chunk,
                hart.num_chunks
            )?;
        }
        for (i, c) in self.chunks.iter().enumerate() {
            writeln!(
                out,
                "chunk {:3}: owner {} load 0x{:08x} exec 0x{:016x} size 0x{:x} crc32 0x{:08x}{}",
                i,
                c.owner,
                c.load_addr,
                c.exec_addr,
                c.size,
                c.crc32,
                if c.crc_ok { "" } else { " BAD" }
            )?;
        }
        writeln!(out, "Boot Chunks: total of {} found", self.chunks.len())?;
        for (i, z) in self.zi_chunks.iter().enumerate() {
            writeln!(
                out,
                "zi chunk {:3}: owner {} exec 0x{:016x} size 0x{:x}",
                i, z.owner, z.exec_addr, z.size
            )?;
        }
        writeln!(out, "ZI Chunks: total of {} found", self.zi_chunks.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout() {
        let mut builder = ImageBuilder::new();
        builder.set_name("unit").unwrap();
        builder.set_entry_point(HartId::U54_1, 0x8020_0000).unwrap();
        builder.set_priv_mode(HartId::U54_1, PrivMode::Supervisor).unwrap();
        builder.add_chunk(HartId::U54_1, 0x8020_0000, vec![1, 2, 3]).unwrap();
        builder.add_chunk(HartId::U54_2, 0x9000_0000, vec![0xaa; 16]).unwrap();
        builder.add_chunk(HartId::U54_1, 0x8030_0000, vec![]).unwrap();
        builder.add_zi_chunk(HartId::U54_1, 0x8040_0000, 0x100).unwrap();
        assert_eq!(builder.chunk_count(), 2);
        let image = builder.build().unwrap();

        let view = BootImageView::parse(&image).unwrap();
        let header = view.header();
        assert_eq!(header.chunk_table_offset, 1552);
        assert_eq!(header.zi_chunk_table_offset, 1552 + 3 * 40);
        assert_eq!(header.header_length, 1552 + 120 + 48);
        assert_eq!(header.boot_image_length as usize, image.len());
        assert_eq!(image.len(), 1720 + 8 + 16);

        let chunks: Vec<_> = view.chunks().collect();
        assert_eq!(chunks[0].load_addr, 1720);
        assert_eq!(chunks[1].load_addr, 1728);
        assert_eq!(view.chunk_data(&chunks[0]).unwrap(), &[1, 2, 3]);
        assert_eq!(chunks[1].crc32, crc32fast::hash(&[0xaa; 16]));

        let h1 = &header.hart[0];
        assert_eq!((h1.first_chunk, h1.last_chunk, h1.num_chunks), (0, 0, 1));
        let h2 = &header.hart[1];
        assert_eq!((h2.first_chunk, h2.last_chunk, h2.num_chunks), (1, 1, 1));
        assert_eq!(header.hart[2].priv_mode(), PrivMode::Illegal);
    }

    #[test]
    fn test_builder_rejects() {
        let mut builder = ImageBuilder::new();
        assert!(builder.add_chunk(HartId::E51, 0, vec![1]).is_err());
        assert!(builder.set_name(&"x".repeat(MAX_NAME_LEN)).is_err());
        builder.set_priv_mode(HartId::U54_2, PrivMode::Machine).unwrap();
        builder.set_priv_mode(HartId::U54_2, PrivMode::Machine).unwrap();
        assert!(builder
            .set_priv_mode(HartId::U54_2, PrivMode::Supervisor)
            .is_err());
    }

    #[test]
    fn test_summary() {
        let mut builder = ImageBuilder::new();
        builder.set_name("summary").unwrap();
        builder.set_hart_name(HartId::U54_3, "bare").unwrap();
        builder.add_chunk(HartId::U54_3, 0xb000_0000, vec![7; 10]).unwrap();
        let mut image = builder.build().unwrap();

        let summary = ImageSummary::from_image(&image).unwrap();
        assert_eq!(summary.set_name, "summary");
        assert_eq!(summary.harts[2].name, "bare");
        assert!(summary.chunks[0].crc_ok);
        let text = summary.render();
        assert!(text.contains("Boot Chunks: total of 1 found"));
        assert!(text.contains("ZI Chunks: total of 0 found"));

        let last = image.len() - 8;
        image[last] ^= 0xff;
        let summary = ImageSummary::from_image(&image).unwrap();
        assert!(!summary.chunks[0].crc_ok);
        assert!(summary.render().contains(" BAD"));

        image[0] = 0;
        assert!(ImageSummary::from_image(&image).is_err());
    }
}
