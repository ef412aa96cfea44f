// Licensed under the Apache-2.0 license
#![no_std]

//! Layout of the HSS boot image.
//!
//! ```text
//! +-----------------------+ 0
//! | BootImage header      |
//! +-----------------------+ chunk_table_offset
//! | BootChunkDesc[]       |  terminated by a zero-size sentinel
//! +-----------------------+ zi_chunk_table_offset
//! | ZiChunkDesc[]         |  terminated by a zero-size sentinel
//! +-----------------------+ header_length
//! | chunk payloads        |  at each chunk's load_addr (image relative)
//! +-----------------------+ boot_image_length
//! ```
//!
//! All fields are little-endian and every structure is 8-byte aligned.

use core::mem::{offset_of, size_of};

use crc::{Crc, CRC_32_ISO_HDLC};
use hss_error::HssError;
use num_enum::{IntoPrimitive, TryFromPrimitive};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

pub const BOOT_MAGIC: u32 = 0xB007_C0DE;
pub const COMPRESSED_MAGIC: u32 = 0xC08B_8355;
pub const BOOT_IMAGE_VERSION: u32 = 0;
pub const MAX_NAME_LEN: usize = 256;
pub const NUM_BOOT_HARTS: usize = 4;
pub const BOOT_IMAGE_PAD: usize = 8;

pub const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
pub enum PrivMode {
    User = 0,
    Supervisor = 1,
    Hypervisor = 2,
    Machine = 3,
    Illegal = 0xff,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct BootChunkDesc {
    /// Hart id (1..=4) that owns the chunk.
    pub owner: u32,
    pub reserved0: u32,
    /// Offset of the chunk data from the start of the image.
    pub load_addr: u64,
    /// Physical address the chunk is copied to.
    pub exec_addr: u64,
    pub size: u64,
    pub crc32: u32,
    pub reserved1: u32,
}

/// Zero-initialised region (e.g. `.bss`).
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct ZiChunkDesc {
    pub owner: u32,
    pub reserved0: u32,
    pub exec_addr: u64,
    pub size: u64,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct HartDesc {
    pub entry_point: u64,
    pub priv_mode: u8,
    pub reserved: [u8; 7],
    pub num_chunks: u64,
    pub first_chunk: u64,
    pub last_chunk: u64,
    pub name: [u8; MAX_NAME_LEN],
}

impl HartDesc {
    pub fn name(&self) -> &str {
        c_str(&self.name)
    }

    pub fn priv_mode(&self) -> PrivMode {
        PrivMode::try_from(self.priv_mode).unwrap_or(PrivMode::Illegal)
    }
}

#[repr(C)]
#[derive(Clone, Copy, Debug, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct BootImage {
    pub magic: u32,
    pub version: u32,
    pub header_length: u64,
    pub header_crc: u32,
    pub reserved0: u32,
    pub chunk_table_offset: u64,
    pub zi_chunk_table_offset: u64,
    pub hart: [HartDesc; NUM_BOOT_HARTS],
    pub set_name: [u8; MAX_NAME_LEN],
    pub boot_image_length: u64,
    pub hash: [u8; 32],
    pub ecdsa_sig: [u8; 32],
}

/// Header of an image that must be inflated before use.
#[repr(C)]
#[derive(Clone, Copy, Debug, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct CompressedImage {
    pub magic: u32,
    pub version: u32,
    pub header_length: u64,
    pub header_crc: u32,
    pub compressed_crc: u32,
    pub compressed_image_len: u64,
    pub original_image_len: u64,
    pub hash: [u8; 32],
    pub ecdsa_sig: [u8; 32],
}

const _: () = assert!(size_of::<BootChunkDesc>() == 40);
const _: () = assert!(size_of::<ZiChunkDesc>() == 24);
const _: () = assert!(size_of::<HartDesc>() == 296);
const _: () = assert!(size_of::<BootImage>() == 1552);
const _: () = assert!(size_of::<CompressedImage>() == 104);

impl BootImage {
    /// CRC32 of the header as stored, with `header_crc` itself read as zero.
    pub fn compute_header_crc(&self) -> u32 {
        let bytes = self.as_bytes();
        let crc_at = offset_of!(BootImage, header_crc);
        let mut digest = CRC32.digest();
        digest.update(&bytes[..crc_at]);
        digest.update(&[0u8; 4]);
        digest.update(&bytes[crc_at + 4..]);
        digest.finalize()
    }

    pub fn verify(&self) -> Result<(), HssError> {
        if self.magic == COMPRESSED_MAGIC {
            return Err(HssError::BootImageCompressed);
        }
        if self.magic != BOOT_MAGIC {
            return Err(HssError::BootImageBadMagic);
        }
        if self.compute_header_crc() != self.header_crc {
            return Err(HssError::BootImageBadHeaderCrc);
        }
        Ok(())
    }

    pub fn set_name(&self) -> &str {
        c_str(&self.set_name)
    }
}

/// Validated view over a complete boot image held in memory. The buffer
/// need not be aligned; descriptors are copied out as they are read.
#[derive(Clone, Copy)]
pub struct BootImageView<'a> {
    bytes: &'a [u8],
    header: BootImage,
}

impl<'a> BootImageView<'a> {
    pub fn parse(bytes: &'a [u8]) -> Result<Self, HssError> {
        if let Ok((magic, _)) = u32::read_from_prefix(bytes) {
            if magic == COMPRESSED_MAGIC {
                return Err(HssError::BootImageCompressed);
            }
        }
        let (header, _) =
            BootImage::read_from_prefix(bytes).map_err(|_| HssError::BootImageTruncated)?;
        header.verify()?;
        if (header.header_length as usize) > bytes.len()
            || (header.boot_image_length as usize) > bytes.len()
        {
            return Err(HssError::BootImageTruncated);
        }
        Ok(Self { bytes, header })
    }

    pub fn header(&self) -> &BootImage {
        &self.header
    }

    pub fn bytes(&self) -> &'a [u8] {
        self.bytes
    }

    /// Chunk descriptor `index`, or `None` past the end of the buffer.
    pub fn chunk(&self, index: usize) -> Option<BootChunkDesc> {
        read_table(self.bytes, self.header.chunk_table_offset, index)
    }

    pub fn zi_chunk(&self, index: usize) -> Option<ZiChunkDesc> {
        read_table(self.bytes, self.header.zi_chunk_table_offset, index)
    }

    /// Payload bytes referenced by `desc`.
    pub fn chunk_data(&self, desc: &BootChunkDesc) -> Option<&'a [u8]> {
        let start = desc.load_addr as usize;
        let end = start.checked_add(desc.size as usize)?;
        self.bytes.get(start..end)
    }

    /// Chunks up to the zero-size sentinel.
    pub fn chunks(&self) -> impl Iterator<Item = BootChunkDesc> + 'a {
        let (bytes, base) = (self.bytes, self.header.chunk_table_offset);
        (0..)
            .map(move |i| read_table::<BootChunkDesc>(bytes, base, i))
            .take_while(|c| matches!(c, Some(c) if c.size != 0))
            .flatten()
    }

    /// Zero-init chunks up to the zero-size sentinel.
    pub fn zi_chunks(&self) -> impl Iterator<Item = ZiChunkDesc> + 'a {
        let (bytes, base) = (self.bytes, self.header.zi_chunk_table_offset);
        (0..)
            .map(move |i| read_table::<ZiChunkDesc>(bytes, base, i))
            .take_while(|c| matches!(c, Some(c) if c.size != 0))
            .flatten()
    }
}

fn read_table<T: FromBytes>(bytes: &[u8], base: u64, index: usize) -> Option<T> {
    let offset = (base as usize).checked_add(index.checked_mul(size_of::<T>())?)?;
    T::read_from_prefix(bytes.get(offset..)?).ok().map(|(t, _)| t)
}

/// Bytes up to the first NUL, or the whole array when none, as UTF-8.
pub fn c_str(raw: &[u8]) -> &str {
    let len = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
    core::str::from_utf8(&raw[..len]).unwrap_or("<invalid>")
}

/// Bytes of padding needed to round `size` up to a multiple of `pad`.
pub const fn padding(size: usize, pad: usize) -> usize {
    size.div_ceil(pad) * pad - size
}
