// Licensed under the Apache-2.0 license

//! Copies a boot image from block storage into RAM ahead of `boot_init`.

use core::mem::size_of;

use hss_boot_image::{BootImage, BOOT_MAGIC, COMPRESSED_MAGIC};
use hss_config::BootSource;
use hss_error::HssError;
use hss_hal::BlockDevice;
use log::{error, info};
use zerocopy::FromBytes;

use crate::gpt::Gpt;

/// Largest block size the loader can bounce a partial block through.
pub const MAX_BLOCK_SIZE: usize = 4096;

/// Blocks fetched per read request.
const BLOCKS_PER_READ: usize = 8;

/// First LBA of the boot image for `source`. Partitioned media use the
/// selected GPT boot partition; raw media hold the image at LBA 0.
pub fn locate_image<D: BlockDevice + ?Sized>(
    dev: &mut D,
    source: BootSource,
    partition: Option<usize>,
) -> Result<u64, HssError> {
    if !source.uses_gpt() {
        return Ok(0);
    }
    let mut gpt = Gpt::read_header(dev)?;
    gpt.validate_partition_entries()?;
    if let Some(index) = partition {
        gpt.set_boot_partition_index(index);
    }
    let index = gpt.boot_partition_index()?;
    info!("Boot Partition found at index {}", index);
    gpt.partition_first_lba(index)
}

/// Reads the image starting at `start_lba` into `dest` and returns its
/// length. Only the magic is checked here; `BootService::boot_init` does
/// the full validation.
pub fn load_image<D: BlockDevice + ?Sized>(
    dev: &mut D,
    start_lba: u64,
    dest: &mut [u8],
) -> Result<usize, HssError> {
    let block_size = dev.block_size();
    if block_size == 0 || block_size > MAX_BLOCK_SIZE {
        return Err(HssError::InvalidArgument);
    }

    let header_len = size_of::<BootImage>();
    info!("Attempting to read image header ({} bytes) ...", header_len);
    let mut header_bytes = [0u8; size_of::<BootImage>()];
    read_bytes(dev, start_lba, &mut header_bytes)?;
    let (header, _) = BootImage::read_from_prefix(&header_bytes[..])
        .map_err(|_| HssError::BootImageTruncated)?;

    let length = match header.magic {
        BOOT_MAGIC => header.boot_image_length as usize,
        COMPRESSED_MAGIC => return Err(HssError::BootImageCompressed),
        magic => {
            error!("Boot Image magic invalid (0x{:08x}), ignoring", magic);
            return Err(HssError::BootImageBadMagic);
        }
    };
    if length > dest.len() {
        error!("Boot image of {} bytes does not fit in {} bytes", length, dest.len());
        return Err(HssError::TransferTooLarge);
    }

    info!(" - set name is >>{}<<", header.set_name());
    info!("Copying {} bytes", length);
    read_bytes(dev, start_lba, &mut dest[..length])?;
    Ok(length)
}

/// Reads `dest.len()` bytes from `lba` onwards; a trailing partial block goes
/// through a bounce buffer.
fn read_bytes<D: BlockDevice + ?Sized>(dev: &mut D, lba: u64, dest: &mut [u8]) -> Result<(), HssError> {
    let block_size = dev.block_size();
    let whole = dest.len() / block_size * block_size;
    let (body, tail) = dest.split_at_mut(whole);

    let mut lba = lba;
    for piece in body.chunks_mut(block_size * BLOCKS_PER_READ) {
        dev.read_blocks(lba, piece)?;
        lba += (piece.len() / block_size) as u64;
    }
    if !tail.is_empty() {
        let mut bounce = [0u8; MAX_BLOCK_SIZE];
        dev.read_blocks(lba, &mut bounce[..block_size])?;
        let len = tail.len();
        tail.copy_from_slice(&bounce[..len]);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpt::tests::{entry, write_gpt, LINUX_FS};
    use crate::gpt::{BOOT_PARTITION_TYPE, GPT_LBA_SIZE};
    use hss_hal::mock::RamDisk;
    use zerocopy::{FromZeros, IntoBytes};

    fn image(len: usize) -> Vec<u8> {
        let mut header = BootImage::new_zeroed();
        header.magic = BOOT_MAGIC;
        header.boot_image_length = len as u64;
        header.set_name[..3].copy_from_slice(b"abc");
        let mut bytes = header.as_bytes().to_vec();
        bytes.resize(len, 0x5a);
        bytes
    }

    #[test]
    fn test_load_from_raw_media() {
        let mut disk = RamDisk::new(512, 16);
        let img = image(2000);
        disk.data[..img.len()].copy_from_slice(&img);

        let mut dest = vec![0u8; 4096];
        assert_eq!(locate_image(&mut disk, BootSource::Qspi, None), Ok(0));
        let len = load_image(&mut disk, 0, &mut dest).unwrap();
        assert_eq!(len, 2000);
        assert_eq!(&dest[..len], &img[..]);
        assert_eq!(dest[len], 0);
    }

    #[test]
    fn test_load_from_gpt_partition() {
        let mut disk = RamDisk::new(GPT_LBA_SIZE, 64);
        write_gpt(
            &mut disk,
            &[entry(LINUX_FS, 1, 10, 19), entry(BOOT_PARTITION_TYPE, 2, 20, 40)],
            4,
        );
        let img = image(1600);
        disk.data[20 * GPT_LBA_SIZE..20 * GPT_LBA_SIZE + img.len()].copy_from_slice(&img);

        let lba = locate_image(&mut disk, BootSource::Emmc, None).unwrap();
        assert_eq!(lba, 20);
        let mut dest = vec![0u8; 2048];
        assert_eq!(load_image(&mut disk, lba, &mut dest), Ok(1600));
        assert_eq!(&dest[..1600], &img[..]);
    }

    #[test]
    fn test_load_rejects() {
        let mut disk = RamDisk::new(512, 16);
        let img = image(3000);
        disk.data[..img.len()].copy_from_slice(&img);
        let mut small = vec![0u8; 2048];
        assert_eq!(load_image(&mut disk, 0, &mut small), Err(HssError::TransferTooLarge));

        disk.data[..4].copy_from_slice(&COMPRESSED_MAGIC.to_le_bytes());
        assert_eq!(load_image(&mut disk, 0, &mut small), Err(HssError::BootImageCompressed));

        disk.data[..4].copy_from_slice(&[0; 4]);
        assert_eq!(load_image(&mut disk, 0, &mut small), Err(HssError::BootImageBadMagic));
    }
}
