// Licensed under the Apache-2.0 license

//! GUID partition table reader.
//!
//! Only the primary header is consulted. Partition entries are streamed
//! through a two-block buffer so that an entry straddling a block boundary
//! can still be read without holding the whole array in memory.

use core::fmt;
use core::mem::size_of;

use hss_error::HssError;
use hss_hal::BlockDevice;
use log::{debug, error, info};
use zerocopy::little_endian::{U16, U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use hss_boot_image::CRC32;

pub const GPT_LBA_SIZE: usize = 512;
pub const GPT_SIGNATURE: [u8; 8] = *b"EFI PART";
pub const GPT_REVISION: u32 = 0x0001_0000;

#[repr(C)]
#[derive(Clone, Copy, Default, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct Guid {
    pub data1: U32,
    pub data2: U16,
    pub data3: U16,
    pub data4: [u8; 8],
}

impl Guid {
    pub const NULL: Guid = Guid::from_fields(0, 0, 0, [0; 8]);

    pub const fn from_fields(data1: u32, data2: u16, data3: u16, data4: [u8; 8]) -> Self {
        Self {
            data1: U32::new(data1),
            data2: U16::new(data2),
            data3: U16::new(data3),
            data4,
        }
    }

    pub fn is_null(&self) -> bool {
        *self == Self::NULL
    }
}

impl fmt::Display for Guid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let d = &self.data4;
        write!(
            f,
            "{:08X}-{:04X}-{:04X}-{:02X}{:02X}-{:02X}{:02X}{:02X}{:02X}{:02X}{:02X}",
            self.data1.get(),
            self.data2.get(),
            self.data3.get(),
            d[0],
            d[1],
            d[2],
            d[3],
            d[4],
            d[5],
            d[6],
            d[7]
        )
    }
}

impl fmt::Debug for Guid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// Partition type carrying HSS boot images (the "BIOS boot" type).
pub const BOOT_PARTITION_TYPE: Guid = Guid::from_fields(
    0x2168_6148,
    0x6449,
    0x6E6F,
    [0x74, 0x4E, 0x65, 0x65, 0x64, 0x45, 0x46, 0x49],
);

#[repr(C)]
#[derive(Clone, Copy, Debug, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct GptHeader {
    pub signature: [u8; 8],
    pub revision: U32,
    pub header_size: U32,
    pub header_crc32: U32,
    pub reserved: U32,
    pub current_lba: U64,
    pub backup_lba: U64,
    pub first_usable_lba: U64,
    pub last_usable_lba: U64,
    pub disk_guid: Guid,
    pub partition_entries_lba: U64,
    pub num_partitions: U32,
    pub partition_entry_size: U32,
    pub partition_entries_crc32: U32,
}

const _: () = assert!(size_of::<GptHeader>() == 92);

#[repr(C)]
#[derive(Clone, Copy, Debug, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct PartitionEntry {
    pub type_guid: Guid,
    pub unique_guid: Guid,
    pub first_lba: U64,
    pub last_lba: U64,
    pub attributes: U64,
    pub name: [U16; 36],
}

const _: () = assert!(size_of::<PartitionEntry>() == 128);

impl PartitionEntry {
    /// Partition name, ASCII only; other UTF-16 code units become `?`.
    pub fn name_chars(&self) -> impl Iterator<Item = char> + '_ {
        self.name
            .iter()
            .map(|c| c.get())
            .take_while(|&c| c != 0)
            .map(|c| if c < 0x80 { c as u8 as char } else { '?' })
    }
}

/// Validates the header block read from LBA 1.
pub fn validate_header(block: &[u8]) -> Result<GptHeader, HssError> {
    let (header, _) = GptHeader::read_from_prefix(block).map_err(|_| HssError::GptBadLayout)?;

    if header.signature != GPT_SIGNATURE {
        error!("GPT signature not as expected");
        return Err(HssError::GptBadSignature);
    }
    if header.revision.get() != GPT_REVISION {
        error!(
            "GPT header revision is {:08x} vs expected {:08x}",
            header.revision.get(),
            GPT_REVISION
        );
        return Err(HssError::GptBadRevision);
    }

    let header_size = header.header_size.get() as usize;
    if header_size < size_of::<GptHeader>() || header_size > block.len() {
        return Err(HssError::GptBadLayout);
    }
    let crc_at = core::mem::offset_of!(GptHeader, header_crc32);
    let mut digest = CRC32.digest();
    digest.update(&block[..crc_at]);
    digest.update(&[0u8; 4]);
    digest.update(&block[crc_at + 4..header_size]);
    let checksum = digest.finalize();
    if checksum != header.header_crc32.get() {
        error!(
            "GPT header CRC32 is {:08x} vs expected {:08x}",
            checksum,
            header.header_crc32.get()
        );
        return Err(HssError::GptBadHeaderCrc);
    }

    if header.current_lba.get() != 1 {
        error!("GPT current LBA is {} vs expected 1", header.current_lba.get());
        return Err(HssError::GptBadLayout);
    }
    if header.partition_entries_lba.get() != 2 {
        error!(
            "GPT starting LBA of array of partition entries is {} vs expected 2",
            header.partition_entries_lba.get()
        );
        return Err(HssError::GptBadLayout);
    }
    let entry_size = header.partition_entry_size.get() as usize;
    if entry_size < size_of::<PartitionEntry>() || entry_size > GPT_LBA_SIZE {
        return Err(HssError::GptBadLayout);
    }

    info!("Validated GPT Header ...");
    Ok(header)
}

/// A validated partition table on `D`.
pub struct Gpt<'d, D: BlockDevice + ?Sized> {
    dev: &'d mut D,
    header: GptHeader,
    lba_buffer: [u8; 2 * GPT_LBA_SIZE],
    boot_partition_index: Option<usize>,
}

impl<'d, D: BlockDevice + ?Sized> Gpt<'d, D> {
    /// Reads and validates the primary header.
    pub fn read_header(dev: &'d mut D) -> Result<Self, HssError> {
        if dev.block_size() != GPT_LBA_SIZE {
            error!("GPT needs {} byte blocks, device has {}", GPT_LBA_SIZE, dev.block_size());
            return Err(HssError::GptBadLayout);
        }
        let mut block = [0u8; GPT_LBA_SIZE];
        dev.read_blocks(1, &mut block).map_err(|err| {
            error!("Unable to read block for LBA 1");
            err
        })?;
        let header = validate_header(&block)?;
        Ok(Self {
            dev,
            header,
            lba_buffer: [0; 2 * GPT_LBA_SIZE],
            boot_partition_index: None,
        })
    }

    pub fn header(&self) -> &GptHeader {
        &self.header
    }

    pub fn num_partitions(&self) -> usize {
        self.header.num_partitions.get() as usize
    }

    /// Raw bytes of entry `index`, staged in the block buffer.
    fn entry_bytes(&mut self, index: usize) -> Result<&[u8], HssError> {
        if index >= self.num_partitions() {
            return Err(HssError::PartitionNotFound);
        }
        let entry_size = self.header.partition_entry_size.get() as usize;
        let start_lba = self.header.partition_entries_lba.get();
        let byte_offset = index * entry_size;
        let lba = start_lba + (byte_offset / GPT_LBA_SIZE) as u64;
        let offset = byte_offset % GPT_LBA_SIZE;

        self.dev
            .read_blocks(lba, &mut self.lba_buffer[..GPT_LBA_SIZE])
            .map_err(|err| {
                error!("Unable to read block for LBA {} (partition entry {})", lba, index);
                err
            })?;
        if offset + entry_size > GPT_LBA_SIZE {
            self.dev
                .read_blocks(lba + 1, &mut self.lba_buffer[GPT_LBA_SIZE..])
                .map_err(|err| {
                    error!("Unable to read block for LBA {} (partition entry {})", lba + 1, index);
                    err
                })?;
        }
        Ok(&self.lba_buffer[offset..offset + entry_size])
    }

    pub fn read_partition_entry(&mut self, index: usize) -> Result<PartitionEntry, HssError> {
        let bytes = self.entry_bytes(index)?;
        PartitionEntry::read_from_prefix(bytes)
            .map(|(entry, _)| entry)
            .map_err(|_| HssError::GptBadLayout)
    }

    /// Checks the CRC32 of the whole partition entry array.
    pub fn validate_partition_entries(&mut self) -> Result<(), HssError> {
        let mut digest = CRC32.digest();
        for index in 0..self.num_partitions() {
            let bytes = self.entry_bytes(index)?;
            digest.update(bytes);
            if let Ok((entry, _)) = PartitionEntry::read_from_prefix(bytes) {
                if !entry.unique_guid.is_null() {
                    debug!(
                        "Found partition: unique {} type {}",
                        entry.unique_guid, entry.type_guid
                    );
                }
            }
        }
        let crc = digest.finalize();
        let expected = self.header.partition_entries_crc32.get();
        if crc != expected {
            error!(
                "CRC32 of partition entries is {:08x}, vs expected {:08x}",
                crc, expected
            );
            return Err(HssError::GptBadEntriesCrc);
        }
        info!("Validated GPT Partition Entries ...");
        Ok(())
    }

    fn find_partition(
        &mut self,
        start_index: usize,
        guid: &Guid,
        matches: fn(&PartitionEntry, &Guid) -> bool,
    ) -> Result<(usize, PartitionEntry), HssError> {
        for index in start_index..self.num_partitions() {
            let entry = self.read_partition_entry(index)?;
            if matches(&entry, guid) {
                debug!("Located partition for GUID {} at index {}", guid, index);
                return Ok((index, entry));
            }
        }
        error!("Unable to find partition for GUID {}", guid);
        Err(HssError::PartitionNotFound)
    }

    /// First partition at or after `start_index` whose type is `guid`.
    pub fn find_partition_by_type_id(
        &mut self,
        guid: &Guid,
        start_index: usize,
    ) -> Result<(usize, PartitionEntry), HssError> {
        self.find_partition(start_index, guid, |e, g| e.type_guid == *g)
    }

    pub fn find_partition_by_unique_id(
        &mut self,
        guid: &Guid,
        start_index: usize,
    ) -> Result<(usize, PartitionEntry), HssError> {
        self.find_partition(start_index, guid, |e, g| e.unique_guid == *g)
    }

    /// Next boot partition at or after `start_index`.
    pub fn find_boot_partition(&mut self, start_index: usize) -> Result<(usize, PartitionEntry), HssError> {
        self.find_partition_by_type_id(&BOOT_PARTITION_TYPE, start_index)
    }

    pub fn set_boot_partition_index(&mut self, index: usize) {
        self.boot_partition_index = Some(index);
    }

    /// The selected boot partition, or else the first one on the disk.
    pub fn boot_partition_index(&mut self) -> Result<usize, HssError> {
        match self.boot_partition_index {
            Some(index) => Ok(index),
            None => {
                let (index, _) = self.find_boot_partition(0)?;
                self.boot_partition_index = Some(index);
                Ok(index)
            }
        }
    }

    pub fn partition_first_lba(&mut self, index: usize) -> Result<u64, HssError> {
        Ok(self.read_partition_entry(index)?.first_lba.get())
    }

    /// Writes the header fields in the `Name: value` layout of the console.
    pub fn dump_header(&self, out: &mut dyn fmt::Write) -> fmt::Result {
        let h = &self.header;
        writeln!(out, "Signature:             {}", core::str::from_utf8(&h.signature).unwrap_or("?"))?;
        writeln!(out, "Revision:              0x{:08x}", h.revision.get())?;
        writeln!(out, "Header Size:           0x{:08x}", h.header_size.get())?;
        writeln!(out, "Header CRC:            0x{:08x}", h.header_crc32.get())?;
        writeln!(out, "Current LBA:           0x{:016x}", h.current_lba.get())?;
        writeln!(out, "Backup LBA:            0x{:016x}", h.backup_lba.get())?;
        writeln!(out, "First Usable LBA:      0x{:016x}", h.first_usable_lba.get())?;
        writeln!(out, "Last Usable LBA:       0x{:016x}", h.last_usable_lba.get())?;
        writeln!(out, "Disk GUID:             {}", h.disk_guid)?;
        writeln!(out, "Starting LBA:          0x{:016x}", h.partition_entries_lba.get())?;
        writeln!(out, "Num. Partitions:       0x{:08x}", h.num_partitions.get())?;
        writeln!(out, "Size of Partition:     0x{:08x}", h.partition_entry_size.get())?;
        writeln!(out, "Partition Entries CRC: 0x{:08x}", h.partition_entries_crc32.get())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use hss_hal::mock::RamDisk;
    use zerocopy::FromZeros;

    pub(crate) const LINUX_FS: Guid = Guid::from_fields(
        0x0FC6_3DAF,
        0x8483,
        0x4772,
        [0x8E, 0x79, 0x3D, 0x69, 0xD8, 0x47, 0x7D, 0xE4],
    );

    pub(crate) fn entry(type_guid: Guid, unique: u8, first: u64, last: u64) -> PartitionEntry {
        let mut e = PartitionEntry::new_zeroed();
        e.type_guid = type_guid;
        e.unique_guid = Guid::from_fields(unique as u32, 0, 0, [unique; 8]);
        e.first_lba = U64::new(first);
        e.last_lba = U64::new(last);
        for (dst, c) in e.name.iter_mut().zip("part".encode_utf16()) {
            *dst = U16::new(c);
        }
        e
    }

    /// Writes a protective-MBR-less GPT with `entries` into `disk`.
    pub(crate) fn write_gpt(disk: &mut RamDisk, entries: &[PartitionEntry], num_partitions: u32) {
        let entry_size = size_of::<PartitionEntry>();
        let mut array = vec![0u8; num_partitions as usize * entry_size];
        for (i, e) in entries.iter().enumerate() {
            array[i * entry_size..(i + 1) * entry_size].copy_from_slice(e.as_bytes());
        }
        let array_at = 2 * GPT_LBA_SIZE;
        disk.data[array_at..array_at + array.len()].copy_from_slice(&array);

        let mut header = GptHeader::new_zeroed();
        header.signature = GPT_SIGNATURE;
        header.revision = U32::new(GPT_REVISION);
        header.header_size = U32::new(size_of::<GptHeader>() as u32);
        header.current_lba = U64::new(1);
        header.partition_entries_lba = U64::new(2);
        header.num_partitions = U32::new(num_partitions);
        header.partition_entry_size = U32::new(entry_size as u32);
        header.partition_entries_crc32 = U32::new(CRC32.checksum(&array));
        header.header_crc32 = U32::new(CRC32.checksum(header.as_bytes()));
        disk.data[GPT_LBA_SIZE..GPT_LBA_SIZE + size_of::<GptHeader>()]
            .copy_from_slice(header.as_bytes());
    }

    fn sample_disk() -> RamDisk {
        let mut disk = RamDisk::new(GPT_LBA_SIZE, 64);
        write_gpt(
            &mut disk,
            &[
                entry(LINUX_FS, 1, 40, 50),
                entry(BOOT_PARTITION_TYPE, 2, 34, 39),
                entry(LINUX_FS, 3, 51, 60),
                entry(BOOT_PARTITION_TYPE, 4, 61, 63),
            ],
            8,
        );
        disk
    }

    #[test]
    fn test_boot_partition_type_guid() {
        assert_eq!(
            BOOT_PARTITION_TYPE.to_string(),
            "21686148-6449-6E6F-744E-656564454649"
        );
    }

    #[test]
    fn test_read_and_validate() {
        let mut disk = sample_disk();
        let mut gpt = Gpt::read_header(&mut disk).unwrap();
        assert_eq!(gpt.num_partitions(), 8);
        gpt.validate_partition_entries().unwrap();

        let (index, e) = gpt.find_boot_partition(0).unwrap();
        assert_eq!(index, 1);
        assert_eq!(e.first_lba.get(), 34);
        assert_eq!(e.name_chars().collect::<String>(), "part");
        let (index, _) = gpt.find_boot_partition(2).unwrap();
        assert_eq!(index, 3);
        assert_eq!(gpt.find_boot_partition(4).err(), Some(HssError::PartitionNotFound));

        let unique = Guid::from_fields(3, 0, 0, [3; 8]);
        assert_eq!(gpt.find_partition_by_unique_id(&unique, 0).unwrap().0, 2);
        assert_eq!(gpt.partition_first_lba(2).unwrap(), 51);
    }

    #[test]
    fn test_boot_partition_selection() {
        let mut disk = sample_disk();
        let mut gpt = Gpt::read_header(&mut disk).unwrap();
        assert_eq!(gpt.boot_partition_index(), Ok(1));
        gpt.set_boot_partition_index(3);
        assert_eq!(gpt.boot_partition_index(), Ok(3));
    }

    #[test]
    fn test_entry_straddling_blocks() {
        // 136-byte entries: entry 3 spans LBA 2 and LBA 3.
        let mut disk = RamDisk::new(GPT_LBA_SIZE, 16);
        let mut array = vec![0u8; 4 * 136];
        let e = entry(BOOT_PARTITION_TYPE, 9, 7, 8);
        array[3 * 136..3 * 136 + 128].copy_from_slice(e.as_bytes());
        disk.data[2 * GPT_LBA_SIZE..2 * GPT_LBA_SIZE + array.len()].copy_from_slice(&array);

        let mut header = GptHeader::new_zeroed();
        header.signature = GPT_SIGNATURE;
        header.revision = U32::new(GPT_REVISION);
        header.header_size = U32::new(92);
        header.current_lba = U64::new(1);
        header.partition_entries_lba = U64::new(2);
        header.num_partitions = U32::new(4);
        header.partition_entry_size = U32::new(136);
        header.partition_entries_crc32 = U32::new(CRC32.checksum(&array));
        header.header_crc32 = U32::new(CRC32.checksum(header.as_bytes()));
        disk.data[GPT_LBA_SIZE..GPT_LBA_SIZE + 92].copy_from_slice(header.as_bytes());

        let mut gpt = Gpt::read_header(&mut disk).unwrap();
        gpt.validate_partition_entries().unwrap();
        assert_eq!(gpt.find_boot_partition(0).unwrap().0, 3);
    }

    #[test]
    fn test_header_errors() {
        let mut disk = sample_disk();
        disk.data[GPT_LBA_SIZE + 16] ^= 1;
        assert_eq!(Gpt::read_header(&mut disk).err(), Some(HssError::GptBadHeaderCrc));

        let mut disk = sample_disk();
        disk.data[GPT_LBA_SIZE] = b'X';
        assert_eq!(Gpt::read_header(&mut disk).err(), Some(HssError::GptBadSignature));

        let mut disk = sample_disk();
        disk.data[GPT_LBA_SIZE + 8] = 0;
        disk.data[GPT_LBA_SIZE + 10] = 2;
        assert_eq!(Gpt::read_header(&mut disk).err(), Some(HssError::GptBadRevision));
    }

    #[test]
    fn test_corrupt_entry_array() {
        let mut disk = sample_disk();
        disk.data[2 * GPT_LBA_SIZE + 40] ^= 0xff;
        let mut gpt = Gpt::read_header(&mut disk).unwrap();
        assert_eq!(gpt.validate_partition_entries(), Err(HssError::GptBadEntriesCrc));
    }
}
