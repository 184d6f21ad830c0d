//! Master Boot Record partition table.

use crate::card::BlockRead;
use crate::error::Result;
use std::fmt;

/// Byte offset of the partition table inside sector 0.
const PARTITION_TABLE_OFFSET: usize = 446;
const PARTITION_ENTRY_LEN: usize = 16;
const PARTITION_COUNT: usize = 4;
/// Boot signature at offset 510, little-endian 0xAA55.
const BOOT_SIGNATURE: [u8; 2] = [0x55, 0xAA];

/* partition type codes */
const TYPE_FAT32_CHS: u8 = 0x0B;
const TYPE_FAT32_LBA: u8 = 0x0C;
const TYPE_NTFS_EXFAT: u8 = 0x07;
const TYPE_LINUX: u8 = 0x83;
const TYPE_EXTENDED_CHS: u8 = 0x05;
const TYPE_EXTENDED_LBA: u8 = 0x0F;

/// File system tag derived from the partition type code.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum FileSystemKind {
    Fat32,
    /// 0x07 is shared by NTFS and exFAT; reading the volume would disambiguate.
    NtfsExfat,
    Linux,
    Extended,
    Unknown,
}

impl fmt::Display for FileSystemKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            FileSystemKind::Fat32 => "FAT32",
            FileSystemKind::NtfsExfat => "NTFS/exFAT",
            FileSystemKind::Linux => "Linux",
            FileSystemKind::Extended => "extended",
            FileSystemKind::Unknown => "unknown",
        })
    }
}

/// One populated slot of the partition table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionInfo {
    /// First sector of the partition.
    pub start_lba: u32,
    /// Length in sectors.
    pub length: u32,
    pub kind: FileSystemKind,
    /// Raw type code the tag was derived from.
    pub type_code: u8,
}

/// Reads sector 0 off `device` and returns the populated partitions in table
/// order. Empty (type 0) slots are skipped.
pub fn read_partitions<D: BlockRead>(device: &D) -> Result<Vec<PartitionInfo>> {
    let sector = device.read_blocks(0, 1)?;
    Ok(parse_partition_table(&sector))
}

pub(crate) fn parse_partition_table(sector: &[u8]) -> Vec<PartitionInfo> {
    match sector.get(510..512) {
        Some(signature) if signature == BOOT_SIGNATURE => {}
        _ => log::warn!("mbr: boot signature 0x55AA missing, parsing anyway"),
    }

    let mut partitions = Vec::new();
    for index in 0..PARTITION_COUNT {
        let offset = PARTITION_TABLE_OFFSET + index * PARTITION_ENTRY_LEN;
        let Some(entry) = sector.get(offset..offset + PARTITION_ENTRY_LEN) else {
            break;
        };
        let type_code = entry[4];
        if type_code == 0 {
            continue;
        }
        let partition = PartitionInfo {
            start_lba: u32::from_le_bytes(entry[8..12].try_into().unwrap()),
            length: u32::from_le_bytes(entry[12..16].try_into().unwrap()),
            kind: detect_file_system(type_code),
            type_code,
        };
        log::debug!(
            "mbr: partition {index}: {} at lba {} ({} sectors)",
            partition.kind,
            partition.start_lba,
            partition.length
        );
        partitions.push(partition);
    }
    partitions
}

fn detect_file_system(type_code: u8) -> FileSystemKind {
    match type_code {
        TYPE_FAT32_CHS | TYPE_FAT32_LBA => FileSystemKind::Fat32,
        TYPE_NTFS_EXFAT => FileSystemKind::NtfsExfat,
        TYPE_LINUX => FileSystemKind::Linux,
        TYPE_EXTENDED_CHS | TYPE_EXTENDED_LBA => FileSystemKind::Extended,
        _ => FileSystemKind::Unknown,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sector_with_entries(entries: &[(u8, u32, u32)]) -> Vec<u8> {
        let mut sector = vec![0u8; 512];
        sector[510..].copy_from_slice(&BOOT_SIGNATURE);
        for (index, &(type_code, start, length)) in entries.iter().enumerate() {
            let offset = PARTITION_TABLE_OFFSET + index * PARTITION_ENTRY_LEN;
            sector[offset + 4] = type_code;
            sector[offset + 8..offset + 12].copy_from_slice(&start.to_le_bytes());
            sector[offset + 12..offset + 16].copy_from_slice(&length.to_le_bytes());
        }
        sector
    }

    #[test]
    fn parses_single_fat32_partition() {
        let sector = sector_with_entries(&[(0x0C, 2048, 8192)]);
        let partitions = parse_partition_table(&sector);
        assert_eq!(
            vec![PartitionInfo {
                start_lba: 2048,
                length: 8192,
                kind: FileSystemKind::Fat32,
                type_code: 0x0C,
            }],
            partitions
        );
    }

    #[test]
    fn skips_empty_slots_preserving_order() {
        let sector = sector_with_entries(&[
            (0x0B, 64, 100),
            (0x00, 0, 0),
            (0x07, 256, 100),
            (0x83, 512, 100),
        ]);
        let partitions = parse_partition_table(&sector);
        assert_eq!(3, partitions.len());
        assert_eq!(FileSystemKind::Fat32, partitions[0].kind);
        assert_eq!(FileSystemKind::NtfsExfat, partitions[1].kind);
        assert_eq!(FileSystemKind::Linux, partitions[2].kind);
        assert_eq!(64, partitions[0].start_lba);
        assert_eq!(256, partitions[1].start_lba);
    }

    #[test]
    fn tags_extended_and_unknown_types() {
        let sector = sector_with_entries(&[(0x05, 1, 1), (0x0F, 2, 1), (0xEE, 3, 1)]);
        let kinds: Vec<_> = parse_partition_table(&sector)
            .into_iter()
            .map(|p| p.kind)
            .collect();
        assert_eq!(
            vec![
                FileSystemKind::Extended,
                FileSystemKind::Extended,
                FileSystemKind::Unknown
            ],
            kinds
        );
    }

    #[test]
    fn tolerates_missing_boot_signature() {
        let mut sector = sector_with_entries(&[(0x0C, 2048, 8192)]);
        sector[510] = 0;
        sector[511] = 0;
        assert_eq!(1, parse_partition_table(&sector).len());
    }
}
