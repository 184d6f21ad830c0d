//! FAT32 volume reader over a [`BlockRead`] device.
//!
//! Every sector read is decomposed into batches the card protocol can carry
//! (at most 14 blocks per request) and offset by the partition start.

use crate::card::BlockRead;
use crate::error::{Error, Result};
use crate::mbr::{FileSystemKind, PartitionInfo};
use crate::proto::{BLOCK_SIZE, MAX_TRANSFER_BLOCKS};
use std::io;

mod bpb;
mod dirent;

pub use bpb::{BiosParameterBlock, FatKind};
pub use dirent::{DirEntry, Timestamp};

use dirent::{DirEntryParser, ParsedSlot, DIR_ENTRY_LEN};

/// Lowest cluster number that addresses data.
const FIRST_DATA_CLUSTER: u32 = 2;
/// FAT entries at or past this value terminate a chain.
const END_OF_CHAIN: u32 = 0x0FFF_FFF8;
/// FAT32 entries carry 28 significant bits.
const CLUSTER_MASK: u32 = 0x0FFF_FFFF;
const FAT_ENTRY_LEN: u32 = 4;

/// A mounted FAT32 partition.
///
/// The volume is the sole owner of the device it reads; directory and file
/// objects reference the volume through [`crate::fs::FileSystemAdapter`].
pub struct Fat32Volume<D> {
    device: D,
    start_lba: u32,
    bpb: BiosParameterBlock,
}

impl<D: BlockRead> Fat32Volume<D> {
    /// Reads and validates the BPB of `partition`.
    ///
    /// Fails with [`Error::UnsupportedFileSystem`] unless the partition is
    /// tagged FAT32; any other failure is the underlying read or a garbled
    /// boot sector.
    pub fn open(device: D, partition: &PartitionInfo) -> Result<Fat32Volume<D>> {
        if partition.kind != FileSystemKind::Fat32 {
            return Err(Error::UnsupportedFileSystem {
                found: partition.kind,
            });
        }

        let sector = device.read_blocks(partition.start_lba, 1)?;
        let bpb = BiosParameterBlock::parse(&sector)?;
        bpb.log_diagnostics();
        log::debug!(
            "fat32: volume at lba {}: {} byte sectors, {} per cluster, root cluster {}",
            partition.start_lba,
            bpb.bytes_per_sector,
            bpb.sectors_per_cluster,
            bpb.root_cluster
        );

        Ok(Fat32Volume {
            device,
            start_lba: partition.start_lba,
            bpb,
        })
    }

    pub fn bpb(&self) -> &BiosParameterBlock {
        &self.bpb
    }

    /// Lists the directory at `path` (segments separated by `/`, matched
    /// case-insensitively against the root).
    pub fn list_folder(&self, path: &str) -> Result<Vec<DirEntry>> {
        let path = path.to_ascii_uppercase();
        let mut cluster = self.bpb.root_cluster;
        for segment in path.split('/').filter(|s| !s.is_empty()) {
            let entries = self.list_chain(cluster)?;
            let next = entries
                .iter()
                .find(|e| e.is_directory && names_equal(&e.name, segment))
                .ok_or_else(|| Error::DirectoryNotFound(segment.to_string()))?;
            cluster = next.first_cluster;
        }
        self.list_chain(cluster)
    }

    /// Lists an already-resolved directory entry.
    pub fn list_entry(&self, entry: &DirEntry) -> Result<Vec<DirEntry>> {
        self.list_chain(entry.first_cluster)
    }

    /// Collects the file content behind `entry`: exactly `entry.size` bytes,
    /// gathered cluster by cluster along the FAT chain.
    pub fn file_content(&self, entry: &DirEntry) -> Result<Vec<u8>> {
        let mut remaining = entry.size as usize;
        let mut content = Vec::with_capacity(remaining);
        let mut cluster = entry.first_cluster;

        while chain_continues(cluster) && remaining > 0 {
            let data = self.read_cluster(cluster)?;
            let take = remaining.min(data.len());
            content.extend_from_slice(&data[..take]);
            remaining -= take;
            if remaining == 0 {
                break;
            }
            cluster = self.next_cluster(cluster)?;
        }

        Ok(content)
    }

    /// Walks the directory at `first_cluster` across its whole FAT chain.
    fn list_chain(&self, first_cluster: u32) -> Result<Vec<DirEntry>> {
        let mut entries = Vec::new();
        let mut parser = DirEntryParser::new();
        let mut cluster = first_cluster;

        'chain: while chain_continues(cluster) {
            let data = self.read_cluster(cluster)?;
            for raw in data.chunks_exact(DIR_ENTRY_LEN) {
                match parser.feed(raw) {
                    ParsedSlot::End => break 'chain,
                    ParsedSlot::Incomplete => {}
                    ParsedSlot::Entry(entry) => entries.push(entry),
                }
            }
            cluster = self.next_cluster(cluster)?;
        }

        Ok(entries)
    }

    fn read_cluster(&self, cluster: u32) -> Result<Vec<u8>> {
        self.read_sectors(
            self.bpb.first_sector_of_cluster(cluster),
            u32::from(self.bpb.sectors_per_cluster),
        )
    }

    /// Looks up the FAT entry of `cluster` in the first FAT.
    fn next_cluster(&self, cluster: u32) -> Result<u32> {
        let fat_offset = u64::from(cluster) * u64::from(FAT_ENTRY_LEN);
        let sector_size = u64::from(self.bpb.bytes_per_sector);
        let fat_sector = (fat_offset / sector_size) as u32;
        let within = (fat_offset % sector_size) as usize;

        let data = self.read_sectors(self.bpb.fat_start_sector() + fat_sector, 1)?;
        let entry = data
            .get(within..within + 4)
            .ok_or_else(|| short_read(self.bpb.fat_start_sector() + fat_sector, data.len()))?;
        Ok(u32::from_le_bytes(entry.try_into().unwrap()) & CLUSTER_MASK)
    }

    /// Reads `count` sectors at `sector` (relative to the volume) in batches
    /// of at most [`MAX_TRANSFER_BLOCKS`], concatenated in order.
    fn read_sectors(&self, sector: u32, count: u32) -> Result<Vec<u8>> {
        let mut data = Vec::with_capacity(count as usize * BLOCK_SIZE);
        let mut done = 0u32;
        while done < count {
            let batch = (count - done).min(u32::from(MAX_TRANSFER_BLOCKS)) as u16;
            let chunk = self
                .device
                .read_blocks(self.start_lba + sector + done, batch)?;
            data.extend_from_slice(&chunk);
            done += u32::from(batch);
        }
        Ok(data)
    }
}

/// Case-insensitive name comparison, ASCII only. FAT32 short names are
/// case-insensitive; long names are treated the same way here, so non-ASCII
/// code points compare exactly.
pub fn names_equal(a: &str, b: &str) -> bool {
    a.eq_ignore_ascii_case(b)
}

fn chain_continues(cluster: u32) -> bool {
    (FIRST_DATA_CLUSTER..END_OF_CHAIN).contains(&cluster)
}

fn short_read(sector: u32, got: usize) -> Error {
    Error::Io(io::Error::new(
        io::ErrorKind::UnexpectedEof,
        format!("short read at sector {sector}: {got} bytes"),
    ))
}
