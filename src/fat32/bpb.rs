//! BIOS Parameter Block.

use std::io;

/// Largest cluster size considered portable.
const MAX_PORTABLE_CLUSTER_BYTES: u32 = 32 * 1024;

/// FAT32 volume parameters out of the partition's first sector.
#[derive(Debug, Clone)]
pub struct BiosParameterBlock {
    pub bytes_per_sector: u16,
    pub sectors_per_cluster: u8,
    pub reserved_sectors: u16,
    pub num_fats: u8,
    /// Must be 0 on FAT32; nonzero values are diagnosed, not rejected.
    pub root_entry_count: u16,
    pub total_sectors_32: u32,
    /// Sectors per FAT.
    pub fat_size_32: u32,
    pub root_cluster: u32,
}

/// FAT flavor by cluster count. Diagnostic only; this crate reads FAT32.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum FatKind {
    Fat12,
    Fat16,
    Fat32,
}

impl BiosParameterBlock {
    pub fn parse(sector: &[u8]) -> io::Result<BiosParameterBlock> {
        if sector.len() < 48 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("boot sector truncated at {} bytes", sector.len()),
            ));
        }
        let bpb = BiosParameterBlock {
            bytes_per_sector: u16::from_le_bytes(sector[11..13].try_into().unwrap()),
            sectors_per_cluster: sector[13],
            reserved_sectors: u16::from_le_bytes(sector[14..16].try_into().unwrap()),
            num_fats: sector[16],
            root_entry_count: u16::from_le_bytes(sector[17..19].try_into().unwrap()),
            total_sectors_32: u32::from_le_bytes(sector[32..36].try_into().unwrap()),
            fat_size_32: u32::from_le_bytes(sector[36..40].try_into().unwrap()),
            root_cluster: u32::from_le_bytes(sector[44..48].try_into().unwrap()),
        };
        if bpb.bytes_per_sector == 0 || bpb.sectors_per_cluster == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "boot sector reports zero-sized sectors or clusters",
            ));
        }
        Ok(bpb)
    }

    /// First sector of the data region, relative to the volume start.
    pub fn first_data_sector(&self) -> u32 {
        let root_dir_sectors = (u32::from(self.root_entry_count) * 32)
            .div_ceil(u32::from(self.bytes_per_sector));
        u32::from(self.reserved_sectors)
            + u32::from(self.num_fats) * self.fat_size_32
            + root_dir_sectors
    }

    /// First sector of the (first) FAT, relative to the volume start.
    pub fn fat_start_sector(&self) -> u32 {
        u32::from(self.reserved_sectors)
    }

    /// First sector of `cluster`, relative to the volume start.
    pub fn first_sector_of_cluster(&self, cluster: u32) -> u32 {
        (cluster - 2) * u32::from(self.sectors_per_cluster) + self.first_data_sector()
    }

    pub fn cluster_bytes(&self) -> usize {
        usize::from(self.bytes_per_sector) * usize::from(self.sectors_per_cluster)
    }

    /// Classifies by cluster count. Can misreport on odd geometry; used for
    /// warnings only.
    pub fn classify(&self) -> FatKind {
        let clusters = (i64::from(self.fat_size_32) - i64::from(self.first_data_sector()))
            / i64::from(self.sectors_per_cluster);
        if clusters < 4085 {
            FatKind::Fat12
        } else if clusters < 65525 {
            FatKind::Fat16
        } else {
            FatKind::Fat32
        }
    }

    pub(crate) fn log_diagnostics(&self) {
        let kind = self.classify();
        if kind != FatKind::Fat32 {
            log::warn!("fat32: volume classifies as {kind:?}, reading it as FAT32 regardless");
        }
        if self.root_entry_count != 0 {
            log::warn!(
                "fat32: root entry count {} should be 0 on FAT32",
                self.root_entry_count
            );
        }
        if !matches!(self.bytes_per_sector, 512 | 1024 | 2048 | 4096) {
            log::warn!("fat32: unusual sector size {}", self.bytes_per_sector);
        }
        if self.bytes_per_sector != 512 {
            log::warn!(
                "fat32: sector size {} over 512-byte block reads; sector addressing assumes 512",
                self.bytes_per_sector
            );
        }
        if !self.sectors_per_cluster.is_power_of_two() {
            log::warn!(
                "fat32: sectors per cluster {} is not a power of two",
                self.sectors_per_cluster
            );
        }
        if self.cluster_bytes() as u32 > MAX_PORTABLE_CLUSTER_BYTES {
            log::warn!(
                "fat32: cluster size {} bytes exceeds the portable maximum {}",
                self.cluster_bytes(),
                MAX_PORTABLE_CLUSTER_BYTES
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn boot_sector(
        bytes_per_sector: u16,
        sectors_per_cluster: u8,
        reserved: u16,
        num_fats: u8,
        fat_size: u32,
        root_cluster: u32,
    ) -> Vec<u8> {
        let mut sector = vec![0u8; 512];
        sector[11..13].copy_from_slice(&bytes_per_sector.to_le_bytes());
        sector[13] = sectors_per_cluster;
        sector[14..16].copy_from_slice(&reserved.to_le_bytes());
        sector[16] = num_fats;
        sector[32..36].copy_from_slice(&0x4000u32.to_le_bytes());
        sector[36..40].copy_from_slice(&fat_size.to_le_bytes());
        sector[44..48].copy_from_slice(&root_cluster.to_le_bytes());
        sector[510] = 0x55;
        sector[511] = 0xAA;
        sector
    }

    #[test]
    fn derives_data_region_layout() {
        // 32 reserved sectors and two FATs of n sectors each
        for n in [16u32, 100, 3797] {
            let bpb = BiosParameterBlock::parse(&boot_sector(512, 8, 32, 2, n, 2)).unwrap();
            assert_eq!(32 + 2 * n, bpb.first_data_sector());
            assert_eq!(bpb.first_data_sector(), bpb.first_sector_of_cluster(2));
            assert_eq!(32, bpb.fat_start_sector());
        }
    }

    #[test]
    fn cluster_sectors_advance_by_cluster_size() {
        let bpb = BiosParameterBlock::parse(&boot_sector(512, 8, 32, 2, 100, 2)).unwrap();
        assert_eq!(
            bpb.first_sector_of_cluster(2) + 8,
            bpb.first_sector_of_cluster(3)
        );
        assert_eq!(4096, bpb.cluster_bytes());
    }

    #[test]
    fn rejects_zeroed_boot_sector() {
        assert!(BiosParameterBlock::parse(&[0u8; 512]).is_err());
        assert!(BiosParameterBlock::parse(&[0u8; 32]).is_err());
    }
}
