//! In-memory FAT32 image builder for tests.
//!
//! Produces a byte image suitable for `platform::mocks::MockBlockDevice`:
//! an optional MBR, a volume boot record, `num_fats` FAT copies, a root
//! directory and file payloads laid out on explicit cluster chains. Only
//! what the reader consumes is populated; everything else stays zero.

#![cfg(any(test, feature = "std"))]
#![allow(clippy::unwrap_used)]
#![allow(clippy::panic)]

use platform::block::BLOCK_SIZE;

const DIR_ENTRY_SIZE: usize = 32;
const END_OF_CHAIN: u32 = 0x0FFF_FFFF;

struct PlannedFile {
    name: [u8; 11],
    chain: Vec<u32>,
    data: Vec<u8>,
}

enum DirFiller {
    Deleted,
    LongName,
    File(usize),
}

/// Builder for a minimal FAT32 volume image.
///
/// Defaults are sized for fast tests (one sector per cluster, tiny FAT);
/// every knob the mount path parses can be overridden.
pub struct FatImageBuilder {
    partition_lba: u32,
    sectors_per_cluster: u8,
    reserved_sectors: u16,
    num_fats: u8,
    sectors_per_fat: u32,
    root_cluster: u32,
    files: Vec<PlannedFile>,
    dir_order: Vec<DirFiller>,
}

impl Default for FatImageBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl FatImageBuilder {
    /// Builder with small-volume defaults.
    pub fn new() -> Self {
        Self {
            partition_lba: 64,
            sectors_per_cluster: 1,
            reserved_sectors: 4,
            num_fats: 2,
            sectors_per_fat: 8,
            root_cluster: 2,
            files: Vec::new(),
            dir_order: Vec::new(),
        }
    }

    /// Partition start LBA. `0` builds a super-floppy (no MBR).
    pub fn partition_lba(mut self, lba: u32) -> Self {
        self.partition_lba = lba;
        self
    }

    /// Sectors per cluster.
    pub fn sectors_per_cluster(mut self, spc: u8) -> Self {
        self.sectors_per_cluster = spc;
        self
    }

    /// Reserved sectors before the first FAT.
    pub fn reserved_sectors(mut self, reserved: u16) -> Self {
        self.reserved_sectors = reserved;
        self
    }

    /// Sectors per FAT copy.
    pub fn sectors_per_fat(mut self, spf: u32) -> Self {
        self.sectors_per_fat = spf;
        self
    }

    /// Add a file on a contiguous chain starting at `first_cluster`.
    pub fn add_file(self, name: &str, first_cluster: u32, data: &[u8]) -> Self {
        let cluster_bytes = self.cluster_bytes();
        let clusters = data.len().div_ceil(cluster_bytes).max(1);
        let chain: Vec<u32> =
            (first_cluster..first_cluster + clusters as u32).collect();
        self.add_file_with_chain(name, &chain, data)
    }

    /// Add a file on an explicit cluster chain.
    ///
    /// The chain must provide enough clusters for `data`.
    pub fn add_file_with_chain(mut self, name: &str, chain: &[u32], data: &[u8]) -> Self {
        assert!(!chain.is_empty());
        assert!(
            chain.len() * self.cluster_bytes() >= data.len(),
            "chain too short for file data"
        );
        for &c in chain {
            assert!(c >= 3, "file clusters must not collide with the root directory");
        }
        self.files.push(PlannedFile {
            name: crate::fat32::short_name(name),
            chain: chain.to_vec(),
            data: data.to_vec(),
        });
        self.dir_order.push(DirFiller::File(self.files.len() - 1));
        self
    }

    /// Insert a deleted (0xE5) directory entry before later files.
    pub fn add_deleted_entry(mut self) -> Self {
        self.dir_order.push(DirFiller::Deleted);
        self
    }

    /// Insert a long-filename fragment entry before later files.
    pub fn add_long_name_entry(mut self) -> Self {
        self.dir_order.push(DirFiller::LongName);
        self
    }

    fn cluster_bytes(&self) -> usize {
        self.sectors_per_cluster as usize * BLOCK_SIZE
    }

    fn fat_start(&self) -> u32 {
        self.partition_lba + u32::from(self.reserved_sectors)
    }

    fn data_start(&self) -> u32 {
        self.fat_start() + u32::from(self.num_fats) * self.sectors_per_fat
    }

    fn cluster_to_sector(&self, cluster: u32) -> u32 {
        self.data_start() + (cluster - 2) * u32::from(self.sectors_per_cluster)
    }

    /// Build the image.
    pub fn build(self) -> Vec<u8> {
        let max_cluster = self
            .files
            .iter()
            .flat_map(|f| f.chain.iter().copied())
            .chain([self.root_cluster])
            .max()
            .unwrap_or(self.root_cluster);

        // Every FAT entry we write must fit inside one FAT copy.
        assert!(
            (max_cluster + 1) * 4 <= self.sectors_per_fat * BLOCK_SIZE as u32,
            "sectors_per_fat too small for highest cluster"
        );

        let total_sectors =
            self.cluster_to_sector(max_cluster) + u32::from(self.sectors_per_cluster);
        let mut image = vec![0u8; total_sectors as usize * BLOCK_SIZE];

        if self.partition_lba != 0 {
            self.write_mbr(&mut image, total_sectors);
        }
        self.write_vbr(&mut image, total_sectors);
        self.write_fats(&mut image, max_cluster);
        self.write_root_dir(&mut image);
        self.write_file_data(&mut image);

        image
    }

    fn write_mbr(&self, image: &mut [u8], total_sectors: u32) {
        let entry = 0x1BE;
        image[entry + 4] = 0x0C; // FAT32 LBA partition type
        image[entry + 8..entry + 12].copy_from_slice(&self.partition_lba.to_le_bytes());
        image[entry + 12..entry + 16]
            .copy_from_slice(&(total_sectors - self.partition_lba).to_le_bytes());
        image[510] = 0x55;
        image[511] = 0xAA;
    }

    fn write_vbr(&self, image: &mut [u8], total_sectors: u32) {
        let base = self.partition_lba as usize * BLOCK_SIZE;
        let vbr = &mut image[base..base + BLOCK_SIZE];

        vbr[11..13].copy_from_slice(&(BLOCK_SIZE as u16).to_le_bytes());
        vbr[13] = self.sectors_per_cluster;
        vbr[14..16].copy_from_slice(&self.reserved_sectors.to_le_bytes());
        vbr[16] = self.num_fats;
        vbr[32..36].copy_from_slice(&(total_sectors - self.partition_lba).to_le_bytes());
        vbr[36..40].copy_from_slice(&self.sectors_per_fat.to_le_bytes());
        vbr[44..48].copy_from_slice(&self.root_cluster.to_le_bytes());
        vbr[510] = 0x55;
        vbr[511] = 0xAA;
    }

    fn write_fats(&self, image: &mut [u8], max_cluster: u32) {
        let mut entries = vec![0u32; max_cluster as usize + 1];
        entries[0] = 0x0FFF_FFF8;
        entries[1] = END_OF_CHAIN;
        entries[self.root_cluster as usize] = END_OF_CHAIN;
        for file in &self.files {
            for pair in file.chain.windows(2) {
                entries[pair[0] as usize] = pair[1];
            }
            entries[*file.chain.last().unwrap() as usize] = END_OF_CHAIN;
        }

        for fat in 0..u32::from(self.num_fats) {
            let base =
                (self.fat_start() + fat * self.sectors_per_fat) as usize * BLOCK_SIZE;
            for (i, value) in entries.iter().enumerate() {
                image[base + i * 4..base + i * 4 + 4].copy_from_slice(&value.to_le_bytes());
            }
        }
    }

    fn write_root_dir(&self, image: &mut [u8]) {
        let base = self.cluster_to_sector(self.root_cluster) as usize * BLOCK_SIZE;
        for (slot, filler) in self.dir_order.iter().enumerate() {
            let entry = &mut image[base + slot * DIR_ENTRY_SIZE..][..DIR_ENTRY_SIZE];
            match filler {
                DirFiller::Deleted => {
                    entry[0] = 0xE5;
                    entry[11] = 0x20;
                }
                DirFiller::LongName => {
                    entry[0] = 0x41;
                    entry[11] = 0x0F;
                }
                DirFiller::File(idx) => {
                    let file = &self.files[*idx];
                    entry[..11].copy_from_slice(&file.name);
                    entry[11] = 0x20;
                    let first = file.chain[0];
                    entry[20..22].copy_from_slice(&((first >> 16) as u16).to_le_bytes());
                    entry[26..28].copy_from_slice(&(first as u16).to_le_bytes());
                    entry[28..32].copy_from_slice(&(file.data.len() as u32).to_le_bytes());
                }
            }
        }
    }

    fn write_file_data(&self, image: &mut [u8]) {
        let cluster_bytes = self.cluster_bytes();
        for file in &self.files {
            for (i, chunk) in file.data.chunks(cluster_bytes).enumerate() {
                let base = self.cluster_to_sector(file.chain[i]) as usize * BLOCK_SIZE;
                image[base..base + chunk.len()].copy_from_slice(chunk);
            }
        }
    }
}
