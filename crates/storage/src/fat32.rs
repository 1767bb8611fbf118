//! Minimal read-only FAT32 reader.
//!
//! Supports exactly what the player needs: 512-byte sectors, an optional
//! MBR with one interesting partition, a root-directory-only 8.3 lookup,
//! and forward cluster-chain walks. No long filenames, no writes.
//!
//! # On-disk layout recap
//!
//! | Field | Offset | Size |
//! |---|---|---|
//! | bytes_per_sector | 11 | u16 LE |
//! | sectors_per_cluster | 13 | u8 |
//! | reserved_sectors | 14 | u16 LE |
//! | num_fats | 16 | u8 |
//! | total_sectors | 32 | u32 LE |
//! | sectors_per_fat | 36 | u32 LE |
//! | root_cluster | 44 | u32 LE |
//!
//! `fat_start = partition_lba + reserved_sectors`;
//! `data_start = fat_start + num_fats * sectors_per_fat`.

use platform::block::{Block, BlockDevice, BlockError, BLOCK_SIZE};

/// Boot-sector signature bytes at offsets 510..512.
const BOOT_SIGNATURE: [u8; 2] = [0x55, 0xAA];

/// Offset of the first MBR partition entry's starting-LBA field.
const MBR_PARTITION_LBA_OFFSET: usize = 0x1BE + 8;

/// Directory entry attribute mask for long-name fragments.
const ATTR_LONG_NAME: u8 = 0x0F;

/// Bytes in one directory entry.
const DIR_ENTRY_SIZE: usize = 32;

/// Length of an 8.3 name rendered in directory-entry form (no dot).
pub const SHORT_NAME_LEN: usize = 11;

/// FAT32 end-of-chain threshold (after masking to 28 bits).
const END_OF_CHAIN_MIN: u32 = 0x0FFF_FFF8;

/// Storage-layer failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum FsError {
    /// Caller error at an API boundary (bad index, bad buffer length).
    InvalidParam,
    /// The block device failed; see [`BlockError`].
    Read(BlockError),
    /// The volume failed validation (bad signature, unsupported geometry).
    Invalid,
    /// The requested name is not present in the root directory.
    NotFound,
    /// The FAT cluster chain is inconsistent with the file size.
    Corrupt,
}

impl From<BlockError> for FsError {
    fn from(e: BlockError) -> Self {
        Self::Read(e)
    }
}

impl core::fmt::Display for FsError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::InvalidParam => write!(f, "invalid parameter"),
            Self::Read(e) => write!(f, "read failed: {e}"),
            Self::Invalid => write!(f, "not a usable FAT32 volume"),
            Self::NotFound => write!(f, "file not found"),
            Self::Corrupt => write!(f, "corrupt cluster chain"),
        }
    }
}

/// Result of a root-directory lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct FileInfo {
    /// First cluster of the file's chain.
    pub first_cluster: u32,
    /// File size in bytes.
    pub size: u32,
    /// Raw attribute byte from the directory entry.
    pub attributes: u8,
}

/// Parsed BPB plus the derived absolute sector addresses.
#[derive(Debug, Clone, Copy)]
struct Geometry {
    sectors_per_cluster: u8,
    root_cluster: u32,
    fat_start_sector: u32,
    data_start_sector: u32,
}

/// A mounted FAT32 volume.
///
/// Owns the block device and a single sector scratch buffer; existence of a
/// value implies a successful mount. The scratch buffer is exclusive to the
/// foreground: every unaligned or partial read goes through it.
pub struct Fat32Volume<B: BlockDevice> {
    dev: B,
    geom: Geometry,
    scratch: Block,
}

fn read_u16(buf: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([buf[offset], buf[offset + 1]])
}

fn read_u32(buf: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([
        buf[offset],
        buf[offset + 1],
        buf[offset + 2],
        buf[offset + 3],
    ])
}

fn has_boot_signature(sector: &Block) -> bool {
    sector[510] == BOOT_SIGNATURE[0] && sector[511] == BOOT_SIGNATURE[1]
}

/// True when `cluster` terminates a chain.
///
/// Values below 2 are reserved/free and also treated as terminators so a
/// zeroed FAT entry cannot send a walk into the reserved area.
pub fn end_of_chain(cluster: u32) -> bool {
    cluster < 2 || cluster >= END_OF_CHAIN_MIN
}

/// Render `input` as a space-padded 11-byte 8.3 directory name.
///
/// Uppercases, copies at most 8 name characters (stopping at the first
/// `.`), then at most 3 extension characters after the dot. Idempotent on
/// input that is already in canonical form.
pub fn short_name(input: &str) -> [u8; SHORT_NAME_LEN] {
    let mut out = [b' '; SHORT_NAME_LEN];
    let mut bytes = input.bytes();

    let mut o = 0;
    let mut pending_ext = false;
    for b in bytes.by_ref() {
        if b == b'.' {
            pending_ext = true;
            break;
        }
        if o < 8 {
            out[o] = b.to_ascii_uppercase();
            o += 1;
        }
    }
    if !pending_ext {
        // Name longer than 8 with no dot: everything after the 8th char and
        // before a later dot is discarded, matching directory-entry rendering.
        return out;
    }

    let mut o = 8;
    for b in bytes {
        if o >= SHORT_NAME_LEN {
            break;
        }
        out[o] = b.to_ascii_uppercase();
        o += 1;
    }
    out
}

impl<B: BlockDevice> Fat32Volume<B> {
    /// Mount the volume on `dev`.
    ///
    /// Reads LBA 0, accepts either an MBR (first partition's LBA taken from
    /// the partition table) or a partitionless "super-floppy" layout, then
    /// validates the volume boot record. Rejects anything that is not
    /// FAT32 with 512-byte sectors.
    pub fn mount(mut dev: B) -> Result<Self, FsError> {
        let mut scratch = [0u8; BLOCK_SIZE];

        dev.read_block(0, &mut scratch)?;
        if !has_boot_signature(&scratch) {
            return Err(FsError::Invalid);
        }

        // A zero partition LBA means sector 0 already is the boot record.
        let partition_lba = read_u32(&scratch, MBR_PARTITION_LBA_OFFSET);
        if partition_lba != 0 {
            dev.read_block(partition_lba, &mut scratch)?;
            if !has_boot_signature(&scratch) {
                return Err(FsError::Invalid);
            }
        }

        let bytes_per_sector = read_u16(&scratch, 11);
        let sectors_per_cluster = scratch[13];
        let reserved_sectors = read_u16(&scratch, 14);
        let num_fats = scratch[16];
        let sectors_per_fat = read_u32(&scratch, 36);
        let root_cluster = read_u32(&scratch, 44);

        if bytes_per_sector as usize != BLOCK_SIZE
            || sectors_per_cluster == 0
            || num_fats == 0
        {
            return Err(FsError::Invalid);
        }

        let fat_start_sector = partition_lba + u32::from(reserved_sectors);
        let data_start_sector =
            fat_start_sector + u32::from(num_fats) * sectors_per_fat;

        Ok(Self {
            dev,
            geom: Geometry {
                sectors_per_cluster,
                root_cluster,
                fat_start_sector,
                data_start_sector,
            },
            scratch,
        })
    }

    /// Give the block device back (unmount).
    pub fn into_device(self) -> B {
        self.dev
    }

    /// Borrow the underlying block device (test instrumentation).
    #[cfg(any(test, feature = "std"))]
    pub fn device_ref(&self) -> &B {
        &self.dev
    }

    /// Mutably borrow the underlying block device (test instrumentation).
    #[cfg(any(test, feature = "std"))]
    pub fn device_mut(&mut self) -> &mut B {
        &mut self.dev
    }

    /// Cluster size in bytes.
    pub fn cluster_size(&self) -> u32 {
        u32::from(self.geom.sectors_per_cluster) * BLOCK_SIZE as u32
    }

    /// First absolute sector of `cluster`. Defined only for `cluster >= 2`.
    pub fn cluster_to_sector(&self, cluster: u32) -> u32 {
        debug_assert!(cluster >= 2);
        self.geom.data_start_sector
            + (cluster - 2) * u32::from(self.geom.sectors_per_cluster)
    }

    /// Follow the FAT to the cluster after `cluster`.
    ///
    /// The returned value is masked to 28 bits; check it with
    /// [`end_of_chain`] before using it.
    pub fn next_cluster(&mut self, cluster: u32) -> Result<u32, FsError> {
        if cluster < 2 {
            return Err(FsError::InvalidParam);
        }
        let fat_offset = cluster * 4;
        let fat_sector = self.geom.fat_start_sector + fat_offset / BLOCK_SIZE as u32;
        let entry_offset = (fat_offset % BLOCK_SIZE as u32) as usize;

        self.dev.read_block(fat_sector, &mut self.scratch)?;
        Ok(read_u32(&self.scratch, entry_offset) & 0x0FFF_FFFF)
    }

    /// Look up `filename` (8.3 form, e.g. `"BADAPPLE.BIN"`) in the root
    /// directory.
    ///
    /// Walks the root cluster chain entry by entry; an `0x00` lead byte
    /// terminates the directory.
    pub fn find_file(&mut self, filename: &str) -> Result<FileInfo, FsError> {
        let wanted = short_name(filename);
        let mut cluster = self.geom.root_cluster;

        while !end_of_chain(cluster) {
            let first_sector = self.cluster_to_sector(cluster);

            for s in 0..u32::from(self.geom.sectors_per_cluster) {
                self.dev.read_block(first_sector + s, &mut self.scratch)?;

                for e in 0..BLOCK_SIZE / DIR_ENTRY_SIZE {
                    let entry = &self.scratch[e * DIR_ENTRY_SIZE..(e + 1) * DIR_ENTRY_SIZE];

                    match entry[0] {
                        0x00 => return Err(FsError::NotFound),
                        0xE5 => continue,
                        _ => {}
                    }
                    if (entry[11] & ATTR_LONG_NAME) == ATTR_LONG_NAME {
                        continue;
                    }
                    if entry[..SHORT_NAME_LEN] == wanted {
                        let first_cluster = (u32::from(read_u16(entry, 20)) << 16)
                            | u32::from(read_u16(entry, 26));
                        return Ok(FileInfo {
                            first_cluster,
                            size: read_u32(entry, 28),
                            attributes: entry[11],
                        });
                    }
                }
            }

            cluster = self.next_cluster(cluster)?;
        }

        Err(FsError::NotFound)
    }

    /// Load `lba` into the volume scratch buffer and return it.
    pub(crate) fn sector(&mut self, lba: u32) -> Result<&Block, FsError> {
        self.dev.read_block(lba, &mut self.scratch)?;
        Ok(&self.scratch)
    }

    /// Read whole blocks straight into `buf` (the contiguous fast path).
    pub(crate) fn read_blocks_into(
        &mut self,
        lba: u32,
        buf: &mut [u8],
    ) -> Result<(), FsError> {
        if buf.len() == BLOCK_SIZE {
            // Single block: the simpler command is cheaper on SPI cards.
            let block: &mut Block = buf.try_into().map_err(|_| FsError::InvalidParam)?;
            self.dev.read_block(lba, block)?;
        } else {
            self.dev.read_blocks(lba, buf)?;
        }
        Ok(())
    }
}
