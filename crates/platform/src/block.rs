//! Block device abstraction.
//!
//! The storage stack reads an SD card through this trait in 512-byte units.
//! The contract is deliberately synchronous: `read_block` returns only once
//! the buffer holds the full block, even when the implementation streams the
//! data with DMA behind the scenes.
//!
//! # Real-time contract
//!
//! Implementations are called from the playback foreground loop while audio
//! and display DMA are active on other peripherals. A single call must stay
//! far below the audio half-buffer period (2048 samples at 32 kHz = 64 ms),
//! which is why multi-block reads are capped at [`MAX_MULTIBLOCK_BLOCKS`]
//! (16 blocks ≈ a few milliseconds on a 10 MHz SPI bus).

/// Size of one logical block in bytes. FAT32 support is limited to
/// 512-byte sectors, so sectors and blocks are interchangeable here.
pub const BLOCK_SIZE: usize = 512;

/// Upper bound on a single contiguous multi-block read.
///
/// Bounds the time the foreground is stuck inside the block device and
/// unavailable to refill audio. 16 blocks = 8 KiB.
pub const MAX_MULTIBLOCK_BLOCKS: usize = 16;

/// One 512-byte block.
pub type Block = [u8; BLOCK_SIZE];

/// Block device failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum BlockError {
    /// No card responded during bring-up or the card dropped off the bus.
    NoCard,
    /// A bounded wait expired (command response, data token, DMA completion).
    Timeout,
    /// The device reported an error or returned a malformed response.
    Device,
}

impl core::fmt::Display for BlockError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::NoCard => write!(f, "no card present"),
            Self::Timeout => write!(f, "block device timeout"),
            Self::Device => write!(f, "block device error"),
        }
    }
}

/// Synchronous 512-byte block reader.
pub trait BlockDevice {
    /// Read the block at `lba` into `buf`.
    ///
    /// On `Ok(())` the buffer holds all 512 bytes. On error the buffer
    /// contents are unspecified.
    fn read_block(&mut self, lba: u32, buf: &mut Block) -> Result<(), BlockError>;

    /// Read `buf.len() / 512` consecutive blocks starting at `lba`.
    ///
    /// `buf.len()` must be a non-zero multiple of [`BLOCK_SIZE`] and at most
    /// [`MAX_MULTIBLOCK_BLOCKS`] blocks; implementations may reject larger
    /// requests with [`BlockError::Device`]. This is the optimized contiguous
    /// path (CMD18 on SD); callers fall back to repeated `read_block` when
    /// only one block is needed.
    fn read_blocks(&mut self, lba: u32, buf: &mut [u8]) -> Result<(), BlockError>;
}

impl<T: BlockDevice + ?Sized> BlockDevice for &mut T {
    fn read_block(&mut self, lba: u32, buf: &mut Block) -> Result<(), BlockError> {
        (**self).read_block(lba, buf)
    }

    fn read_blocks(&mut self, lba: u32, buf: &mut [u8]) -> Result<(), BlockError> {
        (**self).read_blocks(lba, buf)
    }
}
