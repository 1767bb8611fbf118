//! Positional reader for the A/V media file.
//!
//! The file starts with a 20-byte header of five little-endian `u32`s,
//! followed by the raw video frames (1024 bytes each) and the interleaved
//! 16-bit stereo PCM stream:
//!
//! ```text
//! offset  size  meaning
//! 0       4     frame_count
//! 4       4     audio_size (bytes)
//! 8       4     sample_rate (Hz)
//! 12      4     channels         (always 2)
//! 16      4     bits_per_sample  (always 16)
//! 20      V     video: frame_count x 1024 bytes
//! 20+V    A     audio: interleaved L,R i16 LE samples
//! ```
//!
//! Reads are positional. When the file occupies one contiguous cluster run
//! the reader maps byte offsets straight to sectors and issues aligned
//! multi-block reads into the caller's buffer; otherwise it resolves
//! clusters through a forward cache and stages everything through the
//! volume's sector scratch.

use platform::barrier;
use platform::block::{BlockDevice, BLOCK_SIZE, MAX_MULTIBLOCK_BLOCKS};
use platform::dma_safety::AUDIO_HALF_BUFFER_SAMPLES;
use platform::DAC_SILENCE;

use crate::fat32::{end_of_chain, Fat32Volume, FileInfo, FsError};

/// Size of the media header in bytes.
pub const MEDIA_HEADER_SIZE: usize = 20;

/// Size of one raw video frame in bytes (128x64 / 8).
pub const MEDIA_FRAME_SIZE: usize = 1024;

/// Volume applied until the caller changes it.
pub const MEDIA_DEFAULT_VOLUME: u8 = 50;

/// Bytes of one interleaved stereo sample (two i16 channels).
const BYTES_PER_STEREO_SAMPLE: u32 = 4;

/// Staging area for one half-buffer of raw interleaved audio.
const AUDIO_SCRATCH_BYTES: usize =
    AUDIO_HALF_BUFFER_SAMPLES * BYTES_PER_STEREO_SAMPLE as usize;

/// Slack allowed on a cluster chain before it is declared corrupt.
const CHAIN_SLACK_CLUSTERS: u32 = 10;

/// Parsed media header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct MediaHeader {
    /// Number of 1024-byte video frames.
    pub frame_count: u32,
    /// Size of the audio region in bytes.
    pub audio_size: u32,
    /// Audio sample rate in Hz.
    pub sample_rate: u32,
    /// Channel count (always 2).
    pub channels: u32,
    /// Sample width (always 16).
    pub bits_per_sample: u32,
}

impl MediaHeader {
    /// Parse the leading header bytes.
    pub fn parse(buf: &[u8; MEDIA_HEADER_SIZE]) -> Self {
        let word = |i: usize| {
            u32::from_le_bytes([buf[i], buf[i + 1], buf[i + 2], buf[i + 3]])
        };
        Self {
            frame_count: word(0),
            audio_size: word(4),
            sample_rate: word(8),
            channels: word(12),
            bits_per_sample: word(16),
        }
    }
}

/// Maps file byte offsets to sectors.
///
/// Carries the contiguity verdict and the forward cluster cache for the
/// fragmented path. Kept separate from [`MediaFile`] so a read can borrow
/// the locator, the volume and the audio staging buffer independently.
struct Locator {
    first_cluster: u32,
    file_size: u32,
    cached_cluster: u32,
    cached_cluster_index: u32,
    is_contiguous: bool,
    first_sector: u32,
}

impl Locator {
    fn new(first_cluster: u32, file_size: u32) -> Self {
        Self {
            first_cluster,
            file_size,
            cached_cluster: 0,
            cached_cluster_index: 0,
            is_contiguous: false,
            first_sector: 0,
        }
    }

    /// Walk the whole chain once; decide whether the sector-arithmetic fast
    /// path is usable.
    ///
    /// A chain longer than the file size can explain (plus slack) means the
    /// FAT is lying about this file, so the walk fails with
    /// [`FsError::Corrupt`] rather than trusting either path.
    fn detect_contiguous<B: BlockDevice>(
        &mut self,
        vol: &mut Fat32Volume<B>,
    ) -> Result<bool, FsError> {
        let cluster_size = vol.cluster_size();
        let expected_clusters = self.file_size.div_ceil(cluster_size);

        let mut cluster = self.first_cluster;
        let mut prev = cluster;
        let mut count = 0u32;

        while !end_of_chain(cluster) {
            count += 1;
            if count > expected_clusters + CHAIN_SLACK_CLUSTERS {
                return Err(FsError::Corrupt);
            }
            if count > 1 && cluster != prev + 1 {
                self.is_contiguous = false;
                self.first_sector = 0;
                return Ok(false);
            }
            prev = cluster;
            cluster = vol.next_cluster(cluster)?;
        }

        self.is_contiguous = true;
        self.first_sector = vol.cluster_to_sector(self.first_cluster);
        self.cached_cluster = self.first_cluster;
        self.cached_cluster_index = 0;
        Ok(true)
    }

    /// Read `buf.len()` bytes starting at byte `offset`.
    ///
    /// Stops early (leaving the buffer tail untouched) when the request
    /// runs past the end of the file.
    fn read_at<B: BlockDevice>(
        &mut self,
        vol: &mut Fat32Volume<B>,
        offset: u32,
        buf: &mut [u8],
    ) -> Result<(), FsError> {
        if self.is_contiguous && self.first_sector != 0 {
            self.read_contiguous(vol, offset, buf)
        } else {
            self.read_fragmented(vol, offset, buf)
        }
    }

    fn read_contiguous<B: BlockDevice>(
        &mut self,
        vol: &mut Fat32Volume<B>,
        mut offset: u32,
        buf: &mut [u8],
    ) -> Result<(), FsError> {
        let mut out = 0usize;

        while out < buf.len() && offset < self.file_size {
            let sector = self.first_sector + offset / BLOCK_SIZE as u32;
            let sector_offset = (offset % BLOCK_SIZE as u32) as usize;
            let remaining = buf.len() - out;

            if sector_offset != 0 || remaining < BLOCK_SIZE {
                let n =
                    self.copy_via_scratch(vol, sector, sector_offset, offset, &mut buf[out..])?;
                out += n;
                offset += n as u32;
                continue;
            }

            // Aligned whole-block run straight into the caller's buffer,
            // capped so one call never monopolizes the foreground.
            let sectors_left_in_file = ((self.file_size - offset) as usize) / BLOCK_SIZE;
            let count = (remaining / BLOCK_SIZE)
                .min(sectors_left_in_file)
                .min(MAX_MULTIBLOCK_BLOCKS);

            if count == 0 {
                // Aligned, but the file tail is shorter than one block.
                let n = self.copy_via_scratch(vol, sector, 0, offset, &mut buf[out..])?;
                out += n;
                offset += n as u32;
            } else {
                let bytes = count * BLOCK_SIZE;
                vol.read_blocks_into(sector, &mut buf[out..out + bytes])?;
                out += bytes;
                offset += bytes as u32;
            }
        }
        Ok(())
    }

    fn read_fragmented<B: BlockDevice>(
        &mut self,
        vol: &mut Fat32Volume<B>,
        mut offset: u32,
        buf: &mut [u8],
    ) -> Result<(), FsError> {
        let cluster_size = vol.cluster_size();
        let mut out = 0usize;

        while out < buf.len() && offset < self.file_size {
            let cluster = self.cluster_at(vol, offset)?;
            if end_of_chain(cluster) {
                break;
            }
            let offset_in_cluster = offset % cluster_size;
            let sector =
                vol.cluster_to_sector(cluster) + offset_in_cluster / BLOCK_SIZE as u32;
            let sector_offset = (offset_in_cluster % BLOCK_SIZE as u32) as usize;

            let n = self.copy_via_scratch(vol, sector, sector_offset, offset, &mut buf[out..])?;
            out += n;
            offset += n as u32;
        }
        Ok(())
    }

    /// Resolve the cluster containing `offset`, resuming from the cache
    /// when it lies at or before the target.
    fn cluster_at<B: BlockDevice>(
        &mut self,
        vol: &mut Fat32Volume<B>,
        offset: u32,
    ) -> Result<u32, FsError> {
        let target_index = offset / vol.cluster_size();

        let (mut cluster, start_index) =
            if self.cached_cluster != 0 && self.cached_cluster_index <= target_index {
                (self.cached_cluster, self.cached_cluster_index)
            } else {
                (self.first_cluster, 0)
            };

        let mut index = start_index;
        while index < target_index && !end_of_chain(cluster) {
            cluster = vol.next_cluster(cluster)?;
            index += 1;
        }

        self.cached_cluster = cluster;
        self.cached_cluster_index = target_index;
        Ok(cluster)
    }

    /// Stage one sector through the volume scratch and copy the usable
    /// slice out. Returns the number of bytes copied (always at least one
    /// while `offset < file_size`).
    fn copy_via_scratch<B: BlockDevice>(
        &self,
        vol: &mut Fat32Volume<B>,
        sector: u32,
        sector_offset: usize,
        offset: u32,
        out: &mut [u8],
    ) -> Result<usize, FsError> {
        let block = vol.sector(sector)?;
        let available = BLOCK_SIZE - sector_offset;
        let left_in_file = (self.file_size - offset) as usize;
        let n = out.len().min(available).min(left_in_file);
        out[..n].copy_from_slice(&block[sector_offset..sector_offset + n]);
        Ok(n)
    }
}

/// Convert one signed 16-bit sample to the DAC's unsigned 12-bit range,
/// applying an integer volume percentage first.
///
/// For any `volume <= 100` the result is confined to `0..=4095`; zero input
/// at full volume lands exactly on the 0x800 midpoint. No saturation step
/// is needed: `(raw * vol) / 100 + 32768` cannot leave `0..=65535`.
#[inline]
pub(crate) fn sample_to_dac(raw: i16, volume: u8) -> u16 {
    let scaled = i32::from(raw) * i32::from(volume) / 100;
    ((scaled + 32768) >> 4) as u16
}

/// An open media file on a mounted volume.
///
/// Owns the volume for its whole lifetime; [`MediaFile::close`] gives it
/// back. Exclusive to the foreground loop.
pub struct MediaFile<B: BlockDevice> {
    vol: Fat32Volume<B>,
    locator: Locator,
    header: MediaHeader,
    video_offset: u32,
    audio_offset: u32,
    current_sample: u32,
    volume_percent: u8,
    audio_scratch: [u8; AUDIO_SCRATCH_BYTES],
}

impl<B: BlockDevice> MediaFile<B> {
    /// Open the file described by `info`: read and validate the header,
    /// derive the region offsets, and probe the cluster chain for the
    /// contiguous fast path.
    pub fn open(mut vol: Fat32Volume<B>, info: &FileInfo) -> Result<Self, FsError> {
        if info.first_cluster < 2 {
            return Err(FsError::InvalidParam);
        }
        if (info.size as usize) < MEDIA_HEADER_SIZE {
            return Err(FsError::Invalid);
        }

        let first_sector = vol.cluster_to_sector(info.first_cluster);
        let mut header_bytes = [0u8; MEDIA_HEADER_SIZE];
        header_bytes.copy_from_slice(&vol.sector(first_sector)?[..MEDIA_HEADER_SIZE]);
        let header = MediaHeader::parse(&header_bytes);

        if header.channels != 2 || header.bits_per_sample != 16 || header.sample_rate == 0 {
            return Err(FsError::Invalid);
        }
        let video_bytes = header
            .frame_count
            .checked_mul(MEDIA_FRAME_SIZE as u32)
            .ok_or(FsError::Invalid)?;
        let audio_offset = video_bytes
            .checked_add(MEDIA_HEADER_SIZE as u32)
            .ok_or(FsError::Invalid)?;

        let mut locator = Locator::new(info.first_cluster, info.size);
        locator.detect_contiguous(&mut vol)?;

        Ok(Self {
            vol,
            locator,
            header,
            video_offset: MEDIA_HEADER_SIZE as u32,
            audio_offset,
            current_sample: 0,
            volume_percent: MEDIA_DEFAULT_VOLUME,
            audio_scratch: [0; AUDIO_SCRATCH_BYTES],
        })
    }

    /// Close the file and return the volume.
    pub fn close(self) -> Fat32Volume<B> {
        self.vol
    }

    /// Parsed header.
    pub fn header(&self) -> &MediaHeader {
        &self.header
    }

    /// Whether the contiguous fast path is active.
    pub fn is_contiguous(&self) -> bool {
        self.locator.is_contiguous
    }

    /// Playback length in whole seconds at the given video frame rate.
    pub fn duration_seconds(&self, fps: u32) -> u32 {
        if fps == 0 {
            return 0;
        }
        self.header.frame_count / fps
    }

    /// Set the playback volume, clamped to 100.
    pub fn set_volume(&mut self, percent: u8) {
        self.volume_percent = percent.min(100);
    }

    /// Current volume percentage.
    pub fn volume(&self) -> u8 {
        self.volume_percent
    }

    /// Read raw bytes at an arbitrary file offset (exposed for tests).
    #[cfg(any(test, feature = "std"))]
    pub fn read_at(&mut self, offset: u32, buf: &mut [u8]) -> Result<(), FsError> {
        self.locator.read_at(&mut self.vol, offset, buf)
    }

    /// Underlying block device (test instrumentation).
    #[cfg(any(test, feature = "std"))]
    pub fn device_mut(&mut self) -> &mut B {
        self.vol.device_mut()
    }

    /// Read video frame `frame_index` into `buf`.
    pub fn read_frame_at(
        &mut self,
        frame_index: u32,
        buf: &mut [u8; MEDIA_FRAME_SIZE],
    ) -> Result<(), FsError> {
        if frame_index >= self.header.frame_count {
            return Err(FsError::InvalidParam);
        }
        let offset = self.video_offset + frame_index * MEDIA_FRAME_SIZE as u32;
        self.locator.read_at(&mut self.vol, offset, buf)
    }

    /// Read the next `left.len()` stereo samples, deinterleaved, volume
    /// scaled and converted to the DAC's 12-bit format.
    ///
    /// Past the end of the audio region the outputs are filled with DAC
    /// silence and the call still succeeds, so playback can drain the
    /// video tail without special-casing. On a device error the outputs
    /// are forced to silence for this buffer only and `Err(Read)` is
    /// returned; the caller counts it and keeps going.
    pub fn read_audio(&mut self, left: &mut [u16], right: &mut [u16]) -> Result<(), FsError> {
        if left.len() != right.len() || left.len() > AUDIO_HALF_BUFFER_SAMPLES {
            return Err(FsError::InvalidParam);
        }
        let count = left.len();
        if count == 0 {
            return Ok(());
        }

        let total_samples = self.header.audio_size / BYTES_PER_STEREO_SAMPLE;
        if self.current_sample >= total_samples {
            left.fill(DAC_SILENCE);
            right.fill(DAC_SILENCE);
            barrier::dmb();
            return Ok(());
        }

        let to_read = count.min((total_samples - self.current_sample) as usize);
        let offset = self.audio_offset + self.current_sample * BYTES_PER_STEREO_SAMPLE;
        let bytes = to_read * BYTES_PER_STEREO_SAMPLE as usize;

        if let Err(e) =
            self.locator
                .read_at(&mut self.vol, offset, &mut self.audio_scratch[..bytes])
        {
            left.fill(DAC_SILENCE);
            right.fill(DAC_SILENCE);
            barrier::dmb();
            return Err(e);
        }

        let vol = self.volume_percent;
        for i in 0..to_read {
            let base = i * BYTES_PER_STEREO_SAMPLE as usize;
            let l = i16::from_le_bytes([self.audio_scratch[base], self.audio_scratch[base + 1]]);
            let r = i16::from_le_bytes([
                self.audio_scratch[base + 2],
                self.audio_scratch[base + 3],
            ]);
            left[i] = sample_to_dac(l, vol);
            right[i] = sample_to_dac(r, vol);
        }

        self.current_sample += to_read as u32;
        left[to_read..].fill(DAC_SILENCE);
        right[to_read..].fill(DAC_SILENCE);

        // The halves we just wrote are about to be handed to the DMA engine.
        barrier::dmb();
        Ok(())
    }
}
