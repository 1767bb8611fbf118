//! Read-only FAT32 volume access and the positional media reader.
//!
//! Two layers:
//!
//! - [`fat32`] mounts a FAT32 volume over any [`platform::BlockDevice`],
//!   resolves 8.3 names in the root directory and walks cluster chains.
//! - [`media`] opens the A/V media file on such a volume, parses its
//!   20-byte header, and serves positional video-frame and stereo-audio
//!   reads with a contiguous-extent fast path.
//!
//! Everything is synchronous and allocation-free; the only buffers are the
//! volume's 512-byte sector scratch and the media reader's audio staging
//! area, both owned inline.

// ── Lint policy ─────────────────────────────────────────────────────────────
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]
#![deny(unused_must_use)]
// ────────────────────────────────────────────────────────────────────────────
#![cfg_attr(not(any(test, feature = "std")), no_std)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]

pub mod fat32;
pub mod media;

#[cfg(any(test, feature = "std"))]
pub mod testfs;

pub use fat32::{end_of_chain, short_name, Fat32Volume, FileInfo, FsError};
pub use media::{MediaFile, MediaHeader, MEDIA_FRAME_SIZE, MEDIA_HEADER_SIZE};
