//! Hardware abstraction layer for the synchronized A/V player.
//!
//! This crate defines the traits and shared constants the real-time engine
//! is written against, so that everything above it can be exercised on the
//! host without physical hardware.
//!
//! # Architecture Layers
//!
//! ```text
//! Application (firmware crate)
//!         ↓
//! Real-time engine (playback crate)
//!         ↓
//! Media / filesystem (storage crate)
//!         ↓
//! Platform HAL (this crate - trait abstractions)
//!         ↓
//! Hardware (embassy-stm32 + PAC, firmware crate only)
//! ```
//!
//! # Abstractions
//!
//! - [`BlockDevice`] - synchronous 512-byte block reads (SD card)
//! - [`StereoDac`] - dual-channel circular-DMA DAC output
//! - [`FrameLink`] - asynchronous full-frame display transfer
//! - [`MicrosClock`] - free-running microsecond counter for diagnostics
//! - [`dma_safety`] - memory regions, buffer sizing, and alignment rules
//!
//! # Features
//!
//! - `std`: host-side mock implementations (for testing)
//! - `defmt`: derive `defmt::Format` on public types

// ── Lint policy ─────────────────────────────────────────────────────────────
#![deny(clippy::unwrap_used)] // no .unwrap() in production code
#![deny(clippy::expect_used)] // no .expect() in production code
#![deny(clippy::panic)] // no panic!() in production code
#![deny(unused_must_use)]
// ────────────────────────────────────────────────────────────────────────────
#![cfg_attr(not(any(test, feature = "std")), no_std)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]

pub mod audio;
pub mod barrier;
pub mod block;
pub mod display;
pub mod dma_safety;
pub mod time;

#[cfg(any(test, feature = "std"))]
pub mod mocks;

pub use audio::{StereoDac, DAC_SILENCE};
pub use block::{Block, BlockDevice, BlockError, BLOCK_SIZE, MAX_MULTIBLOCK_BLOCKS};
pub use display::FrameLink;
pub use dma_safety::{DmaAccessible, DmaBuffer, Sram1Region, Sram2Region};
pub use time::MicrosClock;
