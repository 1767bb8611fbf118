//! Synchronized A/V player firmware for the STM32L476RG.
//!
//! Plays `BADAPPLE.BIN` from a FAT32 SD card over SPI: raw 128x64 video to
//! an SSD1306 OLED on I2C, 16-bit stereo PCM to the two on-chip DAC
//! channels, kept in lock step by the audio sample clock.
//!
//! # Layout
//!
//! ```text
//! main.rs / hardware  — bring-up, interrupt wiring, the playback run
//! sd_spi              — SD card over SPI implementing platform::BlockDevice
//! ssd1306             — OLED driver + the frame transport for playback
//! ui                  — status screens rendered with embedded-graphics
//! boot                — clock and timer derivations
//! ```
//!
//! The drivers are generic over `embedded-hal` traits and fully
//! host-testable; only the `hardware` feature pulls in embassy-stm32 and
//! the interrupt handlers.

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

pub mod boot;
pub mod sd_spi;
pub mod ssd1306;
pub mod ui;

#[cfg(feature = "hardware")]
pub mod hardware;

pub use sd_spi::SdCard;
pub use ssd1306::{BlockingFrameLink, Ssd1306};
