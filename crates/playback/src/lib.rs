//! Real-time A/V playback engine.
//!
//! The scheduling model is a single non-yielding foreground loop plus
//! hardware interrupt handlers; nothing here blocks except the synchronous
//! block-device reads buried under the media reader. The pieces:
//!
//! - [`audio`]: double-buffered circular DAC pipeline. The ISR half owns
//!   one half of each channel ring at a time; the foreground refills the
//!   other on demand.
//! - [`frame_queue`]: triple-buffered display path (render / ready /
//!   transfer) so the foreground can always draw and a stale queued frame
//!   is superseded rather than blocking.
//! - [`av_sync`]: audio-master synchronizer. The DAC sample counter is the
//!   wall clock; video renders, skips or repeats to follow it.
//! - [`engine`]: the orchestrator tying refill, sync decisions, rendering
//!   and display kickoff together.
//!
//! ISR-facing state lives in const-initialized structs of word-sized
//! atomics ([`audio::AudioShared`], [`frame_queue::FrameQueue`],
//! [`av_sync::AvSync`]) so a plain `static` is reachable from interrupt
//! entry points without unsafe globals.

// ── Lint policy ─────────────────────────────────────────────────────────────
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]
#![deny(unused_must_use)]
// ────────────────────────────────────────────────────────────────────────────
#![cfg_attr(not(test), no_std)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]

pub mod audio;
pub mod av_sync;
pub mod engine;
pub mod frame_queue;

pub use audio::{AudioError, AudioPipeline, AudioShared, AudioState, BufferHalf};
pub use av_sync::{AvSync, SyncDecision, SyncError, SyncState};
pub use engine::{EngineError, PlaybackReport, Player};
pub use frame_queue::{DisplayPipeline, FrameQueue};
