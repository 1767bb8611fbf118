//! Playback orchestrator.
//!
//! Drives the steady-state loop at best effort between interrupts:
//!
//! 1. service the audio refill (highest priority),
//! 2. check for completion (`audio_frame >= frame_count`),
//! 3. act on the sync decision (render / skip / repeat),
//! 4. kick the display transfer when idle and a frame is queued,
//! 5. service the audio refill again.
//!
//! The refill runs twice per iteration because a video frame read is
//! allowed to approach one half-buffer playback duration; polling on both
//! sides of it keeps the worst-case gap under the deadline.
//!
//! Storage failures degrade instead of stopping playback: a failed audio
//! read plays silence for that half, a failed frame read shows a blanked
//! frame, both counted in the report.

use embedded_hal::digital::StatefulOutputPin;

use platform::block::BlockDevice;
use platform::{FrameLink, MicrosClock, StereoDac};
use storage::MediaFile;

use crate::audio::{AudioError, AudioPipeline, BufferHalf};
use crate::av_sync::{AvSync, SyncDecision, SyncError};
use crate::frame_queue::DisplayPipeline;

/// Heartbeat LED half-period: toggling every 500 ms blinks at 2 Hz.
const LED_HALF_PERIOD_US: u32 = 500_000;

/// Bounded wait for the final in-flight display transfer.
const DISPLAY_DRAIN_TIMEOUT_US: u32 = 100_000;

/// Sentinel for "no frame rendered yet".
const NO_FRAME: u32 = u32::MAX;

/// Orchestrator startup error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum EngineError {
    /// Synchronizer rejected its configuration.
    Sync(SyncError),
    /// Audio pipeline failed to start.
    Audio(AudioError),
}

impl From<SyncError> for EngineError {
    fn from(e: SyncError) -> Self {
        Self::Sync(e)
    }
}

impl From<AudioError> for EngineError {
    fn from(e: AudioError) -> Self {
        Self::Audio(e)
    }
}

/// Completion statistics, in the order the stats page shows them.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct PlaybackReport {
    /// Frames actually drawn and queued.
    pub frames_rendered: u32,
    /// Frames skipped to catch up with audio.
    pub frames_skipped: u32,
    /// Iterations that held the displayed frame (video ahead).
    pub frames_repeated: u32,
    /// Audio half-buffer refills.
    pub refill_count: u32,
    /// Worst-case refill time in microseconds.
    pub max_refill_us: u32,
    /// Half-buffers the foreground missed.
    pub underrun_count: u32,
    /// Audio reads that fell back to silence.
    pub audio_read_errors: u32,
    /// Frame reads that fell back to a blanked frame.
    pub video_read_errors: u32,
    /// Largest drift observed (video ahead).
    pub max_drift: i32,
    /// Smallest drift observed (video behind).
    pub min_drift: i32,
}

/// The foreground playback loop, generic over every hardware seam.
pub struct Player<B, D, L, C, P>
where
    B: BlockDevice,
    D: StereoDac,
    L: FrameLink,
    C: MicrosClock,
    P: StatefulOutputPin,
{
    media: MediaFile<B>,
    audio: AudioPipeline,
    display: DisplayPipeline,
    sync: &'static AvSync,
    dac: D,
    link: L,
    clock: C,
    led: P,
    last_frame: u32,
    last_led_toggle: u32,
    frames_rendered: u32,
    frames_repeated: u32,
    max_refill_us: u32,
    audio_read_errors: u32,
    video_read_errors: u32,
}

impl<B, D, L, C, P> Player<B, D, L, C, P>
where
    B: BlockDevice,
    D: StereoDac,
    L: FrameLink,
    C: MicrosClock,
    P: StatefulOutputPin,
{
    /// Wire the orchestrator together.
    ///
    /// Configures the synchronizer from the media header at `video_fps`
    /// (default drift band) and attaches it to the audio ISR path.
    #[allow(clippy::too_many_arguments)] // one seam per hardware resource
    pub fn new(
        media: MediaFile<B>,
        audio: AudioPipeline,
        display: DisplayPipeline,
        sync: &'static AvSync,
        dac: D,
        link: L,
        clock: C,
        led: P,
        video_fps: u32,
    ) -> Result<Self, EngineError> {
        sync.init(media.header().sample_rate, video_fps, 0)?;
        audio.shared().attach_sync(sync);
        Ok(Self {
            media,
            audio,
            display,
            sync,
            dac,
            link,
            clock,
            led,
            last_frame: NO_FRAME,
            last_led_toggle: 0,
            frames_rendered: 0,
            frames_repeated: 0,
            max_refill_us: 0,
            audio_read_errors: 0,
            video_read_errors: 0,
        })
    }

    /// Prime both audio halves and the first video frame, then start the
    /// synchronizer and the DAC.
    pub fn begin(&mut self) -> Result<(), EngineError> {
        for half in [BufferHalf::First, BufferHalf::Second] {
            let (left, right) = self.audio.half_regions(half);
            if self.media.read_audio(left, right).is_err() {
                self.audio_read_errors += 1;
            }
        }
        if self.media.header().frame_count > 0 {
            self.render_frame(0);
        }

        self.sync.start()?;
        self.audio.start(&mut self.dac)?;
        self.last_led_toggle = self.clock.now_micros();
        Ok(())
    }

    /// One foreground iteration. Returns `true` once the audio clock has
    /// passed the last video frame.
    pub fn step(&mut self) -> bool {
        self.service_audio();

        let frame_count = self.media.header().frame_count;
        if self.sync.current_frame() >= frame_count {
            return true;
        }

        match self.sync.decision() {
            SyncDecision::Render => {
                let target = self.sync.current_frame();
                if target != self.last_frame && target < frame_count {
                    self.render_frame(target);
                    self.sync.frame_rendered();
                    self.frames_rendered += 1;
                    self.last_frame = target;
                }
            }
            SyncDecision::Skip => self.sync.frame_skipped(),
            SyncDecision::Repeat => self.frames_repeated += 1,
            SyncDecision::NotStarted => {}
        }

        // Display kickoff failures leave the frame queued; the next
        // iteration retries.
        let _ = self.display.kick(&mut self.link);

        self.service_audio();
        self.heartbeat();
        false
    }

    /// Stop the pipelines, drain the last display transfer and collect the
    /// completion statistics.
    pub fn finish(&mut self) -> PlaybackReport {
        self.audio.stop(&mut self.dac);
        self.sync.stop();

        let start = self.clock.now_micros();
        while self.display.queue().transfer_busy() {
            if self.clock.now_micros().wrapping_sub(start) > DISPLAY_DRAIN_TIMEOUT_US {
                break;
            }
        }

        let audio = self.audio.stats();
        let sync = self.sync.stats();
        PlaybackReport {
            frames_rendered: self.frames_rendered,
            frames_skipped: sync.frames_skipped,
            frames_repeated: self.frames_repeated,
            refill_count: audio.refill_count,
            max_refill_us: self.max_refill_us,
            underrun_count: audio.underrun_count,
            audio_read_errors: self.audio_read_errors,
            video_read_errors: self.video_read_errors,
            max_drift: sync.max_drift,
            min_drift: sync.min_drift,
        }
    }

    /// Run to completion. On hardware the interrupts advance the audio
    /// clock underneath this loop; host tests drive [`step`](Self::step)
    /// directly instead.
    pub fn run(&mut self) -> Result<PlaybackReport, EngineError> {
        self.begin()?;
        while !self.step() {}
        Ok(self.finish())
    }

    /// Media accessor (file info page).
    pub fn media(&self) -> &MediaFile<B> {
        &self.media
    }

    /// Mutable media accessor (runtime volume changes, test fault
    /// injection).
    pub fn media_mut(&mut self) -> &mut MediaFile<B> {
        &mut self.media
    }

    fn service_audio(&mut self) {
        if !self.audio.needs_refill() {
            return;
        }
        let start = self.clock.now_micros();

        let (left, right) = self.audio.fill_regions();
        if self.media.read_audio(left, right).is_err() {
            self.audio_read_errors += 1;
        }
        self.audio.buffer_filled();

        let elapsed = self.clock.now_micros().wrapping_sub(start);
        if elapsed > self.max_refill_us {
            self.max_refill_us = elapsed;
        }
    }

    fn render_frame(&mut self, frame: u32) {
        let buf = self.display.render_buffer();
        if self.media.read_frame_at(frame, buf).is_err() {
            buf.fill(0);
            self.video_read_errors += 1;
        }
        self.display.swap_buffers();
    }

    fn heartbeat(&mut self) {
        let now = self.clock.now_micros();
        if now.wrapping_sub(self.last_led_toggle) >= LED_HALF_PERIOD_US {
            let _ = self.led.toggle();
            self.last_led_toggle = now;
        }
    }
}
