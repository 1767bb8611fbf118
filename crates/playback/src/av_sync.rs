//! Audio-master A/V synchronizer.
//!
//! The DAC sample rate cannot be slewed, so audio is the wall clock. Every
//! half-buffer interrupt deposits the half size into `audio_samples_played`;
//! the foreground derives
//!
//! ```text
//! audio_frame = audio_samples_played / samples_per_frame
//! drift       = video_frames_rendered - audio_frame     // signed
//! ```
//!
//! and renders, skips (video behind) or repeats (video ahead) accordingly.
//! The ±`max_drift_frames` band is inclusive: sitting exactly on the edge
//! still renders.
//!
//! Everything is interior-mutable atomics so one `&'static AvSync` can be
//! shared between the orchestrator and the audio ISR; the counters that
//! cross the ISR boundary are word-sized.

use core::sync::atomic::{AtomicI32, AtomicU32, AtomicU8, Ordering};

/// Drift tolerance applied when the caller passes 0 at init.
pub const DEFAULT_MAX_DRIFT_FRAMES: u32 = 2;

/// Synchronizer lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum SyncState {
    /// Not yet configured.
    Reset = 0,
    /// Configured, waiting for [`AvSync::start`].
    Ready = 1,
    /// Counting samples and issuing decisions.
    Running = 2,
    /// Stopped; counters frozen.
    Stopped = 3,
}

impl SyncState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::Ready,
            2 => Self::Running,
            3 => Self::Stopped,
            _ => Self::Reset,
        }
    }
}

/// Per-tick verdict for the video path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SyncDecision {
    /// The synchronizer is not running.
    NotStarted,
    /// In sync: render the frame the audio clock points at.
    Render,
    /// Video behind audio: advance the frame counter without rendering.
    Skip,
    /// Video ahead of audio: hold the displayed frame.
    Repeat,
}

/// Synchronizer error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SyncError {
    /// Zero sample rate / fps, or a rate below the frame rate
    /// (samples-per-frame must be at least 1).
    InvalidParam,
    /// The call is not legal in the current state.
    InvalidState,
}

/// Snapshot of the drift statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct SyncStats {
    /// Frames advanced without rendering because video fell behind.
    pub frames_skipped: u32,
    /// Largest drift observed (video ahead).
    pub max_drift: i32,
    /// Smallest drift observed (video behind).
    pub min_drift: i32,
}

/// Audio-master synchronizer.
///
/// `const`-initializable so it can live in a plain `static`; configure with
/// [`init`](Self::init) before use.
pub struct AvSync {
    state: AtomicU8,
    samples_per_frame: AtomicU32,
    max_drift_frames: AtomicU32,
    /// Monotone while RUNNING; incremented only from the audio ISR.
    audio_samples_played: AtomicU32,
    video_frames_rendered: AtomicU32,
    frames_skipped: AtomicU32,
    max_drift: AtomicI32,
    min_drift: AtomicI32,
}

impl AvSync {
    /// New synchronizer in the `Reset` state.
    pub const fn new() -> Self {
        Self {
            state: AtomicU8::new(SyncState::Reset as u8),
            samples_per_frame: AtomicU32::new(0),
            max_drift_frames: AtomicU32::new(DEFAULT_MAX_DRIFT_FRAMES),
            audio_samples_played: AtomicU32::new(0),
            video_frames_rendered: AtomicU32::new(0),
            frames_skipped: AtomicU32::new(0),
            max_drift: AtomicI32::new(0),
            min_drift: AtomicI32::new(0),
        }
    }

    /// Configure the timebase.
    ///
    /// `samples_per_frame = sample_rate / video_fps` (truncating) must come
    /// out at least 1. A `max_drift` of 0 selects
    /// [`DEFAULT_MAX_DRIFT_FRAMES`].
    pub fn init(&self, sample_rate: u32, video_fps: u32, max_drift: u32) -> Result<(), SyncError> {
        if sample_rate == 0 || video_fps == 0 {
            return Err(SyncError::InvalidParam);
        }
        let samples_per_frame = sample_rate / video_fps;
        if samples_per_frame == 0 {
            return Err(SyncError::InvalidParam);
        }

        self.samples_per_frame.store(samples_per_frame, Ordering::Relaxed);
        self.max_drift_frames.store(
            if max_drift > 0 { max_drift } else { DEFAULT_MAX_DRIFT_FRAMES },
            Ordering::Relaxed,
        );
        self.audio_samples_played.store(0, Ordering::Relaxed);
        self.video_frames_rendered.store(0, Ordering::Relaxed);
        self.reset_stats();
        self.state.store(SyncState::Ready as u8, Ordering::Release);
        Ok(())
    }

    /// Zero the counters and start issuing decisions.
    pub fn start(&self) -> Result<(), SyncError> {
        match self.state() {
            SyncState::Ready | SyncState::Stopped => {}
            SyncState::Reset | SyncState::Running => return Err(SyncError::InvalidState),
        }
        self.audio_samples_played.store(0, Ordering::Relaxed);
        self.video_frames_rendered.store(0, Ordering::Relaxed);
        self.reset_stats();
        self.state.store(SyncState::Running as u8, Ordering::Release);
        Ok(())
    }

    /// Stop; counters freeze for the completion report.
    pub fn stop(&self) {
        self.state.store(SyncState::Stopped as u8, Ordering::Release);
    }

    /// Current state.
    pub fn state(&self) -> SyncState {
        SyncState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Deposit `samples` played by the DAC. ISR context; ignored unless
    /// running, so late interrupts after `stop` cannot move the clock.
    pub fn audio_tick(&self, samples: u32) {
        if self.state() == SyncState::Running {
            self.audio_samples_played.fetch_add(samples, Ordering::Relaxed);
        }
    }

    /// Samples deposited so far.
    pub fn samples_played(&self) -> u32 {
        self.audio_samples_played.load(Ordering::Relaxed)
    }

    /// Frame index the audio clock currently points at.
    pub fn current_frame(&self) -> u32 {
        let spf = self.samples_per_frame.load(Ordering::Relaxed);
        if spf == 0 {
            return 0;
        }
        self.samples_played() / spf
    }

    /// Signed drift: positive means video is ahead of audio.
    pub fn current_drift(&self) -> i32 {
        let video = i64::from(self.video_frames_rendered.load(Ordering::Relaxed));
        let audio = i64::from(self.current_frame());
        (video - audio) as i32
    }

    /// Decide what the video path should do right now, updating the drift
    /// statistics as a side effect.
    pub fn decision(&self) -> SyncDecision {
        if self.state() != SyncState::Running {
            return SyncDecision::NotStarted;
        }

        let drift = self.current_drift();
        self.max_drift.fetch_max(drift, Ordering::Relaxed);
        self.min_drift.fetch_min(drift, Ordering::Relaxed);

        let band = self.max_drift_frames.load(Ordering::Relaxed) as i32;
        if drift < -band {
            SyncDecision::Skip
        } else if drift > band {
            SyncDecision::Repeat
        } else {
            SyncDecision::Render
        }
    }

    /// Account a rendered frame.
    pub fn frame_rendered(&self) {
        self.video_frames_rendered.fetch_add(1, Ordering::Relaxed);
    }

    /// Account a skipped frame (advances the counter like a render).
    pub fn frame_skipped(&self) {
        self.video_frames_rendered.fetch_add(1, Ordering::Relaxed);
        self.frames_skipped.fetch_add(1, Ordering::Relaxed);
    }

    /// Frames committed so far (rendered + skipped).
    pub fn frames_committed(&self) -> u32 {
        self.video_frames_rendered.load(Ordering::Relaxed)
    }

    /// Statistics snapshot.
    pub fn stats(&self) -> SyncStats {
        SyncStats {
            frames_skipped: self.frames_skipped.load(Ordering::Relaxed),
            max_drift: self.max_drift.load(Ordering::Relaxed),
            min_drift: self.min_drift.load(Ordering::Relaxed),
        }
    }

    fn reset_stats(&self) {
        self.frames_skipped.store(0, Ordering::Relaxed);
        self.max_drift.store(0, Ordering::Relaxed);
        self.min_drift.store(0, Ordering::Relaxed);
    }
}

impl Default for AvSync {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn running(rate: u32, fps: u32, max_drift: u32) -> AvSync {
        let sync = AvSync::new();
        sync.init(rate, fps, max_drift).unwrap();
        sync.start().unwrap();
        sync
    }

    #[test]
    fn init_rejects_degenerate_rates() {
        let sync = AvSync::new();
        assert_eq!(sync.init(0, 30, 0), Err(SyncError::InvalidParam));
        assert_eq!(sync.init(32_000, 0, 0), Err(SyncError::InvalidParam));
        // 10 samples/s at 30 fps truncates to 0 samples per frame.
        assert_eq!(sync.init(10, 30, 0), Err(SyncError::InvalidParam));
    }

    #[test]
    fn zero_max_drift_defaults_to_two() {
        let sync = running(32_000, 30, 0);
        // Walk video 2 ahead: still inside the inclusive band.
        sync.frame_rendered();
        sync.frame_rendered();
        assert_eq!(sync.decision(), SyncDecision::Render);
        sync.frame_rendered();
        assert_eq!(sync.decision(), SyncDecision::Repeat);
    }

    #[test]
    fn decisions_require_running_state() {
        let sync = AvSync::new();
        assert_eq!(sync.decision(), SyncDecision::NotStarted);
        sync.init(32_000, 30, 0).unwrap();
        assert_eq!(sync.decision(), SyncDecision::NotStarted);
        sync.start().unwrap();
        assert_eq!(sync.decision(), SyncDecision::Render);
        sync.stop();
        assert_eq!(sync.decision(), SyncDecision::NotStarted);
    }

    #[test]
    fn start_is_rejected_while_running() {
        let sync = running(32_000, 30, 0);
        assert_eq!(sync.start(), Err(SyncError::InvalidState));
        sync.stop();
        assert!(sync.start().is_ok());
    }

    #[test]
    fn ticks_are_ignored_unless_running() {
        let sync = AvSync::new();
        sync.init(32_000, 30, 0).unwrap();
        sync.audio_tick(2048);
        assert_eq!(sync.samples_played(), 0);
        sync.start().unwrap();
        sync.audio_tick(2048);
        assert_eq!(sync.samples_played(), 2048);
        sync.stop();
        sync.audio_tick(2048);
        assert_eq!(sync.samples_played(), 2048);
    }

    /// Decision stream around a stall: after four
    /// half-buffer interrupts (8192 samples at 32 kHz / 30 fps) with only
    /// four frames committed, video is three behind and must skip once,
    /// then render back into the band.
    #[test]
    fn decision_stream_after_four_interrupts() {
        let sync = running(32_000, 30, 2);
        for _ in 0..4 {
            sync.audio_tick(2048);
        }
        for _ in 0..4 {
            sync.frame_rendered();
        }
        // audio_frame = 8192 / 1066 = 7, video = 4, drift = -3.
        assert_eq!(sync.current_frame(), 7);
        assert_eq!(sync.decision(), SyncDecision::Skip);

        sync.frame_skipped();
        // drift = -2: back inside the inclusive band.
        assert_eq!(sync.decision(), SyncDecision::Render);

        sync.frame_rendered();
        sync.frame_rendered();
        // video = 7, drift = 0.
        assert_eq!(sync.decision(), SyncDecision::Render);

        sync.frame_rendered();
        // video = 8, drift = +1: still within the band.
        assert_eq!(sync.decision(), SyncDecision::Render);

        let stats = sync.stats();
        assert_eq!(stats.frames_skipped, 1);
        assert_eq!(stats.min_drift, -3);
    }

    #[test]
    fn drift_stats_track_extremes() {
        let sync = running(1_000, 1, 1);
        sync.audio_tick(5_000); // audio_frame = 5, drift = -5
        let _ = sync.decision();
        for _ in 0..8 {
            sync.frame_rendered();
        }
        let _ = sync.decision(); // drift = +3
        let stats = sync.stats();
        assert_eq!(stats.min_drift, -5);
        assert_eq!(stats.max_drift, 3);
    }

    proptest::proptest! {
        /// Decision law: RENDER iff |drift| <= D, SKIP iff drift < -D,
        /// REPEAT iff drift > D, for the full (samples, frames) domain.
        #[test]
        fn decision_law(
            samples in 0u32..100_000_000,
            frames in 0u32..200_000,
            spf in 1u32..4_000,
            band in 1u32..10,
        ) {
            let sync = AvSync::new();
            sync.init(spf, 1, band).unwrap();
            sync.start().unwrap();
            sync.audio_tick(samples);
            for _ in 0..frames {
                sync.frame_rendered();
            }

            let drift = i64::from(frames) - i64::from(samples / spf);
            let expected = if drift < -i64::from(band) {
                SyncDecision::Skip
            } else if drift > i64::from(band) {
                SyncDecision::Repeat
            } else {
                SyncDecision::Render
            };
            proptest::prop_assert_eq!(sync.decision(), expected);
        }

        /// The sample counter is monotone under any tick sequence while
        /// running.
        #[test]
        fn samples_played_is_monotone(ticks in proptest::collection::vec(0u32..5_000, 0..50)) {
            let sync = AvSync::new();
            sync.init(32_000, 30, 0).unwrap();
            sync.start().unwrap();
            let mut prev = 0;
            for t in ticks {
                sync.audio_tick(t);
                let now = sync.samples_played();
                proptest::prop_assert!(now >= prev);
                prev = now;
            }
        }
    }
}
