//! Double-buffered circular DAC audio pipeline.
//!
//! Two equal circular rings (left and right channel) are armed as
//! independent circular DMA streams fed by the same timer trigger, so the
//! channels advance in lock step. Only the LEFT channel raises interrupts;
//! the RIGHT follows silently.
//!
//! ```text
//! [------ first half (2048) ------][------ second half (2048) ------]
//!          DMA playing this half  |  foreground refills this half
//! ```
//!
//! Ownership of each half alternates at the half-complete and
//! transfer-complete interrupts. The ISR-facing bookkeeping lives in
//! [`AudioShared`] (word-sized atomics in a const-initialized struct the
//! interrupt handlers can reach); the buffers and the state machine live in
//! [`AudioPipeline`], owned by the foreground.

use core::sync::atomic::{AtomicBool, AtomicPtr, AtomicU32, AtomicU8, Ordering};

use platform::barrier;
use platform::dma_safety::{
    DmaBuffer, Sram1Region, AUDIO_FULL_BUFFER_SAMPLES, AUDIO_HALF_BUFFER_SAMPLES,
};
use platform::{StereoDac, DAC_SILENCE};

use crate::av_sync::AvSync;

/// One channel's full circular ring.
pub type AudioRing = DmaBuffer<Sram1Region, [u16; AUDIO_FULL_BUFFER_SAMPLES]>;

/// Which half of the rings the foreground must fill next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum BufferHalf {
    /// Samples `[0, N)`.
    First,
    /// Samples `[N, 2N)`.
    Second,
}

/// Pipeline lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum AudioState {
    /// Not initialized.
    Reset,
    /// Buffers primed with silence; ready to start.
    Ready,
    /// DMA streaming.
    Playing,
    /// Fatal DMA failure; only useful for post-mortem.
    Error,
}

/// Pipeline error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum AudioError {
    /// The call is not legal in the current state.
    InvalidState,
    /// The DAC driver refused to start.
    Dac,
}

/// Counters maintained across a playback run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct AudioStats {
    /// Total samples handed to the DAC (per channel).
    pub samples_played: u32,
    /// Half-buffer refills completed by the foreground.
    pub refill_count: u32,
    /// Interrupts that found the previous refill still pending.
    pub underrun_count: u32,
}

/// ISR-facing half of the audio pipeline.
///
/// Lives in a plain `static`; the DMA interrupt handlers for the LEFT
/// channel call [`isr_half_complete`](Self::isr_half_complete) and
/// [`isr_transfer_complete`](Self::isr_transfer_complete) directly.
pub struct AudioShared {
    needs_refill: AtomicBool,
    fill_half: AtomicU8,
    samples_played: AtomicU32,
    refill_count: AtomicU32,
    underrun_count: AtomicU32,
    sync: AtomicPtr<AvSync>,
}

impl AudioShared {
    /// New shared state, flags clear.
    pub const fn new() -> Self {
        Self {
            needs_refill: AtomicBool::new(false),
            fill_half: AtomicU8::new(0),
            samples_played: AtomicU32::new(0),
            refill_count: AtomicU32::new(0),
            underrun_count: AtomicU32::new(0),
            sync: AtomicPtr::new(core::ptr::null_mut()),
        }
    }

    /// Attach the synchronizer ticked from the ISR.
    ///
    /// Call before the DMA starts; the audio interrupt dereferences this
    /// without further coordination.
    pub fn attach_sync(&self, sync: &'static AvSync) {
        self.sync
            .store(sync as *const AvSync as *mut AvSync, Ordering::Release);
    }

    /// Clear the refill flags and counters. An attached synchronizer stays
    /// attached.
    pub fn reset(&self) {
        self.needs_refill.store(false, Ordering::Relaxed);
        self.fill_half.store(0, Ordering::Relaxed);
        self.samples_played.store(0, Ordering::Relaxed);
        self.refill_count.store(0, Ordering::Relaxed);
        self.underrun_count.store(0, Ordering::Relaxed);
    }

    /// LEFT-channel half-transfer interrupt: the DAC finished `[0, N)` and
    /// is now playing `[N, 2N)`, so the first half is the foreground's.
    pub fn isr_half_complete(&self) {
        self.on_dma_event(BufferHalf::First);
    }

    /// LEFT-channel transfer-complete interrupt: the DAC finished `[N, 2N)`
    /// and wrapped to `[0, N)`, so the second half is the foreground's.
    pub fn isr_transfer_complete(&self) {
        self.on_dma_event(BufferHalf::Second);
    }

    fn on_dma_event(&self, half: BufferHalf) {
        self.fill_half.store(half as u8, Ordering::Relaxed);

        // A refill still pending here means the half about to be handed out
        // was never filled: the DAC replays stale samples until the
        // foreground catches up. Count each missed interval.
        if self.needs_refill.swap(true, Ordering::AcqRel) {
            self.underrun_count.fetch_add(1, Ordering::Relaxed);
        }

        self.samples_played
            .fetch_add(AUDIO_HALF_BUFFER_SAMPLES as u32, Ordering::Relaxed);

        let sync = self.sync.load(Ordering::Acquire);
        if !sync.is_null() {
            // SAFETY: attach_sync stores a &'static AvSync, so the pointer
            // is valid for the life of the program once non-null.
            unsafe { &*sync }.audio_tick(AUDIO_HALF_BUFFER_SAMPLES as u32);
        }
    }

    /// True when a half is waiting for the foreground.
    pub fn needs_refill(&self) -> bool {
        self.needs_refill.load(Ordering::Acquire)
    }

    /// Which half to write next.
    pub fn fill_half(&self) -> BufferHalf {
        if self.fill_half.load(Ordering::Relaxed) == 0 {
            BufferHalf::First
        } else {
            BufferHalf::Second
        }
    }

    /// Hand the just-written half back to the DMA.
    pub fn buffer_filled(&self) {
        // The samples must be visible to the DMA engine before the flag
        // clears.
        barrier::dmb();
        self.needs_refill.store(false, Ordering::Release);
        self.refill_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Counter snapshot.
    pub fn stats(&self) -> AudioStats {
        AudioStats {
            samples_played: self.samples_played.load(Ordering::Relaxed),
            refill_count: self.refill_count.load(Ordering::Relaxed),
            underrun_count: self.underrun_count.load(Ordering::Relaxed),
        }
    }
}

impl Default for AudioShared {
    fn default() -> Self {
        Self::new()
    }
}

/// Foreground half of the audio pipeline: the rings and the state machine.
pub struct AudioPipeline {
    shared: &'static AudioShared,
    left: &'static mut AudioRing,
    right: &'static mut AudioRing,
    state: AudioState,
}

impl AudioPipeline {
    /// Take ownership of the rings, prime them with DAC silence and reset
    /// the shared counters.
    ///
    /// Priming guarantees the mandatory pre-start condition: if playback
    /// starts before both halves are filled with media audio, the DAC emits
    /// silence rather than garbage.
    pub fn new(
        shared: &'static AudioShared,
        left: &'static mut AudioRing,
        right: &'static mut AudioRing,
    ) -> Self {
        left.data.fill(DAC_SILENCE);
        right.data.fill(DAC_SILENCE);
        shared.reset();
        Self {
            shared,
            left,
            right,
            state: AudioState::Ready,
        }
    }

    /// The ISR-facing state (for wiring interrupt handlers and tests).
    pub fn shared(&self) -> &'static AudioShared {
        self.shared
    }

    /// Current lifecycle state.
    pub fn state(&self) -> AudioState {
        self.state
    }

    /// True when a half is waiting for the foreground.
    pub fn needs_refill(&self) -> bool {
        self.shared.needs_refill()
    }

    /// Mutable views of the given half of both rings.
    pub fn half_regions(&mut self, half: BufferHalf) -> (&mut [u16], &mut [u16]) {
        let start = match half {
            BufferHalf::First => 0,
            BufferHalf::Second => AUDIO_HALF_BUFFER_SAMPLES,
        };
        let end = start + AUDIO_HALF_BUFFER_SAMPLES;
        (&mut self.left.data[start..end], &mut self.right.data[start..end])
    }

    /// Mutable views of the half the ISR asked the foreground to fill.
    ///
    /// Per the ownership contract this is always the half the DMA is *not*
    /// playing.
    pub fn fill_regions(&mut self) -> (&mut [u16], &mut [u16]) {
        let half = self.shared.fill_half();
        self.half_regions(half)
    }

    /// Hand the just-written half back to the DMA.
    pub fn buffer_filled(&mut self) {
        self.shared.buffer_filled();
    }

    /// Arm both channels and start the sample clock.
    ///
    /// Both halves must already hold valid audio (or the silence priming
    /// from [`new`](Self::new)).
    pub fn start<D: StereoDac>(&mut self, dac: &mut D) -> Result<(), AudioError> {
        if self.state != AudioState::Ready {
            return Err(AudioError::InvalidState);
        }
        match dac.start(
            self.left.data.as_ptr(),
            self.right.data.as_ptr(),
            AUDIO_FULL_BUFFER_SAMPLES,
        ) {
            Ok(()) => {
                self.state = AudioState::Playing;
                Ok(())
            }
            Err(_) => {
                self.state = AudioState::Error;
                Err(AudioError::Dac)
            }
        }
    }

    /// Stop the sample clock and both DMA streams.
    pub fn stop<D: StereoDac>(&mut self, dac: &mut D) {
        if self.state == AudioState::Playing {
            dac.stop();
            self.state = AudioState::Ready;
        }
    }

    /// Counter snapshot.
    pub fn stats(&self) -> AudioStats {
        self.shared.stats()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use platform::mocks::MockDac;

    fn leaked_ring() -> &'static mut AudioRing {
        Box::leak(Box::new(DmaBuffer::new([0u16; AUDIO_FULL_BUFFER_SAMPLES])))
    }

    fn pipeline() -> (AudioPipeline, &'static AudioShared) {
        let shared: &'static AudioShared = Box::leak(Box::new(AudioShared::new()));
        let pipeline = AudioPipeline::new(shared, leaked_ring(), leaked_ring());
        (pipeline, shared)
    }

    #[test]
    fn new_primes_both_rings_with_silence() {
        let (mut p, _) = pipeline();
        let (l, r) = p.half_regions(BufferHalf::First);
        assert!(l.iter().all(|&s| s == DAC_SILENCE));
        assert!(r.iter().all(|&s| s == DAC_SILENCE));
        let (l, r) = p.half_regions(BufferHalf::Second);
        assert!(l.iter().all(|&s| s == DAC_SILENCE));
        assert!(r.iter().all(|&s| s == DAC_SILENCE));
        assert_eq!(p.state(), AudioState::Ready);
    }

    #[test]
    fn isr_events_alternate_the_fill_half() {
        let (p, shared) = pipeline();
        assert!(!p.needs_refill());

        shared.isr_half_complete();
        assert!(p.needs_refill());
        assert_eq!(shared.fill_half(), BufferHalf::First);

        shared.buffer_filled();
        shared.isr_transfer_complete();
        assert_eq!(shared.fill_half(), BufferHalf::Second);
    }

    #[test]
    fn refill_counters_advance_by_half_buffer() {
        let (_, shared) = pipeline();
        shared.isr_half_complete();
        shared.buffer_filled();
        shared.isr_transfer_complete();
        shared.buffer_filled();

        let stats = shared.stats();
        assert_eq!(stats.samples_played, 2 * AUDIO_HALF_BUFFER_SAMPLES as u32);
        assert_eq!(stats.refill_count, 2);
        assert_eq!(stats.underrun_count, 0);
    }

    /// A second interrupt arriving while the refill is still pending is an
    /// underrun: the DAC replays the stale half.
    #[test]
    fn missed_refill_counts_an_underrun() {
        let (_, shared) = pipeline();
        shared.isr_half_complete();
        // Foreground sleeps...
        shared.isr_transfer_complete();
        assert_eq!(shared.stats().underrun_count, 1);
        // Still pending; a third miss counts again.
        shared.isr_half_complete();
        assert_eq!(shared.stats().underrun_count, 2);
    }

    #[test]
    fn isr_ticks_attached_synchronizer() {
        let (_, shared) = pipeline();
        let sync: &'static AvSync = Box::leak(Box::new(AvSync::new()));
        sync.init(32_000, 30, 0).unwrap();
        sync.start().unwrap();
        shared.attach_sync(sync);

        shared.isr_half_complete();
        shared.isr_transfer_complete();
        assert_eq!(sync.samples_played(), 2 * AUDIO_HALF_BUFFER_SAMPLES as u32);
    }

    #[test]
    fn start_arms_full_rings_and_tracks_state() {
        let (mut p, _) = pipeline();
        let mut dac = MockDac::new();
        p.start(&mut dac).unwrap();
        assert_eq!(p.state(), AudioState::Playing);
        assert_eq!(dac.samples, AUDIO_FULL_BUFFER_SAMPLES);
        assert!(dac.running);

        // Starting twice is a state error.
        assert_eq!(p.start(&mut dac), Err(AudioError::InvalidState));

        p.stop(&mut dac);
        assert_eq!(p.state(), AudioState::Ready);
        assert!(!dac.running);
    }

    #[test]
    fn dac_failure_is_fatal() {
        let (mut p, _) = pipeline();
        let mut dac = MockDac::new();
        dac.fail_start = true;
        assert_eq!(p.start(&mut dac), Err(AudioError::Dac));
        assert_eq!(p.state(), AudioState::Error);
        // No restart path out of Error.
        assert_eq!(p.start(&mut dac), Err(AudioError::InvalidState));
    }

    /// Ownership rule: the half handed out for filling is never the half
    /// the DMA is playing (the DMA plays the opposite of `fill_half`).
    #[test]
    fn fill_regions_never_alias_the_playing_half() {
        let (mut p, shared) = pipeline();
        let mut dac = MockDac::new();
        p.start(&mut dac).unwrap();

        // After half-complete the DMA reads [N, 2N); the foreground gets
        // [0, N).
        shared.isr_half_complete();
        {
            let (l, _) = p.fill_regions();
            l.fill(0xAAA);
            p.buffer_filled();
        }
        let playing = dac.left_samples(AUDIO_HALF_BUFFER_SAMPLES, AUDIO_HALF_BUFFER_SAMPLES);
        assert!(playing.iter().all(|&s| s == DAC_SILENCE), "wrote into the playing half");

        // After transfer-complete the roles swap.
        shared.isr_transfer_complete();
        {
            let (l, _) = p.fill_regions();
            l.fill(0xBBB);
            p.buffer_filled();
        }
        let playing = dac.left_samples(0, AUDIO_HALF_BUFFER_SAMPLES);
        assert!(playing.iter().all(|&s| s == 0xAAA), "first half was clobbered");
    }
}
