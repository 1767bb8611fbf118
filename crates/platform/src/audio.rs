//! Stereo DAC output abstraction.

/// DAC output value for silence: the 12-bit midpoint (0x800), which sits at
/// mid-rail on both channels.
pub const DAC_SILENCE: u16 = 0x800;

/// Dual-channel DAC driven by circular DMA from a periodic timer trigger.
///
/// Both channels advance in lock step from the same trigger; only the left
/// channel raises half-complete / transfer-complete interrupts (the right
/// channel follows silently). The interrupt side is not part of this trait:
/// the hardware layer routes those interrupts to the audio pipeline's shared
/// state directly.
pub trait StereoDac {
    /// Error type.
    type Error: core::fmt::Debug;

    /// Arm both channels with circular DMA over the full sample rings and
    /// start the sample-clock trigger.
    ///
    /// `left` and `right` each point at `samples` consecutive `u16` values
    /// (12-bit right-aligned). The DMA engine reads them from this call
    /// until [`stop`](Self::stop), so the memory must stay valid and the
    /// caller must only ever write the half the DMA is not playing.
    fn start(&mut self, left: *const u16, right: *const u16, samples: usize)
        -> Result<(), Self::Error>;

    /// Stop the trigger and both DMA streams.
    fn stop(&mut self);
}

impl<T: StereoDac + ?Sized> StereoDac for &mut T {
    type Error = T::Error;

    fn start(
        &mut self,
        left: *const u16,
        right: *const u16,
        samples: usize,
    ) -> Result<(), Self::Error> {
        (**self).start(left, right, samples)
    }

    fn stop(&mut self) {
        (**self).stop();
    }
}
