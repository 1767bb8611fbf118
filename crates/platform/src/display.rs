//! Display frame transport abstraction.

use crate::dma_safety::FRAMEBUFFER_SIZE_BYTES;

/// One-way transport that moves a rendered frame to the display.
///
/// The playback engine hands over the queue's transfer slot and expects the
/// transport to eventually cause `FrameQueue::transfer_complete` to run
/// (from the DMA-completion interrupt on hardware, or explicitly in tests).
pub trait FrameLink {
    /// Error type.
    type Error: core::fmt::Debug;

    /// Begin transferring `frame` to the display.
    ///
    /// The reference is only valid for the duration of this call, but the
    /// caller guarantees the underlying buffer stays untouched until the
    /// completion path runs, so DMA-backed implementations may retain the
    /// address. A returned error means nothing was started and the caller
    /// will release the transfer slot.
    fn begin_transfer(
        &mut self,
        frame: &[u8; FRAMEBUFFER_SIZE_BYTES],
    ) -> Result<(), Self::Error>;
}

impl<T: FrameLink + ?Sized> FrameLink for &mut T {
    type Error = T::Error;

    fn begin_transfer(
        &mut self,
        frame: &[u8; FRAMEBUFFER_SIZE_BYTES],
    ) -> Result<(), Self::Error> {
        (**self).begin_transfer(frame)
    }
}
