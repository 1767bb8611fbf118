//! Microsecond timebase for diagnostics.

/// Free-running microsecond counter.
///
/// Used by the playback engine to time half-buffer refills and pace the
/// heartbeat LED. The counter wraps at `u32::MAX`; callers measure
/// intervals with `wrapping_sub`, so absolute values carry no meaning.
pub trait MicrosClock {
    /// Current counter value in microseconds.
    fn now_micros(&self) -> u32;
}

impl<T: MicrosClock + ?Sized> MicrosClock for &T {
    fn now_micros(&self) -> u32 {
        (**self).now_micros()
    }
}

impl<T: MicrosClock + ?Sized> MicrosClock for &mut T {
    fn now_micros(&self) -> u32 {
        (**self).now_micros()
    }
}
