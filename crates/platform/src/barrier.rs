//! Data memory barrier shim.
//!
//! Buffers shared with a DMA engine must be fully written before the
//! ownership flag is flipped. On Cortex-M that needs a `DMB`; on the host
//! a compiler fence keeps the test-visible ordering equivalent.

/// Complete all outstanding memory accesses before continuing.
///
/// Call after writing a DMA buffer and before publishing it (clearing
/// `needs_refill`, kicking a transfer).
#[inline]
pub fn dmb() {
    #[cfg(all(target_arch = "arm", target_os = "none"))]
    cortex_m::asm::dmb();

    #[cfg(not(all(target_arch = "arm", target_os = "none")))]
    core::sync::atomic::compiler_fence(core::sync::atomic::Ordering::SeqCst);
}
