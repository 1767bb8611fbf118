//! Triple-buffered display path.
//!
//! Three 1024-byte framebuffers rotate through the roles
//! `{render, ready, transfer}`:
//!
//! ```text
//! render ──swap_buffers()──▶ ready ──start_transfer()──▶ transfer
//! ```
//!
//! The foreground draws into `render` and queues it with a render↔ready
//! swap; the transfer kickoff swaps ready↔transfer. Under back-pressure a
//! newer rendered frame simply supersedes an unsent ready frame, and the
//! in-flight transfer buffer is never touched. Both swaps run with
//! interrupts masked so the three indices always remain a permutation of
//! `{0, 1, 2}`.

use core::cell::Cell;
use core::sync::atomic::{AtomicU32, Ordering};

use critical_section::Mutex;
use platform::dma_safety::{
    DmaBuffer, Sram1Region, FRAMEBUFFER_COUNT, FRAMEBUFFER_SIZE_BYTES,
};
use platform::FrameLink;

/// The triple framebuffer storage.
pub type FrameBuffers =
    DmaBuffer<Sram1Region, [[u8; FRAMEBUFFER_SIZE_BYTES]; FRAMEBUFFER_COUNT]>;

/// Slot assignment. Kept `Copy` inside a `Cell` so the whole permutation
/// updates in one masked section.
#[derive(Clone, Copy)]
struct Slots {
    render: u8,
    ready: u8,
    transfer: u8,
    busy: bool,
}

const INITIAL_SLOTS: Slots = Slots {
    render: 0,
    ready: 2,
    transfer: 1,
    busy: false,
};

/// Display transfer error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum DisplayError {
    /// The transport refused to start the transfer.
    Link,
}

/// ISR-facing triple-buffer state.
///
/// Lives in a plain `static`. The foreground mutates the slot permutation
/// under a critical section; the transfer-completion ISR only touches
/// `busy` and the transferred counter.
pub struct FrameQueue {
    slots: Mutex<Cell<Slots>>,
    frames_rendered: AtomicU32,
    frames_transferred: AtomicU32,
}

impl FrameQueue {
    /// New queue with the initial role assignment.
    pub const fn new() -> Self {
        Self {
            slots: Mutex::new(Cell::new(INITIAL_SLOTS)),
            frames_rendered: AtomicU32::new(0),
            frames_transferred: AtomicU32::new(0),
        }
    }

    /// Restore the initial assignment and zero the counters.
    pub fn reset(&self) {
        critical_section::with(|cs| self.slots.borrow(cs).set(INITIAL_SLOTS));
        self.frames_rendered.store(0, Ordering::Relaxed);
        self.frames_transferred.store(0, Ordering::Relaxed);
    }

    /// Index of the slot the foreground may draw into.
    pub fn render_index(&self) -> usize {
        critical_section::with(|cs| self.slots.borrow(cs).get().render) as usize
    }

    /// Queue the just-drawn frame: swap render↔ready and count it.
    ///
    /// A frame still sitting in `ready` is superseded; its slot becomes the
    /// next render target.
    pub fn swap_buffers(&self) {
        critical_section::with(|cs| {
            let cell = self.slots.borrow(cs);
            let mut s = cell.get();
            core::mem::swap(&mut s.render, &mut s.ready);
            cell.set(s);
            self.frames_rendered.fetch_add(1, Ordering::Relaxed);
        });
    }

    /// True when a queued frame is waiting to be sent.
    pub fn has_frame(&self) -> bool {
        self.frames_rendered.load(Ordering::Relaxed)
            > self.frames_transferred.load(Ordering::Relaxed)
    }

    /// Claim the queued frame for transfer.
    ///
    /// Swaps ready↔transfer, marks the queue busy and returns the transfer
    /// slot index. Returns `None` when a transfer is already in flight or
    /// nothing is queued.
    pub fn start_transfer(&self) -> Option<usize> {
        critical_section::with(|cs| {
            let cell = self.slots.borrow(cs);
            let mut s = cell.get();
            if s.busy || !self.has_frame() {
                return None;
            }
            core::mem::swap(&mut s.ready, &mut s.transfer);
            s.busy = true;
            cell.set(s);
            Some(s.transfer as usize)
        })
    }

    /// Release a claim when the transport failed to start.
    ///
    /// Reverses the ready↔transfer swap so the frame stays queued and no
    /// transfer is counted.
    pub fn abort_transfer(&self) {
        critical_section::with(|cs| {
            let cell = self.slots.borrow(cs);
            let mut s = cell.get();
            if s.busy {
                core::mem::swap(&mut s.ready, &mut s.transfer);
                s.busy = false;
                cell.set(s);
            }
        });
    }

    /// Transfer-completion ISR entry point.
    pub fn transfer_complete(&self) {
        critical_section::with(|cs| {
            let cell = self.slots.borrow(cs);
            let mut s = cell.get();
            s.busy = false;
            cell.set(s);
        });
        self.frames_transferred.fetch_add(1, Ordering::Relaxed);
    }

    /// True while a transfer is in flight.
    pub fn transfer_busy(&self) -> bool {
        critical_section::with(|cs| self.slots.borrow(cs).get().busy)
    }

    /// `(frames_rendered, frames_transferred)` snapshot.
    pub fn counts(&self) -> (u32, u32) {
        (
            self.frames_rendered.load(Ordering::Relaxed),
            self.frames_transferred.load(Ordering::Relaxed),
        )
    }

    /// `(render, ready, transfer, busy)` snapshot for invariant checks.
    pub fn slot_snapshot(&self) -> (usize, usize, usize, bool) {
        critical_section::with(|cs| {
            let s = self.slots.borrow(cs).get();
            (s.render as usize, s.ready as usize, s.transfer as usize, s.busy)
        })
    }
}

impl Default for FrameQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// Foreground half of the display path: the three framebuffers plus the
/// transport kickoff.
pub struct DisplayPipeline {
    queue: &'static FrameQueue,
    bufs: &'static mut FrameBuffers,
}

impl DisplayPipeline {
    /// Take ownership of the framebuffers, blank them and reset the queue.
    pub fn new(queue: &'static FrameQueue, bufs: &'static mut FrameBuffers) -> Self {
        for frame in bufs.data.iter_mut() {
            frame.fill(0);
        }
        queue.reset();
        Self { queue, bufs }
    }

    /// The shared queue (for wiring the completion ISR and tests).
    pub fn queue(&self) -> &'static FrameQueue {
        self.queue
    }

    /// The buffer the foreground may draw into.
    pub fn render_buffer(&mut self) -> &mut [u8; FRAMEBUFFER_SIZE_BYTES] {
        let index = self.queue.render_index();
        &mut self.bufs.data[index]
    }

    /// Queue the just-drawn frame.
    pub fn swap_buffers(&mut self) {
        self.queue.swap_buffers();
    }

    /// Kick off a transfer when the transport is idle and a frame is
    /// queued.
    ///
    /// Returns `Ok(true)` when a transfer started. If the transport refuses
    /// to start, the claim is rolled back so the frame stays queued.
    pub fn kick<L: FrameLink>(&mut self, link: &mut L) -> Result<bool, DisplayError> {
        let Some(index) = self.queue.start_transfer() else {
            return Ok(false);
        };
        match link.begin_transfer(&self.bufs.data[index]) {
            Ok(()) => Ok(true),
            Err(_) => {
                self.queue.abort_transfer();
                Err(DisplayError::Link)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use platform::mocks::MockFrameLink;

    fn leaked() -> (&'static FrameQueue, DisplayPipeline) {
        let queue: &'static FrameQueue = Box::leak(Box::new(FrameQueue::new()));
        let bufs: &'static mut FrameBuffers = Box::leak(Box::new(DmaBuffer::new(
            [[0u8; FRAMEBUFFER_SIZE_BYTES]; FRAMEBUFFER_COUNT],
        )));
        (queue, DisplayPipeline::new(queue, bufs))
    }

    fn assert_permutation(queue: &FrameQueue) {
        let (r, q, t, _) = queue.slot_snapshot();
        let mut seen = [false; FRAMEBUFFER_COUNT];
        seen[r] = true;
        seen[q] = true;
        seen[t] = true;
        assert!(seen.iter().all(|&s| s), "indices {r},{q},{t} are not a permutation");
    }

    #[test]
    fn initial_assignment_matches_reset_state() {
        let (queue, _) = leaked();
        assert_eq!(queue.slot_snapshot(), (0, 2, 1, false));
        assert!(!queue.has_frame());
    }

    #[test]
    fn start_transfer_requires_a_queued_frame() {
        let (queue, _) = leaked();
        assert_eq!(queue.start_transfer(), None);
    }

    #[test]
    fn start_transfer_refuses_while_busy() {
        let (queue, _) = leaked();
        queue.swap_buffers();
        assert!(queue.start_transfer().is_some());
        queue.swap_buffers();
        assert_eq!(queue.start_transfer(), None);
        queue.transfer_complete();
        assert!(queue.start_transfer().is_some());
    }

    /// Back-pressure: render A, then render B before any
    /// transfer starts. B supersedes A, the transfer sends B, and the
    /// counters lag until the completion interrupt.
    #[test]
    fn newer_frame_supersedes_unsent_ready_frame() {
        let (queue, mut display) = leaked();
        let mut link = MockFrameLink::new();

        display.render_buffer().fill(0xAA);
        display.swap_buffers();
        display.render_buffer().fill(0xBB);
        display.swap_buffers();

        assert_eq!(queue.counts(), (2, 0));
        assert!(display.kick(&mut link).unwrap());
        assert_eq!(queue.counts(), (2, 0));

        queue.transfer_complete();
        assert_eq!(queue.counts(), (2, 1));

        // The frame that went out is B; A was overwritten in place.
        assert_eq!(link.frames.len(), 1);
        assert!(link.frames[0].iter().all(|&b| b == 0xBB));
    }

    #[test]
    fn failed_kickoff_rolls_back_the_claim() {
        let (queue, mut display) = leaked();
        let mut link = MockFrameLink::new();

        display.render_buffer().fill(0x11);
        display.swap_buffers();

        link.fail_next = true;
        assert_eq!(display.kick(&mut link), Err(DisplayError::Link));
        assert!(!queue.transfer_busy());
        assert!(queue.has_frame());
        assert_eq!(queue.counts(), (1, 0));

        // The same frame goes out on the retry.
        assert!(display.kick(&mut link).unwrap());
        queue.transfer_complete();
        assert!(link.frames[0].iter().all(|&b| b == 0x11));
    }

    #[test]
    fn rendered_never_falls_behind_transferred() {
        let (queue, mut display) = leaked();
        let mut link = MockFrameLink::new();

        for _ in 0..10 {
            display.render_buffer().fill(0x42);
            display.swap_buffers();
            let (rendered, transferred) = queue.counts();
            assert!(rendered >= transferred);
            if display.kick(&mut link).unwrap() {
                queue.transfer_complete();
            }
            let (rendered, transferred) = queue.counts();
            assert!(rendered >= transferred);
        }
    }

    proptest::proptest! {
        /// For any interleaving of swap / start / complete, the three slot
        /// indices stay a permutation of {0,1,2} and the counters never
        /// cross.
        #[test]
        fn slots_stay_a_permutation(ops in proptest::collection::vec(0u8..3, 1..200)) {
            let queue = FrameQueue::new();
            let mut in_flight = false;
            for op in ops {
                match op {
                    0 => queue.swap_buffers(),
                    1 => {
                        if queue.start_transfer().is_some() {
                            in_flight = true;
                        }
                    }
                    _ => {
                        // The completion ISR only ever fires for a started
                        // transfer.
                        if in_flight {
                            queue.transfer_complete();
                            in_flight = false;
                        }
                    }
                }
                assert_permutation(&queue);
                let (rendered, transferred) = queue.counts();
                proptest::prop_assert!(rendered >= transferred);
            }
        }
    }
}
