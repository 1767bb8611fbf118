//! Status screens for the SSD1306, rendered with embedded-graphics.
//!
//! [`PageFrame`] adapts a raw 1024-byte page-packed framebuffer (8 pages
//! of 128 column bytes, bit 0 = top pixel of the page) as a `DrawTarget`,
//! so the boot banner, file-info page and completion statistics are plain
//! `embedded-graphics` text.

use core::fmt::Write as _;

use embedded_graphics::mono_font::ascii::FONT_6X10;
use embedded_graphics::mono_font::MonoTextStyle;
use embedded_graphics::pixelcolor::BinaryColor;
use embedded_graphics::prelude::*;
use embedded_graphics::text::{Baseline, Text};

use platform::dma_safety::{DISPLAY_HEIGHT, DISPLAY_WIDTH, FRAMEBUFFER_SIZE_BYTES};
use playback::PlaybackReport;

/// Line pitch used by the status screens.
const LINE_HEIGHT: i32 = 10;

/// A page-packed SSD1306 framebuffer as an embedded-graphics target.
pub struct PageFrame<'a> {
    buf: &'a mut [u8; FRAMEBUFFER_SIZE_BYTES],
}

impl<'a> PageFrame<'a> {
    /// Wrap a framebuffer.
    pub fn new(buf: &'a mut [u8; FRAMEBUFFER_SIZE_BYTES]) -> Self {
        Self { buf }
    }

    /// Blank the frame.
    pub fn clear(&mut self) {
        self.buf.fill(0);
    }
}

impl OriginDimensions for PageFrame<'_> {
    fn size(&self) -> Size {
        Size::new(DISPLAY_WIDTH, DISPLAY_HEIGHT)
    }
}

impl DrawTarget for PageFrame<'_> {
    type Color = BinaryColor;
    type Error = core::convert::Infallible;

    fn draw_iter<I>(&mut self, pixels: I) -> Result<(), Self::Error>
    where
        I: IntoIterator<Item = Pixel<Self::Color>>,
    {
        for Pixel(point, color) in pixels {
            if point.x < 0
                || point.y < 0
                || point.x >= DISPLAY_WIDTH as i32
                || point.y >= DISPLAY_HEIGHT as i32
            {
                continue;
            }
            let x = point.x as usize;
            let y = point.y as usize;
            let index = x + (y / 8) * DISPLAY_WIDTH as usize;
            let bit = 1u8 << (y % 8);
            match color {
                BinaryColor::On => self.buf[index] |= bit,
                BinaryColor::Off => self.buf[index] &= !bit,
            }
        }
        Ok(())
    }
}

fn style() -> MonoTextStyle<'static, BinaryColor> {
    MonoTextStyle::new(&FONT_6X10, BinaryColor::On)
}

fn draw_line(frame: &mut PageFrame<'_>, line: i32, text: &str) {
    // Infallible target; the draw cannot fail.
    let _ = Text::with_baseline(
        text,
        Point::new(0, line * LINE_HEIGHT),
        style(),
        Baseline::Top,
    )
    .draw(frame);
}

/// Draw consecutive text lines from the top of a blanked frame.
pub fn draw_status_lines(buf: &mut [u8; FRAMEBUFFER_SIZE_BYTES], lines: &[&str]) {
    let mut frame = PageFrame::new(buf);
    frame.clear();
    for (i, text) in lines.iter().enumerate() {
        draw_line(&mut frame, i as i32, text);
    }
}

/// Boot banner.
pub fn draw_banner(buf: &mut [u8; FRAMEBUFFER_SIZE_BYTES]) {
    draw_status_lines(buf, &["Bad Apple", "STM32L4 A/V player"]);
}

/// What the file-info page shows.
#[derive(Debug, Clone, Copy)]
pub struct MediaInfo {
    /// Total video frames.
    pub frame_count: u32,
    /// Audio sample rate in Hz.
    pub sample_rate: u32,
    /// Audio channel count.
    pub channels: u32,
    /// Playback length in whole seconds.
    pub duration_secs: u32,
    /// Whether the contiguous fast path is active.
    pub contiguous: bool,
}

/// File-info page shown before playback starts.
pub fn draw_file_info(buf: &mut [u8; FRAMEBUFFER_SIZE_BYTES], info: &MediaInfo) {
    let mut frame = PageFrame::new(buf);
    frame.clear();

    let mut line: heapless::String<24> = heapless::String::new();
    let _ = write!(line, "{} frames", info.frame_count);
    draw_line(&mut frame, 0, &line);

    line.clear();
    let _ = write!(line, "{}Hz {}ch", info.sample_rate, info.channels);
    draw_line(&mut frame, 1, &line);

    line.clear();
    let _ = write!(
        line,
        "Duration: {}:{:02}",
        info.duration_secs / 60,
        info.duration_secs % 60
    );
    draw_line(&mut frame, 2, &line);

    draw_line(
        &mut frame,
        3,
        if info.contiguous { "CONTIGUOUS" } else { "FRAGMENTED" },
    );
    draw_line(&mut frame, 5, "Starting...");
}

/// Completion statistics page.
pub fn draw_stats(buf: &mut [u8; FRAMEBUFFER_SIZE_BYTES], report: &PlaybackReport) {
    let mut frame = PageFrame::new(buf);
    frame.clear();

    draw_line(&mut frame, 0, "COMPLETE!");

    let mut line: heapless::String<24> = heapless::String::new();
    let _ = write!(line, "Rendered:{}", report.frames_rendered);
    draw_line(&mut frame, 1, &line);

    line.clear();
    let _ = write!(
        line,
        "Skip:{} Rep:{}",
        report.frames_skipped, report.frames_repeated
    );
    draw_line(&mut frame, 2, &line);

    line.clear();
    let _ = write!(line, "Refills:{}", report.refill_count);
    draw_line(&mut frame, 3, &line);

    line.clear();
    let _ = write!(line, "Max fill:{}us", report.max_refill_us);
    draw_line(&mut frame, 4, &line);

    line.clear();
    let _ = write!(line, "Underruns:{}", report.underrun_count);
    draw_line(&mut frame, 5, &line);
}
