//! STM32L476RG bring-up and interrupt wiring.
//!
//! # Pin assignments
//!
//! - PA4 `DAC1_OUT1` — left audio channel
//! - PA5 `DAC1_OUT2` — right audio channel
//! - PC10/PC11/PC12 `SPI3` — SD card (CS on PB6)
//! - PB10/PB11 `I2C2` — SSD1306 OLED
//! - PB3 — status LED
//!
//! # Interrupt priorities (highest first)
//!
//! Audio DAC DMA completion outranks everything else so the half-buffer
//! bookkeeping (`needs_refill`, the sample counter feeding A/V sync) is
//! never starved by display or SD traffic. Only the LEFT channel's DMA
//! interrupt is enabled; the RIGHT channel follows the same timer trigger
//! silently.
//!
//! # DMA routing (RM0351 §11)
//!
//! - DAC channel 1 ← DMA1 channel 3 (`C3S = 0b0110`), circular,
//!   half-transfer + transfer-complete interrupts
//! - DAC channel 2 ← DMA2 channel 5 (`C5S = 0b0011`), circular, silent

#![cfg(feature = "hardware")]
#![allow(clippy::missing_docs_in_private_items)]

use cortex_m::peripheral::NVIC;
use embassy_stm32::gpio::{Level, Output, Speed};
use embassy_stm32::pac;
use embassy_stm32::time::Hertz;
use embassy_time::Delay;
use static_cell::StaticCell;

use platform::dma_safety::{AUDIO_FULL_BUFFER_SAMPLES, FRAMEBUFFER_SIZE_BYTES};
use platform::{MicrosClock, StereoDac};
use playback::audio::{AudioPipeline, AudioRing, AudioShared};
use playback::av_sync::AvSync;
use playback::engine::Player;
use playback::frame_queue::{DisplayPipeline, FrameBuffers, FrameQueue};
use storage::{Fat32Volume, MediaFile};

use crate::boot::{
    DISPLAY_I2C_HZ, MEDIA_FILENAME, SD_DATA_CLOCK_HZ, SD_INIT_CLOCK_HZ,
    STARTUP_VOLUME_PERCENT, SYSCLK_HZ, TIM6_PERIOD, VIDEO_FPS,
};
use crate::ssd1306::{BlockingFrameLink, Ssd1306};
use crate::ui::{self, MediaInfo};
use crate::SdCard;

// ── ISR-shared singletons ───────────────────────────────────────────────────

/// Audio DMA bookkeeping reachable from the DMA1 channel 3 handler.
static AUDIO_SHARED: AudioShared = AudioShared::new();

/// Triple-buffer state shared with the display completion path.
static FRAME_QUEUE: FrameQueue = FrameQueue::new();

/// Audio-master synchronizer, ticked from the audio ISR.
static AVSYNC: AvSync = AvSync::new();

static LEFT_RING: StaticCell<AudioRing> = StaticCell::new();
static RIGHT_RING: StaticCell<AudioRing> = StaticCell::new();
static FRAMEBUFFERS: StaticCell<FrameBuffers> = StaticCell::new();

// ── Interrupt handlers ──────────────────────────────────────────────────────

/// LEFT channel (DAC1_OUT1) circular DMA: half-transfer and
/// transfer-complete drive the refill contract.
#[no_mangle]
unsafe extern "C" fn DMA1_CHANNEL3() {
    const CH: usize = 2; // channel 3, zero-based
    let isr = pac::DMA1.isr().read();
    if isr.htif(CH) {
        pac::DMA1.ifcr().write(|w| w.set_htif(CH, true));
        AUDIO_SHARED.isr_half_complete();
    }
    if isr.tcif(CH) {
        pac::DMA1.ifcr().write(|w| w.set_tcif(CH, true));
        AUDIO_SHARED.isr_transfer_complete();
    }
}

// ── Microsecond clock ───────────────────────────────────────────────────────

/// DWT cycle counter scaled to microseconds.
#[derive(Clone, Copy)]
pub struct DwtClock;

impl DwtClock {
    const CYCLES_PER_US: u32 = SYSCLK_HZ / 1_000_000;
}

impl MicrosClock for DwtClock {
    fn now_micros(&self) -> u32 {
        cortex_m::peripheral::DWT::cycle_count() / Self::CYCLES_PER_US
    }
}

// ── DAC + timer + DMA ───────────────────────────────────────────────────────

/// The on-chip dual DAC behind the [`StereoDac`] seam.
pub struct HwDac;

impl StereoDac for HwDac {
    type Error = core::convert::Infallible;

    fn start(
        &mut self,
        left: *const u16,
        right: *const u16,
        samples: usize,
    ) -> Result<(), Self::Error> {
        use pac::bdma::vals;

        // Peripheral clocks.
        pac::RCC.apb1enr1().modify(|w| {
            w.set_dac1en(true);
            w.set_tim6en(true);
        });
        pac::RCC.ahb1enr().modify(|w| {
            w.set_dma1en(true);
            w.set_dma2en(true);
        });

        // DMA1 channel 3 → DAC channel 1 (left, master: interrupts on).
        pac::DMA1.cselr().modify(|w| w.set_cs(2, 0b0110));
        let ch = pac::DMA1.ch(2);
        ch.cr().modify(|w| w.set_en(false));
        ch.par().write_value(pac::DAC1.dhr12r(0).as_ptr() as u32);
        ch.mar().write_value(left as u32);
        ch.ndtr().write(|w| w.set_ndt(samples as u16));
        ch.cr().write(|w| {
            w.set_dir(vals::Dir::FROM_MEMORY);
            w.set_circ(true);
            w.set_minc(true);
            w.set_psize(vals::Size::BITS16);
            w.set_msize(vals::Size::BITS16);
            w.set_pl(vals::Pl::VERY_HIGH);
            w.set_htie(true);
            w.set_tcie(true);
            w.set_en(true);
        });

        // DMA2 channel 5 → DAC channel 2 (right, silent follower).
        pac::DMA2.cselr().modify(|w| w.set_cs(4, 0b0011));
        let ch = pac::DMA2.ch(4);
        ch.cr().modify(|w| w.set_en(false));
        ch.par().write_value(pac::DAC1.dhr12r(1).as_ptr() as u32);
        ch.mar().write_value(right as u32);
        ch.ndtr().write(|w| w.set_ndt(samples as u16));
        ch.cr().write(|w| {
            w.set_dir(vals::Dir::FROM_MEMORY);
            w.set_circ(true);
            w.set_minc(true);
            w.set_psize(vals::Size::BITS16);
            w.set_msize(vals::Size::BITS16);
            w.set_pl(vals::Pl::VERY_HIGH);
            w.set_en(true);
        });

        // Both channels: TIM6 TRGO trigger, DMA requests on.
        pac::DAC1.cr().modify(|w| {
            w.set_tsel1(0); // TIM6_TRGO
            w.set_ten1(true);
            w.set_dmaen1(true);
            w.set_en1(true);
            w.set_tsel2(0);
            w.set_ten2(true);
            w.set_dmaen2(true);
            w.set_en2(true);
        });

        // TIM6 update event at the sample rate drives both conversions.
        pac::TIM6.psc().write_value(0);
        pac::TIM6.arr().write(|w| w.set_arr(TIM6_PERIOD as u16));
        pac::TIM6.cr2().modify(|w| w.set_mms(pac::timer::vals::Mms::UPDATE));
        pac::TIM6.cr1().modify(|w| w.set_cen(true));

        Ok(())
    }

    fn stop(&mut self) {
        pac::TIM6.cr1().modify(|w| w.set_cen(false));
        pac::DAC1.cr().modify(|w| {
            w.set_en1(false);
            w.set_en2(false);
        });
        pac::DMA1.ch(2).cr().modify(|w| w.set_en(false));
        pac::DMA2.ch(4).cr().modify(|w| w.set_en(false));
    }
}

fn configure_interrupts() {
    // Audio DMA above everything; SD/display stay polled in this build.
    unsafe {
        let mut core = cortex_m::Peripherals::steal();
        core.NVIC.set_priority(pac::Interrupt::DMA1_CHANNEL3, 0);
        NVIC::unmask(pac::Interrupt::DMA1_CHANNEL3);
    }
}

// ── Entry ───────────────────────────────────────────────────────────────────

fn rcc_config() -> embassy_stm32::Config {
    use embassy_stm32::rcc::*;

    // MSI 4 MHz × 40 / 2 = 80 MHz, the derivation boot::TIM6_PERIOD
    // assumes.
    let mut config = embassy_stm32::Config::default();
    config.rcc.msi = Some(MSIRange::RANGE4M);
    config.rcc.pll = Some(Pll {
        source: PllSource::MSI,
        prediv: PllPreDiv::DIV1,
        mul: PllMul::MUL40,
        divp: None,
        divq: None,
        divr: Some(PllRDiv::DIV2),
    });
    config.rcc.sys = Sysclk::PLL1_R;
    config
}

fn halt(led: &mut Output<'static>, period_ms: u64) -> ! {
    loop {
        led.toggle();
        embassy_time::block_for(embassy_time::Duration::from_millis(period_ms));
    }
}

fn show_lines<I2C: embedded_hal::i2c::I2c>(display: &mut Ssd1306<I2C>, lines: &[&str]) {
    let mut frame = [0u8; FRAMEBUFFER_SIZE_BYTES];
    ui::draw_status_lines(&mut frame, lines);
    let _ = display.write_frame(&frame);
}

/// Bring the board up and play the media file. Never returns.
pub fn run() -> ! {
    let p = embassy_stm32::init(rcc_config());
    defmt::info!("Bad Apple A/V player — STM32L476RG @ {=u32} MHz", SYSCLK_HZ / 1_000_000);

    // DWT cycle counter for refill timing.
    if let Some(mut core) = cortex_m::Peripherals::take() {
        core.DCB.enable_trace();
        core.DWT.enable_cycle_counter();
    }

    let mut led = Output::new(p.PB3, Level::Low, Speed::Low);

    // Display first so every later failure is visible.
    let i2c = embassy_stm32::i2c::I2c::new_blocking(
        p.I2C2,
        p.PB10,
        p.PB11,
        Hertz(DISPLAY_I2C_HZ),
        Default::default(),
    );
    let mut display = Ssd1306::new(i2c);
    if display.init(&mut Delay).is_err() {
        defmt::error!("display init failed");
        halt(&mut led, 100);
    }
    show_lines(&mut display, &["Bad Apple", "STM32L4 A/V player", "", "SD init..."]);

    // SD card: identify below 400 kHz, then reclock for data.
    let mut spi_config = embassy_stm32::spi::Config::default();
    spi_config.frequency = Hertz(SD_INIT_CLOCK_HZ);
    let spi = embassy_stm32::spi::Spi::new_blocking(p.SPI3, p.PC10, p.PC12, p.PC11, spi_config);
    let cs = Output::new(p.PB6, Level::High, Speed::VeryHigh);
    let mut sd = SdCard::new(spi, cs, Delay);
    if let Err(e) = sd.init() {
        defmt::error!("SD init failed: {}", e);
        show_lines(&mut display, &["SD init... FAIL"]);
        halt(&mut led, 250);
    }
    sd.bus_mut().set_frequency(Hertz(SD_DATA_CLOCK_HZ));
    defmt::info!("SD card up: {} blocks", sd.capacity_blocks());

    // Mount and locate the media file.
    let mut vol = match Fat32Volume::mount(sd) {
        Ok(vol) => vol,
        Err(e) => {
            defmt::error!("mount failed: {}", e);
            show_lines(&mut display, &["FAT FAIL"]);
            halt(&mut led, 250);
        }
    };
    let info = match vol.find_file(MEDIA_FILENAME) {
        Ok(info) => info,
        Err(e) => {
            defmt::error!("{} not found: {}", MEDIA_FILENAME, e);
            show_lines(&mut display, &["NO FILE"]);
            halt(&mut led, 250);
        }
    };
    let mut media = match MediaFile::open(vol, &info) {
        Ok(media) => media,
        Err(e) => {
            defmt::error!("open failed: {}", e);
            show_lines(&mut display, &["OPEN FAIL"]);
            halt(&mut led, 250);
        }
    };
    media.set_volume(STARTUP_VOLUME_PERCENT);

    // File info page.
    let header = *media.header();
    let media_info = MediaInfo {
        frame_count: header.frame_count,
        sample_rate: header.sample_rate,
        channels: header.channels,
        duration_secs: media.duration_seconds(VIDEO_FPS),
        contiguous: media.is_contiguous(),
    };
    defmt::info!(
        "{=u32} frames, {=u32} Hz, contiguous={=bool}",
        header.frame_count,
        header.sample_rate,
        media_info.contiguous
    );
    let mut frame = [0u8; FRAMEBUFFER_SIZE_BYTES];
    ui::draw_file_info(&mut frame, &media_info);
    let _ = display.write_frame(&frame);
    embassy_time::block_for(embassy_time::Duration::from_secs(2));

    // Pipelines and the orchestrator.
    configure_interrupts();
    let audio = AudioPipeline::new(
        &AUDIO_SHARED,
        LEFT_RING.init(platform::DmaBuffer::new([0u16; AUDIO_FULL_BUFFER_SAMPLES])),
        RIGHT_RING.init(platform::DmaBuffer::new([0u16; AUDIO_FULL_BUFFER_SAMPLES])),
    );
    let pipeline = DisplayPipeline::new(
        &FRAME_QUEUE,
        FRAMEBUFFERS.init(platform::DmaBuffer::new(
            [[0u8; FRAMEBUFFER_SIZE_BYTES]; 3],
        )),
    );
    let link = BlockingFrameLink::new(&mut display, &FRAME_QUEUE);

    let mut player = match Player::new(
        media, audio, pipeline, &AVSYNC, HwDac, link, DwtClock, &mut led, VIDEO_FPS,
    ) {
        Ok(player) => player,
        Err(_) => {
            defmt::error!("player wiring rejected");
            halt(&mut led, 100);
        }
    };

    defmt::info!("starting playback");
    let report = match player.run() {
        Ok(report) => report,
        Err(_) => {
            defmt::error!("playback failed to start");
            drop(player);
            halt(&mut led, 100);
        }
    };
    drop(player);

    defmt::info!(
        "done: rendered={=u32} skipped={=u32} repeated={=u32} refills={=u32} worst={=u32}us underruns={=u32}",
        report.frames_rendered,
        report.frames_skipped,
        report.frames_repeated,
        report.refill_count,
        report.max_refill_us,
        report.underrun_count
    );

    let mut frame = [0u8; FRAMEBUFFER_SIZE_BYTES];
    ui::draw_stats(&mut frame, &report);
    let _ = display.write_frame(&frame);

    halt(&mut led, 1000)
}
