//! Clock and timer derivations.
//!
//! The DAC sample clock is TIM6 in update mode: the timer's update event
//! triggers both DAC channels, so one timer period is exactly one sample.
//!
//! ```text
//! sample_rate = SYSCLK / (TIM6_ARR + 1)       (prescaler 0)
//! ```
//!
//! 80 MHz / 2500 = 32 kHz, the rate the media encoder writes.

/// System core clock (MSI + PLL).
pub const SYSCLK_HZ: u32 = 80_000_000;

/// Nominal audio sample rate. The file header carries the authoritative
/// value; the synchronizer is configured from the header, the timer from
/// this constant.
pub const AUDIO_SAMPLE_RATE_HZ: u32 = 32_000;

/// Video frame rate the encoder targets.
pub const VIDEO_FPS: u32 = 30;

/// TIM6 auto-reload value for the sample clock (prescaler 0).
pub const TIM6_PERIOD: u32 = SYSCLK_HZ / AUDIO_SAMPLE_RATE_HZ - 1;

// The sample rate must divide the core clock exactly or the DAC drifts
// against the encoder's timebase.
const _: () = assert!(SYSCLK_HZ % AUDIO_SAMPLE_RATE_HZ == 0);
const _: () = assert!(TIM6_PERIOD <= 0xFFFF, "TIM6 is a 16-bit timer");

/// SPI clock during SD card identification (must stay below 400 kHz).
pub const SD_INIT_CLOCK_HZ: u32 = 312_500;

/// SPI clock for data transfer once the card is up.
pub const SD_DATA_CLOCK_HZ: u32 = 10_000_000;

/// I2C clock for the SSD1306 (fast mode).
pub const DISPLAY_I2C_HZ: u32 = 400_000;

/// The media file looked up in the volume root.
pub const MEDIA_FILENAME: &str = "BADAPPLE.BIN";

/// Playback volume applied at startup.
pub const STARTUP_VOLUME_PERCENT: u8 = 50;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tim6_period_hits_32_khz_exactly() {
        assert_eq!(TIM6_PERIOD, 2499);
        assert_eq!(SYSCLK_HZ / (TIM6_PERIOD + 1), AUDIO_SAMPLE_RATE_HZ);
    }

    #[test]
    fn sd_init_clock_is_below_the_identification_limit() {
        assert!(SD_INIT_CLOCK_HZ <= 400_000);
    }

    #[test]
    fn one_half_buffer_is_64_ms() {
        let half_us = 2048 * 1_000_000u64 / AUDIO_SAMPLE_RATE_HZ as u64;
        assert_eq!(half_us, 64_000);
    }
}
