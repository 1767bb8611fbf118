//! Hardware entry point for the STM32L476RG player.

#![no_std]
#![no_main]

use defmt_rtt as _;
use panic_probe as _;

#[cortex_m_rt::entry]
fn main() -> ! {
    firmware::hardware::run()
}
