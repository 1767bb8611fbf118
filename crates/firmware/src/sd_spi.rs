//! SD card driver over SPI implementing [`platform::BlockDevice`].
//!
//! Generic over `embedded-hal` 1.0 `SpiBus` + chip-select `OutputPin` +
//! `DelayNs`, so the protocol logic runs against a scripted bus on the
//! host. The caller owns SPI clocking: identification must happen below
//! 400 kHz ([`crate::boot::SD_INIT_CLOCK_HZ`]); raise the clock once
//! [`SdCard::init`] returns.
//!
//! Read path timing is bounded (command response 100 ms, card ready
//! 500 ms, data token 250 ms) because the playback foreground sits inside
//! these calls while the audio DMA keeps draining its ring.

use embedded_hal::delay::DelayNs;
use embedded_hal::digital::OutputPin;
use embedded_hal::spi::SpiBus;

use platform::block::{Block, BlockDevice, BlockError, BLOCK_SIZE, MAX_MULTIBLOCK_BLOCKS};

// ── Protocol constants ──────────────────────────────────────────────────────

const CMD0_GO_IDLE: u8 = 0;
const CMD8_SEND_IF_COND: u8 = 8;
const CMD9_SEND_CSD: u8 = 9;
const CMD12_STOP_TRANSMISSION: u8 = 12;
const CMD17_READ_SINGLE: u8 = 17;
const CMD18_READ_MULTIPLE: u8 = 18;
const CMD55_APP_CMD: u8 = 55;
const ACMD41_SD_SEND_OP_COND: u8 = 41;
const CMD58_READ_OCR: u8 = 58;

const DUMMY: u8 = 0xFF;
const START_TOKEN: u8 = 0xFE;
const R1_READY: u8 = 0x00;
const R1_IDLE: u8 = 0x01;

/// Poll interval for all bounded waits.
const POLL_INTERVAL_US: u32 = 100;

/// Command response budget: 100 ms.
const RESPONSE_ATTEMPTS: u32 = 100_000 / POLL_INTERVAL_US;

/// Card-ready budget: 500 ms.
const READY_ATTEMPTS: u32 = 500_000 / POLL_INTERVAL_US;

/// Data token budget: 250 ms.
const DATA_TOKEN_ATTEMPTS: u32 = 250_000 / POLL_INTERVAL_US;

/// ACMD41 initialization retries (1 ms apart).
const INIT_ATTEMPTS: u32 = 1_000;

// ── Pure protocol helpers ───────────────────────────────────────────────────

/// Render a command frame: start bits, command index, big-endian argument
/// and the CRC the SPI mode still checks (CMD0 and CMD8 only; everything
/// else takes a dummy CRC with the stop bit).
fn command_frame(cmd: u8, arg: u32) -> [u8; 6] {
    let crc = match cmd {
        CMD0_GO_IDLE => 0x95,
        CMD8_SEND_IF_COND => 0x87,
        _ => 0x01,
    };
    [
        0x40 | cmd,
        (arg >> 24) as u8,
        (arg >> 16) as u8,
        (arg >> 8) as u8,
        arg as u8,
        crc,
    ]
}

/// High-capacity (CSD v2) card size in 512-byte blocks.
fn csd_capacity_blocks(csd: &[u8; 16]) -> u32 {
    let c_size = (u32::from(csd[7] & 0x3F) << 16) | (u32::from(csd[8]) << 8) | u32::from(csd[9]);
    (c_size + 1) * 1024
}

/// SDHC cards address by block, older cards by byte.
fn block_address(high_capacity: bool, lba: u32) -> u32 {
    if high_capacity {
        lba
    } else {
        lba * BLOCK_SIZE as u32
    }
}

// ── Driver ──────────────────────────────────────────────────────────────────

/// Card generation detected at init.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum CardType {
    /// SD v1 (byte addressed).
    V1,
    /// SD v2 standard capacity (byte addressed).
    V2,
    /// SD v2 high capacity (block addressed).
    V2Hc,
}

/// SD card on a dedicated SPI bus.
pub struct SdCard<SPI, CS, D> {
    spi: SPI,
    cs: CS,
    delay: D,
    card_type: CardType,
    high_capacity: bool,
    capacity_blocks: u32,
    initialized: bool,
}

impl<SPI, CS, D> SdCard<SPI, CS, D>
where
    SPI: SpiBus,
    CS: OutputPin,
    D: DelayNs,
{
    /// Wrap the bus; the card is unusable until [`init`](Self::init).
    pub fn new(spi: SPI, cs: CS, delay: D) -> Self {
        Self {
            spi,
            cs,
            delay,
            card_type: CardType::V1,
            high_capacity: false,
            capacity_blocks: 0,
            initialized: false,
        }
    }

    /// Detected card generation.
    pub fn card_type(&self) -> CardType {
        self.card_type
    }

    /// Card size in 512-byte blocks (high-capacity cards only; 0 when
    /// unknown).
    pub fn capacity_blocks(&self) -> u32 {
        self.capacity_blocks
    }

    /// The SPI bus, for reclocking after identification.
    pub fn bus_mut(&mut self) -> &mut SPI {
        &mut self.spi
    }

    // ── Byte-level plumbing ─────────────────────────────────────────────

    fn xfer_byte(&mut self, tx: u8) -> Result<u8, BlockError> {
        let mut buf = [tx];
        self.spi
            .transfer_in_place(&mut buf)
            .map_err(|_| BlockError::Device)?;
        Ok(buf[0])
    }

    fn select(&mut self) -> Result<(), BlockError> {
        self.cs.set_low().map_err(|_| BlockError::Device)
    }

    fn deselect(&mut self) -> Result<(), BlockError> {
        self.cs.set_high().map_err(|_| BlockError::Device)?;
        // One trailing clock releases the card's DO line.
        self.xfer_byte(DUMMY)?;
        Ok(())
    }

    fn send_command(&mut self, cmd: u8, arg: u32) -> Result<(), BlockError> {
        // Sync byte before the frame.
        self.xfer_byte(DUMMY)?;
        self.spi
            .write(&command_frame(cmd, arg))
            .map_err(|_| BlockError::Device)
    }

    /// Wait for an R1 response (MSB clear).
    fn response(&mut self) -> Result<u8, BlockError> {
        for attempt in 0..RESPONSE_ATTEMPTS {
            let byte = self.xfer_byte(DUMMY)?;
            if (byte & 0x80) == 0 {
                return Ok(byte);
            }
            if attempt > 8 {
                self.delay.delay_us(POLL_INTERVAL_US);
            }
        }
        Err(BlockError::Timeout)
    }

    /// Wait for the card to release DO (0xFF = ready).
    fn wait_ready(&mut self) -> Result<(), BlockError> {
        for attempt in 0..READY_ATTEMPTS {
            if self.xfer_byte(DUMMY)? == DUMMY {
                return Ok(());
            }
            if attempt > 8 {
                self.delay.delay_us(POLL_INTERVAL_US);
            }
        }
        Err(BlockError::Timeout)
    }

    /// Wait for the start-of-data token.
    fn wait_data_token(&mut self) -> Result<(), BlockError> {
        for attempt in 0..DATA_TOKEN_ATTEMPTS {
            let byte = self.xfer_byte(DUMMY)?;
            if byte == START_TOKEN {
                return Ok(());
            }
            // Data error token: 0000_xxxx.
            if (byte & 0xF0) == 0 {
                return Err(BlockError::Device);
            }
            if attempt > 8 {
                self.delay.delay_us(POLL_INTERVAL_US);
            }
        }
        Err(BlockError::Timeout)
    }

    /// Read one 512-byte payload plus its CRC.
    fn read_data(&mut self, buf: &mut [u8]) -> Result<(), BlockError> {
        buf.fill(DUMMY);
        self.spi
            .transfer_in_place(buf)
            .map_err(|_| BlockError::Device)?;
        // Discard the 16-bit CRC.
        self.xfer_byte(DUMMY)?;
        self.xfer_byte(DUMMY)?;
        Ok(())
    }

    // ── Bring-up ────────────────────────────────────────────────────────

    /// Full identification sequence: power-up clocks, CMD0 into SPI mode,
    /// CMD8 voltage check, ACMD41 until ready, CMD58 capacity class,
    /// CMD9 card size.
    ///
    /// Run this with the bus at or below 400 kHz.
    pub fn init(&mut self) -> Result<(), BlockError> {
        // 80+ clocks with CS high put the card into SPI-command mode.
        self.cs.set_high().map_err(|_| BlockError::Device)?;
        for _ in 0..10 {
            self.xfer_byte(DUMMY)?;
        }

        self.go_idle()?;
        self.check_voltage()?;
        self.initialize_card()?;
        self.read_csd()?;

        self.initialized = true;
        Ok(())
    }

    fn go_idle(&mut self) -> Result<(), BlockError> {
        for _ in 0..10 {
            self.select()?;
            self.send_command(CMD0_GO_IDLE, 0)?;
            let r1 = self.response();
            self.deselect()?;
            if r1 == Ok(R1_IDLE) {
                return Ok(());
            }
            self.delay.delay_us(100);
        }
        Err(BlockError::NoCard)
    }

    fn check_voltage(&mut self) -> Result<(), BlockError> {
        self.select()?;
        self.send_command(CMD8_SEND_IF_COND, 0x0000_01AA)?;
        let r1 = self.response();

        let r1 = match r1 {
            Ok(v) => v,
            Err(e) => {
                self.deselect()?;
                return Err(e);
            }
        };

        let mut r7 = [0u8; 4];
        for byte in &mut r7 {
            *byte = self.xfer_byte(DUMMY)?;
        }
        self.deselect()?;

        if r1 != R1_IDLE {
            // CMD8 rejected: a v1 card. ACMD41 runs without HCS.
            self.card_type = CardType::V1;
            return Ok(());
        }
        if (r7[2] & 0x0F) != 0x01 || r7[3] != 0xAA {
            return Err(BlockError::Device);
        }
        self.card_type = CardType::V2;
        Ok(())
    }

    fn initialize_card(&mut self) -> Result<(), BlockError> {
        let hcs = if self.card_type == CardType::V2 {
            0x4000_0000
        } else {
            0
        };

        for _ in 0..INIT_ATTEMPTS {
            self.select()?;
            self.send_command(CMD55_APP_CMD, 0)?;
            let _ = self.response();
            self.deselect()?;

            self.select()?;
            self.send_command(ACMD41_SD_SEND_OP_COND, hcs)?;
            let r1 = self.response();
            self.deselect()?;

            if r1 == Ok(R1_READY) {
                if self.card_type == CardType::V2 {
                    self.read_ocr()?;
                }
                return Ok(());
            }
            self.delay.delay_us(1_000);
        }
        Err(BlockError::Timeout)
    }

    fn read_ocr(&mut self) -> Result<(), BlockError> {
        self.select()?;
        self.send_command(CMD58_READ_OCR, 0)?;
        let _ = self.response();
        let mut ocr = [0u8; 4];
        for byte in &mut ocr {
            *byte = self.xfer_byte(DUMMY)?;
        }
        self.deselect()?;

        // CCS: the card addresses in 512-byte blocks.
        if (ocr[0] & 0x40) != 0 {
            self.card_type = CardType::V2Hc;
            self.high_capacity = true;
        }
        Ok(())
    }

    fn read_csd(&mut self) -> Result<(), BlockError> {
        self.select()?;
        self.send_command(CMD9_SEND_CSD, 0)?;
        let result = (|| {
            if self.response()? != R1_READY {
                return Err(BlockError::Device);
            }
            self.wait_data_token()?;
            let mut csd = [0u8; 16];
            for byte in &mut csd {
                *byte = self.xfer_byte(DUMMY)?;
            }
            self.xfer_byte(DUMMY)?;
            self.xfer_byte(DUMMY)?;
            if self.high_capacity {
                self.capacity_blocks = csd_capacity_blocks(&csd);
            }
            Ok(())
        })();
        self.deselect()?;
        result
    }

    // ── Read path ───────────────────────────────────────────────────────

    fn read_block_inner(&mut self, lba: u32, buf: &mut [u8]) -> Result<(), BlockError> {
        self.send_command(CMD17_READ_SINGLE, block_address(self.high_capacity, lba))?;
        if self.response()? != R1_READY {
            return Err(BlockError::Device);
        }
        self.wait_data_token()?;
        self.read_data(buf)
    }

    fn read_blocks_inner(&mut self, lba: u32, buf: &mut [u8]) -> Result<(), BlockError> {
        self.send_command(CMD18_READ_MULTIPLE, block_address(self.high_capacity, lba))?;
        if self.response()? != R1_READY {
            return Err(BlockError::Device);
        }

        let mut result = Ok(());
        for block in buf.chunks_mut(BLOCK_SIZE) {
            result = self
                .wait_data_token()
                .and_then(|()| self.read_data(block));
            if result.is_err() {
                break;
            }
        }

        // CMD12 ends the stream even after an error; the stuff byte clocks
        // past the in-flight response.
        self.xfer_byte(DUMMY)?;
        self.send_command(CMD12_STOP_TRANSMISSION, 0)?;
        let _ = self.response();
        self.wait_ready()?;
        result
    }
}

impl<SPI, CS, D> BlockDevice for SdCard<SPI, CS, D>
where
    SPI: SpiBus,
    CS: OutputPin,
    D: DelayNs,
{
    fn read_block(&mut self, lba: u32, buf: &mut Block) -> Result<(), BlockError> {
        if !self.initialized {
            return Err(BlockError::NoCard);
        }
        self.select()?;
        let result = self.read_block_inner(lba, buf);
        self.deselect()?;
        result
    }

    fn read_blocks(&mut self, lba: u32, buf: &mut [u8]) -> Result<(), BlockError> {
        if !self.initialized {
            return Err(BlockError::NoCard);
        }
        if buf.is_empty()
            || buf.len() % BLOCK_SIZE != 0
            || buf.len() / BLOCK_SIZE > MAX_MULTIBLOCK_BLOCKS
        {
            return Err(BlockError::Device);
        }
        if buf.len() == BLOCK_SIZE {
            let block: &mut Block = match buf.try_into() {
                Ok(b) => b,
                Err(_) => return Err(BlockError::Device),
            };
            return self.read_block(lba, block);
        }

        self.select()?;
        let result = self.read_blocks_inner(lba, buf);
        self.deselect()?;
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    #[test]
    fn command_frames_carry_start_bits_and_crc() {
        assert_eq!(command_frame(CMD0_GO_IDLE, 0), [0x40, 0, 0, 0, 0, 0x95]);
        assert_eq!(
            command_frame(CMD8_SEND_IF_COND, 0x0000_01AA),
            [0x48, 0x00, 0x00, 0x01, 0xAA, 0x87]
        );
        assert_eq!(
            command_frame(CMD17_READ_SINGLE, 0x0001_0203),
            [0x51, 0x00, 0x01, 0x02, 0x03, 0x01]
        );
    }

    #[test]
    fn csd_v2_capacity_decodes_c_size() {
        let mut csd = [0u8; 16];
        csd[7] = 0x00;
        csd[8] = 0x3B;
        csd[9] = 0x37;
        assert_eq!(csd_capacity_blocks(&csd), (0x3B37 + 1) * 1024);
    }

    #[test]
    fn addressing_depends_on_capacity_class() {
        assert_eq!(block_address(true, 1234), 1234);
        assert_eq!(block_address(false, 1234), 1234 * 512);
    }

    // ── Scripted card model ─────────────────────────────────────────────

    /// Byte content of the fake card: block `lba`, offset `i`.
    fn card_byte(lba: u32, i: usize) -> u8 {
        ((lba as usize * 7 + i) % 256) as u8
    }

    /// A protocol-level SD card model behind the `SpiBus` trait.
    ///
    /// Parses command frames off MOSI and queues the card's response
    /// bytes for the following clocks. Multi-block reads stream until
    /// CMD12.
    struct FakeCard {
        pending: VecDeque<u8>,
        frame: Vec<u8>,
        after_cmd55: bool,
        acmd41_polls: u32,
        streaming: Option<(u32, usize)>,
        dead: bool,
        pub cmd17_args: Vec<u32>,
        pub cmd18_args: Vec<u32>,
    }

    impl FakeCard {
        fn new() -> Self {
            Self {
                pending: VecDeque::new(),
                frame: Vec::new(),
                after_cmd55: false,
                acmd41_polls: 0,
                streaming: None,
                dead: false,
                cmd17_args: Vec::new(),
                cmd18_args: Vec::new(),
            }
        }

        /// A card that never answers.
        fn unresponsive() -> Self {
            let mut card = Self::new();
            card.dead = true;
            card
        }

        fn push_block(&mut self, lba: u32) {
            self.pending.push_back(START_TOKEN);
            for i in 0..BLOCK_SIZE {
                self.pending.push_back(card_byte(lba, i));
            }
            self.pending.push_back(0); // CRC
            self.pending.push_back(0);
        }

        fn mosi(&mut self, byte: u8) {
            if self.dead {
                return;
            }
            if self.frame.is_empty() && (byte & 0xC0) != 0x40 {
                return;
            }
            self.frame.push(byte);
            if self.frame.len() < 6 {
                return;
            }

            let cmd = self.frame[0] & 0x3F;
            let arg = u32::from_be_bytes([
                self.frame[1],
                self.frame[2],
                self.frame[3],
                self.frame[4],
            ]);
            self.frame.clear();

            let was_acmd = core::mem::replace(&mut self.after_cmd55, false);
            match cmd {
                CMD0_GO_IDLE => self.pending.push_back(R1_IDLE),
                CMD8_SEND_IF_COND => {
                    self.pending.extend([R1_IDLE, 0x00, 0x00, 0x01, 0xAA]);
                }
                CMD55_APP_CMD => {
                    self.after_cmd55 = true;
                    self.pending.push_back(R1_IDLE);
                }
                ACMD41_SD_SEND_OP_COND if was_acmd => {
                    self.acmd41_polls += 1;
                    self.pending.push_back(if self.acmd41_polls >= 2 {
                        R1_READY
                    } else {
                        R1_IDLE
                    });
                }
                CMD58_READ_OCR => {
                    self.pending.extend([R1_READY, 0xC0, 0xFF, 0x80, 0x00]);
                }
                CMD9_SEND_CSD => {
                    self.pending.push_back(R1_READY);
                    self.pending.push_back(START_TOKEN);
                    let mut csd = [0u8; 16];
                    csd[0] = 0x40; // CSD v2
                    csd[8] = 0x3B;
                    csd[9] = 0x37;
                    self.pending.extend(csd);
                    self.pending.push_back(0);
                    self.pending.push_back(0);
                }
                CMD17_READ_SINGLE => {
                    self.cmd17_args.push(arg);
                    self.pending.push_back(R1_READY);
                    self.push_block(arg);
                }
                CMD18_READ_MULTIPLE => {
                    self.cmd18_args.push(arg);
                    self.pending.push_back(R1_READY);
                    self.streaming = Some((arg, 0));
                }
                CMD12_STOP_TRANSMISSION => {
                    self.streaming = None;
                    self.pending.clear();
                    self.pending.push_back(R1_READY);
                }
                _ => self.pending.push_back(0x04), // illegal command
            }
        }

        fn miso(&mut self) -> u8 {
            if let Some(byte) = self.pending.pop_front() {
                return byte;
            }
            if let Some((lba, served)) = self.streaming {
                self.streaming = Some((lba + 1, served + 1));
                self.push_block(lba);
                if let Some(byte) = self.pending.pop_front() {
                    return byte;
                }
            }
            DUMMY
        }
    }

    #[derive(Debug)]
    struct FakeError;
    impl embedded_hal::spi::Error for FakeError {
        fn kind(&self) -> embedded_hal::spi::ErrorKind {
            embedded_hal::spi::ErrorKind::Other
        }
    }
    impl embedded_hal::spi::ErrorType for FakeCard {
        type Error = FakeError;
    }

    impl SpiBus for FakeCard {
        fn read(&mut self, words: &mut [u8]) -> Result<(), FakeError> {
            for w in words {
                self.mosi(DUMMY);
                *w = self.miso();
            }
            Ok(())
        }

        fn write(&mut self, words: &[u8]) -> Result<(), FakeError> {
            // While the host clocks a frame out, the card's DO stays idle;
            // queued responses are only consumed by later read clocks.
            for &w in words {
                self.mosi(w);
            }
            Ok(())
        }

        fn transfer(&mut self, read: &mut [u8], write: &[u8]) -> Result<(), FakeError> {
            for i in 0..read.len().max(write.len()) {
                self.mosi(write.get(i).copied().unwrap_or(DUMMY));
                let out = self.miso();
                if let Some(slot) = read.get_mut(i) {
                    *slot = out;
                }
            }
            Ok(())
        }

        fn transfer_in_place(&mut self, words: &mut [u8]) -> Result<(), FakeError> {
            for w in words {
                self.mosi(*w);
                *w = self.miso();
            }
            Ok(())
        }

        fn flush(&mut self) -> Result<(), FakeError> {
            Ok(())
        }
    }

    struct FakeCs;
    impl embedded_hal::digital::ErrorType for FakeCs {
        type Error = core::convert::Infallible;
    }
    impl OutputPin for FakeCs {
        fn set_low(&mut self) -> Result<(), Self::Error> {
            Ok(())
        }
        fn set_high(&mut self) -> Result<(), Self::Error> {
            Ok(())
        }
    }

    fn init_card() -> SdCard<FakeCard, FakeCs, embedded_hal_mock::eh1::delay::NoopDelay> {
        let mut sd = SdCard::new(
            FakeCard::new(),
            FakeCs,
            embedded_hal_mock::eh1::delay::NoopDelay::new(),
        );
        sd.init().unwrap();
        sd
    }

    #[test]
    fn init_identifies_a_v2_high_capacity_card() {
        let sd = init_card();
        assert_eq!(sd.card_type(), CardType::V2Hc);
        assert_eq!(sd.capacity_blocks(), (0x3B37 + 1) * 1024);
    }

    #[test]
    fn init_without_a_card_times_out_as_no_card() {
        let mut sd = SdCard::new(
            FakeCard::unresponsive(),
            FakeCs,
            embedded_hal_mock::eh1::delay::NoopDelay::new(),
        );
        assert_eq!(sd.init(), Err(BlockError::NoCard));
    }

    #[test]
    fn single_block_read_uses_block_addressing_on_sdhc() {
        let mut sd = init_card();
        let mut block = [0u8; BLOCK_SIZE];
        sd.read_block(42, &mut block).unwrap();

        assert_eq!(sd.bus_mut().cmd17_args, vec![42]);
        for (i, &b) in block.iter().enumerate() {
            assert_eq!(b, card_byte(42, i));
        }
    }

    #[test]
    fn multi_block_read_streams_and_stops() {
        let mut sd = init_card();
        let mut buf = vec![0u8; 3 * BLOCK_SIZE];
        sd.read_blocks(100, &mut buf).unwrap();

        assert_eq!(sd.bus_mut().cmd18_args, vec![100]);
        for lba in 0..3u32 {
            let chunk = &buf[lba as usize * BLOCK_SIZE..][..BLOCK_SIZE];
            for (i, &b) in chunk.iter().enumerate() {
                assert_eq!(b, card_byte(100 + lba, i), "block {lba} byte {i}");
            }
        }
    }

    #[test]
    fn oversized_multi_block_requests_are_rejected() {
        let mut sd = init_card();
        let mut buf = vec![0u8; (MAX_MULTIBLOCK_BLOCKS + 1) * BLOCK_SIZE];
        assert_eq!(sd.read_blocks(0, &mut buf), Err(BlockError::Device));
        let mut odd = vec![0u8; BLOCK_SIZE + 1];
        assert_eq!(sd.read_blocks(0, &mut odd), Err(BlockError::Device));
    }

    #[test]
    fn reads_before_init_are_refused() {
        let mut sd = SdCard::new(
            FakeCard::new(),
            FakeCs,
            embedded_hal_mock::eh1::delay::NoopDelay::new(),
        );
        let mut block = [0u8; BLOCK_SIZE];
        assert_eq!(sd.read_block(0, &mut block), Err(BlockError::NoCard));
    }
}
