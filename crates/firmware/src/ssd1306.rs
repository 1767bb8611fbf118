//! SSD1306 128x64 OLED driver over I2C.
//!
//! Blocking driver for the status screens plus the playback-time frame
//! transport. Every transaction is a control byte (0x00 = command,
//! 0x40 = data) followed by the payload; a full-screen update sets the
//! address window once and streams all 1024 bytes in horizontal
//! addressing mode.

use embedded_hal::delay::DelayNs;
use embedded_hal::i2c::I2c;

use platform::dma_safety::{DISPLAY_HEIGHT, DISPLAY_WIDTH, FRAMEBUFFER_SIZE_BYTES};
use platform::FrameLink;
use playback::FrameQueue;

/// 7-bit I2C address (SA0 low).
pub const SSD1306_I2C_ADDR: u8 = 0x3C;

/// Control byte announcing a command payload.
const CONTROL_COMMAND: u8 = 0x00;

/// Control byte announcing a data payload.
const CONTROL_DATA: u8 = 0x40;

/// Data bytes per write transaction when streaming the framebuffer.
const CHUNK_SIZE: usize = 128;

/// SSD1306 command set (the subset this driver issues).
#[repr(u8)]
#[derive(Debug, Clone, Copy)]
enum Command {
    DisplayOff = 0xAE,
    DisplayOn = 0xAF,
    SetDisplayClockDiv = 0xD5,
    SetMultiplex = 0xA8,
    SetDisplayOffset = 0xD3,
    SetStartLine = 0x40,
    ChargePump = 0x8D,
    MemoryMode = 0x20,
    SegRemap = 0xA1,
    ComScanDec = 0xC8,
    SetComPins = 0xDA,
    SetContrast = 0x81,
    SetPrecharge = 0xD9,
    SetVcomDetect = 0xDB,
    DisplayAllOnResume = 0xA4,
    NormalDisplay = 0xA6,
    ColumnAddr = 0x21,
    PageAddr = 0x22,
}

/// Driver error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Ssd1306Error {
    /// The I2C transaction failed.
    I2c,
}

impl core::fmt::Display for Ssd1306Error {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::I2c => write!(f, "I2C communication error"),
        }
    }
}

/// SSD1306 display driver.
pub struct Ssd1306<I2C> {
    i2c: I2C,
}

impl<I2C: I2c> Ssd1306<I2C> {
    /// Wrap a configured I2C bus.
    pub fn new(i2c: I2C) -> Self {
        Self { i2c }
    }

    fn command(&mut self, command: Command) -> Result<(), Ssd1306Error> {
        self.raw_command(command as u8)
    }

    fn raw_command(&mut self, byte: u8) -> Result<(), Ssd1306Error> {
        self.i2c
            .write(SSD1306_I2C_ADDR, &[CONTROL_COMMAND, byte])
            .map_err(|_| Ssd1306Error::I2c)
    }

    /// Power-on initialization for a 128x64 panel.
    pub fn init(&mut self, delay: &mut impl DelayNs) -> Result<(), Ssd1306Error> {
        // VDD settle after power-on.
        delay.delay_ms(100);

        self.command(Command::DisplayOff)?;

        self.command(Command::SetDisplayClockDiv)?;
        self.raw_command(0x80)?;

        self.command(Command::SetMultiplex)?;
        self.raw_command(DISPLAY_HEIGHT as u8 - 1)?;

        self.command(Command::SetDisplayOffset)?;
        self.raw_command(0x00)?;

        self.command(Command::SetStartLine)?;

        // Charge pump on: the module generates its own panel voltage.
        self.command(Command::ChargePump)?;
        self.raw_command(0x14)?;

        // Horizontal addressing: the column pointer wraps page by page, so
        // a full frame is one linear 1024-byte stream.
        self.command(Command::MemoryMode)?;
        self.raw_command(0x00)?;

        // Flip both axes for the usual module orientation.
        self.command(Command::SegRemap)?;
        self.command(Command::ComScanDec)?;

        self.command(Command::SetComPins)?;
        self.raw_command(0x12)?;

        self.command(Command::SetContrast)?;
        self.raw_command(0x7F)?;

        self.command(Command::SetPrecharge)?;
        self.raw_command(0xF1)?;

        self.command(Command::SetVcomDetect)?;
        self.raw_command(0x40)?;

        self.command(Command::DisplayAllOnResume)?;
        self.command(Command::NormalDisplay)?;
        self.command(Command::DisplayOn)?;

        self.clear()
    }

    /// Set the address window to the full screen.
    fn set_address_window(&mut self) -> Result<(), Ssd1306Error> {
        self.command(Command::ColumnAddr)?;
        self.raw_command(0)?;
        self.raw_command(DISPLAY_WIDTH as u8 - 1)?;

        self.command(Command::PageAddr)?;
        self.raw_command(0)?;
        self.raw_command(DISPLAY_HEIGHT as u8 / 8 - 1)
    }

    /// Stream a full frame to the panel.
    pub fn write_frame(
        &mut self,
        frame: &[u8; FRAMEBUFFER_SIZE_BYTES],
    ) -> Result<(), Ssd1306Error> {
        self.set_address_window()?;

        let mut chunk = [CONTROL_DATA; CHUNK_SIZE + 1];
        for part in frame.chunks(CHUNK_SIZE) {
            chunk[1..=part.len()].copy_from_slice(part);
            self.i2c
                .write(SSD1306_I2C_ADDR, &chunk[..=part.len()])
                .map_err(|_| Ssd1306Error::I2c)?;
        }
        Ok(())
    }

    /// Blank the panel.
    pub fn clear(&mut self) -> Result<(), Ssd1306Error> {
        self.write_frame(&[0u8; FRAMEBUFFER_SIZE_BYTES])
    }

    /// Set the contrast register.
    pub fn set_contrast(&mut self, contrast: u8) -> Result<(), Ssd1306Error> {
        self.command(Command::SetContrast)?;
        self.raw_command(contrast)
    }

    /// Release the bus.
    pub fn release(self) -> I2C {
        self.i2c
    }
}

/// Synchronous frame transport for the playback engine.
///
/// Streams the frame inside `begin_transfer` and acknowledges the queue
/// immediately, so the transfer-busy window collapses to the call itself.
/// The triple-buffer contract is unchanged; a DMA transport would return
/// after arming the stream and leave the acknowledgment to the I2C DMA
/// completion interrupt.
pub struct BlockingFrameLink<'a, I2C> {
    display: &'a mut Ssd1306<I2C>,
    queue: &'static FrameQueue,
}

impl<'a, I2C: I2c> BlockingFrameLink<'a, I2C> {
    /// Bind the transport to a display and the shared queue.
    pub fn new(display: &'a mut Ssd1306<I2C>, queue: &'static FrameQueue) -> Self {
        Self { display, queue }
    }
}

impl<I2C: I2c> FrameLink for BlockingFrameLink<'_, I2C> {
    type Error = Ssd1306Error;

    fn begin_transfer(
        &mut self,
        frame: &[u8; FRAMEBUFFER_SIZE_BYTES],
    ) -> Result<(), Self::Error> {
        let result = self.display.write_frame(frame);
        // Completion fires even on failure so the queue never wedges; the
        // caller sees the error and the frame stays queued via abort.
        if result.is_ok() {
            self.queue.transfer_complete();
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use embedded_hal_mock::eh1::delay::NoopDelay;
    use embedded_hal_mock::eh1::i2c::{Mock as I2cMock, Transaction};

    fn command_tx(byte: u8) -> Transaction {
        Transaction::write(SSD1306_I2C_ADDR, vec![CONTROL_COMMAND, byte])
    }

    fn frame_transactions(frame: &[u8; FRAMEBUFFER_SIZE_BYTES]) -> Vec<Transaction> {
        let mut txs = vec![
            command_tx(0x21),
            command_tx(0),
            command_tx(127),
            command_tx(0x22),
            command_tx(0),
            command_tx(7),
        ];
        for part in frame.chunks(CHUNK_SIZE) {
            let mut bytes = vec![CONTROL_DATA];
            bytes.extend_from_slice(part);
            txs.push(Transaction::write(SSD1306_I2C_ADDR, bytes));
        }
        txs
    }

    #[test]
    fn init_sends_the_panel_bring_up_sequence() {
        let expected_commands: &[u8] = &[
            0xAE, 0xD5, 0x80, 0xA8, 0x3F, 0xD3, 0x00, 0x40, 0x8D, 0x14, 0x20, 0x00, 0xA1,
            0xC8, 0xDA, 0x12, 0x81, 0x7F, 0xD9, 0xF1, 0xDB, 0x40, 0xA4, 0xA6, 0xAF,
        ];
        let mut txs: Vec<Transaction> =
            expected_commands.iter().map(|&b| command_tx(b)).collect();
        txs.extend(frame_transactions(&[0u8; FRAMEBUFFER_SIZE_BYTES]));

        let mut i2c = I2cMock::new(&txs);
        let mut display = Ssd1306::new(i2c.clone());
        display.init(&mut NoopDelay::new()).unwrap();
        i2c.done();
    }

    #[test]
    fn write_frame_streams_1024_bytes_in_chunks() {
        let mut frame = [0u8; FRAMEBUFFER_SIZE_BYTES];
        for (i, b) in frame.iter_mut().enumerate() {
            *b = (i % 256) as u8;
        }
        let mut i2c = I2cMock::new(&frame_transactions(&frame));
        let mut display = Ssd1306::new(i2c.clone());
        display.write_frame(&frame).unwrap();
        i2c.done();
    }

    #[test]
    fn blocking_link_acknowledges_the_queue() {
        let queue: &'static FrameQueue = Box::leak(Box::new(FrameQueue::new()));
        queue.swap_buffers();
        let claimed = queue.start_transfer();
        assert!(claimed.is_some());

        let frame = [0xA5u8; FRAMEBUFFER_SIZE_BYTES];
        let mut i2c = I2cMock::new(&frame_transactions(&frame));
        let mut display = Ssd1306::new(i2c.clone());
        let mut link = BlockingFrameLink::new(&mut display, queue);
        link.begin_transfer(&frame).unwrap();
        i2c.done();

        assert!(!queue.transfer_busy());
        assert_eq!(queue.counts(), (1, 1));
    }
}
