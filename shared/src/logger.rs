//! A [`log::Log`] sink that writes records to the first serial port (COM1),
//! which QEMU forwards to the host terminal.

use core::{arch::asm, fmt, fmt::Write};
use log::{LevelFilter, Log, Metadata, Record, SetLoggerError};

const COM1: u16 = 0x3f8;
const THR: u16 = COM1; // Transmitter Holding Reg (write-only)
const IER: u16 = COM1 + 1; // Interrupt Enable Reg
const FCR: u16 = COM1 + 2; // FIFO Control Reg (write-only)
const LCR: u16 = COM1 + 3; // Line Control Register
const MCR: u16 = COM1 + 4; // MODEM Control Register
const LSR: u16 = COM1 + 5; // Line Status Register (read-only)

unsafe fn outb(port: u16, byte: u8) {
    asm!("out dx, al", in("dx") port, in("al") byte);
}

unsafe fn inb(port: u16) -> u8 {
    let res: u8;
    asm!("in al, dx", in("dx") port, out("al") res);
    res
}

struct Com1;

impl Write for Com1 {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        for b in s.bytes() {
            // SAFETY: Waits for the transmit buffer to drain before writing.
            unsafe {
                while inb(LSR) & 0x20 == 0 {}
                outb(THR, b);
            }
        }
        Ok(())
    }
}

pub struct SerialLogger {
    max_level: LevelFilter,
}

static mut LOGGER: SerialLogger = SerialLogger {
    max_level: LevelFilter::Off,
};

impl SerialLogger {
    /// Programs COM1 for 38400 8N1 and installs the logger.
    ///
    /// # Safety
    ///
    /// Must be called once, during early boot, before any other thread runs.
    pub unsafe fn init(max_level: LevelFilter) -> Result<(), SetLoggerError> {
        // https://wiki.osdev.org/Serial_Ports#Initialization
        outb(IER, 0x00);
        outb(LCR, 0x80);
        outb(THR, 0x03);
        outb(IER, 0x00);
        outb(LCR, 0x03);
        outb(FCR, 0xC7);
        outb(MCR, 0x0F);

        (*core::ptr::addr_of_mut!(LOGGER)).max_level = max_level;
        log::set_logger(&*core::ptr::addr_of!(LOGGER))?;
        log::set_max_level(max_level);
        Ok(())
    }
}

impl Log for SerialLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.max_level
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let _ = writeln!(
            Com1,
            "[{}] {}: {}",
            record.level(),
            record.target(),
            record.args()
        );
    }

    fn flush(&self) {}
}
