//! COM1 log sink.

use core::fmt::{self, Write};

use lazy_static::lazy_static;
use spin::Mutex;
use uart_16550::SerialPort;
use x86_64::instructions::interrupts;

use crate::logger::{LevelDisplay, LogLevel, LogSink};

const COM1: u16 = 0x3F8;

lazy_static! {
    static ref SERIAL1: Mutex<SerialPort> = {
        // SAFETY: COM1 is the standard legacy UART on PC-compatible machines.
        let mut port = unsafe { SerialPort::new(COM1) };
        port.init();
        Mutex::new(port)
    };
}

pub struct SerialSink;

pub static SERIAL_SINK: SerialSink = SerialSink;

impl LogSink for SerialSink {
    fn write_line(&self, level: LogLevel, args: fmt::Arguments<'_>) {
        // The remote-call stub logs too; an IPI landing while this CPU holds
        // the port lock would spin on it forever.
        interrupts::without_interrupts(|| {
            let mut port = SERIAL1.lock();
            let _ = writeln!(
                port,
                "{color}[{level:<5}] {message}\x1b[0m",
                color = level.serial_color(),
                level = LevelDisplay(level),
                message = args,
            );
        });
    }
}

pub fn init() {
    lazy_static::initialize(&SERIAL1);
}
