//! The boot console and the `log` facade over it.
//!
//! The kernel has exactly one human-readable output: the COM1 debug
//! port. Everything funnels through here, in two layers:
//!
//! * [`kprint!`]/[`kprintln!`] write raw lines (boot banner, self-test
//!   summaries, the panic report);
//! * the [`log`] facade adds level tags and colouring on top and is
//!   what the rest of the kernel uses.
//!
//! The console starts unclaimed; [`init`] brings the UART up and
//! installs the facade in one step. Output requested before that, or
//! while another path holds the console (a fault inside a print), is
//! discarded rather than risking a deadlock.

use log::{Level, LevelFilter, Metadata, Record};
use spin::Mutex;
use uart_16550::SerialPort;

const COM1: u16 = 0x3F8;

/// The debug console: absent until [`init`] claims the UART.
static CONSOLE: Mutex<Option<SerialPort>> = Mutex::new(None);

/// Write formatted text to the console, if it is up and uncontended.
#[doc(hidden)]
pub fn _write(args: core::fmt::Arguments) {
    use core::fmt::Write;
    let Some(mut console) = CONSOLE.try_lock() else {
        // Somebody is mid-print (likely a fault inside a fault); losing
        // this line beats hanging the CPU.
        return;
    };
    if let Some(port) = console.as_mut() {
        let _ = port.write_fmt(args);
    }
}

/// Print to the debug console.
#[macro_export]
macro_rules! kprint {
    ($($arg:tt)*) => {
        $crate::boot::logger::_write(format_args!($($arg)*))
    };
}

/// Print a line to the debug console.
#[macro_export]
macro_rules! kprintln {
    () => ($crate::kprint!("\n"));
    ($($arg:tt)*) => ($crate::kprint!("{}\n", format_args!($($arg)*)));
}

/// Level-tagged sink feeding the console.
struct ConsoleLogger;

static LOGGER: ConsoleLogger = ConsoleLogger;

impl log::Log for ConsoleLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= Level::Trace
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let (tag, color) = match record.level() {
            Level::Error => ("\x1b[31mERROR\x1b[0m", "\x1b[31m"),
            Level::Warn => ("\x1b[33mWARN\x1b[0m", "\x1b[33m"),
            Level::Info => ("\x1b[32mINFO\x1b[0m", "\x1b[37m"),
            Level::Debug => ("\x1b[90mDEBUG\x1b[0m", "\x1b[90m"),
            Level::Trace => ("\x1b[90mTRACE\x1b[0m", "\x1b[90m"),
        };
        _write(format_args!(
            "[{}] {}{}\x1b[0m\n",
            tag,
            color,
            record.args()
        ));
    }

    fn flush(&self) {}
}

/// Claim the UART and install the `log` facade. First thing the kernel
/// does at boot; everything before this line is silent.
pub fn init() {
    {
        let mut console = CONSOLE.lock();
        if console.is_none() {
            // SAFETY: COM1 is the platform debug port; nothing else in
            // the kernel touches its I/O range.
            let mut port = unsafe { SerialPort::new(COM1) };
            port.init();
            *console = Some(port);
        }
    }

    log::set_logger(&LOGGER)
        .map(|()| log::set_max_level(LevelFilter::Trace))
        .expect("logger already installed");
}
