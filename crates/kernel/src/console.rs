//! Defines the early debug console that logs to the serial port.

use log::{LevelFilter, SetLoggerError};
use spin::{Mutex, Once};

use crate::serial::SerialWriter;

pub struct Console {
    serial: Mutex<Option<SerialWriter>>,
}

static DEFAULT: Once<Console> = Once::new();

impl Console {
    pub fn init() -> Result<&'static Self, SetLoggerError> {
        let console = Self::default();
        console.install()?;
        Ok(console)
    }

    pub fn default() -> &'static Self {
        DEFAULT.call_once(|| Console {
            serial: Mutex::new(None),
        })
    }

    pub fn install(&'static self) -> Result<(), SetLoggerError> {
        log::set_logger(self)?;
        log::set_max_level(max_level());
        Ok(())
    }

    pub fn attach_serial(&self, serial: SerialWriter) {
        let mut guard = self.serial.lock();
        *guard = Some(serial);
    }
}

impl log::Log for Console {
    fn enabled(&self, metadata: &log::Metadata) -> bool {
        metadata.level() <= max_level()
    }

    fn log(&self, record: &log::Record) {
        if let Some(serial) = &mut *self.serial.lock() {
            // A broken serial line has nowhere else to report to.
            let _ = write_log_entry_to(serial, record);
        }
    }

    fn flush(&self) {}
}

const fn max_level() -> LevelFilter {
    if cfg!(debug_assertions) {
        LevelFilter::Trace
    } else {
        LevelFilter::Info
    }
}

fn write_log_entry_to(
    writer: &mut impl core::fmt::Write,
    record: &log::Record,
) -> core::fmt::Result {
    #[cfg(any(debug_assertions, feature = "detailed-logging"))]
    return writeln!(
        writer,
        "[{} {}:{} {}] {}",
        record.level(),
        record.file().unwrap_or("unknown"),
        record.line().unwrap_or(0),
        record.target(),
        record.args()
    );
    #[cfg(not(any(debug_assertions, feature = "detailed-logging")))]
    return writeln!(writer, "[{:5}] {}", record.level(), record.args());
}
