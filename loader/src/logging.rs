//! Log sinks used with the `log` crate.

use core::fmt::Write;

use log::{Level, LevelFilter, Log, Metadata, Record};
use spin::Mutex;

/// Writes formatted log messages to any `core::fmt::Write` impl. Locks
/// internally.
pub struct LogSink<W> {
    writer: Mutex<W>,
}

impl<W: Write + Send> LogSink<W> {
    pub const fn new(writer: W) -> Self {
        LogSink {
            writer: Mutex::new(writer),
        }
    }
}

impl<W: Write + Send> Log for LogSink<W> {
    fn enabled(&self, _: &Metadata) -> bool {
        true
    }

    fn log(&self, record: &Record) {
        let mut writer = self.writer.lock();
        let _ = writeln!(
            &mut writer,
            "[{}] {}",
            level_as_string(record.level()),
            record.args()
        );
    }

    fn flush(&self) {
        // Writes go straight to the backend.
    }
}

fn level_as_string(level: Level) -> &'static str {
    use Level::*;

    match level {
        Error => "ERROR",
        Warn => " WARN",
        Info => " INFO",
        Debug => "DEBUG",
        Trace => "TRACE",
    }
}

/// Installs `sink` as the global logger. Called once by the platform entry
/// before anything allocates.
pub fn init(sink: &'static dyn Log, level: LevelFilter) {
    let _ = log::set_logger(sink);
    log::set_max_level(level);
}

/// Writes to QEMU's debug out port.
#[cfg(target_arch = "x86_64")]
pub struct QemuDebugWriter {
    _not_send_sync: core::marker::PhantomData<*mut u8>,
}

#[cfg(target_arch = "x86_64")]
unsafe impl Send for QemuDebugWriter {}

#[cfg(target_arch = "x86_64")]
impl QemuDebugWriter {
    /// # Safety
    ///
    /// Caller must ensure x86 port 0xe9 is safe to write to.
    pub unsafe fn new() -> Self {
        QemuDebugWriter {
            _not_send_sync: core::marker::PhantomData,
        }
    }
}

#[cfg(target_arch = "x86_64")]
impl Write for QemuDebugWriter {
    fn write_str(&mut self, s: &str) -> core::fmt::Result {
        let mut port = x86_64::instructions::port::PortWriteOnly::new(0xe9);
        s.bytes().for_each(|b| unsafe { port.write(b) });
        Ok(())
    }
}
