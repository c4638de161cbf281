use lazy_static::lazy_static;
use spin::Mutex;

/// A line-oriented diagnostic output, normally the first serial port.
///
/// The board layer installs one with [`set_sink`]; until then every log line
/// is dropped.
pub trait LogSink: Sync {
    fn write_line(&self, level: &str, args: core::fmt::Arguments);
}

lazy_static! {
    static ref SINK: Mutex<Option<&'static dyn LogSink>> = Mutex::new(None);
}

/// Route `log_*!` output to `sink`, replacing any previous sink.
pub fn set_sink(sink: &'static dyn LogSink) {
    *SINK.lock() = Some(sink);
}

#[doc(hidden)]
pub fn _log(level: &str, args: core::fmt::Arguments) {
    let sink = *SINK.lock();
    if let Some(sink) = sink {
        sink.write_line(level, args);
    }
}

#[macro_export]
macro_rules! log_info {
    ($($arg:tt)*) => {
        $crate::serial::_log("INFO", format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! log_warn {
    ($($arg:tt)*) => {
        $crate::serial::_log("WARN", format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! log_error {
    ($($arg:tt)*) => {
        $crate::serial::_log("ERROR", format_args!($($arg)*))
    };
}
