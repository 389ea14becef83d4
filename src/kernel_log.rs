//! Kernel-side logging (§3 AMBIENT): forwards formatted lines through
//! whatever `hal::ConsoleDevice` the boot sequence installed. A boot-time
//! choice, not a `log`-crate-style global dispatch table, matching the
//! teacher's direct `serial`/`vga` print macros — there is exactly one
//! sink, not a filterable hierarchy of targets.

use alloc::boxed::Box;
use alloc::string::String;
use lazy_static::lazy_static;
use spin::Mutex;

use crate::hal::ConsoleDevice;

lazy_static! {
    static ref SINK: Mutex<Option<Box<dyn ConsoleDevice>>> = Mutex::new(None);
}

/// Installs the console the rest of the kernel logs to. Call once at boot.
pub fn set_sink(device: Box<dyn ConsoleDevice>) {
    *SINK.lock() = Some(device);
}

#[cfg(test)]
pub fn test_reset() {
    *SINK.lock() = None;
}

fn write_line(level: &str, line: &str) {
    let mut sink = SINK.lock();
    if let Some(dev) = sink.as_mut() {
        dev.write_str(level);
        dev.write_str(": ");
        dev.write_str(line);
        dev.write_str("\n");
    }
}

pub fn log_info(line: String) {
    write_line("info", &line);
}

pub fn log_warn(line: String) {
    write_line("warn", &line);
}

pub fn log_error(line: String) {
    write_line("error", &line);
}

#[macro_export]
macro_rules! log_info {
    ($($arg:tt)*) => {
        $crate::kernel_log::log_info(alloc::format!($($arg)*))
    };
}

#[macro_export]
macro_rules! log_warn {
    ($($arg:tt)*) => {
        $crate::kernel_log::log_warn(alloc::format!($($arg)*))
    };
}

#[macro_export]
macro_rules! log_error {
    ($($arg:tt)*) => {
        $crate::kernel_log::log_error(alloc::format!($($arg)*))
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::string::ToString;
    use alloc::vec::Vec;

    struct BufConsole {
        buf: alloc::sync::Arc<Mutex<Vec<String>>>,
    }

    impl ConsoleDevice for BufConsole {
        fn write_str(&mut self, s: &str) {
            self.buf.lock().push(s.to_string());
        }
    }

    #[test]
    fn log_info_reaches_installed_sink() {
        test_reset();
        let buf = alloc::sync::Arc::new(Mutex::new(Vec::new()));
        set_sink(Box::new(BufConsole { buf: buf.clone() }));
        log_info("hello".to_string());
        let joined: String = buf.lock().concat();
        assert!(joined.contains("hello"));
        test_reset();
    }
}
