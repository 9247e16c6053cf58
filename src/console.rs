//! Kernel console and log buffer
//!
//! Text written through `kprint!`/`kprintln!` or the `log` facade lands in
//! a bounded ring of lines (the kernel syslog buffer). Old lines are
//! dropped once the ring is full.

use alloc::string::String as HeapString;
use alloc::vec::Vec;
use core::fmt::{self, Write};
use heapless::{Deque, String};
use log::{LevelFilter, Log, Metadata, Record};
use spin::Mutex;

/// Longest line kept in the ring; longer output wraps
pub const LINE_CAPACITY: usize = 160;

/// Lines retained in the ring
pub const LOG_LINES: usize = 128;

/// Console writer interface
pub struct Console {
    lines: Deque<String<LINE_CAPACITY>, LOG_LINES>,
    current: String<LINE_CAPACITY>,
}

impl Console {
    /// Create an empty console
    pub const fn new() -> Self {
        Console {
            lines: Deque::new(),
            current: String::new(),
        }
    }

    /// Write a single character
    pub fn write_char(&mut self, c: char) {
        if c == '\n' {
            self.end_line();
            return;
        }
        if self.current.push(c).is_err() {
            self.end_line();
            let _ = self.current.push(c);
        }
    }

    /// Write a string to the console
    pub fn write_str(&mut self, s: &str) {
        for c in s.chars() {
            self.write_char(c);
        }
    }

    fn end_line(&mut self) {
        let line = core::mem::take(&mut self.current);
        if self.lines.is_full() {
            self.lines.pop_front();
        }
        let _ = self.lines.push_back(line);
    }

    /// Drop all buffered output
    pub fn clear(&mut self) {
        self.lines.clear();
        self.current.clear();
    }

    /// Completed lines, oldest first
    pub fn lines(&self) -> impl Iterator<Item = &str> {
        self.lines.iter().map(|line| line.as_str())
    }
}

impl Default for Console {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Write for Console {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        Console::write_str(self, s);
        Ok(())
    }
}

/// Global console instance
static CONSOLE: Mutex<Console> = Mutex::new(Console::new());

/// `log` backend writing into the console ring
struct KernelLogger;

impl Log for KernelLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let mut console = CONSOLE.lock();
        let _ = writeln!(
            console,
            "[{:<5} {}] {}",
            record.level(),
            record.target(),
            record.args()
        );
    }

    fn flush(&self) {}
}

static LOGGER: KernelLogger = KernelLogger;

/// Install the kernel logger and set the global level
///
/// Installing twice keeps the first logger; the level is always updated.
pub fn init(level: LevelFilter) {
    let _ = log::set_logger(&LOGGER);
    log::set_max_level(level);
}

/// Print formatted text to console
pub fn print(args: fmt::Arguments) {
    let _ = CONSOLE.lock().write_fmt(args);
}

/// Snapshot of the completed lines in the ring
pub fn recent_lines() -> Vec<HeapString> {
    CONSOLE.lock().lines().map(HeapString::from).collect()
}

/// Print macro for kernel use
#[macro_export]
macro_rules! kprint {
    ($($arg:tt)*) => {
        $crate::console::print(format_args!($($arg)*))
    };
}

/// Print with newline macro
#[macro_export]
macro_rules! kprintln {
    () => {
        $crate::kprint!("\n")
    };
    ($($arg:tt)*) => {
        $crate::console::print(format_args!("{}\n", format_args!($($arg)*)))
    };
}
