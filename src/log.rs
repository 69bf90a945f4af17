use std::ffi::CString;
use std::fmt::Display;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::str::FromStr;

/// Where to put log lines.
#[derive(Debug)]
pub enum LogSink {
    Stdout,
    Syslog,
    File(BufWriter<File>),
    /// Keeps lines in memory; used by tests.
    Memory(Vec<String>),
}

impl LogSink {
    /// Parse an `error_log` target: `stdout`, `syslog` or a file path.
    pub fn open(target: &str) -> std::io::Result<Self> {
        match target {
            "stdout" => Ok(Self::Stdout),
            "syslog" => Ok(Self::Syslog),
            path => {
                let file = OpenOptions::new().create(true).append(true).open(path)?;
                Ok(Self::File(BufWriter::new(file)))
            }
        }
    }

    fn log(&mut self, message: &str) -> std::io::Result<()> {
        match self {
            Self::Stdout => {
                println!("{}", message);
            }
            Self::Syslog => {
                // Interior NUL bytes cannot be passed to syslog.
                let message = CString::new(message.replace('\0', "%00"))?;
                unsafe {
                    libc::syslog(
                        libc::LOG_INFO,
                        b"%s\0".as_ptr() as *const libc::c_char,
                        message.as_ptr(),
                    )
                };
            }
            Self::File(file) => {
                writeln!(file, "{}", message)?;
            }
            Self::Memory(lines) => lines.push(message.to_string()),
        }
        Ok(())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match self {
            Self::Stdout => std::io::stdout().flush(),
            Self::File(file) => file.flush(),
            Self::Syslog | Self::Memory(_) => Ok(()),
        }
    }
}

impl Default for LogSink {
    fn default() -> Self {
        Self::Stdout
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
}

impl LogLevel {
    fn label(self) -> &'static str {
        match self {
            Self::Error => "error",
            Self::Warn => "warn",
            Self::Info => "info",
            Self::Debug => "debug",
        }
    }
}

impl FromStr for LogLevel {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "error" => Ok(Self::Error),
            "warn" => Ok(Self::Warn),
            "info" => Ok(Self::Info),
            "debug" => Ok(Self::Debug),
            _ => Err(()),
        }
    }
}

impl Default for LogLevel {
    fn default() -> Self {
        Self::Info
    }
}

/// Logging context handed to the server at construction.
///
/// Severity-tagged diagnostics go through `error`/`warn`/`info`/`debug`; one Common Log Format
/// line per finished response goes through `access`. Write failures are reported on stderr and
/// otherwise ignored so logging can never take the event loop down.
#[derive(Debug, Default)]
pub struct Logger {
    sink: LogSink,
    level: LogLevel,
}

impl Logger {
    pub fn new(sink: LogSink, level: LogLevel) -> Self {
        Self { sink, level }
    }

    /// Logger that records into memory, for tests.
    pub fn memory(level: LogLevel) -> Self {
        Self::new(LogSink::Memory(Vec::new()), level)
    }

    pub fn enabled(&self, level: LogLevel) -> bool {
        level <= self.level
    }

    pub fn log(&mut self, level: LogLevel, message: impl Display) {
        if !self.enabled(level) {
            return;
        }
        let line = format!("[{}] {}", level.label(), message);
        self.write(&line);
    }

    pub fn error(&mut self, message: impl Display) {
        self.log(LogLevel::Error, message);
    }

    pub fn warn(&mut self, message: impl Display) {
        self.log(LogLevel::Warn, message);
    }

    pub fn info(&mut self, message: impl Display) {
        self.log(LogLevel::Info, message);
    }

    pub fn debug(&mut self, message: impl Display) {
        self.log(LogLevel::Debug, message);
    }

    /// Write an access log line, regardless of level.
    pub fn access(&mut self, line: impl Display) {
        self.write(&line.to_string());
    }

    /// Lines recorded by a memory logger.
    pub fn lines(&self) -> &[String] {
        match &self.sink {
            LogSink::Memory(lines) => lines,
            _ => &[],
        }
    }

    pub fn flush(&mut self) {
        if let Err(e) = self.sink.flush() {
            eprintln!("warning: failed to flush log: {}", e);
        }
    }

    fn write(&mut self, line: &str) {
        if let Err(e) = self.sink.log(line) {
            eprintln!("warning: failed to write log message: {}", e);
        }
    }
}

impl Drop for Logger {
    fn drop(&mut self) {
        self.flush();
    }
}
