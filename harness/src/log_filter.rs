//! Log Filter
//!
//! Parses the captured output of a terminated instance into records tagged
//! with their source. Two line formats are recognized:
//!
//! ```text
//! 2024-05-01 12:00:00,123 4242 INFO [server_util.cpp:120] starting
//! 2024-05-01 12:00:00,125:4242(0x7f3a):ZOO_INFO@log_env@712: Client environment:host.name=n1
//! ```
//!
//! Lines matching neither continue the previous record. Unmatched lines
//! before the first record become records without a timestamp, which sort
//! first; they are attributed to the application on stdout and to the
//! coordination client on stderr.

use std::fmt;
use std::sync::OnceLock;

use chrono::NaiveDateTime;
use regex::Regex;

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S,%3f";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LogSource {
    /// The service program itself
    Application,
    /// The coordination-service client library linked into it
    Coordination,
}

impl fmt::Display for LogSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogSource::Application => write!(f, "app"),
            LogSource::Coordination => write!(f, "zk"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
    Fatal,
}

impl LogLevel {
    fn parse(text: &str) -> Option<Self> {
        match text {
            "TRACE" => Some(LogLevel::Trace),
            "DEBUG" => Some(LogLevel::Debug),
            "INFO" => Some(LogLevel::Info),
            "WARN" | "WARNING" => Some(LogLevel::Warn),
            "ERROR" => Some(LogLevel::Error),
            "FATAL" => Some(LogLevel::Fatal),
            _ => None,
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LogLevel::Trace => "TRACE",
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Warn => "WARN",
            LogLevel::Error => "ERROR",
            LogLevel::Fatal => "FATAL",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LogRecord {
    pub timestamp: Option<NaiveDateTime>,
    pub source: LogSource,
    pub level: Option<LogLevel>,
    pub pid: Option<u32>,
    /// Source location for application lines, `function@line` for coordination lines
    pub location: Option<String>,
    pub message: String,
}

impl LogRecord {
    fn untimestamped(line: &str, source: LogSource) -> Self {
        Self {
            timestamp: None,
            source,
            level: None,
            pid: None,
            location: None,
            message: line.to_string(),
        }
    }
}

impl fmt::Display for LogRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.timestamp {
            Some(ts) => write!(f, "{}", ts.format(TIMESTAMP_FORMAT))?,
            None => write!(f, "{:23}", "-")?,
        }
        write!(f, " [{}]", self.source)?;
        if let Some(level) = self.level {
            write!(f, " {level}")?;
        }
        write!(f, " {}", self.message)
    }
}

fn application_line() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(
            r"^(\d{4}-\d{2}-\d{2} \d{2}:\d{2}:\d{2},\d{3}) (\d+) (TRACE|DEBUG|INFO|WARN|WARNING|ERROR|FATAL) \[([^\]]*)\] ?(.*)$",
        )
        .expect("application log pattern is valid")
    })
}

fn coordination_line() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^(\d{4}-\d{2}-\d{2} \d{2}:\d{2}:\d{2},\d{3}):(\d+)\([^)]*\):ZOO_([A-Z]+)@([^:]*): ?(.*)$")
            .expect("coordination log pattern is valid")
    })
}

fn parse_line(line: &str) -> Option<LogRecord> {
    let (caps, source) = if let Some(caps) = application_line().captures(line) {
        (caps, LogSource::Application)
    } else {
        (coordination_line().captures(line)?, LogSource::Coordination)
    };

    let timestamp = NaiveDateTime::parse_from_str(&caps[1], TIMESTAMP_FORMAT).ok()?;
    Some(LogRecord {
        timestamp: Some(timestamp),
        source,
        level: LogLevel::parse(&caps[3]),
        pid: caps[2].parse().ok(),
        location: Some(caps[4].to_string()),
        message: caps[5].to_string(),
    })
}

/// Unmatched leading lines are attributed to `fallback`, the source usually writing `text`
fn parse_stream(text: &str, fallback: LogSource, records: &mut Vec<LogRecord>) {
    let mut current: Option<LogRecord> = None;
    for line in text.lines() {
        if line.trim().is_empty() {
            continue;
        }
        match parse_line(line) {
            Some(record) => {
                records.extend(current.replace(record));
            }
            None => match current.as_mut() {
                Some(record) => {
                    record.message.push('\n');
                    record.message.push_str(line);
                }
                None => records.push(LogRecord::untimestamped(line, fallback)),
            },
        }
    }
    records.extend(current);
}

/// Immutable, timestamp-ordered view over an instance's log records
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LogFilter {
    records: Vec<LogRecord>,
}

impl LogFilter {
    /// Parse both captured streams of a terminated process
    pub fn parse(stdout: &str, stderr: &str) -> Self {
        let mut records = Vec::new();
        parse_stream(stdout, LogSource::Application, &mut records);
        parse_stream(stderr, LogSource::Coordination, &mut records);
        records.sort_by_key(|record| record.timestamp);
        Self { records }
    }

    pub fn records(&self) -> &[LogRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn source(&self, source: LogSource) -> LogFilter {
        self.filter(|record| record.source == source)
    }

    /// Records at `level` or more severe
    pub fn level_at_least(&self, level: LogLevel) -> LogFilter {
        self.filter(|record| record.level.is_some_and(|l| l >= level))
    }

    pub fn containing(&self, needle: &str) -> LogFilter {
        self.filter(|record| record.message.contains(needle))
    }

    pub fn filter<F>(&self, predicate: F) -> LogFilter
    where
        F: Fn(&LogRecord) -> bool,
    {
        LogFilter {
            records: self.records.iter().filter(|r| predicate(r)).cloned().collect(),
        }
    }
}

impl fmt::Display for LogFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for record in &self.records {
            writeln!(f, "{record}")?;
        }
        Ok(())
    }
}
