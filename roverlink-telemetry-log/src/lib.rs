//! Telemetry log files for the rover client.
//!
//! Every accepted telemetry sample is appended to one file per calendar day,
//! chosen when the logger is opened:
//!
//! ```text
//! <log_dir>/telemetry_<YYYYMMDD>.csv    (tabular)
//! <log_dir>/telemetry_<YYYYMMDD>.jsonl  (record stream)
//! ```
//!
//! # Tabular layout
//!
//! ```text
//! epoch,human,origin,speed,battery,temp,dir
//! 1759525432,2025-10-03 21:03:52,TELEMETRY,12,92,25,LEFT
//! ```
//!
//! The header row is written only when the file did not exist (or was empty)
//! when the logger opened it, so several loggers appending to the same day's
//! file never repeat it.
//!
//! # Record-stream layout
//!
//! One JSON object per line, no header:
//!
//! ```text
//! {"ts":1759525432,"human":"2025-10-03 21:03:52","origin":"TELEMETRY","speed":12,"battery":92,"temp":25,"dir":"LEFT"}
//! ```
//!
//! The file is not re-selected if the session runs past midnight.

use chrono::{Local, NaiveDate, TimeZone};
use derive_more::Display;
use log::{debug, info, warn};
use roverlink_protocol::Telemetry;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Header row of tabular files.
pub const CSV_HEADER: &str = "epoch,human,origin,speed,battery,temp,dir";

/// Log file name prefix.
pub const FILE_PREFIX: &str = "telemetry_";

const HUMAN_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Physical encoding of the log file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Display, Serialize, Deserialize)]
pub enum LogFormat {
    /// Comma-separated columns with a header row
    #[default]
    #[serde(rename = "csv")]
    #[display("csv")]
    Tabular,
    /// One JSON object per line
    #[serde(rename = "jsonl")]
    #[display("jsonl")]
    RecordStream,
}

impl LogFormat {
    #[must_use]
    pub const fn extension(self) -> &'static str {
        match self {
            Self::Tabular => "csv",
            Self::RecordStream => "jsonl",
        }
    }
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "csv" | "tabular" => Ok(Self::Tabular),
            "jsonl" | "json" | "record-stream" => Ok(Self::RecordStream),
            _ => Err(format!("unknown log format {s:?} (expected csv or jsonl)")),
        }
    }
}

/// File name for the given day, e.g. `telemetry_20251003.csv`
#[must_use]
pub fn log_file_name(date: NaiveDate, format: LogFormat) -> String {
    format!(
        "{FILE_PREFIX}{}.{}",
        date.format("%Y%m%d"),
        format.extension()
    )
}

/// Local wall-clock rendering of a Unix timestamp, `--` if out of range
#[must_use]
pub fn human_time(epoch: i64) -> String {
    Local
        .timestamp_opt(epoch, 0)
        .single()
        .map_or_else(|| "--".to_string(), |t| t.format(HUMAN_TIME_FORMAT).to_string())
}

/// One persisted telemetry sample.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogRecord {
    #[serde(rename = "ts")]
    pub epoch: i64,
    pub human: String,
    pub origin: String,
    pub speed: i64,
    pub battery: i64,
    pub temp: i64,
    pub dir: String,
}

impl LogRecord {
    #[must_use]
    pub fn from_telemetry(telemetry: &Telemetry) -> Self {
        Self {
            epoch: telemetry.ts,
            human: human_time(telemetry.ts),
            origin: telemetry.origin.wire_name().to_string(),
            speed: telemetry.speed,
            battery: telemetry.battery,
            temp: telemetry.temp,
            dir: telemetry.dir.clone(),
        }
    }

    /// Tabular row without the line terminator
    #[must_use]
    pub fn to_csv_row(&self) -> String {
        format!(
            "{},{},{},{},{},{},{}",
            self.epoch,
            csv_field(&self.human),
            csv_field(&self.origin),
            self.speed,
            self.battery,
            self.temp,
            csv_field(&self.dir)
        )
    }

    /// Record-stream line without the line terminator
    #[must_use]
    pub fn to_json_line(&self) -> String {
        // Plain strings and integers only: serialization cannot fail
        serde_json::to_string(self).expect("string/integer record always serializes")
    }

    fn encode(&self, format: LogFormat) -> String {
        let mut line = match format {
            LogFormat::Tabular => self.to_csv_row(),
            LogFormat::RecordStream => self.to_json_line(),
        };
        line.push('\n');
        line
    }
}

/// Quote a CSV field if it contains a separator, quote or line break
fn csv_field(value: &str) -> Cow<'_, str> {
    if value.contains([',', '"', '\n', '\r']) {
        Cow::Owned(format!("\"{}\"", value.replace('"', "\"\"")))
    } else {
        Cow::Borrowed(value)
    }
}

/// Append-only telemetry log.
///
/// I/O failures never propagate: the first one is logged and the logger
/// turns into a no-op for the rest of the session.
pub struct TelemetryLogger {
    path: PathBuf,
    format: LogFormat,
    writer: Option<BufWriter<File>>,
    records: u64,
}

impl TelemetryLogger {
    /// Open today's log file in `dir`.
    pub fn open_today(dir: impl AsRef<Path>, format: LogFormat) -> Self {
        Self::open(dir, format, Local::now().date_naive())
    }

    /// Open the log file for `date` in `dir`, creating the directory if needed.
    pub fn open(dir: impl AsRef<Path>, format: LogFormat, date: NaiveDate) -> Self {
        let dir = dir.as_ref();
        let path = dir.join(log_file_name(date, format));
        let writer = match open_writer(dir, &path, format) {
            Ok(writer) => {
                info!("Telemetry log: {} ({format})", path.display());
                Some(writer)
            }
            Err(e) => {
                warn!("Telemetry log disabled, cannot open {}: {e}", path.display());
                None
            }
        };
        Self {
            path,
            format,
            writer,
            records: 0,
        }
    }

    /// A logger that never writes anything
    #[must_use]
    pub fn inert(format: LogFormat) -> Self {
        Self {
            path: PathBuf::new(),
            format,
            writer: None,
            records: 0,
        }
    }

    /// Append one sample and flush it to disk.
    pub fn record(&mut self, telemetry: &Telemetry) {
        let Some(writer) = self.writer.as_mut() else {
            return;
        };
        let line = LogRecord::from_telemetry(telemetry).encode(self.format);
        match writer.write_all(line.as_bytes()).and_then(|()| writer.flush()) {
            Ok(()) => {
                self.records += 1;
                debug!("Telemetry log: appended record {}", self.records);
            }
            Err(e) => {
                warn!(
                    "Telemetry log disabled, write to {} failed: {e}",
                    self.path.display()
                );
                self.writer = None;
            }
        }
    }

    /// Flush and release the file. Later records are ignored.
    pub fn close(&mut self) {
        if let Some(mut writer) = self.writer.take() {
            if let Err(e) = writer.flush() {
                warn!("Telemetry log: final flush failed: {e}");
            }
            info!(
                "Telemetry log closed after {} records: {}",
                self.records,
                self.path.display()
            );
        }
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        self.writer.is_some()
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub const fn format(&self) -> LogFormat {
        self.format
    }

    /// Records written by this logger instance
    #[must_use]
    pub const fn records(&self) -> u64 {
        self.records
    }
}

impl Drop for TelemetryLogger {
    fn drop(&mut self) {
        self.close();
    }
}

fn open_writer(dir: &Path, path: &Path, format: LogFormat) -> io::Result<BufWriter<File>> {
    fs::create_dir_all(dir)?;
    let fresh = fs::metadata(path).map_or(true, |m| m.len() == 0);
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    let mut writer = BufWriter::new(file);
    if fresh && format == LogFormat::Tabular {
        writeln!(writer, "{CSV_HEADER}")?;
        writer.flush()?;
    }
    Ok(writer)
}
