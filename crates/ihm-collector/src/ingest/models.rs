//! Row and file types flowing through the ingestion pipeline

use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Number of production value slots in a persisted row (`Prod_1`..`Prod_40`)
pub const MAX_SLOTS: usize = 40;

/// Maximum length of the persisted `Nome` column
pub const MAX_LABEL_CHARS: usize = 30;

const ISO_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

/// A file as reported by the remote listing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteFileRef {
    pub name: String,
    pub size: u64,
    pub modified: Option<NaiveDateTime>,
    /// Content hash, only when the transport exposes one
    pub hash: Option<String>,
}

impl RemoteFileRef {
    pub fn new(name: impl Into<String>, size: u64) -> Self {
        Self {
            name: name.into(),
            size,
            modified: None,
            hash: None,
        }
    }

    pub fn with_modified(mut self, modified: NaiveDateTime) -> Self {
        self.modified = Some(modified);
        self
    }

    pub fn with_hash(mut self, hash: impl Into<String>) -> Self {
        self.hash = Some(hash.into());
        self
    }
}

/// A listed file that survived the exclusion filter
pub type CandidateFile = RemoteFileRef;

/// One CSV row in the canonical shape
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NormalizedRow {
    /// `YYYY-MM-DDTHH:MM:SS`, absent when the raw date/time did not parse
    pub datetime: Option<String>,
    pub date: Option<String>,
    pub time: Option<String>,
    pub label: Option<String>,
    pub form1: Option<f64>,
    pub form2: Option<f64>,
    /// Numeric slots in column order, at most [`MAX_SLOTS`]
    pub values: Vec<Option<f64>>,
}

impl NormalizedRow {
    /// Row timestamp, preferring the ISO value over the raw date/time pair
    pub fn timestamp(&self) -> Option<NaiveDateTime> {
        if let Some(dt) = self.datetime.as_deref().and_then(parse_iso) {
            return Some(dt);
        }
        match (self.date.as_deref(), self.time.as_deref()) {
            (Some(date), Some(time)) => parse_report_datetime(date, time),
            _ => None,
        }
    }
}

/// Parser output for one file, written as the processed snapshot
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NormalizedFile {
    pub source: String,
    pub rows: Vec<NormalizedRow>,
    /// Malformed rows dropped while parsing
    #[serde(skip)]
    pub skipped: usize,
}

/// Latest persisted (Dia, Hora) for a file tag
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Watermark {
    pub dia: String,
    pub hora: String,
}

impl Watermark {
    pub fn new(dia: impl Into<String>, hora: impl Into<String>) -> Self {
        Self {
            dia: dia.into(),
            hora: hora.into(),
        }
    }

    pub fn timestamp(&self) -> Option<NaiveDateTime> {
        parse_report_datetime(&self.dia, &self.hora)
    }
}

/// A row in the `relatorio` table layout
#[derive(Debug, Clone, PartialEq)]
pub struct PersistedRow {
    pub dia: Option<String>,
    pub hora: Option<String>,
    pub nome: Option<String>,
    pub form1: Option<i32>,
    pub form2: Option<i32>,
    pub prod: [Option<i32>; MAX_SLOTS],
}

impl Default for PersistedRow {
    fn default() -> Self {
        Self {
            dia: None,
            hora: None,
            nome: None,
            form1: None,
            form2: None,
            prod: [None; MAX_SLOTS],
        }
    }
}

/// Lifecycle of a file tag inside the orchestrator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileProcessingState {
    Pending,
    InFlight,
    Done,
}

/// What the post-persist hooks see for a finished file
#[derive(Debug, Clone)]
pub struct ProcessedFile {
    pub name: String,
    /// Downloaded copy in the working directory
    pub local_path: PathBuf,
    /// JSON snapshot written by the artifact store
    pub snapshot_path: Option<PathBuf>,
    /// Rows parsed from the file
    pub parsed_rows: usize,
    /// Rows handed to the store in this pass
    pub mapped_rows: usize,
    /// Rows the store reported as inserted
    pub inserted_rows: u64,
    /// Rows the store holds for this tag after the insert
    pub stored_rows: i64,
}

/// Parse `DD/MM/YY` or `DD/MM/YYYY` plus `HH:MM[:SS]`
///
/// ISO dates (`YYYY-MM-DD`) are accepted too. Two-digit years are 2000+YY.
pub fn parse_report_datetime(date: &str, time: &str) -> Option<NaiveDateTime> {
    let date = parse_report_date(date.trim())?;
    let time = parse_report_time(time.trim())?;
    Some(date.and_time(time))
}

fn parse_report_date(raw: &str) -> Option<NaiveDate> {
    let parts: Vec<&str> = raw.split('/').collect();
    if let [day, month, year] = parts.as_slice() {
        let day: u32 = day.parse().ok()?;
        let month: u32 = month.parse().ok()?;
        let mut year: i32 = year.parse().ok()?;
        if year < 100 {
            year += 2000;
        }
        return NaiveDate::from_ymd_opt(year, month, day);
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d").ok()
}

fn parse_report_time(raw: &str) -> Option<NaiveTime> {
    NaiveTime::parse_from_str(raw, "%H:%M:%S")
        .or_else(|_| NaiveTime::parse_from_str(raw, "%H:%M"))
        .ok()
}

/// Parse a stored ISO value, with or without an offset
pub fn parse_iso(raw: &str) -> Option<NaiveDateTime> {
    NaiveDateTime::parse_from_str(raw, ISO_FORMAT)
        .ok()
        .or_else(|| DateTime::parse_from_rfc3339(raw).ok().map(|dt| dt.naive_utc()))
}

pub fn format_iso(dt: NaiveDateTime) -> String {
    dt.format(ISO_FORMAT).to_string()
}
