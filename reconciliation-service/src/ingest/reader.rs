//! Format-dispatching row reader.
//!
//! Each format runs on a blocking thread and feeds rows through a bounded
//! channel, so the consumer pulls a lazy, single-pass sequence and file I/O
//! never blocks the async runtime. Delimited text and modern spreadsheets are
//! streamed; legacy spreadsheets have no streaming primitive and are loaded
//! whole.

use calamine::{open_workbook, Data, Reader, Xls, Xlsx};
use chrono::{Duration, NaiveDate};
use serde::Serialize;
use service_core::error::AppError;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Column header (trimmed) to raw cell text.
pub type RawRow = HashMap<String, String>;

const ROW_CHANNEL_CAPACITY: usize = 1024;

/// Spreadsheets carry their headers in the first sheet row.
const HEADER_ROW: u32 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileFormat {
    /// Comma-separated text with a header row.
    Delimited,
    /// Zipped-XML workbook (`.xlsx`).
    Spreadsheet,
    /// Binary workbook (`.xls`).
    LegacySpreadsheet,
}

impl FileFormat {
    /// Anything that is not a workbook extension is read as delimited text.
    pub fn from_file_name(name: &str) -> Self {
        let lower = name.to_ascii_lowercase();
        if lower.ends_with(".xlsx") {
            Self::Spreadsheet
        } else if lower.ends_with(".xls") {
            Self::LegacySpreadsheet
        } else {
            Self::Delimited
        }
    }
}

#[derive(Debug, Error)]
pub enum ReadError {
    #[error("Failed to open {path}: {message}")]
    Open { path: String, message: String },

    #[error("Unreadable file: {0}")]
    Corrupt(String),

    #[error("Malformed row at line {line}: {message}")]
    Row { line: u64, message: String },
}

impl ReadError {
    /// Fatal errors abort the run; row errors are counted and skipped.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::Row { .. })
    }
}

impl From<ReadError> for AppError {
    fn from(err: ReadError) -> Self {
        AppError::BadRequest(anyhow::Error::new(err))
    }
}

enum Event {
    Headers(Vec<String>),
    Row(RawRow),
    Failed(ReadError),
}

/// Lazy sequence of raw rows from one file.
pub struct RowStream {
    headers: Vec<String>,
    rx: mpsc::Receiver<Event>,
    producer: Option<JoinHandle<()>>,
}

impl RowStream {
    /// Open `path` and start reading in the background. Fails when the file
    /// cannot be opened or its header cannot be read.
    pub async fn open(path: impl Into<PathBuf>, format: FileFormat) -> Result<Self, ReadError> {
        let path = path.into();
        let (tx, mut rx) = mpsc::channel(ROW_CHANNEL_CAPACITY);

        let producer = tokio::task::spawn_blocking(move || {
            let sink = RowSink { tx };
            match format {
                FileFormat::Delimited => read_delimited(&path, &sink),
                FileFormat::Spreadsheet => read_spreadsheet(&path, &sink),
                FileFormat::LegacySpreadsheet => read_legacy_spreadsheet(&path, &sink),
            }
        });

        let headers = match rx.recv().await {
            Some(Event::Headers(headers)) => headers,
            Some(Event::Failed(err)) => return Err(err),
            Some(Event::Row(_)) => {
                return Err(ReadError::Corrupt("row emitted before header".to_string()))
            }
            None => {
                if let Err(e) = producer.await {
                    return Err(ReadError::Corrupt(format!("reader task failed: {}", e)));
                }
                return Ok(Self {
                    headers: Vec::new(),
                    rx,
                    producer: None,
                });
            }
        };

        Ok(Self {
            headers,
            rx,
            producer: Some(producer),
        })
    }

    pub fn headers(&self) -> &[String] {
        &self.headers
    }

    /// Next row, a row-level error, or a fatal error. `None` once the input is exhausted.
    pub async fn next(&mut self) -> Option<Result<RawRow, ReadError>> {
        match self.rx.recv().await {
            Some(Event::Row(row)) => Some(Ok(row)),
            Some(Event::Failed(err)) => Some(Err(err)),
            Some(Event::Headers(_)) => Some(Err(ReadError::Corrupt(
                "unexpected second header".to_string(),
            ))),
            None => {
                let producer = self.producer.take()?;
                match producer.await {
                    Ok(()) => None,
                    Err(e) => Some(Err(ReadError::Corrupt(format!(
                        "reader task failed: {}",
                        e
                    )))),
                }
            }
        }
    }
}

/// Header list and the first few rows of a file, for column mapping.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Preview {
    pub headers: Vec<String>,
    pub rows: Vec<RawRow>,
}

pub async fn preview(
    path: impl Into<PathBuf>,
    format: FileFormat,
    max_rows: usize,
) -> Result<Preview, ReadError> {
    let mut stream = RowStream::open(path, format).await?;
    let mut rows = Vec::with_capacity(max_rows);

    while rows.len() < max_rows {
        match stream.next().await {
            Some(Ok(row)) => rows.push(row),
            Some(Err(err)) if err.is_fatal() => return Err(err),
            Some(Err(_)) => continue,
            None => break,
        }
    }

    Ok(Preview {
        headers: stream.headers().to_vec(),
        rows,
    })
}

struct RowSink {
    tx: mpsc::Sender<Event>,
}

impl RowSink {
    /// Returns false once the consumer has gone away.
    fn send(&self, event: Event) -> bool {
        self.tx.blocking_send(event).is_ok()
    }

    fn fail(&self, err: ReadError) {
        let _ = self.tx.blocking_send(Event::Failed(err));
    }
}

fn open_error(path: &Path, err: impl std::fmt::Display) -> ReadError {
    ReadError::Open {
        path: path.display().to_string(),
        message: err.to_string(),
    }
}

fn clean_header(raw: &str) -> String {
    raw.trim_start_matches('\u{feff}').trim().to_string()
}

fn build_row<'a>(headers: &[String], cells: impl Iterator<Item = (usize, &'a str)>) -> RawRow {
    let mut row = RawRow::with_capacity(headers.len());
    for (idx, value) in cells {
        match headers.get(idx) {
            Some(header) if !header.is_empty() => {
                row.insert(header.clone(), value.to_string());
            }
            _ => {}
        }
    }
    row
}

// ============================================================================
// Delimited text
// ============================================================================

fn read_delimited(path: &Path, sink: &RowSink) {
    let mut reader = match csv::ReaderBuilder::new().flexible(true).from_path(path) {
        Ok(reader) => reader,
        Err(e) => return sink.fail(open_error(path, e)),
    };

    let headers: Vec<String> = match reader.headers() {
        Ok(record) => record.iter().map(clean_header).collect(),
        Err(e) => return sink.fail(ReadError::Corrupt(e.to_string())),
    };
    if !sink.send(Event::Headers(headers.clone())) {
        return;
    }

    for result in reader.into_records() {
        let event = match result {
            Ok(record) => Event::Row(build_row(&headers, record.iter().enumerate())),
            Err(e) if e.is_io_error() => return sink.fail(ReadError::Corrupt(e.to_string())),
            Err(e) => Event::Failed(ReadError::Row {
                line: e.position().map(|p| p.line()).unwrap_or_default(),
                message: e.to_string(),
            }),
        };
        if !sink.send(event) {
            return;
        }
    }
}

// ============================================================================
// Spreadsheets
// ============================================================================

fn read_spreadsheet(path: &Path, sink: &RowSink) {
    let mut workbook: Xlsx<_> = match open_workbook(path) {
        Ok(workbook) => workbook,
        Err(e) => return sink.fail(open_error(path, e)),
    };
    let Some(sheet) = workbook.sheet_names().first().cloned() else {
        sink.send(Event::Headers(Vec::new()));
        return;
    };
    let mut cells = match workbook.worksheet_cells_reader(&sheet) {
        Ok(cells) => cells,
        Err(e) => return sink.fail(ReadError::Corrupt(e.to_string())),
    };

    let mut headers: Option<Vec<String>> = None;
    let mut current_row: Option<u32> = None;
    let mut pending: Vec<(usize, String)> = Vec::new();

    loop {
        let next = match cells.next_cell() {
            Ok(next) => next,
            Err(e) => return sink.fail(ReadError::Corrupt(e.to_string())),
        };
        let row_changed = match &next {
            Some(cell) => current_row != Some(cell.get_position().0),
            None => true,
        };

        if row_changed && !pending.is_empty() {
            if headers.is_none() {
                // A blank first row leaves the sheet without headers.
                let header_row = if current_row == Some(HEADER_ROW) {
                    header_from_cells(std::mem::take(&mut pending))
                } else {
                    Vec::new()
                };
                headers = Some(header_row.clone());
                if !sink.send(Event::Headers(header_row)) {
                    return;
                }
            }
            if !pending.is_empty() {
                let cells_in_row = std::mem::take(&mut pending);
                let event = Event::Row(build_row(
                    headers.as_deref().unwrap_or_default(),
                    cells_in_row.iter().map(|(col, v)| (*col, v.as_str())),
                ));
                if !sink.send(event) {
                    return;
                }
            }
        }

        let Some(cell) = next else { break };
        let (row, col) = cell.get_position();
        current_row = Some(row);
        let value = cell_text(&Data::from(cell.get_value().clone()));
        if !value.is_empty() {
            pending.push((col as usize, value));
        }
    }

    if headers.is_none() {
        sink.send(Event::Headers(Vec::new()));
    }
}

fn read_legacy_spreadsheet(path: &Path, sink: &RowSink) {
    let mut workbook: Xls<_> = match open_workbook(path) {
        Ok(workbook) => workbook,
        Err(e) => return sink.fail(open_error(path, e)),
    };
    let Some(sheet) = workbook.sheet_names().first().cloned() else {
        sink.send(Event::Headers(Vec::new()));
        return;
    };
    let range = match workbook.worksheet_range(&sheet) {
        Ok(range) => range,
        Err(e) => return sink.fail(ReadError::Corrupt(e.to_string())),
    };

    let starts_at_header = range.start().is_some_and(|(row, _)| row == HEADER_ROW);
    let mut rows = range.rows();
    let headers: Vec<String> = if starts_at_header {
        rows.next()
            .map(|row| row.iter().map(|c| clean_header(&cell_text(c))).collect())
            .unwrap_or_default()
    } else {
        Vec::new()
    };
    if !sink.send(Event::Headers(headers.clone())) {
        return;
    }

    for row in rows {
        let texts: Vec<String> = row.iter().map(cell_text).collect();
        if texts.iter().all(String::is_empty) {
            continue;
        }
        let event = Event::Row(build_row(
            &headers,
            texts.iter().enumerate().map(|(i, v)| (i, v.as_str())),
        ));
        if !sink.send(event) {
            return;
        }
    }
}

fn header_from_cells(cells: Vec<(usize, String)>) -> Vec<String> {
    let width = cells.iter().map(|(col, _)| col + 1).max().unwrap_or(0);
    let mut headers = vec![String::new(); width];
    for (col, value) in cells {
        headers[col] = clean_header(&value);
    }
    headers
}

/// Render a cell as text. Formula cells carry their cached result and rich
/// text arrives flattened, so both resolve to plain values here.
fn cell_text(value: &Data) -> String {
    match value {
        Data::Empty => String::new(),
        Data::String(s) => s.clone(),
        Data::Int(i) => i.to_string(),
        Data::Float(f) => format_float(*f),
        Data::Bool(b) => b.to_string(),
        Data::DateTime(dt) => excel_serial_to_text(dt.as_f64()),
        Data::DateTimeIso(s) => s.clone(),
        other => other.to_string(),
    }
}

fn format_float(f: f64) -> String {
    if f.fract() == 0.0 && f.abs() < 1e15 {
        format!("{}", f as i64)
    } else {
        f.to_string()
    }
}

/// Excel serial day numbers count from 1899-12-30.
fn excel_serial_to_text(serial: f64) -> String {
    let days = serial.trunc() as i64;
    let seconds = ((serial - serial.trunc()) * 86_400.0).round() as i64;
    let Some(epoch) = NaiveDate::from_ymd_opt(1899, 12, 30) else {
        return serial.to_string();
    };
    let Some(date) = Duration::try_days(days).and_then(|d| epoch.checked_add_signed(d)) else {
        return serial.to_string();
    };

    if seconds == 0 {
        date.format("%Y-%m-%d").to_string()
    } else {
        let datetime = date.and_hms_opt(0, 0, 0).map(|d| d + Duration::seconds(seconds));
        match datetime {
            Some(dt) => dt.format("%Y-%m-%dT%H:%M:%S").to_string(),
            None => date.format("%Y-%m-%d").to_string(),
        }
    }
}
