//! Payload parsing into dated observation rows
//!
//! A payload is CSV text (`DATE,VALUE[,REVISION]` with a header row). Some
//! transports hand back the CSV rendered inside an HTML document, so the
//! `<pre>`/`<body>` content is unwrapped and unescaped first.

use std::borrow::Cow;
use std::collections::BTreeMap;

use chrono::NaiveDate;
use lazy_static::lazy_static;
use regex::Regex;
use thiserror::Error;
use tracing::warn;

use crate::domain::{ObservationRow, RawPayload};

lazy_static! {
    static ref PRE_BLOCK: Regex = Regex::new(r"(?is)<pre[^>]*>(.*?)</pre>").expect("valid regex literal");
    static ref BODY_BLOCK: Regex = Regex::new(r"(?is)<body[^>]*>(.*?)</body>").expect("valid regex literal");
    static ref TAG: Regex = Regex::new(r"<[^>]+>").expect("valid regex literal");
}

const DATE_FORMATS: [&str; 2] = ["%Y-%m-%d", "%Y/%m/%d"];

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("Payload is empty")]
    Empty,

    #[error("Payload has no header row (first line: {0})")]
    MissingHeader(String),

    #[error("Invalid observation date '{value}' on line {line}")]
    InvalidDate { line: u64, value: String },

    #[error("Payload contains no observation rows")]
    NoRows,

    #[error("CSV error: {0}")]
    Csv(String),
}

impl From<csv::Error> for ParseError {
    fn from(err: csv::Error) -> Self {
        Self::Csv(err.to_string())
    }
}

/// Rows parsed from one payload, sorted by date with one row per date
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedPayload {
    pub rows: Vec<ObservationRow>,
    /// Rows dropped because their value was not numeric
    pub skipped_values: usize,
}

impl ParsedPayload {
    pub fn max_date(&self) -> Option<NaiveDate> {
        self.rows.last().map(|row| row.date)
    }
}

pub fn parse_payload(payload: &RawPayload) -> Result<ParsedPayload, ParseError> {
    let text = extract_csv_text(&payload.body);
    let text = text.trim();
    if text.is_empty() {
        return Err(ParseError::Empty);
    }

    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(text.as_bytes());

    let headers = reader.headers()?.clone();
    let first = headers.get(0).unwrap_or_default();
    if headers.len() < 2 || parse_date(first).is_some() {
        return Err(ParseError::MissingHeader(headers.iter().collect::<Vec<_>>().join(",")));
    }

    let mut by_date: BTreeMap<NaiveDate, ObservationRow> = BTreeMap::new();
    let mut skipped_values = 0;

    for record in reader.records() {
        let record = record?;
        let line = record.position().map_or(0, csv::Position::line);
        let raw_date = record.get(0).unwrap_or_default();
        if raw_date.is_empty() && record.len() <= 1 {
            continue;
        }

        let date = parse_date(raw_date).ok_or_else(|| ParseError::InvalidDate {
            line,
            value: raw_date.to_string(),
        })?;

        let raw_value = record.get(1).unwrap_or_default();
        let value = match parse_value(raw_value) {
            Ok(value) => value,
            Err(()) => {
                warn!("Skipping non-numeric value '{}' for {} (line {})", raw_value, date, line);
                skipped_values += 1;
                continue;
            }
        };

        let revision = record
            .get(2)
            .filter(|r| !r.is_empty())
            .map(str::to_string);

        // a repeated date within one payload: the later row wins
        by_date.insert(date, ObservationRow { date, value, revision });
    }

    if by_date.is_empty() {
        return Err(ParseError::NoRows);
    }

    Ok(ParsedPayload {
        rows: by_date.into_values().collect(),
        skipped_values,
    })
}

/// Strip an HTML wrapper around CSV text, if any
fn extract_csv_text(body: &str) -> Cow<'_, str> {
    let lower_head: String = body.chars().take(512).collect::<String>().to_lowercase();
    if !lower_head.contains("<html") && !lower_head.contains("<pre") && !lower_head.contains("<body") {
        return Cow::Borrowed(body);
    }

    let inner = PRE_BLOCK
        .captures(body)
        .or_else(|| BODY_BLOCK.captures(body))
        .and_then(|caps| caps.get(1))
        .map_or(body, |m| m.as_str());

    let stripped = TAG.replace_all(inner, "");
    Cow::Owned(unescape_entities(&stripped))
}

fn unescape_entities(text: &str) -> String {
    text.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&#39;", "'")
        .replace("&amp;", "&")
}

fn parse_date(raw: &str) -> Option<NaiveDate> {
    DATE_FORMATS
        .iter()
        .find_map(|format| NaiveDate::parse_from_str(raw, format).ok())
}

/// `.` and empty mark a missing observation
fn parse_value(raw: &str) -> Result<Option<f64>, ()> {
    if raw.is_empty() || raw == "." {
        return Ok(None);
    }
    match raw.replace(',', "").parse::<f64>() {
        Ok(value) if value.is_finite() => Ok(Some(value)),
        _ => Err(()),
    }
}
