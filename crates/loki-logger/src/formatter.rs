// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Conversion of raw log lines into a Loki push payload.
//!
//! Each line is checked for a leading `YYYY/MM/DD HH:MM:SS` prefix (the
//! layout written by most line-oriented loggers) and for a severity marker
//! (`INFO`, `ERROR`, `WARN`, `DEBUG`). Entries are grouped by severity into
//! streams labeled with the service name:
//!
//! ```json
//! {"streams": [
//!   {"stream": {"level": "info", "service_name": "api"},
//!    "values": [["1705314600000000000", "hello world"]]}
//! ]}
//! ```

use chrono::{NaiveDateTime, Utc};
use serde::ser::SerializeTuple;
use serde::{Serialize, Serializer};
use std::collections::BTreeMap;

pub const SERVICE_NAME_LABEL: &str = "service_name";
pub const LEVEL_LABEL: &str = "level";

const TIMESTAMP_FORMAT: &str = "%Y/%m/%d %H:%M:%S%.f";

/// Severity bucket of an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Level {
    #[default]
    Info,
    Error,
    Warn,
    Debug,
}

impl Level {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Error => "error",
            Self::Warn => "warn",
            Self::Debug => "debug",
        }
    }

    fn from_marker(token: &str) -> Option<Self> {
        match token {
            "INFO" => Some(Self::Info),
            "ERROR" => Some(Self::Error),
            "WARN" => Some(Self::Warn),
            "DEBUG" => Some(Self::Debug),
            _ => None,
        }
    }
}

/// A single log value: event time in nanoseconds since the epoch and the message.
///
/// Serialized as a two-element array of strings, which is how the push API
/// expects timestamps (as text, to survive JSON number precision).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub timestamp_nanos: i64,
    pub message: String,
}

impl Serialize for Entry {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut tuple = serializer.serialize_tuple(2)?;
        tuple.serialize_element(&self.timestamp_nanos.to_string())?;
        tuple.serialize_element(&self.message)?;
        tuple.end()
    }
}

/// Entries sharing one label set.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Stream {
    pub stream: BTreeMap<String, String>,
    pub values: Vec<Entry>,
}

impl Stream {
    #[must_use]
    pub fn level(&self) -> Option<&str> {
        self.stream.get(LEVEL_LABEL).map(String::as_str)
    }
}

/// One push request worth of log streams. Consumed once by the transport.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Batch {
    pub streams: Vec<Stream>,
}

impl Batch {
    /// Total number of entries across all streams.
    #[must_use]
    pub fn len(&self) -> usize {
        self.streams.iter().map(|s| s.values.len()).sum()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.streams.iter().all(|s| s.values.is_empty())
    }

    #[must_use]
    pub fn stream_for(&self, level: Level) -> Option<&Stream> {
        self.streams
            .iter()
            .find(|s| s.level() == Some(level.as_str()))
    }

    pub fn to_json(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}

/// Builds [`Batch`]es labeled with a fixed service name.
#[derive(Debug, Clone)]
pub struct BatchFormatter {
    service_name: String,
}

impl BatchFormatter {
    #[must_use]
    pub fn new(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
        }
    }

    /// Formats lines using the wall clock for lines without a parsable timestamp.
    #[must_use]
    pub fn format(&self, lines: &[String]) -> Batch {
        self.format_with_clock(lines, now_nanos)
    }

    /// Formats lines, calling `now` for every line that lacks a usable timestamp.
    pub fn format_with_clock<F>(&self, lines: &[String], now: F) -> Batch
    where
        F: Fn() -> i64,
    {
        let mut groups: Vec<(Level, Vec<Entry>)> = Vec::new();

        for line in lines {
            let Some((level, entry)) = parse_line(line, &now) else {
                continue;
            };
            match groups.iter_mut().find(|(l, _)| *l == level) {
                Some((_, entries)) => entries.push(entry),
                None => groups.push((level, vec![entry])),
            }
        }

        let streams = groups
            .into_iter()
            .map(|(level, values)| Stream {
                stream: self.labels(level),
                values,
            })
            .collect();

        Batch { streams }
    }

    fn labels(&self, level: Level) -> BTreeMap<String, String> {
        BTreeMap::from([
            (SERVICE_NAME_LABEL.to_string(), self.service_name.clone()),
            (LEVEL_LABEL.to_string(), level.as_str().to_string()),
        ])
    }
}

fn now_nanos() -> i64 {
    Utc::now().timestamp_nanos_opt().unwrap_or_default()
}

/// Parses one raw line. Blank lines yield `None`.
fn parse_line<F>(line: &str, now: &F) -> Option<(Level, Entry)>
where
    F: Fn() -> i64,
{
    let line = line.trim();
    if line.is_empty() {
        return None;
    }

    let (timestamp_nanos, message) = match split_prefix(line) {
        Some((date, time, rest)) => match parse_timestamp(date, time) {
            Some(timestamp_nanos) => (timestamp_nanos, rest),
            // Keep the unparsed tokens as part of the message.
            None => (now(), line),
        },
        None => (now(), line),
    };

    let (level, message) = extract_level(message);
    Some((
        level,
        Entry {
            timestamp_nanos,
            message,
        },
    ))
}

/// Splits a trimmed line into `(date, time, remainder)` when it has three tokens.
fn split_prefix(line: &str) -> Option<(&str, &str, &str)> {
    let (date, rest) = line.split_once(char::is_whitespace)?;
    let (time, rest) = rest.trim_start().split_once(char::is_whitespace)?;
    let rest = rest.trim();
    if rest.is_empty() {
        return None;
    }
    Some((date, time, rest))
}

fn parse_timestamp(date: &str, time: &str) -> Option<i64> {
    NaiveDateTime::parse_from_str(&format!("{date} {time}"), TIMESTAMP_FORMAT)
        .ok()?
        .and_utc()
        .timestamp_nanos_opt()
}

/// Removes the first severity marker token from `message`.
fn extract_level(message: &str) -> (Level, String) {
    let mut cursor = 0;
    for token in message.split_whitespace() {
        let start = cursor + message[cursor..].find(token).unwrap_or(0);
        let end = start + token.len();
        if let Some(level) = Level::from_marker(token) {
            let head = message[..start].trim_end();
            let tail = message[end..].trim_start();
            let stripped = match (head.is_empty(), tail.is_empty()) {
                (true, _) => tail.to_string(),
                (false, true) => head.to_string(),
                (false, false) => format!("{head} {tail}"),
            };
            return (level, stripped);
        }
        cursor = end;
    }
    (Level::Info, message.to_string())
}
