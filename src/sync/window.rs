//! Time windows bounding which records a pagination chain lists.

use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde_json::{Value, json};
use std::fmt;

const API_TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%SZ";

/// Half-open interval `[start, end)` on the records' expected start date.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeWindow {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Option<Self> {
        (start < end).then_some(Self { start, end })
    }

    /// Split into consecutive windows of at most `step`; the last is clipped to `end`.
    pub fn chunks(&self, step: Duration) -> Vec<TimeWindow> {
        if step <= Duration::zero() {
            return vec![*self];
        }

        let mut windows = Vec::new();
        let mut cursor = self.start;
        while cursor < self.end {
            let next = (cursor + step).min(self.end);
            windows.push(TimeWindow {
                start: cursor,
                end: next,
            });
            cursor = next;
        }
        windows
    }
}

impl fmt::Display for TimeWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}..{}",
            self.start.format(API_TIMESTAMP_FORMAT),
            self.end.format(API_TIMESTAMP_FORMAT)
        )
    }
}

/// Listing filter: a time window plus an optional last-modified cutoff.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordFilter {
    pub window: TimeWindow,
    pub modified_since: Option<NaiveDate>,
}

impl RecordFilter {
    pub fn new(window: TimeWindow) -> Self {
        Self {
            window,
            modified_since: None,
        }
    }

    pub fn modified_since(mut self, date: Option<NaiveDate>) -> Self {
        self.modified_since = date;
        self
    }

    /// Query parameters understood by the listing endpoint.
    pub fn query_params(&self, page_size: usize) -> Vec<(&'static str, String)> {
        let mut params = vec![
            (
                "expectedStartDateGTE",
                self.window.start.format(API_TIMESTAMP_FORMAT).to_string(),
            ),
            (
                "expectedStartDateLT",
                self.window.end.format(API_TIMESTAMP_FORMAT).to_string(),
            ),
            ("pageSize", page_size.to_string()),
        ];

        if let Some(filter) = self.modification_rule() {
            params.push(("filter", filter.to_string()));
        }
        params
    }

    fn modification_rule(&self) -> Option<Value> {
        self.modified_since.map(|date| {
            json!({
                "groupOp": "AND",
                "rules": [{
                    "op": "ged",
                    "field": "lastModifiedDate",
                    "data": date.format("%Y-%m-%d").to_string(),
                    "type": "date"
                }]
            })
        })
    }
}
