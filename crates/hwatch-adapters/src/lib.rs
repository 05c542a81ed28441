//! Extraction descriptors and the markup-to-`Report` extractor.
//!
//! A descriptor locates a stable region of the page by CSS selector and then
//! walks explicit navigation steps to each value. Every missing node or
//! unparseable value surfaces as an [`ExtractionError`], which signals schema
//! drift on the source page rather than a transient failure.

use std::fmt;

use chrono::NaiveDate;
use hwatch_core::Report;
use scraper::{ElementRef, Html, Selector};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "hwatch-adapters";

/// Marks appended to published numbers to point at footnotes.
const ANNOTATION_MARKS: &[char] = &['*', '†', '‡', '^'];

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ExtractionError {
    #[error("invalid selector {selector:?}: {message}")]
    InvalidSelector { selector: String, message: String },
    #[error("region {selector:?} not found on page")]
    RegionNotFound { selector: String },
    #[error("{field}: no node at step {step}")]
    NodeNotFound { field: String, step: String },
    #[error("{field}: node has no text")]
    EmptyText { field: String },
    #[error("{field}: {text:?} is not a non-negative integer")]
    InvalidNumber { field: String, text: String },
    #[error("date {text:?} matches none of the formats {formats:?}")]
    InvalidDate { text: String, formats: Vec<String> },
}

/// One structural navigation step, applied to the current element.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Step {
    /// First descendant matching a CSS selector.
    Select(String),
    /// Nth element child, zero-based.
    Child(usize),
    /// Last element child.
    LastChild,
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Step::Select(css) => write!(f, "select({css})"),
            Step::Child(n) => write!(f, "child({n})"),
            Step::LastChild => f.write_str("last-child"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CounterPath {
    pub name: String,
    pub steps: Vec<Step>,
}

impl CounterPath {
    pub fn new(name: &str, steps: Vec<Step>) -> Self {
        Self {
            name: name.to_string(),
            steps,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractionDescriptor {
    /// Selector for the containing region; all steps start from its first match.
    pub region: String,
    pub date: Vec<Step>,
    /// chrono formats tried in order against the published date text.
    pub date_formats: Vec<String>,
    pub counters: Vec<CounterPath>,
}

impl ExtractionDescriptor {
    /// Extract a complete report or fail. A page where the date resolves but
    /// any counter does not is rejected whole.
    pub fn extract(&self, source_id: &str, body: &[u8]) -> Result<Report, ExtractionError> {
        let text = String::from_utf8_lossy(body);
        let document = Html::parse_document(&text);

        let region_selector = parse_selector(&self.region)?;
        let region = document.select(&region_selector).next().ok_or_else(|| {
            ExtractionError::RegionNotFound {
                selector: self.region.clone(),
            }
        })?;

        let date_text = navigate_text(region, "date", &self.date)?;
        let date = parse_published_date(&date_text, &self.date_formats).ok_or_else(|| {
            ExtractionError::InvalidDate {
                text: date_text.clone(),
                formats: self.date_formats.clone(),
            }
        })?;

        let mut report = Report::new(source_id, date);
        for counter in &self.counters {
            let raw = navigate_text(region, &counter.name, &counter.steps)?;
            let value = normalize_count(&raw).ok_or_else(|| ExtractionError::InvalidNumber {
                field: counter.name.clone(),
                text: raw.clone(),
            })?;
            report.counters.insert(counter.name.clone(), value);
        }
        Ok(report)
    }
}

fn parse_selector(selector: &str) -> Result<Selector, ExtractionError> {
    Selector::parse(selector).map_err(|e| ExtractionError::InvalidSelector {
        selector: selector.to_string(),
        message: e.to_string(),
    })
}

fn element_children<'a>(node: ElementRef<'a>) -> impl Iterator<Item = ElementRef<'a>> {
    node.children().filter_map(ElementRef::wrap)
}

fn navigate<'a>(
    start: ElementRef<'a>,
    field: &str,
    steps: &[Step],
) -> Result<ElementRef<'a>, ExtractionError> {
    let mut node = start;
    for step in steps {
        let next = match step {
            Step::Select(css) => {
                let selector = parse_selector(css)?;
                node.select(&selector).next()
            }
            Step::Child(n) => element_children(node).nth(*n),
            Step::LastChild => element_children(node).last(),
        };
        node = next.ok_or_else(|| ExtractionError::NodeNotFound {
            field: field.to_string(),
            step: step.to_string(),
        })?;
    }
    Ok(node)
}

fn navigate_text(start: ElementRef<'_>, field: &str, steps: &[Step]) -> Result<String, ExtractionError> {
    let node = navigate(start, field, steps)?;
    text_or_none(node.text().collect::<String>()).ok_or_else(|| ExtractionError::EmptyText {
        field: field.to_string(),
    })
}

fn text_or_none(value: String) -> Option<String> {
    let collapsed = value.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.is_empty() {
        None
    } else {
        Some(collapsed)
    }
}

fn strip_annotations(text: &str) -> &str {
    text.trim().trim_end_matches(ANNOTATION_MARKS).trim()
}

/// `"1,234"` -> 1234, `"987*"` -> 987, `"  42  "` -> 42. Anything that is
/// not a plain non-negative integer after that cleanup yields `None`.
pub fn normalize_count(raw: &str) -> Option<i64> {
    let digits = strip_annotations(raw)
        .chars()
        .filter(|c| *c != ',')
        .collect::<String>();
    if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

pub fn parse_published_date(raw: &str, formats: &[String]) -> Option<NaiveDate> {
    let text = strip_annotations(raw);
    formats
        .iter()
        .find_map(|format| NaiveDate::parse_from_str(text, format).ok())
}

fn default_date_formats() -> Vec<String> {
    ["%B %d, %Y", "%b %d, %Y", "%m/%d/%Y"]
        .iter()
        .map(|f| f.to_string())
        .collect()
}

/// Daily case table on the health-alerts page: first body row holds
/// date, cases reported that day, and the running total.
pub fn cases_extraction() -> ExtractionDescriptor {
    let first_row = || Step::Select("tbody > tr".to_string());
    ExtractionDescriptor {
        region: ".super-block__teaser".to_string(),
        date: vec![first_row(), Step::Child(0)],
        date_formats: default_date_formats(),
        counters: vec![
            CounterPath::new("reported", vec![first_row(), Step::Child(1)]),
            CounterPath::new("total", vec![first_row(), Step::Child(2)]),
        ],
    }
}

/// Surveillance testing results: the date sits in the header paragraph,
/// each counter in the second cell of its body row.
pub fn surveys_extraction() -> ExtractionDescriptor {
    let value_cell = |row: usize| {
        Step::Select(format!("tbody > tr:nth-child({row}) > td:nth-child(2)"))
    };
    ExtractionDescriptor {
        region: ".super-block__teaser".to_string(),
        date: vec![
            Step::Select("thead th p".to_string()),
            Step::Child(0),
            Step::LastChild,
        ],
        date_formats: default_date_formats(),
        counters: vec![
            CounterPath::new("positive", vec![value_cell(1), Step::Child(0)]),
            CounterPath::new("administered", vec![value_cell(2), Step::Child(0)]),
        ],
    }
}
