//! Shared types for loggoblin
//!
//! This crate contains the data model passed between the source readers,
//! the normalizer, the filter engine, the multiplexer and the scrollback
//! buffer.

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

// ============================================================================
// Source Types
// ============================================================================

static NEXT_SOURCE_ID: AtomicU32 = AtomicU32::new(1);

/// Opaque handle for one log source
///
/// Ids are handed out in allocation order, which makes them usable as the
/// deterministic tie-break when two records share a timestamp.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SourceId(u32);

impl SourceId {
    /// Allocate a fresh, process-unique id
    pub fn next() -> Self {
        Self(NEXT_SOURCE_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn get(self) -> u32 {
        self.0
    }
}

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Health of a source as reported to the presenter
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SourceHealth {
    /// Reading normally
    Connected,
    /// Lost the underlying resource, trying to reopen it
    Reconnecting { attempt: u32 },
    /// Reached end of stream or was closed
    Ended,
    /// Gave up after a terminal read error
    Failed(String),
}

impl SourceHealth {
    /// Whether the source will never produce another line
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Ended | Self::Failed(_))
    }
}

impl fmt::Display for SourceHealth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connected => write!(f, "connected"),
            Self::Reconnecting { attempt } => write!(f, "reconnecting (attempt {attempt})"),
            Self::Ended => write!(f, "ended"),
            Self::Failed(reason) => write!(f, "failed: {reason}"),
        }
    }
}

/// A health transition of one source
#[derive(Clone, Debug)]
pub struct HealthEvent {
    pub source: SourceId,
    pub tag: Arc<str>,
    pub health: SourceHealth,
}

// ============================================================================
// Log Types
// ============================================================================

/// Log severity level
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub enum Severity {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
    Fatal,
    #[default]
    Unknown,
}

impl Severity {
    /// Parse a severity keyword, returning `None` for anything unrecognised
    pub fn from_keyword(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "trace" | "trc" | "trce" => Some(Self::Trace),
            "debug" | "dbg" | "debg" => Some(Self::Debug),
            "info" | "inf" | "information" | "notice" => Some(Self::Info),
            "warn" | "warning" | "wrn" => Some(Self::Warn),
            "error" | "err" | "erro" => Some(Self::Error),
            "fatal" | "panic" | "critical" | "crit" | "ftl" | "emerg" | "alert" => {
                Some(Self::Fatal)
            }
            "unknown" => Some(Self::Unknown),
            _ => None,
        }
    }

    /// Parse log level from common formats, falling back to `Unknown`
    pub fn parse(s: &str) -> Self {
        Self::from_keyword(s).unwrap_or(Self::Unknown)
    }

    /// Ordinal used for threshold comparisons
    ///
    /// `Unknown` ranks with `Info`.
    pub fn rank(self) -> u8 {
        match self {
            Self::Trace => 0,
            Self::Debug => 1,
            Self::Info | Self::Unknown => 2,
            Self::Warn => 3,
            Self::Error => 4,
            Self::Fatal => 5,
        }
    }

    /// ERROR or FATAL
    pub fn is_error_or_worse(self) -> bool {
        matches!(self, Self::Error | Self::Fatal)
    }

    /// Short display string (3 chars)
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Trace => "TRC",
            Self::Debug => "DBG",
            Self::Info => "INF",
            Self::Warn => "WRN",
            Self::Error => "ERR",
            Self::Fatal => "FTL",
            Self::Unknown => "???",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Trace => "TRACE",
            Self::Debug => "DEBUG",
            Self::Info => "INFO",
            Self::Warn => "WARN",
            Self::Error => "ERROR",
            Self::Fatal => "FATAL",
            Self::Unknown => "UNKNOWN",
        };
        f.write_str(name)
    }
}

/// One line exactly as read from a source
#[derive(Clone, Debug, PartialEq)]
pub struct RawLine {
    pub source_id: SourceId,

    /// Label of the source (file path, `stdin`, command line)
    pub source_tag: Arc<str>,

    /// Per-source counter, strictly increasing, starts at 1
    pub sequence: u64,

    /// Offset of the first byte of this line in the underlying input
    pub byte_offset: u64,

    /// Line text without the trailing newline
    pub text: String,

    pub arrival_time: DateTime<Utc>,
}

/// A normalized log line
///
/// Records are never mutated once built; they are shared behind an `Arc`.
#[derive(Clone, Debug, PartialEq)]
pub struct Record {
    pub source_id: SourceId,
    pub sequence: u64,
    pub arrival_time: DateTime<Utc>,

    /// Timestamp found in the line itself (if any)
    pub parsed_timestamp: Option<DateTime<Utc>>,

    pub severity: Severity,

    /// Always contains the source tag
    pub tags: BTreeSet<String>,

    /// Message content with timestamp and severity prefix removed
    pub body: String,

    /// Whether the line was a JSON object
    pub is_json: bool,

    /// Top-level fields of a JSON line, empty otherwise
    pub fields: Map<String, Value>,

    pub raw: RawLine,
}

/// Records are shared between the multiplexer, the filter and the scrollback
pub type SharedRecord = Arc<Record>;

impl Record {
    /// Timestamp used for ordering: the parsed one, else arrival time
    pub fn timestamp(&self) -> DateTime<Utc> {
        self.parsed_timestamp.unwrap_or(self.arrival_time)
    }

    pub fn ordering_key(&self) -> OrderingKey {
        OrderingKey {
            at: self.timestamp(),
            source: self.source_id,
            sequence: self.sequence,
        }
    }

    pub fn source_tag(&self) -> &str {
        &self.raw.source_tag
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.contains(tag)
    }
}

/// Global output order: time, then source, then sequence
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct OrderingKey {
    pub at: DateTime<Utc>,
    pub source: SourceId,
    pub sequence: u64,
}

// ============================================================================
// Filter Output
// ============================================================================

/// Identifier of one filter rule, stable across rule-set updates
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RuleId(pub u32);

impl fmt::Display for RuleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "r{}", self.0)
    }
}

/// Outcome of evaluating one record against a rule set
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Verdict {
    pub keep: bool,

    /// Sorted, non-overlapping byte ranges into `raw.text`
    pub highlight_spans: Vec<(usize, usize)>,

    /// Id of the rule that decided the outcome (if any)
    pub matched_rule: Option<RuleId>,
}

impl Verdict {
    /// Kept with nothing highlighted
    pub fn keep() -> Self {
        Self {
            keep: true,
            highlight_spans: Vec::new(),
            matched_rule: None,
        }
    }

    pub fn drop_by(rule: RuleId) -> Self {
        Self {
            keep: false,
            highlight_spans: Vec::new(),
            matched_rule: Some(rule),
        }
    }
}

impl Default for Verdict {
    fn default() -> Self {
        Self::keep()
    }
}

/// A record as held by the scrollback buffer and handed to the presenter
#[derive(Clone, Debug)]
pub struct ScrollbackEntry {
    /// Assigned by the scrollback buffer on append, 0 before that
    pub id: u64,

    pub record: SharedRecord,

    pub verdict: Verdict,

    /// Version of the rule set `verdict` was computed with
    pub rules_version: u64,

    /// Emitted after a record with a later ordering key
    pub late_arrival: bool,
}

impl ScrollbackEntry {
    pub fn new(record: SharedRecord, verdict: Verdict, rules_version: u64) -> Self {
        Self {
            id: 0,
            record,
            verdict,
            rules_version,
            late_arrival: false,
        }
    }

    pub fn is_kept(&self) -> bool {
        self.verdict.keep
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn record(source: SourceId, sequence: u64, parsed: Option<DateTime<Utc>>) -> Record {
        let arrival = Utc.with_ymd_and_hms(2024, 1, 15, 12, 0, 0).unwrap();
        Record {
            source_id: source,
            sequence,
            arrival_time: arrival,
            parsed_timestamp: parsed,
            severity: Severity::Unknown,
            tags: BTreeSet::new(),
            body: String::new(),
            is_json: false,
            fields: Map::new(),
            raw: RawLine {
                source_id: source,
                source_tag: Arc::from("test"),
                sequence,
                byte_offset: 0,
                text: String::new(),
                arrival_time: arrival,
            },
        }
    }

    #[test]
    fn test_severity_keywords() {
        assert_eq!(Severity::parse("WARNING"), Severity::Warn);
        assert_eq!(Severity::parse("err"), Severity::Error);
        assert_eq!(Severity::parse("crit"), Severity::Fatal);
        assert_eq!(Severity::parse("chatty"), Severity::Unknown);
        assert_eq!(Severity::from_keyword("chatty"), None);
    }

    #[test]
    fn test_unknown_ranks_as_info() {
        assert_eq!(Severity::Unknown.rank(), Severity::Info.rank());
        assert!(Severity::Warn.rank() < Severity::Error.rank());
    }

    #[test]
    fn test_ordering_key_prefers_parsed_timestamp() {
        let a = SourceId::next();
        let early = Utc.with_ymd_and_hms(2024, 1, 15, 10, 0, 0).unwrap();
        let r = record(a, 1, Some(early));
        assert_eq!(r.ordering_key().at, early);

        let r = record(a, 2, None);
        assert_eq!(r.ordering_key().at, r.arrival_time);
    }

    #[test]
    fn test_ordering_key_tie_break() {
        let a = SourceId::next();
        let b = SourceId::next();
        let at = Utc.with_ymd_and_hms(2024, 1, 15, 10, 0, 0).unwrap();

        let ka1 = record(a, 1, Some(at)).ordering_key();
        let ka2 = record(a, 2, Some(at)).ordering_key();
        let kb1 = record(b, 1, Some(at)).ordering_key();

        assert!(ka1 < ka2);
        assert!(ka2 < kb1);
    }
}
