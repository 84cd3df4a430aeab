use std::io;
use std::path::PathBuf;

use loggoblin_types::RuleId;
use thiserror::Error;

/// A source could not be read
///
/// Terminal for the source that produced it, never for the multiplexer as a
/// whole.
#[derive(Debug, Error)]
pub enum ReadError {
    #[error("failed to open {}: {source}", path.display())]
    Open { path: PathBuf, source: io::Error },

    #[error("failed to spawn `{command}`: {source}")]
    Spawn { command: String, source: io::Error },

    #[error("read from {tag} failed: {source}")]
    Io { tag: String, source: io::Error },

    #[error("{tag} still unavailable after {attempts} reopen attempts: {source}")]
    Exhausted {
        tag: String,
        attempts: u32,
        source: io::Error,
    },
}

/// A filter rule expression was rejected
///
/// The previously installed rule set stays active.
#[derive(Debug, Error)]
pub enum RuleError {
    #[error("empty rule expression")]
    Empty,

    #[error("rule `{0}` must start with include/exclude")]
    MissingKind(String),

    #[error("rule `{0}` has no predicate")]
    MissingPredicate(String),

    #[error("unknown severity `{0}`")]
    UnknownSeverity(String),

    #[error("missing or invalid comparison in `{0}`")]
    BadComparison(String),

    #[error("unterminated pattern in `{0}`")]
    Unterminated(String),

    #[error("unsupported pattern flag `{flag}` in `{expr}`")]
    BadFlag { expr: String, flag: char },

    #[error("invalid pattern `{pattern}`: {source}")]
    BadPattern {
        pattern: String,
        source: regex::Error,
    },

    #[error("no rule with id {0}")]
    UnknownRule(RuleId),

    #[error("rule #{} is invalid: {source}", index + 1)]
    AtIndex {
        index: usize,
        source: Box<RuleError>,
    },
}

/// Something odd about a line that was still turned into a record
#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
pub enum ParseAnomaly {
    #[error("line looks like JSON but does not parse")]
    MalformedJson,

    #[error("no timestamp or severity found")]
    Unstructured,
}

/// A normalizer pattern from the configuration is invalid
#[derive(Debug, Error)]
pub enum PatternError {
    #[error("invalid timestamp pattern `{pattern}`: {source}")]
    Timestamp {
        pattern: String,
        source: regex::Error,
    },

    #[error("invalid severity pattern `{pattern}`: {source}")]
    Severity {
        pattern: String,
        source: regex::Error,
    },

    #[error("unknown severity `{0}` in severity pattern")]
    UnknownSeverity(String),
}
