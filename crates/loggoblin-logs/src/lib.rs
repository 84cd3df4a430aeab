//! Log processing for loggoblin
//!
//! This crate provides source readers, line normalization, rule-based
//! filtering, the time-ordered multiplexer and the scrollback buffer.

mod buffer;
mod error;
mod filter;
mod mux;
mod normalizer;
mod source;

pub use buffer::{DEFAULT_CAPACITY, Scrollback, SeverityCounts};
pub use error::{ParseAnomaly, PatternError, ReadError, RuleError};
pub use filter::{Comparison, FilterRule, Predicate, RuleKind, RuleSet, RuleStore, evaluate};
pub use mux::{BackpressurePolicy, MuxConfig, MuxHandle, Multiplexer};
pub use normalizer::{Normalizer, NormalizerConfig, SeverityPatternConfig, TimestampPatternConfig};
pub use source::{ReaderConfig, SourceReader, SourceSpec};

// Re-export types used in our public API
pub use loggoblin_types::{
    HealthEvent, OrderingKey, RawLine, Record, RuleId, ScrollbackEntry, Severity, SharedRecord,
    SourceHealth, SourceId, Verdict,
};
