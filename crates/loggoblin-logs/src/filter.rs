use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use parking_lot::{Mutex, RwLock};
use regex::Regex;
use tracing::info;

use loggoblin_types::{Record, RuleId, Severity, Verdict};

use crate::error::RuleError;

/// Whether a matching rule keeps or drops a record
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RuleKind {
    Include,
    Exclude,
}

/// Comparison operator of a severity threshold
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Comparison {
    Lt,
    Le,
    Eq,
    Ne,
    Ge,
    Gt,
}

impl Comparison {
    fn holds(self, lhs: u8, rhs: u8) -> bool {
        match self {
            Self::Lt => lhs < rhs,
            Self::Le => lhs <= rhs,
            Self::Eq => lhs == rhs,
            Self::Ne => lhs != rhs,
            Self::Ge => lhs >= rhs,
            Self::Gt => lhs > rhs,
        }
    }
}

/// What a rule looks at
#[derive(Clone)]
pub enum Predicate {
    /// Regex over the raw line text
    Pattern(Regex),
    /// Severity threshold, `Unknown` ranks as `Info`
    Severity { op: Comparison, level: Severity },
    /// Exact tag membership (the source tag is always a tag)
    Tag(String),
}

impl Predicate {
    /// `None` when the predicate does not match, otherwise the matched spans
    /// (empty for non-pattern predicates)
    fn matches(&self, record: &Record) -> Option<Vec<(usize, usize)>> {
        match self {
            Self::Pattern(re) => {
                let spans: Vec<_> = re
                    .find_iter(&record.raw.text)
                    .filter(|m| !m.is_empty())
                    .map(|m| (m.start(), m.end()))
                    .collect();
                if spans.is_empty() && !re.is_match(&record.raw.text) {
                    None
                } else {
                    Some(spans)
                }
            }
            Self::Severity { op, level } => op
                .holds(record.severity.rank(), level.rank())
                .then(Vec::new),
            Self::Tag(tag) => record.has_tag(tag).then(Vec::new),
        }
    }
}

impl fmt::Debug for Predicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pattern(re) => f.debug_tuple("Pattern").field(&re.as_str()).finish(),
            Self::Severity { op, level } => f
                .debug_struct("Severity")
                .field("op", op)
                .field("level", level)
                .finish(),
            Self::Tag(tag) => f.debug_tuple("Tag").field(tag).finish(),
        }
    }
}

/// One compiled filter rule
#[derive(Clone, Debug)]
pub struct FilterRule {
    pub id: RuleId,
    pub kind: RuleKind,
    pub predicate: Predicate,
    pub enabled: bool,
    /// Expression the rule was parsed from
    pub expr: String,
}

impl FilterRule {
    /// Parse a rule expression such as `exclude severity<WARN`,
    /// `include /timeout|refused/i` or `- tag:stdin`
    pub fn parse(id: RuleId, expr: &str) -> Result<Self, RuleError> {
        let trimmed = expr.trim();
        if trimmed.is_empty() {
            return Err(RuleError::Empty);
        }

        let (keyword, rest) = match trimmed.find(char::is_whitespace) {
            Some(pos) => (&trimmed[..pos], trimmed[pos..].trim()),
            None => (trimmed, ""),
        };

        let kind = match keyword.to_lowercase().as_str() {
            "include" | "+" => RuleKind::Include,
            "exclude" | "-" => RuleKind::Exclude,
            _ => return Err(RuleError::MissingKind(trimmed.to_string())),
        };

        if rest.is_empty() {
            return Err(RuleError::MissingPredicate(trimmed.to_string()));
        }

        Ok(Self {
            id,
            kind,
            predicate: parse_predicate(rest, trimmed)?,
            enabled: true,
            expr: trimmed.to_string(),
        })
    }
}

impl fmt::Display for FilterRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.expr)?;
        if !self.enabled {
            f.write_str(" (disabled)")?;
        }
        Ok(())
    }
}

fn parse_predicate(rest: &str, expr: &str) -> Result<Predicate, RuleError> {
    if let Some(body) = rest.strip_prefix('/') {
        let Some(close) = body.rfind('/') else {
            return Err(RuleError::Unterminated(expr.to_string()));
        };
        let (pattern, flags) = (&body[..close], &body[close + 1..]);
        let mut case_insensitive = false;
        for flag in flags.chars() {
            match flag {
                'i' => case_insensitive = true,
                other => {
                    return Err(RuleError::BadFlag {
                        expr: expr.to_string(),
                        flag: other,
                    });
                }
            }
        }
        let source = if case_insensitive {
            format!("(?i){pattern}")
        } else {
            pattern.to_string()
        };
        let re = Regex::new(&source).map_err(|source| RuleError::BadPattern {
            pattern: pattern.to_string(),
            source,
        })?;
        return Ok(Predicate::Pattern(re));
    }

    let lower = rest.to_lowercase();
    // A threshold needs a comparison right after the keyword
    for prefix in ["severity", "level"] {
        if let Some(threshold) = lower.strip_prefix(prefix) {
            let threshold = threshold.trim();
            if threshold.starts_with(['<', '>', '=', '!']) {
                return parse_threshold(threshold, expr);
            }
        }
    }

    for prefix in ["tag:", "source:"] {
        if lower.starts_with(prefix) {
            let tag = rest[prefix.len()..].trim();
            if tag.is_empty() {
                return Err(RuleError::MissingPredicate(expr.to_string()));
            }
            return Ok(Predicate::Tag(tag.to_string()));
        }
    }

    // Anything else is a literal substring
    let re = Regex::new(&regex::escape(rest)).map_err(|source| RuleError::BadPattern {
        pattern: rest.to_string(),
        source,
    })?;
    Ok(Predicate::Pattern(re))
}

fn parse_threshold(s: &str, expr: &str) -> Result<Predicate, RuleError> {
    let ops = [
        ("<=", Comparison::Le),
        (">=", Comparison::Ge),
        ("!=", Comparison::Ne),
        ("==", Comparison::Eq),
        ("<", Comparison::Lt),
        (">", Comparison::Gt),
        ("=", Comparison::Eq),
    ];

    let Some((op, level)) = ops
        .iter()
        .find_map(|(token, op)| s.strip_prefix(token).map(|rest| (*op, rest.trim())))
    else {
        return Err(RuleError::BadComparison(expr.to_string()));
    };

    let level = Severity::from_keyword(level)
        .ok_or_else(|| RuleError::UnknownSeverity(level.to_string()))?;
    Ok(Predicate::Severity { op, level })
}

/// An immutable, ordered set of rules
///
/// Every change to the rules produces a new `RuleSet` with a higher version.
#[derive(Clone, Debug, Default)]
pub struct RuleSet {
    version: u64,
    rules: Vec<FilterRule>,
}

impl RuleSet {
    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn rules(&self) -> &[FilterRule] {
        &self.rules
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn get(&self, id: RuleId) -> Option<&FilterRule> {
        self.rules.iter().find(|r| r.id == id)
    }
}

/// Evaluate a record against a rule set
///
/// Rules run in order. The first matching exclude drops the record.
/// Otherwise the record is kept when no include rule is enabled or when at
/// least one include rule matches.
pub fn evaluate(record: &Record, rules: &RuleSet) -> Verdict {
    let mut has_include = false;
    let mut matched_include = None;
    let mut spans = Vec::new();

    for rule in rules.rules.iter().filter(|r| r.enabled) {
        if rule.kind == RuleKind::Include {
            has_include = true;
        }

        let Some(rule_spans) = rule.predicate.matches(record) else {
            continue;
        };

        match rule.kind {
            RuleKind::Exclude => return Verdict::drop_by(rule.id),
            RuleKind::Include => {
                matched_include.get_or_insert(rule.id);
                spans.extend(rule_spans);
            }
        }
    }

    if has_include && matched_include.is_none() {
        return Verdict {
            keep: false,
            highlight_spans: Vec::new(),
            matched_rule: None,
        };
    }

    Verdict {
        keep: true,
        highlight_spans: merge_spans(spans),
        matched_rule: matched_include,
    }
}

/// Sort spans and merge the overlapping or touching ones
fn merge_spans(mut spans: Vec<(usize, usize)>) -> Vec<(usize, usize)> {
    spans.sort_unstable();
    let mut merged: Vec<(usize, usize)> = Vec::with_capacity(spans.len());
    for (start, end) in spans {
        match merged.last_mut() {
            Some(last) if start <= last.1 => last.1 = last.1.max(end),
            _ => merged.push((start, end)),
        }
    }
    merged
}

/// Process-wide holder of the active rule set
///
/// Readers take a snapshot per evaluation; writers build a fresh `RuleSet`
/// and swap it in, so an evaluation never sees a half-applied update.
pub struct RuleStore {
    current: RwLock<Arc<RuleSet>>,

    /// Serializes read-modify-write updates
    write: Mutex<()>,

    next_id: AtomicU32,

    next_version: AtomicU64,
}

impl RuleStore {
    /// Create an empty store (everything is kept)
    pub fn new() -> Self {
        Self {
            current: RwLock::new(Arc::new(RuleSet::default())),
            write: Mutex::new(()),
            next_id: AtomicU32::new(1),
            next_version: AtomicU64::new(1),
        }
    }

    /// Create a store with the given rules installed
    pub fn from_exprs<I, S>(exprs: I) -> Result<Self, RuleError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let store = Self::new();
        store.install(exprs)?;
        Ok(store)
    }

    /// The rule set in effect right now
    pub fn snapshot(&self) -> Arc<RuleSet> {
        Arc::clone(&self.current.read())
    }

    /// Replace every rule. Nothing changes if any expression is invalid.
    pub fn install<I, S>(&self, exprs: I) -> Result<Arc<RuleSet>, RuleError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let _guard = self.write.lock();
        let mut rules = Vec::new();
        for (index, expr) in exprs.into_iter().enumerate() {
            let rule = FilterRule::parse(self.allocate_id(), expr.as_ref()).map_err(|e| {
                RuleError::AtIndex {
                    index,
                    source: Box::new(e),
                }
            })?;
            rules.push(rule);
        }
        Ok(self.publish(rules))
    }

    /// Append one rule at the end (lowest priority)
    pub fn push(&self, expr: &str) -> Result<RuleId, RuleError> {
        let _guard = self.write.lock();
        let rule = FilterRule::parse(self.allocate_id(), expr)?;
        let id = rule.id;
        let mut rules = self.snapshot().rules.clone();
        rules.push(rule);
        self.publish(rules);
        Ok(id)
    }

    pub fn remove(&self, id: RuleId) -> Result<Arc<RuleSet>, RuleError> {
        let _guard = self.write.lock();
        let mut rules = self.snapshot().rules.clone();
        let before = rules.len();
        rules.retain(|r| r.id != id);
        if rules.len() == before {
            return Err(RuleError::UnknownRule(id));
        }
        Ok(self.publish(rules))
    }

    pub fn set_enabled(&self, id: RuleId, enabled: bool) -> Result<Arc<RuleSet>, RuleError> {
        let _guard = self.write.lock();
        let mut rules = self.snapshot().rules.clone();
        let rule = rules
            .iter_mut()
            .find(|r| r.id == id)
            .ok_or(RuleError::UnknownRule(id))?;
        rule.enabled = enabled;
        Ok(self.publish(rules))
    }

    /// Remove every rule
    pub fn clear(&self) -> Arc<RuleSet> {
        let _guard = self.write.lock();
        self.publish(Vec::new())
    }

    fn allocate_id(&self) -> RuleId {
        RuleId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Caller holds the write guard
    fn publish(&self, rules: Vec<FilterRule>) -> Arc<RuleSet> {
        let set = Arc::new(RuleSet {
            version: self.next_version.fetch_add(1, Ordering::Relaxed),
            rules,
        });
        info!(
            version = set.version,
            rules = set.rules.len(),
            "installed rule set"
        );
        *self.current.write() = Arc::clone(&set);
        set
    }
}

impl Default for RuleStore {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for RuleStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let current = self.snapshot();
        f.debug_struct("RuleStore")
            .field("version", &current.version)
            .field("rules", &current.rules.len())
            .finish()
    }
}
