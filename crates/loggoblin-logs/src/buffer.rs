use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::{Mutex, RwLock};
use serde_json::{Map, Value};
use tracing::debug;

use loggoblin_types::{ScrollbackEntry, Severity};

use crate::filter::{RuleSet, evaluate};

/// Default number of entries kept
pub const DEFAULT_CAPACITY: usize = 10_000;

/// Thread-safe ring buffer of recently delivered entries
///
/// Excluded entries are kept too, so a rule change can bring them back
/// without reading any source again.
#[derive(Clone)]
pub struct Scrollback {
    /// Internal storage, oldest first
    entries: Arc<RwLock<VecDeque<ScrollbackEntry>>>,

    /// Maximum capacity
    capacity: usize,

    /// Next entry ID
    next_id: Arc<AtomicU64>,

    /// Newest rule set this buffer has been re-evaluated with
    rules: Arc<RwLock<Option<Arc<RuleSet>>>>,

    /// JSON field values over the stored entries, updated with `entries`
    tally: Arc<Mutex<FieldTally>>,
}

impl Scrollback {
    /// Create a new buffer with the given capacity (at least 1)
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: Arc::new(RwLock::new(VecDeque::with_capacity(capacity))),
            capacity,
            next_id: Arc::new(AtomicU64::new(1)),
            rules: Arc::new(RwLock::new(None)),
            tally: Arc::new(Mutex::new(FieldTally::default())),
        }
    }

    /// Store an entry, evicting the oldest if at capacity
    ///
    /// Returns the stored entry with its id assigned. If the buffer already
    /// knows a newer rule set than the entry was evaluated with, the verdict
    /// is recomputed first.
    pub fn append(&self, mut entry: ScrollbackEntry) -> ScrollbackEntry {
        let mut entries = self.entries.write();

        if let Some(rules) = self.rules.read().as_ref() {
            if entry.rules_version < rules.version() {
                entry.verdict = evaluate(&entry.record, rules);
                entry.rules_version = rules.version();
            }
        }

        entry.id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut tally = self.tally.lock();
        tally.add(&entry);
        entries.push_back(entry.clone());
        Self::evict(&mut entries, &mut tally, self.capacity);
        entry
    }

    /// Drop the oldest entries until the buffer fits its capacity
    pub fn evict_if_over_capacity(&self) -> usize {
        let mut entries = self.entries.write();
        Self::evict(&mut entries, &mut self.tally.lock(), self.capacity)
    }

    fn evict(
        entries: &mut VecDeque<ScrollbackEntry>,
        tally: &mut FieldTally,
        capacity: usize,
    ) -> usize {
        let excess = entries.len().saturating_sub(capacity);
        for evicted in entries.drain(..excess) {
            tally.remove(&evicted);
        }
        excess
    }

    /// Re-apply a rule set to every stored entry
    ///
    /// Verdicts are computed from a snapshot without holding the write lock,
    /// then applied under a short one. Returns how many entries changed their
    /// keep decision.
    pub fn reevaluate(&self, rules: Arc<RuleSet>) -> usize {
        let version = rules.version();

        {
            let mut current = self.rules.write();
            match current.as_ref() {
                Some(known) if known.version() > version => {
                    debug!(version, known = known.version(), "ignoring stale rule set");
                    return 0;
                }
                _ => *current = Some(Arc::clone(&rules)),
            }
        }

        let pending: Vec<_> = self
            .entries
            .read()
            .iter()
            .filter(|e| e.rules_version < version)
            .map(|e| (e.id, Arc::clone(&e.record)))
            .collect();

        let mut verdicts: HashMap<u64, _> = pending
            .into_iter()
            .map(|(id, record)| (id, evaluate(&record, &rules)))
            .collect();

        let mut changed = 0;
        let mut entries = self.entries.write();
        for entry in entries.iter_mut().filter(|e| e.rules_version < version) {
            let verdict = verdicts
                .remove(&entry.id)
                .unwrap_or_else(|| evaluate(&entry.record, &rules));
            if verdict.keep != entry.verdict.keep {
                changed += 1;
            }
            entry.verdict = verdict;
            entry.rules_version = version;
        }

        debug!(version, changed, total = entries.len(), "re-evaluated scrollback");
        changed
    }

    /// Get all entries (cloned), oldest first
    pub fn snapshot(&self) -> Vec<ScrollbackEntry> {
        self.entries.read().iter().cloned().collect()
    }

    /// Entries the current rules keep
    pub fn visible(&self) -> Vec<ScrollbackEntry> {
        self.entries
            .read()
            .iter()
            .filter(|e| e.is_kept())
            .cloned()
            .collect()
    }

    /// Get entry count per severity, kept entries only
    pub fn severity_counts(&self) -> SeverityCounts {
        let entries = self.entries.read();
        let mut counts = SeverityCounts::default();

        for entry in entries.iter().filter(|e| e.is_kept()) {
            match entry.record.severity {
                Severity::Trace => counts.trace += 1,
                Severity::Debug => counts.debug += 1,
                Severity::Info => counts.info += 1,
                Severity::Warn => counts.warn += 1,
                Severity::Error => counts.error += 1,
                Severity::Fatal => counts.fatal += 1,
                Severity::Unknown => counts.unknown += 1,
            }
        }

        counts
    }

    /// Total entry count, excluded entries included
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Export kept entries as raw lines
    pub fn export_raw(&self) -> String {
        self.entries
            .read()
            .iter()
            .filter(|e| e.is_kept())
            .map(|e| e.record.raw.text.as_str())
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// JSON fields whose value is the same in every stored JSON record
    ///
    /// Empty until at least two JSON records are stored. Excluded entries
    /// count too.
    pub fn shared_fields(&self) -> Map<String, Value> {
        self.tally.lock().shared()
    }

    /// Clear all entries. Ids keep increasing.
    pub fn clear(&self) {
        let mut entries = self.entries.write();
        entries.clear();
        *self.tally.lock() = FieldTally::default();
    }

    /// Get the last N entries
    pub fn tail(&self, n: usize) -> Vec<ScrollbackEntry> {
        let entries = self.entries.read();
        let start = entries.len().saturating_sub(n);
        entries.iter().skip(start).cloned().collect()
    }

    /// Get entries in a range (for paging)
    pub fn range(&self, start: usize, count: usize) -> Vec<ScrollbackEntry> {
        let entries = self.entries.read();
        entries.iter().skip(start).take(count).cloned().collect()
    }
}

impl Default for Scrollback {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

/// Per key, how many stored JSON records carry each distinct value
#[derive(Default)]
struct FieldTally {
    records: usize,
    /// key -> serialized value -> (value, count)
    values: HashMap<String, HashMap<String, (Value, usize)>>,
}

impl FieldTally {
    fn add(&mut self, entry: &ScrollbackEntry) {
        if !entry.record.is_json {
            return;
        }
        self.records += 1;
        for (key, value) in &entry.record.fields {
            let slot = self
                .values
                .entry(key.clone())
                .or_default()
                .entry(value.to_string())
                .or_insert_with(|| (value.clone(), 0));
            slot.1 += 1;
        }
    }

    fn remove(&mut self, entry: &ScrollbackEntry) {
        if !entry.record.is_json {
            return;
        }
        self.records = self.records.saturating_sub(1);
        for (key, value) in &entry.record.fields {
            let Some(values) = self.values.get_mut(key) else {
                continue;
            };
            let text = value.to_string();
            if let Some(slot) = values.get_mut(&text) {
                slot.1 = slot.1.saturating_sub(1);
                if slot.1 == 0 {
                    values.remove(&text);
                }
            }
            if values.is_empty() {
                self.values.remove(key);
            }
        }
    }

    fn shared(&self) -> Map<String, Value> {
        if self.records < 2 {
            return Map::new();
        }
        self.values
            .iter()
            .filter_map(|(key, values)| {
                let mut distinct = values.values();
                match (distinct.next(), distinct.next()) {
                    (Some((value, count)), None) if *count == self.records => {
                        Some((key.clone(), value.clone()))
                    }
                    _ => None,
                }
            })
            .collect()
    }
}

/// Counts per severity
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SeverityCounts {
    pub trace: usize,
    pub debug: usize,
    pub info: usize,
    pub warn: usize,
    pub error: usize,
    pub fatal: usize,
    pub unknown: usize,
}

impl SeverityCounts {
    pub fn total(&self) -> usize {
        self.trace + self.debug + self.info + self.warn + self.error + self.fatal + self.unknown
    }
}
