//! Line-oriented presentation of scrollback entries

use chrono::Local;
use serde_json::{Map, Value};

use loggoblin_logs::ScrollbackEntry;

const HIGHLIGHT_ON: &str = "\x1b[1;7m";
const HIGHLIGHT_OFF: &str = "\x1b[0m";

/// Formats entries as `HH:MM:SS.mmm <source> <SEV> <body>`
///
/// Late arrivals are prefixed with `~`, excluded entries (only shown on
/// request) with `-`.
#[derive(Clone, Debug, Default)]
pub struct Presenter {
    /// Print entries the rules exclude as well
    pub show_excluded: bool,

    /// Print the raw line instead of the normalized body
    pub raw: bool,

    /// Mark matched spans with ANSI escapes (raw mode only)
    pub highlight: bool,

    pub utc: bool,
}

impl Presenter {
    /// The output line for an entry, `None` if it is not shown
    pub fn format(&self, entry: &ScrollbackEntry) -> Option<String> {
        self.format_body(entry, &entry.record.body)
    }

    /// Like `format`, with `body` in place of the record's own body
    pub fn format_body(&self, entry: &ScrollbackEntry, body: &str) -> Option<String> {
        if !entry.is_kept() && !self.show_excluded {
            return None;
        }

        let record = &entry.record;
        let ts = record.timestamp();
        let time = if self.utc {
            ts.format("%H:%M:%S%.3f").to_string()
        } else {
            ts.with_timezone(&Local).format("%H:%M:%S%.3f").to_string()
        };

        let marker = if !entry.is_kept() {
            "-"
        } else if entry.late_arrival {
            "~"
        } else {
            ""
        };

        let text = if self.raw {
            if self.highlight {
                highlight(&record.raw.text, &entry.verdict.highlight_spans)
            } else {
                record.raw.text.clone()
            }
        } else {
            body.to_string()
        };

        Some(format!(
            "{marker}{time} {} {} {text}",
            record.source_tag(),
            record.severity.as_str()
        ))
    }
}

/// Announcement for a changed set of shared JSON fields
///
/// Returns `None` when the set is unchanged or empty.
pub fn shared_preamble(last: &mut Map<String, Value>, shared: Map<String, Value>) -> Option<String> {
    if *last == shared {
        return None;
    }
    *last = shared;
    if last.is_empty() {
        return None;
    }
    Some(format!("<SHARED> {}", Value::Object(last.clone())))
}

/// Wrap byte ranges of `text` in highlight escapes
///
/// Spans that do not fall on character boundaries are skipped.
fn highlight(text: &str, spans: &[(usize, usize)]) -> String {
    let mut out = String::with_capacity(text.len() + spans.len() * 12);
    let mut pos = 0;

    for &(start, end) in spans {
        if start < pos
            || end > text.len()
            || !text.is_char_boundary(start)
            || !text.is_char_boundary(end)
        {
            continue;
        }
        out.push_str(&text[pos..start]);
        out.push_str(HIGHLIGHT_ON);
        out.push_str(&text[start..end]);
        out.push_str(HIGHLIGHT_OFF);
        pos = end;
    }

    out.push_str(&text[pos..]);
    out
}
