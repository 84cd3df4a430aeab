use std::collections::BTreeSet;

use chrono::{DateTime, Datelike, FixedOffset, NaiveDateTime, NaiveTime, TimeZone, Utc};
use regex::Regex;
use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::debug;

use loggoblin_types::{RawLine, Record, Severity};

use crate::error::{ParseAnomaly, PatternError};

/// A user-supplied timestamp pattern (`[[normalizer.timestamps]]`)
///
/// `pattern` locates the timestamp (named group `ts`, else group 1, else the
/// whole match); `format` is a chrono format string. Formats without a date
/// are combined with the arrival date.
#[derive(Clone, Debug, Deserialize)]
pub struct TimestampPatternConfig {
    pub pattern: String,
    pub format: String,
}

/// A user-supplied severity pattern (`[[normalizer.severities]]`)
#[derive(Clone, Debug, Deserialize)]
pub struct SeverityPatternConfig {
    pub pattern: String,
    pub level: String,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct NormalizerConfig {
    pub timestamps: Vec<TimestampPatternConfig>,
    pub severities: Vec<SeverityPatternConfig>,
    /// JSON keys hoisted to the front of the body
    pub zoom: Vec<String>,
}

struct TimestampPattern {
    regex: Regex,
    format: String,
}

struct SeverityPattern {
    regex: Regex,
    severity: Severity,
}

/// Turns raw lines into records
///
/// Stateless apart from its compiled patterns, so one instance is shared by
/// every source task.
pub struct Normalizer {
    timestamps: Vec<TimestampPattern>,
    severities: Vec<SeverityPattern>,
    zoom: Vec<String>,
    iso: Regex,
    syslog: Regex,
    time_of_day: Regex,
    request_id: Regex,
}

/// Field names carrying the severity in JSON logs
const LEVEL_FIELDS: [&str; 9] = [
    "level",
    "lvl",
    "severity",
    "log.level",
    "loglevel",
    "log_level",
    "logLevel",
    "Level",
    "LEVEL",
];

/// Field names carrying the timestamp in JSON logs
const TIME_FIELDS: [&str; 5] = ["timestamp", "time", "ts", "@timestamp", "t"];

/// Field names carrying the human readable message in JSON logs
const MESSAGE_FIELDS: [&str; 5] = ["message", "msg", "log", "text", "body"];

/// Zoom keys tried, in order, when none are configured
const GUESSED_ZOOM: [&str; 7] = [
    "level",
    "logLevel",
    "log_level",
    "message",
    "scope",
    "text",
    "exception",
];

impl Normalizer {
    /// Normalizer with only the built-in patterns
    pub fn new() -> Self {
        Self {
            timestamps: Vec::new(),
            severities: Vec::new(),
            zoom: Vec::new(),
            iso: builtin(
                r"^(\d{4}-\d{2}-\d{2}[T ]\d{2}:\d{2}:\d{2}(?:[.,]\d+)?)(Z|[+-]\d{2}:?\d{2})?",
            ),
            syslog: builtin(r"^([A-Z][a-z]{2} +\d{1,2} \d{2}:\d{2}:\d{2})"),
            time_of_day: builtin(r"^(\d{1,2}:\d{2}(?::\d{2}(?:[.,]\d+)?)?)(?:\s+|$)"),
            request_id: builtin(
                r"^([0-9a-fA-F]{8}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{12})(?:\s+|$)",
            ),
        }
    }

    /// Normalizer with configured patterns tried before the built-ins
    pub fn with_config(config: &NormalizerConfig) -> Result<Self, PatternError> {
        let mut normalizer = Self::new();

        for ts in &config.timestamps {
            let regex = Regex::new(&ts.pattern).map_err(|source| PatternError::Timestamp {
                pattern: ts.pattern.clone(),
                source,
            })?;
            normalizer.timestamps.push(TimestampPattern {
                regex,
                format: ts.format.clone(),
            });
        }

        for sev in &config.severities {
            let regex = Regex::new(&sev.pattern).map_err(|source| PatternError::Severity {
                pattern: sev.pattern.clone(),
                source,
            })?;
            let severity = Severity::from_keyword(&sev.level)
                .ok_or_else(|| PatternError::UnknownSeverity(sev.level.clone()))?;
            normalizer.severities.push(SeverityPattern { regex, severity });
        }

        normalizer.zoom = config.zoom.clone();
        Ok(normalizer)
    }

    /// Parse a raw line into a record. Never fails.
    pub fn normalize(&self, raw: RawLine) -> Record {
        let arrival = raw.arrival_time;
        let mut tags = BTreeSet::new();
        tags.insert(raw.source_tag.to_string());

        let (mut parsed_timestamp, mut content) = self.extract_timestamp(&raw.text, arrival);

        if let Some(caps) = self.request_id.captures(content) {
            tags.insert(format!("request:{}", &caps[1]));
            content = &content[caps.get(0).map_or(0, |m| m.end())..];
        }

        let mut is_json = false;
        let mut fields = Map::new();
        let (severity, body) = match self.try_parse_json(content) {
            Some(json) => {
                is_json = true;
                tags.insert("json".to_string());
                tags.extend(json.tags);
                if parsed_timestamp.is_none() {
                    parsed_timestamp = json.timestamp;
                }
                fields = json.fields;
                (json.severity, json.body)
            }
            None => {
                let (severity, rest) = self.extract_severity(content);
                (severity, rest.trim().to_string())
            }
        };

        if parsed_timestamp.is_none() && severity == Severity::Unknown && !is_json {
            debug!(
                source = %raw.source_id,
                sequence = raw.sequence,
                anomaly = %ParseAnomaly::Unstructured,
                "passing line through unstructured"
            );
        }

        Record {
            source_id: raw.source_id,
            sequence: raw.sequence,
            arrival_time: arrival,
            parsed_timestamp,
            severity,
            tags,
            body,
            is_json,
            fields,
            raw,
        }
    }

    /// Find a timestamp at the start of the line, returning the remainder
    fn extract_timestamp<'a>(
        &self,
        text: &'a str,
        arrival: DateTime<Utc>,
    ) -> (Option<DateTime<Utc>>, &'a str) {
        for pattern in &self.timestamps {
            let Some(caps) = pattern.regex.captures(text) else {
                continue;
            };
            let Some(whole) = caps.get(0) else { continue };
            let found = caps.name("ts").or_else(|| caps.get(1)).unwrap_or(whole);
            if let Some(ts) = parse_with_format(found.as_str(), &pattern.format, arrival) {
                let rest = if whole.start() == 0 {
                    text[whole.end()..].trim_start()
                } else {
                    text
                };
                return (Some(ts), rest);
            }
        }

        if let Some(caps) = self.iso.captures(text) {
            let zone = caps.get(2).map(|m| m.as_str());
            if let Some(ts) = parse_iso(&caps[1], zone) {
                let end = caps.get(0).map_or(0, |m| m.end());
                return (Some(ts), text[end..].trim_start());
            }
        }

        if let Some(caps) = self.syslog.captures(text) {
            let collapsed = caps[1].split_whitespace().collect::<Vec<_>>().join(" ");
            let with_year = format!("{} {}", arrival.year(), collapsed);
            if let Ok(naive) = NaiveDateTime::parse_from_str(&with_year, "%Y %b %d %H:%M:%S") {
                let end = caps.get(0).map_or(0, |m| m.end());
                return (Some(Utc.from_utc_datetime(&naive)), text[end..].trim_start());
            }
        }

        if let Some(caps) = self.time_of_day.captures(text) {
            if let Some(ts) = parse_time_of_day(&caps[1], arrival) {
                let end = caps.get(0).map_or(0, |m| m.end());
                return (Some(ts), &text[end..]);
            }
        }

        (None, text)
    }

    /// Try to parse content as a JSON object
    fn try_parse_json(&self, content: &str) -> Option<JsonLine> {
        let trimmed = content.trim();
        if !trimmed.starts_with('{') {
            return None;
        }

        let map = match serde_json::from_str::<Value>(trimmed) {
            Ok(Value::Object(map)) => map,
            _ => {
                debug!(anomaly = %ParseAnomaly::MalformedJson, "treating line as plain text");
                return None;
            }
        };

        let severity = severity_from_json(&map);
        let timestamp = timestamp_from_json(&map);

        let mut tags = Vec::new();
        for key in ["scope", "logger"] {
            if let Some(Value::String(s)) = map.get(key) {
                tags.push(format!("scope:{s}"));
            }
        }

        let body = self.json_body(&map, &Map::new());

        Some(JsonLine {
            severity,
            timestamp,
            body,
            tags,
            fields: map,
        })
    }

    /// Render the body of a JSON record
    ///
    /// Keys in `shared` are left out. The configured zoom keys are hoisted
    /// to the front; without any, the keys of `GUESSED_ZOOM` present in the
    /// record are used. A record with none of them shows its message field.
    pub fn json_body(&self, fields: &Map<String, Value>, shared: &Map<String, Value>) -> String {
        let zoom: Vec<String> = if self.zoom.is_empty() {
            GUESSED_ZOOM
                .iter()
                .filter(|key| fields.contains_key(**key))
                .map(|key| key.to_string())
                .collect()
        } else {
            self.zoom.clone()
        };

        let rest: Map<String, Value> = fields
            .iter()
            .filter(|(key, _)| !shared.contains_key(*key))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();

        if !zoom.is_empty() {
            return zoom_body(rest, &zoom);
        }

        MESSAGE_FIELDS
            .iter()
            .find_map(|key| match rest.get(*key) {
                Some(Value::String(s)) => Some(s.clone()),
                _ => None,
            })
            .unwrap_or_else(|| Value::Object(rest).to_string())
    }

    /// Detect severity in plain text, returning the body after a leading
    /// severity token
    fn extract_severity<'a>(&self, content: &'a str) -> (Severity, &'a str) {
        for pattern in &self.severities {
            if pattern.regex.is_match(content) {
                return (pattern.severity, content);
            }
        }

        let trimmed = content.trim_start();
        let token_end = trimmed.find(char::is_whitespace).unwrap_or(trimmed.len());
        let token = trimmed[..token_end].trim_matches(|c: char| "[]():|<>".contains(c));
        if let Some(severity) = Severity::from_keyword(token) {
            if severity != Severity::Unknown {
                return (severity, &trimmed[token_end..]);
            }
        }

        (severity_from_text(content), content)
    }
}

impl Default for Normalizer {
    fn default() -> Self {
        Self::new()
    }
}

struct JsonLine {
    severity: Severity,
    timestamp: Option<DateTime<Utc>>,
    body: String,
    tags: Vec<String>,
    fields: Map<String, Value>,
}

fn builtin(pattern: &str) -> Regex {
    // Built-in patterns are literals
    Regex::new(pattern).expect("built-in pattern must compile")
}

/// Hoist zoom keys to the front, tab separated, followed by what is left
fn zoom_body(mut map: Map<String, Value>, zoom: &[String]) -> String {
    let mut parts = Vec::new();
    for key in zoom {
        match map.remove(key) {
            Some(Value::String(s)) => parts.push(s),
            Some(Value::Null) | None => {}
            Some(other) => parts.push(other.to_string()),
        }
    }
    if !map.is_empty() {
        parts.push(Value::Object(map).to_string());
    }
    parts.join("\t")
}

/// Extract log level from JSON fields
fn severity_from_json(fields: &Map<String, Value>) -> Severity {
    for field in LEVEL_FIELDS {
        match fields.get(field) {
            Some(Value::String(s)) => return Severity::parse(s),
            // bunyan / pino numeric levels
            Some(Value::Number(n)) => {
                if let Some(num) = n.as_u64() {
                    return match num {
                        0..=10 => Severity::Trace,
                        11..=20 => Severity::Debug,
                        21..=30 => Severity::Info,
                        31..=40 => Severity::Warn,
                        41..=50 => Severity::Error,
                        _ => Severity::Fatal,
                    };
                }
            }
            _ => {}
        }
    }
    Severity::Unknown
}

fn timestamp_from_json(fields: &Map<String, Value>) -> Option<DateTime<Utc>> {
    for field in TIME_FIELDS {
        match fields.get(field) {
            Some(Value::String(s)) => {
                if let Ok(ts) = DateTime::parse_from_rfc3339(s) {
                    return Some(ts.with_timezone(&Utc));
                }
            }
            Some(Value::Number(n)) => {
                let Some(num) = n.as_i64() else { continue };
                // Anything this large is epoch milliseconds
                let ts = if num > 100_000_000_000 {
                    Utc.timestamp_millis_opt(num).single()
                } else {
                    Utc.timestamp_opt(num, 0).single()
                };
                if ts.is_some() {
                    return ts;
                }
            }
            _ => {}
        }
    }
    None
}

/// Extract log level from keywords anywhere in the line
fn severity_from_text(content: &str) -> Severity {
    let upper = content.to_uppercase();

    // Check for bracketed patterns first [ERROR], [WARN], etc.
    let bracket_patterns = [
        ("[FATAL]", Severity::Fatal),
        ("[PANIC]", Severity::Fatal),
        ("[CRITICAL]", Severity::Fatal),
        ("[ERROR]", Severity::Error),
        ("[ERR]", Severity::Error),
        ("[WARN]", Severity::Warn),
        ("[WARNING]", Severity::Warn),
        ("[INFO]", Severity::Info),
        ("[DEBUG]", Severity::Debug),
        ("[TRACE]", Severity::Trace),
    ];

    for (pattern, level) in bracket_patterns {
        if upper.contains(pattern) {
            return level;
        }
    }

    let colon_patterns = [
        ("FATAL:", Severity::Fatal),
        ("PANIC:", Severity::Fatal),
        ("ERROR:", Severity::Error),
        ("WARNING:", Severity::Warn),
        ("WARN:", Severity::Warn),
        ("INFO:", Severity::Info),
        ("DEBUG:", Severity::Debug),
        ("TRACE:", Severity::Trace),
    ];

    for (pattern, level) in colon_patterns {
        if upper.contains(pattern) {
            return level;
        }
    }

    let spaced_patterns = [
        (" FATAL ", Severity::Fatal),
        (" PANIC ", Severity::Fatal),
        (" ERROR ", Severity::Error),
        (" WARN ", Severity::Warn),
        (" WARNING ", Severity::Warn),
        (" INFO ", Severity::Info),
        (" DEBUG ", Severity::Debug),
        (" TRACE ", Severity::Trace),
    ];

    for (pattern, level) in spaced_patterns {
        if upper.contains(pattern) {
            return level;
        }
    }

    Severity::Unknown
}

fn parse_iso(date_time: &str, zone: Option<&str>) -> Option<DateTime<Utc>> {
    let normalized = date_time.replacen(' ', "T", 1).replace(',', ".");
    let naive = NaiveDateTime::parse_from_str(&normalized, "%Y-%m-%dT%H:%M:%S%.f").ok()?;
    match zone {
        None | Some("Z") => Some(Utc.from_utc_datetime(&naive)),
        Some(z) => {
            let offset = parse_offset(z)?;
            offset
                .from_local_datetime(&naive)
                .single()
                .map(|dt| dt.with_timezone(&Utc))
        }
    }
}

/// `+hh:mm` or `+hhmm`
fn parse_offset(zone: &str) -> Option<FixedOffset> {
    let sign = if zone.starts_with('-') { -1 } else { 1 };
    let digits: String = zone.chars().filter(|c| c.is_ascii_digit()).collect();
    if digits.len() != 4 {
        return None;
    }
    let hours: i32 = digits[..2].parse().ok()?;
    let minutes: i32 = digits[2..].parse().ok()?;
    FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60))
}

fn parse_time_of_day(s: &str, arrival: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let s = s.replace(',', ".");
    let time = NaiveTime::parse_from_str(&s, "%H:%M:%S%.f")
        .or_else(|_| NaiveTime::parse_from_str(&s, "%H:%M"))
        .ok()?;
    Some(Utc.from_utc_datetime(&arrival.date_naive().and_time(time)))
}

fn parse_with_format(s: &str, format: &str, arrival: DateTime<Utc>) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_str(s, format) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(s, format) {
        return Some(Utc.from_utc_datetime(&naive));
    }
    NaiveTime::parse_from_str(s, format)
        .ok()
        .map(|time| Utc.from_utc_datetime(&arrival.date_naive().and_time(time)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use loggoblin_types::SourceId;
    use std::sync::Arc;

    fn raw(text: &str) -> RawLine {
        RawLine {
            source_id: SourceId::next(),
            source_tag: Arc::from("test-source"),
            sequence: 1,
            byte_offset: 0,
            text: text.to_string(),
            arrival_time: Utc.with_ymd_and_hms(2024, 1, 15, 23, 59, 0).unwrap(),
        }
    }

    #[test]
    fn test_parse_rfc3339_timestamp() {
        let record = Normalizer::new().normalize(raw("2024-01-15T10:30:00.123456789Z some log message"));
        let expected = Utc.with_ymd_and_hms(2024, 1, 15, 10, 30, 0).unwrap();
        let ts = record.parsed_timestamp.unwrap();
        assert_eq!(ts.timestamp(), expected.timestamp());
        assert_eq!(record.body, "some log message");
    }

    #[test]
    fn test_parse_offset_timestamp() {
        let record = Normalizer::new().normalize(raw("2024-01-15 12:30:00,500+0200 INFO started"));
        let expected = Utc.with_ymd_and_hms(2024, 1, 15, 10, 30, 0).unwrap();
        assert_eq!(record.parsed_timestamp.unwrap().timestamp(), expected.timestamp());
        assert_eq!(record.severity, Severity::Info);
        assert_eq!(record.body, "started");
    }

    #[test]
    fn test_time_of_day_uses_arrival_date() {
        let record = Normalizer::new().normalize(raw("10:00 INFO hello"));
        assert_eq!(
            record.parsed_timestamp,
            Some(Utc.with_ymd_and_hms(2024, 1, 15, 10, 0, 0).unwrap())
        );
        assert_eq!(record.severity, Severity::Info);
        assert_eq!(record.body, "hello");
        assert!(record.has_tag("test-source"));
    }

    #[test]
    fn test_syslog_timestamp() {
        let record = Normalizer::new().normalize(raw("Jan  5 08:15:01 host sshd[42]: error: bad key"));
        assert_eq!(
            record.parsed_timestamp,
            Some(Utc.with_ymd_and_hms(2024, 1, 5, 8, 15, 1).unwrap())
        );
        assert_eq!(record.severity, Severity::Error);
    }

    #[test]
    fn test_parse_json_log() {
        let line = r#"{"level":"error","msg":"something failed","time":"2024-01-15T10:00:00Z"}"#;
        let record = Normalizer::new().normalize(raw(line));
        assert!(record.is_json);
        assert!(record.has_tag("json"));
        assert_eq!(record.severity, Severity::Error);
        // `level` is a guessed zoom key
        assert_eq!(
            record.body,
            "error\t{\"msg\":\"something failed\",\"time\":\"2024-01-15T10:00:00Z\"}"
        );
        assert_eq!(record.fields.len(), 3);
        assert_eq!(
            record.parsed_timestamp,
            Some(Utc.with_ymd_and_hms(2024, 1, 15, 10, 0, 0).unwrap())
        );
    }

    #[test]
    fn test_guessed_zoom_keeps_key_order() {
        let line = r#"{"exception":"Timeout","tenant":"acme","message":"call failed","logLevel":"ERROR"}"#;
        let record = Normalizer::new().normalize(raw(line));
        assert_eq!(record.severity, Severity::Error);
        assert_eq!(record.body, "ERROR\tcall failed\tTimeout\t{\"tenant\":\"acme\"}");
    }

    #[test]
    fn test_message_field_without_zoom_keys() {
        let record = Normalizer::new().normalize(raw(r#"{"msg":"ready","port":8080}"#));
        assert_eq!(record.body, "ready");

        let record = Normalizer::new().normalize(raw(r#"{"port":8080}"#));
        assert_eq!(record.body, "{\"port\":8080}");
    }

    #[test]
    fn test_json_body_leaves_out_shared_fields() {
        let normalizer = Normalizer::new();
        let record = normalizer.normalize(raw(
            r#"{"level":"info","message":"saved","service":"billing","user":7}"#,
        ));

        let mut shared = Map::new();
        shared.insert("service".to_string(), Value::from("billing"));
        shared.insert("level".to_string(), Value::from("info"));
        assert_eq!(
            normalizer.json_body(&record.fields, &shared),
            "saved\t{\"user\":7}"
        );
        assert_eq!(
            normalizer.json_body(&record.fields, &Map::new()),
            record.body
        );
    }

    #[test]
    fn test_json_numeric_level_and_epoch_millis() {
        let line = r#"{"level":50,"time":1705312800000,"msg":"db down"}"#;
        let record = Normalizer::new().normalize(raw(line));
        assert_eq!(record.severity, Severity::Error);
        assert_eq!(
            record.parsed_timestamp,
            Some(Utc.with_ymd_and_hms(2024, 1, 15, 10, 0, 0).unwrap())
        );
    }

    #[test]
    fn test_malformed_json_passes_through() {
        let record = Normalizer::new().normalize(raw("{not json at all"));
        assert!(!record.is_json);
        assert_eq!(record.severity, Severity::Unknown);
        assert_eq!(record.parsed_timestamp, None);
        assert_eq!(record.body, "{not json at all");
    }

    #[test]
    fn test_parse_text_level() {
        let record = Normalizer::new().normalize(raw("[ERROR] something went wrong"));
        assert_eq!(record.severity, Severity::Error);
        assert_eq!(record.body, "something went wrong");

        let record = Normalizer::new().normalize(raw("worker 3: WARNING: queue is full"));
        assert_eq!(record.severity, Severity::Warn);
    }

    #[test]
    fn test_unstructured_line() {
        let record = Normalizer::new().normalize(raw("just some words"));
        assert_eq!(record.severity, Severity::Unknown);
        assert_eq!(record.parsed_timestamp, None);
        assert_eq!(record.timestamp(), record.arrival_time);
        assert_eq!(record.body, "just some words");
    }

    #[test]
    fn test_request_id_is_stripped_and_tagged() {
        let line = "2024-01-15T10:30:00.123Z\tc9a1b2c3-1234-5678-9abc-def012345678\tERROR\tboom";
        let record = Normalizer::new().normalize(raw(line));
        assert!(record.has_tag("request:c9a1b2c3-1234-5678-9abc-def012345678"));
        assert_eq!(record.severity, Severity::Error);
        assert_eq!(record.body, "boom");
    }

    #[test]
    fn test_zoom_keys_hoisted() {
        let config = NormalizerConfig {
            zoom: vec!["level".into(), "message".into()],
            ..Default::default()
        };
        let normalizer = Normalizer::with_config(&config).unwrap();
        let record =
            normalizer.normalize(raw(r#"{"level":"warn","message":"slow","tenant":"acme"}"#));
        assert_eq!(record.severity, Severity::Warn);
        assert_eq!(record.body, "warn\tslow\t{\"tenant\":\"acme\"}");
    }

    #[test]
    fn test_configured_patterns() {
        let config = NormalizerConfig {
            timestamps: vec![TimestampPatternConfig {
                pattern: r"^\[(?P<ts>[^\]]+)\]".into(),
                format: "%d/%b/%Y:%H:%M:%S %z".into(),
            }],
            severities: vec![SeverityPatternConfig {
                pattern: r"\bE\d{4}\b".into(),
                level: "error".into(),
            }],
            zoom: Vec::new(),
        };
        let normalizer = Normalizer::with_config(&config).unwrap();
        let record = normalizer.normalize(raw("[15/Jan/2024:10:30:00 +0000] E1234 disk full"));
        assert_eq!(
            record.parsed_timestamp,
            Some(Utc.with_ymd_and_hms(2024, 1, 15, 10, 30, 0).unwrap())
        );
        assert_eq!(record.severity, Severity::Error);
        assert_eq!(record.body, "E1234 disk full");
    }

    #[test]
    fn test_invalid_configured_pattern() {
        let config = NormalizerConfig {
            severities: vec![SeverityPatternConfig {
                pattern: "ok".into(),
                level: "loud".into(),
            }],
            ..Default::default()
        };
        assert!(matches!(
            Normalizer::with_config(&config),
            Err(PatternError::UnknownSeverity(_))
        ));
    }

    #[test]
    fn test_parse_multibyte_utf8_no_panic() {
        let record = Normalizer::new().normalize(raw("─────────────────────────────────────────"));
        assert!(record.parsed_timestamp.is_none());

        let record = Normalizer::new().normalize(raw("2024-01-15T10:30:00Z ╭────────────────╮"));
        assert!(record.parsed_timestamp.is_some());
    }
}
