use crate::models::ListingRecord;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use tracing::{debug, warn};

pub const FALLBACK_DESCRIPTION: &str = "Product details available upon request.";
pub const PARSE_FAILURE: &str = "Could not parse response as JSON";
pub const MISSING_BATCH_RESULT: &str = "Missing batch result";
pub const INVALID_BATCH_FORMAT: &str = "Invalid batch response format";
pub const UNPARSEABLE_BATCH: &str = "Could not parse batch response";
pub const INVALID_BATCH_ITEM: &str = "Invalid batch item";

const DESCRIPTION_KEY_ORDER: [&str; 14] = [
    "Artist",
    "Brand/Publisher",
    "Subject",
    "Theme",
    "Era",
    "Year Manufactured",
    "Time Period Manufactured",
    "Material",
    "Size",
    "Condition",
    "Postage Condition",
    "Features",
    "Country/Region of Manufacture",
    "Continent",
];

/// Top-level keys whose object values are left as objects.
const OBJECT_KEYS: [&str; 2] = ["storedFieldSelections", "aiResolvedFields"];
const UNRESOLVED_VALUES: [&str; 2] = ["Unknown", "Not Specified"];
const EMPTY_VALUE: &str = "N/A";

static TITLE_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"(?i)"title"\s*:\s*"([^"]*)""#).expect("title pattern"));
static DESCRIPTION_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?is)"description"\s*:\s*(?:"([^"]*)"|(\{[^}]*\}))"#).expect("description pattern")
});
static RESOLVED_FIELDS_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?is)"aiResolvedFields"\s*:\s*(\{[^}]*\})"#).expect("resolved fields pattern")
});

/// A salvage strategy: raw model text in, partial record out.
type Strategy = fn(&str, bool) -> Option<Value>;

const SINGLE_STRATEGIES: [(&str, Strategy); 3] = [
    ("embedded_json", embedded_object),
    ("key_patterns", key_patterns),
    ("labelled_lines", labelled_lines),
];

const BATCH_STRATEGIES: [(&str, Strategy); 3] = [
    ("embedded_json", embedded_array_or_object),
    ("key_patterns", key_patterns),
    ("labelled_lines", labelled_lines),
];

/// Removes a surrounding markdown fence and its language tag.
pub fn strip_code_fence(raw: &str) -> String {
    let trimmed = raw.trim();
    let Some(start) = trimmed.find("```") else {
        return trimmed.to_string();
    };
    let opened = &trimmed[start + 3..];
    let body = match opened.find('\n') {
        Some(newline) if is_language_tag(&opened[..newline]) => &opened[newline + 1..],
        _ => opened.strip_prefix("json").unwrap_or(opened),
    };
    let body = match body.find("```") {
        Some(end) => &body[..end],
        None => body,
    };
    if start > 0 && body.trim().is_empty() {
        return trimmed.to_string();
    }
    body.trim().to_string()
}

fn is_language_tag(line: &str) -> bool {
    let tag = line.trim();
    tag.chars().all(|c| c.is_ascii_alphanumeric())
}

/// Normalizes one model reply into a single listing record.
pub fn normalize_single(raw: &str, resolve_fields: bool) -> ListingRecord {
    let cleaned = strip_code_fence(raw);
    let strict = match serde_json::from_str::<Value>(&cleaned) {
        Ok(Value::Object(obj)) => Some(obj),
        Ok(Value::Array(items)) => items.into_iter().find_map(|item| match item {
            Value::Object(obj) => Some(obj),
            _ => None,
        }),
        _ => None,
    };

    let parsed = strict.or_else(|| match salvage(raw, resolve_fields, &SINGLE_STRATEGIES) {
        Some(Value::Object(obj)) => Some(obj),
        _ => None,
    });

    match parsed {
        Some(obj) => finish_record(obj, resolve_fields),
        None => {
            warn!(
                target = "listing.normalize",
                raw_len = raw.len(),
                "response_unparseable"
            );
            ListingRecord::unparsed(PARSE_FAILURE, raw)
        }
    }
}

/// Normalizes a combined reply into exactly `expected` records.
pub fn normalize_batch(raw: &str, expected: usize, resolve_fields: bool) -> Vec<ListingRecord> {
    let cleaned = strip_code_fence(raw);
    let parsed = match serde_json::from_str::<Value>(&cleaned) {
        Ok(value) => Some(value),
        Err(_) => salvage(raw, resolve_fields, &BATCH_STRATEGIES),
    };

    let records = match parsed {
        Some(Value::Array(items)) => items
            .into_iter()
            .map(|item| match item {
                Value::Object(obj) => finish_record(obj, resolve_fields),
                other => ListingRecord::unparsed(INVALID_BATCH_ITEM, &other.to_string()),
            })
            .collect(),
        Some(Value::Object(obj)) => vec![finish_record(obj, resolve_fields)],
        Some(_) => return vec![ListingRecord::unparsed(INVALID_BATCH_FORMAT, raw); expected],
        None => {
            warn!(
                target = "listing.normalize",
                expected,
                raw_len = raw.len(),
                "batch_response_unparseable"
            );
            return vec![ListingRecord::unparsed(UNPARSEABLE_BATCH, raw); expected];
        }
    };

    reconcile(records, expected, MISSING_BATCH_RESULT)
}

/// Pads with `filler` error records or truncates so exactly `expected` remain.
pub fn reconcile(mut records: Vec<ListingRecord>, expected: usize, filler: &str) -> Vec<ListingRecord> {
    if records.len() != expected {
        warn!(
            target = "listing.normalize",
            expected,
            received = records.len(),
            "batch_count_mismatch"
        );
    }
    records.truncate(expected);
    records.resize_with(expected, || ListingRecord::failure(filler));
    records
}

fn salvage(raw: &str, resolve_fields: bool, strategies: &[(&str, Strategy)]) -> Option<Value> {
    strategies.iter().find_map(|(name, strategy)| {
        let found = strategy(raw, resolve_fields)?;
        debug!(target = "listing.normalize", strategy = *name, "response_salvaged");
        Some(found)
    })
}

fn embedded_object(text: &str, _resolve_fields: bool) -> Option<Value> {
    embedded(text, '{', '}').filter(Value::is_object)
}

fn embedded_array_or_object(text: &str, resolve_fields: bool) -> Option<Value> {
    embedded(text, '[', ']')
        .filter(Value::is_array)
        .or_else(|| embedded_object(text, resolve_fields))
}

fn embedded(text: &str, open: char, close: char) -> Option<Value> {
    let start = text.find(open)?;
    let end = text.rfind(close)?;
    if end <= start {
        return None;
    }
    serde_json::from_str(&text[start..=end]).ok()
}

fn key_patterns(text: &str, resolve_fields: bool) -> Option<Value> {
    let title = TITLE_PATTERN.captures(text)?.get(1)?.as_str();
    let mut found = Map::new();
    found.insert("title".into(), Value::String(clean_salvaged(title)));

    if let Some(captures) = DESCRIPTION_PATTERN.captures(text) {
        let description = match (captures.get(1), captures.get(2)) {
            (Some(plain), _) => Some(Value::String(clean_salvaged(plain.as_str()))),
            (None, Some(object)) => Some(
                serde_json::from_str::<Value>(object.as_str())
                    .ok()
                    .filter(Value::is_object)
                    .unwrap_or_else(|| Value::String(clean_salvaged(object.as_str()))),
            ),
            _ => None,
        };
        if let Some(description) = description {
            found.insert("description".into(), description);
        }
    }

    if resolve_fields
        && let Some(captures) = RESOLVED_FIELDS_PATTERN.captures(text)
        && let Ok(fields @ Value::Object(_)) = serde_json::from_str::<Value>(&captures[1])
    {
        found.insert("aiResolvedFields".into(), fields);
    }

    Some(Value::Object(found))
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum LabelledField {
    Title,
    Description,
}

/// `Title:` / `Description:` prose. Unmarked lines go to the active field; once the
/// title has a value, further lines under it spill into the description.
fn labelled_lines(text: &str, _resolve_fields: bool) -> Option<Value> {
    let mut title: Option<String> = None;
    let mut description: Vec<&str> = Vec::new();
    let mut active: Option<LabelledField> = None;

    for line in text.lines().map(str::trim).filter(|line| !line.is_empty()) {
        if let Some(rest) = strip_label(line, "title:") {
            title = Some(rest.to_string());
            active = Some(LabelledField::Title);
        } else if let Some(rest) = strip_label(line, "description:") {
            if !rest.is_empty() {
                description.push(rest);
            }
            active = Some(LabelledField::Description);
        } else {
            match active {
                Some(LabelledField::Title) if title.as_deref().is_some_and(str::is_empty) => {
                    title = Some(line.to_string());
                }
                Some(LabelledField::Title) => {
                    description.push(line);
                    active = Some(LabelledField::Description);
                }
                Some(LabelledField::Description) => description.push(line),
                None => {}
            }
        }
    }

    let title = title.filter(|t| !t.is_empty())?;
    let mut found = Map::new();
    found.insert("title".into(), Value::String(clean_salvaged(&title)));
    if !description.is_empty() {
        found.insert(
            "description".into(),
            Value::String(clean_salvaged(&description.join("\n"))),
        );
    }
    Some(Value::Object(found))
}

fn strip_label<'a>(line: &'a str, label: &str) -> Option<&'a str> {
    let head = line.get(..label.len())?;
    head.eq_ignore_ascii_case(label)
        .then(|| line[label.len()..].trim())
}

fn clean_salvaged(value: &str) -> String {
    let unwrapped = value
        .strip_prefix('"')
        .and_then(|v| v.strip_suffix('"'))
        .unwrap_or(value);
    unwrapped.replace("\\\"", "\"").replace("\\n", "\n")
}

/// Post-processes a parsed object into the canonical record. Applying it to an
/// already finished record changes nothing.
pub fn finish_record(obj: Map<String, Value>, resolve_fields: bool) -> ListingRecord {
    let mut record = ListingRecord::default();

    for (key, value) in obj {
        match key.as_str() {
            "title" => record.title = Some(plain_text(value)),
            "description" => record.description = describe(value),
            "aiResolvedFields" => record.ai_resolved_fields = resolved_fields(value, resolve_fields),
            "error" => record.error = Some(plain_text(value)),
            "raw_content" => record.raw_content = Some(plain_text(value)),
            "last_error" => record.last_error = Some(plain_text(value)),
            _ => {
                let value = match value {
                    Value::Object(nested) if !OBJECT_KEYS.contains(&key.as_str()) => {
                        Value::String(Value::Object(nested).to_string())
                    }
                    other => other,
                };
                record.extra.insert(key, value);
            }
        }
    }

    if !record.is_error() {
        record.title.get_or_insert_with(String::new);
        record
            .description
            .get_or_insert_with(|| FALLBACK_DESCRIPTION.to_string());
    }
    record
}

fn describe(value: Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s),
        Value::Object(details) => Some(flatten_description(&details)),
        Value::Array(items) => Some(
            items
                .iter()
                .filter_map(meaningful_text)
                .collect::<Vec<_>>()
                .join(" "),
        ),
        other => Some(other.to_string()),
    }
}

/// Builds `"Key: value."` sentences, priority keys first, blanks and `N/A` skipped.
pub fn flatten_description(details: &Map<String, Value>) -> String {
    let prioritized = DESCRIPTION_KEY_ORDER
        .iter()
        .filter_map(|key| details.get(*key).map(|value| (*key, value)));
    let remaining = details
        .iter()
        .filter(|(key, _)| !DESCRIPTION_KEY_ORDER.contains(&key.as_str()))
        .map(|(key, value)| (key.as_str(), value));

    let parts: Vec<String> = prioritized
        .chain(remaining)
        .filter_map(|(key, value)| meaningful_text(value).map(|text| format!("{key}: {text}")))
        .collect();

    if parts.is_empty() {
        FALLBACK_DESCRIPTION.to_string()
    } else {
        format!("{}.", parts.join(". "))
    }
}

fn meaningful_text(value: &Value) -> Option<String> {
    match value {
        Value::Null | Value::Bool(false) => None,
        Value::String(s) => {
            let trimmed = s.trim();
            (!trimmed.is_empty() && trimmed != EMPTY_VALUE).then(|| trimmed.to_string())
        }
        Value::Array(items) if items.is_empty() => None,
        Value::Array(items) => {
            let joined: Vec<String> = items.iter().filter_map(meaningful_text).collect();
            (!joined.is_empty()).then(|| joined.join(", "))
        }
        Value::Object(map) if map.is_empty() => None,
        other => Some(other.to_string()),
    }
}

fn resolved_fields(value: Value, resolve_fields: bool) -> Option<BTreeMap<String, String>> {
    let Value::Object(fields) = value else {
        debug!(target = "listing.normalize", "resolved_fields_not_a_mapping");
        return None;
    };
    let cleaned = fields
        .into_iter()
        .filter_map(|(label, value)| {
            let text = match value {
                Value::Null => return None,
                Value::String(s) => s.trim().to_string(),
                other => other.to_string(),
            };
            if resolve_fields && (text.is_empty() || UNRESOLVED_VALUES.contains(&text.as_str())) {
                return None;
            }
            Some((label, text))
        })
        .collect();
    Some(cleaned)
}

fn plain_text(value: Value) -> String {
    match value {
        Value::String(s) => s,
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn renormalize(record: &ListingRecord, resolve_fields: bool) -> ListingRecord {
        match serde_json::to_value(record).unwrap() {
            Value::Object(obj) => finish_record(obj, resolve_fields),
            other => panic!("record serialized to {other}"),
        }
    }

    #[test]
    fn strips_fences_with_and_without_language_tag() {
        assert_eq!(strip_code_fence("```json\n{\"a\":1}\n```"), "{\"a\":1}");
        assert_eq!(strip_code_fence("```JSON\n{\"a\":1}\n```"), "{\"a\":1}");
        assert_eq!(strip_code_fence("```\n[1]\n```"), "[1]");
        assert_eq!(strip_code_fence("```json {\"a\":1}```"), "{\"a\":1}");
        assert_eq!(strip_code_fence("  {\"a\":1}  "), "{\"a\":1}");
        assert_eq!(
            strip_code_fence("Here it is:\n```json\n{\"a\":1}\n```\nEnjoy"),
            "{\"a\":1}"
        );
    }

    #[test]
    fn plain_json_passes_through() {
        let record = normalize_single(
            r#"{"title":"Hot Wheels Car","description":"Red toy car"}"#,
            false,
        );
        assert_eq!(record.title.as_deref(), Some("Hot Wheels Car"));
        assert_eq!(record.description.as_deref(), Some("Red toy car"));
        assert!(!record.is_error());
    }

    #[test]
    fn fenced_description_object_is_flattened() {
        let raw = "```json\n{\"title\":\"X\",\"description\":{\"Material\":\"Metal\",\"Color\":\"N/A\"}}\n```";
        let record = normalize_single(raw, false);
        assert_eq!(record.title.as_deref(), Some("X"));
        assert_eq!(record.description.as_deref(), Some("Material: Metal."));
    }

    #[test]
    fn flattening_follows_priority_then_source_order() {
        let details = json!({
            "Color": "Red",
            "Condition": "Used",
            "Notes": "",
            "Artist": "Jane Doe",
            "Extra": "Boxed",
            "Era": "N/A",
            "Year Manufactured": 1972
        });
        let flattened = flatten_description(details.as_object().unwrap());
        assert_eq!(
            flattened,
            "Artist: Jane Doe. Year Manufactured: 1972. Condition: Used. Color: Red. Extra: Boxed."
        );
        assert_eq!(flattened.matches("Jane Doe").count(), 1);
    }

    #[test]
    fn empty_description_object_gets_fallback_sentence() {
        let details = json!({"Material": "N/A", "Size": ""});
        assert_eq!(
            flatten_description(details.as_object().unwrap()),
            FALLBACK_DESCRIPTION
        );
    }

    #[test]
    fn normalization_is_idempotent() {
        let raw = json!({
            "title": 42,
            "description": {"Brand/Publisher": "Mattel", "Size": "1:64"},
            "aiResolvedFields": {"Scale": " 1:64 ", "Era": "Unknown", "Color": ""},
            "storedFieldSelections": {"Brand": "Mattel"},
            "specs": {"wheels": 4}
        })
        .to_string();
        let first = normalize_single(&raw, true);
        assert_eq!(first.title.as_deref(), Some("42"));
        assert_eq!(
            first.description.as_deref(),
            Some("Brand/Publisher: Mattel. Size: 1:64.")
        );
        assert_eq!(
            first.ai_resolved_fields,
            Some(BTreeMap::from([("Scale".to_string(), "1:64".to_string())]))
        );
        assert_eq!(first.extra["storedFieldSelections"], json!({"Brand": "Mattel"}));
        assert_eq!(first.extra["specs"], json!("{\"wheels\":4}"));

        assert_eq!(renormalize(&first, true), first);
    }

    #[test]
    fn resolved_fields_that_are_not_a_mapping_are_dropped() {
        let record = normalize_single(
            r#"{"title":"T","description":"D","aiResolvedFields":"Scale: 1:64"}"#,
            true,
        );
        assert!(record.ai_resolved_fields.is_none());
    }

    #[test]
    fn resolved_fields_are_kept_verbatim_when_resolution_is_off() {
        let record = normalize_single(
            r#"{"title":"T","description":"D","aiResolvedFields":{"Era":"Unknown"}}"#,
            false,
        );
        assert_eq!(
            record.ai_resolved_fields,
            Some(BTreeMap::from([("Era".to_string(), "Unknown".to_string())]))
        );
    }

    #[test]
    fn embedded_json_is_found_inside_prose() {
        let raw = "Sure! Here is the listing: {\"title\": \"Brass Lamp\", \"description\": \"Lovely\"} Hope it helps.";
        let record = normalize_single(raw, false);
        assert_eq!(record.title.as_deref(), Some("Brass Lamp"));
        assert_eq!(record.description.as_deref(), Some("Lovely"));
    }

    #[test]
    fn key_patterns_recover_truncated_json() {
        let raw = r#"{"title": "Tin Robot", "description": {"Material": "Tin", "Era": "1960s"}, "aiResolvedFields": {"Era": "1960s"}, "notes": "cut off here"#;
        let record = normalize_single(raw, true);
        assert_eq!(record.title.as_deref(), Some("Tin Robot"));
        assert_eq!(record.description.as_deref(), Some("Era: 1960s. Material: Tin."));
        assert_eq!(
            record.ai_resolved_fields,
            Some(BTreeMap::from([("Era".to_string(), "1960s".to_string())]))
        );
    }

    #[test]
    fn labelled_lines_are_parsed_from_free_text() {
        let raw = "Here is my answer.\nTitle: Vintage Lamp\nBrass base with original shade.\nWorks perfectly.";
        let record = normalize_single(raw, false);
        assert_eq!(record.title.as_deref(), Some("Vintage Lamp"));
        assert_eq!(
            record.description.as_deref(),
            Some("Brass base with original shade.\nWorks perfectly.")
        );
    }

    #[test]
    fn labelled_lines_accept_markers_on_their_own_line() {
        let raw = "Title:\nVintage Lamp\n\nDescription:\nBrass base with original shade.\nWorks perfectly.";
        let record = normalize_single(raw, false);
        assert!(!record.is_error());
        assert_eq!(record.title.as_deref(), Some("Vintage Lamp"));
        assert_eq!(
            record.description.as_deref(),
            Some("Brass base with original shade.\nWorks perfectly.")
        );
    }

    #[test]
    fn description_before_title_is_kept() {
        let raw = "Description: Brass base with original shade.\nTitle: Vintage Lamp";
        let record = normalize_single(raw, false);
        assert_eq!(record.title.as_deref(), Some("Vintage Lamp"));
        assert_eq!(
            record.description.as_deref(),
            Some("Brass base with original shade.")
        );
    }

    #[test]
    fn labelled_lines_honour_description_marker() {
        let raw = "TITLE: \"Vintage Lamp\"\n\nDescription: Brass base.\nFully rewired.";
        let record = normalize_single(raw, false);
        assert_eq!(record.title.as_deref(), Some("Vintage Lamp"));
        assert_eq!(record.description.as_deref(), Some("Brass base.\nFully rewired."));
    }

    #[test]
    fn unrecoverable_text_becomes_error_record() {
        let raw = "I'm sorry, I can't help with that.";
        let record = normalize_single(raw, false);
        assert_eq!(record.error.as_deref(), Some(PARSE_FAILURE));
        assert_eq!(record.raw_content.as_deref(), Some(raw));
        assert!(record.title.is_none());
    }

    #[test]
    fn batch_pads_short_arrays() {
        let raw = r#"[{"title":"A","description":"a"},{"title":"B","description":"b"}]"#;
        let records = normalize_batch(raw, 3, false);
        assert_eq!(records.len(), 3);
        assert_eq!(records[0].title.as_deref(), Some("A"));
        assert_eq!(records[1].title.as_deref(), Some("B"));
        assert_eq!(records[2].error.as_deref(), Some(MISSING_BATCH_RESULT));
    }

    #[test]
    fn batch_truncates_long_arrays() {
        let raw = r#"[{"title":"A"},{"title":"B"},{"title":"C"}]"#;
        let records = normalize_batch(raw, 2, false);
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].title.as_deref(), Some("B"));
        assert_eq!(records[1].description.as_deref(), Some(FALLBACK_DESCRIPTION));
    }

    #[test]
    fn batch_wraps_single_object_and_flags_bad_items() {
        let records = normalize_batch(r#"{"title":"Only"}"#, 2, false);
        assert_eq!(records[0].title.as_deref(), Some("Only"));
        assert_eq!(records[1].error.as_deref(), Some(MISSING_BATCH_RESULT));

        let records = normalize_batch(r#"["nope", {"title":"Ok"}]"#, 2, false);
        assert_eq!(records[0].error.as_deref(), Some(INVALID_BATCH_ITEM));
        assert_eq!(records[0].raw_content.as_deref(), Some("\"nope\""));
        assert_eq!(records[1].title.as_deref(), Some("Ok"));
    }

    #[test]
    fn batch_failures_cover_every_slot() {
        let records = normalize_batch("42", 2, false);
        assert!(records
            .iter()
            .all(|r| r.error.as_deref() == Some(INVALID_BATCH_FORMAT)));

        let records = normalize_batch("no structure at all", 3, false);
        assert_eq!(records.len(), 3);
        assert!(records
            .iter()
            .all(|r| r.error.as_deref() == Some(UNPARSEABLE_BATCH)));
    }

    #[test]
    fn batch_salvages_array_from_prose() {
        let raw = "Results:\n```\n[{\"title\":\"A\"},{\"title\":\"B\"}]\n``` done";
        let records = normalize_batch(raw, 2, false);
        assert_eq!(records[0].title.as_deref(), Some("A"));
        assert_eq!(records[1].title.as_deref(), Some("B"));
    }
}
