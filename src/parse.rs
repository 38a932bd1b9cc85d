// src/parse.rs
//! Defect-tolerant extraction of one structured object from free-form
//! generative output. Every completion in the system is routed through
//! here, so this function never raises: the worst case is the supplied
//! defaults, tagged as such.

use once_cell::sync::OnceCell;
use regex::Regex;
use serde_json::{Map, Value};
use tracing::debug;

/// Tagged parse result. `Parsed` means a balanced JSON region was found and
/// structurally parsed (defaults filled any missing fields); `Defaulted`
/// means the raw text was unusable and the caller's defaults were returned
/// unchanged.
#[derive(Debug, Clone, PartialEq)]
pub enum StructuredResponse {
    Parsed(Map<String, Value>),
    Defaulted(Map<String, Value>),
}

impl StructuredResponse {
    pub fn fields(&self) -> &Map<String, Value> {
        match self {
            StructuredResponse::Parsed(m) | StructuredResponse::Defaulted(m) => m,
        }
    }

    pub fn was_parsed(&self) -> bool {
        matches!(self, StructuredResponse::Parsed(_))
    }

    pub fn str_field(&self, key: &str) -> Option<&str> {
        self.fields().get(key).and_then(Value::as_str)
    }

    pub fn f64_field(&self, key: &str) -> Option<f64> {
        self.fields().get(key).and_then(Value::as_f64)
    }

    /// String-array field; non-string elements are skipped.
    pub fn str_list_field(&self, key: &str) -> Vec<String> {
        self.fields()
            .get(key)
            .and_then(Value::as_array)
            .map(|a| {
                a.iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// Parse the first balanced brace-delimited region of `raw` into an object,
/// filling absent fields from `defaults` and coercing numeric-looking
/// strings in positions whose default is numeric. Falls back to `defaults`
/// on any structural failure.
pub fn parse_structured(raw: &str, defaults: &Map<String, Value>) -> StructuredResponse {
    let Some(region) = balanced_region(raw) else {
        debug!("no balanced object region in response; using defaults");
        return StructuredResponse::Defaulted(defaults.clone());
    };

    let repaired = repair_thousands_separators(region);
    let parsed: Value = match serde_json::from_str(&repaired) {
        Ok(v) => v,
        Err(e) => {
            debug!(error = %e, "structural parse failed; using defaults");
            return StructuredResponse::Defaulted(defaults.clone());
        }
    };
    let Value::Object(mut map) = parsed else {
        return StructuredResponse::Defaulted(defaults.clone());
    };

    for (key, default_value) in defaults {
        match map.get(key) {
            None | Some(Value::Null) => {
                map.insert(key.clone(), default_value.clone());
            }
            Some(Value::String(s)) if default_value.is_number() => {
                if let Some(n) = coerce_number(s) {
                    map.insert(key.clone(), n);
                }
            }
            _ => {}
        }
    }

    StructuredResponse::Parsed(map)
}

/// First balanced `{...}` region, tracking strings and escapes so braces
/// inside quoted text do not confuse the depth count.
fn balanced_region(raw: &str) -> Option<&str> {
    let bytes = raw.as_bytes();
    let start = raw.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (i, &b) in bytes.iter().enumerate().skip(start) {
        if escaped {
            escaped = false;
            continue;
        }
        match b {
            b'\\' if in_string => escaped = true,
            b'"' => in_string = !in_string,
            b'{' if !in_string => depth += 1,
            b'}' if !in_string => {
                depth -= 1;
                if depth == 0 {
                    return Some(&raw[start..=i]);
                }
            }
            _ => {}
        }
    }
    None
}

/// Strip thousands separators from numbers in unquoted positions, e.g.
/// `"revenue": 12,345.6` becomes `"revenue": 12345.6`. Quoted strings are
/// left alone; the value must directly follow `:`, `[` or `,`.
fn repair_thousands_separators(region: &str) -> String {
    static RE: OnceCell<Regex> = OnceCell::new();
    let re = RE.get_or_init(|| {
        Regex::new(r"(?P<pre>[:\[,]\s*)(?P<num>-?\d{1,3}(?:,\d{3})+(?:\.\d+)?)(?P<post>\s*[,}\]])")
            .expect("separator repair regex")
    });

    let mut out = region.to_string();
    // A repaired number's trailing delimiter can be the next number's
    // leading context, so repeat until stable.
    loop {
        let next = re
            .replace_all(&out, |caps: &regex::Captures<'_>| {
                format!(
                    "{}{}{}",
                    &caps["pre"],
                    caps["num"].replace(',', ""),
                    &caps["post"]
                )
            })
            .into_owned();
        if next == out {
            return out;
        }
        out = next;
    }
}

fn coerce_number(s: &str) -> Option<Value> {
    let cleaned = s.trim().replace(',', "");
    cleaned
        .parse::<f64>()
        .ok()
        .and_then(serde_json::Number::from_f64)
        .map(Value::Number)
}

/// Convenience: build a defaults map from JSON literal text. Panics on
/// invalid input, so only call with static literals.
pub fn defaults_from(json: &str) -> Map<String, Value> {
    match serde_json::from_str(json) {
        Ok(Value::Object(m)) => m,
        _ => panic!("defaults_from expects a JSON object literal"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn defaults() -> Map<String, Value> {
        defaults_from(r#"{"outlook": "neutral", "confidence": 0.5, "drivers": []}"#)
    }

    #[test]
    fn well_formed_fields_pass_through_unmodified() {
        let raw = r#"Sure, here is the answer:
        {"outlook": "positive", "confidence": 0.82, "drivers": ["growth", "margins"]}
        Let me know if you need more."#;
        let out = parse_structured(raw, &defaults());
        assert!(out.was_parsed());
        assert_eq!(out.str_field("outlook"), Some("positive"));
        assert!((out.f64_field("confidence").unwrap() - 0.82).abs() < 1e-9);
        assert_eq!(out.str_list_field("drivers"), vec!["growth", "margins"]);
    }

    #[test]
    fn malformed_text_returns_exact_defaults() {
        let out = parse_structured("no json here at all", &defaults());
        assert!(!out.was_parsed());
        assert_eq!(out.fields(), &defaults());

        let out = parse_structured("", &defaults());
        assert_eq!(out.fields(), &defaults());

        let out = parse_structured("{broken: ", &defaults());
        assert_eq!(out.fields(), &defaults());
    }

    #[test]
    fn missing_fields_are_filled_from_defaults() {
        let out = parse_structured(r#"{"outlook": "negative"}"#, &defaults());
        assert!(out.was_parsed());
        assert_eq!(out.str_field("outlook"), Some("negative"));
        assert!((out.f64_field("confidence").unwrap() - 0.5).abs() < 1e-9);
        assert!(out.str_list_field("drivers").is_empty());
    }

    #[test]
    fn thousands_separators_in_numeric_positions_are_repaired() {
        let d = defaults_from(r#"{"revenue": 0.0, "note": ""}"#);
        let out = parse_structured(r#"{"revenue": 12,345.5, "note": "grew 1,2"}"#, &d);
        assert!(out.was_parsed());
        assert!((out.f64_field("revenue").unwrap() - 12345.5).abs() < 1e-9);
        // Quoted text is untouched.
        assert_eq!(out.str_field("note"), Some("grew 1,2"));
    }

    #[test]
    fn adjacent_separated_numbers_in_array_both_repair() {
        let d = defaults_from(r#"{"values": []}"#);
        let out = parse_structured(r#"{"values": [1,234, 5,678]}"#, &d);
        assert!(out.was_parsed());
        let values = out.fields().get("values").unwrap().as_array().unwrap();
        assert_eq!(values[0].as_i64(), Some(1234));
        assert_eq!(values[1].as_i64(), Some(5678));
    }

    #[test]
    fn numeric_string_is_coerced_when_default_is_number() {
        let out = parse_structured(r#"{"confidence": "0.75"}"#, &defaults());
        assert!((out.f64_field("confidence").unwrap() - 0.75).abs() < 1e-9);
    }

    #[test]
    fn braces_inside_strings_do_not_break_region_detection() {
        let raw = r#"{"outlook": "mixed {tough} quarter", "confidence": 0.4}"#;
        let out = parse_structured(raw, &defaults());
        assert!(out.was_parsed());
        assert_eq!(out.str_field("outlook"), Some("mixed {tough} quarter"));
    }

    #[test]
    fn first_balanced_region_wins() {
        let raw = json!({"outlook": "positive", "confidence": 0.9}).to_string()
            + &json!({"outlook": "negative"}).to_string();
        let out = parse_structured(&raw, &defaults());
        assert_eq!(out.str_field("outlook"), Some("positive"));
    }
}
