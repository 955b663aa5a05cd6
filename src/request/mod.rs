//! Raw request payloads to validated job and schedule definitions.
//!
//! Each request kind has a pure `normalize` step (strip empty values, fill
//! defaults) followed by `validate`, which either yields a typed definition or
//! a field-indexed `ValidationErrors`. Cross-field rules only run once every
//! per-field rule has passed.

mod export;
mod filters;
mod generate;
mod schedule;

pub use export::{normalize_export, parse_export, validate_export};
pub use generate::{normalize_generate, parse_generate, validate_generate, GenerateRequest};
pub use schedule::{normalize_schedule, parse_schedule, validate_schedule, ScheduleRequest};

use std::sync::LazyLock;

use chrono::{NaiveDate, NaiveTime};
use regex::Regex;
use serde_json::{Map, Value};

use crate::error::ValidationErrors;

static EMAIL_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[^\s@]+@[^\s@]+\.[^\s@]+$").expect("email pattern compiles")
});

pub(crate) fn is_email(value: &str) -> bool {
    EMAIL_PATTERN.is_match(value)
}

/// Drop nulls and blank strings everywhere; trim the remaining strings.
///
/// Inside `filters` an empty list also counts as absent.
pub fn strip_empty(raw: &Value) -> Value {
    let mut cleaned = clean(raw, false).unwrap_or_else(|| Value::Object(Map::new()));
    if let Some(filters) = cleaned.get_mut("filters") {
        if let Some(cleaned_filters) = clean(filters, true) {
            *filters = cleaned_filters;
        }
    }
    cleaned
}

fn clean(value: &Value, drop_empty_lists: bool) -> Option<Value> {
    match value {
        Value::Null => None,
        Value::String(text) => {
            let trimmed = text.trim();
            (!trimmed.is_empty()).then(|| Value::String(trimmed.to_string()))
        }
        Value::Array(items) => {
            let items: Vec<Value> = items
                .iter()
                .filter_map(|item| clean(item, drop_empty_lists))
                .collect();
            if items.is_empty() && drop_empty_lists {
                None
            } else {
                Some(Value::Array(items))
            }
        }
        Value::Object(map) => Some(Value::Object(
            map.iter()
                .filter_map(|(key, item)| clean(item, drop_empty_lists).map(|item| (key.clone(), item)))
                .collect(),
        )),
        other => Some(other.clone()),
    }
}

/// Set `path` to `value` unless something is already there.
pub(crate) fn default_at(input: &mut Value, path: &str, value: Value) {
    let mut segments: Vec<&str> = path.split('.').collect();
    let Some(last) = segments.pop() else {
        return;
    };
    let mut node = input;
    for segment in segments {
        let Some(map) = node.as_object_mut() else {
            return;
        };
        node = map
            .entry(segment.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
    }
    if let Some(map) = node.as_object_mut() {
        map.entry(last.to_string()).or_insert(value);
    }
}

/// Typed, error-collecting reads over a normalised payload.
///
/// A failed read records one message for the field and returns `None`, so a
/// validator can keep going and report every problem at once.
pub(crate) struct Fields<'a> {
    root: &'a Value,
    errors: ValidationErrors,
}

impl<'a> Fields<'a> {
    pub fn new(root: &'a Value) -> Self {
        Self {
            root,
            errors: ValidationErrors::new(),
        }
    }

    pub fn get(&self, path: &str) -> Option<&'a Value> {
        path.split('.').try_fold(self.root, |node, key| node.get(key))
    }

    pub fn has(&self, path: &str) -> bool {
        self.get(path).is_some()
    }

    pub fn fail(&mut self, path: &str, message: impl Into<String>) {
        self.errors.add(path, message);
    }

    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn failed(&self, path: &str) -> bool {
        self.errors.has_prefix(path)
    }

    pub fn finish(self) -> ValidationErrors {
        self.errors
    }

    pub fn require(&mut self, path: &str, message: &str) -> bool {
        if self.has(path) {
            true
        } else {
            self.fail(path, message);
            false
        }
    }

    pub fn string(&mut self, path: &str, label: &str) -> Option<String> {
        match self.get(path)? {
            Value::String(text) => Some(text.clone()),
            _ => {
                self.fail(path, format!("The {label} must be a string."));
                None
            }
        }
    }

    /// String no longer than `max` characters.
    pub fn bounded_string(&mut self, path: &str, label: &str, max: usize, message: &str) -> Option<String> {
        let text = self.string(path, label)?;
        if text.chars().count() > max {
            self.fail(path, message);
            return None;
        }
        Some(text)
    }

    /// Integers arrive as JSON numbers or numeric strings.
    pub fn integer(&mut self, path: &str, label: &str) -> Option<i64> {
        let parsed = match self.get(path)? {
            Value::Number(number) => number.as_i64(),
            Value::String(text) => text.parse().ok(),
            _ => None,
        };
        if parsed.is_none() {
            self.fail(path, format!("The {label} must be an integer."));
        }
        parsed
    }

    /// Integer within `min..=max`; `below` and `above` are the range messages.
    pub fn integer_in(
        &mut self,
        path: &str,
        label: &str,
        (min, below): (i64, &str),
        (max, above): (i64, &str),
    ) -> Option<i64> {
        let value = self.integer(path, label)?;
        if value < min {
            self.fail(path, below);
            return None;
        }
        if value > max {
            self.fail(path, above);
            return None;
        }
        Some(value)
    }

    pub fn number(&mut self, path: &str, label: &str) -> Option<f64> {
        let parsed = match self.get(path)? {
            Value::Number(number) => number.as_f64(),
            Value::String(text) => text.parse().ok(),
            _ => None,
        };
        if parsed.is_none() {
            self.fail(path, format!("The {label} must be a number."));
        }
        parsed
    }

    /// Accepts `true`/`false`, `1`/`0` and their string forms.
    pub fn boolean(&mut self, path: &str, label: &str) -> Option<bool> {
        let parsed = match self.get(path)? {
            Value::Bool(flag) => Some(*flag),
            Value::Number(number) => match number.as_i64() {
                Some(1) => Some(true),
                Some(0) => Some(false),
                _ => None,
            },
            Value::String(text) => match text.as_str() {
                "true" | "1" => Some(true),
                "false" | "0" => Some(false),
                _ => None,
            },
            _ => None,
        };
        if parsed.is_none() {
            self.fail(path, format!("The {label} field must be true or false."));
        }
        parsed
    }

    /// `YYYY-MM-DD`, optionally followed by a time part which is ignored.
    pub fn date(&mut self, path: &str, label: &str) -> Option<NaiveDate> {
        let text = self.string(path, label)?;
        let day = text.get(..10).unwrap_or(&text);
        match NaiveDate::parse_from_str(day, "%Y-%m-%d") {
            Ok(date) => Some(date),
            Err(_) => {
                self.fail(path, format!("The {label} is not a valid date."));
                None
            }
        }
    }

    /// `HH:MM`, 24-hour clock.
    pub fn time(&mut self, path: &str, label: &str, message: &str) -> Option<NaiveTime> {
        let text = self.string(path, label)?;
        let valid = text.len() == 5 && text.as_bytes()[2] == b':';
        match NaiveTime::parse_from_str(&text, "%H:%M") {
            Ok(time) if valid => Some(time),
            _ => {
                self.fail(path, message);
                None
            }
        }
    }

    pub fn list(&mut self, path: &str, label: &str) -> Option<&'a [Value]> {
        match self.get(path)? {
            Value::Array(items) => Some(items.as_slice()),
            _ => {
                self.fail(path, format!("The {label} must be an array."));
                None
            }
        }
    }

    /// List of strings, each checked by `accept`; rejects are keyed `path.N`.
    pub fn string_list(
        &mut self,
        path: &str,
        label: &str,
        accept: impl Fn(&str) -> bool,
        message: &str,
    ) -> Option<Vec<String>> {
        let items = self.list(path, label)?;
        let mut values = Vec::with_capacity(items.len());
        let mut valid = true;
        for (index, item) in items.iter().enumerate() {
            match item.as_str() {
                Some(text) if accept(text) => values.push(text.to_string()),
                _ => {
                    self.fail(&format!("{path}.{index}"), message);
                    valid = false;
                }
            }
        }
        valid.then_some(values)
    }

    /// List of email addresses; duplicates are reported by the caller.
    pub fn emails(&mut self, path: &str, label: &str, message: &str) -> Option<Vec<String>> {
        self.string_list(path, label, |value| value.len() <= 255 && is_email(value), message)
    }
}

/// True when `values` repeats an entry, compared exactly as stored.
pub(crate) fn has_duplicates(values: &[String]) -> bool {
    let mut seen = std::collections::HashSet::new();
    values.iter().any(|value| !seen.insert(value.as_str()))
}

/// `"Quarterly Bookings!"` -> `"quarterly_bookings"`.
pub(crate) fn slug(title: &str) -> String {
    let mut slug = String::with_capacity(title.len());
    for ch in title.chars() {
        if ch.is_ascii_alphanumeric() {
            slug.push(ch.to_ascii_lowercase());
        } else if !slug.ends_with('_') && !slug.is_empty() {
            slug.push('_');
        }
    }
    let slug = slug.trim_end_matches('_').to_string();
    if slug.is_empty() {
        "report".to_string()
    } else {
        slug
    }
}
