//! Tabular result sets passed between fetch, aggregation and rendering.

use std::cmp::Ordering;

use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Date(NaiveDate),
    DateTime(NaiveDateTime),
}

impl Value {
    pub fn text(value: impl Into<String>) -> Self {
        Value::Text(value.into())
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn is_numeric(&self) -> bool {
        matches!(self, Value::Int(_) | Value::Float(_))
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(value) => Some(*value as f64),
            Value::Float(value) => Some(*value),
            _ => None,
        }
    }

    /// Calendar date of temporal values.
    pub fn as_date(&self) -> Option<NaiveDate> {
        match self {
            Value::Date(date) => Some(*date),
            Value::DateTime(datetime) => Some(datetime.date()),
            _ => None,
        }
    }

    /// Plain-text rendering shared by the tabular encoders.
    pub fn display(&self) -> String {
        match self {
            Value::Null => String::new(),
            Value::Bool(value) => value.to_string(),
            Value::Int(value) => value.to_string(),
            Value::Float(value) => format!("{value:.2}"),
            Value::Text(value) => value.clone(),
            Value::Date(value) => value.format("%Y-%m-%d").to_string(),
            Value::DateTime(value) => value.format("%Y-%m-%d %H:%M:%S").to_string(),
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Null => serde_json::Value::Null,
            Value::Bool(value) => serde_json::Value::Bool(*value),
            Value::Int(value) => serde_json::Value::from(*value),
            Value::Float(value) => serde_json::Number::from_f64(*value)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            other => serde_json::Value::String(other.display()),
        }
    }

    fn type_rank(&self) -> u8 {
        match self {
            Value::Null => 0,
            Value::Bool(_) => 1,
            Value::Int(_) | Value::Float(_) => 2,
            Value::Date(_) | Value::DateTime(_) => 3,
            Value::Text(_) => 4,
        }
    }

    /// Total order used for `sort_by`. Nulls sort first.
    pub fn sort_cmp(&self, other: &Value) -> Ordering {
        match (self, other) {
            (Value::Bool(a), Value::Bool(b)) => a.cmp(b),
            (Value::Int(a), Value::Int(b)) => a.cmp(b),
            (a, b) if a.is_numeric() && b.is_numeric() => {
                let (a, b) = (a.as_f64().unwrap_or(0.0), b.as_f64().unwrap_or(0.0));
                a.partial_cmp(&b).unwrap_or(Ordering::Equal)
            }
            (Value::Date(a), Value::Date(b)) => a.cmp(b),
            (Value::DateTime(a), Value::DateTime(b)) => a.cmp(b),
            (Value::Date(a), Value::DateTime(b)) => a.and_hms_opt(0, 0, 0).map_or(Ordering::Equal, |a| a.cmp(b)),
            (Value::DateTime(a), Value::Date(b)) => b.and_hms_opt(0, 0, 0).map_or(Ordering::Equal, |b| a.cmp(&b)),
            (Value::Text(a), Value::Text(b)) => a.cmp(b),
            (a, b) => a.type_rank().cmp(&b.type_rank()),
        }
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::Text(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::Text(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Int(value)
    }
}

impl From<i32> for Value {
    fn from(value: i32) -> Self {
        Value::Int(i64::from(value))
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Float(value)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}

impl From<NaiveDate> for Value {
    fn from(value: NaiveDate) -> Self {
        Value::Date(value)
    }
}

impl From<NaiveDateTime> for Value {
    fn from(value: NaiveDateTime) -> Self {
        Value::DateTime(value)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or(Value::Null)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortDirection {
    Asc,
    #[default]
    Desc,
}

impl SortDirection {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "asc" => Some(SortDirection::Asc),
            "desc" => Some(SortDirection::Desc),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Table {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
}

impl Table {
    pub fn new<S: Into<String>>(columns: impl IntoIterator<Item = S>) -> Self {
        Self {
            columns: columns.into_iter().map(Into::into).collect(),
            rows: Vec::new(),
        }
    }

    pub fn push(&mut self, row: Vec<Value>) {
        debug_assert_eq!(row.len(), self.columns.len());
        self.rows.push(row);
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|column| column == name)
    }

    /// Keep only `columns`, in that order. Unknown names are skipped.
    pub fn project(self, columns: &[String]) -> Table {
        let indexes: Vec<(usize, &String)> = columns
            .iter()
            .filter_map(|name| self.column_index(name).map(|index| (index, name)))
            .collect();
        let rows = self
            .rows
            .into_iter()
            .map(|row| indexes.iter().map(|(index, _)| row[*index].clone()).collect())
            .collect();
        Table {
            columns: indexes.into_iter().map(|(_, name)| name.clone()).collect(),
            rows,
        }
    }

    /// Stable sort; ties keep the source order.
    pub fn sort_by_column(&mut self, column: &str, direction: SortDirection) {
        let Some(index) = self.column_index(column) else {
            return;
        };
        self.rows.sort_by(|a, b| {
            let ordering = a[index].sort_cmp(&b[index]);
            match direction {
                SortDirection::Asc => ordering,
                SortDirection::Desc => ordering.reverse(),
            }
        });
    }

    pub fn truncate(&mut self, limit: usize) {
        self.rows.truncate(limit);
    }

    /// A column is numeric when it holds at least one number and nothing but numbers and nulls.
    pub fn is_numeric_column(&self, index: usize) -> bool {
        let mut seen_number = false;
        for row in &self.rows {
            match &row[index] {
                Value::Null => {}
                value if value.is_numeric() => seen_number = true,
                _ => return false,
            }
        }
        seen_number
    }

    /// Column sums over the current rows. Identifier columns are left blank.
    pub fn totals_row(&self) -> Vec<Value> {
        let mut totals = Vec::with_capacity(self.columns.len());
        for (index, name) in self.columns.iter().enumerate() {
            if is_identifier(name) || !self.is_numeric_column(index) {
                totals.push(Value::Null);
                continue;
            }
            let all_ints = self
                .rows
                .iter()
                .all(|row| matches!(row[index], Value::Int(_) | Value::Null));
            if all_ints {
                let sum: i64 = self
                    .rows
                    .iter()
                    .filter_map(|row| match row[index] {
                        Value::Int(value) => Some(value),
                        _ => None,
                    })
                    .sum();
                totals.push(Value::Int(sum));
            } else {
                let sum: f64 = self.rows.iter().filter_map(|row| row[index].as_f64()).sum();
                totals.push(Value::Float(sum));
            }
        }
        if let Some(first) = totals.first_mut() {
            if first.is_null() {
                *first = Value::text("Total");
            }
        }
        totals
    }
}

pub fn is_identifier(column: &str) -> bool {
    column == "id" || column.ends_with("_id")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Table {
        let mut table = Table::new(["id", "school_name", "student_count", "total_cost"]);
        table.push(vec![1.into(), "Oak".into(), 20.into(), 200.0.into()]);
        table.push(vec![2.into(), "Elm".into(), 25.into(), 250.5.into()]);
        table.push(vec![3.into(), "Ash".into(), 20.into(), 180.0.into()]);
        table
    }

    #[test]
    fn sort_is_stable_for_ties() {
        let mut table = sample();
        table.sort_by_column("student_count", SortDirection::Desc);
        let ids: Vec<_> = table.rows.iter().map(|row| row[0].clone()).collect();
        assert_eq!(ids, vec![Value::Int(2), Value::Int(1), Value::Int(3)]);

        table.sort_by_column("student_count", SortDirection::Asc);
        let ids: Vec<_> = table.rows.iter().map(|row| row[0].clone()).collect();
        assert_eq!(ids, vec![Value::Int(1), Value::Int(3), Value::Int(2)]);
    }

    #[test]
    fn projection_follows_requested_order() {
        let table = sample().project(&["total_cost".to_string(), "id".to_string()]);
        assert_eq!(table.columns, vec!["total_cost", "id"]);
        assert_eq!(table.rows[1], vec![Value::Float(250.5), Value::Int(2)]);
    }

    #[test]
    fn totals_skip_identifiers_and_text() {
        let totals = sample().totals_row();
        assert_eq!(totals[0], Value::text("Total"));
        assert_eq!(totals[1], Value::Null);
        assert_eq!(totals[2], Value::Int(65));
        assert_eq!(totals[3], Value::Float(630.5));
    }

    #[test]
    fn display_formats_temporal_values() {
        let date = NaiveDate::from_ymd_opt(2024, 1, 5).unwrap();
        assert_eq!(Value::Date(date).display(), "2024-01-05");
        let datetime = date.and_hms_opt(9, 30, 0).unwrap();
        assert_eq!(Value::DateTime(datetime).display(), "2024-01-05 09:30:00");
        assert_eq!(Value::Float(3.0).display(), "3.00");
    }
}
