//! Grouping and summary pass over fetched rows.

use std::collections::{BTreeMap, HashMap};

use chrono::{Datelike, Duration, NaiveDate};
use serde::{Deserialize, Serialize};

use crate::error::{ReportError, ReportResult};
use crate::models::DataType;
use crate::source::columns;
use crate::table::{is_identifier, Table, Value};

const MISSING_KEY: &str = "(none)";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupBy {
    Day,
    Week,
    Month,
    Quarter,
    Year,
    School,
    Program,
    Teacher,
}

impl GroupBy {
    pub const TEMPORAL: [GroupBy; 5] = [
        GroupBy::Day,
        GroupBy::Week,
        GroupBy::Month,
        GroupBy::Quarter,
        GroupBy::Year,
    ];

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "day" => Some(GroupBy::Day),
            "week" => Some(GroupBy::Week),
            "month" => Some(GroupBy::Month),
            "quarter" => Some(GroupBy::Quarter),
            "year" => Some(GroupBy::Year),
            "school" => Some(GroupBy::School),
            "program" => Some(GroupBy::Program),
            "teacher" => Some(GroupBy::Teacher),
            _ => None,
        }
    }

    pub fn is_temporal(self) -> bool {
        Self::TEMPORAL.contains(&self)
    }

    /// Column the grouping key is read from, if `data_type` has one.
    pub fn source_column(self, data_type: DataType) -> Option<&'static str> {
        if self.is_temporal() {
            return columns::date_column(data_type);
        }
        match (self, data_type) {
            (GroupBy::School, DataType::Bookings | DataType::Financial | DataType::Users) => {
                Some("school_name")
            }
            (GroupBy::School, DataType::Schools) => Some("name"),
            (GroupBy::Program, DataType::Bookings | DataType::Financial) => Some("program_title"),
            (GroupBy::Program, DataType::Programs) => Some("title"),
            (GroupBy::Teacher, DataType::Bookings) => Some("teacher_name"),
            _ => None,
        }
    }

    /// Name of the key column in grouped output.
    pub fn key_column(self, data_type: DataType) -> String {
        if self.is_temporal() {
            "period".to_string()
        } else {
            self.source_column(data_type).unwrap_or("group").to_string()
        }
    }

    fn truncate(self, date: NaiveDate) -> NaiveDate {
        match self {
            GroupBy::Week => {
                date - Duration::days(i64::from(date.weekday().num_days_from_monday()))
            }
            GroupBy::Month => date.with_day(1).unwrap_or(date),
            GroupBy::Quarter => {
                let month = (date.month0() / 3) * 3 + 1;
                NaiveDate::from_ymd_opt(date.year(), month, 1).unwrap_or(date)
            }
            GroupBy::Year => date.with_ordinal(1).unwrap_or(date),
            _ => date,
        }
    }

    fn label(self, start: NaiveDate) -> String {
        match self {
            GroupBy::Day => start.format("%Y-%m-%d").to_string(),
            GroupBy::Week => start.format("%G-W%V").to_string(),
            GroupBy::Month => start.format("%Y-%m").to_string(),
            GroupBy::Quarter => format!("{}-Q{}", start.year(), start.month0() / 3 + 1),
            GroupBy::Year => start.year().to_string(),
            _ => start.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregateFn {
    Sum,
    Avg,
    Count,
    Min,
    Max,
}

impl AggregateFn {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "sum" => Some(AggregateFn::Sum),
            "avg" => Some(AggregateFn::Avg),
            "count" => Some(AggregateFn::Count),
            "min" => Some(AggregateFn::Min),
            "max" => Some(AggregateFn::Max),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            AggregateFn::Sum => "sum",
            AggregateFn::Avg => "avg",
            AggregateFn::Count => "count",
            AggregateFn::Min => "min",
            AggregateFn::Max => "max",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Aggregation {
    pub group_by: GroupBy,
    /// Applied to every numeric column; defaults to `[sum]`.
    pub functions: Vec<AggregateFn>,
}

impl Aggregation {
    pub fn new(group_by: GroupBy, functions: Vec<AggregateFn>) -> Self {
        let functions = if functions.is_empty() {
            vec![AggregateFn::Sum]
        } else {
            functions
        };
        Self {
            group_by,
            functions,
        }
    }
}

#[derive(Debug, Clone)]
struct NumericAcc {
    sum: f64,
    count: usize,
    all_int: bool,
    min: Option<Value>,
    max: Option<Value>,
}

impl NumericAcc {
    fn new() -> Self {
        Self {
            sum: 0.0,
            count: 0,
            all_int: true,
            min: None,
            max: None,
        }
    }

    fn add(&mut self, value: &Value) {
        let Some(number) = value.as_f64() else {
            return;
        };
        self.sum += number;
        self.count += 1;
        self.all_int &= matches!(value, Value::Int(_));
        if self.min.as_ref().map_or(true, |min| value.sort_cmp(min).is_lt()) {
            self.min = Some(value.clone());
        }
        if self.max.as_ref().map_or(true, |max| value.sort_cmp(max).is_gt()) {
            self.max = Some(value.clone());
        }
    }

    fn finish(&self, function: AggregateFn) -> Value {
        match function {
            AggregateFn::Sum if self.all_int => Value::Int(self.sum as i64),
            AggregateFn::Sum => Value::Float(self.sum),
            AggregateFn::Avg if self.count == 0 => Value::Null,
            AggregateFn::Avg => Value::Float(self.sum / self.count as f64),
            AggregateFn::Count => Value::Int(self.count as i64),
            AggregateFn::Min => self.min.clone().unwrap_or(Value::Null),
            AggregateFn::Max => self.max.clone().unwrap_or(Value::Null),
        }
    }
}

#[derive(Debug, Clone)]
enum ColumnRole {
    Aggregated(usize),
    FirstSeen(usize),
}

struct Group {
    first_seen: Vec<Value>,
    numeric: Vec<NumericAcc>,
}

/// Group `table` by `aggregation`; no aggregation returns the table untouched.
pub fn apply(
    table: Table,
    data_type: DataType,
    aggregation: Option<&Aggregation>,
) -> ReportResult<Table> {
    let Some(aggregation) = aggregation else {
        return Ok(table);
    };
    let group_by = aggregation.group_by;
    let source = group_by.source_column(data_type).ok_or_else(|| {
        ReportError::Aggregation(format!(
            "{data_type} rows cannot be grouped by {group_by:?}"
        ))
    })?;
    let key_index = table.column_index(source).ok_or_else(|| {
        ReportError::Aggregation(format!("grouping column {source} is not in the result set"))
    })?;

    let mut roles = Vec::new();
    let mut numeric_count = 0;
    let mut first_seen_count = 0;
    for (index, name) in table.columns.iter().enumerate() {
        if index == key_index {
            continue;
        }
        if !is_identifier(name) && table.is_numeric_column(index) {
            roles.push((index, ColumnRole::Aggregated(numeric_count)));
            numeric_count += 1;
        } else {
            roles.push((index, ColumnRole::FirstSeen(first_seen_count)));
            first_seen_count += 1;
        }
    }

    let mut output_columns = vec![group_by.key_column(data_type)];
    for (index, role) in &roles {
        let name = &table.columns[*index];
        match role {
            ColumnRole::Aggregated(_) => output_columns.extend(
                aggregation
                    .functions
                    .iter()
                    .map(|function| format!("{name}_{}", function.as_str())),
            ),
            ColumnRole::FirstSeen(_) => output_columns.push(name.clone()),
        }
    }

    let new_group = || Group {
        first_seen: vec![Value::Null; first_seen_count],
        numeric: vec![NumericAcc::new(); numeric_count],
    };

    // Temporal keys sort chronologically; categorical keys keep first-seen order.
    let mut temporal: BTreeMap<Option<NaiveDate>, Group> = BTreeMap::new();
    let mut categorical_order: Vec<String> = Vec::new();
    let mut categorical: HashMap<String, Group> = HashMap::new();

    for row in &table.rows {
        let group = if group_by.is_temporal() {
            let key = row[key_index].as_date().map(|date| group_by.truncate(date));
            temporal.entry(key).or_insert_with(new_group)
        } else {
            let key = match &row[key_index] {
                Value::Null => MISSING_KEY.to_string(),
                value => value.display(),
            };
            if !categorical.contains_key(&key) {
                categorical_order.push(key.clone());
            }
            categorical.entry(key).or_insert_with(new_group)
        };
        for (index, role) in &roles {
            match role {
                ColumnRole::Aggregated(slot) => group.numeric[*slot].add(&row[*index]),
                ColumnRole::FirstSeen(slot) => {
                    if group.first_seen[*slot].is_null() {
                        group.first_seen[*slot] = row[*index].clone();
                    }
                }
            }
        }
    }

    let mut output = Table::new(output_columns);
    let emit = |output: &mut Table, key: Value, group: &Group| {
        let mut row = vec![key];
        for (_, role) in &roles {
            match role {
                ColumnRole::Aggregated(slot) => row.extend(
                    aggregation
                        .functions
                        .iter()
                        .map(|function| group.numeric[*slot].finish(*function)),
                ),
                ColumnRole::FirstSeen(slot) => row.push(group.first_seen[*slot].clone()),
            }
        }
        output.push(row);
    };

    if group_by.is_temporal() {
        // `None` sorts first in a BTreeMap; undated rows go last.
        let undated = temporal.remove(&None);
        for (key, group) in &temporal {
            let label = key.map(|date| group_by.label(date)).unwrap_or_default();
            emit(&mut output, Value::Text(label), group);
        }
        if let Some(group) = undated {
            emit(&mut output, Value::text(MISSING_KEY), &group);
        }
    } else {
        for key in &categorical_order {
            if let Some(group) = categorical.get(key) {
                emit(&mut output, Value::Text(key.clone()), group);
            }
        }
    }

    Ok(output)
}
