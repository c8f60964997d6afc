//! Aggregations: grouping, date bucketing and summary values over records.

use std::collections::HashMap;

use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::{parse_timezone, Timezone};
use crate::error::{Error, Result};
use crate::hash::{hash_values, Hash256};
use crate::projection::Projection;
use crate::record::field_value;
use crate::types::{Record, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AggregateOperation {
    Count,
    Sum,
    Avg,
    Max,
    Min,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DateOperation {
    Year,
    Month,
    Week,
    Day,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregationGroup {
    pub field: String,
    pub operation: Option<DateOperation>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Aggregation {
    pub operation: AggregateOperation,
    pub field: Option<String>,
    #[serde(default)]
    pub groups: Vec<AggregationGroup>,
}

/// One output row. `group` maps every group-by field to its (bucketed) value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateResult {
    pub value: Value,
    pub group: Record,
}

impl Aggregation {
    pub fn new(operation: AggregateOperation, field: Option<&str>) -> Self {
        Self {
            operation,
            field: field.map(str::to_string),
            groups: vec![],
        }
    }

    pub fn count() -> Self {
        Self::new(AggregateOperation::Count, None)
    }

    pub fn with_group(mut self, field: impl Into<String>, operation: Option<DateOperation>) -> Self {
        self.groups.push(AggregationGroup {
            field: field.into(),
            operation,
        });
        self
    }

    /// Target field plus every group-by field.
    pub fn projection(&self) -> Projection {
        self.field
            .iter()
            .map(String::as_str)
            .chain(self.groups.iter().map(|g| g.field.as_str()))
            .collect()
    }

    pub fn nest(&self, prefix: &str) -> Aggregation {
        if prefix.is_empty() {
            return self.clone();
        }
        self.replace_fields(|f| format!("{prefix}:{f}"))
    }

    pub fn replace_fields(&self, mut handler: impl FnMut(&str) -> String) -> Aggregation {
        Aggregation {
            operation: self.operation,
            field: self.field.as_deref().map(|f| handler(f)),
            groups: self
                .groups
                .iter()
                .map(|g| AggregationGroup {
                    field: handler(&g.field),
                    operation: g.operation,
                })
                .collect(),
        }
    }

    pub fn try_replace_fields<E>(
        &self,
        mut handler: impl FnMut(&str) -> std::result::Result<String, E>,
    ) -> std::result::Result<Aggregation, E> {
        Ok(Aggregation {
            operation: self.operation,
            field: self.field.as_deref().map(|f| handler(f)).transpose()?,
            groups: self
                .groups
                .iter()
                .map(|g| {
                    Ok(AggregationGroup {
                        field: handler(&g.field)?,
                        operation: g.operation,
                    })
                })
                .collect::<std::result::Result<Vec<_>, E>>()?,
        })
    }

    /// Compute the aggregation in memory.
    ///
    /// Rows come out sorted by value descending; equal values keep the order
    /// in which their group was first seen. `timezone` is only read when a
    /// group buckets dates.
    pub fn apply(
        &self,
        records: &[Record],
        timezone: &str,
        limit: Option<usize>,
    ) -> Result<Vec<AggregateResult>> {
        let tz = if self.groups.iter().any(|g| g.operation.is_some()) {
            Some(parse_timezone(timezone)?)
        } else {
            None
        };
        let mut index: HashMap<Hash256, usize> = HashMap::new();
        let mut groups: Vec<Accumulator> = Vec::new();

        for record in records {
            let key = self
                .groups
                .iter()
                .map(|g| group_value(record, g, tz.as_ref()))
                .collect::<Result<Vec<_>>>()?;
            let slot = *index.entry(hash_values(&key)).or_insert_with(|| {
                groups.push(Accumulator::new(
                    self.groups.iter().map(|g| g.field.clone()).zip(key).collect(),
                ));
                groups.len() - 1
            });
            let target = self.field.as_deref().and_then(|f| field_value(record, f));
            groups[slot].observe(target);
        }

        let mut rows: Vec<AggregateResult> = groups
            .into_iter()
            .filter_map(|acc| {
                let value = acc.value(self.operation, self.field.is_some())?;
                Some(AggregateResult {
                    value,
                    group: acc.group,
                })
            })
            .collect();
        rows.sort_by(|a, b| b.value.total_cmp(&a.value));
        if let Some(limit) = limit {
            rows.truncate(limit);
        }
        Ok(rows)
    }
}

struct Accumulator {
    group: Record,
    star_count: usize,
    count: usize,
    sum: f64,
    sum_is_integral: bool,
    min: Option<Value>,
    max: Option<Value>,
}

impl Accumulator {
    fn new(group: Record) -> Self {
        Self {
            group,
            star_count: 0,
            count: 0,
            sum: 0.0,
            sum_is_integral: true,
            min: None,
            max: None,
        }
    }

    fn observe(&mut self, value: Option<&Value>) {
        self.star_count += 1;
        let Some(value) = value.filter(|v| !v.is_null()) else {
            return;
        };
        self.count += 1;
        if let Some(n) = value.as_f64() {
            self.sum += n;
            self.sum_is_integral &= matches!(value, Value::Int(_));
        }
        if self.min.as_ref().map_or(true, |m| value.total_cmp(m).is_lt()) {
            self.min = Some(value.clone());
        }
        if self.max.as_ref().map_or(true, |m| value.total_cmp(m).is_gt()) {
            self.max = Some(value.clone());
        }
    }

    /// `None` drops the group (average over zero values).
    fn value(&self, operation: AggregateOperation, has_field: bool) -> Option<Value> {
        match operation {
            AggregateOperation::Count if has_field => Some(Value::from(self.count)),
            AggregateOperation::Count => Some(Value::from(self.star_count)),
            AggregateOperation::Sum if self.sum_is_integral => Some(Value::Int(self.sum as i64)),
            AggregateOperation::Sum => Some(Value::Float(self.sum)),
            AggregateOperation::Avg if self.count == 0 => None,
            AggregateOperation::Avg => Some(Value::Float(self.sum / self.count as f64)),
            AggregateOperation::Max => Some(self.max.clone().unwrap_or_default()),
            AggregateOperation::Min => Some(self.min.clone().unwrap_or_default()),
        }
    }
}

fn group_value(record: &Record, group: &AggregationGroup, tz: Option<&Timezone>) -> Result<Value> {
    let value = field_value(record, &group.field).cloned().unwrap_or_default();
    let (Some(op), Some(tz)) = (group.operation, tz) else {
        return Ok(value);
    };
    match value {
        Value::Null => Ok(Value::Null),
        Value::Str(s) => {
            let date = local_date(&s, tz)?;
            Ok(Value::Str(truncate(date, op).format("%Y-%m-%d").to_string()))
        }
        other => Err(Error::InvalidDate(other.to_string())),
    }
}

/// Calendar date of `s` in `tz`. Date-only strings are taken as-is.
fn local_date(s: &str, tz: &Timezone) -> Result<NaiveDate> {
    if let Ok(date) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
        return Ok(date);
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok(tz.local_date(dt.with_timezone(&Utc)));
    }
    // Naive timestamps are read as UTC.
    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, format) {
            return Ok(tz.local_date(naive.and_utc()));
        }
    }
    Err(Error::InvalidDate(s.to_string()))
}

fn truncate(date: NaiveDate, op: DateOperation) -> NaiveDate {
    match op {
        DateOperation::Year => NaiveDate::from_ymd_opt(date.year(), 1, 1).unwrap_or(date),
        DateOperation::Month => NaiveDate::from_ymd_opt(date.year(), date.month(), 1).unwrap_or(date),
        DateOperation::Week => date - Duration::days(date.weekday().num_days_from_monday() as i64),
        DateOperation::Day => date,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record;

    #[test]
    fn count_star_on_empty_records() {
        let rows = Aggregation::count()
            .apply(&[Record::new(), Record::new(), Record::new()], "UTC", None)
            .unwrap();
        assert_eq!(rows, vec![AggregateResult { value: Value::Int(3), group: Record::new() }]);
    }

    #[test]
    fn sum_grouped_by_year() {
        let records = vec![
            record! { "d" => "2010-01-01", "v" => 2 },
            record! { "d" => "2010-07-01", "v" => 2 },
            record! { "d" => "2021-04-01", "v" => 1 },
        ];
        let rows = Aggregation::new(AggregateOperation::Sum, Some("v"))
            .with_group("d", Some(DateOperation::Year))
            .apply(&records, "UTC", None)
            .unwrap();
        assert_eq!(
            rows,
            vec![
                AggregateResult { value: Value::Int(4), group: record! { "d" => "2010-01-01" } },
                AggregateResult { value: Value::Int(1), group: record! { "d" => "2021-01-01" } },
            ]
        );
    }

    #[test]
    fn avg_drops_groups_without_values() {
        let records = vec![
            record! { "cat" => "a", "v" => Value::Null },
            record! { "cat" => "b", "v" => 3 },
            record! { "cat" => "b", "v" => 4 },
        ];
        let rows = Aggregation::new(AggregateOperation::Avg, Some("v"))
            .with_group("cat", None)
            .apply(&records, "UTC", None)
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].value, Value::Float(3.5));
        assert_eq!(rows[0].group, record! { "cat" => "b" });
    }

    #[test]
    fn count_field_ignores_nulls_and_limit_truncates() {
        let records = vec![
            record! { "cat" => "a", "v" => 1 },
            record! { "cat" => "b", "v" => Value::Null },
            record! { "cat" => "b", "v" => 1 },
            record! { "cat" => "c", "v" => 1 },
            record! { "cat" => "c", "v" => 1 },
        ];
        let rows = Aggregation::new(AggregateOperation::Count, Some("v"))
            .with_group("cat", None)
            .apply(&records, "UTC", Some(2))
            .unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].group, record! { "cat" => "c" });
        // "a" and "b" tie at 1; "a" was seen first.
        assert_eq!(rows[1].group, record! { "cat" => "a" });
    }

    #[test]
    fn week_and_timezone_bucketing() {
        let records = vec![
            record! { "at" => "2024-01-07T23:30:00Z" },
            record! { "at" => "2024-01-10" },
        ];
        let rows = Aggregation::count()
            .with_group("at", Some(DateOperation::Week))
            .apply(&records, "+02:00", None)
            .unwrap();
        // 2024-01-07 23:30 UTC is Monday 2024-01-08 01:30 at +02:00.
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].group, record! { "at" => "2024-01-08" });
        assert_eq!(rows[0].value, Value::Int(2));
    }

    #[test]
    fn named_zone_buckets_across_midnight() {
        let records = vec![
            record! { "at" => "2024-03-31T22:15:00Z" },
            record! { "at" => "2024-03-31T21:45:00Z" },
            record! { "at" => "2024-03-31 23:59:00" },
        ];
        let rows = Aggregation::count()
            .with_group("at", Some(DateOperation::Day))
            .apply(&records, "Europe/Paris", None)
            .unwrap();
        // Paris is at +02:00 after the 2024-03-31 switch.
        assert_eq!(
            rows,
            vec![
                AggregateResult { value: Value::Int(2), group: record! { "at" => "2024-04-01" } },
                AggregateResult { value: Value::Int(1), group: record! { "at" => "2024-03-31" } },
            ]
        );

        let month = Aggregation::count()
            .with_group("at", Some(DateOperation::Month))
            .apply(&records, "Europe/Paris", None)
            .unwrap();
        assert_eq!(month[0].group, record! { "at" => "2024-04-01" });
    }

    #[test]
    fn timezone_is_only_parsed_for_date_groups() {
        let plain = Aggregation::count().with_group("cat", None);
        let rows = plain
            .apply(&[record! { "cat" => "a" }, record! { "cat" => "a" }], "Mars/Base", None)
            .unwrap();
        assert_eq!(rows[0].value, Value::Int(2));
        assert!(Aggregation::count().apply(&[Record::new()], "Europe/Paris", None).is_ok());

        let by_day = Aggregation::count().with_group("at", Some(DateOperation::Day));
        assert!(matches!(
            by_day.apply(&[], "Mars/Base", None),
            Err(Error::InvalidTimezone(_))
        ));
    }

    #[test]
    fn min_max_and_paths() {
        let records = vec![record! { "x" => 5 }, record! { "x" => -1 }, record! { "x" => Value::Null }];
        let max = Aggregation::new(AggregateOperation::Max, Some("x"))
            .apply(&records, "UTC", None)
            .unwrap();
        let min = Aggregation::new(AggregateOperation::Min, Some("x"))
            .apply(&records, "UTC", None)
            .unwrap();
        assert_eq!(max[0].value, Value::Int(5));
        assert_eq!(min[0].value, Value::Int(-1));

        let nested = Aggregation::new(AggregateOperation::Sum, Some("price")).with_group("day", None);
        assert_eq!(nested.nest("order").projection(), Projection::from(["order:price", "order:day"]));
    }
}
