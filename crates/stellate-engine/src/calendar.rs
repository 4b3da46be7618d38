//! Calendar generator for date dimensions
//!
//! Produces one row per day between `start` and `end` (inclusive):
//!
//! | field | example |
//! |---|---|
//! | `date` | 2024-01-01 |
//! | `date_string` | "2024-01-01" |
//! | `day` | 1 |
//! | `day_name` | "Mon" |
//! | `day_of_week` | 1 (ISO, Monday = 1) |
//! | `week` | 0 (Sunday-based week of year) |
//! | `full_week` | "2024-00" |
//! | `month` | 1 |
//! | `month_name` | "Jan" |
//! | `full_month` | "2024-01" |
//! | `quarter` | 1 |
//! | `quarter_name` | "Q1" |
//! | `full_quarter` | "2024-1" |
//! | `year` | 2024 |

use std::collections::BTreeMap;

use chrono::{Datelike, NaiveDate};
use stellate_core::{Row, Value};

use crate::source::RowGenerator;

/// Upper bound on generated days, to catch swapped or mistyped years
const MAX_DAYS: i64 = 100 * 366;

/// Built-in `calendar` generator
#[derive(Debug, Clone, Copy, Default)]
pub struct CalendarGenerator;

impl CalendarGenerator {
    /// Row describing a single day
    pub fn day_row(date: NaiveDate) -> Row {
        let quarter = (date.month() - 1) / 3 + 1;
        let week: i64 = date.format("%U").to_string().parse().unwrap_or_default();

        let mut row = Row::new();
        row.insert("date".into(), Value::Date(date));
        row.insert("date_string".into(), Value::String(date.format("%Y-%m-%d").to_string()));
        row.insert("day".into(), Value::Int(i64::from(date.day())));
        row.insert("day_name".into(), Value::String(date.format("%a").to_string()));
        row.insert(
            "day_of_week".into(),
            Value::Int(i64::from(date.weekday().number_from_monday())),
        );
        row.insert("week".into(), Value::Int(week));
        row.insert("full_week".into(), Value::String(date.format("%Y-%U").to_string()));
        row.insert("month".into(), Value::Int(i64::from(date.month())));
        row.insert("month_name".into(), Value::String(date.format("%b").to_string()));
        row.insert("full_month".into(), Value::String(date.format("%Y-%m").to_string()));
        row.insert("quarter".into(), Value::Int(i64::from(quarter)));
        row.insert("quarter_name".into(), Value::String(format!("Q{}", quarter)));
        row.insert(
            "full_quarter".into(),
            Value::String(format!("{}-{}", date.year(), quarter)),
        );
        row.insert("year".into(), Value::Int(i64::from(date.year())));
        row
    }
}

fn date_param(params: &BTreeMap<String, serde_json::Value>, name: &str) -> Result<NaiveDate, String> {
    let raw = params
        .get(name)
        .and_then(|v| v.as_str())
        .ok_or_else(|| format!("missing '{}' parameter (YYYY-MM-DD)", name))?;

    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .map_err(|e| format!("invalid '{}' parameter '{}': {}", name, raw, e))
}

impl RowGenerator for CalendarGenerator {
    fn name(&self) -> &str {
        "calendar"
    }

    fn generate(&self, params: &BTreeMap<String, serde_json::Value>) -> Result<Vec<Row>, String> {
        let start = date_param(params, "start")?;
        let end = date_param(params, "end")?;

        if end < start {
            return Err(format!("end {} is before start {}", end, start));
        }
        let days = (end - start).num_days() + 1;
        if days > MAX_DAYS {
            return Err(format!("range of {} days is too large", days));
        }

        Ok(start
            .iter_days()
            .take_while(|date| *date <= end)
            .map(Self::day_row)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(start: &str, end: &str) -> BTreeMap<String, serde_json::Value> {
        BTreeMap::from([
            ("start".to_string(), serde_json::json!(start)),
            ("end".to_string(), serde_json::json!(end)),
        ])
    }

    #[test]
    fn day_fields() {
        let row = CalendarGenerator::day_row(NaiveDate::from_ymd_opt(2024, 5, 15).unwrap());

        assert_eq!(row.get("date_string"), Some(&Value::from("2024-05-15")));
        assert_eq!(row.get("day"), Some(&Value::Int(15)));
        assert_eq!(row.get("day_name"), Some(&Value::from("Wed")));
        assert_eq!(row.get("day_of_week"), Some(&Value::Int(3)));
        assert_eq!(row.get("month_name"), Some(&Value::from("May")));
        assert_eq!(row.get("full_month"), Some(&Value::from("2024-05")));
        assert_eq!(row.get("quarter"), Some(&Value::Int(2)));
        assert_eq!(row.get("quarter_name"), Some(&Value::from("Q2")));
        assert_eq!(row.get("full_quarter"), Some(&Value::from("2024-2")));
        assert_eq!(row.get("year"), Some(&Value::Int(2024)));
    }

    #[test]
    fn inclusive_range() {
        let rows = CalendarGenerator
            .generate(&params("2023-12-30", "2024-01-02"))
            .unwrap();
        assert_eq!(rows.len(), 4);
        assert_eq!(rows[3].get("year"), Some(&Value::Int(2024)));
    }

    #[test]
    fn invalid_ranges() {
        assert!(CalendarGenerator
            .generate(&params("2024-01-02", "2024-01-01"))
            .is_err());
        assert!(CalendarGenerator.generate(&params("2024-01-01", "soon")).is_err());
        assert!(CalendarGenerator.generate(&BTreeMap::new()).is_err());
    }
}
