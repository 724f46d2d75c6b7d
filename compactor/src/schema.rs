// Copyright 2023 Timberline Project Authors. Licensed under Apache-2.0.

//! Schema periods and daily table naming.

use common_util::{
    define_result,
    time::{TimeRange, Timestamp},
};
use serde::{Deserialize, Serialize};
use snafu::{Backtrace, OptionExt, Snafu};

/// Milliseconds covered by one daily table.
pub const TABLE_PERIOD_MS: i64 = 24 * 60 * 60 * 1_000;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Schema for time not found, time:{}.\nBacktrace:\n{}", time, backtrace))]
    SchemaNotFound {
        time: Timestamp,
        backtrace: Backtrace,
    },
}

define_result!(Error);

/// One schema period: from `from` onwards tables carry `table_prefix`, are
/// stored under `index_prefix` and use the `index_type` format plug-in.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PeriodConfig {
    pub from: Timestamp,
    pub index_type: String,
    pub object_type: String,
    pub index_prefix: String,
    pub table_prefix: String,
}

impl Default for PeriodConfig {
    fn default() -> Self {
        Self {
            from: Timestamp::ZERO,
            index_type: "plain".to_string(),
            object_type: "filesystem".to_string(),
            index_prefix: "index/".to_string(),
            table_prefix: "index_".to_string(),
        }
    }
}

impl PeriodConfig {
    /// Name of the table holding `time`.
    pub fn table_for(&self, time: Timestamp) -> String {
        format!("{}{}", self.table_prefix, time.as_i64() / TABLE_PERIOD_MS)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchemaConfig {
    /// Periods sorted by `from`; the latest period whose `from` is not after
    /// a given time applies.
    pub periods: Vec<PeriodConfig>,
}

impl SchemaConfig {
    pub fn single(period: PeriodConfig) -> Self {
        Self {
            periods: vec![period],
        }
    }

    pub fn schema_for_time(&self, time: Timestamp) -> Result<&PeriodConfig> {
        self.periods
            .iter()
            .filter(|p| p.from <= time)
            .max_by_key(|p| p.from)
            .context(SchemaNotFound { time })
    }

    /// Resolve the period a table belongs to. `None` when no period claims the
    /// table, i.e. the table name does not round-trip through the period's
    /// naming scheme.
    pub fn schema_period_for_table(&self, table_name: &str) -> Option<&PeriodConfig> {
        let interval = extract_interval_from_table_name(table_name);
        let period = self.schema_for_time(interval.start()).ok()?;
        if period.table_for(interval.start()) == table_name {
            Some(period)
        } else {
            None
        }
    }
}

/// The day interval encoded in a table name. Unparseable names map to the
/// full time range so they sort oldest and never match a schema period.
pub fn extract_interval_from_table_name(table_name: &str) -> TimeRange {
    let digits = table_name
        .chars()
        .rev()
        .take_while(|c| c.is_ascii_digit())
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .collect::<String>();

    match digits.parse::<i64>() {
        Ok(day) if !digits.is_empty() => {
            let start = day * TABLE_PERIOD_MS;
            TimeRange::new_unchecked(
                Timestamp::new(start),
                Timestamp::new(start + TABLE_PERIOD_MS),
            )
        }
        _ => TimeRange::min_to_max(),
    }
}

/// Sort table names most recent first by the interval encoded in the name.
pub fn sort_tables_newest_first(tables: &mut [String]) {
    tables.sort_by_key(|t| std::cmp::Reverse(extract_interval_from_table_name(t).start()));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_naming_roundtrip() {
        let period = PeriodConfig::default();
        let time = Timestamp::new(19_723 * TABLE_PERIOD_MS + 42);
        let table = period.table_for(time);
        assert_eq!("index_19723", table);

        let interval = extract_interval_from_table_name(&table);
        assert_eq!(Timestamp::new(19_723 * TABLE_PERIOD_MS), interval.start());
        assert_eq!(
            Timestamp::new(19_724 * TABLE_PERIOD_MS),
            interval.end()
        );
        assert!(interval.contains(time));
    }

    #[test]
    fn test_extract_interval_unparseable() {
        assert_eq!(
            TimeRange::min_to_max(),
            extract_interval_from_table_name("not-a-table")
        );
    }

    #[test]
    fn test_sort_newest_first() {
        let mut tables = vec![
            "index_19721".to_string(),
            "index_19723".to_string(),
            "garbage".to_string(),
            "index_19722".to_string(),
        ];
        sort_tables_newest_first(&mut tables);
        assert_eq!(
            vec!["index_19723", "index_19722", "index_19721", "garbage"],
            tables
        );
    }

    #[test]
    fn test_schema_period_resolution() {
        let old = PeriodConfig {
            from: Timestamp::ZERO,
            table_prefix: "old_".to_string(),
            ..Default::default()
        };
        let new = PeriodConfig {
            from: Timestamp::new(19_000 * TABLE_PERIOD_MS),
            table_prefix: "index_".to_string(),
            ..Default::default()
        };
        let schema = SchemaConfig {
            periods: vec![old, new],
        };

        assert_eq!(
            "old_",
            schema
                .schema_for_time(Timestamp::new(100))
                .unwrap()
                .table_prefix
        );
        assert_eq!(
            "index_",
            schema
                .schema_period_for_table("index_19723")
                .unwrap()
                .table_prefix
        );
        // Table named with the wrong prefix for its period resolves to none.
        assert!(schema.schema_period_for_table("old_19723").is_none());
        assert!(schema.schema_period_for_table("garbage").is_none());
    }
}
