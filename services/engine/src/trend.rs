//! Trend - weekly counts, ranks and week-over-week movement per entity
//!
//! One summed source is bucketed into Monday-start weeks. Each week is dense
//! ranked on its own, and every row is compared with the same entity in the
//! calendar week right before it.

use crate::error::Result;
use crate::normalize::{normalize, CanonicalTable, FieldMapping, HeaderAliases, NormalizeReport, PeriodGrain};
use crate::rank::{dense_rank, pct_change};
use crate::reconcile::{default_decimals, DateWindow};
use crate::round_to;
use crate::table::Table;
use chrono::{Duration, NaiveDate};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tracing::info;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrendConfig {
    pub mapping: FieldMapping,
    /// Weeks to keep, matched on each week's Monday
    #[serde(default)]
    pub window: DateWindow,
    #[serde(default = "default_decimals")]
    pub decimals: u32,
}

impl TrendConfig {
    /// Signup export: hotel and city by name, date in the fifth column and
    /// signup count in the sixth.
    pub fn weekly_signups() -> Self {
        Self {
            mapping: FieldMapping::new("signups", "hotel_short_name", 4)
                .count(5)
                .dim("city", "city")
                .min_columns(6),
            window: DateWindow::default(),
            decimals: default_decimals(),
        }
    }

    pub fn run(&self, table: &Table) -> Result<TrendOutput> {
        self.window.validate()?;
        let canonical = normalize(table, &self.mapping, &HeaderAliases::default())?;
        let trend = weekly_trend(&canonical, self.window, self.decimals);
        Ok(TrendOutput {
            trend,
            report: canonical.report,
        })
    }
}

// =============================================================================
// Output
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrendRow {
    pub week: NaiveDate,
    pub entity_key: String,
    pub entity_display: String,
    pub dims: Vec<String>,
    pub count: f64,
    /// Dense rank within the week, by count descending
    pub rank: u32,
    /// Count in the previous calendar week, when the entity had a row there
    pub prev_count: Option<f64>,
    pub pct_change: Option<f64>,
    /// Positive when the rank improved since the previous week
    pub rank_delta: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WeekTotal {
    pub week: NaiveDate,
    pub count: f64,
    pub entities: usize,
    pub pct_change: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Trend {
    pub dim_names: Vec<String>,
    pub weeks: Vec<NaiveDate>,
    /// Ordered by week, then rank, then entity key
    pub rows: Vec<TrendRow>,
    pub totals: Vec<WeekTotal>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrendOutput {
    pub trend: Trend,
    pub report: NormalizeReport,
}

impl Trend {
    pub fn latest_week(&self) -> Option<NaiveDate> {
        self.weeks.last().copied()
    }

    pub fn rows_in(&self, week: NaiveDate) -> impl Iterator<Item = &TrendRow> {
        self.rows.iter().filter(move |r| r.week == week)
    }

    fn latest_rows(&self) -> Vec<&TrendRow> {
        self.latest_week()
            .map(|week| self.rows_in(week).collect())
            .unwrap_or_default()
    }

    /// Latest-week rows with the largest rank improvement
    pub fn top_gainers(&self, n: usize) -> Vec<&TrendRow> {
        let mut rows: Vec<&TrendRow> = self
            .latest_rows()
            .into_iter()
            .filter(|r| r.rank_delta.map_or(false, |d| d > 0))
            .collect();
        rows.sort_by(|a, b| b.rank_delta.cmp(&a.rank_delta).then_with(|| a.entity_key.cmp(&b.entity_key)));
        rows.truncate(n);
        rows
    }

    /// Latest-week rows with the largest rank decline
    pub fn top_losers(&self, n: usize) -> Vec<&TrendRow> {
        let mut rows: Vec<&TrendRow> = self
            .latest_rows()
            .into_iter()
            .filter(|r| r.rank_delta.map_or(false, |d| d < 0))
            .collect();
        rows.sort_by(|a, b| a.rank_delta.cmp(&b.rank_delta).then_with(|| a.entity_key.cmp(&b.entity_key)));
        rows.truncate(n);
        rows
    }

    /// Percentage of latest-week rows with a previous week whose rank improved
    pub fn improving_share(&self) -> Option<f64> {
        let (total, improved) = self
            .latest_rows()
            .into_iter()
            .filter_map(|r| r.rank_delta)
            .fold((0usize, 0usize), |(t, i), d| (t + 1, i + usize::from(d > 0)));
        (total > 0).then(|| improved as f64 / total as f64 * 100.0)
    }

    /// Weekly totals per value of `dim`, as `(week, value, count)`
    pub fn totals_by(&self, dim: &str) -> Option<Vec<(NaiveDate, String, f64)>> {
        let idx = self.dim_names.iter().position(|d| d == dim)?;
        let mut sums: BTreeMap<(NaiveDate, &str), f64> = BTreeMap::new();
        for row in &self.rows {
            *sums.entry((row.week, row.dims[idx].as_str())).or_default() += row.count;
        }
        Some(
            sums.into_iter()
                .map(|((week, value), count)| (week, value.to_string(), count))
                .collect(),
        )
    }
}

// =============================================================================
// Build
// =============================================================================

type RowKey<'a> = (&'a str, Vec<&'a str>);

/// Sum `table` per entity, dims and week, then rank and compare week over week.
///
/// A derived period column on the table is ignored; weeks come from the row
/// dates directly.
pub fn weekly_trend(table: &CanonicalTable, window: DateWindow, decimals: u32) -> Trend {
    let period_idx = table
        .period_dim
        .as_deref()
        .and_then(|p| table.dim_names.iter().position(|d| d == p));
    let keep = |i: &usize| Some(*i) != period_idx;
    let dim_names: Vec<String> = (0..table.dim_names.len())
        .filter(keep)
        .map(|i| table.dim_names[i].clone())
        .collect();

    // week -> (key -> (display, count)); display is the first spelling seen
    let mut weekly: BTreeMap<NaiveDate, BTreeMap<RowKey, (&str, f64)>> = BTreeMap::new();
    for row in &table.rows {
        let week = PeriodGrain::Week.start_of(row.date);
        if !window.contains(week) {
            continue;
        }
        let dims = (0..row.dims.len())
            .filter(keep)
            .map(|i| row.dims[i].as_str())
            .collect();
        weekly
            .entry(week)
            .or_default()
            .entry((row.entity_key.as_str(), dims))
            .or_insert((row.entity_display.as_str(), 0.0))
            .1 += row.count;
    }

    let mut ranks: BTreeMap<NaiveDate, BTreeMap<&RowKey, u32>> = BTreeMap::new();
    for (week, entries) in &weekly {
        let values: Vec<Option<f64>> = entries.values().map(|(_, c)| Some(*c)).collect();
        ranks.insert(*week, entries.keys().zip(dense_rank(&values)).collect());
    }

    let mut rows = Vec::new();
    let mut totals = Vec::new();
    let mut prev_total: Option<f64> = None;
    let mut prev_week: Option<NaiveDate> = None;
    for (week, entries) in &weekly {
        let before = *week - Duration::days(7);
        let prior = weekly.get(&before);
        let prior_ranks = ranks.get(&before);

        for (key, (display, count)) in entries {
            let prev_count = prior.and_then(|p| p.get(key)).map(|(_, c)| *c);
            let rank = ranks.get(week).and_then(|r| r.get(key)).copied().unwrap_or_default();
            let prev_rank = prior_ranks.and_then(|r| r.get(key)).copied();
            rows.push(TrendRow {
                week: *week,
                entity_key: key.0.to_string(),
                entity_display: display.to_string(),
                dims: key.1.iter().map(|d| d.to_string()).collect(),
                count: *count,
                rank,
                prev_count,
                pct_change: pct_change(prev_count, Some(*count)).map(|p| round_to(p, decimals)),
                rank_delta: prev_rank.map(|p| i64::from(p) - i64::from(rank)),
            });
        }

        let count: f64 = entries.values().map(|(_, c)| c).sum();
        let baseline = prev_total.filter(|_| prev_week == Some(before));
        totals.push(WeekTotal {
            week: *week,
            count,
            entities: entries.keys().map(|k| k.0).collect::<BTreeSet<_>>().len(),
            pct_change: pct_change(baseline, Some(count)).map(|p| round_to(p, decimals)),
        });
        prev_total = Some(count);
        prev_week = Some(*week);
    }

    rows.sort_by(|a, b| {
        a.week
            .cmp(&b.week)
            .then(a.rank.cmp(&b.rank))
            .then_with(|| a.entity_key.cmp(&b.entity_key))
            .then_with(|| a.dims.cmp(&b.dims))
    });

    let weeks: Vec<NaiveDate> = weekly.keys().copied().collect();
    info!(weeks = weeks.len(), rows = rows.len(), "Built weekly trend");

    Trend {
        dim_names,
        weeks,
        rows,
        totals,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::Value;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    /// hotel, city, date, signups (laid out like the signup export)
    fn signups(rows: &[(&str, &str, &str, i64)]) -> Table {
        Table::new(
            ["hotel_short_name", "city", "brand", "segment", "date", "signups"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            rows.iter()
                .map(|&(h, c, date, n)| {
                    vec![
                        Value::from(h),
                        Value::from(c),
                        Value::from("B"),
                        Value::from("S"),
                        Value::from(date),
                        Value::from(n),
                    ]
                })
                .collect(),
        )
    }

    fn run(table: &Table) -> Trend {
        TrendConfig::weekly_signups().run(table).unwrap().trend
    }

    fn row<'a>(trend: &'a Trend, week: NaiveDate, key: &str) -> &'a TrendRow {
        trend
            .rows
            .iter()
            .find(|r| r.week == week && r.entity_key == key)
            .unwrap()
    }

    // -------------------------------------------------------------------------
    // WEEKLY BUCKETS
    // -------------------------------------------------------------------------

    #[test]
    fn test_rows_summed_into_monday_weeks() {
        let trend = run(&signups(&[
            ("Hotel A", "HCM", "2025-05-12", 2),
            ("hotel a", "HCM", "2025-05-18", 3),
            ("Hotel A", "HCM", "2025-05-19", 1),
        ]));
        assert_eq!(trend.weeks, vec![d(2025, 5, 12), d(2025, 5, 19)]);
        assert_eq!(trend.dim_names, vec!["city"]);
        let first = row(&trend, d(2025, 5, 12), "hotel a");
        assert_eq!(first.count, 5.0);
        assert_eq!(first.entity_display, "Hotel A");
        assert_eq!(first.dims, vec!["HCM"]);
    }

    #[test]
    fn test_each_week_ranked_separately() {
        let trend = run(&signups(&[
            ("A", "HCM", "2025-05-12", 5),
            ("B", "HN", "2025-05-12", 5),
            ("C", "HN", "2025-05-12", 1),
            ("C", "HN", "2025-05-19", 9),
            ("A", "HCM", "2025-05-19", 4),
        ]));
        let ranks: Vec<(&str, u32)> = trend
            .rows_in(d(2025, 5, 12))
            .map(|r| (r.entity_key.as_str(), r.rank))
            .collect();
        assert_eq!(ranks, vec![("a", 1), ("b", 1), ("c", 2)]);
        assert_eq!(row(&trend, d(2025, 5, 19), "c").rank, 1);
        assert_eq!(row(&trend, d(2025, 5, 19), "a").rank, 2);
    }

    #[test]
    fn test_week_window_applies_to_week_start() {
        let mut config = TrendConfig::weekly_signups();
        config.window = DateWindow::new(d(2025, 5, 19), d(2025, 5, 25));
        let trend = config
            .run(&signups(&[
                ("A", "HCM", "2025-05-18", 1),
                ("A", "HCM", "2025-05-21", 1),
            ]))
            .unwrap()
            .trend;
        assert_eq!(trend.weeks, vec![d(2025, 5, 19)]);
    }

    // -------------------------------------------------------------------------
    // WEEK OVER WEEK
    // -------------------------------------------------------------------------

    #[test]
    fn test_week_over_week_change_and_rank_movement() {
        let trend = run(&signups(&[
            ("A", "HCM", "2025-05-12", 4),
            ("B", "HN", "2025-05-12", 8),
            ("A", "HCM", "2025-05-19", 10),
            ("B", "HN", "2025-05-19", 6),
            ("C", "DN", "2025-05-19", 1),
        ]));
        let a = row(&trend, d(2025, 5, 19), "a");
        assert_eq!(a.prev_count, Some(4.0));
        assert_eq!(a.pct_change, Some(150.0));
        assert_eq!(a.rank_delta, Some(1));

        let b = row(&trend, d(2025, 5, 19), "b");
        assert_eq!(b.pct_change, Some(-25.0));
        assert_eq!(b.rank_delta, Some(-1));

        let c = row(&trend, d(2025, 5, 19), "c");
        assert_eq!((c.prev_count, c.pct_change, c.rank_delta), (None, None, None));

        // first week has nothing to compare with
        assert!(trend.rows_in(d(2025, 5, 12)).all(|r| r.rank_delta.is_none()));

        assert_eq!(trend.top_gainers(5).iter().map(|r| r.entity_key.as_str()).collect::<Vec<_>>(), vec!["a"]);
        assert_eq!(trend.top_losers(5).iter().map(|r| r.entity_key.as_str()).collect::<Vec<_>>(), vec!["b"]);
        assert_eq!(trend.improving_share(), Some(50.0));
    }

    #[test]
    fn test_gap_week_is_not_a_baseline() {
        let trend = run(&signups(&[
            ("A", "HCM", "2025-05-05", 4),
            ("A", "HCM", "2025-05-19", 8),
        ]));
        let latest = row(&trend, d(2025, 5, 19), "a");
        assert_eq!(latest.prev_count, None);
        assert_eq!(latest.pct_change, None);
        assert_eq!(trend.totals[1].pct_change, None);
        assert_eq!(trend.improving_share(), None);
    }

    #[test]
    fn test_weekly_totals_and_city_breakdown() {
        let trend = run(&signups(&[
            ("A", "HCM", "2025-05-12", 4),
            ("B", "HN", "2025-05-12", 4),
            ("A", "HCM", "2025-05-19", 6),
            ("B", "HN", "2025-05-19", 0),
            ("C", "HN", "2025-05-19", 3),
        ]));
        assert_eq!(trend.totals.len(), 2);
        assert_eq!(trend.totals[0].count, 8.0);
        assert_eq!(trend.totals[0].pct_change, None);
        assert_eq!(trend.totals[1].count, 9.0);
        assert_eq!(trend.totals[1].entities, 3);
        assert_eq!(trend.totals[1].pct_change, Some(12.5));

        let by_city = trend.totals_by("city").unwrap();
        assert_eq!(
            by_city,
            vec![
                (d(2025, 5, 12), "HCM".to_string(), 4.0),
                (d(2025, 5, 12), "HN".to_string(), 4.0),
                (d(2025, 5, 19), "HCM".to_string(), 6.0),
                (d(2025, 5, 19), "HN".to_string(), 3.0),
            ]
        );
        assert!(trend.totals_by("segment").is_none());
    }

    #[test]
    fn test_empty_table_has_no_latest_week() {
        let trend = run(&signups(&[]));
        assert!(trend.weeks.is_empty());
        assert_eq!(trend.latest_week(), None);
        assert!(trend.top_gainers(5).is_empty());
    }
}
