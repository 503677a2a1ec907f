//! Funnel - daily signup-status counts per city
//!
//! Every row carries a signup status. Statuses are grouped into three stages
//! (not signed up yet, already a member, new recruit) and summed per check-in
//! date and city. A second view compares new recruits of the last full week
//! with the week before it.

use crate::error::{EngineError, Result};
use crate::normalize::{normalize, CanonicalTable, FieldMapping, HeaderAliases, NormalizeReport};
use crate::rank::pct_change;
use crate::reconcile::{default_decimals, DateWindow};
use crate::round_to;
use crate::table::Table;
use chrono::{Datelike, Duration, NaiveDate};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{info, warn};

const TOTAL_LABEL: &str = "Total";

fn default_city_dim() -> String {
    "city".to_string()
}

fn default_status_dim() -> String {
    "status".to_string()
}

// =============================================================================
// Status buckets
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    NotSignedUp,
    Member,
    NewRecruit,
}

/// Status spellings per stage; matched ignoring case and surrounding spaces
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusBuckets {
    pub not_signed_up: Vec<String>,
    pub members: Vec<String>,
    pub new_recruits: Vec<String>,
}

impl Default for StatusBuckets {
    fn default() -> Self {
        let owned = |values: &[&str]| values.iter().map(|s| s.to_string()).collect();
        Self {
            not_signed_up: owned(&["Chưa Sign-up"]),
            members: owned(&["Đã Sign-up từ trước"]),
            new_recruits: owned(&[
                "Sign-up sau C/I",
                "Sign up trước 1 ngày check in",
                "Sign up trước 2 ngày check in",
            ]),
        }
    }
}

impl StatusBuckets {
    pub fn stage_of(&self, status: &str) -> Option<Stage> {
        let wanted = status.trim().to_lowercase();
        let hit = |values: &[String]| values.iter().any(|v| v.trim().to_lowercase() == wanted);
        if hit(&self.not_signed_up) {
            Some(Stage::NotSignedUp)
        } else if hit(&self.members) {
            Some(Stage::Member)
        } else if hit(&self.new_recruits) {
            Some(Stage::NewRecruit)
        } else {
            None
        }
    }
}

// =============================================================================
// Configuration
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunnelConfig {
    /// Must map the city and status dimensions; count defaults to 1 per row
    pub mapping: FieldMapping,
    #[serde(default = "default_city_dim")]
    pub city_dim: String,
    #[serde(default = "default_status_dim")]
    pub status_dim: String,
    #[serde(default)]
    pub buckets: StatusBuckets,
    /// City columns in report order; empty reports every city seen
    #[serde(default)]
    pub cities: Vec<String>,
    /// Window of the daily table (the weekly view uses every row)
    #[serde(default)]
    pub window: DateWindow,
    #[serde(default = "default_decimals")]
    pub decimals: u32,
}

impl FunnelConfig {
    /// Signup export with a status column: check-in date by name, signup
    /// count in the fifth column.
    pub fn signup_status() -> Self {
        Self {
            mapping: FieldMapping::new("signups", "hotel_short_name", "checkin")
                .count(4)
                .dim("city", "city")
                .dim("status", "Sign up status v2"),
            city_dim: default_city_dim(),
            status_dim: default_status_dim(),
            buckets: StatusBuckets::default(),
            cities: vec!["HCM".to_string(), "HN".to_string(), "DN".to_string()],
            window: DateWindow::default(),
            decimals: default_decimals(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        self.window.validate()?;
        let dims = self.mapping.dim_names();
        for dim in [&self.city_dim, &self.status_dim] {
            if !dims.contains(dim) {
                return Err(EngineError::UnknownDimension {
                    dim: dim.clone(),
                    available: dims,
                });
            }
        }
        Ok(())
    }

    /// Normalize `table` and build both funnel views.
    ///
    /// `report_date` anchors the weekly view: the last full Monday-Sunday
    /// week before it is compared with the week before that.
    pub fn run(&self, table: &Table, report_date: NaiveDate) -> Result<FunnelOutput> {
        self.validate()?;
        let canonical = normalize(table, &self.mapping, &HeaderAliases::default())?;
        let daily = daily_funnel(&canonical, self)?;
        let week_over_week = new_recruit_wow(&canonical, self, report_date)?;
        Ok(FunnelOutput {
            daily,
            week_over_week,
            report: canonical.report,
        })
    }
}

// =============================================================================
// Daily funnel
// =============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FunnelCell {
    pub city: String,
    pub not_signed_up: f64,
    pub members: f64,
    pub new_recruits: f64,
}

impl FunnelCell {
    fn add(&mut self, stage: Stage, count: f64) {
        match stage {
            Stage::NotSignedUp => self.not_signed_up += count,
            Stage::Member => self.members += count,
            Stage::NewRecruit => self.new_recruits += count,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FunnelDay {
    pub date: NaiveDate,
    /// One cell per reported city, zero-filled
    pub cities: Vec<FunnelCell>,
    /// New recruits over every city, reported or not
    pub total_new_recruits: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Funnel {
    pub cities: Vec<String>,
    pub days: Vec<FunnelDay>,
    /// Rows whose status is in no bucket
    pub unmatched_status: usize,
    pub outside_window: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FunnelOutput {
    pub daily: Funnel,
    pub week_over_week: WeekOverWeek,
    pub report: NormalizeReport,
}

/// Per-date, per-city stage totals; every date with a row in the window gets a line.
pub fn daily_funnel(table: &CanonicalTable, config: &FunnelConfig) -> Result<Funnel> {
    let city_idx = table.dim_index(&config.city_dim)?;
    let status_idx = table.dim_index(&config.status_dim)?;

    let mut cells: BTreeMap<(NaiveDate, &str), FunnelCell> = BTreeMap::new();
    let mut dates = BTreeSet::new();
    let mut seen_cities = BTreeSet::new();
    let mut unmatched_status = 0;
    let mut outside_window = 0;

    for row in &table.rows {
        if !config.window.contains(row.date) {
            outside_window += 1;
            continue;
        }
        dates.insert(row.date);
        let city = row.dims[city_idx].as_str();
        seen_cities.insert(city);
        match config.buckets.stage_of(&row.dims[status_idx]) {
            Some(stage) => cells
                .entry((row.date, city))
                .or_default()
                .add(stage, row.count),
            None => unmatched_status += 1,
        }
    }

    if unmatched_status > 0 {
        warn!(rows = unmatched_status, "Rows with a status outside every funnel stage");
    }

    let cities: Vec<String> = if config.cities.is_empty() {
        seen_cities.iter().map(|c| c.to_string()).collect()
    } else {
        config.cities.clone()
    };

    let days = dates
        .into_iter()
        .map(|date| {
            let row_cells = cities
                .iter()
                .map(|city| FunnelCell {
                    city: city.clone(),
                    ..cells.get(&(date, city.as_str())).cloned().unwrap_or_default()
                })
                .collect();
            let total_new_recruits = cells
                .range((date, "")..)
                .take_while(|((d, _), _)| *d == date)
                .map(|(_, cell)| cell.new_recruits)
                .sum();
            FunnelDay {
                date,
                cities: row_cells,
                total_new_recruits,
            }
        })
        .collect::<Vec<_>>();

    info!(days = days.len(), cities = cities.len(), "Built daily funnel");

    Ok(Funnel {
        cities,
        days,
        unmatched_status,
        outside_window,
    })
}

// =============================================================================
// Week over week
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WeekOverWeekRow {
    pub city: String,
    pub prev_week: f64,
    pub last_week: f64,
    /// Rounded; undefined when the earlier week had none
    pub pct_change: Option<f64>,
}

impl WeekOverWeekRow {
    fn new(city: String, prev_week: f64, last_week: f64, decimals: u32) -> Self {
        Self {
            city,
            prev_week,
            last_week,
            pct_change: pct_change(Some(prev_week), Some(last_week)).map(|p| round_to(p, decimals)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WeekOverWeek {
    pub prev_week: DateWindow,
    pub last_week: DateWindow,
    pub rows: Vec<WeekOverWeekRow>,
    pub total: WeekOverWeekRow,
}

/// The last full Monday-Sunday week strictly before `report_date`, and the
/// week before it, as `(prev, last)`.
pub fn report_weeks(report_date: NaiveDate) -> (DateWindow, DateWindow) {
    let days_since_monday = i64::from(report_date.weekday().num_days_from_monday());
    let last_end = report_date - Duration::days(days_since_monday + 1);
    let last_start = last_end - Duration::days(6);
    let prev_end = last_start - Duration::days(1);
    let prev_start = prev_end - Duration::days(6);
    (
        DateWindow::new(prev_start, prev_end),
        DateWindow::new(last_start, last_end),
    )
}

/// New recruits per city in the two weeks before `report_date`.
pub fn new_recruit_wow(
    table: &CanonicalTable,
    config: &FunnelConfig,
    report_date: NaiveDate,
) -> Result<WeekOverWeek> {
    let city_idx = table.dim_index(&config.city_dim)?;
    let status_idx = table.dim_index(&config.status_dim)?;
    let (prev_week, last_week) = report_weeks(report_date);

    let mut sums: BTreeMap<&str, (f64, f64)> = BTreeMap::new();
    for row in &table.rows {
        if config.buckets.stage_of(&row.dims[status_idx]) != Some(Stage::NewRecruit) {
            continue;
        }
        let city = row.dims[city_idx].as_str();
        if prev_week.contains(row.date) {
            sums.entry(city).or_default().0 += row.count;
        } else if last_week.contains(row.date) {
            sums.entry(city).or_default().1 += row.count;
        }
    }

    let (prev_total, last_total) = sums
        .values()
        .fold((0.0, 0.0), |(p, l), (dp, dl)| (p + dp, l + dl));
    let rows = sums
        .into_iter()
        .map(|(city, (prev, last))| WeekOverWeekRow::new(city.to_string(), prev, last, config.decimals))
        .collect();

    Ok(WeekOverWeek {
        prev_week,
        last_week,
        rows,
        total: WeekOverWeekRow::new(TOTAL_LABEL.to_string(), prev_total, last_total, config.decimals),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::Value;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    /// hotel, city, checkin, status, signups
    fn signups(rows: &[(&str, &str, &str, &str, i64)]) -> Table {
        Table::new(
            ["hotel_short_name", "city", "checkin", "Sign up status v2", "signups"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            rows.iter()
                .map(|&(h, c, date, status, n)| {
                    vec![
                        Value::from(h),
                        Value::from(c),
                        Value::from(date),
                        Value::from(status),
                        Value::from(n),
                    ]
                })
                .collect(),
        )
    }

    fn cell<'a>(day: &'a FunnelDay, city: &str) -> &'a FunnelCell {
        day.cities.iter().find(|c| c.city == city).unwrap()
    }

    // -------------------------------------------------------------------------
    // BUCKETS
    // -------------------------------------------------------------------------

    #[test]
    fn test_stage_matching_ignores_case_and_spaces() {
        let buckets = StatusBuckets::default();
        assert_eq!(buckets.stage_of(" chưa sign-up "), Some(Stage::NotSignedUp));
        assert_eq!(buckets.stage_of("Đã Sign-up từ trước"), Some(Stage::Member));
        assert_eq!(buckets.stage_of("SIGN-UP SAU C/I"), Some(Stage::NewRecruit));
        assert_eq!(buckets.stage_of("Grand Total"), None);
    }

    // -------------------------------------------------------------------------
    // DAILY FUNNEL
    // -------------------------------------------------------------------------

    #[test]
    fn test_daily_funnel_per_city_and_stage() {
        let table = signups(&[
            ("A", "HCM", "May 19, 2025", "Chưa Sign-up", 3),
            ("A", "HCM", "May 19, 2025", "Sign-up sau C/I", 2),
            ("B", "HCM", "May 19, 2025", "Sign up trước 1 ngày check in", 1),
            ("C", "HN", "May 19, 2025", "Đã Sign-up từ trước", 4),
            ("D", "PQ", "May 19, 2025", "Sign-up sau C/I", 5),
            ("A", "HCM", "May 20, 2025", "Chưa Sign-up", 1),
            ("A", "HCM", "Total", "Chưa Sign-up", 99),
            ("A", "DN", "May 20, 2025", "Unknown status", 7),
        ]);
        let out = FunnelConfig::signup_status().run(&table, d(2025, 5, 26)).unwrap();
        let funnel = &out.daily;

        assert_eq!(funnel.cities, vec!["HCM", "HN", "DN"]);
        assert_eq!(funnel.days.len(), 2);
        assert_eq!(funnel.unmatched_status, 1);
        assert_eq!(out.report.dropped_invalid_date, 1);

        let first = &funnel.days[0];
        assert_eq!(first.date, d(2025, 5, 19));
        let hcm = cell(first, "HCM");
        assert_eq!((hcm.not_signed_up, hcm.members, hcm.new_recruits), (3.0, 0.0, 3.0));
        assert_eq!(cell(first, "HN").members, 4.0);
        assert_eq!(cell(first, "DN"), &FunnelCell { city: "DN".to_string(), ..Default::default() });
        // PQ is not a reported column but still counts in the total
        assert_eq!(first.total_new_recruits, 8.0);

        let second = &funnel.days[1];
        assert_eq!(cell(second, "HCM").not_signed_up, 1.0);
        assert_eq!(second.total_new_recruits, 0.0);
    }

    #[test]
    fn test_daily_funnel_lists_every_city_when_unconfigured() {
        let table = signups(&[
            ("A", "HN", "2025-05-19", "Chưa Sign-up", 1),
            ("B", "DN", "2025-05-19", "Chưa Sign-up", 1),
        ]);
        let mut config = FunnelConfig::signup_status();
        config.cities.clear();
        let out = config.run(&table, d(2025, 5, 26)).unwrap();
        assert_eq!(out.daily.cities, vec!["DN", "HN"]);
    }

    #[test]
    fn test_daily_funnel_window() {
        let table = signups(&[
            ("A", "HCM", "2025-05-18", "Chưa Sign-up", 1),
            ("A", "HCM", "2025-05-19", "Chưa Sign-up", 1),
        ]);
        let mut config = FunnelConfig::signup_status();
        config.window = DateWindow::new(d(2025, 5, 19), d(2025, 5, 25));
        let out = config.run(&table, d(2025, 5, 26)).unwrap();
        assert_eq!(out.daily.days.len(), 1);
        assert_eq!(out.daily.outside_window, 1);
    }

    #[test]
    fn test_missing_status_dimension_rejected() {
        let mut config = FunnelConfig::signup_status();
        config.status_dim = "segment".to_string();
        assert!(matches!(
            config.validate(),
            Err(EngineError::UnknownDimension { dim, .. }) if dim == "segment"
        ));
    }

    // -------------------------------------------------------------------------
    // WEEK OVER WEEK
    // -------------------------------------------------------------------------

    #[test]
    fn test_report_weeks_are_full_weeks_before_report_date() {
        // Wednesday 2025-05-28
        let (prev, last) = report_weeks(d(2025, 5, 28));
        assert_eq!(last, DateWindow::new(d(2025, 5, 19), d(2025, 5, 25)));
        assert_eq!(prev, DateWindow::new(d(2025, 5, 12), d(2025, 5, 18)));

        // a Monday report still looks at the week that just ended
        let (_, last) = report_weeks(d(2025, 5, 26));
        assert_eq!(last, DateWindow::new(d(2025, 5, 19), d(2025, 5, 25)));
    }

    #[test]
    fn test_new_recruit_week_over_week() {
        let table = signups(&[
            ("A", "HCM", "2025-05-12", "Sign-up sau C/I", 4),
            ("A", "HCM", "2025-05-20", "Sign-up sau C/I", 6),
            ("B", "HN", "2025-05-21", "Sign up trước 2 ngày check in", 3),
            ("C", "HCM", "2025-05-20", "Chưa Sign-up", 50),
            ("C", "HCM", "2025-05-27", "Sign-up sau C/I", 50),
        ]);
        let wow = FunnelConfig::signup_status()
            .run(&table, d(2025, 5, 28))
            .unwrap()
            .week_over_week;

        assert_eq!(wow.rows.len(), 2);
        let hcm = &wow.rows[0];
        assert_eq!((hcm.city.as_str(), hcm.prev_week, hcm.last_week), ("HCM", 4.0, 6.0));
        assert_eq!(hcm.pct_change, Some(50.0));

        let hn = &wow.rows[1];
        assert_eq!((hn.prev_week, hn.last_week), (0.0, 3.0));
        assert_eq!(hn.pct_change, None);

        assert_eq!(wow.total.city, "Total");
        assert_eq!((wow.total.prev_week, wow.total.last_week), (4.0, 9.0));
        assert_eq!(wow.total.pct_change, Some(125.0));
    }
}
