//! Reconciler - joins the distinct-count source with the summed source
//!
//! The primary source (e.g. reservations) is aggregated by entity key and
//! dimensions into a distinct subject count; the secondary source (e.g.
//! signups) is summed per entity key (plus any join dimensions). The join is
//! anchored on the primary side; secondary-only keys are orphans.

use crate::error::{EngineError, Result};
use crate::normalize::{CanonicalRow, CanonicalTable};
use crate::{round_to, UNKNOWN_DIM};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info, warn};

// =============================================================================
// Options
// =============================================================================

/// Inclusive calendar-date window; an open bound matches everything on that side
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateWindow {
    #[serde(default)]
    pub from: Option<NaiveDate>,
    #[serde(default)]
    pub to: Option<NaiveDate>,
}

impl DateWindow {
    pub fn new(from: NaiveDate, to: NaiveDate) -> Self {
        Self {
            from: Some(from),
            to: Some(to),
        }
    }

    pub fn unbounded() -> Self {
        Self::default()
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        self.from.map_or(true, |from| date >= from) && self.to.map_or(true, |to| date <= to)
    }

    pub fn validate(&self) -> Result<()> {
        match (self.from, self.to) {
            (Some(from), Some(to)) if from > to => Err(EngineError::InvalidConfig(format!(
                "date window starts after it ends ({} > {})",
                from, to
            ))),
            _ => Ok(()),
        }
    }
}

/// Treatment of entities present only in the secondary source
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrphanPolicy {
    /// Keep them out of the main table (still listed in `orphans`)
    #[default]
    Drop,
    /// Also add them to the main table with primary_count = 0
    Include,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcileOptions {
    #[serde(default)]
    pub window: DateWindow,
    /// Dimensions joined in addition to the entity key
    #[serde(default)]
    pub join_dims: Vec<String>,
    #[serde(default)]
    pub orphans: OrphanPolicy,
    /// Decimal places of `ratio_percent`
    #[serde(default = "default_decimals")]
    pub decimals: u32,
}

pub(crate) fn default_decimals() -> u32 {
    2
}

impl Default for ReconcileOptions {
    fn default() -> Self {
        Self {
            window: DateWindow::default(),
            join_dims: Vec::new(),
            orphans: OrphanPolicy::Drop,
            decimals: default_decimals(),
        }
    }
}

// =============================================================================
// Output
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReconciledRow {
    pub entity_key: String,
    pub entity_display: String,
    pub dims: Vec<String>,
    pub primary_count: u64,
    pub secondary_count: f64,
    /// secondary / primary; `None` when primary_count is 0
    pub ratio: Option<f64>,
    /// `ratio * 100`, rounded
    pub ratio_percent: Option<f64>,
    /// ratio above 100%, judged on the unrounded ratio: a row shown as
    /// `100.00` can still be flagged
    pub anomaly: bool,
    pub is_orphan: bool,
}

/// A secondary-source key with no primary-source counterpart in the window
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OrphanRow {
    pub entity_key: String,
    pub entity_display: String,
    /// Values of the join dimensions, in `join_dims` order
    pub join_values: Vec<String>,
    pub secondary_count: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    pub primary_outside_window: usize,
    pub secondary_outside_window: usize,
    pub secondary_empty: bool,
    pub anomalies: usize,
    pub orphans: usize,
    /// Secondary keys whose sum was attached to more than one primary row.
    /// Such a sum is counted once in the overview but once in every group
    /// rollup it lands in, so per-group totals can add up to more.
    pub fanned_out_keys: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Reconciled {
    pub dim_names: Vec<String>,
    pub period_dim: Option<String>,
    pub join_dims: Vec<String>,
    pub rows: Vec<ReconciledRow>,
    pub orphans: Vec<OrphanRow>,
    pub report: ReconcileReport,
}

impl Reconciled {
    pub fn anomalies(&self) -> impl Iterator<Item = &ReconciledRow> {
        self.rows.iter().filter(|r| r.anomaly)
    }

    pub fn dim_index(&self, dim: &str) -> Result<usize> {
        self.dim_names
            .iter()
            .position(|d| d == dim)
            .ok_or_else(|| EngineError::UnknownDimension {
                dim: dim.to_string(),
                available: self.dim_names.clone(),
            })
    }

    /// Join key of a row: entity key plus the join-dimension values
    pub(crate) fn join_key(&self, row: &ReconciledRow) -> (String, Vec<String>) {
        let values = self
            .join_dims
            .iter()
            .filter_map(|d| self.dim_names.iter().position(|n| n == d))
            .map(|i| row.dims[i].clone())
            .collect();
        (row.entity_key.clone(), values)
    }
}

// =============================================================================
// Reconcile
// =============================================================================

type GroupKey = (String, Vec<String>);

#[derive(Default)]
struct PrimaryGroup {
    subjects: BTreeSet<String>,
    rows: u64,
}

fn dim_indices(table: &CanonicalTable, dims: &[String]) -> Result<Vec<usize>> {
    dims.iter().map(|d| table.dim_index(d)).collect()
}

fn project(row: &CanonicalRow, indices: &[usize]) -> Vec<String> {
    indices.iter().map(|&i| row.dims[i].clone()).collect()
}

/// Ratio and its rounded percentage; `None` for a zero denominator
fn derive_ratio(secondary: f64, primary: u64, decimals: u32) -> (Option<f64>, Option<f64>) {
    if primary == 0 {
        return (None, None);
    }
    let ratio = secondary / primary as f64;
    (Some(ratio), Some(round_to(ratio * 100.0, decimals)))
}

/// Join `primary` (distinct-count source) with `secondary` (summed source).
pub fn reconcile(
    primary: &CanonicalTable,
    secondary: &CanonicalTable,
    opts: &ReconcileOptions,
) -> Result<Reconciled> {
    opts.window.validate()?;
    let primary_join = dim_indices(primary, &opts.join_dims)?;
    let secondary_join = dim_indices(secondary, &opts.join_dims)?;

    let primary_rows: Vec<&CanonicalRow> = primary
        .rows
        .iter()
        .filter(|r| opts.window.contains(r.date))
        .collect();
    let secondary_rows: Vec<&CanonicalRow> = secondary
        .rows
        .iter()
        .filter(|r| opts.window.contains(r.date))
        .collect();

    let mut report = ReconcileReport {
        primary_outside_window: primary.rows.len() - primary_rows.len(),
        secondary_outside_window: secondary.rows.len() - secondary_rows.len(),
        ..Default::default()
    };

    if primary_rows.is_empty() {
        return Err(EngineError::EmptyPrimary {
            table: primary.name.clone(),
        });
    }
    if secondary_rows.is_empty() {
        warn!(
            table = %secondary.name,
            "Secondary source is empty in the window; all ratios will be 0 or undefined"
        );
        report.secondary_empty = true;
    }

    // First-seen display name per key, primary source first
    let mut displays: BTreeMap<String, String> = BTreeMap::new();
    for row in primary_rows.iter().chain(secondary_rows.iter()) {
        displays
            .entry(row.entity_key.clone())
            .or_insert_with(|| row.entity_display.clone());
    }

    let mut groups: BTreeMap<GroupKey, PrimaryGroup> = BTreeMap::new();
    for row in &primary_rows {
        let group = groups
            .entry((row.entity_key.clone(), row.dims.clone()))
            .or_default();
        group.rows += 1;
        if let Some(subject) = &row.subject {
            group.subjects.insert(subject.clone());
        }
    }

    let mut sums: BTreeMap<GroupKey, f64> = BTreeMap::new();
    for row in &secondary_rows {
        *sums
            .entry((row.entity_key.clone(), project(row, &secondary_join)))
            .or_insert(0.0) += row.count;
    }

    let mut matches: BTreeMap<GroupKey, usize> = BTreeMap::new();
    let mut rows = Vec::with_capacity(groups.len());
    for ((entity_key, dims), group) in &groups {
        let join_values = primary_join.iter().map(|&i| dims[i].clone()).collect();
        let join_key = (entity_key.clone(), join_values);
        let secondary_count = match sums.get(&join_key) {
            Some(sum) => {
                *matches.entry(join_key).or_insert(0) += 1;
                *sum
            }
            None => 0.0,
        };

        let primary_count = if primary.subject_column {
            group.subjects.len() as u64
        } else {
            group.rows
        };
        let (ratio, ratio_percent) = derive_ratio(secondary_count, primary_count, opts.decimals);

        rows.push(ReconciledRow {
            entity_key: entity_key.clone(),
            entity_display: displays.get(entity_key).cloned().unwrap_or_default(),
            dims: dims.clone(),
            primary_count,
            secondary_count,
            ratio,
            ratio_percent,
            anomaly: ratio.map_or(false, |r| r > 1.0),
            is_orphan: false,
        });
    }
    report.fanned_out_keys = matches.values().filter(|&&n| n > 1).count();

    let orphans: Vec<OrphanRow> = sums
        .iter()
        .filter(|(key, _)| !matches.contains_key(*key))
        .map(|((entity_key, join_values), sum)| OrphanRow {
            entity_key: entity_key.clone(),
            entity_display: displays.get(entity_key).cloned().unwrap_or_default(),
            join_values: join_values.clone(),
            secondary_count: *sum,
        })
        .collect();
    report.orphans = orphans.len();

    if opts.orphans == OrphanPolicy::Include {
        for orphan in &orphans {
            let mut dims = vec![UNKNOWN_DIM.to_string(); primary.dim_names.len()];
            for (value, &i) in orphan.join_values.iter().zip(&primary_join) {
                dims[i] = value.clone();
            }
            rows.push(ReconciledRow {
                entity_key: orphan.entity_key.clone(),
                entity_display: orphan.entity_display.clone(),
                dims,
                primary_count: 0,
                secondary_count: orphan.secondary_count,
                ratio: None,
                ratio_percent: None,
                anomaly: false,
                is_orphan: true,
            });
        }
        rows.sort_by(|a, b| (&a.entity_key, &a.dims).cmp(&(&b.entity_key, &b.dims)));
    }

    report.anomalies = rows.iter().filter(|r| r.anomaly).count();
    if report.anomalies > 0 {
        warn!(
            count = report.anomalies,
            "Ratios above 100% found; check entity name matching"
        );
    }
    if report.orphans > 0 {
        info!(
            count = report.orphans,
            policy = ?opts.orphans,
            "Secondary entities without primary rows"
        );
    }
    debug!(
        rows = rows.len(),
        fanned_out = report.fanned_out_keys,
        "Reconciled sources"
    );

    Ok(Reconciled {
        dim_names: primary.dim_names.clone(),
        period_dim: primary.period_dim.clone(),
        join_dims: opts.join_dims.clone(),
        rows,
        orphans,
        report,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::normalize::{normalize, FieldMapping, HeaderAliases};
    use crate::table::Table;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    fn reservations(rows: Vec<[&str; 4]>) -> CanonicalTable {
        let raw = Table::from_rows(
            ["Hotel Name", "City", "tenant_id", "Checkin"],
            rows.into_iter().map(|r| r.to_vec()),
        );
        let mapping = FieldMapping::new("reservations", "hotel", "checkin")
            .subject("tenant_id")
            .dim("city", "city");
        normalize(&raw, &mapping, &HeaderAliases::default()).unwrap()
    }

    fn signups(rows: Vec<[&str; 3]>) -> CanonicalTable {
        let raw = Table::from_rows(
            ["hotel_short_name", "checkin", "signups"],
            rows.into_iter().map(|r| r.to_vec()),
        );
        let mapping = FieldMapping::new("signups", "hotel", "checkin").count("signup_count");
        normalize(&raw, &mapping, &HeaderAliases::default()).unwrap()
    }

    fn row<'a>(out: &'a Reconciled, key: &str) -> &'a ReconciledRow {
        out.rows.iter().find(|r| r.entity_key == key).unwrap()
    }

    // -------------------------------------------------------------------------
    // AGGREGATION
    // -------------------------------------------------------------------------

    #[test]
    fn test_anomaly_uses_unrounded_ratio() {
        let tenants: Vec<String> = (0..250).map(|i| format!("u{i}")).collect();
        let primary = reservations(
            tenants
                .iter()
                .map(|t| ["A", "HCM", t.as_str(), "2025-05-19"])
                .collect(),
        );
        let secondary = signups(vec![["A", "2025-05-19", "251"]]);
        let opts = ReconcileOptions {
            decimals: 0,
            ..Default::default()
        };
        let out = reconcile(&primary, &secondary, &opts).unwrap();
        let a = row(&out, "a");
        // 100.4% shows as 100
        assert_eq!(a.ratio_percent, Some(100.0));
        assert!(a.anomaly);
    }

    #[test]
    fn test_distinct_count_and_sum_scenario() {
        let primary = reservations(vec![
            ["A", "HCM", "u1", "2025-05-19"],
            ["A", "HCM", "u1", "2025-05-19"],
            ["A", "HCM", "u2", "2025-05-20"],
            ["B", "HCM", "u3", "2025-05-20"],
        ]);
        let secondary = signups(vec![["A", "2025-05-19", "4"], ["B", "2025-05-19", "0"]]);
        let out = reconcile(&primary, &secondary, &ReconcileOptions::default()).unwrap();

        let a = row(&out, "a");
        assert_eq!(a.primary_count, 2);
        assert_eq!(a.secondary_count, 4.0);
        assert_eq!(a.ratio_percent, Some(200.0));
        assert!(a.anomaly);

        let b = row(&out, "b");
        assert_eq!(b.primary_count, 1);
        assert_eq!(b.secondary_count, 0.0);
        assert_eq!(b.ratio_percent, Some(0.0));
        assert!(!b.anomaly);

        assert_eq!(out.report.anomalies, 1);
    }

    #[test]
    fn test_blank_subject_not_counted() {
        let primary = reservations(vec![
            ["A", "HCM", "u1", "2025-05-19"],
            ["A", "HCM", "", "2025-05-19"],
        ]);
        let secondary = signups(vec![["A", "2025-05-19", "1"]]);
        let out = reconcile(&primary, &secondary, &ReconcileOptions::default()).unwrap();
        assert_eq!(row(&out, "a").primary_count, 1);
    }

    #[test]
    fn test_row_count_without_subject_column() {
        let raw = Table::from_rows(
            ["hotel", "checkin"],
            vec![vec!["A", "2025-05-19"], vec!["A", "2025-05-19"]],
        );
        let primary = normalize(
            &raw,
            &FieldMapping::new("p", "hotel", "checkin"),
            &HeaderAliases::default(),
        )
        .unwrap();
        let secondary = signups(vec![["A", "2025-05-19", "1"]]);
        let out = reconcile(&primary, &secondary, &ReconcileOptions::default()).unwrap();
        assert_eq!(row(&out, "a").primary_count, 2);
        assert_eq!(row(&out, "a").ratio_percent, Some(50.0));
    }

    #[test]
    fn test_keys_match_across_spelling() {
        let primary = reservations(vec![["Grand Hotel ", "HCM", "u1", "2025-05-19"]]);
        let secondary = signups(vec![
            ["grand hotel", "2025-05-19", "1"],
            ["GRAND HOTEL", "2025-05-20", "2"],
        ]);
        let out = reconcile(&primary, &secondary, &ReconcileOptions::default()).unwrap();
        let grand = row(&out, "grand hotel");
        assert_eq!(grand.entity_display, "Grand Hotel");
        assert_eq!(grand.secondary_count, 3.0);
        assert!(out.orphans.is_empty());
    }

    // -------------------------------------------------------------------------
    // WINDOW
    // -------------------------------------------------------------------------

    #[test]
    fn test_rows_outside_window_do_not_contribute() {
        let primary = reservations(vec![
            ["A", "HCM", "u1", "2025-05-19"],
            ["A", "HCM", "u2", "2025-06-01"],
        ]);
        let secondary = signups(vec![["A", "2025-05-19", "3"], ["A", "2025-06-02", "7"]]);
        let opts = ReconcileOptions {
            window: DateWindow::new(d(2025, 5, 19), d(2025, 5, 25)),
            ..Default::default()
        };
        let out = reconcile(&primary, &secondary, &opts).unwrap();
        let a = row(&out, "a");
        assert_eq!(a.primary_count, 1);
        assert_eq!(a.secondary_count, 3.0);
        assert_eq!(out.report.primary_outside_window, 1);
        assert_eq!(out.report.secondary_outside_window, 1);
    }

    #[test]
    fn test_window_bounds_inclusive() {
        let w = DateWindow::new(d(2025, 5, 19), d(2025, 5, 25));
        assert!(w.contains(d(2025, 5, 19)));
        assert!(w.contains(d(2025, 5, 25)));
        assert!(!w.contains(d(2025, 5, 26)));
        assert!(DateWindow::unbounded().contains(d(1999, 1, 1)));
    }

    #[test]
    fn test_inverted_window_rejected() {
        let w = DateWindow::new(d(2025, 5, 25), d(2025, 5, 19));
        assert!(matches!(w.validate(), Err(EngineError::InvalidConfig(_))));
    }

    // -------------------------------------------------------------------------
    // DEGENERATE INPUT
    // -------------------------------------------------------------------------

    #[test]
    fn test_empty_primary_is_error() {
        let primary = reservations(vec![["A", "HCM", "u1", "2025-01-01"]]);
        let secondary = signups(vec![["A", "2025-05-19", "1"]]);
        let opts = ReconcileOptions {
            window: DateWindow::new(d(2025, 5, 1), d(2025, 5, 31)),
            ..Default::default()
        };
        let err = reconcile(&primary, &secondary, &opts).unwrap_err();
        assert_eq!(
            err,
            EngineError::EmptyPrimary {
                table: "reservations".to_string()
            }
        );
    }

    #[test]
    fn test_empty_secondary_is_warning() {
        let primary = reservations(vec![["A", "HCM", "u1", "2025-05-19"]]);
        let secondary = signups(vec![]);
        let out = reconcile(&primary, &secondary, &ReconcileOptions::default()).unwrap();
        assert!(out.report.secondary_empty);
        assert_eq!(row(&out, "a").ratio_percent, Some(0.0));
    }

    #[test]
    fn test_unknown_join_dim() {
        let primary = reservations(vec![["A", "HCM", "u1", "2025-05-19"]]);
        let secondary = signups(vec![["A", "2025-05-19", "1"]]);
        let opts = ReconcileOptions {
            join_dims: vec!["city".to_string()],
            ..Default::default()
        };
        let err = reconcile(&primary, &secondary, &opts).unwrap_err();
        assert!(matches!(err, EngineError::UnknownDimension { dim, .. } if dim == "city"));
    }

    // -------------------------------------------------------------------------
    // ORPHANS AND FAN-OUT
    // -------------------------------------------------------------------------

    #[test]
    fn test_orphans_dropped_by_default_but_listed() {
        let primary = reservations(vec![["A", "HCM", "u1", "2025-05-19"]]);
        let secondary = signups(vec![["A", "2025-05-19", "1"], ["Z", "2025-05-19", "5"]]);
        let out = reconcile(&primary, &secondary, &ReconcileOptions::default()).unwrap();
        assert_eq!(out.rows.len(), 1);
        assert_eq!(out.orphans.len(), 1);
        assert_eq!(out.orphans[0].entity_display, "Z");
        assert_eq!(out.orphans[0].secondary_count, 5.0);
        assert_eq!(out.report.orphans, 1);
    }

    #[test]
    fn test_orphans_included_with_undefined_ratio() {
        let primary = reservations(vec![["A", "HCM", "u1", "2025-05-19"]]);
        let secondary = signups(vec![["A", "2025-05-19", "1"], ["Z", "2025-05-19", "5"]]);
        let opts = ReconcileOptions {
            orphans: OrphanPolicy::Include,
            ..Default::default()
        };
        let out = reconcile(&primary, &secondary, &opts).unwrap();
        assert_eq!(out.rows.len(), 2);
        let z = row(&out, "z");
        assert!(z.is_orphan);
        assert_eq!(z.primary_count, 0);
        assert_eq!(z.ratio, None);
        assert_eq!(z.ratio_percent, None);
        assert!(!z.anomaly);
        assert_eq!(z.dims, vec![UNKNOWN_DIM.to_string()]);
    }

    #[test]
    fn test_fan_out_attaches_sum_to_each_primary_row() {
        let primary = reservations(vec![
            ["A", "HCM", "u1", "2025-05-19"],
            ["A", "HN", "u2", "2025-05-19"],
        ]);
        let secondary = signups(vec![["A", "2025-05-19", "2"]]);
        let out = reconcile(&primary, &secondary, &ReconcileOptions::default()).unwrap();
        assert_eq!(out.rows.len(), 2);
        assert!(out.rows.iter().all(|r| r.secondary_count == 2.0));
        assert_eq!(out.report.fanned_out_keys, 1);
    }

    #[test]
    fn test_output_sorted_by_key_then_dims() {
        let primary = reservations(vec![
            ["b", "HN", "u1", "2025-05-19"],
            ["a", "HN", "u2", "2025-05-19"],
            ["a", "DN", "u3", "2025-05-19"],
        ]);
        let secondary = signups(vec![]);
        let out = reconcile(&primary, &secondary, &ReconcileOptions::default()).unwrap();
        let order: Vec<(&str, &str)> = out
            .rows
            .iter()
            .map(|r| (r.entity_key.as_str(), r.dims[0].as_str()))
            .collect();
        assert_eq!(order, vec![("a", "DN"), ("a", "HN"), ("b", "HN")]);
    }

    #[test]
    fn test_derive_ratio_zero_denominator_undefined() {
        assert_eq!(derive_ratio(3.0, 0, 2), (None, None));
        assert_eq!(derive_ratio(0.0, 5, 2), (Some(0.0), Some(0.0)));
        assert_eq!(derive_ratio(2.0, 3, 2).1, Some(66.67));
    }
}
