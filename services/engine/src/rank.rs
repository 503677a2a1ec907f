//! Ranker - dense ranks and snapshot comparison
//!
//! Ranks are computed on the value a reader sees (the rounded percentage for
//! the ratio metric), descending, globally or within each combination of one
//! or more grouping dimensions.

use crate::error::{EngineError, Result};
use crate::reconcile::{Reconciled, ReconciledRow};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use tracing::debug;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortMetric {
    #[default]
    Ratio,
    PrimaryCount,
    SecondaryCount,
}

impl SortMetric {
    pub fn value_of(&self, row: &ReconciledRow) -> Option<f64> {
        match self {
            SortMetric::Ratio => row.ratio_percent,
            SortMetric::PrimaryCount => Some(row.primary_count as f64),
            SortMetric::SecondaryCount => Some(row.secondary_count),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            SortMetric::Ratio => "ratio",
            SortMetric::PrimaryCount => "primary_count",
            SortMetric::SecondaryCount => "secondary_count",
        }
    }
}

/// Ranking scope: the whole table, or independently per group
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RankScope {
    #[default]
    Global,
    Grouped(Vec<String>),
}

impl RankScope {
    pub fn dims(&self) -> &[String] {
        match self {
            RankScope::Global => &[],
            RankScope::Grouped(dims) => dims,
        }
    }
}

// =============================================================================
// Dense rank
// =============================================================================

/// Dense rank, descending. Undefined values share the rank after the last
/// defined one.
///
/// `[50, 50, 30]` ranks `[1, 1, 2]`.
pub fn dense_rank(values: &[Option<f64>]) -> Vec<u32> {
    let mut distinct: Vec<f64> = values.iter().flatten().copied().collect();
    distinct.sort_by(|a, b| b.total_cmp(a));
    distinct.dedup();

    let undefined_rank = distinct.len() as u32 + 1;
    values
        .iter()
        .map(|v| match v {
            Some(v) => distinct
                .iter()
                .position(|d| d.total_cmp(v) == Ordering::Equal)
                .map_or(undefined_rank, |p| p as u32 + 1),
            None => undefined_rank,
        })
        .collect()
}

// =============================================================================
// Ranked table
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RankedRow {
    pub entity_key: String,
    pub entity_display: String,
    pub dims: Vec<String>,
    /// Values of the scope dimensions
    pub group: Vec<String>,
    pub primary_count: u64,
    pub secondary_count: f64,
    pub ratio_percent: Option<f64>,
    pub anomaly: bool,
    pub is_orphan: bool,
    /// Metric actually ranked on (ratio falls back to primary_count)
    pub metric: SortMetric,
    pub metric_value: Option<f64>,
    pub rank: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RankedTable {
    pub dim_names: Vec<String>,
    /// Derived period dimension (e.g. `week`); not part of the comparison key
    pub period_dim: Option<String>,
    pub scope: RankScope,
    pub rows: Vec<RankedRow>,
}

impl RankedTable {
    fn period_index(&self) -> Option<usize> {
        let period = self.period_dim.as_deref()?;
        self.dim_names.iter().position(|d| d == period)
    }
}

/// Rank a reconciled table by `metric` within `scope`.
///
/// Rows come out ordered by group, then rank, then entity key and dims.
pub fn rank_table(
    reconciled: &Reconciled,
    metric: SortMetric,
    scope: &RankScope,
) -> Result<RankedTable> {
    let scope_idx: Vec<usize> = scope
        .dims()
        .iter()
        .map(|d| reconciled.dim_index(d))
        .collect::<Result<_>>()?;

    let mut groups: BTreeMap<Vec<String>, Vec<&ReconciledRow>> = BTreeMap::new();
    for row in &reconciled.rows {
        let group = scope_idx.iter().map(|&i| row.dims[i].clone()).collect();
        groups.entry(group).or_default().push(row);
    }

    let mut rows = Vec::with_capacity(reconciled.rows.len());
    for (group, members) in groups {
        let mut used = metric;
        let mut values: Vec<Option<f64>> = members.iter().map(|r| used.value_of(r)).collect();
        if metric == SortMetric::Ratio && values.iter().all(Option::is_none) {
            debug!(group = ?group, "No defined ratio in scope, ranking on primary_count");
            used = SortMetric::PrimaryCount;
            values = members.iter().map(|r| used.value_of(r)).collect();
        }

        let ranks = dense_rank(&values);
        let mut ranked: Vec<RankedRow> = members
            .into_iter()
            .zip(values)
            .zip(ranks)
            .map(|((row, metric_value), rank)| RankedRow {
                entity_key: row.entity_key.clone(),
                entity_display: row.entity_display.clone(),
                dims: row.dims.clone(),
                group: group.clone(),
                primary_count: row.primary_count,
                secondary_count: row.secondary_count,
                ratio_percent: row.ratio_percent,
                anomaly: row.anomaly,
                is_orphan: row.is_orphan,
                metric: used,
                metric_value,
                rank,
            })
            .collect();
        ranked.sort_by(|a, b| {
            a.rank
                .cmp(&b.rank)
                .then_with(|| a.entity_key.cmp(&b.entity_key))
                .then_with(|| a.dims.cmp(&b.dims))
        });
        rows.extend(ranked);
    }

    Ok(RankedTable {
        dim_names: reconciled.dim_names.clone(),
        period_dim: reconciled.period_dim.clone(),
        scope: scope.clone(),
        rows,
    })
}

// =============================================================================
// Snapshot comparison
// =============================================================================

/// `(current / previous - 1) * 100`; undefined for a zero or missing baseline
pub fn pct_change(previous: Option<f64>, current: Option<f64>) -> Option<f64> {
    match (previous, current) {
        (Some(prev), Some(cur)) if prev > 0.0 => Some((cur / prev - 1.0) * 100.0),
        _ => None,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryStatus {
    Continuing,
    /// Only in the current snapshot
    NewEntrant,
    /// Only in the earlier snapshot
    Dropped,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ComparisonRow {
    pub entity_key: String,
    pub entity_display: String,
    pub dims: Vec<String>,
    pub group: Vec<String>,
    pub status: EntryStatus,
    pub is_new_entrant: bool,

    /// Period each side was ranked in, when ranking per period
    pub prior_period: Option<String>,
    pub current_period: Option<String>,

    pub prior_rank: Option<u32>,
    pub current_rank: Option<u32>,
    /// prior - current; positive means the entity moved up.
    /// Undefined when the two sides ranked on different metrics.
    pub rank_delta: Option<i64>,

    /// Metric each side ranked on (ratio can fall back to primary_count)
    pub prior_sort_metric: Option<SortMetric>,
    pub current_sort_metric: Option<SortMetric>,

    pub prior_metric: Option<f64>,
    pub current_metric: Option<f64>,
    pub pct_change: Option<f64>,

    pub prior_primary: Option<u64>,
    pub current_primary: Option<u64>,
    pub primary_pct_change: Option<f64>,

    pub prior_secondary: Option<f64>,
    pub current_secondary: Option<f64>,
    pub secondary_pct_change: Option<f64>,

    pub prior_ratio_percent: Option<f64>,
    pub current_ratio_percent: Option<f64>,
    /// Change between the two rounded percentages
    pub ratio_pct_change: Option<f64>,
}

type CompareKey = (String, Vec<String>);

/// `values` without the entry at `skip`
fn without(values: &[String], skip: Option<usize>) -> Vec<String> {
    values
        .iter()
        .enumerate()
        .filter(|(i, _)| Some(*i) != skip)
        .map(|(_, v)| v.clone())
        .collect()
}

impl ComparisonRow {
    fn merge(
        key: &CompareKey,
        prior: Option<&RankedRow>,
        current: Option<&RankedRow>,
        period_idx: Option<usize>,
        scope_period_idx: Option<usize>,
    ) -> Self {
        let status = match (prior, current) {
            (Some(_), Some(_)) => EntryStatus::Continuing,
            (None, _) => EntryStatus::NewEntrant,
            (_, None) => EntryStatus::Dropped,
        };
        let latest = current.or(prior);
        let period = |row: Option<&RankedRow>| row.zip(period_idx).map(|(r, i)| r.dims[i].clone());

        let same_metric = prior
            .zip(current)
            .map_or(false, |(p, c)| p.metric == c.metric);
        if status == EntryStatus::Continuing && !same_metric {
            debug!(entity = %key.0, "Snapshots ranked on different metrics; no rank or metric change");
        }

        let prior_rank = prior.map(|r| r.rank);
        let current_rank = current.map(|r| r.rank);
        let prior_metric = prior.and_then(|r| r.metric_value);
        let current_metric = current.and_then(|r| r.metric_value);
        let prior_primary = prior.map(|r| r.primary_count);
        let current_primary = current.map(|r| r.primary_count);
        let prior_secondary = prior.map(|r| r.secondary_count);
        let current_secondary = current.map(|r| r.secondary_count);
        let prior_ratio_percent = prior.and_then(|r| r.ratio_percent);
        let current_ratio_percent = current.and_then(|r| r.ratio_percent);

        Self {
            entity_key: key.0.clone(),
            entity_display: latest.map(|r| r.entity_display.clone()).unwrap_or_default(),
            dims: key.1.clone(),
            group: latest
                .map(|r| without(&r.group, scope_period_idx))
                .unwrap_or_default(),
            status,
            is_new_entrant: status == EntryStatus::NewEntrant,
            prior_period: period(prior),
            current_period: period(current),
            prior_rank,
            current_rank,
            rank_delta: prior_rank
                .zip(current_rank)
                .filter(|_| same_metric)
                .map(|(p, c)| i64::from(p) - i64::from(c)),
            prior_sort_metric: prior.map(|r| r.metric),
            current_sort_metric: current.map(|r| r.metric),
            prior_metric,
            current_metric,
            pct_change: if same_metric {
                pct_change(prior_metric, current_metric)
            } else {
                None
            },
            prior_primary,
            current_primary,
            primary_pct_change: pct_change(
                prior_primary.map(|v| v as f64),
                current_primary.map(|v| v as f64),
            ),
            prior_secondary,
            current_secondary,
            secondary_pct_change: pct_change(prior_secondary, current_secondary),
            prior_ratio_percent,
            current_ratio_percent,
            ratio_pct_change: pct_change(prior_ratio_percent, current_ratio_percent),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Comparison {
    /// Key dimensions of the merged rows (the period dimension excluded)
    pub dim_names: Vec<String>,
    pub period_dim: Option<String>,
    pub scope: RankScope,
    pub rows: Vec<ComparisonRow>,
}

impl Comparison {
    fn continuing(&self) -> impl Iterator<Item = &ComparisonRow> {
        self.rows
            .iter()
            .filter(|r| r.status == EntryStatus::Continuing)
    }

    /// Continuing entities with the largest rank improvement
    pub fn top_gainers(&self, n: usize) -> Vec<&ComparisonRow> {
        let mut rows: Vec<&ComparisonRow> = self
            .continuing()
            .filter(|r| r.rank_delta.map_or(false, |d| d > 0))
            .collect();
        rows.sort_by(|a, b| {
            b.rank_delta
                .cmp(&a.rank_delta)
                .then_with(|| a.entity_key.cmp(&b.entity_key))
                .then_with(|| a.dims.cmp(&b.dims))
        });
        rows.truncate(n);
        rows
    }

    /// Continuing entities with the largest rank decline
    pub fn top_losers(&self, n: usize) -> Vec<&ComparisonRow> {
        let mut rows: Vec<&ComparisonRow> = self
            .continuing()
            .filter(|r| r.rank_delta.map_or(false, |d| d < 0))
            .collect();
        rows.sort_by(|a, b| {
            a.rank_delta
                .cmp(&b.rank_delta)
                .then_with(|| a.entity_key.cmp(&b.entity_key))
                .then_with(|| a.dims.cmp(&b.dims))
        });
        rows.truncate(n);
        rows
    }

    /// Percentage of continuing entities with a comparable rank whose rank improved
    pub fn improving_share(&self) -> Option<f64> {
        let (total, improved) = self
            .continuing()
            .filter_map(|r| r.rank_delta)
            .fold((0usize, 0usize), |(t, i), d| (t + 1, i + usize::from(d > 0)));
        (total > 0).then(|| improved as f64 / total as f64 * 100.0)
    }

    pub fn new_entrants(&self) -> usize {
        self.rows.iter().filter(|r| r.is_new_entrant).count()
    }
}

fn place<'a>(
    slot: &mut Option<&'a RankedRow>,
    row: &'a RankedRow,
    period_dim: Option<&str>,
    period_idx: Option<usize>,
) -> Result<()> {
    if let Some(existing) = *slot {
        let period = |r: &RankedRow| period_idx.map(|i| r.dims[i].clone()).unwrap_or_default();
        return Err(EngineError::MultiPeriodSnapshot {
            dim: period_dim.unwrap_or_default().to_string(),
            entity: row.entity_key.clone(),
            periods: vec![period(existing), period(row)],
        });
    }
    *slot = Some(row);
    Ok(())
}

/// Merge two ranked snapshots on `(entity_key, dims)`.
///
/// A period dimension (e.g. `week`) is left out of the key so the same
/// hotel in two different weeks lines up; each snapshot must then hold a
/// single period per entity.
pub fn compare(before: &RankedTable, after: &RankedTable) -> Result<Comparison> {
    if before.dim_names != after.dim_names
        || before.scope != after.scope
        || before.period_dim != after.period_dim
    {
        return Err(EngineError::IncompatibleSnapshots {
            before: before.dim_names.clone(),
            after: after.dim_names.clone(),
        });
    }

    let period_dim = after.period_dim.as_deref();
    let period_idx = after.period_index();
    let scope_period_idx =
        period_dim.and_then(|p| after.scope.dims().iter().position(|d| d == p));

    let mut merged: BTreeMap<CompareKey, (Option<&RankedRow>, Option<&RankedRow>)> =
        BTreeMap::new();
    for row in &before.rows {
        let slot = merged
            .entry((row.entity_key.clone(), without(&row.dims, period_idx)))
            .or_default();
        place(&mut slot.0, row, period_dim, period_idx)?;
    }
    for row in &after.rows {
        let slot = merged
            .entry((row.entity_key.clone(), without(&row.dims, period_idx)))
            .or_default();
        place(&mut slot.1, row, period_dim, period_idx)?;
    }

    let mut rows: Vec<ComparisonRow> = merged
        .iter()
        .map(|(key, (prior, current))| {
            ComparisonRow::merge(key, *prior, *current, period_idx, scope_period_idx)
        })
        .collect();
    rows.sort_by(|a, b| {
        a.group
            .cmp(&b.group)
            .then_with(|| cmp_rank(a.current_rank, b.current_rank))
            .then_with(|| cmp_rank(a.prior_rank, b.prior_rank))
            .then_with(|| a.entity_key.cmp(&b.entity_key))
            .then_with(|| a.dims.cmp(&b.dims))
    });

    let scope = match after.scope.dims() {
        [] => RankScope::Global,
        dims => {
            let kept = without(dims, scope_period_idx);
            if kept.is_empty() {
                RankScope::Global
            } else {
                RankScope::Grouped(kept)
            }
        }
    };

    Ok(Comparison {
        dim_names: without(&after.dim_names, period_idx),
        period_dim: after.period_dim.clone(),
        scope,
        rows,
    })
}

/// Defined ranks first, ascending
fn cmp_rank(a: Option<u32>, b: Option<u32>) -> Ordering {
    match (a, b) {
        (Some(a), Some(b)) => a.cmp(&b),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reconcile::ReconcileReport;

    fn rec_row(key: &str, city: &str, primary: u64, secondary: f64) -> ReconciledRow {
        let ratio = (primary > 0).then(|| secondary / primary as f64);
        ReconciledRow {
            entity_key: key.to_string(),
            entity_display: key.to_uppercase(),
            dims: vec![city.to_string()],
            primary_count: primary,
            secondary_count: secondary,
            ratio,
            ratio_percent: ratio.map(|r| crate::round_to(r * 100.0, 2)),
            anomaly: ratio.map_or(false, |r| r > 1.0),
            is_orphan: false,
        }
    }

    fn reconciled(rows: Vec<ReconciledRow>) -> Reconciled {
        Reconciled {
            dim_names: vec!["city".to_string()],
            period_dim: None,
            join_dims: Vec::new(),
            rows,
            orphans: Vec::new(),
            report: ReconcileReport::default(),
        }
    }

    fn rank_of(table: &RankedTable, key: &str) -> u32 {
        table.rows.iter().find(|r| r.entity_key == key).unwrap().rank
    }

    // -------------------------------------------------------------------------
    // DENSE RANK
    // -------------------------------------------------------------------------

    #[test]
    fn test_dense_rank_ties_do_not_skip() {
        assert_eq!(dense_rank(&[Some(50.0), Some(50.0), Some(30.0)]), vec![1, 1, 2]);
    }

    #[test]
    fn test_dense_rank_order_independent() {
        assert_eq!(
            dense_rank(&[Some(30.0), Some(90.0), Some(50.0), Some(90.0)]),
            vec![3, 1, 2, 1]
        );
    }

    #[test]
    fn test_dense_rank_undefined_last() {
        assert_eq!(dense_rank(&[None, Some(10.0), Some(20.0), None]), vec![3, 2, 1, 3]);
        assert_eq!(dense_rank(&[None, None]), vec![1, 1]);
        assert!(dense_rank(&[]).is_empty());
    }

    // -------------------------------------------------------------------------
    // RANK TABLE
    // -------------------------------------------------------------------------

    #[test]
    fn test_grouped_rank_independent_of_global() {
        // X: [60, 40], Y: [90]
        let rec = reconciled(vec![
            rec_row("a", "X", 10, 6.0),
            rec_row("b", "X", 10, 4.0),
            rec_row("c", "Y", 10, 9.0),
        ]);
        let grouped = rank_table(&rec, SortMetric::Ratio, &RankScope::Grouped(vec!["city".into()])).unwrap();
        assert_eq!(rank_of(&grouped, "a"), 1);
        assert_eq!(rank_of(&grouped, "b"), 2);
        assert_eq!(rank_of(&grouped, "c"), 1);

        let global = rank_table(&rec, SortMetric::Ratio, &RankScope::Global).unwrap();
        assert_eq!(rank_of(&global, "c"), 1);
        assert_eq!(rank_of(&global, "a"), 2);
        assert_eq!(rank_of(&global, "b"), 3);
    }

    #[test]
    fn test_rank_uses_rounded_percent() {
        // 1/3 and 333334/1000000 both display as 33.33
        let rec = reconciled(vec![
            rec_row("a", "X", 3, 1.0),
            rec_row("b", "X", 1_000_000, 333_334.0),
        ]);
        let ranked = rank_table(&rec, SortMetric::Ratio, &RankScope::Global).unwrap();
        assert_eq!(rank_of(&ranked, "a"), 1);
        assert_eq!(rank_of(&ranked, "b"), 1);
    }

    #[test]
    fn test_ratio_falls_back_to_primary_count_when_all_undefined() {
        let mut a = rec_row("a", "X", 0, 3.0);
        a.is_orphan = true;
        let mut b = rec_row("b", "X", 0, 1.0);
        b.is_orphan = true;
        let rec = reconciled(vec![a, b, rec_row("c", "Y", 4, 1.0)]);
        let ranked = rank_table(&rec, SortMetric::Ratio, &RankScope::Grouped(vec!["city".into()])).unwrap();

        let x: Vec<&RankedRow> = ranked.rows.iter().filter(|r| r.group == ["X"]).collect();
        assert!(x.iter().all(|r| r.metric == SortMetric::PrimaryCount));
        assert!(x.iter().all(|r| r.rank == 1));

        let y = ranked.rows.iter().find(|r| r.entity_key == "c").unwrap();
        assert_eq!(y.metric, SortMetric::Ratio);
        assert_eq!(y.metric_value, Some(25.0));
    }

    #[test]
    fn test_undefined_ratio_ranks_after_defined() {
        let rec = reconciled(vec![rec_row("a", "X", 0, 3.0), rec_row("b", "X", 2, 1.0)]);
        let ranked = rank_table(&rec, SortMetric::Ratio, &RankScope::Global).unwrap();
        assert_eq!(rank_of(&ranked, "b"), 1);
        assert_eq!(rank_of(&ranked, "a"), 2);
        assert_eq!(ranked.rows[0].entity_key, "b");
    }

    #[test]
    fn test_sort_by_secondary_count() {
        let rec = reconciled(vec![rec_row("a", "X", 10, 1.0), rec_row("b", "X", 1, 5.0)]);
        let ranked = rank_table(&rec, SortMetric::SecondaryCount, &RankScope::Global).unwrap();
        assert_eq!(rank_of(&ranked, "b"), 1);
        assert_eq!(rank_of(&ranked, "a"), 2);
    }

    #[test]
    fn test_unknown_scope_dim() {
        let rec = reconciled(vec![rec_row("a", "X", 1, 1.0)]);
        let err = rank_table(&rec, SortMetric::Ratio, &RankScope::Grouped(vec!["brand".into()])).unwrap_err();
        assert!(matches!(err, EngineError::UnknownDimension { .. }));
    }

    // -------------------------------------------------------------------------
    // COMPARISON
    // -------------------------------------------------------------------------

    fn ranked(rows: Vec<ReconciledRow>) -> RankedTable {
        rank_table(&reconciled(rows), SortMetric::Ratio, &RankScope::Global).unwrap()
    }

    #[test]
    fn test_pct_change_undefined_on_zero_baseline() {
        assert_eq!(pct_change(Some(0.0), Some(5.0)), None);
        assert_eq!(pct_change(None, Some(5.0)), None);
        assert_eq!(pct_change(Some(5.0), None), None);
        assert_eq!(pct_change(Some(50.0), Some(75.0)), Some(50.0));
        assert_eq!(pct_change(Some(4.0), Some(0.0)), Some(-100.0));
    }

    #[test]
    fn test_new_entrant_has_no_prior() {
        let before = ranked(vec![rec_row("a", "X", 10, 5.0), rec_row("b", "X", 10, 3.0)]);
        let after = ranked(vec![
            rec_row("a", "X", 10, 4.0),
            rec_row("b", "X", 10, 6.0),
            rec_row("c", "X", 10, 1.0),
        ]);
        let cmp = compare(&before, &after).unwrap();

        let c = cmp.rows.iter().find(|r| r.entity_key == "c").unwrap();
        assert!(c.is_new_entrant);
        assert_eq!(c.status, EntryStatus::NewEntrant);
        assert_eq!(c.prior_rank, None);
        assert_eq!(c.pct_change, None);
        assert_eq!(c.rank_delta, None);

        let b = cmp.rows.iter().find(|r| r.entity_key == "b").unwrap();
        assert_eq!(b.prior_rank, Some(2));
        assert_eq!(b.current_rank, Some(1));
        assert_eq!(b.rank_delta, Some(1));
        assert_eq!(b.pct_change, Some(100.0));
        assert_eq!(cmp.new_entrants(), 1);
    }

    #[test]
    fn test_dropped_entities_kept() {
        let before = ranked(vec![rec_row("a", "X", 10, 5.0), rec_row("z", "X", 10, 3.0)]);
        let after = ranked(vec![rec_row("a", "X", 10, 5.0)]);
        let cmp = compare(&before, &after).unwrap();
        let z = cmp.rows.iter().find(|r| r.entity_key == "z").unwrap();
        assert_eq!(z.status, EntryStatus::Dropped);
        assert!(!z.is_new_entrant);
        assert_eq!(z.current_rank, None);
        assert_eq!(z.rank_delta, None);
        // defined ranks sort before dropped rows
        assert_eq!(cmp.rows.last().unwrap().entity_key, "z");
    }

    #[test]
    fn test_movers_and_improving_share() {
        let before = ranked(vec![
            rec_row("a", "X", 10, 9.0),
            rec_row("b", "X", 10, 8.0),
            rec_row("c", "X", 10, 7.0),
            rec_row("d", "X", 10, 6.0),
        ]);
        let after = ranked(vec![
            rec_row("a", "X", 10, 6.0),
            rec_row("b", "X", 10, 8.0),
            rec_row("c", "X", 10, 7.0),
            rec_row("d", "X", 10, 9.0),
        ]);
        let cmp = compare(&before, &after).unwrap();

        let gainers = cmp.top_gainers(5);
        assert_eq!(gainers.len(), 1);
        assert_eq!(gainers[0].entity_key, "d");
        assert_eq!(gainers[0].rank_delta, Some(3));

        let losers = cmp.top_losers(5);
        assert_eq!(losers[0].entity_key, "a");
        assert_eq!(losers[0].rank_delta, Some(-3));

        assert_eq!(cmp.improving_share(), Some(25.0));
    }

    #[test]
    fn test_incompatible_snapshots() {
        let before = ranked(vec![rec_row("a", "X", 10, 5.0)]);
        let mut after = before.clone();
        after.dim_names = vec!["city".to_string(), "week".to_string()];
        assert!(matches!(
            compare(&before, &after),
            Err(EngineError::IncompatibleSnapshots { .. })
        ));
    }

    #[test]
    fn test_mixed_metrics_leave_changes_undefined() {
        // before ranks on ratio, after has no defined ratio and falls back
        let before = ranked(vec![rec_row("a", "X", 1, 1.0), rec_row("b", "X", 2, 1.0)]);
        let after = ranked(vec![rec_row("a", "X", 0, 1.0), rec_row("b", "X", 0, 2.0)]);
        let cmp = compare(&before, &after).unwrap();

        let a = cmp.rows.iter().find(|r| r.entity_key == "a").unwrap();
        assert_eq!(a.status, EntryStatus::Continuing);
        assert_eq!(a.prior_sort_metric, Some(SortMetric::Ratio));
        assert_eq!(a.current_sort_metric, Some(SortMetric::PrimaryCount));
        assert_eq!(a.prior_metric, Some(100.0));
        assert_eq!(a.current_metric, Some(0.0));
        assert_eq!(a.pct_change, None);
        assert_eq!(a.rank_delta, None);
        // counts stay comparable
        assert_eq!(a.secondary_pct_change, Some(0.0));
        assert_eq!(cmp.improving_share(), None);
        assert!(cmp.top_gainers(5).is_empty());
    }

    // -------------------------------------------------------------------------
    // PERIOD DIMENSION
    // -------------------------------------------------------------------------

    /// One row per (hotel, week), ranked within the week
    fn ranked_weekly(rows: &[(&str, &str, u64, f64)]) -> RankedTable {
        let rows = rows
            .iter()
            .map(|&(key, week, primary, secondary)| rec_row(key, week, primary, secondary))
            .collect();
        let rec = Reconciled {
            dim_names: vec!["week".to_string()],
            period_dim: Some("week".to_string()),
            join_dims: vec!["week".to_string()],
            rows,
            orphans: Vec::new(),
            report: ReconcileReport::default(),
        };
        rank_table(&rec, SortMetric::Ratio, &RankScope::Grouped(vec!["week".into()])).unwrap()
    }

    #[test]
    fn test_compare_matches_entities_across_weeks() {
        let before = ranked_weekly(&[("a", "2025-05-12", 10, 2.0), ("b", "2025-05-12", 10, 5.0)]);
        let after = ranked_weekly(&[("a", "2025-05-19", 10, 6.0), ("b", "2025-05-19", 10, 3.0)]);
        let cmp = compare(&before, &after).unwrap();

        assert_eq!(cmp.rows.len(), 2);
        assert!(cmp.dim_names.is_empty());
        assert_eq!(cmp.scope, RankScope::Global);
        assert_eq!(cmp.new_entrants(), 0);

        let a = cmp.rows.iter().find(|r| r.entity_key == "a").unwrap();
        assert_eq!(a.status, EntryStatus::Continuing);
        assert!(a.group.is_empty());
        assert_eq!(a.prior_period.as_deref(), Some("2025-05-12"));
        assert_eq!(a.current_period.as_deref(), Some("2025-05-19"));
        assert_eq!(a.rank_delta, Some(1));
        assert_eq!(a.pct_change, Some(200.0));
        assert_eq!(cmp.improving_share(), Some(50.0));
    }

    #[test]
    fn test_compare_rejects_window_spanning_several_weeks() {
        let before = ranked_weekly(&[("a", "2025-05-05", 10, 2.0), ("a", "2025-05-12", 10, 5.0)]);
        let after = ranked_weekly(&[("a", "2025-05-19", 10, 6.0)]);
        match compare(&before, &after) {
            Err(EngineError::MultiPeriodSnapshot { dim, entity, periods }) => {
                assert_eq!(dim, "week");
                assert_eq!(entity, "a");
                assert_eq!(periods, vec!["2025-05-05".to_string(), "2025-05-12".to_string()]);
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn test_improving_share_undefined_without_continuing() {
        let before = ranked(vec![rec_row("a", "X", 10, 5.0)]);
        let after = ranked(vec![rec_row("b", "X", 10, 5.0)]);
        let cmp = compare(&before, &after).unwrap();
        assert_eq!(cmp.improving_share(), None);
    }
}
