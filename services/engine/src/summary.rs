//! Rollups over a reconciled table: overall totals and per-group summaries

use crate::error::Result;
use crate::rank::pct_change;
use crate::reconcile::{Reconciled, ReconciledRow};
use crate::round_to;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Overview {
    pub entities: usize,
    pub total_primary: u64,
    pub total_secondary: f64,
    /// Undefined when total_primary is 0
    pub ratio_percent: Option<f64>,
    pub anomalies: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GroupSummary {
    pub group: String,
    pub entities: usize,
    pub primary_count: u64,
    pub secondary_count: f64,
    pub ratio_percent: Option<f64>,
    pub anomalies: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GroupComparison {
    pub group: String,
    pub prior_primary: Option<u64>,
    pub current_primary: Option<u64>,
    pub primary_pct_change: Option<f64>,
    pub prior_secondary: Option<f64>,
    pub current_secondary: Option<f64>,
    pub secondary_pct_change: Option<f64>,
    pub prior_ratio_percent: Option<f64>,
    pub current_ratio_percent: Option<f64>,
    pub ratio_pct_change: Option<f64>,
}

struct Totals {
    entities: usize,
    primary: u64,
    secondary: f64,
    anomalies: usize,
}

/// Sum a set of rows. A fanned-out secondary sum appears on several rows with
/// the same join key and is counted once.
fn totals<'a>(reconciled: &Reconciled, rows: impl Iterator<Item = &'a ReconciledRow>) -> Totals {
    let mut entities = BTreeSet::new();
    let mut secondary = BTreeMap::new();
    let mut primary = 0;
    let mut anomalies = 0;
    for row in rows.filter(|r| !r.is_orphan) {
        entities.insert(row.entity_key.as_str());
        secondary.insert(reconciled.join_key(row), row.secondary_count);
        primary += row.primary_count;
        anomalies += usize::from(row.anomaly);
    }
    Totals {
        entities: entities.len(),
        primary,
        secondary: secondary.values().sum(),
        anomalies,
    }
}

fn ratio_percent(secondary: f64, primary: u64, decimals: u32) -> Option<f64> {
    (primary > 0).then(|| round_to(secondary / primary as f64 * 100.0, decimals))
}

impl Overview {
    pub fn from_reconciled(reconciled: &Reconciled, decimals: u32) -> Self {
        let t = totals(reconciled, reconciled.rows.iter());
        Self {
            entities: t.entities,
            total_primary: t.primary,
            total_secondary: t.secondary,
            ratio_percent: ratio_percent(t.secondary, t.primary, decimals),
            anomalies: t.anomalies,
        }
    }
}

/// Summaries per value of `dim`, ordered by group value.
///
/// A fanned-out secondary sum counts in full in each group holding one of its
/// rows; the overview counts it once.
pub fn group_rollup(reconciled: &Reconciled, dim: &str, decimals: u32) -> Result<Vec<GroupSummary>> {
    let idx = reconciled.dim_index(dim)?;
    let mut groups: BTreeMap<&str, Vec<&ReconciledRow>> = BTreeMap::new();
    for row in &reconciled.rows {
        groups.entry(row.dims[idx].as_str()).or_default().push(row);
    }

    Ok(groups
        .into_iter()
        .map(|(group, rows)| {
            let t = totals(reconciled, rows.into_iter());
            GroupSummary {
                group: group.to_string(),
                entities: t.entities,
                primary_count: t.primary,
                secondary_count: t.secondary,
                ratio_percent: ratio_percent(t.secondary, t.primary, decimals),
                anomalies: t.anomalies,
            }
        })
        .filter(|g| g.entities > 0)
        .collect())
}

/// Join two rollups on the group value (outer join)
pub fn compare_groups(before: &[GroupSummary], after: &[GroupSummary]) -> Vec<GroupComparison> {
    let mut merged: BTreeMap<&str, (Option<&GroupSummary>, Option<&GroupSummary>)> = BTreeMap::new();
    for g in before {
        merged.entry(g.group.as_str()).or_default().0 = Some(g);
    }
    for g in after {
        merged.entry(g.group.as_str()).or_default().1 = Some(g);
    }

    merged
        .into_iter()
        .map(|(group, (prior, current))| {
            let prior_primary = prior.map(|g| g.primary_count);
            let current_primary = current.map(|g| g.primary_count);
            let prior_secondary = prior.map(|g| g.secondary_count);
            let current_secondary = current.map(|g| g.secondary_count);
            let prior_ratio_percent = prior.and_then(|g| g.ratio_percent);
            let current_ratio_percent = current.and_then(|g| g.ratio_percent);
            GroupComparison {
                group: group.to_string(),
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
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reconcile::ReconcileReport;

    fn rec_row(key: &str, city: &str, primary: u64, secondary: f64) -> ReconciledRow {
        let ratio = (primary > 0).then(|| secondary / primary as f64);
        ReconciledRow {
            entity_key: key.to_string(),
            entity_display: key.to_string(),
            dims: vec![city.to_string()],
            primary_count: primary,
            secondary_count: secondary,
            ratio,
            ratio_percent: ratio.map(|r| round_to(r * 100.0, 2)),
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

    #[test]
    fn test_overview_totals() {
        let rec = reconciled(vec![
            rec_row("a", "HCM", 4, 2.0),
            rec_row("b", "HN", 6, 1.0),
            rec_row("c", "HN", 2, 3.0),
        ]);
        let overview = Overview::from_reconciled(&rec, 2);
        assert_eq!(overview.entities, 3);
        assert_eq!(overview.total_primary, 12);
        assert_eq!(overview.total_secondary, 6.0);
        assert_eq!(overview.ratio_percent, Some(50.0));
        assert_eq!(overview.anomalies, 1);
    }

    #[test]
    fn test_fanned_out_sum_counted_in_each_group() {
        let rec = reconciled(vec![rec_row("a", "HCM", 1, 2.0), rec_row("a", "HN", 1, 2.0)]);
        let groups = group_rollup(&rec, "city", 2).unwrap();
        assert_eq!(groups.iter().map(|g| g.secondary_count).sum::<f64>(), 4.0);
        assert_eq!(Overview::from_reconciled(&rec, 2).total_secondary, 2.0);
    }

    #[test]
    fn test_overview_counts_fanned_out_sum_once() {
        let rec = reconciled(vec![rec_row("a", "HCM", 1, 2.0), rec_row("a", "HN", 1, 2.0)]);
        let overview = Overview::from_reconciled(&rec, 2);
        assert_eq!(overview.entities, 1);
        assert_eq!(overview.total_primary, 2);
        assert_eq!(overview.total_secondary, 2.0);
    }

    #[test]
    fn test_overview_skips_orphans() {
        let mut orphan = rec_row("z", "Unknown", 0, 9.0);
        orphan.is_orphan = true;
        let rec = reconciled(vec![rec_row("a", "HCM", 2, 1.0), orphan]);
        let overview = Overview::from_reconciled(&rec, 2);
        assert_eq!(overview.entities, 1);
        assert_eq!(overview.total_secondary, 1.0);
    }

    #[test]
    fn test_group_rollup_by_city() {
        let rec = reconciled(vec![
            rec_row("a", "HCM", 4, 2.0),
            rec_row("b", "HN", 6, 1.0),
            rec_row("c", "HN", 2, 3.0),
        ]);
        let groups = group_rollup(&rec, "city", 2).unwrap();
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].group, "HCM");
        assert_eq!(groups[0].ratio_percent, Some(50.0));
        assert_eq!(groups[1].group, "HN");
        assert_eq!(groups[1].entities, 2);
        assert_eq!(groups[1].primary_count, 8);
        assert_eq!(groups[1].secondary_count, 4.0);
        assert_eq!(groups[1].ratio_percent, Some(50.0));
    }

    #[test]
    fn test_group_rollup_unknown_dim() {
        let rec = reconciled(vec![rec_row("a", "HCM", 4, 2.0)]);
        assert!(group_rollup(&rec, "brand", 2).is_err());
    }

    #[test]
    fn test_compare_groups_outer_join() {
        let before = group_rollup(
            &reconciled(vec![rec_row("a", "HCM", 4, 2.0), rec_row("b", "DN", 0, 0.0)]),
            "city",
            2,
        )
        .unwrap();
        let after = group_rollup(
            &reconciled(vec![rec_row("a", "HCM", 4, 3.0), rec_row("c", "HN", 2, 1.0)]),
            "city",
            2,
        )
        .unwrap();
        let cmp = compare_groups(&before, &after);
        let groups: Vec<&str> = cmp.iter().map(|g| g.group.as_str()).collect();
        assert_eq!(groups, vec!["DN", "HCM", "HN"]);

        let dn = &cmp[0];
        assert_eq!(dn.prior_ratio_percent, None);
        assert_eq!(dn.current_primary, None);
        assert_eq!(dn.primary_pct_change, None);

        let hcm = &cmp[1];
        assert_eq!(hcm.secondary_pct_change, Some(50.0));
        assert_eq!(hcm.ratio_pct_change, Some(50.0));

        let hn = &cmp[2];
        assert_eq!(hn.prior_primary, None);
        assert_eq!(hn.ratio_pct_change, None);
    }
}
