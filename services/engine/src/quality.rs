//! Row-level data quality report returned alongside every pipeline result

use crate::normalize::NormalizeReport;
use crate::reconcile::Reconciled;
use serde::Serialize;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QualityReport {
    pub primary: NormalizeReport,
    pub secondary: NormalizeReport,
    pub primary_outside_window: usize,
    pub secondary_outside_window: usize,
    /// Rows with ratio above 100%
    pub anomalies: usize,
    /// Secondary-only entities
    pub orphans: usize,
    pub fanned_out_keys: usize,
    pub secondary_empty: bool,
}

impl QualityReport {
    pub fn new(primary: &NormalizeReport, secondary: &NormalizeReport, reconciled: &Reconciled) -> Self {
        let r = &reconciled.report;
        Self {
            primary: primary.clone(),
            secondary: secondary.clone(),
            primary_outside_window: r.primary_outside_window,
            secondary_outside_window: r.secondary_outside_window,
            anomalies: r.anomalies,
            orphans: r.orphans,
            fanned_out_keys: r.fanned_out_keys,
            secondary_empty: r.secondary_empty,
        }
    }

    pub fn dropped_invalid_date(&self) -> usize {
        self.primary.dropped_invalid_date + self.secondary.dropped_invalid_date
    }

    /// Human-readable lines for every non-zero problem counter
    pub fn warnings(&self) -> Vec<String> {
        let mut out = Vec::new();
        for (name, report) in [("primary", &self.primary), ("secondary", &self.secondary)] {
            if report.dropped_invalid_date > 0 {
                out.push(format!(
                    "{}: {} row(s) dropped for invalid dates",
                    name, report.dropped_invalid_date
                ));
            }
            if report.dropped_empty_name > 0 {
                out.push(format!(
                    "{}: {} row(s) dropped for blank names",
                    name, report.dropped_empty_name
                ));
            }
            if report.coerced_counts > 0 {
                out.push(format!(
                    "{}: {} non-numeric count(s) treated as 0",
                    name, report.coerced_counts
                ));
            }
        }
        if self.secondary_empty {
            out.push("secondary source is empty in the window".to_string());
        }
        if self.anomalies > 0 {
            out.push(format!("{} row(s) with ratio above 100%", self.anomalies));
        }
        if self.orphans > 0 {
            out.push(format!("{} secondary-only entit(ies)", self.orphans));
        }
        if self.fanned_out_keys > 0 {
            out.push(format!(
                "{} secondary key(s) matched several primary rows",
                self.fanned_out_keys
            ));
        }
        out
    }
}
