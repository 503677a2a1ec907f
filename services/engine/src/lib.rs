//! Engine - Reconciliation and ranking core for signup conversion reports
//!
//! Stages:
//! - Normalizer: maps heterogeneous tables onto a canonical schema
//! - Reconciler: joins a distinct-count source with a summed source and
//!   derives the conversion ratio
//! - Ranker: dense ranks (global or per group) and snapshot comparison
//! - Funnel and trend: single-source views of the signup export (daily
//!   status funnel, weekly ranks with week-over-week movement)
//!
//! Everything here is synchronous and side-effect free: the same tables and
//! configuration always produce the same output, row for row.

pub mod error;
pub mod funnel;
pub mod movement;
pub mod normalize;
pub mod pipeline;
pub mod quality;
pub mod rank;
pub mod reconcile;
pub mod summary;
pub mod table;
pub mod trend;

pub use error::{EngineError, MissingField, Result};
pub use funnel::{
    daily_funnel, new_recruit_wow, report_weeks, Funnel, FunnelCell, FunnelConfig, FunnelDay,
    FunnelOutput, Stage, StatusBuckets, WeekOverWeek, WeekOverWeekRow,
};
pub use movement::{
    ranking_movement, read_ranking, Movement, MovementOptions, MovementRow, RankingEntry,
    RankingMovement, RankingReport,
};
pub use normalize::{
    normalize, normalize_header, CanonicalRow, CanonicalTable, EmptyNamePolicy, FieldMapping,
    HeaderAliases, NormalizeReport, PeriodGrain,
};
pub use pipeline::{Pipeline, PipelineConfig, PipelineConfigBuilder, PipelineOutput, SnapshotOutput};
pub use quality::QualityReport;
pub use rank::{
    compare, dense_rank, pct_change, rank_table, Comparison, ComparisonRow, EntryStatus,
    RankScope, RankedRow, RankedTable, SortMetric,
};
pub use reconcile::{
    reconcile, DateWindow, OrphanPolicy, OrphanRow, ReconcileOptions, ReconcileReport, Reconciled,
    ReconciledRow,
};
pub use summary::{compare_groups, group_rollup, GroupComparison, GroupSummary, Overview};
pub use table::{ColumnLocator, Table, Value};
pub use trend::{weekly_trend, Trend, TrendConfig, TrendOutput, TrendRow, WeekTotal};

/// Display name used for rows whose entity name is blank
pub const UNKNOWN_ENTITY: &str = "unknown";

/// Value used for blank grouping dimensions
pub const UNKNOWN_DIM: &str = "Unknown";

/// Derive the join key from an entity display name.
///
/// `entity_key(" Foo ") == entity_key("FOO") == "foo"`.
pub fn entity_key(display_name: &str) -> String {
    display_name.trim().to_lowercase()
}

/// Round `value` to `decimals` places, half away from zero.
pub fn round_to(value: f64, decimals: u32) -> f64 {
    let factor = 10f64.powi(decimals as i32);
    (value * factor).round() / factor
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entity_key_trims_and_lowercases() {
        assert_eq!(entity_key(" Foo "), "foo");
        assert_eq!(entity_key("foo"), "foo");
        assert_eq!(entity_key("FOO"), "foo");
        assert_eq!(entity_key(" Foo "), entity_key("FOO"));
    }

    #[test]
    fn test_entity_key_keeps_inner_spacing() {
        assert_eq!(entity_key("  Grand  Hotel "), "grand  hotel");
    }

    #[test]
    fn test_entity_key_blank() {
        assert_eq!(entity_key("   "), "");
    }

    #[test]
    fn test_round_to() {
        assert_eq!(round_to(66.666_666, 2), 66.67);
        assert_eq!(round_to(12.5, 0), 13.0);
        assert_eq!(round_to(0.0, 2), 0.0);
        assert_eq!(round_to(200.0, 2), 200.0);
    }
}
