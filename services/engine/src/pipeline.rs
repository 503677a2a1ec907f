//! Pipeline - one configurable normalize -> reconcile -> rank run
//!
//! A [`PipelineConfig`] is plain data (deserialisable from JSON) holding the
//! field mappings, window, join and ranking options. [`Pipeline`] validates it
//! once and can then be run any number of times; it keeps no state between runs.

use crate::error::{EngineError, Result};
use crate::normalize::{normalize, CanonicalTable, FieldMapping, HeaderAliases};
use crate::quality::QualityReport;
use crate::rank::{compare, rank_table, Comparison, RankScope, RankedTable, SortMetric};
use crate::reconcile::{
    default_decimals, reconcile, DateWindow, OrphanPolicy, ReconcileOptions, Reconciled,
};
use crate::summary::{compare_groups, group_rollup, GroupComparison, GroupSummary, Overview};
use crate::table::Table;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::info;

const MAX_DECIMALS: u32 = 10;

fn default_movers() -> usize {
    5
}

fn unknown_dim(dim: &str, available: &[String]) -> EngineError {
    EngineError::UnknownDimension {
        dim: dim.to_string(),
        available: available.to_vec(),
    }
}

// =============================================================================
// Configuration
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Distinct-count source (e.g. reservations)
    pub primary: FieldMapping,
    /// Summed source (e.g. signups)
    pub secondary: FieldMapping,
    /// Extra header spellings, `spelling -> canonical`
    #[serde(default)]
    pub aliases: BTreeMap<String, String>,
    #[serde(default)]
    pub window: DateWindow,
    #[serde(default)]
    pub join_dims: Vec<String>,
    #[serde(default)]
    pub orphans: OrphanPolicy,
    #[serde(default = "default_decimals")]
    pub decimals: u32,
    #[serde(default)]
    pub metric: SortMetric,
    #[serde(default)]
    pub scope: RankScope,
    /// Dimension to summarise per group value
    #[serde(default)]
    pub rollup: Option<String>,
    /// How many gainers/losers to report in comparisons
    #[serde(default = "default_movers")]
    pub movers: usize,
}

impl PipelineConfig {
    pub fn builder() -> PipelineConfigBuilder {
        PipelineConfigBuilder::default()
    }

    /// Reservation export (distinct tenants per hotel, city and brand model)
    /// against the signup export (summed signups per hotel).
    ///
    /// Signup files have unstable headers, so date and count are positional.
    pub fn hotel_signups() -> Self {
        Self {
            primary: FieldMapping::new("reservations", "Hotel Name", "Checkin")
                .subject("tenant_id")
                .dim("city", "City")
                .dim("brand_model", 1)
                .min_columns(5),
            secondary: FieldMapping::new("signups", "hotel_short_name", 4)
                .count(5)
                .min_columns(6),
            aliases: BTreeMap::new(),
            window: DateWindow::default(),
            join_dims: Vec::new(),
            orphans: OrphanPolicy::Drop,
            decimals: default_decimals(),
            metric: SortMetric::Ratio,
            scope: RankScope::Global,
            rollup: Some("city".to_string()),
            movers: default_movers(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        self.window.validate()?;
        if self.decimals > MAX_DECIMALS {
            return Err(EngineError::InvalidConfig(format!(
                "decimals must be at most {}, got {}",
                MAX_DECIMALS, self.decimals
            )));
        }

        let primary_dims = self.primary.dim_names();
        let secondary_dims = self.secondary.dim_names();
        for dim in &self.join_dims {
            if !primary_dims.contains(dim) {
                return Err(unknown_dim(dim, &primary_dims));
            }
            if !secondary_dims.contains(dim) {
                return Err(unknown_dim(dim, &secondary_dims));
            }
        }
        if let RankScope::Grouped(dims) = &self.scope {
            if dims.is_empty() {
                return Err(EngineError::InvalidConfig(
                    "grouped ranking needs at least one dimension".to_string(),
                ));
            }
        }
        for dim in self.scope.dims().iter().chain(self.rollup.iter()) {
            if !primary_dims.contains(dim) {
                return Err(unknown_dim(dim, &primary_dims));
            }
        }
        Ok(())
    }

    fn reconcile_options(&self, window: DateWindow) -> ReconcileOptions {
        ReconcileOptions {
            window,
            join_dims: self.join_dims.clone(),
            orphans: self.orphans,
            decimals: self.decimals,
        }
    }
}

/// Builder for [`PipelineConfig`]; `build` validates the result
#[derive(Debug, Default)]
pub struct PipelineConfigBuilder {
    primary: Option<FieldMapping>,
    secondary: Option<FieldMapping>,
    aliases: BTreeMap<String, String>,
    window: DateWindow,
    join_dims: Vec<String>,
    orphans: OrphanPolicy,
    decimals: Option<u32>,
    metric: SortMetric,
    scope: RankScope,
    rollup: Option<String>,
    movers: Option<usize>,
}

impl PipelineConfigBuilder {
    pub fn primary(mut self, mapping: FieldMapping) -> Self {
        self.primary = Some(mapping);
        self
    }

    pub fn secondary(mut self, mapping: FieldMapping) -> Self {
        self.secondary = Some(mapping);
        self
    }

    pub fn alias(mut self, spelling: impl Into<String>, canonical: impl Into<String>) -> Self {
        self.aliases.insert(spelling.into(), canonical.into());
        self
    }

    pub fn window(mut self, window: DateWindow) -> Self {
        self.window = window;
        self
    }

    pub fn join_dim(mut self, dim: impl Into<String>) -> Self {
        self.join_dims.push(dim.into());
        self
    }

    pub fn orphans(mut self, policy: OrphanPolicy) -> Self {
        self.orphans = policy;
        self
    }

    pub fn decimals(mut self, decimals: u32) -> Self {
        self.decimals = Some(decimals);
        self
    }

    pub fn metric(mut self, metric: SortMetric) -> Self {
        self.metric = metric;
        self
    }

    pub fn scope(mut self, scope: RankScope) -> Self {
        self.scope = scope;
        self
    }

    pub fn group_by<I, S>(self, dims: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.scope(RankScope::Grouped(dims.into_iter().map(Into::into).collect()))
    }

    pub fn rollup(mut self, dim: impl Into<String>) -> Self {
        self.rollup = Some(dim.into());
        self
    }

    pub fn movers(mut self, n: usize) -> Self {
        self.movers = Some(n);
        self
    }

    pub fn build(self) -> Result<PipelineConfig> {
        let missing = |what: &str| EngineError::InvalidConfig(format!("{} mapping is required", what));
        let config = PipelineConfig {
            primary: self.primary.ok_or_else(|| missing("primary"))?,
            secondary: self.secondary.ok_or_else(|| missing("secondary"))?,
            aliases: self.aliases,
            window: self.window,
            join_dims: self.join_dims,
            orphans: self.orphans,
            decimals: self.decimals.unwrap_or_else(default_decimals),
            metric: self.metric,
            scope: self.scope,
            rollup: self.rollup,
            movers: self.movers.unwrap_or_else(default_movers),
        };
        config.validate()?;
        Ok(config)
    }
}

// =============================================================================
// Outputs
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PipelineOutput {
    pub reconciled: Reconciled,
    pub ranked: RankedTable,
    pub overview: Overview,
    /// Per-group summary when a rollup dimension is configured
    pub groups: Option<Vec<GroupSummary>>,
    pub quality: QualityReport,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SnapshotOutput {
    pub before: PipelineOutput,
    pub after: PipelineOutput,
    pub comparison: Comparison,
    pub group_comparison: Option<Vec<GroupComparison>>,
}

// =============================================================================
// Pipeline
// =============================================================================

#[derive(Debug, Clone)]
pub struct Pipeline {
    config: PipelineConfig,
    aliases: HeaderAliases,
}

impl Pipeline {
    pub fn new(config: PipelineConfig) -> Result<Self> {
        config.validate()?;
        let aliases = config
            .aliases
            .iter()
            .fold(HeaderAliases::default(), |a, (spelling, canonical)| {
                a.with(spelling, canonical)
            });
        Ok(Self { config, aliases })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    fn normalize_inputs(&self, primary: &Table, secondary: &Table) -> Result<(CanonicalTable, CanonicalTable)> {
        let primary = normalize(primary, &self.config.primary, &self.aliases)?;
        let secondary = normalize(secondary, &self.config.secondary, &self.aliases)?;
        Ok((primary, secondary))
    }

    fn run_window(
        &self,
        primary: &CanonicalTable,
        secondary: &CanonicalTable,
        window: DateWindow,
    ) -> Result<PipelineOutput> {
        let cfg = &self.config;
        let reconciled = reconcile(primary, secondary, &cfg.reconcile_options(window))?;
        let ranked = rank_table(&reconciled, cfg.metric, &cfg.scope)?;
        let overview = Overview::from_reconciled(&reconciled, cfg.decimals);
        let groups = cfg
            .rollup
            .as_deref()
            .map(|dim| group_rollup(&reconciled, dim, cfg.decimals))
            .transpose()?;
        let quality = QualityReport::new(&primary.report, &secondary.report, &reconciled);

        info!(
            entities = overview.entities,
            rows = reconciled.rows.len(),
            anomalies = quality.anomalies,
            orphans = quality.orphans,
            "Pipeline run complete"
        );

        Ok(PipelineOutput {
            reconciled,
            ranked,
            overview,
            groups,
            quality,
        })
    }

    /// Run over the configured window
    pub fn run(&self, primary: &Table, secondary: &Table) -> Result<PipelineOutput> {
        let (primary, secondary) = self.normalize_inputs(primary, secondary)?;
        self.run_window(&primary, &secondary, self.config.window)
    }

    /// Run the same inputs over two windows and compare the rankings
    pub fn run_snapshots(
        &self,
        primary: &Table,
        secondary: &Table,
        before: DateWindow,
        after: DateWindow,
    ) -> Result<SnapshotOutput> {
        let (primary, secondary) = self.normalize_inputs(primary, secondary)?;
        let before = self.run_window(&primary, &secondary, before)?;
        let after = self.run_window(&primary, &secondary, after)?;
        let comparison = compare(&before.ranked, &after.ranked)?;
        let group_comparison = match (&before.groups, &after.groups) {
            (Some(b), Some(a)) => Some(compare_groups(b, a)),
            _ => None,
        };

        Ok(SnapshotOutput {
            before,
            after,
            comparison,
            group_comparison,
        })
    }
}
