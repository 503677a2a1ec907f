//! Parser Service - Batch signup conversion report
//!
//! Responsibilities:
//! - Load reservation and signup exports (CSV or spreadsheet)
//! - Run the reconciliation pipeline over one or two date windows
//! - Build the daily status funnel and the weekly signup trend
//! - Compare two previously exported ranking files
//! - Export ranked tables as CSV and the data quality report as JSON
//!
//! CRITICAL: This service must be DETERMINISTIC
//! Same input files + same configuration = byte-identical output files

use anyhow::{bail, Context, Result};
use calamine::{open_workbook_auto, Data, Reader};
use chrono::NaiveDate;
use clap::{Args as ClapArgs, Parser, Subcommand, ValueEnum};
use engine::{
    ranking_movement, ComparisonRow, DateWindow, EntryStatus, FunnelConfig, FunnelOutput,
    GroupComparison, GroupSummary, MovementOptions, NormalizeReport, OrphanPolicy, Overview,
    PeriodGrain, Pipeline, PipelineConfig, PipelineOutput, QualityReport, RankScope,
    RankingMovement, RankingReport, ReconciledRow,
    SnapshotOutput, SortMetric, Table, TrendConfig, TrendOutput, TrendRow, Value,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser, Debug)]
#[command(
    name = "parser",
    about = "Reconciles reservation and signup exports into conversion rankings"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Reconcile and rank a single date window
    Reconcile {
        #[command(flatten)]
        common: CommonArgs,

        /// First day of the window (inclusive)
        #[arg(long)]
        from: Option<NaiveDate>,

        /// Last day of the window (inclusive)
        #[arg(long)]
        to: Option<NaiveDate>,
    },
    /// Compare rankings between two date windows
    Compare {
        #[command(flatten)]
        common: CommonArgs,

        #[arg(long)]
        before_from: NaiveDate,

        #[arg(long)]
        before_to: NaiveDate,

        #[arg(long)]
        after_from: NaiveDate,

        #[arg(long)]
        after_to: NaiveDate,
    },
    /// Daily signup-status funnel per city, with week-over-week new recruits
    Funnel {
        /// Signup export with a status column
        #[arg(long)]
        signups: PathBuf,

        /// Funnel configuration (JSON); defaults to the signup status layout
        #[arg(long)]
        config: Option<PathBuf>,

        /// Anchor of the weekly view; the two full weeks before it are compared
        #[arg(long)]
        report_date: Option<NaiveDate>,

        /// First day of the daily table (inclusive)
        #[arg(long)]
        from: Option<NaiveDate>,

        /// Last day of the daily table (inclusive)
        #[arg(long)]
        to: Option<NaiveDate>,

        /// City columns, e.g. `HCM,HN,DN`
        #[arg(long, value_delimiter = ',')]
        cities: Vec<String>,

        #[command(flatten)]
        output: OutputArgs,
    },
    /// Weekly signup counts, ranks and week-over-week movement
    Trend {
        /// Signup export
        #[arg(long)]
        signups: PathBuf,

        /// Trend configuration (JSON); defaults to the signup export layout
        #[arg(long)]
        config: Option<PathBuf>,

        /// First week to keep, by its Monday
        #[arg(long)]
        from: Option<NaiveDate>,

        /// Last week to keep, by its Monday
        #[arg(long)]
        to: Option<NaiveDate>,

        /// Rows listed as top gainers and losers
        #[arg(long, default_value = "5")]
        movers: usize,

        #[command(flatten)]
        output: OutputArgs,
    },
    /// Rank movement between two exported ranking files
    Movement {
        /// Earlier ranking (e.g. last week's ranking.csv)
        #[arg(long)]
        before: PathBuf,

        /// Later ranking
        #[arg(long)]
        after: PathBuf,

        #[command(flatten)]
        output: OutputArgs,
    },
}

#[derive(ClapArgs, Debug, Clone, Default)]
struct OutputArgs {
    /// Output directory (falls back to OUTPUT_DIR, then ./output)
    #[arg(long)]
    out_dir: Option<PathBuf>,

    /// Dry run - print the summary without writing files
    #[arg(long, default_value = "false")]
    dry_run: bool,
}

#[derive(ClapArgs, Debug, Clone, Default)]
struct CommonArgs {
    /// Reservation export (distinct-count source)
    #[arg(long)]
    primary: PathBuf,

    /// Signup export (summed source)
    #[arg(long)]
    secondary: PathBuf,

    /// Pipeline configuration (JSON); defaults to the hotel signup layout
    #[arg(long)]
    config: Option<PathBuf>,

    /// Rank within these dimensions, e.g. `city` or `city,brand_model`
    #[arg(long, value_delimiter = ',')]
    group_by: Vec<String>,

    /// Metric to rank on
    #[arg(long, value_enum)]
    metric: Option<MetricArg>,

    /// Rank per ISO week (weeks start on Monday)
    #[arg(long, default_value = "false")]
    weekly: bool,

    /// Keep signup-only hotels in the main table
    #[arg(long, default_value = "false")]
    include_orphans: bool,

    /// Output directory (falls back to OUTPUT_DIR, then ./output)
    #[arg(long)]
    out_dir: Option<PathBuf>,

    /// Dry run - print the summary without writing files
    #[arg(long, default_value = "false")]
    dry_run: bool,
}

#[derive(ValueEnum, Debug, Clone, Copy)]
enum MetricArg {
    Ratio,
    PrimaryCount,
    SecondaryCount,
}

impl From<MetricArg> for SortMetric {
    fn from(m: MetricArg) -> Self {
        match m {
            MetricArg::Ratio => SortMetric::Ratio,
            MetricArg::PrimaryCount => SortMetric::PrimaryCount,
            MetricArg::SecondaryCount => SortMetric::SecondaryCount,
        }
    }
}

// =============================================================================
// CONFIGURATION
// =============================================================================

fn load_json_or<T: DeserializeOwned>(path: Option<&Path>, default: impl FnOnce() -> T) -> Result<T> {
    match path {
        Some(path) => {
            let content = fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file {}", path.display()))?;
            serde_json::from_str(&content)
                .with_context(|| format!("Failed to parse config file {}", path.display()))
        }
        None => Ok(default()),
    }
}

fn load_config(common: &CommonArgs) -> Result<PipelineConfig> {
    let mut config = load_json_or(common.config.as_deref(), PipelineConfig::hotel_signups)?;
    apply_overrides(&mut config, common);
    Ok(config)
}

/// Command-line flags take precedence over the configuration file
fn apply_overrides(config: &mut PipelineConfig, common: &CommonArgs) {
    if !common.group_by.is_empty() {
        config.scope = RankScope::Grouped(common.group_by.clone());
    }
    if let Some(metric) = common.metric {
        config.metric = metric.into();
    }
    if common.include_orphans {
        config.orphans = OrphanPolicy::Include;
    }
    if common.weekly {
        let week = PeriodGrain::Week.dim_name().to_string();
        config.primary.period = Some(PeriodGrain::Week);
        config.secondary.period = Some(PeriodGrain::Week);
        if !config.join_dims.contains(&week) {
            config.join_dims.push(week.clone());
        }
        config.scope = match &config.scope {
            RankScope::Global => RankScope::Grouped(vec![week]),
            RankScope::Grouped(dims) if dims.contains(&week) => RankScope::Grouped(dims.clone()),
            RankScope::Grouped(dims) => {
                RankScope::Grouped(std::iter::once(week).chain(dims.iter().cloned()).collect())
            }
        };
    }
}

fn output_dir(out_dir: Option<&Path>) -> PathBuf {
    out_dir
        .map(Path::to_path_buf)
        .or_else(|| std::env::var("OUTPUT_DIR").ok().map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from("output"))
}

// =============================================================================
// LOADING - CSV (comma or semicolon, UTF-8 or Windows-1252) and spreadsheets
// =============================================================================

const SPREADSHEET_EXTENSIONS: &[&str] = &["xls", "xlsx", "xlsm", "xlsb", "ods"];

fn load_table(path: &Path) -> Result<Table> {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_lowercase())
        .unwrap_or_default();

    let table = if SPREADSHEET_EXTENSIONS.contains(&ext.as_str()) {
        load_spreadsheet(path)?
    } else if ext == "csv" || ext == "txt" {
        let bytes = fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
        parse_csv(&decode_text(&bytes))
            .with_context(|| format!("Failed to parse CSV {}", path.display()))?
    } else {
        bail!(
            "Unsupported file type '{}' for {} (expected .csv, .xls, .xlsx or .ods)",
            ext,
            path.display()
        );
    };

    info!(
        file = %path.display(),
        rows = table.len(),
        columns = table.width(),
        "Loaded table"
    );
    Ok(table)
}

/// Decode file bytes: UTF-8 (BOM stripped), falling back to Windows-1252
fn decode_text(bytes: &[u8]) -> String {
    let bytes = bytes.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(bytes);
    match std::str::from_utf8(bytes) {
        Ok(text) => text.to_string(),
        Err(_) => {
            warn!("File is not valid UTF-8, decoding as Windows-1252");
            let (text, _, _) = encoding_rs::WINDOWS_1252.decode(bytes);
            text.into_owned()
        }
    }
}

/// Pick `;` when the header line has more semicolons than commas
fn detect_delimiter(text: &str) -> u8 {
    let header = text.lines().next().unwrap_or_default();
    let semicolons = header.matches(';').count();
    let commas = header.matches(',').count();
    if semicolons > commas {
        b';'
    } else {
        b','
    }
}

/// Parse CSV content into a table
/// This function is DETERMINISTIC: same input = same output
fn parse_csv(content: &str) -> Result<Table> {
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(detect_delimiter(content))
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(content.as_bytes());

    let headers: Vec<String> = reader
        .headers()
        .context("Failed to read CSV headers")?
        .iter()
        .map(|h| h.to_string())
        .collect();

    let mut rows = Vec::new();
    for (line_idx, result) in reader.records().enumerate() {
        let record = match result {
            Ok(r) => r,
            Err(e) => {
                warn!(line = line_idx + 2, error = %e, "Skipping unreadable CSV line");
                continue;
            }
        };
        if record.iter().all(|f| f.is_empty()) {
            continue;
        }
        rows.push(
            record
                .iter()
                .map(|f| {
                    if f.is_empty() {
                        Value::Null
                    } else {
                        Value::Text(f.to_string())
                    }
                })
                .collect(),
        );
    }

    Ok(Table::new(headers, rows))
}

fn cell_value(cell: &Data) -> Value {
    match cell {
        Data::Int(i) => Value::Int(*i),
        Data::Float(f) => Value::Float(*f),
        Data::String(s) if s.trim().is_empty() => Value::Null,
        Data::String(s) => Value::Text(s.clone()),
        Data::Bool(b) => Value::Text(b.to_string()),
        Data::DateTime(dt) => dt.as_datetime().map_or(Value::Null, Value::DateTime),
        Data::DateTimeIso(s) | Data::DurationIso(s) => Value::Text(s.clone()),
        _ => Value::Null,
    }
}

/// Read the first sheet of a workbook; the first row holds the headers
fn load_spreadsheet(path: &Path) -> Result<Table> {
    // calamine auto-detects format: xls, xlsx, xlsb, ods
    let mut workbook = open_workbook_auto(path)
        .with_context(|| format!("Failed to open spreadsheet {}", path.display()))?;

    let sheet_names = workbook.sheet_names().to_vec();
    let sheet_name = match sheet_names.first() {
        Some(name) => name.clone(),
        None => bail!("Spreadsheet {} has no sheets", path.display()),
    };
    info!(sheet = %sheet_name, sheets = sheet_names.len(), "Reading first sheet");

    let range = workbook
        .worksheet_range(&sheet_name)
        .with_context(|| format!("Failed to read sheet '{}'", sheet_name))?;

    let mut rows = range.rows();
    let headers: Vec<String> = rows
        .next()
        .context("Sheet has no header row")?
        .iter()
        .map(|c| cell_value(c).as_text())
        .collect();
    let data: Vec<Vec<Value>> = rows
        .map(|r| r.iter().map(cell_value).collect::<Vec<_>>())
        .filter(|r| !r.iter().all(Value::is_blank))
        .collect();

    Ok(Table::new(headers, data))
}

// =============================================================================
// EXPORT - CSV tables and JSON reports
// =============================================================================

/// Undefined values are written as empty cells
fn fmt_opt(value: Option<f64>, decimals: u32) -> String {
    value
        .map(|v| format!("{:.*}", decimals as usize, v))
        .unwrap_or_default()
}

fn fmt_count(value: f64) -> String {
    if value.fract() == 0.0 && value.abs() < 1e15 {
        format!("{}", value as i64)
    } else {
        value.to_string()
    }
}

fn fmt_int<T: ToString>(value: Option<T>) -> String {
    value.map(|v| v.to_string()).unwrap_or_default()
}

fn write_csv(path: &Path, header: Vec<String>, rows: Vec<Vec<String>>) -> Result<()> {
    let mut writer =
        csv::Writer::from_path(path).with_context(|| format!("Failed to create {}", path.display()))?;
    writer.write_record(&header)?;
    for row in &rows {
        writer.write_record(row)?;
    }
    writer.flush()?;
    info!(file = %path.display(), rows = rows.len(), "Wrote CSV");
    Ok(())
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let content = serde_json::to_string_pretty(value)?;
    fs::write(path, content).with_context(|| format!("Failed to write {}", path.display()))?;
    info!(file = %path.display(), "Wrote JSON");
    Ok(())
}

fn header(fixed_before: &[&str], dims: &[String], fixed_after: &[&str]) -> Vec<String> {
    fixed_before
        .iter()
        .map(|s| s.to_string())
        .chain(dims.iter().cloned())
        .chain(fixed_after.iter().map(|s| s.to_string()))
        .collect()
}

fn reconciled_rows<'a>(
    rows: impl Iterator<Item = &'a ReconciledRow>,
    decimals: u32,
) -> Vec<Vec<String>> {
    rows.map(|r| {
        let mut out = vec![r.entity_key.clone(), r.entity_display.clone()];
        out.extend(r.dims.iter().cloned());
        out.extend([
            r.primary_count.to_string(),
            fmt_count(r.secondary_count),
            fmt_opt(r.ratio_percent, decimals),
            r.anomaly.to_string(),
            r.is_orphan.to_string(),
        ]);
        out
    })
    .collect()
}

const RECONCILED_TAIL: &[&str] = &[
    "primary_count",
    "secondary_count",
    "ratio_percent",
    "anomaly",
    "is_orphan",
];

fn export_output(dir: &Path, output: &PipelineOutput, decimals: u32) -> Result<()> {
    let rec = &output.reconciled;
    let reconciled_header = header(&["entity_key", "entity_display"], &rec.dim_names, RECONCILED_TAIL);

    write_csv(
        &dir.join("reconciled.csv"),
        reconciled_header.clone(),
        reconciled_rows(rec.rows.iter(), decimals),
    )?;
    write_csv(
        &dir.join("anomalies.csv"),
        reconciled_header,
        reconciled_rows(rec.anomalies(), decimals),
    )?;

    write_csv(
        &dir.join("orphans.csv"),
        header(&["entity_key", "entity_display"], &rec.join_dims, &["secondary_count"]),
        rec.orphans
            .iter()
            .map(|o| {
                let mut out = vec![o.entity_key.clone(), o.entity_display.clone()];
                out.extend(o.join_values.iter().cloned());
                out.push(fmt_count(o.secondary_count));
                out
            })
            .collect(),
    )?;

    write_csv(
        &dir.join("ranking.csv"),
        header(
            &["rank", "entity_display", "entity_key"],
            &output.ranked.dim_names,
            &["metric", "metric_value", "primary_count", "secondary_count", "ratio_percent", "anomaly"],
        ),
        output
            .ranked
            .rows
            .iter()
            .map(|r| {
                let mut out = vec![r.rank.to_string(), r.entity_display.clone(), r.entity_key.clone()];
                out.extend(r.dims.iter().cloned());
                out.extend([
                    r.metric.name().to_string(),
                    fmt_opt(r.metric_value, decimals),
                    r.primary_count.to_string(),
                    fmt_count(r.secondary_count),
                    fmt_opt(r.ratio_percent, decimals),
                    r.anomaly.to_string(),
                ]);
                out
            })
            .collect(),
    )?;

    Ok(())
}

fn comparison_rows(rows: &[ComparisonRow], decimals: u32) -> Vec<Vec<String>> {
    rows.iter()
        .map(|r| {
            let status = match r.status {
                EntryStatus::Continuing => "continuing",
                EntryStatus::NewEntrant => "new",
                EntryStatus::Dropped => "dropped",
            };
            let mut out = vec![r.entity_key.clone(), r.entity_display.clone()];
            out.extend(r.dims.iter().cloned());
            out.extend([
                status.to_string(),
                fmt_int(r.prior_rank),
                fmt_int(r.current_rank),
                fmt_int(r.rank_delta),
                metric_name(r.prior_sort_metric),
                metric_name(r.current_sort_metric),
                fmt_opt(r.prior_metric, decimals),
                fmt_opt(r.current_metric, decimals),
                fmt_opt(r.pct_change, decimals),
                fmt_int(r.prior_primary),
                fmt_int(r.current_primary),
                fmt_opt(r.primary_pct_change, decimals),
                r.prior_secondary.map(fmt_count).unwrap_or_default(),
                r.current_secondary.map(fmt_count).unwrap_or_default(),
                fmt_opt(r.secondary_pct_change, decimals),
                fmt_opt(r.prior_ratio_percent, decimals),
                fmt_opt(r.current_ratio_percent, decimals),
                fmt_opt(r.ratio_pct_change, decimals),
                r.prior_period.clone().unwrap_or_default(),
                r.current_period.clone().unwrap_or_default(),
            ]);
            out
        })
        .collect()
}

fn metric_name(metric: Option<SortMetric>) -> String {
    metric.map(|m| m.name().to_string()).unwrap_or_default()
}

const COMPARISON_TAIL: &[&str] = &[
    "status",
    "prior_rank",
    "current_rank",
    "rank_delta",
    "prior_sort_metric",
    "current_sort_metric",
    "prior_metric",
    "current_metric",
    "pct_change",
    "prior_primary",
    "current_primary",
    "primary_pct_change",
    "prior_secondary",
    "current_secondary",
    "secondary_pct_change",
    "prior_ratio_percent",
    "current_ratio_percent",
    "ratio_pct_change",
    "prior_period",
    "current_period",
];

fn group_comparison_rows(rows: &[GroupComparison], decimals: u32) -> Vec<Vec<String>> {
    rows.iter()
        .map(|g| {
            vec![
                g.group.clone(),
                fmt_int(g.prior_primary),
                fmt_int(g.current_primary),
                fmt_opt(g.primary_pct_change, decimals),
                g.prior_secondary.map(fmt_count).unwrap_or_default(),
                g.current_secondary.map(fmt_count).unwrap_or_default(),
                fmt_opt(g.secondary_pct_change, decimals),
                fmt_opt(g.prior_ratio_percent, decimals),
                fmt_opt(g.current_ratio_percent, decimals),
                fmt_opt(g.ratio_pct_change, decimals),
            ]
        })
        .collect()
}

#[derive(Serialize)]
struct RunSummary<'a> {
    window: DateWindow,
    overview: &'a Overview,
    groups: Option<&'a [GroupSummary]>,
    quality: &'a QualityReport,
    warnings: Vec<String>,
}

impl<'a> RunSummary<'a> {
    fn new(window: DateWindow, output: &'a PipelineOutput) -> Self {
        Self {
            window,
            overview: &output.overview,
            groups: output.groups.as_deref(),
            quality: &output.quality,
            warnings: output.quality.warnings(),
        }
    }
}

#[derive(Serialize)]
struct CompareSummary<'a> {
    before: RunSummary<'a>,
    after: RunSummary<'a>,
    new_entrants: usize,
    improving_share: Option<f64>,
    top_gainers: Vec<&'a ComparisonRow>,
    top_losers: Vec<&'a ComparisonRow>,
}

// =============================================================================
// CONSOLE SUMMARY
// =============================================================================

fn describe_window(window: &DateWindow) -> String {
    let bound = |d: Option<NaiveDate>| d.map_or("*".to_string(), |d| d.to_string());
    format!("{} .. {}", bound(window.from), bound(window.to))
}

fn print_output(label: &str, window: &DateWindow, output: &PipelineOutput, decimals: u32) {
    let o = &output.overview;
    println!("\n=== {} ({}) ===", label, describe_window(window));
    println!(
        "Entities: {} | Primary: {} | Secondary: {} | Ratio: {}",
        o.entities,
        o.total_primary,
        fmt_count(o.total_secondary),
        o.ratio_percent
            .map_or("n/a".to_string(), |r| format!("{:.*}%", decimals as usize, r))
    );
    for warning in output.quality.warnings() {
        println!("  ! {}", warning);
    }
    for row in output.ranked.rows.iter().take(5) {
        let group = if row.group.is_empty() {
            String::new()
        } else {
            format!(" [{}]", row.group.join(" / "))
        };
        println!(
            "  [{}] {}{} | {} = {}",
            row.rank,
            row.entity_display,
            group,
            row.metric.name(),
            fmt_opt(row.metric_value, decimals)
        );
    }
    if output.ranked.rows.len() > 5 {
        println!("  ... and {} more", output.ranked.rows.len() - 5);
    }
}

fn print_comparison(snapshots: &SnapshotOutput, movers: usize) {
    let cmp = &snapshots.comparison;
    println!("\n=== Comparison ===");
    println!("New entrants: {}", cmp.new_entrants());
    match cmp.improving_share() {
        Some(share) => println!("Improving: {:.1}% of continuing entities", share),
        None => println!("Improving: n/a (no continuing entities)"),
    }
    for row in cmp.top_gainers(movers) {
        println!("  + {} ({:+})", row.entity_display, row.rank_delta.unwrap_or(0));
    }
    for row in cmp.top_losers(movers) {
        println!("  - {} ({:+})", row.entity_display, row.rank_delta.unwrap_or(0));
    }
}

// =============================================================================
// EXPORT - funnel, trend and ranking movement
// =============================================================================

fn funnel_header(cities: &[String]) -> Vec<String> {
    let mut out = vec!["date".to_string()];
    for city in cities {
        for stage in ["not_signed_up", "members", "new_recruits"] {
            out.push(format!("{}_{}", city, stage));
        }
    }
    out.push("total_new_recruits".to_string());
    out
}

fn export_funnel(dir: &Path, output: &FunnelOutput, decimals: u32) -> Result<()> {
    let daily = &output.daily;
    write_csv(
        &dir.join("funnel_daily.csv"),
        funnel_header(&daily.cities),
        daily
            .days
            .iter()
            .map(|day| {
                let mut out = vec![day.date.to_string()];
                for cell in &day.cities {
                    out.extend([
                        fmt_count(cell.not_signed_up),
                        fmt_count(cell.members),
                        fmt_count(cell.new_recruits),
                    ]);
                }
                out.push(fmt_count(day.total_new_recruits));
                out
            })
            .collect(),
    )?;

    let wow = &output.week_over_week;
    write_csv(
        &dir.join("week_over_week.csv"),
        header(&["city", "prev_week", "last_week", "pct_change"], &[], &[]),
        wow.rows
            .iter()
            .chain(std::iter::once(&wow.total))
            .map(|r| {
                vec![
                    r.city.clone(),
                    fmt_count(r.prev_week),
                    fmt_count(r.last_week),
                    fmt_opt(r.pct_change, decimals),
                ]
            })
            .collect(),
    )?;

    write_json(
        &dir.join("funnel.json"),
        &FunnelSummary {
            prev_week: describe_window(&wow.prev_week),
            last_week: describe_window(&wow.last_week),
            unmatched_status: daily.unmatched_status,
            outside_window: daily.outside_window,
            normalize: &output.report,
        },
    )
}

#[derive(Serialize)]
struct FunnelSummary<'a> {
    prev_week: String,
    last_week: String,
    unmatched_status: usize,
    outside_window: usize,
    normalize: &'a NormalizeReport,
}

const TREND_TAIL: &[&str] = &["count", "prev_count", "pct_change", "rank_delta"];

fn export_trend(dir: &Path, output: &TrendOutput, movers: usize, decimals: u32) -> Result<()> {
    let trend = &output.trend;
    write_csv(
        &dir.join("trend.csv"),
        header(&["week", "rank", "entity_display", "entity_key"], &trend.dim_names, TREND_TAIL),
        trend
            .rows
            .iter()
            .map(|r| {
                let mut out = vec![
                    r.week.to_string(),
                    r.rank.to_string(),
                    r.entity_display.clone(),
                    r.entity_key.clone(),
                ];
                out.extend(r.dims.iter().cloned());
                out.extend([
                    fmt_count(r.count),
                    r.prev_count.map(fmt_count).unwrap_or_default(),
                    fmt_opt(r.pct_change, decimals),
                    fmt_int(r.rank_delta),
                ]);
                out
            })
            .collect(),
    )?;

    write_csv(
        &dir.join("trend_totals.csv"),
        header(&["week", "count", "entities", "pct_change"], &[], &[]),
        trend
            .totals
            .iter()
            .map(|t| {
                vec![
                    t.week.to_string(),
                    fmt_count(t.count),
                    t.entities.to_string(),
                    fmt_opt(t.pct_change, decimals),
                ]
            })
            .collect(),
    )?;

    write_json(
        &dir.join("trend.json"),
        &TrendSummary {
            latest_week: trend.latest_week(),
            improving_share: trend.improving_share(),
            top_gainers: trend.top_gainers(movers),
            top_losers: trend.top_losers(movers),
            normalize: &output.report,
        },
    )
}

#[derive(Serialize)]
struct TrendSummary<'a> {
    latest_week: Option<NaiveDate>,
    improving_share: Option<f64>,
    top_gainers: Vec<&'a TrendRow>,
    top_losers: Vec<&'a TrendRow>,
    normalize: &'a NormalizeReport,
}

const MOVEMENT_HEADER: &[&str] = &[
    "entity_key",
    "entity_display",
    "city",
    "brand_model",
    "last_rank",
    "current_rank",
    "rank_change",
    "movement",
    "last_signups",
    "current_signups",
    "signup_growth",
    "conversion_percent",
];

fn export_movement(dir: &Path, movement: &RankingMovement, options: MovementOptions) -> Result<()> {
    write_csv(
        &dir.join("movement.csv"),
        header(MOVEMENT_HEADER, &[], &[]),
        movement
            .rows
            .iter()
            .map(|r| {
                vec![
                    r.entity_key.clone(),
                    r.entity_display.clone(),
                    r.city.clone().unwrap_or_default(),
                    r.brand_model.clone().unwrap_or_default(),
                    fmt_int(r.last_rank),
                    r.current_rank.to_string(),
                    fmt_int(r.rank_change),
                    r.movement.label(),
                    r.last_signups.map(fmt_count).unwrap_or_default(),
                    fmt_count(r.current_signups),
                    fmt_opt(r.signup_growth, options.growth_decimals),
                    fmt_opt(r.conversion_percent, options.conversion_decimals),
                ]
            })
            .collect(),
    )?;
    write_json(&dir.join("movement.json"), &MovementSummary::new(movement))
}

#[derive(Serialize)]
struct MovementSummary<'a> {
    new_entries: usize,
    dropped: &'a [String],
    before: &'a RankingReport,
    after: &'a RankingReport,
}

impl<'a> MovementSummary<'a> {
    fn new(movement: &'a RankingMovement) -> Self {
        Self {
            new_entries: movement.new_entries(),
            dropped: &movement.dropped,
            before: &movement.before,
            after: &movement.after,
        }
    }
}

// =============================================================================
// COMMANDS
// =============================================================================

fn prepare(common: &CommonArgs, window: Option<DateWindow>) -> Result<(Pipeline, Table, Table)> {
    let mut config = load_config(common)?;
    if let Some(window) = window {
        config.window = window;
    }
    let pipeline = Pipeline::new(config).context("Invalid pipeline configuration")?;
    let primary = load_table(&common.primary)?;
    let secondary = load_table(&common.secondary)?;
    Ok((pipeline, primary, secondary))
}

fn create_out_dir(out_dir: Option<&Path>) -> Result<PathBuf> {
    let dir = output_dir(out_dir);
    fs::create_dir_all(&dir)
        .with_context(|| format!("Failed to create output directory {}", dir.display()))?;
    Ok(dir)
}

fn run_reconcile(common: &CommonArgs, from: Option<NaiveDate>, to: Option<NaiveDate>) -> Result<()> {
    let window = DateWindow { from, to };
    let (pipeline, primary, secondary) = prepare(common, Some(window))?;
    let decimals = pipeline.config().decimals;

    let output = pipeline
        .run(&primary, &secondary)
        .context("Reconciliation failed")?;
    print_output("Report", &window, &output, decimals);

    if common.dry_run {
        println!("\nDry run - no files written");
        return Ok(());
    }

    let dir = create_out_dir(common.out_dir.as_deref())?;
    export_output(&dir, &output, decimals)?;
    write_json(&dir.join("quality.json"), &RunSummary::new(window, &output))?;
    println!("\nWrote report to {}", dir.display());
    Ok(())
}

fn run_compare(common: &CommonArgs, before: DateWindow, after: DateWindow) -> Result<()> {
    let (pipeline, primary, secondary) = prepare(common, None)?;
    let decimals = pipeline.config().decimals;
    let movers = pipeline.config().movers;

    let snapshots = pipeline
        .run_snapshots(&primary, &secondary, before, after)
        .context("Comparison failed")?;
    print_output("Before", &before, &snapshots.before, decimals);
    print_output("After", &after, &snapshots.after, decimals);
    print_comparison(&snapshots, movers);

    if common.dry_run {
        println!("\nDry run - no files written");
        return Ok(());
    }

    let dir = create_out_dir(common.out_dir.as_deref())?;
    // single-window tables describe the later period
    export_output(&dir, &snapshots.after, decimals)?;

    let cmp = &snapshots.comparison;
    write_csv(
        &dir.join("comparison.csv"),
        header(&["entity_key", "entity_display"], &cmp.dim_names, COMPARISON_TAIL),
        comparison_rows(&cmp.rows, decimals),
    )?;
    if let Some(groups) = &snapshots.group_comparison {
        write_csv(
            &dir.join("group_comparison.csv"),
            [
                "group",
                "prior_primary",
                "current_primary",
                "primary_pct_change",
                "prior_secondary",
                "current_secondary",
                "secondary_pct_change",
                "prior_ratio_percent",
                "current_ratio_percent",
                "ratio_pct_change",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            group_comparison_rows(groups, decimals),
        )?;
    }

    write_json(
        &dir.join("quality.json"),
        &CompareSummary {
            before: RunSummary::new(before, &snapshots.before),
            after: RunSummary::new(after, &snapshots.after),
            new_entrants: cmp.new_entrants(),
            improving_share: cmp.improving_share(),
            top_gainers: cmp.top_gainers(movers),
            top_losers: cmp.top_losers(movers),
        },
    )?;
    println!("\nWrote comparison to {}", dir.display());
    Ok(())
}

fn finish(output: &OutputArgs) -> Result<Option<PathBuf>> {
    if output.dry_run {
        println!("\nDry run - no files written");
        return Ok(None);
    }
    create_out_dir(output.out_dir.as_deref()).map(Some)
}

fn run_funnel(
    signups: &Path,
    config: Option<&Path>,
    report_date: NaiveDate,
    window: DateWindow,
    cities: &[String],
    output: &OutputArgs,
) -> Result<()> {
    let mut config = load_json_or(config, FunnelConfig::signup_status)?;
    config.window = window;
    if !cities.is_empty() {
        config.cities = cities.to_vec();
    }
    let table = load_table(signups)?;
    let result = config
        .run(&table, report_date)
        .context("Funnel failed")?;

    println!("\n=== Funnel ({}) ===", describe_window(&window));
    println!(
        "Days: {} | Unmatched status rows: {}",
        result.daily.days.len(),
        result.daily.unmatched_status
    );
    let wow = &result.week_over_week;
    println!(
        "New recruits {} -> {}: {} -> {} ({})",
        describe_window(&wow.prev_week),
        describe_window(&wow.last_week),
        fmt_count(wow.total.prev_week),
        fmt_count(wow.total.last_week),
        wow.total
            .pct_change
            .map_or("n/a".to_string(), |p| format!("{:+.1}%", p))
    );

    if let Some(dir) = finish(output)? {
        export_funnel(&dir, &result, config.decimals)?;
        println!("\nWrote funnel to {}", dir.display());
    }
    Ok(())
}

fn run_trend(
    signups: &Path,
    config: Option<&Path>,
    window: DateWindow,
    movers: usize,
    output: &OutputArgs,
) -> Result<()> {
    let mut config = load_json_or(config, TrendConfig::weekly_signups)?;
    config.window = window;
    let table = load_table(signups)?;
    let result = config.run(&table).context("Trend failed")?;
    let trend = &result.trend;

    println!("\n=== Weekly trend ({}) ===", describe_window(&window));
    for total in &trend.totals {
        println!(
            "  {} | {} from {} entities ({})",
            total.week,
            fmt_count(total.count),
            total.entities,
            total.pct_change.map_or("n/a".to_string(), |p| format!("{:+.1}%", p))
        );
    }
    match trend.improving_share() {
        Some(share) => println!("Improving: {:.1}% of entities ranked both weeks", share),
        None => println!("Improving: n/a"),
    }
    for row in trend.top_gainers(movers) {
        println!("  + {} ({:+})", row.entity_display, row.rank_delta.unwrap_or(0));
    }
    for row in trend.top_losers(movers) {
        println!("  - {} ({:+})", row.entity_display, row.rank_delta.unwrap_or(0));
    }

    if let Some(dir) = finish(output)? {
        export_trend(&dir, &result, movers, config.decimals)?;
        println!("\nWrote trend to {}", dir.display());
    }
    Ok(())
}

fn run_movement(before: &Path, after: &Path, output: &OutputArgs) -> Result<()> {
    let options = MovementOptions::default();
    let movement = ranking_movement(&load_table(before)?, &load_table(after)?, options)
        .context("Ranking comparison failed")?;

    println!("\n=== Ranking movement ===");
    println!(
        "Hotels: {} | New: {} | Dropped: {}",
        movement.rows.len(),
        movement.new_entries(),
        movement.dropped.len()
    );
    for row in movement.rows.iter().take(10) {
        println!("  [{}] {} | {}", row.current_rank, row.entity_display, row.movement.label());
    }

    if let Some(dir) = finish(output)? {
        export_movement(&dir, &movement, options)?;
        println!("\nWrote movement to {}", dir.display());
    }
    Ok(())
}

fn init_logging() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    init_logging();
    let cli = Cli::parse();

    match cli.command {
        Command::Reconcile { common, from, to } => run_reconcile(&common, from, to),
        Command::Compare {
            common,
            before_from,
            before_to,
            after_from,
            after_to,
        } => run_compare(
            &common,
            DateWindow::new(before_from, before_to),
            DateWindow::new(after_from, after_to),
        ),
        Command::Funnel {
            signups,
            config,
            report_date,
            from,
            to,
            cities,
            output,
        } => run_funnel(
            &signups,
            config.as_deref(),
            report_date.unwrap_or_else(|| chrono::Local::now().date_naive()),
            DateWindow { from, to },
            &cities,
            &output,
        ),
        Command::Trend {
            signups,
            config,
            from,
            to,
            movers,
            output,
        } => run_trend(&signups, config.as_deref(), DateWindow { from, to }, movers, &output),
        Command::Movement {
            before,
            after,
            output,
        } => run_movement(&before, &after, &output),
    }
}

// =============================================================================
// TESTS - Critical for ensuring DETERMINISM
// =============================================================================
