//! Normalizer - maps heterogeneous input tables onto the canonical schema
//!
//! Responsibilities:
//! - Resolve logical fields to physical columns (by header name or position)
//! - Tolerate header spelling drift through an alias table
//! - Parse period dates, dropping (and counting) rows that do not parse
//! - Coerce counts to numbers, never failing a row on a bad count
//! - Derive the entity join key from the display name

use crate::error::{EngineError, MissingField, Result};
use crate::table::{ColumnLocator, Table, Value};
use crate::{entity_key, UNKNOWN_DIM, UNKNOWN_ENTITY};
use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, warn};

/// Collapse header spelling: trim, squeeze internal whitespace, lowercase
pub fn normalize_header(header: &str) -> String {
    header
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

// =============================================================================
// Header aliases
// =============================================================================

/// Historical header spellings mapped to one canonical name.
///
/// Both the table headers and any by-name locator go through
/// [`HeaderAliases::canonical`] before they are compared.
#[derive(Debug, Clone)]
pub struct HeaderAliases {
    aliases: BTreeMap<String, String>,
}

const DEFAULT_ALIASES: &[(&str, &[&str])] = &[
    ("hotel", &["hotel", "hotel name", "hotel_name", "hotel_short_name", "hotel short name"]),
    ("city", &["city", "thành phố"]),
    ("tenant_id", &["tenant_id", "tenant id", "guest id", "guest_id"]),
    ("checkin", &["checkin", "check in", "check-in", "checkin date", "check-in date"]),
    ("signup_count", &["signups", "signup count", "signup_count"]),
    ("brand_model", &["brand model", "brand_model"]),
    ("checkin_count", &["check-ins", "checkins", "checkin_count"]),
];

impl Default for HeaderAliases {
    fn default() -> Self {
        let mut aliases = Self::empty();
        for (canonical, spellings) in DEFAULT_ALIASES {
            for spelling in *spellings {
                aliases.insert(spelling, canonical);
            }
        }
        aliases
    }
}

impl HeaderAliases {
    pub fn empty() -> Self {
        Self {
            aliases: BTreeMap::new(),
        }
    }

    /// Register `spelling` as another name for `canonical`
    pub fn insert(&mut self, spelling: &str, canonical: &str) {
        self.aliases
            .insert(normalize_header(spelling), normalize_header(canonical));
    }

    pub fn with(mut self, spelling: &str, canonical: &str) -> Self {
        self.insert(spelling, canonical);
        self
    }

    pub fn canonical(&self, header: &str) -> String {
        let normalized = normalize_header(header);
        self.aliases.get(&normalized).cloned().unwrap_or(normalized)
    }
}

// =============================================================================
// Field mapping
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeriodGrain {
    Day,
    Week,
}

impl PeriodGrain {
    pub fn dim_name(&self) -> &'static str {
        match self {
            PeriodGrain::Day => "day",
            PeriodGrain::Week => "week",
        }
    }

    /// First day of the period containing `date` (weeks start on Monday)
    pub fn start_of(&self, date: NaiveDate) -> NaiveDate {
        match self {
            PeriodGrain::Day => date,
            PeriodGrain::Week => {
                date - Duration::days(i64::from(date.weekday().num_days_from_monday()))
            }
        }
    }
}

/// What to do with rows whose entity name is blank
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmptyNamePolicy {
    /// Keep them under the "unknown" entity
    #[default]
    Keep,
    /// Drop them and count them in the report
    Reject,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DimMapping {
    pub name: String,
    pub column: ColumnLocator,
}

/// Logical field -> physical column mapping for one input table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldMapping {
    /// Table name used in error messages and reports
    pub table: String,
    pub entity: ColumnLocator,
    pub date: ColumnLocator,
    /// Numeric count column; rows count as 1 when absent
    #[serde(default)]
    pub count: Option<ColumnLocator>,
    /// Subject identifier used for distinct counting
    #[serde(default)]
    pub subject: Option<ColumnLocator>,
    #[serde(default)]
    pub dims: Vec<DimMapping>,
    /// Minimum number of columns the table must have
    #[serde(default)]
    pub min_columns: usize,
    /// Append a derived period dimension (day or week start)
    #[serde(default)]
    pub period: Option<PeriodGrain>,
    #[serde(default)]
    pub empty_names: EmptyNamePolicy,
}

impl FieldMapping {
    pub fn new(
        table: impl Into<String>,
        entity: impl Into<ColumnLocator>,
        date: impl Into<ColumnLocator>,
    ) -> Self {
        Self {
            table: table.into(),
            entity: entity.into(),
            date: date.into(),
            count: None,
            subject: None,
            dims: Vec::new(),
            min_columns: 0,
            period: None,
            empty_names: EmptyNamePolicy::Keep,
        }
    }

    pub fn count(mut self, column: impl Into<ColumnLocator>) -> Self {
        self.count = Some(column.into());
        self
    }

    pub fn subject(mut self, column: impl Into<ColumnLocator>) -> Self {
        self.subject = Some(column.into());
        self
    }

    pub fn dim(mut self, name: impl Into<String>, column: impl Into<ColumnLocator>) -> Self {
        self.dims.push(DimMapping {
            name: name.into(),
            column: column.into(),
        });
        self
    }

    pub fn min_columns(mut self, n: usize) -> Self {
        self.min_columns = n;
        self
    }

    pub fn period(mut self, grain: PeriodGrain) -> Self {
        self.period = Some(grain);
        self
    }

    pub fn reject_empty_names(mut self) -> Self {
        self.empty_names = EmptyNamePolicy::Reject;
        self
    }

    /// Dimension names of the canonical table this mapping produces
    pub fn dim_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.dims.iter().map(|d| d.name.clone()).collect();
        if let Some(grain) = self.period {
            names.push(grain.dim_name().to_string());
        }
        names
    }
}

// =============================================================================
// Canonical output
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CanonicalRow {
    pub entity_key: String,
    pub entity_display: String,
    pub dims: Vec<String>,
    pub date: NaiveDate,
    pub count: f64,
    pub subject: Option<String>,
}

/// Row-level data quality counters for one normalized table
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct NormalizeReport {
    pub rows_in: usize,
    pub rows_out: usize,
    pub dropped_invalid_date: usize,
    pub dropped_empty_name: usize,
    pub coerced_counts: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CanonicalTable {
    pub name: String,
    pub dim_names: Vec<String>,
    /// Name of the derived period dimension, when one was appended
    pub period_dim: Option<String>,
    pub rows: Vec<CanonicalRow>,
    /// Whether a subject column was mapped (distinct counting applies)
    pub subject_column: bool,
    pub report: NormalizeReport,
}

impl CanonicalTable {
    pub fn dim_index(&self, dim: &str) -> Result<usize> {
        self.dim_names
            .iter()
            .position(|d| d == dim)
            .ok_or_else(|| EngineError::UnknownDimension {
                dim: dim.to_string(),
                available: self.dim_names.clone(),
            })
    }
}

// =============================================================================
// Column resolution
// =============================================================================

struct Resolved {
    entity: usize,
    date: usize,
    count: Option<usize>,
    subject: Option<usize>,
    dims: Vec<usize>,
}

fn locate(
    table: &Table,
    aliases: &HeaderAliases,
    field: &str,
    locator: &ColumnLocator,
    missing: &mut Vec<MissingField>,
) -> Option<usize> {
    let width = table.width();
    let found = match locator {
        ColumnLocator::Index(i) if *i < width => Some(*i),
        ColumnLocator::Index(_) => None,
        ColumnLocator::Name(name) => {
            let wanted = aliases.canonical(name);
            table
                .headers
                .iter()
                .position(|h| aliases.canonical(h) == wanted)
        }
    };

    if found.is_none() {
        let reason = match locator {
            ColumnLocator::Index(i) => format!(
                "column #{} requested, table has {} columns",
                i, width
            ),
            ColumnLocator::Name(name) => format!("no column named '{}'", name),
        };
        missing.push(MissingField {
            field: field.to_string(),
            reason,
        });
    }
    found
}

fn resolve(table: &Table, mapping: &FieldMapping, aliases: &HeaderAliases) -> Result<Resolved> {
    let mut missing = Vec::new();

    let width = table.width();
    if width < mapping.min_columns {
        missing.push(MissingField {
            field: "columns".to_string(),
            reason: format!(
                "table has {} columns, at least {} required",
                width, mapping.min_columns
            ),
        });
    }

    let entity = locate(table, aliases, "entity", &mapping.entity, &mut missing);
    let date = locate(table, aliases, "date", &mapping.date, &mut missing);
    let count = mapping
        .count
        .as_ref()
        .map(|loc| locate(table, aliases, "count", loc, &mut missing));
    let subject = mapping
        .subject
        .as_ref()
        .map(|loc| locate(table, aliases, "subject", loc, &mut missing));
    let dims: Vec<Option<usize>> = mapping
        .dims
        .iter()
        .map(|d| locate(table, aliases, &d.name, &d.column, &mut missing))
        .collect();

    match (entity, date) {
        (Some(entity), Some(date)) if missing.is_empty() => Ok(Resolved {
            entity,
            date,
            count: count.flatten(),
            subject: subject.flatten(),
            dims: dims.into_iter().flatten().collect(),
        }),
        _ => Err(EngineError::Schema {
            table: mapping.table.clone(),
            missing,
        }),
    }
}

// =============================================================================
// Cell coercion
// =============================================================================

const DATE_FORMATS: &[&str] = &[
    "%Y-%m-%d",
    "%Y/%m/%d",
    "%m/%d/%Y",
    "%B %d, %Y",
    "%B %d %Y",
    "%d-%b-%Y",
];

const DATETIME_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M",
    "%Y/%m/%d %H:%M:%S",
    "%m/%d/%Y %H:%M:%S",
    "%m/%d/%Y %H:%M",
];

/// Parse a cell into a calendar date; `None` means the row is invalid
pub fn parse_date(value: &Value) -> Option<NaiveDate> {
    match value {
        Value::Date(d) => Some(*d),
        Value::DateTime(dt) => Some(dt.date()),
        Value::Text(s) => parse_date_text(s.trim()),
        _ => None,
    }
}

fn parse_date_text(s: &str) -> Option<NaiveDate> {
    if s.is_empty() {
        return None;
    }
    DATE_FORMATS
        .iter()
        .find_map(|f| NaiveDate::parse_from_str(s, f).ok())
        .or_else(|| {
            DATETIME_FORMATS
                .iter()
                .find_map(|f| NaiveDateTime::parse_from_str(s, f).ok())
                .map(|dt| dt.date())
        })
        .or_else(|| DateTime::parse_from_rfc3339(s).ok().map(|dt| dt.date_naive()))
}

/// Coerce a count cell; the flag is set when the value had to be replaced by 0
pub fn coerce_count(value: &Value) -> (f64, bool) {
    let parsed = match value {
        Value::Int(i) => Some(*i as f64),
        Value::Float(f) => Some(*f),
        Value::Text(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    match parsed {
        Some(n) if n.is_finite() && n >= 0.0 => (n, false),
        _ => (0.0, true),
    }
}

// =============================================================================
// Normalize
// =============================================================================

/// Map `table` onto the canonical schema described by `mapping`.
///
/// Schema problems abort with [`EngineError::Schema`]; row-level problems are
/// recovered and counted in the returned table's report.
pub fn normalize(
    table: &Table,
    mapping: &FieldMapping,
    aliases: &HeaderAliases,
) -> Result<CanonicalTable> {
    let cols = resolve(table, mapping, aliases)?;
    let mut report = NormalizeReport {
        rows_in: table.len(),
        ..Default::default()
    };
    let mut rows = Vec::with_capacity(table.len());

    for idx in 0..table.len() {
        let display = table.cell(idx, cols.entity).as_text();
        let (entity_key, entity_display) = if display.is_empty() {
            if mapping.empty_names == EmptyNamePolicy::Reject {
                report.dropped_empty_name += 1;
                continue;
            }
            (String::new(), UNKNOWN_ENTITY.to_string())
        } else {
            (entity_key(&display), display)
        };

        let Some(date) = parse_date(table.cell(idx, cols.date)) else {
            report.dropped_invalid_date += 1;
            continue;
        };

        let count = match cols.count {
            Some(col) => {
                let (count, coerced) = coerce_count(table.cell(idx, col));
                if coerced {
                    report.coerced_counts += 1;
                }
                count
            }
            None => 1.0,
        };

        let subject = cols
            .subject
            .map(|col| table.cell(idx, col).as_text())
            .filter(|s| !s.is_empty());

        let mut dims: Vec<String> = cols
            .dims
            .iter()
            .map(|&col| {
                let v = table.cell(idx, col).as_text();
                if v.is_empty() {
                    UNKNOWN_DIM.to_string()
                } else {
                    v
                }
            })
            .collect();
        if let Some(grain) = mapping.period {
            dims.push(grain.start_of(date).format("%Y-%m-%d").to_string());
        }

        rows.push(CanonicalRow {
            entity_key,
            entity_display,
            dims,
            date,
            count,
            subject,
        });
    }

    report.rows_out = rows.len();
    if report.dropped_invalid_date > 0 {
        warn!(
            table = %mapping.table,
            dropped = report.dropped_invalid_date,
            "Dropped rows with invalid dates"
        );
    }
    debug!(
        table = %mapping.table,
        rows_in = report.rows_in,
        rows_out = report.rows_out,
        coerced = report.coerced_counts,
        "Normalized table"
    );

    Ok(CanonicalTable {
        name: mapping.table.clone(),
        dim_names: mapping.dim_names(),
        period_dim: mapping.period.map(|g| g.dim_name().to_string()),
        rows,
        subject_column: mapping.subject.is_some(),
        report,
    })
}
