//! Movement - rank movement between two exported ranking files
//!
//! Works on finished rankings (`Rank`, `Hotel`, `Signups`, optionally
//! `Check-ins`, `City`, `Brand Model`) rather than raw exports, so a ranking
//! produced last week can be set against this week's without re-running it.

use crate::error::{EngineError, MissingField, Result};
use crate::normalize::{coerce_count, HeaderAliases};
use crate::rank::pct_change;
use crate::reconcile::default_decimals;
use crate::table::{Table, Value};
use crate::{entity_key, round_to};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{info, warn};

/// Header aliases for ranking files, including this crate's own `ranking.csv`
pub fn ranking_aliases() -> HeaderAliases {
    HeaderAliases::default()
        .with("entity_display", "hotel")
        .with("secondary_count", "signup_count")
        .with("primary_count", "checkin_count")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "places")]
pub enum Movement {
    New,
    Up(u32),
    Down(u32),
    Unchanged,
}

impl Movement {
    fn from_change(change: Option<i64>) -> Self {
        match change {
            None => Movement::New,
            Some(c) if c > 0 => Movement::Up(c.unsigned_abs() as u32),
            Some(c) if c < 0 => Movement::Down(c.unsigned_abs() as u32),
            Some(_) => Movement::Unchanged,
        }
    }

    pub fn label(&self) -> String {
        match self {
            Movement::New => "new".to_string(),
            Movement::Up(n) => format!("up {}", n),
            Movement::Down(n) => format!("down {}", n),
            Movement::Unchanged => "no change".to_string(),
        }
    }
}

// =============================================================================
// Ranking file
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RankingEntry {
    pub entity_key: String,
    pub entity_display: String,
    pub rank: u32,
    pub signups: f64,
    pub checkins: Option<f64>,
    pub city: Option<String>,
    pub brand_model: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RankingReport {
    pub rows_in: usize,
    pub invalid_rank: usize,
    /// Later rows for a hotel already seen; the first row wins
    pub duplicates: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RankingFile {
    pub entries: Vec<RankingEntry>,
    pub report: RankingReport,
}

struct Columns {
    rank: usize,
    hotel: usize,
    signups: usize,
    checkins: Option<usize>,
    city: Option<usize>,
    brand_model: Option<usize>,
}

fn columns(table: &Table, name: &str, aliases: &HeaderAliases) -> Result<Columns> {
    let headers: Vec<String> = table.headers.iter().map(|h| aliases.canonical(h)).collect();
    let find = |field: &str| headers.iter().position(|h| h == field);

    let mut missing = Vec::new();
    let mut required = |field: &str, spelling: &str| {
        let idx = find(field);
        if idx.is_none() {
            missing.push(MissingField {
                field: field.to_string(),
                reason: format!("no '{}' column", spelling),
            });
        }
        idx.unwrap_or_default()
    };
    let rank = required("rank", "Rank");
    let hotel = required("hotel", "Hotel");
    let signups = required("signup_count", "Signups");
    if !missing.is_empty() {
        return Err(EngineError::Schema {
            table: name.to_string(),
            missing,
        });
    }

    Ok(Columns {
        rank,
        hotel,
        signups,
        checkins: find("checkin_count"),
        city: find("city"),
        brand_model: find("brand_model"),
    })
}

fn parse_rank(value: &Value) -> Option<u32> {
    match coerce_count(value) {
        (n, false) if n >= 1.0 && n.fract() == 0.0 => Some(n as u32),
        _ => None,
    }
}

fn text(value: &Value) -> Option<String> {
    (!value.is_blank()).then(|| value.as_text().trim().to_string())
}

/// Read a ranking export. Rows without a positive whole rank are skipped.
pub fn read_ranking(table: &Table, name: &str) -> Result<RankingFile> {
    let cols = columns(table, name, &ranking_aliases())?;
    let mut report = RankingReport {
        rows_in: table.len(),
        ..Default::default()
    };
    let mut seen = BTreeSet::new();
    let mut entries = Vec::new();

    for idx in 0..table.len() {
        let Some(rank) = parse_rank(table.cell(idx, cols.rank)) else {
            report.invalid_rank += 1;
            continue;
        };
        let display = table.cell(idx, cols.hotel).as_text().trim().to_string();
        let key = entity_key(&display);
        if !seen.insert(key.clone()) {
            report.duplicates += 1;
            continue;
        }
        entries.push(RankingEntry {
            entity_key: key,
            entity_display: display,
            rank,
            signups: coerce_count(table.cell(idx, cols.signups)).0,
            checkins: cols.checkins.map(|c| coerce_count(table.cell(idx, c)).0),
            city: cols.city.and_then(|c| text(table.cell(idx, c))),
            brand_model: cols.brand_model.and_then(|c| text(table.cell(idx, c))),
        });
    }

    if report.invalid_rank > 0 {
        warn!(table = name, rows = report.invalid_rank, "Skipped ranking rows without a valid rank");
    }
    Ok(RankingFile { entries, report })
}

// =============================================================================
// Movement
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MovementRow {
    pub entity_key: String,
    pub entity_display: String,
    pub city: Option<String>,
    pub brand_model: Option<String>,
    pub last_rank: Option<u32>,
    pub current_rank: u32,
    /// `last_rank - current_rank`; positive means the hotel moved up
    pub rank_change: Option<i64>,
    pub movement: Movement,
    pub last_signups: Option<f64>,
    pub current_signups: f64,
    pub signup_growth: Option<f64>,
    /// Signups per check-in in percent, when the current file has check-ins
    pub conversion_percent: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RankingMovement {
    /// Ordered by current rank, then entity key
    pub rows: Vec<MovementRow>,
    /// Hotels only in the earlier file
    pub dropped: Vec<String>,
    pub before: RankingReport,
    pub after: RankingReport,
}

impl RankingMovement {
    pub fn new_entries(&self) -> usize {
        self.rows.iter().filter(|r| r.movement == Movement::New).count()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MovementOptions {
    #[serde(default = "default_growth_decimals")]
    pub growth_decimals: u32,
    #[serde(default = "default_decimals")]
    pub conversion_decimals: u32,
}

fn default_growth_decimals() -> u32 {
    1
}

impl Default for MovementOptions {
    fn default() -> Self {
        Self {
            growth_decimals: default_growth_decimals(),
            conversion_decimals: default_decimals(),
        }
    }
}

/// Set the `after` ranking against `before`, matching hotels by entity key.
pub fn ranking_movement(before: &Table, after: &Table, options: MovementOptions) -> Result<RankingMovement> {
    let before = read_ranking(before, "before")?;
    let after = read_ranking(after, "after")?;
    let last: BTreeMap<&str, &RankingEntry> =
        before.entries.iter().map(|e| (e.entity_key.as_str(), e)).collect();

    let mut rows: Vec<MovementRow> = after
        .entries
        .iter()
        .map(|cur| {
            let prev = last.get(cur.entity_key.as_str());
            let last_rank = prev.map(|p| p.rank);
            let rank_change = last_rank.map(|l| i64::from(l) - i64::from(cur.rank));
            let last_signups = prev.map(|p| p.signups);
            MovementRow {
                entity_key: cur.entity_key.clone(),
                entity_display: cur.entity_display.clone(),
                city: cur.city.clone(),
                brand_model: cur.brand_model.clone(),
                last_rank,
                current_rank: cur.rank,
                rank_change,
                movement: Movement::from_change(rank_change),
                last_signups,
                current_signups: cur.signups,
                signup_growth: pct_change(last_signups, Some(cur.signups))
                    .map(|p| round_to(p, options.growth_decimals)),
                conversion_percent: cur
                    .checkins
                    .filter(|c| *c > 0.0)
                    .map(|c| round_to(cur.signups / c * 100.0, options.conversion_decimals)),
            }
        })
        .collect();
    rows.sort_by(|a, b| a.current_rank.cmp(&b.current_rank).then_with(|| a.entity_key.cmp(&b.entity_key)));

    let current: BTreeSet<&str> = after.entries.iter().map(|e| e.entity_key.as_str()).collect();
    let dropped: Vec<String> = before
        .entries
        .iter()
        .filter(|e| !current.contains(e.entity_key.as_str()))
        .map(|e| e.entity_display.clone())
        .collect();

    info!(rows = rows.len(), dropped = dropped.len(), "Compared ranking files");

    Ok(RankingMovement {
        rows,
        dropped,
        before: before.report,
        after: after.report,
    })
}
