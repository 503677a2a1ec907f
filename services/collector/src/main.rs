//! Collector Service - Collects nightly hotel room prices on a daily schedule
//!
//! Responsibilities:
//! - Keep the list of hotel pages and the daily run time in a JSON config
//! - Fetch each hotel for one-night stays starting D, D+7 and D+15
//! - Apply a jittered politeness delay and retry failed fetches with backoff
//! - Extract room prices with ordered strategies (page markup, then structured data)
//! - Write every session (results and errors) as JSON
//!
//! Usage:
//!   # Manage the hotel list:
//!   cargo run --bin collector -- --add-url https://www.agoda.com/...
//!   cargo run --bin collector -- --list-urls
//!
//!   # Run once now:
//!   cargo run --bin collector -- --run-once
//!
//!   # Daemon, running daily at 07:30:
//!   cargo run --bin collector -- --time 07:30

use anyhow::{anyhow, bail, Context, Result};
use chrono::{DateTime, Days, Local, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use clap::Parser;
use rand::seq::SliceRandom;
use rand::Rng;
use regex::Regex;
use reqwest::Url;
use scraper::{ElementRef, Html, Selector};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::fs;
use tokio::time::sleep;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use uuid::Uuid;

#[derive(Parser, Debug)]
#[command(name = "collector", about = "Collects hotel room prices on a daily schedule")]
struct Args {
    /// Path to the schedule config file
    #[arg(long, default_value = "data/scheduler_config.json")]
    config: String,

    /// Add a hotel URL to the config and exit
    #[arg(long)]
    add_url: Option<String>,

    /// Remove a hotel URL from the config and exit
    #[arg(long)]
    remove_url: Option<String>,

    /// List configured hotel URLs and exit
    #[arg(long, default_value = "false")]
    list_urls: bool,

    /// Daily run time (HH:MM), saved to the config
    #[arg(long)]
    time: Option<String>,

    /// Run a single session now instead of waiting for the schedule
    #[arg(long, default_value = "false")]
    run_once: bool,

    /// Collect one hotel once, ignoring the configured list
    #[arg(long)]
    url: Option<String>,
}

// =============================================================================
// Configuration
// =============================================================================

const DEFAULT_SCHEDULE_TIME: &str = "09:00";

/// Stays start this many days after the run date
const TARGET_DATE_OFFSETS: [u64; 3] = [0, 7, 15];

const USER_AGENTS: [&str; 4] = [
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:125.0) Gecko/20100101 Firefox/125.0",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.4 Safari/605.1.15",
];

/// Query parameters forced on every search URL
const SEARCH_PARAMS: [(&str, &str); 6] = [
    ("adults", "2"),
    ("children", "0"),
    ("rooms", "1"),
    ("currencyCode", "VND"),
    ("finalPriceView", "1"),
    ("isShowMobileAppPrice", "false"),
];

#[derive(Debug, Clone)]
struct Config {
    output_dir: PathBuf,
    rate_limit_ms: u64,
    fetch_timeout_secs: u64,
    max_retries: u32,
    retry_backoff_ms: u64,
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

impl Config {
    fn from_env() -> Self {
        Self {
            output_dir: PathBuf::from(
                std::env::var("OUTPUT_DIR").unwrap_or_else(|_| "./data".to_string()),
            ),
            rate_limit_ms: env_or("RATE_LIMIT_MS", 3000),
            fetch_timeout_secs: env_or("FETCH_TIMEOUT_SECS", 30),
            max_retries: env_or("MAX_RETRIES", 3),
            retry_backoff_ms: env_or("RETRY_BACKOFF_MS", 1000),
        }
    }
}

/// Persisted hotel list and daily run time
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct ScheduleConfig {
    #[serde(default)]
    hotel_urls: Vec<String>,
    #[serde(default = "default_schedule_time")]
    schedule_time: String,
    #[serde(default)]
    last_updated: Option<NaiveDateTime>,
}

fn default_schedule_time() -> String {
    DEFAULT_SCHEDULE_TIME.to_string()
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            hotel_urls: Vec::new(),
            schedule_time: default_schedule_time(),
            last_updated: None,
        }
    }
}

impl ScheduleConfig {
    /// A missing file yields an empty config
    async fn load(path: &Path) -> Result<Self> {
        let content = match fs::read_to_string(path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!("No schedule config at {}, starting empty", path.display());
                return Ok(Self::default());
            }
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to read {}", path.display()))
            }
        };
        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse {}", path.display()))?;
        parse_schedule_time(&config.schedule_time)?;
        Ok(config)
    }

    async fn save(&mut self, path: &Path) -> Result<()> {
        self.last_updated = Some(Local::now().naive_local());
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir).await?;
        }
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json)
            .await
            .with_context(|| format!("Failed to write {}", path.display()))?;
        info!("Schedule config saved to {}", path.display());
        Ok(())
    }

    /// Returns false when the URL was already configured
    fn add_url(&mut self, url: &str) -> Result<bool> {
        validate_url(url)?;
        if self.hotel_urls.iter().any(|u| u == url) {
            return Ok(false);
        }
        self.hotel_urls.push(url.to_string());
        Ok(true)
    }

    fn remove_url(&mut self, url: &str) -> bool {
        let before = self.hotel_urls.len();
        self.hotel_urls.retain(|u| u != url);
        self.hotel_urls.len() != before
    }

    fn set_time(&mut self, time: &str) -> Result<()> {
        parse_schedule_time(time)?;
        self.schedule_time = time.trim().to_string();
        Ok(())
    }

    fn run_time(&self) -> Result<NaiveTime> {
        parse_schedule_time(&self.schedule_time)
    }
}

// =============================================================================
// Scheduling
// =============================================================================

fn parse_schedule_time(value: &str) -> Result<NaiveTime> {
    NaiveTime::parse_from_str(value.trim(), "%H:%M")
        .with_context(|| format!("Invalid time format: {:?}. Use HH:MM", value))
}

/// Next daily occurrence of `at` strictly after `now`
fn next_run_after(now: NaiveDateTime, at: NaiveTime) -> NaiveDateTime {
    let today = now.date().and_time(at);
    if today > now {
        return today;
    }
    now.date()
        .succ_opt()
        .map(|d| d.and_time(at))
        .unwrap_or(today)
}

fn target_dates(today: NaiveDate) -> Vec<NaiveDate> {
    TARGET_DATE_OFFSETS
        .iter()
        .filter_map(|&offset| today.checked_add_days(Days::new(offset)))
        .collect()
}

/// Sleeps in short steps; returns false as soon as the run flag is cleared
async fn sleep_while_running(total: Duration, running: &AtomicBool) -> bool {
    let step = Duration::from_secs(1);
    let mut left = total;
    while !left.is_zero() {
        if !running.load(Ordering::SeqCst) {
            return false;
        }
        let chunk = left.min(step);
        sleep(chunk).await;
        left -= chunk;
    }
    running.load(Ordering::SeqCst)
}

// =============================================================================
// URLs
// =============================================================================

fn validate_url(url: &str) -> Result<Url> {
    let parsed = Url::parse(url.trim()).with_context(|| format!("Invalid URL: {}", url))?;
    if !matches!(parsed.scheme(), "http" | "https") {
        bail!("Unsupported URL scheme {:?}: {}", parsed.scheme(), url);
    }
    if parsed.host_str().is_none() {
        bail!("URL has no host: {}", url);
    }
    Ok(parsed)
}

fn set_param(params: &mut Vec<(String, String)>, key: &str, value: String) {
    match params.iter_mut().find(|(k, _)| k == key) {
        Some(entry) => entry.1 = value,
        None => params.push((key.to_string(), value)),
    }
}

/// Rewrites the stay dates and fixed search parameters, keeping every other parameter
fn build_search_url(hotel_url: &str, check_in: NaiveDate, check_out: NaiveDate) -> Result<String> {
    let mut url = validate_url(hotel_url)?;
    let mut params: Vec<(String, String)> = url.query_pairs().into_owned().collect();
    let day = |d: NaiveDate| d.format("%Y-%m-%d").to_string();

    set_param(&mut params, "checkIn", day(check_in));
    set_param(&mut params, "checkOut", day(check_out));
    if params.iter().any(|(k, _)| k == "checkin") {
        set_param(&mut params, "checkin", day(check_in));
    }
    for (key, value) in SEARCH_PARAMS {
        set_param(&mut params, key, value.to_string());
    }

    url.query_pairs_mut().clear().extend_pairs(params.iter());
    Ok(url.to_string())
}

fn hotel_id_from(url: &str) -> Option<String> {
    let parsed = Url::parse(url).ok()?;
    parsed
        .query_pairs()
        .find(|(k, _)| k.eq_ignore_ascii_case("hotelid") || k.eq_ignore_ascii_case("hotel_id"))
        .map(|(_, v)| v.into_owned())
}

// =============================================================================
// Price parsing
// =============================================================================

const VND_PATTERNS: [&str; 6] = [
    r"(\d[\d,.]*)\s*₫",
    r"(\d[\d,.]*)\s*VND",
    r"₫\s*(\d[\d,.]*)",
    r"VND\s*(\d[\d,.]*)",
    r"(\d[\d,.]*)\s*đ",
    r"đ\s*(\d[\d,.]*)",
];

const CURRENCY_PATTERNS: [(&str, &str); 9] = [
    ("USD", r"\$|USD"),
    ("EUR", r"€|EUR"),
    ("GBP", r"£|GBP"),
    ("THB", r"฿|THB"),
    ("SGD", r"SGD"),
    ("MYR", r"MYR"),
    ("JPY", r"¥|JPY"),
    ("KRW", r"₩|KRW"),
    ("CNY", r"CNY|RMB"),
];

#[derive(Debug, Clone, Copy, PartialEq)]
struct Price {
    amount: f64,
    currency: &'static str,
}

struct PriceParser {
    vnd: Vec<Regex>,
    currencies: Vec<(&'static str, Regex)>,
    number: Regex,
}

/// `2.896.188` and `1,250,000` read as whole numbers; any other dot is a decimal point
fn parse_grouped(raw: &str) -> Option<f64> {
    let cleaned = raw.replace(',', "");
    let parts: Vec<&str> = cleaned.split('.').collect();
    let joined = if parts.len() > 1 && parts[1..].iter().all(|p| p.len() == 3) {
        parts.concat()
    } else {
        cleaned.clone()
    };
    joined.parse().ok()
}

impl PriceParser {
    fn new() -> Result<Self> {
        let vnd = VND_PATTERNS
            .iter()
            .map(|p| Regex::new(&format!("(?i){}", p)))
            .collect::<Result<Vec<_>, _>>()?;
        let currencies = CURRENCY_PATTERNS
            .iter()
            .map(|(code, p)| Ok((*code, Regex::new(&format!("(?i){}", p))?)))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            vnd,
            currencies,
            number: Regex::new(r"\d[\d,.]*")?,
        })
    }

    /// VND formats first, then symbols and codes, then any bare number
    fn parse(&self, text: &str) -> Option<Price> {
        let text = text.trim();
        if text.is_empty() {
            return None;
        }

        for re in &self.vnd {
            for caps in re.captures_iter(text) {
                if let Some(amount) = parse_grouped(&caps[1]).filter(|a| *a > 1000.0) {
                    return Some(Price { amount, currency: "VND" });
                }
            }
        }

        for (code, re) in &self.currencies {
            if !re.is_match(text) {
                continue;
            }
            let amount = self
                .number
                .find_iter(text)
                .filter_map(|m| m.as_str().replace(',', "").parse::<f64>().ok())
                .find(|a| *a > 0.0);
            if let Some(amount) = amount {
                return Some(Price { amount, currency: *code });
            }
        }

        self.number
            .find_iter(text)
            .filter_map(|m| parse_grouped(m.as_str()))
            .find(|a| *a > 0.0)
            .map(|amount| Price {
                amount,
                currency: if amount > 10_000.0 { "VND" } else { "UNKNOWN" },
            })
    }

    fn first_integer(&self, text: &str) -> Option<u32> {
        self.number
            .find_iter(text)
            .find_map(|m| m.as_str().replace(',', "").parse().ok())
    }
}

// =============================================================================
// Extraction
// =============================================================================

const HOTEL_NAME_SELECTORS: &[&str] = &[
    "h1[data-selenium='hotel-header-name']",
    "h1.HeaderCerebrum__Name",
    "[data-testid='hotel-name']",
    "h1[data-element-name='hotel-header-name']",
    "h1.PropertyHeaderName",
    ".hotel-header-name",
    "h1",
];
const LOCATION_SELECTORS: &[&str] = &[
    "[data-selenium='hotel-address-map']",
    ".HeaderCerebrum__Address",
    "[data-testid='hotel-address']",
    ".hotel-address",
];
const RATING_SELECTORS: &[&str] = &[
    "[data-selenium='hotel-header-review-score']",
    ".ReviewScore__Number",
    "[data-testid='review-score']",
];
const REVIEW_COUNT_SELECTORS: &[&str] = &[
    "[data-selenium='hotel-header-review-count']",
    ".ReviewScore__Text",
    "[data-testid='review-count']",
];
const ROOM_CARD_SELECTORS: &[&str] = &[
    "[data-selenium='masterroom']",
    ".MasterRoom",
    "[data-testid='room-item']",
    "[data-element-name='room-card']",
    ".room-card",
    ".room-item",
];
const ROOM_NAME_SELECTORS: &[&str] = &[
    ".room-type-name",
    ".MasterRoom__Name",
    "[data-selenium='room-name']",
    "[data-testid='room-name']",
    ".room-title",
    "h3",
];
const ROOM_PRICE_SELECTORS: &[&str] = &[
    "[data-selenium='display-price']",
    ".MasterRoom__Price",
    "[data-testid='price']",
    ".room-price",
    ".price-display",
    ".price",
];
const SOLD_OUT_SELECTORS: &[&str] = &[
    "[data-selenium='sold-out']",
    ".sold-out",
    ".unavailable",
    ".no-availability",
];
const PRICE_SELECTORS: &[&str] = &[
    "[data-testid*='price']",
    "[data-selenium*='price']",
    ".price",
    ".Price",
];
const META_PRICE_SELECTORS: &[&str] = &[
    "meta[itemprop='price']",
    "meta[property='product:price:amount']",
    "meta[property='og:price:amount']",
];
const META_CURRENCY_SELECTORS: &[&str] = &[
    "meta[itemprop='priceCurrency']",
    "meta[property='product:price:currency']",
    "meta[property='og:price:currency']",
];

/// Page-level price elements kept by the fallback strategy
const MAX_FALLBACK_PRICES: usize = 10;

#[derive(Debug, Clone, PartialEq, Serialize)]
struct RoomPrice {
    room_type: String,
    price: Option<f64>,
    currency: Option<String>,
    available: bool,
}

#[derive(Debug, Default)]
struct PageData {
    hotel_name: Option<String>,
    location: Option<String>,
    rating: Option<f64>,
    review_count: Option<u32>,
    rooms: Vec<RoomPrice>,
    /// Set only when `rooms` is non-empty
    strategy: Option<&'static str>,
}

struct Extractor {
    prices: PriceParser,
    hotel_name: Vec<Selector>,
    location: Vec<Selector>,
    rating: Vec<Selector>,
    review_count: Vec<Selector>,
    room_cards: Vec<Selector>,
    room_name: Vec<Selector>,
    room_price: Vec<Selector>,
    sold_out: Vec<Selector>,
    price_elements: Vec<Selector>,
    json_ld: Selector,
    meta_price: Vec<Selector>,
    meta_currency: Vec<Selector>,
    og_title: Selector,
    title: Selector,
}

fn compile(selectors: &[&str]) -> Result<Vec<Selector>> {
    selectors.iter().map(|s| compile_one(s)).collect()
}

fn compile_one(selector: &str) -> Result<Selector> {
    Selector::parse(selector).map_err(|e| anyhow!("invalid selector {}: {:?}", selector, e))
}

fn text_of(el: ElementRef<'_>) -> String {
    el.text()
        .flat_map(str::split_whitespace)
        .collect::<Vec<_>>()
        .join(" ")
}

fn first_text(scope: ElementRef<'_>, selectors: &[Selector]) -> Option<String> {
    selectors
        .iter()
        .flat_map(|s| scope.select(s))
        .map(text_of)
        .find(|t| !t.is_empty())
}

fn first_attr(scope: ElementRef<'_>, selectors: &[Selector], attr: &str) -> Option<String> {
    selectors
        .iter()
        .flat_map(|s| scope.select(s))
        .filter_map(|el| el.value().attr(attr))
        .map(|v| v.trim().to_string())
        .find(|v| !v.is_empty())
}

fn json_amount(value: &serde_json::Value) -> Option<f64> {
    match value {
        serde_json::Value::Number(n) => n.as_f64(),
        serde_json::Value::String(s) => s.replace(',', "").trim().parse().ok(),
        _ => None,
    }
}

/// Collects every object carrying `price` or `lowPrice`, depth first
fn collect_offers(value: &serde_json::Value, out: &mut Vec<RoomPrice>) {
    match value {
        serde_json::Value::Object(map) => {
            let amount = map
                .get("price")
                .or_else(|| map.get("lowPrice"))
                .and_then(json_amount);
            if let Some(amount) = amount.filter(|a| *a > 0.0) {
                let room_type = map
                    .get("name")
                    .and_then(|v| v.as_str())
                    .map(str::to_string)
                    .unwrap_or_else(|| format!("Offer {}", out.len() + 1));
                out.push(RoomPrice {
                    room_type,
                    price: Some(amount),
                    currency: map
                        .get("priceCurrency")
                        .and_then(|v| v.as_str())
                        .map(str::to_string),
                    available: true,
                });
            }
            for nested in map.values() {
                collect_offers(nested, out);
            }
        }
        serde_json::Value::Array(items) => {
            for item in items {
                collect_offers(item, out);
            }
        }
        _ => {}
    }
}

impl Extractor {
    fn new() -> Result<Self> {
        Ok(Self {
            prices: PriceParser::new()?,
            hotel_name: compile(HOTEL_NAME_SELECTORS)?,
            location: compile(LOCATION_SELECTORS)?,
            rating: compile(RATING_SELECTORS)?,
            review_count: compile(REVIEW_COUNT_SELECTORS)?,
            room_cards: compile(ROOM_CARD_SELECTORS)?,
            room_name: compile(ROOM_NAME_SELECTORS)?,
            room_price: compile(ROOM_PRICE_SELECTORS)?,
            sold_out: compile(SOLD_OUT_SELECTORS)?,
            price_elements: compile(PRICE_SELECTORS)?,
            json_ld: compile_one("script[type='application/ld+json']")?,
            meta_price: compile(META_PRICE_SELECTORS)?,
            meta_currency: compile(META_CURRENCY_SELECTORS)?,
            og_title: compile_one("meta[property='og:title']")?,
            title: compile_one("title")?,
        })
    }

    fn extract(&self, body: &str) -> PageData {
        let doc = Html::parse_document(body);
        let root = doc.root_element();

        let strategies: [(&'static str, fn(&Self, ElementRef<'_>) -> Vec<RoomPrice>); 4] = [
            ("room-cards", Self::room_cards),
            ("price-elements", Self::price_elements),
            ("json-ld", Self::json_ld_offers),
            ("meta", Self::meta_price),
        ];
        let (strategy, rooms) = strategies
            .iter()
            .map(|(name, run)| (*name, run(self, root)))
            .find(|(_, rooms)| !rooms.is_empty())
            .map(|(name, rooms)| (Some(name), rooms))
            .unwrap_or((None, Vec::new()));

        PageData {
            hotel_name: self.hotel_name(root),
            location: first_text(root, &self.location),
            rating: first_text(root, &self.rating)
                .and_then(|t| t.split_whitespace().next().and_then(|v| v.parse().ok())),
            review_count: first_text(root, &self.review_count)
                .and_then(|t| self.prices.first_integer(&t)),
            rooms,
            strategy,
        }
    }

    fn hotel_name(&self, root: ElementRef<'_>) -> Option<String> {
        let from_markup = self
            .hotel_name
            .iter()
            .flat_map(|s| root.select(s))
            .map(text_of)
            .find(|t| t.chars().count() > 3);
        if from_markup.is_some() {
            return from_markup;
        }
        first_attr(root, std::slice::from_ref(&self.og_title), "content")
            .or_else(|| root.select(&self.title).next().map(text_of))
            .and_then(|title| {
                let name = title.split(" - ").next().unwrap_or_default().trim();
                (name.chars().count() > 3).then(|| name.to_string())
            })
    }

    fn room_cards(&self, root: ElementRef<'_>) -> Vec<RoomPrice> {
        for selector in &self.room_cards {
            let cards: Vec<ElementRef<'_>> = root.select(selector).collect();
            if cards.is_empty() {
                continue;
            }
            return cards
                .into_iter()
                .map(|card| {
                    let price = first_text(card, &self.room_price)
                        .and_then(|t| self.prices.parse(&t));
                    let sold_out = self.sold_out.iter().any(|s| card.select(s).next().is_some());
                    RoomPrice {
                        room_type: first_text(card, &self.room_name)
                            .unwrap_or_else(|| "Unknown Room Type".to_string()),
                        price: price.map(|p| p.amount),
                        currency: price.map(|p| p.currency.to_string()),
                        available: !sold_out,
                    }
                })
                .collect();
        }
        Vec::new()
    }

    fn price_elements(&self, root: ElementRef<'_>) -> Vec<RoomPrice> {
        for selector in &self.price_elements {
            let rooms: Vec<RoomPrice> = root
                .select(selector)
                .filter_map(|el| self.prices.parse(&text_of(el)))
                .take(MAX_FALLBACK_PRICES)
                .enumerate()
                .map(|(i, price)| RoomPrice {
                    room_type: format!("Room Type {}", i + 1),
                    price: Some(price.amount),
                    currency: Some(price.currency.to_string()),
                    available: true,
                })
                .collect();
            if !rooms.is_empty() {
                return rooms;
            }
        }
        Vec::new()
    }

    fn json_ld_offers(&self, root: ElementRef<'_>) -> Vec<RoomPrice> {
        let mut rooms = Vec::new();
        for script in root.select(&self.json_ld) {
            let raw: String = script.text().collect();
            match serde_json::from_str::<serde_json::Value>(&raw) {
                Ok(value) => collect_offers(&value, &mut rooms),
                Err(e) => warn!(error = %e, "Skipping malformed JSON-LD block"),
            }
        }
        rooms
    }

    fn meta_price(&self, root: ElementRef<'_>) -> Vec<RoomPrice> {
        let Some(amount) = first_attr(root, &self.meta_price, "content")
            .and_then(|v| parse_grouped(&v))
            .filter(|a| *a > 0.0)
        else {
            return Vec::new();
        };
        vec![RoomPrice {
            room_type: "Listed price".to_string(),
            price: Some(amount),
            currency: first_attr(root, &self.meta_currency, "content"),
            available: true,
        }]
    }
}

fn looks_blocked(body: &str) -> bool {
    let lower = body.to_lowercase();
    lower.contains("captcha") || lower.contains("are you a robot")
}

// =============================================================================
// Session
// =============================================================================

#[derive(Debug, Clone, Serialize)]
struct HotelPricing {
    hotel_url: String,
    search_url: String,
    hotel_name: String,
    hotel_id: Option<String>,
    location: Option<String>,
    check_in: NaiveDate,
    check_out: NaiveDate,
    rating: Option<f64>,
    review_count: Option<u32>,
    rooms: Vec<RoomPrice>,
    strategy: &'static str,
    content_hash: String,
    scraped_at: DateTime<Utc>,
}

impl HotelPricing {
    fn lowest_price(&self) -> Option<f64> {
        self.rooms
            .iter()
            .filter(|r| r.available)
            .filter_map(|r| r.price)
            .reduce(f64::min)
    }
}

#[derive(Debug, Serialize)]
struct Session {
    session_id: Uuid,
    start_time: DateTime<Utc>,
    end_time: Option<DateTime<Utc>>,
    target_dates: Vec<NaiveDate>,
    results: Vec<HotelPricing>,
    success_count: usize,
    error_count: usize,
    errors: Vec<String>,
}

impl Session {
    fn start(target_dates: Vec<NaiveDate>) -> Self {
        Self {
            session_id: Uuid::new_v4(),
            start_time: Utc::now(),
            end_time: None,
            target_dates,
            results: Vec::new(),
            success_count: 0,
            error_count: 0,
            errors: Vec::new(),
        }
    }

    fn add_result(&mut self, pricing: HotelPricing) {
        self.results.push(pricing);
        self.success_count += 1;
    }

    fn add_error(&mut self, error: String) {
        self.errors.push(error);
        self.error_count += 1;
    }

    fn finish(&mut self) {
        self.end_time = Some(Utc::now());
    }

    fn file_name(&self) -> String {
        format!(
            "session_{}_{}.json",
            self.start_time.format("%Y%m%d_%H%M%S"),
            self.session_id.simple()
        )
    }
}

async fn save_session(config: &Config, session: &Session) -> Result<PathBuf> {
    let dir = &config.output_dir;
    fs::create_dir_all(dir).await?;

    let path = dir.join(session.file_name());
    let json = serde_json::to_vec_pretty(session)?;
    fs::write(&path, json)
        .await
        .with_context(|| format!("Failed to write {}", path.display()))?;

    Ok(path)
}

// =============================================================================
// Fetching
// =============================================================================

fn content_hash(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("sha256:{:x}", hasher.finalize())
}

/// Delay before retry number `attempt` (0-based): base, 2x base, 4x base, ...
fn backoff(base_ms: u64, attempt: u32) -> Duration {
    Duration::from_millis(base_ms.saturating_mul(1u64 << attempt.min(16)))
}

fn jitter_with<R: Rng>(base: Duration, rng: &mut R) -> Duration {
    base.mul_f64(rng.gen_range(0.5..1.5))
}

fn jittered(base: Duration) -> Duration {
    jitter_with(base, &mut rand::thread_rng())
}

fn build_client(config: &Config) -> Result<reqwest::Client> {
    let user_agent = USER_AGENTS
        .choose(&mut rand::thread_rng())
        .copied()
        .unwrap_or(USER_AGENTS[0]);
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(config.fetch_timeout_secs))
        .user_agent(user_agent)
        .build()?;
    Ok(client)
}

async fn get_text(client: &reqwest::Client, url: &str) -> reqwest::Result<String> {
    client.get(url).send().await?.error_for_status()?.text().await
}

async fn fetch_page(client: &reqwest::Client, config: &Config, url: &str) -> Result<String> {
    let attempts = config.max_retries.max(1);
    let mut attempt = 0;
    loop {
        match get_text(client, url).await {
            Ok(body) => return Ok(body),
            Err(e) if attempt + 1 < attempts => {
                let delay = backoff(config.retry_backoff_ms, attempt);
                warn!(
                    attempt = attempt + 1,
                    error = %e,
                    "Fetch failed, retrying in {}ms",
                    delay.as_millis()
                );
                sleep(delay).await;
                attempt += 1;
            }
            Err(e) => {
                return Err(e).with_context(|| format!("HTTP request failed after {} attempt(s)", attempts))
            }
        }
    }
}

async fn collect_unit(
    client: &reqwest::Client,
    config: &Config,
    extractor: &Extractor,
    hotel_url: &str,
    check_in: NaiveDate,
) -> Result<HotelPricing> {
    let check_out = check_in.succ_opt().context("check-in date out of range")?;
    let search_url = build_search_url(hotel_url, check_in, check_out)?;

    info!("Fetching {} -> {}: {}", check_in, check_out, search_url);
    let body = fetch_page(client, config, &search_url).await?;
    let hash = content_hash(body.as_bytes());
    info!("Downloaded {} bytes, hash {}", body.len(), hash);
    if looks_blocked(&body) {
        warn!("Page looks like a bot challenge: {}", search_url);
    }

    let page = extractor.extract(&body);
    let Some(strategy) = page.strategy else {
        bail!("no room prices found on page ({})", hash);
    };

    Ok(HotelPricing {
        hotel_url: hotel_url.to_string(),
        hotel_id: hotel_id_from(&search_url),
        search_url,
        hotel_name: page.hotel_name.unwrap_or_else(|| "Unknown Hotel".to_string()),
        location: page.location,
        check_in,
        check_out,
        rating: page.rating,
        review_count: page.review_count,
        rooms: page.rooms,
        strategy,
        content_hash: hash,
        scraped_at: Utc::now(),
    })
}

/// Fetches every hotel for every target date; failures are recorded, never fatal
async fn run_session(
    client: &reqwest::Client,
    config: &Config,
    extractor: &Extractor,
    hotel_urls: &[String],
    today: NaiveDate,
    running: &AtomicBool,
) -> Session {
    let mut session = Session::start(target_dates(today));
    let dates = session.target_dates.clone();
    info!(
        session_id = %session.session_id,
        "Starting session for {} hotel(s), dates {:?}",
        hotel_urls.len(),
        dates
    );

    'hotels: for (i, hotel_url) in hotel_urls.iter().enumerate() {
        info!("[{}/{}] {}", i + 1, hotel_urls.len(), hotel_url);
        for &check_in in &dates {
            if !running.load(Ordering::SeqCst) {
                warn!("Stop requested, ending session early");
                session.add_error("session interrupted before all hotels were collected".to_string());
                break 'hotels;
            }

            sleep(jittered(Duration::from_millis(config.rate_limit_ms))).await;

            match collect_unit(client, config, extractor, hotel_url, check_in).await {
                Ok(pricing) => {
                    info!(
                        "  ✓ {} ({} room(s), lowest {:?}, via {})",
                        pricing.hotel_name,
                        pricing.rooms.len(),
                        pricing.lowest_price(),
                        pricing.strategy
                    );
                    session.add_result(pricing);
                }
                Err(e) => {
                    let message = format!("{} [{}]: {:#}", hotel_url, check_in, e);
                    error!("  ✗ {}", message);
                    session.add_error(message);
                }
            }
        }
    }

    session.finish();
    session
}

async fn run_and_save(
    client: &reqwest::Client,
    config: &Config,
    extractor: &Extractor,
    hotel_urls: &[String],
    running: &AtomicBool,
) -> Result<Session> {
    let today = Local::now().date_naive();
    let session = run_session(client, config, extractor, hotel_urls, today, running).await;
    let path = save_session(config, &session).await?;

    println!("\n=== Collection Summary ===");
    println!("Session: {}", session.session_id);
    println!("Collected: {}", session.success_count);
    println!("Failed: {}", session.error_count);
    println!("Saved: {}", path.display());
    Ok(session)
}

// =============================================================================
// Main
// =============================================================================

fn init_logging() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer())
        .init();
}

fn spawn_stop_listener(running: Arc<AtomicBool>) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Ctrl-C received, stopping after the current fetch");
            running.store(false, Ordering::SeqCst);
        }
    });
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    init_logging();
    let args = Args::parse();
    let config = Config::from_env();
    let config_path = PathBuf::from(&args.config);

    let mut schedule = ScheduleConfig::load(&config_path).await?;

    // Config management commands exit right away
    if let Some(url) = &args.add_url {
        if schedule.add_url(url)? {
            schedule.save(&config_path).await?;
            println!("Added URL: {}", url);
        } else {
            println!("Already configured: {}", url);
        }
        return Ok(());
    }
    if let Some(url) = &args.remove_url {
        if schedule.remove_url(url) {
            schedule.save(&config_path).await?;
            println!("Removed URL: {}", url);
        } else {
            println!("Not configured: {}", url);
        }
        return Ok(());
    }
    if args.list_urls {
        println!("Configured hotel URLs ({}):", schedule.hotel_urls.len());
        for (i, url) in schedule.hotel_urls.iter().enumerate() {
            println!("  {}. {}", i + 1, url);
        }
        println!("Daily run time: {}", schedule.schedule_time);
        return Ok(());
    }
    if let Some(time) = &args.time {
        schedule.set_time(time)?;
        schedule.save(&config_path).await?;
        info!("Daily run time set to {}", schedule.schedule_time);
    }

    println!("=== Hotel Price Collector ===");
    println!("Output: {}", config.output_dir.display());

    let client = build_client(&config)?;
    let extractor = Extractor::new()?;
    let running = Arc::new(AtomicBool::new(true));
    spawn_stop_listener(running.clone());

    if let Some(url) = &args.url {
        validate_url(url)?;
        run_and_save(&client, &config, &extractor, std::slice::from_ref(url), &running).await?;
        return Ok(());
    }

    if schedule.hotel_urls.is_empty() {
        bail!("No hotel URLs configured. Add one with --add-url <url>");
    }

    if args.run_once {
        run_and_save(&client, &config, &extractor, &schedule.hotel_urls, &running).await?;
        return Ok(());
    }

    // Daemon mode
    loop {
        let now = Local::now().naive_local();
        let next = next_run_after(now, schedule.run_time()?);
        let wait = (next - now).to_std().unwrap_or(Duration::ZERO);
        info!("Next run at {} ({} hotel(s)); press Ctrl-C to stop", next, schedule.hotel_urls.len());

        if !sleep_while_running(wait, &running).await {
            break;
        }

        // Pick up URLs added by other invocations since the last run
        match ScheduleConfig::load(&config_path).await {
            Ok(latest) => schedule = latest,
            Err(e) => warn!(error = %e, "Keeping previous schedule config"),
        }

        if let Err(e) = run_and_save(&client, &config, &extractor, &schedule.hotel_urls, &running).await {
            error!(error = %e, "Scheduled run failed");
        }
        if !running.load(Ordering::SeqCst) {
            break;
        }
    }

    info!("Collector stopped");
    Ok(())
}
