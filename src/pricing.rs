//! Price table and cost calculator.
//!
//! A process-wide map of `model id -> per-token USD rates` published as
//! copy-on-write snapshots: readers clone an `Arc`, the refresher swaps the
//! pointer. Manual overrides from the store take precedence over the
//! periodic external catalogue fetch; a failed fetch keeps the previous
//! snapshot and raises the stale flag.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use serde_json::Value;

use crate::config::HotConfig;
use crate::forward::context::TokenUsage;
use crate::store::Store;

/// Default refresh interval when `cache_ttl_override` is unset.
const DEFAULT_REFRESH_SECS: u64 = 6 * 3600;
/// External catalogue; overridable via `system_config['price_catalogue_url']`.
const DEFAULT_CATALOGUE_URL: &str =
    "https://raw.githubusercontent.com/BerriAI/litellm/main/model_prices_and_context_window.json";

pub const KEY_CATALOGUE_URL: &str = "price_catalogue_url";

/// Per-token USD rates for one pricing model.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct ModelPrice {
    pub input_per_token: f64,
    pub output_per_token: f64,
    pub cache_read_per_token: f64,
    pub cache_creation_per_token: f64,
}

#[derive(Debug, Default)]
pub struct PriceSnapshot {
    pub prices: HashMap<String, ModelPrice>,
    pub refreshed_at: Option<String>,
    pub stale: bool,
}

/// Handle to the current snapshot. Clones share the same table.
#[derive(Clone, Default)]
pub struct PriceTable {
    snapshot: Arc<RwLock<Arc<PriceSnapshot>>>,
}

/// Result of a cost computation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CostResult {
    pub cost_micros: i64,
    pub price_found: bool,
}

static DATE_SEGMENT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(\d{4}-\d{2}-\d{2}|\d{8})").expect("date regex"));

/// Split a model name into its date-free series and an extracted version
/// date (as yyyymmdd) when one is present.
fn series_and_date(name: &str) -> (String, Option<u32>) {
    let Some(m) = DATE_SEGMENT.find(name) else {
        return (name.to_string(), None);
    };
    let digits: String = m.as_str().chars().filter(|c| c.is_ascii_digit()).collect();
    let date = digits.parse::<u32>().ok().filter(|d| *d >= 10_000_000);
    let mut series = format!("{}{}", &name[..m.start()], &name[m.end()..]);
    while series.contains("--") {
        series = series.replace("--", "-");
    }
    let series = series.trim_matches('-').to_string();
    (series, date)
}

impl PriceSnapshot {
    /// Exact lookup, then the fuzzy fallback: strip `-latest` and prefix
    /// match, then date-free series match preferring the newest version.
    pub fn lookup(&self, model: &str) -> Option<ModelPrice> {
        if let Some(price) = self.prices.get(model) {
            return Some(*price);
        }

        let stripped = model.strip_suffix("-latest").unwrap_or(model);
        let mut prefix_hits: Vec<(&String, Option<u32>)> = self
            .prices
            .keys()
            .filter(|key| key.starts_with(stripped))
            .map(|key| (key, series_and_date(key).1))
            .collect();
        if !prefix_hits.is_empty() {
            prefix_hits.sort_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(b.0)));
            let best = prefix_hits.last()?.0;
            return self.prices.get(best.as_str()).copied();
        }

        let (wanted_series, _) = series_and_date(model);
        let mut series_hits: Vec<(&String, Option<u32>)> = self
            .prices
            .keys()
            .filter(|key| series_and_date(key).0 == wanted_series)
            .map(|key| (key, series_and_date(key).1))
            .collect();
        if !series_hits.is_empty() {
            series_hits.sort_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(b.0)));
            let best = series_hits.last()?.0;
            return self.prices.get(best.as_str()).copied();
        }

        None
    }
}

impl PriceTable {
    pub fn snapshot(&self) -> Arc<PriceSnapshot> {
        self.snapshot.read().expect("price lock poisoned").clone()
    }

    pub fn publish(&self, snapshot: PriceSnapshot) {
        *self.snapshot.write().expect("price lock poisoned") = Arc::new(snapshot);
    }

    pub fn is_stale(&self) -> bool {
        self.snapshot().stale
    }

    /// Compute the cost of a request against this table. Negative token
    /// counts clamp to zero; an unknown model costs zero.
    pub fn cost(&self, pricing_model: &str, usage: &TokenUsage) -> CostResult {
        let snapshot = self.snapshot();
        match snapshot.lookup(pricing_model) {
            Some(price) => CostResult {
                cost_micros: cost_micros(&price, usage),
                price_found: true,
            },
            None => CostResult {
                cost_micros: 0,
                price_found: false,
            },
        }
    }

    /// Rebuild the snapshot from the catalogue plus store overrides.
    pub async fn refresh(&self, store: &Store) {
        let url = store
            .system_config_get(KEY_CATALOGUE_URL)
            .await
            .ok()
            .flatten()
            .unwrap_or_else(|| DEFAULT_CATALOGUE_URL.to_string());

        let catalogue = fetch_catalogue(&url).await;
        let overrides = store.list_price_overrides().await.unwrap_or_default();

        let mut snapshot = PriceSnapshot::default();
        match catalogue {
            Ok(prices) => {
                crate::logger::info(
                    "pricing",
                    &format!("Catalogue refresh loaded {} models", prices.len()),
                );
                snapshot.prices = prices;
                snapshot.refreshed_at = Some(crate::store::now_ts());
            }
            Err(e) => {
                crate::logger::warn("pricing", &format!("Catalogue refresh failed: {}", e));
                let previous = self.snapshot();
                snapshot.prices = previous.prices.clone();
                snapshot.refreshed_at = previous.refreshed_at.clone();
                snapshot.stale = true;
            }
        }

        // Manual overrides win over catalogue entries.
        for row in overrides {
            snapshot.prices.insert(
                row.model.clone(),
                ModelPrice {
                    input_per_token: row.input_per_token,
                    output_per_token: row.output_per_token,
                    cache_read_per_token: row.cache_read_per_token,
                    cache_creation_per_token: row.cache_creation_per_token,
                },
            );
        }

        self.publish(snapshot);
    }

    /// Periodic refresh loop; interval follows `cache_ttl_override`.
    pub fn spawn_refresher(&self, store: Store, hot: HotConfig) {
        let table = self.clone();
        tokio::spawn(async move {
            loop {
                table.refresh(&store).await;
                let secs = hot
                    .cache_ttl_override_secs()
                    .unwrap_or(DEFAULT_REFRESH_SECS)
                    .max(60);
                tokio::time::sleep(Duration::from_secs(secs)).await;
            }
        });
    }
}

async fn fetch_catalogue(url: &str) -> Result<HashMap<String, ModelPrice>, String> {
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(30))
        .build()
        .map_err(|e| e.to_string())?;
    let body: Value = client
        .get(url)
        .send()
        .await
        .map_err(|e| e.to_string())?
        .error_for_status()
        .map_err(|e| e.to_string())?
        .json()
        .await
        .map_err(|e| e.to_string())?;

    let Some(entries) = body.as_object() else {
        return Err("catalogue root is not an object".to_string());
    };

    let mut prices = HashMap::new();
    for (model, entry) in entries {
        let Some(entry) = entry.as_object() else {
            continue;
        };
        let rate = |key: &str| entry.get(key).and_then(|v| v.as_f64()).unwrap_or(0.0);
        let price = ModelPrice {
            input_per_token: rate("input_cost_per_token"),
            output_per_token: rate("output_cost_per_token"),
            cache_read_per_token: rate("cache_read_input_token_cost"),
            cache_creation_per_token: rate("cache_creation_input_token_cost"),
        };
        if price.input_per_token > 0.0 || price.output_per_token > 0.0 {
            prices.insert(model.clone(), price);
        }
    }
    Ok(prices)
}

/// Per-component `round(tokens * rate * 1e6)`, summed as int64 micros.
pub fn cost_micros(price: &ModelPrice, usage: &TokenUsage) -> i64 {
    let component = |tokens: i64, rate: f64| -> i64 {
        let tokens = tokens.max(0);
        (tokens as f64 * rate * 1e6).round() as i64
    };
    component(usage.input_tokens, price.input_per_token)
        + component(usage.output_tokens, price.output_per_token)
        + component(usage.cache_read_tokens, price.cache_read_per_token)
        + component(usage.cache_creation_tokens, price.cache_creation_per_token)
}

/// Apply a group rate multiplier to a raw cost.
pub fn apply_multiplier(raw_micros: i64, multiplier: f64) -> i64 {
    (raw_micros as f64 * multiplier).round() as i64
}

/// Six-decimal USD rendering of a micro-USD amount.
pub fn usd_string(micros: i64) -> String {
    format!("{:.6}", micros as f64 / 1e6)
}
