//! Manual price-override rows feeding the price table.

use rusqlite::{params, Connection, Row};
use serde::{Deserialize, Serialize};

use crate::error::AppResult;

use super::{now_ts, Store};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PriceRow {
    pub model: String,
    pub input_per_token: f64,
    pub output_per_token: f64,
    #[serde(default)]
    pub cache_read_per_token: f64,
    #[serde(default)]
    pub cache_creation_per_token: f64,
    #[serde(default)]
    pub source: String,
    #[serde(default)]
    pub updated_at: String,
}

fn row_to_price(row: &Row<'_>) -> rusqlite::Result<PriceRow> {
    Ok(PriceRow {
        model: row.get(0)?,
        input_per_token: row.get(1)?,
        output_per_token: row.get(2)?,
        cache_read_per_token: row.get(3)?,
        cache_creation_per_token: row.get(4)?,
        source: row.get(5)?,
        updated_at: row.get(6)?,
    })
}

pub fn list(conn: &Connection) -> rusqlite::Result<Vec<PriceRow>> {
    let mut stmt = conn.prepare(
        "SELECT model, input_per_token, output_per_token, cache_read_per_token,
                cache_creation_per_token, source, updated_at
         FROM model_prices ORDER BY model",
    )?;
    let rows = stmt.query_map([], row_to_price)?;
    rows.collect()
}

impl Store {
    pub async fn upsert_price_override(&self, mut row: PriceRow) -> AppResult<PriceRow> {
        row.source = "manual".to_string();
        row.updated_at = now_ts();
        let conn = self.conn().await?;
        conn.execute(
            "INSERT INTO model_prices
                 (model, input_per_token, output_per_token, cache_read_per_token,
                  cache_creation_per_token, source, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT (model) DO UPDATE SET
                 input_per_token = excluded.input_per_token,
                 output_per_token = excluded.output_per_token,
                 cache_read_per_token = excluded.cache_read_per_token,
                 cache_creation_per_token = excluded.cache_creation_per_token,
                 source = excluded.source,
                 updated_at = excluded.updated_at",
            params![
                row.model,
                row.input_per_token,
                row.output_per_token,
                row.cache_read_per_token,
                row.cache_creation_per_token,
                row.source,
                row.updated_at
            ],
        )?;
        Ok(row)
    }

    pub async fn list_price_overrides(&self) -> AppResult<Vec<PriceRow>> {
        let conn = self.conn().await?;
        Ok(list(&conn)?)
    }

    pub async fn delete_price_override(&self, model: &str) -> AppResult<bool> {
        let conn = self.conn().await?;
        let affected = conn.execute("DELETE FROM model_prices WHERE model = ?1", params![model])?;
        Ok(affected > 0)
    }
}
