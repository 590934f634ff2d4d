//! One-shot startup migrations.
//!
//! Historic rows may carry RFC3339 timestamps with explicit offsets; every
//! stored timestamp must be UTC so window queries can compare strings. The
//! rewrite runs once and marks completion in `system_config`.

use rusqlite::params;

use crate::error::AppResult;

use super::{fmt_ts, parse_ts, Store};

const MARKER_KEY: &str = "timestamps_normalized";

/// (table, [timestamp columns]) pairs subject to normalization.
const TIMESTAMP_COLUMNS: &[(&str, &[&str])] = &[
    ("users", &["created_at"]),
    ("api_keys", &["revoked_at", "last_used_at", "created_at"]),
    ("channels", &["created_at"]),
    ("subscriptions", &["starts_at", "expires_at"]),
    ("billing_events", &["created_at"]),
    ("request_logs", &["created_at"]),
    ("model_prices", &["updated_at"]),
];

impl Store {
    /// Rewrite any offset-bearing timestamp into its canonical UTC form.
    /// Subsequent startups skip the scan via the `system_config` marker.
    pub async fn normalize_timestamps(&self) -> AppResult<()> {
        let mut conn = self.conn().await?;

        if super::system_config::get(&conn, MARKER_KEY)?.is_some() {
            return Ok(());
        }

        let tx = conn.transaction()?;
        let mut rewritten = 0usize;
        for (table, columns) in TIMESTAMP_COLUMNS {
            for column in *columns {
                let mut stmt = tx.prepare(&format!(
                    "SELECT rowid, {col} FROM {table} WHERE {col} IS NOT NULL",
                    col = column,
                    table = table
                ))?;
                let rows: Vec<(i64, String)> = stmt
                    .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
                    .collect::<Result<_, _>>()?;
                drop(stmt);

                for (rowid, raw) in rows {
                    let Some(parsed) = parse_ts(&raw) else {
                        continue;
                    };
                    let canonical = fmt_ts(&parsed);
                    if canonical != raw {
                        tx.execute(
                            &format!("UPDATE {table} SET {col} = ?1 WHERE rowid = ?2",
                                table = table, col = column),
                            params![canonical, rowid],
                        )?;
                        rewritten += 1;
                    }
                }
            }
        }
        super::system_config::set(&tx, MARKER_KEY, "1")?;
        tx.commit()?;

        if rewritten > 0 {
            crate::logger::info(
                "store",
                &format!("Normalized {} timestamp values to UTC", rewritten),
            );
        }
        Ok(())
    }
}
