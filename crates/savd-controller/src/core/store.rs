use std::path::Path;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use savd_proto::Observation;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use tracing::debug;

const MAX_CONNECTIONS: u32 = 5;

/// Controller-side SQLite store holding ingested observations
/// (`SnifferInfo`) and detector output (`IPBlacklist`).
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    pub async fn connect(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await.with_context(|| {
                    format!("failed to create db dir {}", parent.display())
                })?;
            }
        }

        let options = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(MAX_CONNECTIONS)
            .connect_with(options)
            .await
            .with_context(|| {
                format!("failed to open sqlite db {}", db_path.display())
            })?;

        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    /// Single-connection in-memory store (a pooled `:memory:` database is
    /// one database per connection).
    #[cfg(test)]
    pub async fn connect_in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .context("failed to open in-memory sqlite db")?;

        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    async fn init_schema(&self) -> Result<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS SnifferInfo (
                id INTEGER PRIMARY KEY,
                sip TEXT,
                dip TEXT,
                sport INTEGER,
                dport INTEGER,
                protocol TEXT,
                tcp_flag TEXT,
                timestamp REAL,
                length INTEGER,
                time_arr INTEGER,
                duration INTEGER,
                count INTEGER DEFAULT 1
            )",
        )
        .execute(&self.pool)
        .await
        .context("failed to create SnifferInfo table")?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS IPBlacklist (
                id INTEGER PRIMARY KEY,
                ip TEXT UNIQUE,
                time_arr INTEGER,
                duration INTEGER DEFAULT 0
            )",
        )
        .execute(&self.pool)
        .await
        .context("failed to create IPBlacklist table")?;

        Ok(())
    }

    /// Inserts a flagged IP, or refreshes `time_arr` when it is already
    /// blacklisted. Repeated flagging therefore extends a row's life.
    pub async fn blacklist_upsert(
        &self,
        ip: &str,
    ) -> Result<()> {
        let now = now_unix_secs();
        let result = sqlx::query(
            "INSERT INTO IPBlacklist (ip, time_arr, duration) VALUES (?, ?, 0)
             ON CONFLICT(ip) DO UPDATE SET time_arr = excluded.time_arr",
        )
        .bind(ip)
        .bind(now)
        .execute(&self.pool)
        .await
        .context("failed to upsert IPBlacklist")?;

        debug!(
            "blacklist upsert: ip={}, rows_affected={}",
            ip,
            result.rows_affected()
        );
        Ok(())
    }

    /// Recomputes every row's `duration` as now minus `time_arr`.
    pub async fn blacklist_refresh_durations(&self) -> Result<u64> {
        let now = now_unix_secs();
        let result = sqlx::query(
            "UPDATE IPBlacklist SET duration = ? - time_arr",
        )
        .bind(now)
        .execute(&self.pool)
        .await
        .context("failed to refresh blacklist durations")?;

        Ok(result.rows_affected())
    }

    /// Deletes rows whose duration exceeds the retention threshold.
    pub async fn blacklist_prune(
        &self,
        older_than: Duration,
    ) -> Result<u64> {
        let result = sqlx::query("DELETE FROM IPBlacklist WHERE duration > ?")
            .bind(older_than.as_secs() as i64)
            .execute(&self.pool)
            .await
            .context("failed to prune blacklist")?;

        Ok(result.rows_affected())
    }

    #[cfg(test)]
    pub(crate) async fn blacklist_contains(
        &self,
        ip: &str,
    ) -> Result<bool> {
        let found = sqlx::query_scalar::<_, i64>(
            "SELECT 1 FROM IPBlacklist WHERE ip = ? LIMIT 1",
        )
        .bind(ip)
        .fetch_optional(&self.pool)
        .await
        .context("failed to query IPBlacklist")?;

        Ok(found.is_some())
    }

    /// Materializes blacklist rows as rule strings: the configured
    /// projection columns of each row, space-joined. Column names are
    /// validated at config load; values are cast to text in SQL.
    pub async fn fetch_rules(
        &self,
        columns: &[String],
    ) -> Result<Vec<String>> {
        let projection = columns
            .iter()
            .map(|column| format!("CAST({column} AS TEXT)"))
            .collect::<Vec<_>>()
            .join(", ");
        let query = format!("SELECT {projection} FROM IPBlacklist");

        let rows = sqlx::query(&query)
            .fetch_all(&self.pool)
            .await
            .context("failed to fetch blacklist rules")?;

        let mut rules = Vec::with_capacity(rows.len());
        for row in rows {
            let mut parts = Vec::with_capacity(columns.len());
            for index in 0..columns.len() {
                let value: Option<String> = row
                    .try_get(index)
                    .context("failed to read blacklist rule column")?;
                parts.push(value.unwrap_or_default());
            }
            rules.push(parts.join(" "));
        }
        Ok(rules)
    }

    /// Bulk-upserts drained spool records. Rows are keyed by the
    /// (sip, dip, sport, dport, protocol) tuple: repeats bump `count` and
    /// refresh the volatile columns, new tuples insert with count 1.
    pub async fn sniffer_info_upsert_batch(
        &self,
        rows: &[Observation],
    ) -> Result<()> {
        let now = now_unix_secs();
        let mut tx = self.pool.begin().await.context("failed to begin tx")?;

        for row in rows {
            let protocol = row.protocol.to_string();
            let existing = sqlx::query_scalar::<_, i64>(
                "SELECT id FROM SnifferInfo
                 WHERE sip = ? AND dip = ? AND sport = ? AND dport = ? AND protocol = ?
                 LIMIT 1",
            )
            .bind(&row.src_ip)
            .bind(&row.dst_ip)
            .bind(i64::from(row.src_port))
            .bind(i64::from(row.dst_port))
            .bind(&protocol)
            .fetch_optional(&mut *tx)
            .await
            .context("failed to query SnifferInfo")?;

            if let Some(id) = existing {
                sqlx::query(
                    "UPDATE SnifferInfo
                     SET count = count + 1, tcp_flag = ?, timestamp = ?, length = ?, time_arr = ?
                     WHERE id = ?",
                )
                .bind(row.flags.as_deref())
                .bind(row.timestamp)
                .bind(i64::from(row.length))
                .bind(now)
                .bind(id)
                .execute(&mut *tx)
                .await
                .context("failed to update SnifferInfo")?;
            } else {
                sqlx::query(
                    "INSERT INTO SnifferInfo
                     (sip, dip, sport, dport, protocol, tcp_flag, timestamp, length, time_arr)
                     VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
                )
                .bind(&row.src_ip)
                .bind(&row.dst_ip)
                .bind(i64::from(row.src_port))
                .bind(i64::from(row.dst_port))
                .bind(&protocol)
                .bind(row.flags.as_deref())
                .bind(row.timestamp)
                .bind(i64::from(row.length))
                .bind(now)
                .execute(&mut *tx)
                .await
                .context("failed to insert SnifferInfo")?;
            }
        }

        tx.commit().await.context("failed to commit tx")?;
        Ok(())
    }

    #[cfg(test)]
    pub async fn sniffer_info_count(
        &self,
        src_ip: &str,
        dst_ip: &str,
    ) -> Result<Option<i64>> {
        sqlx::query_scalar::<_, i64>(
            "SELECT count FROM SnifferInfo WHERE sip = ? AND dip = ? LIMIT 1",
        )
        .bind(src_ip)
        .bind(dst_ip)
        .fetch_optional(&self.pool)
        .await
        .context("failed to query SnifferInfo count")
    }

    #[cfg(test)]
    pub async fn backdate_blacklist_entry(
        &self,
        ip: &str,
        age: Duration,
    ) -> Result<()> {
        sqlx::query("UPDATE IPBlacklist SET time_arr = time_arr - ? WHERE ip = ?")
            .bind(age.as_secs() as i64)
            .bind(ip)
            .execute(&self.pool)
            .await
            .context("failed to backdate blacklist entry")?;
        Ok(())
    }
}

fn now_unix_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs() as i64)
        .unwrap_or(0)
}
