//! Relational store behind one portable abstraction.
//!
//! A single code path serves both database flavors through `sqlx`'s `Any`
//! driver: `sqlite:` URLs open the embedded single-file store (development
//! and validation), `postgres:` URLs the server database (production). All
//! SQL here is portable (`ON CONFLICT` upserts and `$n` binds work on
//! both backends) and every text column is UTF-8 end to end. Monetary
//! values persist as canonical decimal strings so precision never narrows;
//! timestamps persist as RFC 3339 text next to the raw unix grid values.
//!
//! Write discipline: every write runs in a transaction; batch writes use
//! one transaction per batch. For the embedded store the high-volume
//! inserts additionally funnel through an ordered batch queue
//! ([`write_queue::WriteQueue`]) and the store enables WAL and a busy
//! timeout at open. A storage-side circuit breaker trips on prolonged lock
//! contention instead of letting it cascade.

pub mod write_queue;

use crate::circuit_breaker::CircuitBreaker;
use crate::error::{HarvestError, Result};
use crate::models::{
    AlertLevel, CollectorMetadata, Dex, NewPoolSnapshot, OhlcvCandle, Pool, SystemAlert, Timeframe,
    Token, Trade, TradeSide, WatchlistEntry,
};
use crate::settings::Settings;
use chrono::{DateTime, SecondsFormat, Utc};
use rust_decimal::Decimal;
use sqlx::any::AnyPoolOptions;
use sqlx::{AnyPool, Row};
use std::str::FromStr;
use std::sync::Once;
use std::time::Duration;
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::RetryIf;
use tracing::{info, warn};
use uuid::Uuid;
use write_queue::{InsertStats, WriteOp, WriteQueue};

const STORAGE_BREAKER_KEY: &str = "storage_writes";

static INSTALL_DRIVERS: Once = Once::new();

pub struct Storage {
    pool: AnyPool,
    breaker: CircuitBreaker,
    queue: Option<WriteQueue>,
    lock_retry_attempts: u32,
    lock_retry_base_delay_ms: u64,
}

impl Storage {
    /// Open the database, apply embedded-store tuning, and create the
    /// schema if it does not exist yet. Connection attempts retry with
    /// exponential backoff to survive startup races.
    pub async fn connect(settings: &Settings) -> Result<Self> {
        INSTALL_DRIVERS.call_once(sqlx::any::install_default_drivers);

        let db = &settings.database;
        let is_sqlite = db.is_sqlite();
        // A shared-nothing in-memory store would give every pooled
        // connection its own empty database.
        let max_connections = if db.url.contains(":memory:") {
            1
        } else {
            db.max_connections
        };

        let busy_timeout_ms = db.busy_timeout_ms;
        let mut last_err: Option<HarvestError> = None;
        let max_attempts: u32 = 10;

        for attempt in 1..=max_attempts {
            let options = AnyPoolOptions::new()
                .max_connections(max_connections)
                .acquire_timeout(Duration::from_secs(db.acquire_timeout_secs))
                .after_connect(move |conn, _meta| {
                    Box::pin(async move {
                        if is_sqlite {
                            sqlx::query("PRAGMA journal_mode=WAL").execute(&mut *conn).await?;
                            sqlx::query(&format!("PRAGMA busy_timeout={busy_timeout_ms}"))
                                .execute(&mut *conn)
                                .await?;
                        }
                        Ok(())
                    })
                });

            match options.connect(&db.url).await {
                Ok(pool) => {
                    if let Err(e) = initialize_schema(&pool).await {
                        last_err = Some(e);
                    } else {
                        info!(attempt, sqlite = is_sqlite, "database connected");
                        let queue = if is_sqlite {
                            Some(WriteQueue::start(pool.clone(), &db.write_queue))
                        } else {
                            None
                        };
                        return Ok(Self {
                            pool,
                            breaker: CircuitBreaker::new(&settings.circuit_breaker),
                            queue,
                            lock_retry_attempts: db.lock_retry_attempts,
                            lock_retry_base_delay_ms: db.lock_retry_base_delay_ms,
                        });
                    }
                }
                Err(e) => last_err = Some(HarvestError::from_sqlx(e)),
            }

            let delay_ms = (1u64 << attempt.min(6)) * 100;
            warn!(
                attempt,
                max_attempts, delay_ms, "database connect failed, retrying"
            );
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
        }

        Err(last_err
            .unwrap_or_else(|| HarvestError::DatabaseConnection("unknown connect failure".into())))
    }

    /// Close the connection pool. Runs on every shutdown path.
    pub async fn close(&self) {
        self.pool.close().await;
    }

    pub fn any_pool(&self) -> &AnyPool {
        &self.pool
    }

    /// True while the storage breaker is rejecting writes.
    pub fn writes_suspended(&self) -> bool {
        self.breaker.check(STORAGE_BREAKER_KEY).is_err()
    }

    async fn guarded_write<T, Fut>(&self, mut op: impl FnMut() -> Fut) -> Result<T>
    where
        Fut: std::future::Future<Output = Result<T>>,
    {
        self.breaker.check(STORAGE_BREAKER_KEY)?;
        let strategy = ExponentialBackoff::from_millis(self.lock_retry_base_delay_ms.max(1))
            .max_delay(Duration::from_secs(2))
            .map(jitter)
            .take(self.lock_retry_attempts as usize);

        let result = RetryIf::spawn(strategy, || op(), is_lock_contention).await;
        match &result {
            Ok(_) => self.breaker.record_success(STORAGE_BREAKER_KEY),
            Err(e) => self.breaker.record_failure(STORAGE_BREAKER_KEY, e),
        }
        result
    }

    // === Deduplicating inserts ===

    /// Insert candles, silently skipping rows that conflict on
    /// `(pool_id, timeframe, timestamp_unix)`.
    pub async fn insert_candles(&self, candles: &[OhlcvCandle]) -> Result<InsertStats> {
        if candles.is_empty() {
            return Ok(InsertStats::default());
        }
        if let Some(queue) = &self.queue {
            return queue.submit(WriteOp::Candles(candles.to_vec())).await;
        }
        self.guarded_write(|| async {
            let mut tx = self.pool.begin().await.map_err(HarvestError::from_sqlx)?;
            let stats = apply_candles(&mut tx, candles).await?;
            tx.commit().await.map_err(HarvestError::from_sqlx)?;
            Ok(stats)
        })
        .await
    }

    /// Insert trades, silently skipping rows that conflict on `id`.
    pub async fn insert_trades(&self, trades: &[Trade]) -> Result<InsertStats> {
        if trades.is_empty() {
            return Ok(InsertStats::default());
        }
        if let Some(queue) = &self.queue {
            return queue.submit(WriteOp::Trades(trades.to_vec())).await;
        }
        self.guarded_write(|| async {
            let mut tx = self.pool.begin().await.map_err(HarvestError::from_sqlx)?;
            let stats = apply_trades(&mut tx, trades).await?;
            tx.commit().await.map_err(HarvestError::from_sqlx)?;
            Ok(stats)
        })
        .await
    }

    /// Append one new-pool history snapshot; one row per collection pass.
    pub async fn insert_new_pool_snapshot(&self, snapshot: &NewPoolSnapshot) -> Result<()> {
        if let Some(queue) = &self.queue {
            queue
                .submit(WriteOp::Snapshot(Box::new(snapshot.clone())))
                .await?;
            return Ok(());
        }
        self.guarded_write(|| async {
            let mut tx = self.pool.begin().await.map_err(HarvestError::from_sqlx)?;
            apply_snapshot(&mut tx, snapshot).await?;
            tx.commit().await.map_err(HarvestError::from_sqlx)?;
            Ok(())
        })
        .await
    }

    // === Upserts ===

    /// Upsert DEX rows; names refresh, rows are never deleted.
    pub async fn upsert_dexes(&self, dexes: &[Dex]) -> Result<u64> {
        if dexes.is_empty() {
            return Ok(0);
        }
        self.guarded_write(|| async {
            let mut tx = self.pool.begin().await.map_err(HarvestError::from_sqlx)?;
            for dex in dexes {
                sqlx::query(
                    "INSERT INTO dexes (id, name, network_id) VALUES ($1, $2, $3)
                     ON CONFLICT (id) DO UPDATE SET
                        name = excluded.name,
                        network_id = excluded.network_id",
                )
                .bind(&dex.id)
                .bind(&dex.name)
                .bind(&dex.network_id)
                .execute(&mut *tx)
                .await
                .map_err(HarvestError::from_sqlx)?;
            }
            tx.commit().await.map_err(HarvestError::from_sqlx)?;
            Ok(dexes.len() as u64)
        })
        .await
    }

    /// Upsert tokens keyed by the canonical id. Fresh nulls never overwrite
    /// previously known values.
    pub async fn upsert_tokens(&self, tokens: &[Token]) -> Result<u64> {
        if tokens.is_empty() {
            return Ok(0);
        }
        self.guarded_write(|| async {
            let mut tx = self.pool.begin().await.map_err(HarvestError::from_sqlx)?;
            for token in tokens {
                sqlx::query(
                    "INSERT INTO tokens (id, address, name, symbol, decimals, network, price_usd, last_updated)
                     VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                     ON CONFLICT (id) DO UPDATE SET
                        address = excluded.address,
                        name = COALESCE(excluded.name, tokens.name),
                        symbol = COALESCE(excluded.symbol, tokens.symbol),
                        decimals = COALESCE(excluded.decimals, tokens.decimals),
                        network = excluded.network,
                        price_usd = COALESCE(excluded.price_usd, tokens.price_usd),
                        last_updated = excluded.last_updated",
                )
                .bind(&token.id)
                .bind(&token.address)
                .bind(&token.name)
                .bind(&token.symbol)
                .bind(token.decimals.map(i64::from))
                .bind(&token.network)
                .bind(token.price_usd.map(|d| d.to_string()))
                .bind(encode_dt(&token.last_updated))
                .execute(&mut *tx)
                .await
                .map_err(HarvestError::from_sqlx)?;
            }
            tx.commit().await.map_err(HarvestError::from_sqlx)?;
            Ok(tokens.len() as u64)
        })
        .await
    }

    /// Upsert pools keyed by the canonical id. Fresh nulls never overwrite
    /// previously known values, so minimal rows fill in over time.
    pub async fn upsert_pools(&self, pools: &[Pool]) -> Result<u64> {
        if pools.is_empty() {
            return Ok(0);
        }
        self.guarded_write(|| async {
            let mut tx = self.pool.begin().await.map_err(HarvestError::from_sqlx)?;
            for pool in pools {
                sqlx::query(
                    "INSERT INTO pools (id, address, name, dex_id, base_token_id, quote_token_id, reserve_usd, created_at, last_updated)
                     VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
                     ON CONFLICT (id) DO UPDATE SET
                        address = excluded.address,
                        name = COALESCE(excluded.name, pools.name),
                        dex_id = COALESCE(excluded.dex_id, pools.dex_id),
                        base_token_id = COALESCE(excluded.base_token_id, pools.base_token_id),
                        quote_token_id = COALESCE(excluded.quote_token_id, pools.quote_token_id),
                        reserve_usd = COALESCE(excluded.reserve_usd, pools.reserve_usd),
                        created_at = COALESCE(excluded.created_at, pools.created_at),
                        last_updated = excluded.last_updated",
                )
                .bind(&pool.id)
                .bind(&pool.address)
                .bind(&pool.name)
                .bind(&pool.dex_id)
                .bind(&pool.base_token_id)
                .bind(&pool.quote_token_id)
                .bind(pool.reserve_usd.map(|d| d.to_string()))
                .bind(pool.created_at.as_ref().map(encode_dt))
                .bind(encode_dt(&pool.last_updated))
                .execute(&mut *tx)
                .await
                .map_err(HarvestError::from_sqlx)?;
            }
            tx.commit().await.map_err(HarvestError::from_sqlx)?;
            Ok(pools.len() as u64)
        })
        .await
    }

    /// Insert a pool row carrying only identity, if none exists. Used when
    /// a watchlist entry references a pool the harvester has not seen.
    pub async fn ensure_minimal_pool(&self, pool_id: &str, address: &str) -> Result<()> {
        self.guarded_write(|| async {
            sqlx::query(
                "INSERT INTO pools (id, address, last_updated) VALUES ($1, $2, $3)
                 ON CONFLICT (id) DO NOTHING",
            )
            .bind(pool_id)
            .bind(address)
            .bind(encode_dt(&Utc::now()))
            .execute(&self.pool)
            .await
            .map_err(HarvestError::from_sqlx)?;
            Ok(())
        })
        .await
    }

    // === Queries ===

    pub async fn get_pool(&self, pool_id: &str) -> Result<Option<Pool>> {
        let row = sqlx::query(
            "SELECT id, address, name, dex_id, base_token_id, quote_token_id, reserve_usd, created_at, last_updated
             FROM pools WHERE id = $1",
        )
        .bind(pool_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(HarvestError::from_sqlx)?;
        row.map(|r| pool_from_row(&r)).transpose()
    }

    pub async fn get_token(&self, token_id: &str) -> Result<Option<Token>> {
        let row = sqlx::query(
            "SELECT id, address, name, symbol, decimals, network, price_usd, last_updated
             FROM tokens WHERE id = $1",
        )
        .bind(token_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(HarvestError::from_sqlx)?;
        row.map(|r| token_from_row(&r)).transpose()
    }

    pub async fn count_pools(&self) -> Result<i64> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM pools")
            .fetch_one(&self.pool)
            .await
            .map_err(HarvestError::from_sqlx)?;
        row.try_get("n").map_err(HarvestError::from_sqlx)
    }

    pub async fn list_dexes(&self, network: &str) -> Result<Vec<Dex>> {
        let rows = sqlx::query("SELECT id, name, network_id FROM dexes WHERE network_id = $1 ORDER BY id")
            .bind(network)
            .fetch_all(&self.pool)
            .await
            .map_err(HarvestError::from_sqlx)?;
        rows.iter()
            .map(|r| {
                Ok(Dex {
                    id: r.try_get("id").map_err(HarvestError::from_sqlx)?,
                    name: r.try_get("name").map_err(HarvestError::from_sqlx)?,
                    network_id: r.try_get("network_id").map_err(HarvestError::from_sqlx)?,
                })
            })
            .collect()
    }

    /// Candles for `(pool, timeframe)` with `start <= timestamp_unix <= end`,
    /// sorted ascending.
    pub async fn candles_in_range(
        &self,
        pool_id: &str,
        timeframe: Timeframe,
        start_unix: i64,
        end_unix: i64,
    ) -> Result<Vec<OhlcvCandle>> {
        let rows = sqlx::query(
            "SELECT pool_id, timeframe, timestamp_unix, open, high, low, close, volume_usd
             FROM ohlcv_candles
             WHERE pool_id = $1 AND timeframe = $2 AND timestamp_unix >= $3 AND timestamp_unix <= $4
             ORDER BY timestamp_unix ASC",
        )
        .bind(pool_id)
        .bind(timeframe.as_str())
        .bind(start_unix)
        .bind(end_unix)
        .fetch_all(&self.pool)
        .await
        .map_err(HarvestError::from_sqlx)?;
        rows.iter().map(candle_from_row).collect()
    }

    /// Enumerate missing grid intervals for `(pool, timeframe)` over
    /// `[start, end)`. Returned pairs are `(gap_start, gap_end)` with the
    /// end exclusive, each aligned to the timeframe grid.
    pub async fn find_candle_gaps(
        &self,
        pool_id: &str,
        timeframe: Timeframe,
        start_unix: i64,
        end_unix: i64,
    ) -> Result<Vec<(i64, i64)>> {
        let rows = sqlx::query(
            "SELECT timestamp_unix FROM ohlcv_candles
             WHERE pool_id = $1 AND timeframe = $2 AND timestamp_unix >= $3 AND timestamp_unix < $4
             ORDER BY timestamp_unix ASC",
        )
        .bind(pool_id)
        .bind(timeframe.as_str())
        .bind(start_unix)
        .bind(end_unix)
        .fetch_all(&self.pool)
        .await
        .map_err(HarvestError::from_sqlx)?;
        let existing: Vec<i64> = rows
            .iter()
            .map(|r| r.try_get::<i64, _>("timestamp_unix").map_err(HarvestError::from_sqlx))
            .collect::<Result<_>>()?;
        Ok(compute_gaps(&existing, timeframe, start_unix, end_unix))
    }

    /// Trades for a pool within `[start, end]`, sorted ascending by block
    /// timestamp.
    pub async fn trades_in_range(
        &self,
        pool_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Trade>> {
        let rows = sqlx::query(
            "SELECT id, pool_id, block_number, tx_hash, from_token_amount, to_token_amount,
                    price_usd, volume_usd, side, block_timestamp
             FROM trades
             WHERE pool_id = $1 AND block_timestamp >= $2 AND block_timestamp <= $3
             ORDER BY block_timestamp ASC",
        )
        .bind(pool_id)
        .bind(encode_dt(&start))
        .bind(encode_dt(&end))
        .fetch_all(&self.pool)
        .await
        .map_err(HarvestError::from_sqlx)?;
        rows.iter().map(trade_from_row).collect()
    }

    // === Watchlist ===

    /// Add an entry if the pool is not already tracked. Returns whether a
    /// row was inserted; an existing row is left untouched.
    pub async fn add_watchlist_entry(&self, entry: &WatchlistEntry) -> Result<bool> {
        self.guarded_write(|| async {
            let result = sqlx::query(
                "INSERT INTO watchlist (pool_id, token_symbol, token_name, network_address, is_active, created_at, updated_at, metadata)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                 ON CONFLICT (pool_id) DO NOTHING",
            )
            .bind(&entry.pool_id)
            .bind(&entry.token_symbol)
            .bind(&entry.token_name)
            .bind(&entry.network_address)
            .bind(entry.is_active)
            .bind(encode_dt(&entry.created_at))
            .bind(encode_dt(&entry.updated_at))
            .bind(entry.metadata.to_string())
            .execute(&self.pool)
            .await
            .map_err(HarvestError::from_sqlx)?;
            Ok(result.rows_affected() > 0)
        })
        .await
    }

    pub async fn set_watchlist_active(&self, pool_id: &str, is_active: bool) -> Result<()> {
        self.guarded_write(|| async {
            sqlx::query("UPDATE watchlist SET is_active = $1, updated_at = $2 WHERE pool_id = $3")
                .bind(is_active)
                .bind(encode_dt(&Utc::now()))
                .bind(pool_id)
                .execute(&self.pool)
                .await
                .map_err(HarvestError::from_sqlx)?;
            Ok(())
        })
        .await
    }

    pub async fn get_watchlist_entry(&self, pool_id: &str) -> Result<Option<WatchlistEntry>> {
        let row = sqlx::query(
            "SELECT pool_id, token_symbol, token_name, network_address, is_active, created_at, updated_at, metadata
             FROM watchlist WHERE pool_id = $1",
        )
        .bind(pool_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(HarvestError::from_sqlx)?;
        row.map(|r| watchlist_from_row(&r)).transpose()
    }

    pub async fn active_watchlist(&self) -> Result<Vec<WatchlistEntry>> {
        let rows = sqlx::query(
            "SELECT pool_id, token_symbol, token_name, network_address, is_active, created_at, updated_at, metadata
             FROM watchlist WHERE is_active = $1 ORDER BY pool_id",
        )
        .bind(true)
        .fetch_all(&self.pool)
        .await
        .map_err(HarvestError::from_sqlx)?;
        rows.iter().map(watchlist_from_row).collect()
    }

    pub async fn all_watchlist(&self) -> Result<Vec<WatchlistEntry>> {
        let rows = sqlx::query(
            "SELECT pool_id, token_symbol, token_name, network_address, is_active, created_at, updated_at, metadata
             FROM watchlist ORDER BY pool_id",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(HarvestError::from_sqlx)?;
        rows.iter().map(watchlist_from_row).collect()
    }

    // === Collector metadata ===

    /// Record the start of a collection pass: `run_count` increments and
    /// `last_run` takes the newest value (last-wins).
    pub async fn record_run_start(&self, collector_key: &str, at: DateTime<Utc>) -> Result<()> {
        self.guarded_write(|| async {
            sqlx::query(
                "INSERT INTO collector_metadata (collector_key, last_run, run_count, error_count, metadata)
                 VALUES ($1, $2, 1, 0, '{}')
                 ON CONFLICT (collector_key) DO UPDATE SET
                    run_count = collector_metadata.run_count + 1,
                    last_run = excluded.last_run",
            )
            .bind(collector_key)
            .bind(encode_dt(&at))
            .execute(&self.pool)
            .await
            .map_err(HarvestError::from_sqlx)?;
            Ok(())
        })
        .await
    }

    pub async fn record_run_success(&self, collector_key: &str, at: DateTime<Utc>) -> Result<()> {
        self.guarded_write(|| async {
            sqlx::query("UPDATE collector_metadata SET last_success = $1 WHERE collector_key = $2")
                .bind(encode_dt(&at))
                .bind(collector_key)
                .execute(&self.pool)
                .await
                .map_err(HarvestError::from_sqlx)?;
            Ok(())
        })
        .await
    }

    pub async fn record_run_error(&self, collector_key: &str, message: &str) -> Result<()> {
        self.guarded_write(|| async {
            sqlx::query(
                "UPDATE collector_metadata
                 SET error_count = error_count + 1, last_error = $1
                 WHERE collector_key = $2",
            )
            .bind(message)
            .bind(collector_key)
            .execute(&self.pool)
            .await
            .map_err(HarvestError::from_sqlx)?;
            Ok(())
        })
        .await
    }

    pub async fn get_collector_metadata(&self, collector_key: &str) -> Result<CollectorMetadata> {
        let row = sqlx::query(
            "SELECT collector_key, last_run, last_success, run_count, error_count, last_error, metadata
             FROM collector_metadata WHERE collector_key = $1",
        )
        .bind(collector_key)
        .fetch_optional(&self.pool)
        .await
        .map_err(HarvestError::from_sqlx)?;
        match row {
            Some(r) => metadata_from_row(&r),
            None => Ok(CollectorMetadata::empty(collector_key)),
        }
    }

    // === New-pool history ===

    /// Most recent snapshots for a pool in chronological order.
    pub async fn snapshots_for_pool(&self, pool_id: &str, limit: u32) -> Result<Vec<NewPoolSnapshot>> {
        let rows = sqlx::query(
            "SELECT pool_id, collected_at, open, high, low, close, price_usd, volume_h24_usd,
                    reserve_usd, buys_h24, sells_h24, signal_score, volume_trend, liquidity_trend,
                    pool_created_at
             FROM new_pool_history WHERE pool_id = $1
             ORDER BY collected_at DESC LIMIT $2",
        )
        .bind(pool_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(HarvestError::from_sqlx)?;
        let mut snapshots: Vec<NewPoolSnapshot> =
            rows.iter().map(snapshot_from_row).collect::<Result<_>>()?;
        snapshots.reverse();
        Ok(snapshots)
    }

    // === Alerts ===

    pub async fn insert_alert(&self, alert: &SystemAlert) -> Result<()> {
        self.guarded_write(|| async {
            sqlx::query(
                "INSERT INTO system_alerts (id, level, collector_key, message, timestamp, acknowledged, resolved, metadata)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
            )
            .bind(alert.id.to_string())
            .bind(alert.level.as_str())
            .bind(&alert.collector_key)
            .bind(&alert.message)
            .bind(encode_dt(&alert.timestamp))
            .bind(alert.acknowledged)
            .bind(alert.resolved)
            .bind(alert.metadata.to_string())
            .execute(&self.pool)
            .await
            .map_err(HarvestError::from_sqlx)?;
            Ok(())
        })
        .await
    }

    pub async fn unresolved_alerts(&self) -> Result<Vec<SystemAlert>> {
        let rows = sqlx::query(
            "SELECT id, level, collector_key, message, timestamp, acknowledged, resolved, metadata
             FROM system_alerts WHERE resolved = $1 ORDER BY timestamp ASC",
        )
        .bind(false)
        .fetch_all(&self.pool)
        .await
        .map_err(HarvestError::from_sqlx)?;
        rows.iter().map(alert_from_row).collect()
    }

    pub async fn acknowledge_alert(&self, id: Uuid) -> Result<()> {
        self.guarded_write(|| async {
            sqlx::query("UPDATE system_alerts SET acknowledged = $1 WHERE id = $2")
                .bind(true)
                .bind(id.to_string())
                .execute(&self.pool)
                .await
                .map_err(HarvestError::from_sqlx)?;
            Ok(())
        })
        .await
    }

    pub async fn resolve_alert(&self, id: Uuid) -> Result<()> {
        self.guarded_write(|| async {
            sqlx::query("UPDATE system_alerts SET resolved = $1 WHERE id = $2")
                .bind(true)
                .bind(id.to_string())
                .execute(&self.pool)
                .await
                .map_err(HarvestError::from_sqlx)?;
            Ok(())
        })
        .await
    }
}

// === Schema ===

async fn initialize_schema(pool: &AnyPool) -> Result<()> {
    let mut tx = pool.begin().await.map_err(HarvestError::from_sqlx)?;

    let statements = [
        "CREATE TABLE IF NOT EXISTS dexes (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            network_id TEXT NOT NULL
        )",
        "CREATE TABLE IF NOT EXISTS tokens (
            id TEXT PRIMARY KEY,
            address TEXT NOT NULL,
            name TEXT,
            symbol TEXT,
            decimals BIGINT,
            network TEXT NOT NULL,
            price_usd TEXT,
            last_updated TEXT NOT NULL
        )",
        "CREATE TABLE IF NOT EXISTS pools (
            id TEXT PRIMARY KEY,
            address TEXT NOT NULL,
            name TEXT,
            dex_id TEXT,
            base_token_id TEXT,
            quote_token_id TEXT,
            reserve_usd TEXT,
            created_at TEXT,
            last_updated TEXT NOT NULL
        )",
        "CREATE TABLE IF NOT EXISTS ohlcv_candles (
            pool_id TEXT NOT NULL,
            timeframe TEXT NOT NULL,
            timestamp_unix BIGINT NOT NULL,
            open TEXT NOT NULL,
            high TEXT NOT NULL,
            low TEXT NOT NULL,
            close TEXT NOT NULL,
            volume_usd TEXT NOT NULL,
            datetime TEXT NOT NULL,
            PRIMARY KEY (pool_id, timeframe, timestamp_unix)
        )",
        "CREATE TABLE IF NOT EXISTS trades (
            id TEXT PRIMARY KEY,
            pool_id TEXT NOT NULL,
            block_number BIGINT NOT NULL,
            tx_hash TEXT NOT NULL,
            from_token_amount TEXT NOT NULL,
            to_token_amount TEXT NOT NULL,
            price_usd TEXT NOT NULL,
            volume_usd TEXT NOT NULL,
            side TEXT NOT NULL,
            block_timestamp TEXT NOT NULL
        )",
        "CREATE INDEX IF NOT EXISTS idx_trades_pool_ts ON trades (pool_id, block_timestamp)",
        "CREATE TABLE IF NOT EXISTS watchlist (
            pool_id TEXT PRIMARY KEY,
            token_symbol TEXT,
            token_name TEXT,
            network_address TEXT,
            is_active INTEGER NOT NULL,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            metadata TEXT NOT NULL
        )",
        "CREATE TABLE IF NOT EXISTS new_pool_history (
            pool_id TEXT NOT NULL,
            collected_at TEXT NOT NULL,
            open TEXT,
            high TEXT,
            low TEXT,
            close TEXT,
            price_usd TEXT,
            volume_h24_usd TEXT,
            reserve_usd TEXT,
            buys_h24 BIGINT,
            sells_h24 BIGINT,
            signal_score DOUBLE PRECISION,
            volume_trend TEXT,
            liquidity_trend TEXT,
            pool_created_at TEXT,
            PRIMARY KEY (pool_id, collected_at)
        )",
        "CREATE TABLE IF NOT EXISTS collector_metadata (
            collector_key TEXT PRIMARY KEY,
            last_run TEXT,
            last_success TEXT,
            run_count BIGINT NOT NULL DEFAULT 0,
            error_count BIGINT NOT NULL DEFAULT 0,
            last_error TEXT,
            metadata TEXT NOT NULL DEFAULT '{}'
        )",
        "CREATE TABLE IF NOT EXISTS system_alerts (
            id TEXT PRIMARY KEY,
            level TEXT NOT NULL,
            collector_key TEXT,
            message TEXT NOT NULL,
            timestamp TEXT NOT NULL,
            acknowledged INTEGER NOT NULL,
            resolved INTEGER NOT NULL,
            metadata TEXT NOT NULL
        )",
    ];

    for statement in statements {
        sqlx::query(statement)
            .execute(&mut *tx)
            .await
            .map_err(HarvestError::from_sqlx)?;
    }

    tx.commit().await.map_err(HarvestError::from_sqlx)?;
    Ok(())
}

// === Batch write primitives (shared with the write queue) ===

pub(crate) async fn apply_candles(
    tx: &mut sqlx::Transaction<'_, sqlx::Any>,
    candles: &[OhlcvCandle],
) -> Result<InsertStats> {
    let mut stats = InsertStats::default();
    for candle in candles {
        let result = sqlx::query(
            "INSERT INTO ohlcv_candles (pool_id, timeframe, timestamp_unix, open, high, low, close, volume_usd, datetime)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
             ON CONFLICT (pool_id, timeframe, timestamp_unix) DO NOTHING",
        )
        .bind(&candle.pool_id)
        .bind(candle.timeframe.as_str())
        .bind(candle.timestamp_unix)
        .bind(candle.open.to_string())
        .bind(candle.high.to_string())
        .bind(candle.low.to_string())
        .bind(candle.close.to_string())
        .bind(candle.volume_usd.to_string())
        .bind(encode_dt(&candle.datetime))
        .execute(&mut **tx)
        .await
        .map_err(HarvestError::from_sqlx)?;
        if result.rows_affected() > 0 {
            stats.inserted += 1;
        } else {
            stats.duplicates += 1;
        }
    }
    Ok(stats)
}

pub(crate) async fn apply_trades(
    tx: &mut sqlx::Transaction<'_, sqlx::Any>,
    trades: &[Trade],
) -> Result<InsertStats> {
    let mut stats = InsertStats::default();
    for trade in trades {
        let result = sqlx::query(
            "INSERT INTO trades (id, pool_id, block_number, tx_hash, from_token_amount, to_token_amount, price_usd, volume_usd, side, block_timestamp)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
             ON CONFLICT (id) DO NOTHING",
        )
        .bind(&trade.id)
        .bind(&trade.pool_id)
        .bind(trade.block_number)
        .bind(&trade.tx_hash)
        .bind(trade.from_token_amount.to_string())
        .bind(trade.to_token_amount.to_string())
        .bind(trade.price_usd.to_string())
        .bind(trade.volume_usd.to_string())
        .bind(trade.side.as_str())
        .bind(encode_dt(&trade.block_timestamp))
        .execute(&mut **tx)
        .await
        .map_err(HarvestError::from_sqlx)?;
        if result.rows_affected() > 0 {
            stats.inserted += 1;
        } else {
            stats.duplicates += 1;
        }
    }
    Ok(stats)
}

pub(crate) async fn apply_snapshot(
    tx: &mut sqlx::Transaction<'_, sqlx::Any>,
    snapshot: &NewPoolSnapshot,
) -> Result<InsertStats> {
    sqlx::query(
        "INSERT INTO new_pool_history (pool_id, collected_at, open, high, low, close, price_usd, volume_h24_usd, reserve_usd, buys_h24, sells_h24, signal_score, volume_trend, liquidity_trend, pool_created_at)
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
         ON CONFLICT (pool_id, collected_at) DO NOTHING",
    )
    .bind(&snapshot.pool_id)
    .bind(encode_dt(&snapshot.collected_at))
    .bind(snapshot.open.map(|d| d.to_string()))
    .bind(snapshot.high.map(|d| d.to_string()))
    .bind(snapshot.low.map(|d| d.to_string()))
    .bind(snapshot.close.map(|d| d.to_string()))
    .bind(snapshot.price_usd.map(|d| d.to_string()))
    .bind(snapshot.volume_h24_usd.map(|d| d.to_string()))
    .bind(snapshot.reserve_usd.map(|d| d.to_string()))
    .bind(snapshot.buys_h24)
    .bind(snapshot.sells_h24)
    .bind(snapshot.signal_score)
    .bind(&snapshot.volume_trend)
    .bind(&snapshot.liquidity_trend)
    .bind(snapshot.pool_created_at.as_ref().map(encode_dt))
    .execute(&mut **tx)
    .await
    .map_err(HarvestError::from_sqlx)?;
    Ok(InsertStats {
        inserted: 1,
        duplicates: 0,
    })
}

// === Gap enumeration ===

/// Enumerate missing grid intervals over `[start, end)` given the sorted
/// timestamps already present. Pure so both backends share one
/// implementation.
pub fn compute_gaps(
    existing: &[i64],
    timeframe: Timeframe,
    start_unix: i64,
    end_unix: i64,
) -> Vec<(i64, i64)> {
    let period = timeframe.period_secs();
    let mut grid_start = timeframe.align(start_unix);
    if grid_start < start_unix {
        grid_start += period;
    }

    let mut gaps: Vec<(i64, i64)> = Vec::new();
    let mut idx = 0;
    let mut ts = grid_start;
    while ts < end_unix {
        while idx < existing.len() && existing[idx] < ts {
            idx += 1;
        }
        let present = idx < existing.len() && existing[idx] == ts;
        if !present {
            match gaps.last_mut() {
                // Extend a run of consecutive missing points.
                Some((_, gap_end)) if *gap_end == ts => *gap_end = ts + period,
                _ => gaps.push((ts, ts + period)),
            }
        }
        ts += period;
    }
    gaps
}

fn is_lock_contention(error: &HarvestError) -> bool {
    matches!(
        error,
        HarvestError::DatabaseLock(_) | HarvestError::DatabaseTimeout(_)
    )
}

// === Row encoding/decoding ===

fn encode_dt(value: &DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn decode_dt(value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|e| HarvestError::Parsing(format!("bad timestamp {value}: {e}")))
}

fn decode_opt_dt(value: Option<String>) -> Result<Option<DateTime<Utc>>> {
    value.as_deref().map(decode_dt).transpose()
}

fn decode_decimal(value: &str) -> Result<Decimal> {
    Decimal::from_str(value).map_err(|e| HarvestError::Parsing(format!("bad decimal {value}: {e}")))
}

fn decode_opt_decimal(value: Option<String>) -> Result<Option<Decimal>> {
    value.as_deref().map(decode_decimal).transpose()
}

fn decode_json(value: &str) -> serde_json::Value {
    serde_json::from_str(value).unwrap_or_else(|_| serde_json::json!({}))
}

fn pool_from_row(row: &sqlx::any::AnyRow) -> Result<Pool> {
    Ok(Pool {
        id: row.try_get("id").map_err(HarvestError::from_sqlx)?,
        address: row.try_get("address").map_err(HarvestError::from_sqlx)?,
        name: row.try_get("name").map_err(HarvestError::from_sqlx)?,
        dex_id: row.try_get("dex_id").map_err(HarvestError::from_sqlx)?,
        base_token_id: row
            .try_get("base_token_id")
            .map_err(HarvestError::from_sqlx)?,
        quote_token_id: row
            .try_get("quote_token_id")
            .map_err(HarvestError::from_sqlx)?,
        reserve_usd: decode_opt_decimal(
            row.try_get("reserve_usd").map_err(HarvestError::from_sqlx)?,
        )?,
        created_at: decode_opt_dt(row.try_get("created_at").map_err(HarvestError::from_sqlx)?)?,
        last_updated: decode_dt(
            &row.try_get::<String, _>("last_updated")
                .map_err(HarvestError::from_sqlx)?,
        )?,
    })
}

fn token_from_row(row: &sqlx::any::AnyRow) -> Result<Token> {
    Ok(Token {
        id: row.try_get("id").map_err(HarvestError::from_sqlx)?,
        address: row.try_get("address").map_err(HarvestError::from_sqlx)?,
        name: row.try_get("name").map_err(HarvestError::from_sqlx)?,
        symbol: row.try_get("symbol").map_err(HarvestError::from_sqlx)?,
        decimals: row
            .try_get::<Option<i64>, _>("decimals")
            .map_err(HarvestError::from_sqlx)?
            .map(|d| d as i32),
        network: row.try_get("network").map_err(HarvestError::from_sqlx)?,
        price_usd: decode_opt_decimal(row.try_get("price_usd").map_err(HarvestError::from_sqlx)?)?,
        last_updated: decode_dt(
            &row.try_get::<String, _>("last_updated")
                .map_err(HarvestError::from_sqlx)?,
        )?,
    })
}

fn candle_from_row(row: &sqlx::any::AnyRow) -> Result<OhlcvCandle> {
    let timeframe: String = row.try_get("timeframe").map_err(HarvestError::from_sqlx)?;
    let timeframe = Timeframe::from_str(&timeframe).map_err(HarvestError::Parsing)?;
    let timestamp_unix: i64 = row
        .try_get("timestamp_unix")
        .map_err(HarvestError::from_sqlx)?;
    Ok(OhlcvCandle::new(
        row.try_get::<String, _>("pool_id")
            .map_err(HarvestError::from_sqlx)?,
        timeframe,
        timestamp_unix,
        decode_decimal(&row.try_get::<String, _>("open").map_err(HarvestError::from_sqlx)?)?,
        decode_decimal(&row.try_get::<String, _>("high").map_err(HarvestError::from_sqlx)?)?,
        decode_decimal(&row.try_get::<String, _>("low").map_err(HarvestError::from_sqlx)?)?,
        decode_decimal(&row.try_get::<String, _>("close").map_err(HarvestError::from_sqlx)?)?,
        decode_decimal(
            &row.try_get::<String, _>("volume_usd")
                .map_err(HarvestError::from_sqlx)?,
        )?,
    ))
}

fn trade_from_row(row: &sqlx::any::AnyRow) -> Result<Trade> {
    let side: String = row.try_get("side").map_err(HarvestError::from_sqlx)?;
    Ok(Trade {
        id: row.try_get("id").map_err(HarvestError::from_sqlx)?,
        pool_id: row.try_get("pool_id").map_err(HarvestError::from_sqlx)?,
        block_number: row
            .try_get("block_number")
            .map_err(HarvestError::from_sqlx)?,
        tx_hash: row.try_get("tx_hash").map_err(HarvestError::from_sqlx)?,
        from_token_amount: decode_decimal(
            &row.try_get::<String, _>("from_token_amount")
                .map_err(HarvestError::from_sqlx)?,
        )?,
        to_token_amount: decode_decimal(
            &row.try_get::<String, _>("to_token_amount")
                .map_err(HarvestError::from_sqlx)?,
        )?,
        price_usd: decode_decimal(
            &row.try_get::<String, _>("price_usd")
                .map_err(HarvestError::from_sqlx)?,
        )?,
        volume_usd: decode_decimal(
            &row.try_get::<String, _>("volume_usd")
                .map_err(HarvestError::from_sqlx)?,
        )?,
        side: TradeSide::from_str(&side).map_err(HarvestError::Parsing)?,
        block_timestamp: decode_dt(
            &row.try_get::<String, _>("block_timestamp")
                .map_err(HarvestError::from_sqlx)?,
        )?,
    })
}

fn watchlist_from_row(row: &sqlx::any::AnyRow) -> Result<WatchlistEntry> {
    Ok(WatchlistEntry {
        pool_id: row.try_get("pool_id").map_err(HarvestError::from_sqlx)?,
        token_symbol: row
            .try_get("token_symbol")
            .map_err(HarvestError::from_sqlx)?,
        token_name: row.try_get("token_name").map_err(HarvestError::from_sqlx)?,
        network_address: row
            .try_get("network_address")
            .map_err(HarvestError::from_sqlx)?,
        is_active: row.try_get::<i64, _>("is_active").map_err(HarvestError::from_sqlx)? != 0,
        created_at: decode_dt(
            &row.try_get::<String, _>("created_at")
                .map_err(HarvestError::from_sqlx)?,
        )?,
        updated_at: decode_dt(
            &row.try_get::<String, _>("updated_at")
                .map_err(HarvestError::from_sqlx)?,
        )?,
        metadata: decode_json(
            &row.try_get::<String, _>("metadata")
                .map_err(HarvestError::from_sqlx)?,
        ),
    })
}

fn metadata_from_row(row: &sqlx::any::AnyRow) -> Result<CollectorMetadata> {
    Ok(CollectorMetadata {
        collector_key: row
            .try_get("collector_key")
            .map_err(HarvestError::from_sqlx)?,
        last_run: decode_opt_dt(row.try_get("last_run").map_err(HarvestError::from_sqlx)?)?,
        last_success: decode_opt_dt(row.try_get("last_success").map_err(HarvestError::from_sqlx)?)?,
        run_count: row.try_get("run_count").map_err(HarvestError::from_sqlx)?,
        error_count: row.try_get("error_count").map_err(HarvestError::from_sqlx)?,
        last_error: row.try_get("last_error").map_err(HarvestError::from_sqlx)?,
        metadata: decode_json(
            &row.try_get::<String, _>("metadata")
                .map_err(HarvestError::from_sqlx)?,
        ),
    })
}

fn snapshot_from_row(row: &sqlx::any::AnyRow) -> Result<NewPoolSnapshot> {
    Ok(NewPoolSnapshot {
        pool_id: row.try_get("pool_id").map_err(HarvestError::from_sqlx)?,
        collected_at: decode_dt(
            &row.try_get::<String, _>("collected_at")
                .map_err(HarvestError::from_sqlx)?,
        )?,
        open: decode_opt_decimal(row.try_get("open").map_err(HarvestError::from_sqlx)?)?,
        high: decode_opt_decimal(row.try_get("high").map_err(HarvestError::from_sqlx)?)?,
        low: decode_opt_decimal(row.try_get("low").map_err(HarvestError::from_sqlx)?)?,
        close: decode_opt_decimal(row.try_get("close").map_err(HarvestError::from_sqlx)?)?,
        price_usd: decode_opt_decimal(row.try_get("price_usd").map_err(HarvestError::from_sqlx)?)?,
        volume_h24_usd: decode_opt_decimal(
            row.try_get("volume_h24_usd")
                .map_err(HarvestError::from_sqlx)?,
        )?,
        reserve_usd: decode_opt_decimal(
            row.try_get("reserve_usd").map_err(HarvestError::from_sqlx)?,
        )?,
        buys_h24: row.try_get("buys_h24").map_err(HarvestError::from_sqlx)?,
        sells_h24: row.try_get("sells_h24").map_err(HarvestError::from_sqlx)?,
        signal_score: row
            .try_get("signal_score")
            .map_err(HarvestError::from_sqlx)?,
        volume_trend: row
            .try_get("volume_trend")
            .map_err(HarvestError::from_sqlx)?,
        liquidity_trend: row
            .try_get("liquidity_trend")
            .map_err(HarvestError::from_sqlx)?,
        pool_created_at: decode_opt_dt(
            row.try_get("pool_created_at")
                .map_err(HarvestError::from_sqlx)?,
        )?,
    })
}

fn alert_from_row(row: &sqlx::any::AnyRow) -> Result<SystemAlert> {
    let id: String = row.try_get("id").map_err(HarvestError::from_sqlx)?;
    let level: String = row.try_get("level").map_err(HarvestError::from_sqlx)?;
    Ok(SystemAlert {
        id: Uuid::from_str(&id).map_err(|e| HarvestError::Parsing(format!("bad alert id: {e}")))?,
        level: AlertLevel::from_str(&level).map_err(HarvestError::Parsing)?,
        collector_key: row
            .try_get("collector_key")
            .map_err(HarvestError::from_sqlx)?,
        message: row.try_get("message").map_err(HarvestError::from_sqlx)?,
        timestamp: decode_dt(
            &row.try_get::<String, _>("timestamp")
                .map_err(HarvestError::from_sqlx)?,
        )?,
        acknowledged: row
            .try_get::<i64, _>("acknowledged")
            .map_err(HarvestError::from_sqlx)?
            != 0,
        resolved: row.try_get::<i64, _>("resolved").map_err(HarvestError::from_sqlx)? != 0,
        metadata: decode_json(
            &row.try_get::<String, _>("metadata")
                .map_err(HarvestError::from_sqlx)?,
        ),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const H: i64 = 3_600;

    #[test]
    fn gaps_on_empty_history_cover_full_window() {
        let gaps = compute_gaps(&[], Timeframe::H1, 0, 4 * H);
        assert_eq!(gaps, vec![(0, 4 * H)]);
    }

    #[test]
    fn gaps_merge_consecutive_missing_points() {
        // Present: 0h and 3h; missing 1h and 2h form one gap.
        let existing = vec![0, 3 * H];
        let gaps = compute_gaps(&existing, Timeframe::H1, 0, 4 * H);
        assert_eq!(gaps, vec![(H, 3 * H)]);
    }

    #[test]
    fn gaps_detect_multiple_runs() {
        let existing = vec![H, 4 * H];
        let gaps = compute_gaps(&existing, Timeframe::H1, 0, 6 * H);
        assert_eq!(gaps, vec![(0, H), (2 * H, 4 * H), (5 * H, 6 * H)]);
    }

    #[test]
    fn full_coverage_yields_no_gaps() {
        let existing: Vec<i64> = (0..48).map(|i| i * H).collect();
        assert!(compute_gaps(&existing, Timeframe::H1, 0, 48 * H).is_empty());
    }

    #[test]
    fn unaligned_window_start_rounds_up_to_grid() {
        // First grid point at or after H+1 is 2H; only it is considered.
        let gaps = compute_gaps(&[], Timeframe::H1, H + 1, 3 * H);
        assert_eq!(gaps, vec![(2 * H, 3 * H)]);
    }

    #[test]
    fn scenario_shaped_gap_window() {
        // Coverage over [T-48h, T-24h) and [T-12h, T); one gap in between.
        let t = 1_000_000 * H;
        let mut existing: Vec<i64> = Vec::new();
        for i in 25..=48 {
            existing.push(t - i * H);
        }
        for i in 1..=12 {
            existing.push(t - i * H);
        }
        existing.sort_unstable();
        let gaps = compute_gaps(&existing, Timeframe::H1, t - 48 * H, t);
        assert_eq!(gaps, vec![(t - 24 * H, t - 12 * H)]);
    }

    #[test]
    fn datetime_round_trips() {
        let now = Utc::now();
        let decoded = decode_dt(&encode_dt(&now)).unwrap();
        assert_eq!(encode_dt(&now), encode_dt(&decoded));
    }
}
