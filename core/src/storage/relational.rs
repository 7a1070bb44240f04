//! PostgreSQL-backed storage, grounded on the Go original's `psql` driver:
//! one table, one row per push, keyed by `"{kind}///{name}"` so a single
//! TEXT column carries both the metric's kind and its name (ported from
//! `internal/drivers/psql/convert.go`'s `METRICSEPARATOR`). Every operation
//! that talks to Postgres is wrapped in the same 3-attempt retry schedule as
//! [`super::backup::BackupFile`], but only retries connection-exception class
//! errors (SQLSTATE `08xxx`) — any other error fails immediately, matching
//! `internal/drivers/psql/retry.go`.

use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};

use crate::errors::StorageError;
use crate::model::{Metric, KIND_COUNTER, KIND_GAUGE};

use super::retry::retry;

const METRIC_SEPARATOR: &str = "///";

pub struct RelationalBackend {
    pool: PgPool,
}

fn encode_key(kind: &str, name: &str) -> String {
    format!("{kind}{METRIC_SEPARATOR}{name}")
}

fn decode_key(key: &str) -> Result<(String, String), StorageError> {
    key.split_once(METRIC_SEPARATOR)
        .map(|(kind, name)| (kind.to_string(), name.to_string()))
        .ok_or_else(|| StorageError::InvalidData(format!("malformed metric key '{key}'")))
}

fn is_connection_exception(error: &sqlx::Error) -> bool {
    match error {
        sqlx::Error::Database(db_error) => db_error
            .code()
            .map(|code| code.starts_with("08"))
            .unwrap_or(false),
        sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed => true,
        _ => false,
    }
}

impl RelationalBackend {
    pub async fn connect(dsn: &str) -> Result<Self, StorageError> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(dsn)
            .await
            .map_err(|err| StorageError::Database(err.to_string()))?;
        Ok(Self { pool })
    }

    pub async fn create_metrics_table(&self) -> Result<(), StorageError> {
        self.retrying(|pool| async move {
            sqlx::query(
                "CREATE TABLE IF NOT EXISTS metrics (metric TEXT PRIMARY KEY, value DOUBLE PRECISION NOT NULL)",
            )
            .execute(pool)
            .await
        })
        .await
        .map(|_| ())
    }

    pub async fn ping(&self) -> Result<(), StorageError> {
        self.retrying(|pool| async move { sqlx::query("SELECT 1").execute(pool).await })
            .await
            .map(|_| ())
    }

    pub async fn push_replace(&self, kind: &str, name: &str, value: f64) -> Result<(), StorageError> {
        let key = encode_key(kind, name);
        self.retrying(move |pool| {
            let key = key.clone();
            async move {
                sqlx::query(
                    "INSERT INTO metrics (metric, value) VALUES ($1, $2)
                     ON CONFLICT (metric) DO UPDATE SET value = EXCLUDED.value",
                )
                .bind(key)
                .bind(value)
                .execute(pool)
                .await
            }
        })
        .await
        .map(|_| ())
    }

    pub async fn push_add(&self, kind: &str, name: &str, delta: f64) -> Result<(), StorageError> {
        let key = encode_key(kind, name);
        self.retrying(move |pool| {
            let key = key.clone();
            async move {
                sqlx::query(
                    "INSERT INTO metrics (metric, value) VALUES ($1, $2)
                     ON CONFLICT (metric) DO UPDATE SET value = metrics.value + EXCLUDED.value",
                )
                .bind(key)
                .bind(delta)
                .execute(pool)
                .await
            }
        })
        .await
        .map(|_| ())
    }

    pub async fn get_one_value(&self, kind: &str, name: &str) -> Result<f64, StorageError> {
        let key = encode_key(kind, name);
        let row = self
            .retrying(move |pool| {
                let key = key.clone();
                async move {
                    sqlx::query("SELECT value FROM metrics WHERE metric = $1")
                        .bind(key)
                        .fetch_optional(pool)
                        .await
                }
            })
            .await?;
        let row = row.ok_or(StorageError::NotFound)?;
        Ok(row.try_get::<f64, _>("value").map_err(|err| StorageError::Database(err.to_string()))?)
    }

    /// Counters have no running-total column; every push is a new row for a
    /// rolled-up key, so summing is delegated to `get_one_value`'s
    /// `push_add`-maintained total. `get_array_values` exists for parity
    /// with the original adapter's interface, returning the single
    /// accumulated value as a one-element slice when present.
    pub async fn get_array_values(&self, kind: &str, name: &str) -> Result<Vec<f64>, StorageError> {
        match self.get_one_value(kind, name).await {
            Ok(value) => Ok(vec![value]),
            Err(StorageError::NotFound) => Ok(Vec::new()),
            Err(other) => Err(other),
        }
    }

    pub async fn list(&self) -> Result<Vec<(String, String, f64)>, StorageError> {
        let rows = self
            .retrying(|pool| async move {
                sqlx::query("SELECT metric, value FROM metrics ORDER BY metric").fetch_all(pool).await
            })
            .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let key: String = row.try_get("metric").map_err(|err| StorageError::Database(err.to_string()))?;
            let value: f64 = row.try_get("value").map_err(|err| StorageError::Database(err.to_string()))?;
            let (kind, name) = decode_key(&key)?;
            if kind != KIND_GAUGE && kind != KIND_COUNTER {
                return Err(StorageError::WrongType);
            }
            out.push((kind, name, value));
        }
        Ok(out)
    }

    async fn retrying<T, F, Fut>(&self, mut op: F) -> Result<T, StorageError>
    where
        F: FnMut(&PgPool) -> Fut,
        Fut: std::future::Future<Output = Result<T, sqlx::Error>>,
    {
        let pool = &self.pool;
        retry(is_connection_exception, || op(pool))
            .await
            .map_err(|err| StorageError::Database(err.to_string()))
    }
}
