use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use sqlx::postgres::{PgPool, PgPoolOptions};
use tracing::{error, info, warn};

use crate::errors::{Error, Result};
use crate::model::{
    Device, DeviceMetric, Event, Metric, MetricValue, NewEvent, NewTelemetryRow, Rule,
    TelemetryRow,
};
use crate::store::TelemetryStore;

pub async fn make_pool(database_url: &str) -> Result<PgPool> {
    info!("Connecting to database...");
    let pool = PgPoolOptions::new()
        .max_connections(20)
        .acquire_timeout(std::time::Duration::from_secs(10))
        .connect(database_url)
        .await?;

    info!("Database connection established");
    info!("Running database migrations...");
    sqlx::migrate!("./migrations").run(&pool).await?;
    info!("Migrations completed");

    Ok(pool)
}

/// Postgres-backed [`TelemetryStore`].
///
/// Bulk insert goes through `UNNEST` arrays with
/// `ON CONFLICT (device_metric_id, ts) DO NOTHING RETURNING ...`, so
/// re-delivered rows are absorbed by the unique constraint and the caller
/// sees exactly the set of rows that won.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

/// Raw telemetry row as stored: the tagged value is split over one column
/// per kind, exactly one of which is non-null.
#[derive(sqlx::FromRow)]
struct TelemetryRecord {
    id: i64,
    device_metric_id: i64,
    ts: DateTime<Utc>,
    kind: String,
    value_numeric: Option<Decimal>,
    value_boolean: Option<bool>,
    value_text: Option<String>,
    created_at: DateTime<Utc>,
}

impl From<TelemetryRecord> for TelemetryRow {
    fn from(rec: TelemetryRecord) -> Self {
        let value = match rec.kind.as_str() {
            "numeric" => rec.value_numeric.map(MetricValue::Numeric),
            "boolean" => rec.value_boolean.map(MetricValue::Boolean),
            "string" => rec.value_text.map(MetricValue::Text),
            other => {
                warn!(telemetry_id = rec.id, kind = other, "Unknown stored value kind");
                None
            }
        };
        TelemetryRow {
            id: rec.id,
            device_metric_id: rec.device_metric_id,
            ts: rec.ts,
            value,
            created_at: rec.created_at,
        }
    }
}

#[derive(sqlx::FromRow)]
struct MetricRecord {
    id: i64,
    name: String,
    kind: String,
}

const TELEMETRY_COLUMNS: &str =
    "id, device_metric_id, ts, kind, value_numeric, value_boolean, value_text, created_at";

#[async_trait]
impl TelemetryStore for PgStore {
    async fn device_by_serial(&self, serial_id: &str) -> Result<Option<Device>> {
        let device = sqlx::query_as::<_, Device>(
            "SELECT id, serial_id, is_active, owner_id FROM devices WHERE serial_id = $1",
        )
        .bind(serial_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(device)
    }

    async fn metric_by_name(&self, name: &str) -> Result<Option<Metric>> {
        let rec = sqlx::query_as::<_, MetricRecord>(
            "SELECT id, name, kind FROM metrics WHERE lower(name) = lower($1)",
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;

        Ok(rec.and_then(|r| {
            let kind = match r.kind.parse() {
                Ok(kind) => kind,
                Err(e) => {
                    error!(metric_id = r.id, "Corrupt metric kind: {}", e);
                    return None;
                }
            };
            Some(Metric {
                id: r.id,
                name: r.name,
                kind,
            })
        }))
    }

    async fn device_metric(&self, device_id: i64, metric_id: i64) -> Result<Option<DeviceMetric>> {
        let dm = sqlx::query_as::<_, DeviceMetric>(
            "SELECT id, device_id, metric_id FROM device_metrics
             WHERE device_id = $1 AND metric_id = $2",
        )
        .bind(device_id)
        .bind(metric_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(dm)
    }

    async fn device_metric_by_id(&self, id: i64) -> Result<Option<DeviceMetric>> {
        let dm = sqlx::query_as::<_, DeviceMetric>(
            "SELECT id, device_id, metric_id FROM device_metrics WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(dm)
    }

    async fn insert_telemetry(&self, rows: &[NewTelemetryRow]) -> Result<Vec<TelemetryRow>> {
        if rows.is_empty() {
            return Ok(Vec::new());
        }

        let mut attempts = 0;
        let max_attempts = 5;

        loop {
            attempts += 1;
            match insert_telemetry_inner(&self.pool, rows).await {
                Ok(created) => return Ok(created),
                Err(e) => match &e {
                    Error::Database(db_err) => {
                        if attempts >= max_attempts || !is_transient_error(db_err) {
                            error!(
                                "Telemetry insert failed permanently after {} attempts: {}",
                                attempts, e
                            );
                            return Err(e);
                        }

                        let wait_ms = 100 * 2_u64.pow(attempts - 1).min(32);
                        warn!(
                            "Telemetry insert failed (attempt {}/{}), retrying in {}ms: {}",
                            attempts, max_attempts, wait_ms, db_err
                        );
                        crate::metrics::DB_FAILURES_TOTAL.inc();
                        tokio::time::sleep(std::time::Duration::from_millis(wait_ms)).await;
                    }
                    _ => {
                        error!("Telemetry insert failed with non-database error: {}", e);
                        return Err(e);
                    }
                },
            }
        }
    }

    async fn window(
        &self,
        device_metric_id: i64,
        end: DateTime<Utc>,
        duration: Duration,
    ) -> Result<Vec<TelemetryRow>> {
        let start = end - duration;
        let records = sqlx::query_as::<_, TelemetryRecord>(&format!(
            "SELECT {TELEMETRY_COLUMNS} FROM telemetry
             WHERE device_metric_id = $1 AND ts >= $2 AND ts <= $3
             ORDER BY ts ASC"
        ))
        .bind(device_metric_id)
        .bind(start)
        .bind(end)
        .fetch_all(&self.pool)
        .await?;

        Ok(records.into_iter().map(TelemetryRow::from).collect())
    }

    async fn active_rules(&self, device_metric_id: i64) -> Result<Vec<Rule>> {
        let rules = sqlx::query_as::<_, Rule>(
            "SELECT id, device_metric_id, name, condition, action, is_active FROM rules
             WHERE device_metric_id = $1 AND is_active",
        )
        .bind(device_metric_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rules)
    }

    async fn insert_event(&self, event: NewEvent) -> Result<Event> {
        let created = sqlx::query_as::<_, Event>(
            "INSERT INTO events (rule_id, telemetry_id, device_id, ts)
             VALUES ($1, $2, $3, $4)
             RETURNING id, rule_id, telemetry_id, device_id, ts, acknowledged",
        )
        .bind(event.rule_id)
        .bind(event.telemetry_id)
        .bind(event.device_id)
        .bind(event.ts)
        .fetch_one(&self.pool)
        .await?;
        Ok(created)
    }

    async fn acknowledge_event(&self, event_id: i64) -> Result<bool> {
        let result = sqlx::query("UPDATE events SET acknowledged = true WHERE id = $1")
            .bind(event_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

async fn insert_telemetry_inner(
    pool: &PgPool,
    rows: &[NewTelemetryRow],
) -> Result<Vec<TelemetryRow>> {
    let device_metric_ids: Vec<i64> = rows.iter().map(|r| r.device_metric_id).collect();
    let timestamps: Vec<DateTime<Utc>> = rows.iter().map(|r| r.ts).collect();
    let kinds: Vec<String> = rows.iter().map(|r| r.value.kind().to_string()).collect();
    let numerics: Vec<Option<Decimal>> = rows
        .iter()
        .map(|r| match &r.value {
            MetricValue::Numeric(d) => Some(*d),
            _ => None,
        })
        .collect();
    let booleans: Vec<Option<bool>> = rows
        .iter()
        .map(|r| match &r.value {
            MetricValue::Boolean(b) => Some(*b),
            _ => None,
        })
        .collect();
    let texts: Vec<Option<String>> = rows
        .iter()
        .map(|r| match &r.value {
            MetricValue::Text(s) => Some(s.clone()),
            _ => None,
        })
        .collect();

    let query = format!(
        r#"
        INSERT INTO telemetry (device_metric_id, ts, kind, value_numeric, value_boolean, value_text)
        SELECT * FROM UNNEST($1::bigint[], $2::timestamptz[], $3::text[], $4::numeric[], $5::boolean[], $6::text[])
        ON CONFLICT (device_metric_id, ts) DO NOTHING
        RETURNING {TELEMETRY_COLUMNS}
        "#
    );

    let created = sqlx::query_as::<_, TelemetryRecord>(&query)
        .bind(&device_metric_ids)
        .bind(&timestamps)
        .bind(&kinds)
        .bind(&numerics)
        .bind(&booleans)
        .bind(&texts)
        .fetch_all(pool)
        .await?;

    Ok(created.into_iter().map(TelemetryRow::from).collect())
}

fn is_transient_error(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) | sqlx::Error::PoolClosed => true,
        sqlx::Error::Database(db_err) => {
            // Connection-related SQLSTATE classes
            db_err.code().is_some_and(|code| {
                code == "08000" || // connection_exception
                code == "08003" || // connection_does_not_exist
                code == "08006" || // connection_failure
                code == "57P03" || // cannot_connect_now
                code == "53300" // too_many_connections
            })
        }
        _ => false,
    }
}
