use super::log::ReplayStream;
use super::types::{Event, EventType, PersistenceError, PostgresParams, Result, TABLE};
use super::writer::{AsyncWriter, EventSink};
use futures_util::TryStreamExt;
use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions, PgRow};
use sqlx::{Connection, Row};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info};

const MAX_CONNECTIONS: u32 = 4;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Transaction log stored as rows of a single append-only table.
///
/// Sequence numbers come from the table's `BIGSERIAL` primary key, so several
/// instances writing to the same database share one total order.
pub struct PostgresTransactionLog {
    pool: PgPool,
    last_sequence: Arc<AtomicU64>,
    writer: AsyncWriter,
}

impl PostgresTransactionLog {
    /// Connect, verify liveness and make sure the table exists
    pub async fn open(params: &PostgresParams, queue_capacity: usize) -> Result<Self> {
        let options = PgConnectOptions::new()
            .host(&params.host)
            .database(&params.db_name)
            .username(&params.user)
            .password(&params.password);

        let pool = PgPoolOptions::new()
            .max_connections(MAX_CONNECTIONS)
            .acquire_timeout(CONNECT_TIMEOUT)
            .connect_with(options)
            .await
            .map_err(|e| PersistenceError::Connectivity(format!("failed to open db: {}", e)))?;

        let mut conn = pool.acquire().await.map_err(|e| {
            PersistenceError::Connectivity(format!("failed to open db connection: {}", e))
        })?;
        conn.ping()
            .await
            .map_err(|e| PersistenceError::Connectivity(format!("ping failed: {}", e)))?;
        drop(conn);

        let exists = Self::verify_table_exists(&pool).await.map_err(|e| {
            PersistenceError::Schema(format!("failed to verify table exists: {}", e))
        })?;
        if !exists {
            Self::create_table(&pool)
                .await
                .map_err(|e| PersistenceError::Schema(format!("failed to create table: {}", e)))?;
            info!("Created transaction log table {}", TABLE);
        }

        info!(
            "Transaction log table {} ready on {}/{}",
            TABLE, params.host, params.db_name
        );

        Ok(Self {
            pool,
            last_sequence: Arc::new(AtomicU64::new(0)),
            writer: AsyncWriter::new(queue_capacity),
        })
    }

    async fn verify_table_exists(pool: &PgPool) -> std::result::Result<bool, sqlx::Error> {
        let found: Option<String> = sqlx::query_scalar("SELECT to_regclass($1)::text")
            .bind(format!("public.{}", TABLE))
            .fetch_one(pool)
            .await?;

        Ok(found.is_some())
    }

    async fn create_table(pool: &PgPool) -> std::result::Result<(), sqlx::Error> {
        // IF NOT EXISTS covers two instances racing past the probe
        let ddl = format!(
            "CREATE TABLE IF NOT EXISTS {} (
                sequence BIGSERIAL PRIMARY KEY,
                event_type SMALLINT NOT NULL,
                key TEXT NOT NULL,
                value TEXT
            )",
            TABLE
        );
        sqlx::query(&ddl).execute(pool).await?;

        Ok(())
    }

    /// Last sequence this instance saw; the database remains authoritative
    pub fn last_sequence(&self) -> u64 {
        self.last_sequence.load(Ordering::SeqCst)
    }

    pub(crate) fn writer(&self) -> &AsyncWriter {
        &self.writer
    }

    pub fn start(&self) -> Result<()> {
        info!("Starting postgres log writer");
        self.writer.start(PostgresSink {
            pool: self.pool.clone(),
            insert_sql: format!(
                "INSERT INTO {} (event_type, key, value) VALUES ($1, $2, $3) RETURNING sequence",
                TABLE
            ),
            last_sequence: Arc::clone(&self.last_sequence),
        })
    }

    /// Stream rows ordered by sequence, one at a time
    pub fn replay_events(&self) -> ReplayStream {
        let (events_tx, events_rx) = mpsc::channel(1);
        let (errors_tx, errors_rx) = mpsc::channel(1);

        let pool = self.pool.clone();
        let last_sequence = Arc::clone(&self.last_sequence);

        tokio::spawn(async move {
            if let Err(e) = Self::stream_rows(&pool, &last_sequence, &events_tx).await {
                drop(events_tx);
                let _ = errors_tx.send(e).await;
            }
        });

        ReplayStream::new(events_rx, errors_rx)
    }

    async fn stream_rows(
        pool: &PgPool,
        last_sequence: &AtomicU64,
        events: &mpsc::Sender<Event>,
    ) -> Result<()> {
        let query = format!(
            "SELECT sequence, event_type, key, value FROM {} ORDER BY sequence",
            TABLE
        );
        let mut rows = sqlx::query(&query).fetch(pool);
        let mut position = 0u64;

        while let Some(row) = rows.try_next().await? {
            position += 1;
            let event = decode_row(&row, position)?;
            last_sequence.fetch_max(event.sequence(), Ordering::SeqCst);

            if events.send(event).await.is_err() {
                debug!("Replay consumer went away at row {}", position);
                return Ok(());
            }
        }

        debug!("Streamed {} rows from {}", position, TABLE);
        Ok(())
    }
}

fn decode_row(row: &PgRow, position: u64) -> Result<Event> {
    let sequence: i64 = row.try_get("sequence")?;
    let code: i16 = row.try_get("event_type")?;
    let key: String = row.try_get("key")?;
    let value: Option<String> = row.try_get("value")?;

    let sequence = u64::try_from(sequence).map_err(|_| PersistenceError::Decode {
        position,
        reason: format!("negative sequence {}", sequence),
    })?;
    let event_type = EventType::try_from(i64::from(code))?;
    if key.is_empty() {
        return Err(PersistenceError::Decode {
            position,
            reason: "empty key".to_string(),
        });
    }

    Ok(Event::persisted(
        sequence,
        event_type,
        key,
        value.unwrap_or_default(),
    ))
}

struct PostgresSink {
    pool: PgPool,
    insert_sql: String,
    last_sequence: Arc<AtomicU64>,
}

impl EventSink for PostgresSink {
    async fn append(&mut self, event: &Event) -> Result<u64> {
        let sequence: i64 = sqlx::query_scalar(&self.insert_sql)
            .bind(event.event_type().code())
            .bind(event.key())
            .bind(event.value())
            .fetch_one(&self.pool)
            .await?;

        let sequence = u64::try_from(sequence).map_err(|_| PersistenceError::Decode {
            position: 0,
            reason: format!("database assigned negative sequence {}", sequence),
        })?;
        self.last_sequence.fetch_max(sequence, Ordering::SeqCst);

        Ok(sequence)
    }

    async fn finish(&mut self) -> Result<()> {
        Ok(())
    }

    fn name(&self) -> &'static str {
        "postgres"
    }
}
