use std::pin::Pin;

use async_trait::async_trait;
use futures_core::Stream;
use futures_util::{StreamExt, TryStreamExt};
use sqlx::postgres::{PgListener, PgRow};
use sqlx::{PgPool, Row};

use crate::{
    CommitNotice, CommittedEvent, EventFilter, EventMeta, Message, Result, SNAP_EVENT, StoreError,
    event::COMMIT_CHANNEL,
    store::{EventSink, Lease, LeaseRequest, PolledStream, Store},
};

const SEED_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS events (
    id BIGSERIAL PRIMARY KEY,
    name TEXT NOT NULL,
    data JSONB NOT NULL,
    stream TEXT NOT NULL,
    version BIGINT NOT NULL,
    created TIMESTAMPTZ NOT NULL DEFAULT now(),
    meta JSONB NOT NULL DEFAULT '{}'::jsonb
);
CREATE UNIQUE INDEX IF NOT EXISTS events_stream_version ON events (stream, version);
CREATE INDEX IF NOT EXISTS events_name ON events (name);
CREATE INDEX IF NOT EXISTS events_created_id ON events (created, id);
CREATE INDEX IF NOT EXISTS events_correlation ON events ((meta ->> 'correlation'));

CREATE TABLE IF NOT EXISTS streams (
    stream TEXT PRIMARY KEY,
    source TEXT,
    at BIGINT NOT NULL DEFAULT -1,
    retry INT NOT NULL DEFAULT 0,
    blocked BOOLEAN NOT NULL DEFAULT false,
    error TEXT,
    leased_at BIGINT,
    leased_by TEXT,
    leased_until TIMESTAMPTZ
);
CREATE INDEX IF NOT EXISTS streams_blocked_at ON streams (blocked, at);
"#;

const DROP_SQL: &str = r#"
DROP TABLE IF EXISTS events;
DROP TABLE IF EXISTS streams;
"#;

/// A stream of commit wake-up notices.
pub type NoticeStream = Pin<Box<dyn Stream<Item = CommitNotice> + Send>>;

/// PostgreSQL-backed production store.
///
/// Events live in an append-only table; per-stream watermark and lease state
/// lives in a second table mutated only through narrow conditional updates.
#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Creates a store over an existing connection pool.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Gets a reference to the underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Opens a LISTEN-based stream of commit notices.
    ///
    /// Advisory only: notices can be dropped on reconnect, and the drain
    /// loop must keep working on a polling interval without them.
    pub async fn listener(&self) -> Result<NoticeStream> {
        let mut listener = PgListener::connect_with(&self.pool).await?;
        listener.listen(COMMIT_CHANNEL).await?;
        let stream = listener.into_stream().filter_map(|notification| async {
            notification
                .ok()
                .and_then(|n| serde_json::from_str::<CommitNotice>(n.payload()).ok())
        });
        Ok(Box::pin(stream))
    }

    fn row_to_event(row: PgRow) -> Result<CommittedEvent> {
        let meta: EventMeta = serde_json::from_value(row.try_get("meta")?)?;
        Ok(CommittedEvent {
            id: row.try_get("id")?,
            stream: row.try_get("stream")?,
            version: row.try_get("version")?,
            name: row.try_get("name")?,
            data: row.try_get("data")?,
            created: row.try_get("created")?,
            meta,
        })
    }

    fn row_to_lease(row: &PgRow) -> Result<Lease> {
        Ok(Lease {
            stream: row.try_get("stream")?,
            by: row.try_get("leased_by")?,
            at: row.try_get("leased_at")?,
            retry: row.try_get("retry")?,
            block: false,
            error: None,
        })
    }
}

#[async_trait]
impl Store for PostgresStore {
    async fn commit(
        &self,
        stream: &str,
        messages: &[Message],
        meta: EventMeta,
        expected_version: Option<i64>,
    ) -> Result<Vec<CommittedEvent>> {
        if messages.is_empty() {
            return Err(StoreError::InvalidCommit("no messages".to_string()));
        }

        let mut tx = self.pool.begin().await?;

        let current: Option<i64> =
            sqlx::query_scalar("SELECT MAX(version) FROM events WHERE stream = $1")
                .bind(stream)
                .fetch_one(&mut *tx)
                .await?;
        let current = current.unwrap_or(-1);

        if let Some(expected) = expected_version
            && expected != current
        {
            return Err(StoreError::Concurrency {
                stream: stream.to_string(),
                expected,
                actual: current,
            });
        }

        let meta_json = serde_json::to_value(&meta)?;
        let mut committed = Vec::with_capacity(messages.len());
        for (offset, message) in messages.iter().enumerate() {
            let version = current + 1 + offset as i64;
            let row = sqlx::query(
                r#"
                INSERT INTO events (name, data, stream, version, meta)
                VALUES ($1, $2, $3, $4, $5)
                RETURNING id, created
                "#,
            )
            .bind(&message.name)
            .bind(&message.data)
            .bind(stream)
            .bind(version)
            .bind(&meta_json)
            .fetch_one(&mut *tx)
            .await
            .map_err(|e| {
                // A unique-index race on (stream, version) is a concurrent
                // writer winning the same slot.
                if let sqlx::Error::Database(ref db_err) = e
                    && db_err.constraint() == Some("events_stream_version")
                {
                    return StoreError::Concurrency {
                        stream: stream.to_string(),
                        expected: expected_version.unwrap_or(current),
                        actual: version,
                    };
                }
                StoreError::Database(e)
            })?;

            committed.push(CommittedEvent {
                id: row.try_get("id")?,
                stream: stream.to_string(),
                version,
                name: message.name.clone(),
                data: message.data.clone(),
                created: row.try_get("created")?,
                meta: meta.clone(),
            });
        }

        // Wake-up notification rides in the transaction: a failed notify
        // rolls everything back and surfaces as a concurrency failure.
        let notice = serde_json::to_string(&CommitNotice::insert(&committed[0]))?;
        sqlx::query("SELECT pg_notify($1, $2)")
            .bind(COMMIT_CHANNEL)
            .bind(&notice)
            .execute(&mut *tx)
            .await
            .map_err(|_| StoreError::Concurrency {
                stream: stream.to_string(),
                expected: expected_version.unwrap_or(current),
                actual: current,
            })?;

        tx.commit().await?;

        tracing::debug!(stream, count = committed.len(), "committed events");
        metrics::counter!("store_commits_total").increment(1);
        metrics::counter!("store_events_committed_total").increment(committed.len() as u64);

        Ok(committed)
    }

    async fn query(&self, filter: &EventFilter, sink: EventSink<'_>) -> Result<usize> {
        let mut sql = String::from(
            "SELECT id, name, data, stream, version, created, meta FROM events WHERE 1=1",
        );
        let mut param_count = 0;

        if !filter.with_snaps {
            param_count += 1;
            sql.push_str(&format!(" AND name <> ${param_count}"));
        }
        if filter.stream.is_some() {
            param_count += 1;
            sql.push_str(&format!(" AND stream = ${param_count}"));
        }
        if filter.names.is_some() {
            param_count += 1;
            sql.push_str(&format!(" AND name = ANY(${param_count})"));
        }
        if filter.before.is_some() {
            param_count += 1;
            sql.push_str(&format!(" AND id < ${param_count}"));
        }
        if filter.after.is_some() {
            param_count += 1;
            sql.push_str(&format!(" AND id > ${param_count}"));
        }
        if filter.created_before.is_some() {
            param_count += 1;
            sql.push_str(&format!(" AND created <= ${param_count}"));
        }
        if filter.created_after.is_some() {
            param_count += 1;
            sql.push_str(&format!(" AND created >= ${param_count}"));
        }
        if filter.correlation.is_some() {
            param_count += 1;
            sql.push_str(&format!(" AND meta ->> 'correlation' = ${param_count}"));
        }

        sql.push_str(if filter.backward {
            " ORDER BY id DESC"
        } else {
            " ORDER BY id ASC"
        });

        if filter.limit.is_some() {
            param_count += 1;
            sql.push_str(&format!(" LIMIT ${param_count}"));
        }

        let mut sqlx_query = sqlx::query(&sql);
        if !filter.with_snaps {
            sqlx_query = sqlx_query.bind(SNAP_EVENT);
        }
        if let Some(stream) = &filter.stream {
            sqlx_query = sqlx_query.bind(stream);
        }
        if let Some(names) = &filter.names {
            sqlx_query = sqlx_query.bind(names);
        }
        if let Some(before) = filter.before {
            sqlx_query = sqlx_query.bind(before);
        }
        if let Some(after) = filter.after {
            sqlx_query = sqlx_query.bind(after);
        }
        if let Some(created_before) = filter.created_before {
            sqlx_query = sqlx_query.bind(created_before);
        }
        if let Some(created_after) = filter.created_after {
            sqlx_query = sqlx_query.bind(created_after);
        }
        if let Some(correlation) = &filter.correlation {
            sqlx_query = sqlx_query.bind(correlation);
        }
        if let Some(limit) = filter.limit {
            sqlx_query = sqlx_query.bind(limit as i64);
        }

        let mut rows = sqlx_query.fetch(&self.pool);
        let mut count = 0;
        while let Some(row) = rows.try_next().await? {
            sink(Self::row_to_event(row)?);
            count += 1;
        }
        Ok(count)
    }

    async fn seed(&self) -> Result<()> {
        sqlx::raw_sql(SEED_SQL).execute(&self.pool).await?;
        Ok(())
    }

    async fn drop_store(&self) -> Result<()> {
        sqlx::raw_sql(DROP_SQL).execute(&self.pool).await?;
        Ok(())
    }

    async fn poll(&self, lagging: usize, leading: usize) -> Result<Vec<PolledStream>> {
        let rows = sqlx::query(
            r#"
            (SELECT stream, at, source FROM streams
             WHERE blocked = false AND (leased_until IS NULL OR leased_until <= now())
             ORDER BY at ASC LIMIT $1)
            UNION
            (SELECT stream, at, source FROM streams
             WHERE blocked = false AND (leased_until IS NULL OR leased_until <= now())
             ORDER BY at DESC LIMIT $2)
            "#,
        )
        .bind(lagging as i64)
        .bind(leading as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                Ok(PolledStream {
                    stream: row.try_get("stream")?,
                    at: row.try_get("at")?,
                    source: row.try_get("source")?,
                })
            })
            .collect()
    }

    async fn lease(&self, requests: &[LeaseRequest], ttl_ms: i64) -> Result<Vec<Lease>> {
        if requests.is_empty() {
            return Ok(Vec::new());
        }

        // One row per stream; first request wins on duplicates.
        let mut streams: Vec<String> = Vec::with_capacity(requests.len());
        let mut sources: Vec<Option<String>> = Vec::with_capacity(requests.len());
        let mut ats: Vec<i64> = Vec::with_capacity(requests.len());
        let mut bys: Vec<String> = Vec::with_capacity(requests.len());
        for request in requests {
            if streams.contains(&request.stream) {
                continue;
            }
            streams.push(request.stream.clone());
            sources.push(request.source.clone());
            ats.push(request.at);
            bys.push(request.by.clone());
        }

        let rows = sqlx::query(
            r#"
            INSERT INTO streams (stream, source, leased_by, leased_at, leased_until, retry)
            SELECT r.stream, r.source, r.by, r.at,
                   now() + ($5::bigint * interval '1 millisecond'),
                   CASE WHEN $5::bigint > 0 THEN 1 ELSE 0 END
            FROM UNNEST($1::text[], $2::text[], $3::bigint[], $4::text[])
                 AS r(stream, source, at, by)
            ON CONFLICT (stream) DO UPDATE SET
                source = COALESCE(streams.source, EXCLUDED.source),
                leased_by = EXCLUDED.leased_by,
                leased_at = EXCLUDED.leased_at,
                leased_until = EXCLUDED.leased_until,
                retry = CASE WHEN $5::bigint > 0 THEN streams.retry + 1 ELSE streams.retry END
            WHERE streams.blocked = false
              AND (streams.leased_until IS NULL OR streams.leased_until <= now())
            RETURNING stream, leased_by, leased_at, retry
            "#,
        )
        .bind(&streams)
        .bind(&sources)
        .bind(&ats)
        .bind(&bys)
        .bind(ttl_ms)
        .fetch_all(&self.pool)
        .await?;

        metrics::counter!("store_leases_granted_total").increment(rows.len() as u64);

        rows.iter().map(Self::row_to_lease).collect()
    }

    async fn ack(&self, leases: &[Lease]) -> Result<Vec<Lease>> {
        if leases.is_empty() {
            return Ok(Vec::new());
        }

        let streams: Vec<String> = leases.iter().map(|l| l.stream.clone()).collect();
        let ats: Vec<i64> = leases.iter().map(|l| l.at).collect();
        let bys: Vec<String> = leases.iter().map(|l| l.by.clone()).collect();

        let rows = sqlx::query(
            r#"
            UPDATE streams SET
                at = r.at,
                retry = 0,
                error = NULL,
                leased_at = NULL,
                leased_by = NULL,
                leased_until = NULL
            FROM UNNEST($1::text[], $2::bigint[], $3::text[]) AS r(stream, at, by)
            WHERE streams.stream = r.stream AND streams.leased_by = r.by
            RETURNING streams.stream
            "#,
        )
        .bind(&streams)
        .bind(&ats)
        .bind(&bys)
        .fetch_all(&self.pool)
        .await?;

        let acked: Vec<String> = rows
            .iter()
            .map(|row| row.try_get("stream"))
            .collect::<std::result::Result<_, sqlx::Error>>()?;

        Ok(leases
            .iter()
            .filter(|lease| acked.contains(&lease.stream))
            .cloned()
            .collect())
    }

    async fn block(&self, leases: &[Lease]) -> Result<Vec<Lease>> {
        if leases.is_empty() {
            return Ok(Vec::new());
        }

        let streams: Vec<String> = leases.iter().map(|l| l.stream.clone()).collect();
        let ats: Vec<i64> = leases.iter().map(|l| l.at).collect();
        let bys: Vec<String> = leases.iter().map(|l| l.by.clone()).collect();
        let errors: Vec<Option<String>> = leases.iter().map(|l| l.error.clone()).collect();

        let rows = sqlx::query(
            r#"
            UPDATE streams SET
                blocked = true,
                error = r.error,
                at = r.at,
                leased_at = NULL,
                leased_by = NULL,
                leased_until = NULL
            FROM UNNEST($1::text[], $2::bigint[], $3::text[], $4::text[])
                 AS r(stream, at, by, error)
            WHERE streams.stream = r.stream AND streams.leased_by = r.by
            RETURNING streams.stream
            "#,
        )
        .bind(&streams)
        .bind(&ats)
        .bind(&bys)
        .bind(&errors)
        .fetch_all(&self.pool)
        .await?;

        let blocked: Vec<String> = rows
            .iter()
            .map(|row| row.try_get("stream"))
            .collect::<std::result::Result<_, sqlx::Error>>()?;

        metrics::counter!("store_streams_blocked_total").increment(blocked.len() as u64);

        Ok(leases
            .iter()
            .filter(|lease| blocked.contains(&lease.stream))
            .cloned()
            .collect())
    }
}
