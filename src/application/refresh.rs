//! Scheduled refresh of a single endpoint.
//!
//! A refresh runs the endpoint query, serializes rows into either memory or
//! an encrypted blob while fingerprinting them, and publishes the finished
//! entry. A failed refresh removes whatever was published before, so clients
//! see 404 rather than a result the schedule no longer vouches for.

use std::{fmt, sync::Arc, time::Instant};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use metrics::{counter, histogram};
use serde_json::{Map, Value};
use thiserror::Error;
use time::OffsetDateTime;
use tracing::{info, warn};

use crate::{
    cache::{
        BlobError, BlobStore, BlobWriter, CacheEntry, CacheStore, Fingerprint, Fingerprinter,
        Payload,
    },
    domain::{
        endpoint::{Endpoint, RowFormat},
        schedule::next_fire,
    },
};

use super::query::{QueryError, QueryExecutor, Row};

pub(crate) const METRIC_REFRESH_TOTAL: &str = "querycache_refresh_total";
pub(crate) const METRIC_REFRESH_MS: &str = "querycache_refresh_ms";

#[derive(Debug, Error)]
pub enum RefreshError {
    #[error(transparent)]
    Query(#[from] QueryError),
    #[error("failed to serialize row: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("blob storage failed: {0}")]
    Storage(#[from] BlobError),
}

/// The firing that started a refresh.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Trigger {
    pub fired_at: DateTime<Utc>,
    /// When the endpoint will be refreshed next, if the schedule says.
    pub next_fire: Option<DateTime<Utc>>,
}

impl Trigger {
    /// A trigger for `endpoint` fired at `fired_at`, with the next fire time
    /// taken from its schedule.
    pub fn scheduled(endpoint: &Endpoint, fired_at: DateTime<Utc>) -> Self {
        Self {
            fired_at,
            next_fire: next_fire(endpoint.schedule(), fired_at),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshOutcome {
    /// First successful refresh for the key.
    Populated,
    /// A previous entry was replaced; `changed` is false when the content
    /// fingerprint is the same.
    Replaced { changed: bool },
    /// The refresh failed; `evicted` reports whether an entry was removed.
    Failed { evicted: bool },
}

impl RefreshOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            RefreshOutcome::Populated => "populated",
            RefreshOutcome::Replaced { changed: true } => "replaced",
            RefreshOutcome::Replaced { changed: false } => "unchanged",
            RefreshOutcome::Failed { .. } => "failed",
        }
    }
}

impl fmt::Display for RefreshOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Shared refresh machinery; one instance serves every endpoint.
#[derive(Clone)]
pub struct Refresher {
    store: Arc<CacheStore>,
    blobs: Arc<BlobStore>,
    executor: Arc<dyn QueryExecutor>,
}

impl fmt::Debug for Refresher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Refresher")
            .field("entries", &self.store.len())
            .field("blobs", &self.blobs)
            .finish_non_exhaustive()
    }
}

impl Refresher {
    pub fn new(
        store: Arc<CacheStore>,
        blobs: Arc<BlobStore>,
        executor: Arc<dyn QueryExecutor>,
    ) -> Self {
        Self {
            store,
            blobs,
            executor,
        }
    }

    pub fn store(&self) -> &Arc<CacheStore> {
        &self.store
    }

    /// Refresh `endpoint` and publish or evict its entry.
    ///
    /// Callers must not run two refreshes for the same endpoint at once.
    pub async fn run(&self, endpoint: &Endpoint, trigger: Trigger) -> RefreshOutcome {
        let started = Instant::now();
        let path = endpoint.path();

        let outcome = match self.execute(endpoint, trigger).await {
            Ok(entry) => {
                let fingerprint = entry.fingerprint();
                let bytes = entry.payload().len();
                let outcome = match self.store.publish(path, entry) {
                    None => RefreshOutcome::Populated,
                    Some(displaced) => RefreshOutcome::Replaced {
                        changed: displaced.fingerprint() != fingerprint,
                    },
                };
                info!(
                    target = "application::refresh",
                    path,
                    outcome = outcome.as_str(),
                    fingerprint = %fingerprint,
                    bytes,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "endpoint refreshed"
                );
                outcome
            }
            Err(err) => {
                let evicted = self.store.remove(path).is_some();
                warn!(
                    target = "application::refresh",
                    path,
                    evicted,
                    error = %err,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "endpoint refresh failed"
                );
                RefreshOutcome::Failed { evicted }
            }
        };

        histogram!(METRIC_REFRESH_MS, "outcome" => outcome.as_str())
            .record(started.elapsed().as_secs_f64() * 1000.0);
        counter!(METRIC_REFRESH_TOTAL, "outcome" => outcome.as_str()).increment(1);

        outcome
    }

    /// Run the query and build an entry without publishing it. A partially
    /// written blob is discarded on every error path.
    pub async fn execute(
        &self,
        endpoint: &Endpoint,
        trigger: Trigger,
    ) -> Result<CacheEntry, RefreshError> {
        let mut sink = if endpoint.file_backed() {
            Sink::Blob(self.blobs.create_blob().await?)
        } else {
            Sink::Memory(Vec::new())
        };

        let streamed = match endpoint.timeout() {
            Some(limit) => {
                match tokio::time::timeout(limit, self.stream_rows(endpoint, &mut sink)).await {
                    Ok(result) => result,
                    Err(_) => Err(QueryError::Timeout(limit).into()),
                }
            }
            None => self.stream_rows(endpoint, &mut sink).await,
        };

        let fingerprint = match streamed {
            Ok(fingerprint) => fingerprint,
            Err(err) => {
                sink.abort();
                return Err(err);
            }
        };

        let payload = sink.finish().await?;
        let completed = OffsetDateTime::now_utc();

        Ok(CacheEntry::new(
            fingerprint,
            completed,
            freshness_secs(trigger.next_fire, completed),
            payload,
        ))
    }

    async fn stream_rows(
        &self,
        endpoint: &Endpoint,
        sink: &mut Sink,
    ) -> Result<Fingerprint, RefreshError> {
        let mut rows = self.executor.query(endpoint.sql());
        let mut fingerprinter = Fingerprinter::new();
        let mut encoded = Vec::new();
        let mut first = true;

        sink.write(b"[").await?;
        while let Some(row) = rows.next().await {
            encoded.clear();
            encode_row(row?, endpoint.row_format(), &mut encoded)?;
            fingerprinter.update(&encoded);

            if !first {
                sink.write(b",").await?;
            }
            sink.write(&encoded).await?;
            first = false;
        }
        sink.write(b"]").await?;

        Ok(fingerprinter.finish())
    }
}

/// Seconds from `completed` (whole seconds, as `Last-Modified` shows it) to
/// the next scheduled refresh, so `Last-Modified + max-age` is the next fire.
fn freshness_secs(next_fire: Option<DateTime<Utc>>, completed: OffsetDateTime) -> u64 {
    next_fire
        .map(|next| (next.timestamp() - completed.unix_timestamp()).max(0) as u64)
        .unwrap_or(0)
}

/// Serialize one row as compact JSON. Object keys follow column order; a
/// repeated column name keeps its first position and its last value.
pub fn encode_row(
    row: Row,
    format: RowFormat,
    out: &mut Vec<u8>,
) -> Result<(), serde_json::Error> {
    match format {
        RowFormat::Array => serde_json::to_writer(out, &row.values),
        RowFormat::Object => {
            let mut object = Map::with_capacity(row.columns.len());
            for (column, value) in row.columns.iter().zip(row.values) {
                object.insert(column.clone(), value);
            }
            serde_json::to_writer(out, &Value::Object(object))
        }
    }
}

enum Sink {
    Memory(Vec<u8>),
    Blob(BlobWriter),
}

impl Sink {
    async fn write(&mut self, bytes: &[u8]) -> Result<(), BlobError> {
        match self {
            Sink::Memory(buffer) => {
                buffer.extend_from_slice(bytes);
                Ok(())
            }
            Sink::Blob(writer) => writer.write(bytes).await,
        }
    }

    async fn finish(self) -> Result<Payload, BlobError> {
        match self {
            Sink::Memory(buffer) => Ok(Payload::Memory(Bytes::from(buffer))),
            Sink::Blob(writer) => Ok(Payload::Blob(writer.finish().await?)),
        }
    }

    fn abort(self) {
        if let Sink::Blob(writer) = self {
            writer.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Mutex, time::Duration};

    use futures::stream::{self, StreamExt};
    use serde_json::json;

    use super::*;
    use crate::{
        application::query::RowStream,
        cache::wait_until_removed,
        domain::endpoint::{EndpointSpec, RowFormat},
    };

    #[derive(Clone)]
    enum Script {
        Rows(Vec<Vec<Value>>),
        FailAfter(Vec<Vec<Value>>),
        Stall,
    }

    struct ScriptedExecutor {
        columns: Arc<[String]>,
        script: Mutex<Script>,
    }

    impl ScriptedExecutor {
        fn new(columns: &[&str], script: Script) -> Arc<Self> {
            Arc::new(Self {
                columns: columns.iter().map(|c| c.to_string()).collect(),
                script: Mutex::new(script),
            })
        }

        fn set(&self, script: Script) {
            *self.script.lock().unwrap() = script;
        }
    }

    impl QueryExecutor for ScriptedExecutor {
        fn query<'a>(&'a self, _sql: &'a str) -> RowStream<'a> {
            let script = self.script.lock().unwrap().clone();
            let columns = Arc::clone(&self.columns);
            let to_row = move |values: Vec<Value>| -> Result<Row, QueryError> {
                Ok(Row::new(Arc::clone(&columns), values))
            };
            match script {
                Script::Rows(rows) => stream::iter(rows.into_iter().map(to_row)).boxed(),
                Script::FailAfter(rows) => stream::iter(rows.into_iter().map(to_row))
                    .chain(stream::once(async {
                        Err(QueryError::database("relation does not exist"))
                    }))
                    .boxed(),
                Script::Stall => stream::pending().boxed(),
            }
        }
    }

    struct Fixture {
        dir: tempfile::TempDir,
        store: Arc<CacheStore>,
        refresher: Refresher,
    }

    fn fixture(executor: Arc<ScriptedExecutor>) -> Fixture {
        let dir = tempfile::tempdir().expect("tempdir");
        let blobs = Arc::new(BlobStore::new(dir.path().to_path_buf()).expect("blob store"));
        let store = Arc::new(CacheStore::new());
        let refresher = Refresher::new(Arc::clone(&store), blobs, executor);
        Fixture {
            dir,
            store,
            refresher,
        }
    }

    fn endpoint(row_format: RowFormat, file_backed: bool) -> Endpoint {
        Endpoint::new(EndpointSpec {
            path: "/reports".to_string(),
            sql: "SELECT col1, col2 FROM report".to_string(),
            schedule: "*/5 * * * *".to_string(),
            timeout: Some(Duration::from_secs(5)),
            row_format,
            file_backed,
        })
        .expect("valid endpoint")
    }

    fn trigger_now() -> Trigger {
        let now = Utc::now();
        Trigger {
            fired_at: now,
            next_fire: Some(now + chrono::Duration::seconds(120)),
        }
    }

    fn memory_body(store: &CacheStore, key: &str) -> Vec<u8> {
        let entry = store.load(key).expect("entry");
        match entry.payload() {
            Payload::Memory(bytes) => bytes.to_vec(),
            Payload::Blob(_) => panic!("expected in-memory payload"),
        }
    }

    fn blob_path(store: &CacheStore, key: &str) -> std::path::PathBuf {
        let entry = store.load(key).expect("entry");
        match entry.payload() {
            Payload::Blob(blob) => blob.path().to_path_buf(),
            Payload::Memory(_) => panic!("expected blob payload"),
        }
    }

    fn files_in(dir: &tempfile::TempDir) -> usize {
        std::fs::read_dir(dir.path()).expect("read dir").count()
    }

    #[tokio::test]
    async fn object_rows_serialize_in_column_order() {
        let executor = ScriptedExecutor::new(
            &["col1", "col2"],
            Script::Rows(vec![vec![json!("a"), json!(1)]]),
        );
        let fx = fixture(executor);

        let outcome = fx
            .refresher
            .run(&endpoint(RowFormat::Object, false), trigger_now())
            .await;

        assert_eq!(outcome, RefreshOutcome::Populated);
        assert_eq!(memory_body(&fx.store, "/reports"), br#"[{"col1":"a","col2":1}]"#);
    }

    #[tokio::test]
    async fn array_rows_and_empty_results_serialize_compactly() {
        let executor = ScriptedExecutor::new(
            &["col1", "col2"],
            Script::Rows(vec![
                vec![json!("a"), json!(1)],
                vec![json!(null), json!(2.5)],
            ]),
        );
        let fx = fixture(Arc::clone(&executor));
        let array = endpoint(RowFormat::Array, false);

        fx.refresher.run(&array, trigger_now()).await;
        assert_eq!(memory_body(&fx.store, "/reports"), br#"[["a",1],[null,2.5]]"#);

        executor.set(Script::Rows(Vec::new()));
        fx.refresher.run(&array, trigger_now()).await;
        assert_eq!(memory_body(&fx.store, "/reports"), b"[]");
    }

    #[test]
    fn repeated_columns_keep_first_position_and_last_value() {
        let row = Row::new(
            vec!["a".to_string(), "b".to_string(), "a".to_string()].into(),
            vec![json!(1), json!(2), json!(3)],
        );
        let mut out = Vec::new();
        encode_row(row, RowFormat::Object, &mut out).expect("encode");
        assert_eq!(out, br#"{"a":3,"b":2}"#);
    }

    #[tokio::test]
    async fn identical_refresh_keeps_etag_and_retires_old_blob() {
        let executor = ScriptedExecutor::new(
            &["col1", "col2"],
            Script::Rows(vec![vec![json!("a"), json!(1)]]),
        );
        let fx = fixture(executor);
        let endpoint = endpoint(RowFormat::Object, true);

        fx.refresher.run(&endpoint, trigger_now()).await;
        let first_etag = fx.store.load("/reports").expect("entry").etag().to_string();
        let first_path = blob_path(&fx.store, "/reports");

        let outcome = fx.refresher.run(&endpoint, trigger_now()).await;
        assert_eq!(outcome, RefreshOutcome::Replaced { changed: false });

        let second = fx.store.load("/reports").expect("entry");
        assert_eq!(second.etag(), first_etag);
        assert!(
            wait_until_removed(&first_path).await,
            "displaced blob deleted"
        );
        assert_eq!(files_in(&fx.dir), 1);
    }

    #[tokio::test]
    async fn changed_rows_change_fingerprint() {
        let executor = ScriptedExecutor::new(&["col1"], Script::Rows(vec![vec![json!("a")]]));
        let fx = fixture(Arc::clone(&executor));
        let endpoint = endpoint(RowFormat::Object, false);

        fx.refresher.run(&endpoint, trigger_now()).await;
        let first = fx.store.load("/reports").expect("entry").fingerprint();

        executor.set(Script::Rows(vec![vec![json!("b")]]));
        let outcome = fx.refresher.run(&endpoint, trigger_now()).await;

        assert_eq!(outcome, RefreshOutcome::Replaced { changed: true });
        assert_ne!(fx.store.load("/reports").expect("entry").fingerprint(), first);
    }

    #[tokio::test]
    async fn failure_before_any_success_leaves_key_absent() {
        let executor = ScriptedExecutor::new(&["col1"], Script::FailAfter(Vec::new()));
        let fx = fixture(executor);

        let outcome = fx
            .refresher
            .run(&endpoint(RowFormat::Object, false), trigger_now())
            .await;

        assert_eq!(outcome, RefreshOutcome::Failed { evicted: false });
        assert!(fx.store.load("/reports").is_none());
    }

    #[tokio::test]
    async fn failure_after_success_evicts_entry_and_blob() {
        let executor = ScriptedExecutor::new(&["col1"], Script::Rows(vec![vec![json!(1)]]));
        let fx = fixture(Arc::clone(&executor));
        let endpoint = endpoint(RowFormat::Object, true);

        fx.refresher.run(&endpoint, trigger_now()).await;
        let path = blob_path(&fx.store, "/reports");

        executor.set(Script::FailAfter(vec![vec![json!(2)]]));
        let outcome = fx.refresher.run(&endpoint, trigger_now()).await;

        assert_eq!(outcome, RefreshOutcome::Failed { evicted: true });
        assert!(fx.store.load("/reports").is_none());
        assert!(wait_until_removed(&path).await);
        assert_eq!(files_in(&fx.dir), 0);
    }

    #[tokio::test]
    async fn mid_write_failure_discards_partial_blob() {
        let big = "x".repeat(4096);
        let rows = (0..64).map(|i| vec![json!(i), json!(big)]).collect();
        let executor = ScriptedExecutor::new(&["id", "text"], Script::FailAfter(rows));
        let fx = fixture(executor);

        let result = fx
            .refresher
            .execute(&endpoint(RowFormat::Object, true), trigger_now())
            .await;

        assert!(matches!(result, Err(RefreshError::Query(QueryError::Database(_)))));
        assert_eq!(files_in(&fx.dir), 0);
    }

    #[tokio::test]
    async fn stalled_query_times_out() {
        let executor = ScriptedExecutor::new(&["col1"], Script::Stall);
        let fx = fixture(executor);
        let endpoint = Endpoint::new(EndpointSpec {
            path: "/slow".to_string(),
            sql: "SELECT pg_sleep(60)".to_string(),
            schedule: "@hourly".to_string(),
            timeout: Some(Duration::from_millis(50)),
            row_format: RowFormat::Object,
            file_backed: true,
        })
        .expect("valid endpoint");

        let result = fx.refresher.execute(&endpoint, trigger_now()).await;

        assert!(matches!(
            result,
            Err(RefreshError::Query(QueryError::Timeout(limit))) if limit == Duration::from_millis(50)
        ));
        assert_eq!(files_in(&fx.dir), 0);
    }

    #[tokio::test]
    async fn freshness_tracks_next_fire() {
        let executor = ScriptedExecutor::new(&["col1"], Script::Rows(Vec::new()));
        let fx = fixture(executor);
        let endpoint = endpoint(RowFormat::Object, false);

        let entry = fx
            .refresher
            .execute(&endpoint, trigger_now())
            .await
            .expect("entry");
        assert!((118..=120).contains(&entry.freshness_secs()));

        let past = Utc::now() - chrono::Duration::seconds(30);
        let overdue = Trigger {
            fired_at: past,
            next_fire: Some(past),
        };
        let entry = fx.refresher.execute(&endpoint, overdue).await.expect("entry");
        assert_eq!(entry.freshness_secs(), 0);

        let unscheduled = Trigger {
            fired_at: Utc::now(),
            next_fire: None,
        };
        let entry = fx
            .refresher
            .execute(&endpoint, unscheduled)
            .await
            .expect("entry");
        assert_eq!(entry.cache_control(), "max-age=0, immutable");
    }

    #[test]
    fn last_modified_plus_max_age_lands_on_next_fire() {
        let completed = time::macros::datetime!(2024-03-01 10:02:00.900 UTC);
        let next = chrono::TimeZone::with_ymd_and_hms(&Utc, 2024, 3, 1, 10, 5, 0).unwrap();

        assert_eq!(freshness_secs(Some(next), completed), 180);
        assert_eq!(
            freshness_secs(Some(next - chrono::Duration::minutes(10)), completed),
            0
        );
        assert_eq!(freshness_secs(None, completed), 0);
    }

    #[test]
    fn scheduled_trigger_uses_endpoint_schedule() {
        let endpoint = endpoint(RowFormat::Object, false);
        let fired_at = chrono::TimeZone::with_ymd_and_hms(&Utc, 2024, 3, 1, 10, 2, 0).unwrap();
        let trigger = Trigger::scheduled(&endpoint, fired_at);
        assert_eq!(
            trigger.next_fire,
            Some(chrono::TimeZone::with_ymd_and_hms(&Utc, 2024, 3, 1, 10, 5, 0).unwrap())
        );
    }
}
