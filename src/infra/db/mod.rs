//! Postgres-backed query execution.
//!
//! Endpoint SQL runs over the simple query protocol, so every column arrives
//! in its text representation and is mapped to JSON by column type.

use std::{sync::Arc, time::Duration};

use futures::StreamExt;
use serde_json::{Number, Value};
use sqlx::{
    Column, Decode, Postgres, Row as _, TypeInfo, ValueRef,
    postgres::{PgPool, PgPoolOptions, PgRow},
};

use crate::application::query::{QueryError, QueryExecutor, Row, RowStream};

/// Pool sizing and timeouts for the endpoint executor.
#[derive(Debug, Clone)]
pub struct PoolOptions {
    pub max_connections: u32,
    pub acquire_timeout: Duration,
    pub idle_timeout: Option<Duration>,
}

#[derive(Clone)]
pub struct PostgresExecutor {
    pool: Arc<PgPool>,
}

impl PostgresExecutor {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Build a pool that opens connections on first use. Only the URL is
    /// validated here.
    pub fn connect_lazy(url: &str, options: &PoolOptions) -> Result<PgPool, sqlx::Error> {
        PgPoolOptions::new()
            .max_connections(options.max_connections)
            .acquire_timeout(options.acquire_timeout)
            .idle_timeout(options.idle_timeout)
            .connect_lazy(url)
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

impl QueryExecutor for PostgresExecutor {
    fn query<'a>(&'a self, sql: &'a str) -> RowStream<'a> {
        let mut columns: Option<Arc<[String]>> = None;
        sqlx::raw_sql(sql)
            .fetch(self.pool.as_ref())
            .map(move |row| {
                let row = row.map_err(map_query_error)?;
                decode_row(&row, &mut columns)
            })
            .boxed()
    }
}

pub fn map_query_error(err: sqlx::Error) -> QueryError {
    match err {
        sqlx::Error::PoolTimedOut => QueryError::connection("timed out acquiring a connection"),
        sqlx::Error::PoolClosed => QueryError::connection("connection pool is closed"),
        sqlx::Error::Io(err) => QueryError::connection(err.to_string()),
        sqlx::Error::Tls(err) => QueryError::connection(err.to_string()),
        sqlx::Error::Configuration(err) => QueryError::connection(err.to_string()),
        sqlx::Error::Database(db) => QueryError::database(db.message()),
        other => QueryError::database(other.to_string()),
    }
}

fn decode_row(row: &PgRow, columns: &mut Option<Arc<[String]>>) -> Result<Row, QueryError> {
    let names = column_names(columns, row.columns().iter().map(|column| column.name()));

    let mut values = Vec::with_capacity(row.len());
    for (index, column) in row.columns().iter().enumerate() {
        let raw = row
            .try_get_raw(index)
            .map_err(|err| QueryError::decode(column.name(), err.to_string()))?;
        if raw.is_null() {
            values.push(Value::Null);
            continue;
        }

        let text = <&str as Decode<'_, Postgres>>::decode(raw)
            .map_err(|err| QueryError::decode(column.name(), err.to_string()))?;
        let value = text_to_json(column.type_info().name(), text)
            .map_err(|reason| QueryError::decode(column.name(), reason))?;
        values.push(value);
    }

    Ok(Row::new(names, values))
}

// A multi-statement body yields rows with different shapes, so the cached
// names are only reused while they still describe the current row.
fn column_names<'n, I>(cached: &mut Option<Arc<[String]>>, names: I) -> Arc<[String]>
where
    I: ExactSizeIterator<Item = &'n str> + Clone,
{
    if let Some(known) = cached.as_ref() {
        if known.len() == names.len() && known.iter().map(String::as_str).eq(names.clone()) {
            return Arc::clone(known);
        }
    }

    let fresh: Arc<[String]> = names.map(str::to_string).collect();
    *cached = Some(Arc::clone(&fresh));
    fresh
}

/// Map a column's text representation to JSON by its Postgres type name.
/// Types without a natural JSON form are kept as strings. Numbers keep their
/// exact decimal literal, so wide `NUMERIC` values are not rounded.
pub fn text_to_json(type_name: &str, text: &str) -> Result<Value, String> {
    match type_name {
        "BOOL" => match text {
            "t" | "true" => Ok(Value::Bool(true)),
            "f" | "false" => Ok(Value::Bool(false)),
            other => Err(format!("unexpected boolean literal `{other}`")),
        },
        "INT2" | "INT4" | "INT8" | "OID" => text
            .parse::<i64>()
            .map(Value::from)
            .map_err(|err| format!("invalid integer `{text}`: {err}")),
        "FLOAT4" | "FLOAT8" | "NUMERIC" => Ok(text
            .parse::<Number>()
            .map(Value::Number)
            .unwrap_or_else(|_| Value::String(text.to_string()))),
        "JSON" | "JSONB" => {
            serde_json::from_str(text).map_err(|err| format!("invalid json document: {err}"))
        }
        _ => Ok(Value::String(text.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn booleans_and_integers_become_native_json() {
        assert_eq!(text_to_json("BOOL", "t"), Ok(json!(true)));
        assert_eq!(text_to_json("BOOL", "f"), Ok(json!(false)));
        assert_eq!(text_to_json("INT8", "-42"), Ok(json!(-42)));
        assert!(text_to_json("INT4", "forty").is_err());
    }

    #[test]
    fn floats_fall_back_to_strings_when_not_finite() {
        assert_eq!(text_to_json("FLOAT8", "2.5"), Ok(json!(2.5)));
        assert_eq!(text_to_json("NUMERIC", "10"), Ok(json!(10)));
        assert_eq!(text_to_json("FLOAT8", "NaN"), Ok(json!("NaN")));
        assert_eq!(text_to_json("FLOAT4", "Infinity"), Ok(json!("Infinity")));
    }

    #[test]
    fn wide_numerics_keep_every_digit() {
        let wide = text_to_json("NUMERIC", "123456789012345678901234567890").unwrap();
        assert_eq!(wide.to_string(), "123456789012345678901234567890");

        let long = text_to_json("NUMERIC", "0.10000000000000000000001").unwrap();
        assert_eq!(long.to_string(), "0.10000000000000000000001");
        assert_ne!(long, text_to_json("NUMERIC", "0.1").unwrap());

        let scaled = text_to_json("NUMERIC", "10.50").unwrap();
        assert_eq!(scaled.to_string(), "10.50");
    }

    #[test]
    fn column_names_are_reused_until_the_shape_changes() {
        let mut cached = None;
        let first = column_names(&mut cached, ["id", "name"].into_iter());
        let again = column_names(&mut cached, ["id", "name"].into_iter());
        assert!(Arc::ptr_eq(&first, &again));

        let renamed = column_names(&mut cached, ["id", "label"].into_iter());
        assert_eq!(&*renamed, &["id".to_string(), "label".to_string()]);

        let wider = column_names(&mut cached, ["a", "b", "c"].into_iter());
        assert_eq!(wider.len(), 3);
        assert!(Arc::ptr_eq(&wider, cached.as_ref().unwrap()));
    }

    #[test]
    fn json_columns_are_embedded() {
        assert_eq!(
            text_to_json("JSONB", r#"{"b":1,"a":[true]}"#),
            Ok(json!({"b": 1, "a": [true]}))
        );
        assert!(text_to_json("JSON", "{").is_err());
    }

    #[test]
    fn other_types_are_kept_as_text() {
        assert_eq!(
            text_to_json("TIMESTAMPTZ", "2024-01-02 03:04:05+00"),
            Ok(json!("2024-01-02 03:04:05+00"))
        );
        assert_eq!(
            text_to_json("UUID", "00000000-0000-0000-0000-000000000000"),
            Ok(json!("00000000-0000-0000-0000-000000000000"))
        );
    }

    #[test]
    fn pool_errors_map_to_connection_failures() {
        assert!(matches!(
            map_query_error(sqlx::Error::PoolTimedOut),
            QueryError::Connection(_)
        ));
        assert!(matches!(
            map_query_error(sqlx::Error::RowNotFound),
            QueryError::Database(_)
        ));
    }
}
