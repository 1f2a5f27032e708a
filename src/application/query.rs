//! Query execution seam between refresh workers and the database.

use std::{sync::Arc, time::Duration};

use futures::stream::BoxStream;
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum QueryError {
    #[error("database connection failed: {0}")]
    Connection(String),
    #[error("query timed out after {0:?}")]
    Timeout(Duration),
    #[error("query failed: {0}")]
    Database(String),
    #[error("failed to decode column `{column}`: {reason}")]
    Decode { column: String, reason: String },
}

impl QueryError {
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection(message.into())
    }

    pub fn database(message: impl Into<String>) -> Self {
        Self::Database(message.into())
    }

    pub fn decode(column: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Decode {
            column: column.into(),
            reason: reason.into(),
        }
    }
}

/// One result row. Column names are shared by every row of a result.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    pub columns: Arc<[String]>,
    pub values: Vec<Value>,
}

impl Row {
    pub fn new(columns: Arc<[String]>, values: Vec<Value>) -> Self {
        Self { columns, values }
    }
}

pub type RowStream<'a> = BoxStream<'a, Result<Row, QueryError>>;

/// Runs endpoint SQL and yields rows as they arrive.
///
/// Dropping the stream cancels the query. Any error item fails the refresh.
pub trait QueryExecutor: Send + Sync {
    fn query<'a>(&'a self, sql: &'a str) -> RowStream<'a>;
}
