//! Cached endpoint definitions.
//!
//! An endpoint binds an HTTP path to a SQL query and the cron schedule that
//! refreshes it. Endpoints are built once from configuration and never change
//! for the lifetime of the process.

use std::{fmt, str::FromStr, time::Duration};

use apalis_cron::Schedule;

use super::{error::DomainError, schedule::parse_schedule};

/// How each result row is rendered inside the JSON array body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RowFormat {
    /// `[value, value, ...]` in column order.
    Array,
    /// `{"column": value, ...}` keyed by column name, in column order.
    #[default]
    Object,
}

impl RowFormat {
    pub fn as_str(self) -> &'static str {
        match self {
            RowFormat::Array => "array",
            RowFormat::Object => "object",
        }
    }
}

impl FromStr for RowFormat {
    type Err = DomainError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim() {
            "" | "object" => Ok(RowFormat::Object),
            "array" => Ok(RowFormat::Array),
            other => Err(DomainError::validation(format!(
                "unknown row format `{other}` (expected `array` or `object`)"
            ))),
        }
    }
}

impl fmt::Display for RowFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A configured (path, query, schedule, storage mode) unit served by the cache.
#[derive(Debug, Clone)]
pub struct Endpoint {
    path: String,
    sql: String,
    schedule_expr: String,
    schedule: Schedule,
    timeout: Option<Duration>,
    row_format: RowFormat,
    file_backed: bool,
}

/// Unvalidated endpoint fields as they arrive from configuration.
#[derive(Debug, Clone, Default)]
pub struct EndpointSpec {
    pub path: String,
    pub sql: String,
    pub schedule: String,
    pub timeout: Option<Duration>,
    pub row_format: RowFormat,
    pub file_backed: bool,
}

impl Endpoint {
    pub fn new(spec: EndpointSpec) -> Result<Self, DomainError> {
        let EndpointSpec {
            path,
            sql,
            schedule,
            timeout,
            row_format,
            file_backed,
        } = spec;

        validate_path(&path)?;

        let sql = sql.trim().to_string();
        if sql.is_empty() {
            return Err(DomainError::validation(format!(
                "endpoint `{path}` has an empty query"
            )));
        }

        if timeout.is_some_and(|value| value.is_zero()) {
            return Err(DomainError::validation(format!(
                "endpoint `{path}` timeout must be greater than zero"
            )));
        }

        let schedule_expr = schedule.trim().to_string();
        let parsed = parse_schedule(&schedule_expr)?;

        Ok(Self {
            path,
            sql,
            schedule_expr,
            schedule: parsed,
            timeout,
            row_format,
            file_backed,
        })
    }

    /// Cache key and HTTP route of this endpoint.
    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn sql(&self) -> &str {
        &self.sql
    }

    /// The schedule expression as configured, before normalization.
    pub fn schedule_expr(&self) -> &str {
        &self.schedule_expr
    }

    pub fn schedule(&self) -> &Schedule {
        &self.schedule
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    pub fn row_format(&self) -> RowFormat {
        self.row_format
    }

    pub fn file_backed(&self) -> bool {
        self.file_backed
    }
}

/// Accepts `/` or one or more `/segment` parts, where a segment is either a
/// literal of `[A-Za-z0-9_.-]` or a `{name}` capture using the same alphabet.
pub fn validate_path(path: &str) -> Result<(), DomainError> {
    if path == "/" {
        return Ok(());
    }

    let Some(rest) = path.strip_prefix('/') else {
        return Err(invalid_path(path, "must start with `/`"));
    };

    for segment in rest.split('/') {
        let name = match segment
            .strip_prefix('{')
            .and_then(|inner| inner.strip_suffix('}'))
        {
            Some(inner) => inner,
            None => segment,
        };

        if name.is_empty() {
            return Err(invalid_path(path, "contains an empty segment"));
        }
        if !name.chars().all(is_segment_char) {
            return Err(invalid_path(
                path,
                "segments may only contain letters, digits, `_`, `.`, `-` or a `{name}` capture",
            ));
        }
    }

    Ok(())
}

fn is_segment_char(ch: char) -> bool {
    ch.is_ascii_alphanumeric() || matches!(ch, '_' | '.' | '-')
}

fn invalid_path(path: &str, reason: &str) -> DomainError {
    DomainError::validation(format!("invalid endpoint path `{path}`: {reason}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(path: &str) -> EndpointSpec {
        EndpointSpec {
            path: path.to_string(),
            sql: "SELECT 1".to_string(),
            schedule: "*/5 * * * *".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn accepts_root_literal_and_capture_paths() {
        for path in ["/", "/reports", "/reports/daily.json", "/users/{id}/stats", "/a-b_c"] {
            assert!(validate_path(path).is_ok(), "{path} should be accepted");
        }
    }

    #[test]
    fn rejects_malformed_paths() {
        for path in ["", "reports", "/reports/", "//", "/a b", "/{}", "/{id", "/caf\u{e9}"] {
            assert!(validate_path(path).is_err(), "{path} should be rejected");
        }
    }

    #[test]
    fn row_format_parses_known_values() {
        assert_eq!("array".parse::<RowFormat>(), Ok(RowFormat::Array));
        assert_eq!("object".parse::<RowFormat>(), Ok(RowFormat::Object));
        assert_eq!("".parse::<RowFormat>(), Ok(RowFormat::Object));
        assert!("csv".parse::<RowFormat>().is_err());
    }

    #[test]
    fn endpoint_rejects_blank_sql() {
        let mut blank = spec("/x");
        blank.sql = "   ".to_string();
        assert!(Endpoint::new(blank).is_err());
    }

    #[test]
    fn endpoint_rejects_zero_timeout() {
        let mut zero = spec("/x");
        zero.timeout = Some(Duration::ZERO);
        assert!(Endpoint::new(zero).is_err());
    }

    #[test]
    fn endpoint_keeps_configured_fields() {
        let mut source = spec("/reports/daily");
        source.row_format = RowFormat::Array;
        source.file_backed = true;
        source.timeout = Some(Duration::from_secs(3));

        let endpoint = Endpoint::new(source).expect("valid endpoint");
        assert_eq!(endpoint.path(), "/reports/daily");
        assert_eq!(endpoint.schedule_expr(), "*/5 * * * *");
        assert_eq!(endpoint.row_format(), RowFormat::Array);
        assert_eq!(endpoint.timeout(), Some(Duration::from_secs(3)));
        assert!(endpoint.file_backed());
    }
}
