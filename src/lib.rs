//! Scheduled-refresh read cache for PostgreSQL query results.
//!
//! Each configured endpoint runs its SQL on a cron schedule; the serialized
//! result is published into an in-process store and served over HTTP with
//! weak ETags, `Last-Modified` and a `max-age` that lasts until the next
//! scheduled refresh.

pub mod application;
pub mod cache;
pub mod config;
pub mod domain;
pub mod infra;
