//! Application services: query execution, refresh orchestration and jobs.

pub mod error;
pub mod jobs;
pub mod query;
pub mod refresh;
