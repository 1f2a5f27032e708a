use std::{io, net::SocketAddr, path::PathBuf};

use thiserror::Error;
use tracing_subscriber::util::TryInitError;

use crate::cache::BlobError;

/// Failures while bringing the serving process up or while it runs.
#[derive(Debug, Error)]
pub enum InfraError {
    #[error("database url is not configured; set database.url or pass --database-url")]
    MissingDatabaseUrl,
    #[error("invalid database pool settings")]
    Pool(#[source] sqlx::Error),
    #[error("blob directory {} is unusable", dir.display())]
    BlobDir {
        dir: PathBuf,
        #[source]
        source: BlobError,
    },
    #[error("failed to bind {addr}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
    #[error("http server stopped unexpectedly")]
    Serve(#[source] io::Error),
    #[error("failed to install tracing subscriber")]
    Telemetry(#[from] TryInitError),
}

impl InfraError {
    pub fn blob_dir(dir: impl Into<PathBuf>, source: BlobError) -> Self {
        Self::BlobDir {
            dir: dir.into(),
            source,
        }
    }

    pub fn bind(addr: SocketAddr, source: io::Error) -> Self {
        Self::Bind { addr, source }
    }
}
