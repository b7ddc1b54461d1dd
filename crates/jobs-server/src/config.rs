use std::net::SocketAddr;

use anyhow::Context;

#[derive(Clone, Debug)]
pub struct Config {
    pub bind: SocketAddr,
    pub database_url: String,
    /// Worker loops run inside the API process; 0 serves the API only.
    ///
    /// In API-only mode enqueue still validates `type` against this process's
    /// `JOB_TYPES`, so it must match what the remote workers register.
    /// `/v1/status` and `/metrics` then report an idle local breaker.
    pub embedded_workers: usize,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        let bind = std::env::var("BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_string());
        let bind: SocketAddr = bind
            .parse()
            .context("BIND_ADDR must be a valid SocketAddr")?;

        let database_url =
            std::env::var("DATABASE_URL").context("DATABASE_URL must be set (postgres://...)")?;

        let embedded_workers = match std::env::var("EMBEDDED_WORKERS") {
            Ok(v) => v
                .parse()
                .context("EMBEDDED_WORKERS must be a non-negative integer")?,
            Err(_) => 0,
        };

        Ok(Self {
            bind,
            database_url,
            embedded_workers,
        })
    }
}
