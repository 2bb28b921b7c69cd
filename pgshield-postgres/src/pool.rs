//! Connection pool handing out migration sessions.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use deadpool_postgres::{Manager, ManagerConfig, Pool, RecyclingMethod, Runtime};
use pgshield_core::{Connector, DbError};
use tokio_postgres::NoTls;
use tracing::{debug, info};

use crate::config::{PgConfig, SslMode};
use crate::connection::PgConnection;
use crate::error::{PgError, PgResult};

/// Sizing of the session pool.
///
/// Migrations run one transaction at a time, so the pool stays small.
#[derive(Debug, Clone, PartialEq)]
pub struct PoolConfig {
    /// Most sessions open at once.
    pub max_size: usize,
    /// How long to wait for a free session or a new connection.
    pub acquire_timeout: Option<Duration>,
    /// How long recycling an idle session may take.
    pub recycle_timeout: Option<Duration>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_size: 4,
            acquire_timeout: Some(Duration::from_secs(30)),
            recycle_timeout: Some(Duration::from_secs(5)),
        }
    }
}

impl PoolConfig {
    /// Set the most sessions open at once.
    pub fn max_size(mut self, n: usize) -> Self {
        self.max_size = n;
        self
    }

    /// Set the acquire timeout.
    pub fn acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = Some(timeout);
        self
    }
}

/// A pool of PostgreSQL sessions.
#[derive(Clone)]
pub struct PgPool {
    inner: Pool,
    config: Arc<PgConfig>,
}

impl PgPool {
    /// Create a pool with default sizing.
    pub fn new(config: PgConfig) -> PgResult<Self> {
        Self::with_pool_config(config, PoolConfig::default())
    }

    /// Create a pool from a connection URL with default sizing.
    pub fn from_url(url: &str) -> PgResult<Self> {
        Self::new(PgConfig::from_url(url)?)
    }

    /// Create a pool with explicit sizing. No connection is opened yet.
    pub fn with_pool_config(config: PgConfig, pool_config: PoolConfig) -> PgResult<Self> {
        if config.ssl_mode == SslMode::Require {
            return Err(PgError::config(
                "sslmode=require is not supported by this adapter",
            ));
        }
        if pool_config.max_size == 0 {
            return Err(PgError::config("pool max_size must be at least 1"));
        }

        let mgr = Manager::from_config(
            config.to_pg_config(),
            NoTls,
            ManagerConfig {
                recycling_method: RecyclingMethod::Fast,
            },
        );

        let pool = Pool::builder(mgr)
            .max_size(pool_config.max_size)
            .runtime(Runtime::Tokio1)
            .wait_timeout(pool_config.acquire_timeout)
            .create_timeout(pool_config.acquire_timeout)
            .recycle_timeout(pool_config.recycle_timeout)
            .build()
            .map_err(|e| PgError::config(format!("failed to create pool: {}", e)))?;

        info!(
            url = %config.redacted_url(),
            max_size = pool_config.max_size,
            "PostgreSQL pool created"
        );

        Ok(Self {
            inner: pool,
            config: Arc::new(config),
        })
    }

    /// Acquire a session.
    pub async fn get(&self) -> PgResult<PgConnection> {
        debug!("Acquiring connection from pool");
        let client = self.inner.get().await?;
        Ok(PgConnection::new(client))
    }

    /// Connection settings the pool was built from.
    pub fn config(&self) -> &PgConfig {
        &self.config
    }

    /// Most sessions the pool will open.
    pub fn max_size(&self) -> usize {
        self.inner.status().max_size
    }
}

#[async_trait]
impl Connector for PgPool {
    type Connection = PgConnection;

    async fn connect(&self) -> Result<PgConnection, DbError> {
        self.get().await.map_err(DbError::from)
    }
}
