//! PostgreSQL connection configuration.

use std::time::Duration;

use crate::error::{PgError, PgResult};

const DEFAULT_PORT: u16 = 5432;
const DEFAULT_USER: &str = "postgres";
const DEFAULT_SCHEMA: &str = "public";
const DEFAULT_APPLICATION_NAME: &str = "pgshield";
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// PostgreSQL connection configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PgConfig {
    /// Host.
    pub host: String,
    /// Port (default: 5432).
    pub port: u16,
    /// Database name.
    pub database: String,
    /// Username.
    pub user: String,
    /// Password.
    pub password: Option<String>,
    /// SSL mode.
    pub ssl_mode: SslMode,
    /// Connection timeout.
    pub connect_timeout: Duration,
    /// Session `statement_timeout`.
    pub statement_timeout: Option<Duration>,
    /// Session `lock_timeout`.
    pub lock_timeout: Option<Duration>,
    /// Application name (shown in pg_stat_activity).
    pub application_name: String,
    /// Schema that introspection reads.
    pub schema: String,
}

/// SSL mode for connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SslMode {
    /// Disable SSL.
    Disable,
    /// Prefer SSL but allow non-SSL.
    #[default]
    Prefer,
    /// Require SSL.
    Require,
}

impl SslMode {
    fn parse(value: &str) -> PgResult<Self> {
        match value {
            "disable" => Ok(Self::Disable),
            "prefer" => Ok(Self::Prefer),
            "require" => Ok(Self::Require),
            other => Err(PgError::config(format!("invalid sslmode: {}", other))),
        }
    }
}

impl PgConfig {
    /// Create a configuration from a database URL.
    ///
    /// Recognised query parameters: `sslmode`, `connect_timeout` (seconds),
    /// `statement_timeout` and `lock_timeout` (milliseconds),
    /// `application_name` and `schema`.
    pub fn from_url(url: &str) -> PgResult<Self> {
        let parsed = url::Url::parse(url)
            .map_err(|e| PgError::config(format!("invalid database URL: {}", e)))?;

        if parsed.scheme() != "postgresql" && parsed.scheme() != "postgres" {
            return Err(PgError::config(format!(
                "invalid scheme: expected 'postgresql' or 'postgres', got '{}'",
                parsed.scheme()
            )));
        }

        let host = parsed
            .host_str()
            .ok_or_else(|| PgError::config("missing host in URL"))?
            .to_string();

        let database = parsed.path().trim_start_matches('/').to_string();
        if database.is_empty() {
            return Err(PgError::config("missing database name in URL"));
        }

        let mut config = Self {
            host,
            port: parsed.port().unwrap_or(DEFAULT_PORT),
            database,
            user: if parsed.username().is_empty() {
                DEFAULT_USER.to_string()
            } else {
                parsed.username().to_string()
            },
            password: parsed.password().map(String::from),
            ssl_mode: SslMode::default(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            statement_timeout: None,
            lock_timeout: None,
            application_name: DEFAULT_APPLICATION_NAME.to_string(),
            schema: DEFAULT_SCHEMA.to_string(),
        };

        for (key, value) in parsed.query_pairs() {
            match key.as_ref() {
                "sslmode" => config.ssl_mode = SslMode::parse(&value)?,
                "connect_timeout" => {
                    config.connect_timeout = Duration::from_secs(parse_number(&key, &value)?)
                }
                "statement_timeout" => {
                    config.statement_timeout =
                        Some(Duration::from_millis(parse_number(&key, &value)?))
                }
                "lock_timeout" => {
                    config.lock_timeout = Some(Duration::from_millis(parse_number(&key, &value)?))
                }
                "application_name" => config.application_name = value.into_owned(),
                "schema" => config.schema = value.into_owned(),
                other => {
                    return Err(PgError::config(format!("unknown URL parameter: {}", other)));
                }
            }
        }

        Ok(config)
    }

    /// Create a builder for configuration.
    pub fn builder() -> PgConfigBuilder {
        PgConfigBuilder::new()
    }

    /// URL with the password masked, for logs.
    pub fn redacted_url(&self) -> String {
        format!(
            "postgresql://{}{}@{}:{}/{}",
            self.user,
            if self.password.is_some() { ":***" } else { "" },
            self.host,
            self.port,
            self.database
        )
    }

    /// Session `-c` options sent at connection startup.
    pub fn session_options(&self) -> Option<String> {
        let mut options = Vec::new();
        if let Some(timeout) = self.statement_timeout {
            options.push(format!("-c statement_timeout={}", timeout.as_millis()));
        }
        if let Some(timeout) = self.lock_timeout {
            options.push(format!("-c lock_timeout={}", timeout.as_millis()));
        }
        if options.is_empty() {
            None
        } else {
            Some(options.join(" "))
        }
    }

    /// Convert to tokio-postgres config.
    pub fn to_pg_config(&self) -> tokio_postgres::Config {
        let mut config = tokio_postgres::Config::new();
        config.host(&self.host);
        config.port(self.port);
        config.dbname(&self.database);
        config.user(&self.user);
        config.application_name(&self.application_name);
        config.connect_timeout(self.connect_timeout);

        if let Some(ref password) = self.password {
            config.password(password);
        }
        if let Some(options) = self.session_options() {
            config.options(&options);
        }

        config
    }
}

fn parse_number(key: &str, value: &str) -> PgResult<u64> {
    value
        .parse()
        .map_err(|_| PgError::config(format!("invalid {}: {}", key, value)))
}

/// Builder for PostgreSQL configuration.
#[derive(Debug, Default)]
pub struct PgConfigBuilder {
    url: Option<String>,
    host: Option<String>,
    port: Option<u16>,
    database: Option<String>,
    user: Option<String>,
    password: Option<String>,
    ssl_mode: Option<SslMode>,
    statement_timeout: Option<Duration>,
    lock_timeout: Option<Duration>,
    schema: Option<String>,
}

impl PgConfigBuilder {
    /// Create a new builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from a database URL.
    pub fn url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    /// Set the host.
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }

    /// Set the port.
    pub fn port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    /// Set the database name.
    pub fn database(mut self, database: impl Into<String>) -> Self {
        self.database = Some(database.into());
        self
    }

    /// Set the username.
    pub fn user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }

    /// Set the password.
    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    /// Set the SSL mode.
    pub fn ssl_mode(mut self, mode: SslMode) -> Self {
        self.ssl_mode = Some(mode);
        self
    }

    /// Set the session statement timeout.
    pub fn statement_timeout(mut self, timeout: Duration) -> Self {
        self.statement_timeout = Some(timeout);
        self
    }

    /// Set the session lock timeout.
    pub fn lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = Some(timeout);
        self
    }

    /// Set the schema introspection reads.
    pub fn schema(mut self, schema: impl Into<String>) -> Self {
        self.schema = Some(schema.into());
        self
    }

    /// Build the configuration. Explicit values override the URL.
    pub fn build(self) -> PgResult<PgConfig> {
        let mut config = match self.url {
            Some(url) => PgConfig::from_url(&url)?,
            None => PgConfig {
                host: "localhost".to_string(),
                port: DEFAULT_PORT,
                database: self
                    .database
                    .clone()
                    .ok_or_else(|| PgError::config("database name is required"))?,
                user: DEFAULT_USER.to_string(),
                password: None,
                ssl_mode: SslMode::default(),
                connect_timeout: DEFAULT_CONNECT_TIMEOUT,
                statement_timeout: None,
                lock_timeout: None,
                application_name: DEFAULT_APPLICATION_NAME.to_string(),
                schema: DEFAULT_SCHEMA.to_string(),
            },
        };

        if let Some(host) = self.host {
            config.host = host;
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(database) = self.database {
            config.database = database;
        }
        if let Some(user) = self.user {
            config.user = user;
        }
        if let Some(password) = self.password {
            config.password = Some(password);
        }
        if let Some(ssl_mode) = self.ssl_mode {
            config.ssl_mode = ssl_mode;
        }
        if let Some(timeout) = self.statement_timeout {
            config.statement_timeout = Some(timeout);
        }
        if let Some(timeout) = self.lock_timeout {
            config.lock_timeout = Some(timeout);
        }
        if let Some(schema) = self.schema {
            config.schema = schema;
        }

        Ok(config)
    }
}
