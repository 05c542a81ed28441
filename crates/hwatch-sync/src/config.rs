use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use hwatch_notify::NotificationTarget;
use hwatch_storage::FetchConfig;
use redis::{ConnectionAddr, ConnectionInfo, IntoConnectionInfo, RedisConnectionInfo};
use serde::Deserialize;
use sqlx::postgres::PgConnectOptions;

use crate::sources::{source_for_id, SourceDescriptor};

const CONFIG_ENV: &str = "HWATCH_CONFIG";
const DEFAULT_CONFIG_PATH: &str = "config.yaml";
const DEFAULT_REDIS_PORT: u16 = 6379;

#[derive(Debug, Clone, Deserialize)]
pub struct WatchConfig {
    pub database: DatabaseConfig,
    #[serde(alias = "keystore")]
    pub redis: RedisConfig,
    #[serde(default)]
    pub webhook: Vec<String>,
    #[serde(default = "default_sources")]
    pub sources: Vec<String>,
    #[serde(default)]
    pub http: HttpSettings,
    #[serde(default)]
    pub artifacts_dir: Option<PathBuf>,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub web: WebConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub host: String,
    #[serde(default = "default_pg_port")]
    pub port: u16,
    pub user: String,
    #[serde(default)]
    pub password: String,
    pub dbname: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RedisConfig {
    /// `host:port`
    pub address: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub db: i64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HttpSettings {
    pub connect_timeout_secs: u64,
    pub fetch_timeout_secs: u64,
    pub delivery_timeout_secs: u64,
    pub user_agent: Option<String>,
}

impl Default for HttpSettings {
    fn default() -> Self {
        Self {
            connect_timeout_secs: 5,
            fetch_timeout_secs: 20,
            delivery_timeout_secs: 10,
            user_agent: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub cron: String,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            cron: "0 0 13 * * *".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WebConfig {
    pub port: u16,
}

impl Default for WebConfig {
    fn default() -> Self {
        Self { port: 3000 }
    }
}

fn default_sources() -> Vec<String> {
    vec!["cases".to_string(), "surveys".to_string()]
}

fn default_pg_port() -> u16 {
    5432
}

impl WatchConfig {
    /// Path from `--config`, then `HWATCH_CONFIG`, then `./config.yaml`.
    pub fn resolve_path(explicit: Option<PathBuf>) -> PathBuf {
        explicit
            .or_else(|| std::env::var(CONFIG_ENV).ok().map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH))
    }

    pub async fn load(path: &Path) -> Result<Self> {
        let text = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn from_yaml_str(text: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        for id in &self.sources {
            if source_for_id(id).is_none() {
                bail!("unknown source {id:?} in config");
            }
        }
        for url in &self.webhook {
            if !(url.starts_with("https://") || url.starts_with("http://")) {
                bail!("webhook entries must be http(s) URLs");
            }
        }
        Ok(())
    }

    /// `DATABASE_URL`, when set, replaces the `database` section.
    pub fn connect_options(&self) -> Result<PgConnectOptions> {
        self.connect_options_with(std::env::var("DATABASE_URL").ok())
    }

    fn connect_options_with(&self, database_url: Option<String>) -> Result<PgConnectOptions> {
        if let Some(url) = database_url {
            return PgConnectOptions::from_str(&url).context("parsing DATABASE_URL");
        }
        let db = &self.database;
        let mut options = PgConnectOptions::new()
            .host(&db.host)
            .port(db.port)
            .username(&db.user)
            .database(&db.dbname);
        if !db.password.is_empty() {
            options = options.password(&db.password);
        }
        Ok(options)
    }

    /// `REDIS_URL`, when set, replaces the `redis` section.
    pub fn redis_connection_info(&self) -> Result<ConnectionInfo> {
        self.redis_connection_info_with(std::env::var("REDIS_URL").ok())
    }

    fn redis_connection_info_with(&self, redis_url: Option<String>) -> Result<ConnectionInfo> {
        match redis_url {
            Some(url) => url.into_connection_info().context("parsing REDIS_URL"),
            None => self.redis.connection_info(),
        }
    }

    pub fn targets(&self) -> Vec<NotificationTarget> {
        self.webhook.iter().map(NotificationTarget::new).collect()
    }

    /// Configured sources, or only `only` when given.
    pub fn selected_sources(&self, only: Option<&str>) -> Result<Vec<SourceDescriptor>> {
        match only {
            Some(id) => source_for_id(id)
                .map(|source| vec![source])
                .with_context(|| format!("unknown source {id:?}")),
            None => Ok(self.sources.iter().filter_map(|id| source_for_id(id)).collect()),
        }
    }

    pub fn fetch_config(&self) -> FetchConfig {
        FetchConfig {
            connect_timeout: Duration::from_secs(self.http.connect_timeout_secs),
            timeout: Duration::from_secs(self.http.fetch_timeout_secs),
            user_agent: self.http.user_agent.clone(),
        }
    }

    pub fn delivery_timeout(&self) -> Duration {
        Duration::from_secs(self.http.delivery_timeout_secs)
    }
}

impl RedisConfig {
    /// Structured, so passwords need no URL escaping.
    pub fn connection_info(&self) -> Result<ConnectionInfo> {
        let (host, port) = match self.address.rsplit_once(':') {
            Some((host, port)) => (
                host,
                port.parse()
                    .with_context(|| format!("invalid redis port in {:?}", self.address))?,
            ),
            None => (self.address.as_str(), DEFAULT_REDIS_PORT),
        };
        Ok(ConnectionInfo {
            addr: ConnectionAddr::Tcp(host.to_string(), port),
            redis: RedisConnectionInfo {
                db: self.db,
                password: (!self.password.is_empty()).then(|| self.password.clone()),
                ..RedisConnectionInfo::default()
            },
        })
    }
}
