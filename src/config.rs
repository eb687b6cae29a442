use async_trait::async_trait;
use std::collections::BTreeMap;
use std::env;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

use anyhow::{Context, Result, bail};

/// Where settings come from. Keys are environment-style names.
#[async_trait]
pub trait ConfigSource: Send + Sync {
    async fn get(&self, key: &str) -> Option<String>;
}

/// Typed access to a [`ConfigSource`]. Blank values count as unset.
pub struct ConfigManager(pub Box<dyn ConfigSource>);

impl ConfigManager {
    async fn get(&self, key: &str) -> Option<String> {
        self.0.get(key).await.filter(|value| !value.trim().is_empty())
    }

    async fn parse_or<T>(&self, key: &str, default: T) -> Result<T>
    where
        T: std::str::FromStr,
        T::Err: std::fmt::Display,
    {
        match self.get(key).await {
            None => Ok(default),
            Some(raw) => raw
                .trim()
                .parse()
                .map_err(|e| anyhow::anyhow!("{key}={raw}: {e}")),
        }
    }

    async fn millis_or(&self, key: &str, default: u64) -> Result<Duration> {
        Ok(Duration::from_millis(self.parse_or(key, default).await?))
    }

    async fn pairs(&self, key: &str) -> Result<BTreeMap<String, String>> {
        match self.get(key).await {
            None => Ok(BTreeMap::new()),
            Some(raw) => parse_pairs(&raw).with_context(|| format!("parsing {key}")),
        }
    }
}

/// The process environment. Variables from `env_file` fill in whatever the
/// environment does not already set.
#[derive(Debug, Default)]
pub struct EnvConfig;

impl EnvConfig {
    pub fn load(env_file: &Path) -> Box<Self> {
        if env_file.exists() {
            match dotenvy::from_path(env_file) {
                Ok(()) => info!("Loaded .env from {}", env_file.display()),
                Err(err) => warn!(file = %env_file.display(), error = %err, "ignoring unreadable env file"),
            }
        }
        Box::new(Self)
    }
}

#[async_trait]
impl ConfigSource for EnvConfig {
    async fn get(&self, key: &str) -> Option<String> {
        env::var(key).ok()
    }
}

/// Fixed settings, for tests and embedding.
#[derive(Debug, Default)]
pub struct MapConfig {
    map: BTreeMap<String, String>,
}

impl MapConfig {
    pub fn new() -> Box<Self> {
        Box::new(Self::default())
    }

    pub fn with(mut self: Box<Self>, key: &str, value: &str) -> Box<Self> {
        self.map.insert(key.to_string(), value.to_string());
        self
    }
}

#[async_trait]
impl ConfigSource for MapConfig {
    async fn get(&self, key: &str) -> Option<String> {
        self.map.get(key).cloned()
    }
}

/// Parses `key=value,key=value`. Whitespace around either side is ignored.
pub fn parse_pairs(raw: &str) -> Result<BTreeMap<String, String>> {
    let mut pairs = BTreeMap::new();
    for item in raw.split(',').map(str::trim).filter(|item| !item.is_empty()) {
        let Some((key, value)) = item.split_once('=') else {
            bail!("expected key=value, got `{item}`");
        };
        let (key, value) = (key.trim(), value.trim());
        if key.is_empty() {
            bail!("empty key in `{item}`");
        }
        pairs.insert(key.to_string(), value.to_string());
    }
    Ok(pairs)
}

// -----------------------------------------------------------------------------
// Server
// -----------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen: SocketAddr,
    pub state_dir: PathBuf,
    /// Liveness window for worker and client connections.
    pub connection_timeout: Duration,
    /// token -> user
    pub client_tokens: BTreeMap<String, String>,
    /// token -> worker name
    pub worker_tokens: BTreeMap<String, String>,
    /// binary name -> file loaded for the worker health check
    pub healthcheck_binaries: BTreeMap<String, PathBuf>,
    pub healthcheck_cooldown: Duration,
    pub session_timeout: Duration,
    pub finished_ttl: Duration,
}

impl ServerConfig {
    pub async fn load(config: &ConfigManager) -> Result<Self> {
        let listen = config
            .get("CLOUDTITAN_LISTEN")
            .await
            .unwrap_or_else(|| "0.0.0.0:8080".to_string());
        let listen = listen
            .parse()
            .with_context(|| format!("CLOUDTITAN_LISTEN={listen} is not a socket address"))?;
        let state_dir = config
            .get("CLOUDTITAN_STATE_DIR")
            .await
            .unwrap_or_else(|| "state".to_string());
        let client_tokens = config.pairs("CLOUDTITAN_CLIENT_TOKENS").await?;
        let worker_tokens = config.pairs("CLOUDTITAN_WORKER_TOKENS").await?;
        if worker_tokens.is_empty() {
            warn!("CLOUDTITAN_WORKER_TOKENS is empty, no worker will be able to connect");
        }
        let healthcheck_binaries = config
            .pairs("CLOUDTITAN_HEALTHCHECK_BINARIES")
            .await?
            .into_iter()
            .map(|(name, path)| (name, PathBuf::from(path)))
            .collect();

        Ok(Self {
            listen,
            state_dir: PathBuf::from(state_dir),
            connection_timeout: config.millis_or("CLOUDTITAN_WORKER_TIMEOUT_MS", 30_000).await?,
            client_tokens,
            worker_tokens,
            healthcheck_binaries,
            healthcheck_cooldown: config
                .millis_or("CLOUDTITAN_HEALTHCHECK_COOLDOWN_MS", 300_000)
                .await?,
            session_timeout: config.millis_or("CLOUDTITAN_SESSION_TIMEOUT_MS", 300_000).await?,
            finished_ttl: Duration::from_secs(
                config.parse_or("CLOUDTITAN_FINISHED_TTL_SECS", 3600).await?,
            ),
        })
    }
}

// -----------------------------------------------------------------------------
// Worker
// -----------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Server base address, e.g. `ws://localhost:8080`.
    pub host: String,
    pub auth_token: Option<String>,
    /// Program that drives the device; invoked as `<tool> <args..> <command> <file>`.
    pub tool: String,
    pub tool_args: Vec<String>,
    pub workdir: PathBuf,
    pub default_bitstream: Option<PathBuf>,
    pub link_timeout: Duration,
}

impl WorkerConfig {
    pub async fn load(config: &ConfigManager) -> Result<Self> {
        let Some(host) = config.get("CLOUDTITAN_HOST").await else {
            bail!("CLOUDTITAN_HOST is not set");
        };
        let tool_args = config
            .get("CLOUDTITAN_TOOL_ARGS")
            .await
            .map(|raw| raw.split_whitespace().map(str::to_owned).collect())
            .unwrap_or_default();
        let workdir = match config.get("CLOUDTITAN_WORKDIR").await {
            Some(dir) => PathBuf::from(dir),
            None => env::temp_dir().join("cloudtitan-worker"),
        };

        Ok(Self {
            host,
            auth_token: config.get("CLOUDTITAN_AUTH_TOKEN").await,
            tool: config
                .get("CLOUDTITAN_TOOL")
                .await
                .unwrap_or_else(|| "titan-tool".to_string()),
            tool_args,
            workdir,
            default_bitstream: config.get("CLOUDTITAN_DEFAULT_BITSTREAM").await.map(PathBuf::from),
            link_timeout: config.millis_or("CLOUDTITAN_LINK_TIMEOUT_MS", 60_000).await?,
        })
    }
}

// -----------------------------------------------------------------------------
// Client
// -----------------------------------------------------------------------------

/// Where the command line client connects. Shares keys with the worker.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub host: Option<String>,
    pub auth_token: Option<String>,
    pub timeout: Duration,
}

impl ClientConfig {
    pub async fn load(config: &ConfigManager) -> Result<Self> {
        Ok(Self {
            host: config.get("CLOUDTITAN_HOST").await,
            auth_token: config.get("CLOUDTITAN_AUTH_TOKEN").await,
            timeout: config.millis_or("CLOUDTITAN_LINK_TIMEOUT_MS", 30_000).await?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::write;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_map_config_later_values_win() {
        let config = MapConfig::new().with("foo", "bar").with("foo", "baz");
        assert_eq!(config.get("foo").await, Some("baz".to_string()));
        assert_eq!(config.get("missing").await, None);
    }

    #[tokio::test]
    async fn test_blank_values_count_as_unset() {
        let config = ConfigManager(
            MapConfig::new()
                .with("CLOUDTITAN_HOST", "  ")
                .with("CLOUDTITAN_LINK_TIMEOUT_MS", ""),
        );
        let client = ClientConfig::load(&config).await.unwrap();
        assert!(client.host.is_none());
        assert_eq!(client.timeout, Duration::from_secs(30));
    }

    #[tokio::test]
    async fn test_env_config_reads_env_file() {
        let dir = tempdir().unwrap();
        let env_path = dir.path().join(".env");
        write(&env_path, "CLOUDTITAN_TEST_FROM_FILE=abc123\n").unwrap();

        let config = EnvConfig::load(&env_path);
        assert_eq!(
            config.get("CLOUDTITAN_TEST_FROM_FILE").await,
            Some("abc123".to_string())
        );
        assert_eq!(config.get("CLOUDTITAN_TEST_NEVER_SET").await, None);
    }

    #[tokio::test]
    async fn test_missing_env_file_is_fine() {
        let dir = tempdir().unwrap();
        let config = ConfigManager(EnvConfig::load(&dir.path().join("absent.env")));
        assert!(ClientConfig::load(&config).await.is_ok());
    }

    #[test]
    fn test_parse_pairs() {
        let pairs = parse_pairs(" t1 = alice,t2=bob ,, ").unwrap();
        assert_eq!(pairs.get("t1").map(String::as_str), Some("alice"));
        assert_eq!(pairs.get("t2").map(String::as_str), Some("bob"));
        assert!(parse_pairs("nonsense").is_err());
        assert!(parse_pairs("=x").is_err());
    }

    #[tokio::test]
    async fn test_server_config_defaults() {
        let config = ConfigManager(MapConfig::new());
        let server = ServerConfig::load(&config).await.unwrap();
        assert_eq!(server.listen, "0.0.0.0:8080".parse().unwrap());
        assert_eq!(server.state_dir, PathBuf::from("state"));
        assert_eq!(server.connection_timeout, Duration::from_secs(30));
        assert_eq!(server.healthcheck_cooldown, Duration::from_secs(300));
        assert_eq!(server.session_timeout, Duration::from_secs(300));
        assert_eq!(server.finished_ttl, Duration::from_secs(3600));
        assert!(server.client_tokens.is_empty());
    }

    #[tokio::test]
    async fn test_server_config_overrides() {
        let config = ConfigManager(
            MapConfig::new()
                .with("CLOUDTITAN_LISTEN", "127.0.0.1:9000")
                .with("CLOUDTITAN_CLIENT_TOKENS", "abc=alice")
                .with("CLOUDTITAN_HEALTHCHECK_BINARIES", "fw.bin=/srv/fw.bin")
                .with("CLOUDTITAN_SESSION_TIMEOUT_MS", "1500"),
        );
        let server = ServerConfig::load(&config).await.unwrap();
        assert_eq!(server.listen.port(), 9000);
        assert_eq!(server.client_tokens.get("abc").map(String::as_str), Some("alice"));
        assert_eq!(
            server.healthcheck_binaries.get("fw.bin"),
            Some(&PathBuf::from("/srv/fw.bin"))
        );
        assert_eq!(server.session_timeout, Duration::from_millis(1500));
    }

    #[tokio::test]
    async fn test_bad_numbers_are_reported() {
        let config = ConfigManager(MapConfig::new().with("CLOUDTITAN_SESSION_TIMEOUT_MS", "soon"));
        let err = ServerConfig::load(&config).await.unwrap_err();
        assert!(err.to_string().contains("CLOUDTITAN_SESSION_TIMEOUT_MS"));
    }

    #[tokio::test]
    async fn test_worker_config_requires_host() {
        let config = ConfigManager(MapConfig::new());
        assert!(WorkerConfig::load(&config).await.is_err());

        let config = ConfigManager(
            MapConfig::new()
                .with("CLOUDTITAN_HOST", "ws://localhost:8080")
                .with("CLOUDTITAN_TOOL_ARGS", "--port  /dev/ttyUSB0"),
        );
        let worker = WorkerConfig::load(&config).await.unwrap();
        assert_eq!(worker.tool_args, vec!["--port", "/dev/ttyUSB0"]);
        assert_eq!(worker.link_timeout, Duration::from_secs(60));
        assert!(worker.default_bitstream.is_none());
    }

    #[tokio::test]
    async fn test_client_config_is_optional() {
        let config = ConfigManager(MapConfig::new());
        let client = ClientConfig::load(&config).await.unwrap();
        assert!(client.host.is_none());
        assert_eq!(client.timeout, Duration::from_secs(30));

        let config = ConfigManager(MapConfig::new().with("CLOUDTITAN_AUTH_TOKEN", "abc"));
        let client = ClientConfig::load(&config).await.unwrap();
        assert_eq!(client.auth_token.as_deref(), Some("abc"));
    }
}
