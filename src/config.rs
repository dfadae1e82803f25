//! TOML configuration.
//!
//! One file drives every command. See `config/kbsync.example.toml`.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Environment variable that overrides `remote.secret`.
pub const SECRET_ENV: &str = "KBSYNC_SECRET";

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    pub remote: RemoteConfig,
    pub scan: ScanConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

/// Credentials and endpoint of the knowledge-base service.
#[derive(Deserialize, Clone)]
pub struct RemoteConfig {
    pub base_url: String,
    /// Sent as `App-Id` and as `appkey` in the token request.
    pub access_key: String,
    #[serde(default)]
    pub secret: String,
    pub tenant_id: String,
    pub user_id: String,
    pub workspace_id: String,
    #[serde(default)]
    pub workspace: Option<String>,
    /// Used when a token cannot be fetched. Unset means token failures are fatal.
    #[serde(default)]
    pub fallback_token: Option<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

// Hand-written so that the secret and fallback token never reach the logs.
impl std::fmt::Debug for RemoteConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteConfig")
            .field("base_url", &self.base_url)
            .field("access_key", &self.access_key)
            .field("secret", &"<redacted>")
            .field("tenant_id", &self.tenant_id)
            .field("user_id", &self.user_id)
            .field("workspace_id", &self.workspace_id)
            .field("workspace", &self.workspace)
            .field("fallback_token", &self.fallback_token.as_ref().map(|_| "<redacted>"))
            .field("timeout_secs", &self.timeout_secs)
            .finish()
    }
}

fn default_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct ScanConfig {
    /// Root holding `<year>/<month>/` folders.
    pub dir: PathBuf,
    pub backup_dir: PathBuf,
    pub cache_dir: PathBuf,
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
    #[serde(default = "default_true")]
    pub cache_enabled: bool,
    #[serde(default = "default_extensions")]
    pub supported_extensions: Vec<String>,
    #[serde(default = "default_clean_days")]
    pub clean_days: u32,
    #[serde(default = "default_max_files_per_kb")]
    pub max_files_per_kb: usize,
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    /// Also upload each file to a `<region>数据源` knowledge base when its
    /// name carries a province/region.
    #[serde(default = "default_true")]
    pub region_groups: bool,
    /// Merge a folder's files into one document before uploading.
    #[serde(default)]
    pub merge: bool,
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("./merged")
}
fn default_true() -> bool {
    true
}
fn default_extensions() -> Vec<String> {
    vec!["docx".to_string(), "doc".to_string(), "txt".to_string()]
}
fn default_clean_days() -> u32 {
    30
}
fn default_max_files_per_kb() -> usize {
    100
}
fn default_interval_secs() -> u64 {
    3600
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:7340".to_string()
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let mut config: Config =
        toml::from_str(&content).with_context(|| "Failed to parse config file")?;

    if let Ok(secret) = std::env::var(SECRET_ENV) {
        if !secret.is_empty() {
            config.remote.secret = secret;
        }
    }

    validate(&config)?;
    Ok(config)
}

pub fn validate(config: &Config) -> Result<()> {
    if config.remote.base_url.trim().is_empty() {
        bail!("remote.base_url must not be empty");
    }
    if config.remote.access_key.is_empty() {
        bail!("remote.access_key must not be empty");
    }
    if config.remote.secret.is_empty() {
        bail!(
            "remote.secret must be set in the config file or via {}",
            SECRET_ENV
        );
    }
    if config.scan.max_files_per_kb == 0 {
        bail!("scan.max_files_per_kb must be > 0");
    }
    if config.scan.interval_secs == 0 {
        bail!("scan.interval_secs must be > 0");
    }
    if config.scan.supported_extensions.is_empty() {
        bail!("scan.supported_extensions must list at least one extension");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
[db]
path = "/tmp/kbsync.sqlite"

[remote]
base_url = "http://127.0.0.1:9"
access_key = "ak"
secret = "sk"
tenant_id = "t"
user_id = "u"
workspace_id = "w"

[scan]
dir = "/tmp/inbox"
backup_dir = "/tmp/backup"
cache_dir = "/tmp/cache"
"#;

    #[test]
    fn test_defaults_applied() {
        let cfg: Config = toml::from_str(MINIMAL).unwrap();
        assert!(cfg.scan.cache_enabled);
        assert!(cfg.scan.region_groups);
        assert!(!cfg.scan.merge);
        assert_eq!(cfg.scan.supported_extensions, vec!["docx", "doc", "txt"]);
        assert_eq!(cfg.scan.clean_days, 30);
        assert_eq!(cfg.scan.max_files_per_kb, 100);
        assert_eq!(cfg.remote.timeout_secs, 30);
        assert!(cfg.remote.fallback_token.is_none());
        assert_eq!(cfg.server.bind, "127.0.0.1:7340");
        validate(&cfg).unwrap();
    }

    #[test]
    fn test_zero_ceiling_rejected() {
        let mut cfg: Config = toml::from_str(MINIMAL).unwrap();
        cfg.scan.max_files_per_kb = 0;
        assert!(validate(&cfg).is_err());
    }

    #[test]
    fn test_missing_secret_rejected() {
        let mut cfg: Config = toml::from_str(MINIMAL).unwrap();
        cfg.remote.secret.clear();
        let err = validate(&cfg).unwrap_err().to_string();
        assert!(err.contains(SECRET_ENV));
    }

    #[test]
    fn test_debug_redacts_secret() {
        let cfg: Config = toml::from_str(MINIMAL).unwrap();
        let rendered = format!("{:?}", cfg.remote);
        assert!(!rendered.contains("\"sk\""));
        assert!(rendered.contains("<redacted>"));
    }
}
