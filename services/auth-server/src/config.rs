//! Configuration types and loading
//!
//! Config precedence: CLI args > env vars > config file > defaults.
//! Secrets (the server key and the signing key PEM) are read from env vars or
//! files named in the config, never from the TOML itself.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use common::{Secret, resolve_secret};
use serde::Deserialize;
use stack_auth::TokenPolicy;

const DAY_SECS: u64 = 24 * 60 * 60;

/// Root configuration
#[derive(Debug, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    #[serde(default)]
    pub tokens: TokensConfig,
    #[serde(default)]
    pub keys: KeysConfig,
    #[serde(default)]
    pub cli_login: CliLoginConfig,
    /// From `STACK_SECRET_SERVER_KEY` or `server.secret_server_key_file`
    #[serde(skip)]
    pub secret_server_key: Option<Secret<String>>,
    /// PKCS#8 PEM from `STACK_SIGNING_KEY` or `keys.signing_key_file`
    #[serde(skip)]
    pub signing_key_pem: Option<Secret<String>>,
}

/// HTTP listener settings
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    /// Public base URL; token issuers are derived from it
    pub api_url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    #[serde(default)]
    pub secret_server_key_file: Option<PathBuf>,
}

/// Token lifetimes
#[derive(Debug, Deserialize)]
pub struct TokensConfig {
    #[serde(default = "default_access_ttl")]
    pub access_ttl_secs: u64,
    #[serde(default = "default_refresh_ttl")]
    pub refresh_ttl_secs: u64,
    #[serde(default = "default_max_access_ttl")]
    pub max_access_ttl_secs: u64,
    #[serde(default = "default_refresh_ttl")]
    pub max_refresh_ttl_secs: u64,
}

impl Default for TokensConfig {
    fn default() -> Self {
        Self {
            access_ttl_secs: default_access_ttl(),
            refresh_ttl_secs: default_refresh_ttl(),
            max_access_ttl_secs: default_max_access_ttl(),
            max_refresh_ttl_secs: default_refresh_ttl(),
        }
    }
}

impl TokensConfig {
    pub fn policy(&self) -> TokenPolicy {
        TokenPolicy {
            access_ttl: Duration::from_secs(self.access_ttl_secs),
            refresh_ttl: Duration::from_secs(self.refresh_ttl_secs),
            max_access_ttl: Duration::from_secs(self.max_access_ttl_secs),
            max_refresh_ttl: Duration::from_secs(self.max_refresh_ttl_secs),
        }
    }
}

/// Signing key lifecycle
#[derive(Debug, Deserialize)]
pub struct KeysConfig {
    #[serde(default = "default_rotation_interval")]
    pub rotation_interval_secs: u64,
    /// How long a retired key keeps verifying; defaults to the max refresh ttl
    #[serde(default)]
    pub grace_period_secs: Option<u64>,
    #[serde(default)]
    pub signing_key_file: Option<PathBuf>,
}

impl Default for KeysConfig {
    fn default() -> Self {
        Self {
            rotation_interval_secs: default_rotation_interval(),
            grace_period_secs: None,
            signing_key_file: None,
        }
    }
}

/// CLI login handshake
#[derive(Debug, Deserialize)]
pub struct CliLoginConfig {
    #[serde(default = "default_login_expiry")]
    pub expiry_secs: u64,
    /// Browser page that confirms a login code; defaults to
    /// `{api_url}/handler/cli-auth-confirm`
    #[serde(default)]
    pub confirm_url: Option<String>,
}

impl Default for CliLoginConfig {
    fn default() -> Self {
        Self {
            expiry_secs: default_login_expiry(),
            confirm_url: None,
        }
    }
}

fn default_max_connections() -> usize {
    1000
}

fn default_access_ttl() -> u64 {
    600
}

fn default_max_access_ttl() -> u64 {
    3600
}

fn default_refresh_ttl() -> u64 {
    365 * DAY_SECS
}

fn default_rotation_interval() -> u64 {
    30 * DAY_SECS
}

fn default_login_expiry() -> u64 {
    300
}

fn is_http_url(url: &str) -> bool {
    url.starts_with("http://") || url.starts_with("https://")
}

impl Config {
    /// Load configuration from a TOML file, validate it, then resolve secrets.
    pub fn load(path: &Path) -> common::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml(&contents)
    }

    pub fn from_toml(contents: &str) -> common::Result<Self> {
        let mut config: Config = toml::from_str(contents)?;
        config.validate()?;

        config.secret_server_key = resolve_secret(
            "STACK_SECRET_SERVER_KEY",
            config.server.secret_server_key_file.as_deref(),
        )?;
        config.signing_key_pem =
            resolve_secret("STACK_SIGNING_KEY", config.keys.signing_key_file.as_deref())?;

        Ok(config)
    }

    fn validate(&self) -> common::Result<()> {
        if !is_http_url(&self.server.api_url) {
            return Err(common::Error::Config(format!(
                "api_url must start with http:// or https://, got: {}",
                self.server.api_url
            )));
        }
        if self.server.max_connections == 0 {
            return Err(common::Error::Config(
                "max_connections must be greater than 0".into(),
            ));
        }

        let t = &self.tokens;
        for (name, value) in [
            ("access_ttl_secs", t.access_ttl_secs),
            ("refresh_ttl_secs", t.refresh_ttl_secs),
            ("max_access_ttl_secs", t.max_access_ttl_secs),
            ("max_refresh_ttl_secs", t.max_refresh_ttl_secs),
            ("rotation_interval_secs", self.keys.rotation_interval_secs),
            ("expiry_secs", self.cli_login.expiry_secs),
        ] {
            if value == 0 {
                return Err(common::Error::Config(format!(
                    "{name} must be greater than 0"
                )));
            }
        }
        if self.keys.grace_period_secs == Some(0) {
            return Err(common::Error::Config(
                "grace_period_secs must be greater than 0".into(),
            ));
        }
        if t.access_ttl_secs > t.max_access_ttl_secs {
            return Err(common::Error::Config(format!(
                "access_ttl_secs ({}) exceeds max_access_ttl_secs ({})",
                t.access_ttl_secs, t.max_access_ttl_secs
            )));
        }
        if t.refresh_ttl_secs > t.max_refresh_ttl_secs {
            return Err(common::Error::Config(format!(
                "refresh_ttl_secs ({}) exceeds max_refresh_ttl_secs ({})",
                t.refresh_ttl_secs, t.max_refresh_ttl_secs
            )));
        }
        if let Some(url) = self.cli_login.confirm_url.as_deref().filter(|u| !is_http_url(u)) {
            return Err(common::Error::Config(format!(
                "confirm_url must start with http:// or https://, got: {url}"
            )));
        }
        Ok(())
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_secs(
            self.keys
                .grace_period_secs
                .unwrap_or(self.tokens.max_refresh_ttl_secs),
        )
    }

    pub fn rotation_interval(&self) -> Duration {
        Duration::from_secs(self.keys.rotation_interval_secs)
    }

    pub fn login_expiry(&self) -> Duration {
        Duration::from_secs(self.cli_login.expiry_secs)
    }

    pub fn confirm_url(&self) -> String {
        match &self.cli_login.confirm_url {
            Some(url) => url.clone(),
            None => format!(
                "{}/handler/cli-auth-confirm",
                self.server.api_url.trim_end_matches('/')
            ),
        }
    }

    /// Resolve config file path from CLI arg or CONFIG_PATH env var.
    pub fn resolve_path(cli_path: Option<&str>) -> PathBuf {
        if let Some(p) = cli_path {
            return PathBuf::from(p);
        }
        if let Ok(p) = std::env::var("CONFIG_PATH") {
            return PathBuf::from(p);
        }
        PathBuf::from("stack-auth-server.toml")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Serializes tests that touch process environment variables.
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    /// SAFETY: Callers must hold ENV_MUTEX to prevent concurrent env mutation.
    unsafe fn set_env(key: &str, val: &str) {
        unsafe { std::env::set_var(key, val) };
    }

    unsafe fn remove_env(key: &str) {
        unsafe { std::env::remove_var(key) };
    }

    fn clear_secret_env() {
        unsafe {
            remove_env("STACK_SECRET_SERVER_KEY");
            remove_env("STACK_SIGNING_KEY");
        }
    }

    const MINIMAL: &str = r#"
[server]
listen_addr = "127.0.0.1:8102"
api_url = "https://api.example.com"
"#;

    #[test]
    fn minimal_config_gets_defaults() {
        let _lock = ENV_MUTEX.lock().unwrap();
        clear_secret_env();

        let config = Config::from_toml(MINIMAL).unwrap();
        assert_eq!(config.server.max_connections, 1000);
        assert_eq!(config.tokens.access_ttl_secs, 600);
        assert_eq!(config.tokens.refresh_ttl_secs, 365 * DAY_SECS);
        assert_eq!(config.cli_login.expiry_secs, 300);
        assert_eq!(config.grace_period(), Duration::from_secs(365 * DAY_SECS));
        assert_eq!(
            config.confirm_url(),
            "https://api.example.com/handler/cli-auth-confirm"
        );
        assert!(config.secret_server_key.is_none());
        assert!(config.signing_key_pem.is_none());
    }

    #[test]
    fn shipped_sample_config_is_valid() {
        let _lock = ENV_MUTEX.lock().unwrap();
        clear_secret_env();

        let config =
            Config::from_toml(include_str!("../../../stack-auth-server.toml")).unwrap();
        assert_eq!(config.server.listen_addr.port(), 8102);
        assert_eq!(config.rotation_interval(), Duration::from_secs(30 * DAY_SECS));
    }

    #[test]
    fn full_config_parses() {
        let _lock = ENV_MUTEX.lock().unwrap();
        clear_secret_env();

        let config = Config::from_toml(
            r#"
[server]
listen_addr = "0.0.0.0:8102"
api_url = "https://api.example.com/"
max_connections = 50

[tokens]
access_ttl_secs = 300
max_access_ttl_secs = 900
refresh_ttl_secs = 86400
max_refresh_ttl_secs = 604800

[keys]
rotation_interval_secs = 3600
grace_period_secs = 7200

[cli_login]
expiry_secs = 120
confirm_url = "https://app.example.com/cli"
"#,
        )
        .unwrap();

        let policy = config.tokens.policy();
        assert_eq!(policy.access_ttl, Duration::from_secs(300));
        assert_eq!(policy.max_refresh_ttl, Duration::from_secs(604800));
        assert_eq!(config.grace_period(), Duration::from_secs(7200));
        assert_eq!(config.rotation_interval(), Duration::from_secs(3600));
        assert_eq!(config.login_expiry(), Duration::from_secs(120));
        assert_eq!(config.confirm_url(), "https://app.example.com/cli");
    }

    #[test]
    fn load_missing_file_fails() {
        assert!(Config::load(Path::new("/nonexistent/stack-auth-server.toml")).is_err());
    }

    #[test]
    fn invalid_toml_fails() {
        assert!(Config::from_toml("not valid {{{{ toml").is_err());
    }

    #[test]
    fn api_url_without_scheme_is_rejected() {
        let err = Config::from_toml(
            r#"
[server]
listen_addr = "127.0.0.1:8102"
api_url = "api.example.com"
"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("api_url must start with http"), "got: {err}");
    }

    #[test]
    fn zero_ttl_is_rejected() {
        let err = Config::from_toml(&format!("{MINIMAL}\n[tokens]\naccess_ttl_secs = 0\n"))
            .unwrap_err();
        assert!(err.to_string().contains("access_ttl_secs"), "got: {err}");
    }

    #[test]
    fn default_ttl_above_max_is_rejected() {
        let err = Config::from_toml(&format!(
            "{MINIMAL}\n[tokens]\naccess_ttl_secs = 7200\nmax_access_ttl_secs = 3600\n"
        ))
        .unwrap_err();
        assert!(err.to_string().contains("exceeds"), "got: {err}");
    }

    #[test]
    fn zero_max_connections_is_rejected() {
        let toml = MINIMAL.replace(
            "api_url = \"https://api.example.com\"",
            "api_url = \"https://api.example.com\"\nmax_connections = 0",
        );
        assert!(Config::from_toml(&toml).is_err());
    }

    #[test]
    fn server_key_from_env_overrides_file() {
        let _lock = ENV_MUTEX.lock().unwrap();
        clear_secret_env();
        let dir = tempfile::tempdir().unwrap();
        let key_path = dir.path().join("server_key");
        std::fs::write(&key_path, "ssk-from-file\n").unwrap();
        let toml = format!(
            "{MINIMAL}secret_server_key_file = \"{}\"\n",
            key_path.display()
        );

        let config = Config::from_toml(&toml).unwrap();
        assert_eq!(config.secret_server_key.unwrap().expose(), "ssk-from-file");

        unsafe { set_env("STACK_SECRET_SERVER_KEY", "ssk-from-env") };
        let config = Config::from_toml(&toml).unwrap();
        assert_eq!(config.secret_server_key.unwrap().expose(), "ssk-from-env");
        clear_secret_env();
    }

    #[test]
    fn missing_signing_key_file_is_an_error() {
        let _lock = ENV_MUTEX.lock().unwrap();
        clear_secret_env();
        let toml = format!("{MINIMAL}\n[keys]\nsigning_key_file = \"/nonexistent/signing.pem\"\n");
        assert!(Config::from_toml(&toml).is_err());
    }

    #[test]
    fn resolve_path_precedence() {
        let _lock = ENV_MUTEX.lock().unwrap();
        unsafe { set_env("CONFIG_PATH", "/env/path.toml") };
        assert_eq!(
            Config::resolve_path(Some("/cli/wins.toml")),
            PathBuf::from("/cli/wins.toml")
        );
        assert_eq!(Config::resolve_path(None), PathBuf::from("/env/path.toml"));
        unsafe { remove_env("CONFIG_PATH") };
        assert_eq!(
            Config::resolve_path(None),
            PathBuf::from("stack-auth-server.toml")
        );
    }
}
