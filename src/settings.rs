use std::fmt;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use config::{builder::DefaultState, ConfigBuilder, Environment, File};
use scraper::Selector;
use serde::Deserialize;
use tracing::warn;
use url::Url;

const ENV_PREFIX: &str = "NABORY";
const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (compatible; NaboryBot/1.0)";

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub check_interval_minutes: u64,
    #[serde(default)]
    pub targets: Vec<Target>,
    #[serde(default)]
    pub email: EmailConfig,
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub render: RenderConfig,
    #[serde(default)]
    pub state: StateConfig,
    #[serde(default)]
    pub health: HealthConfig,
}

/// One page to monitor. Immutable after load.
#[derive(Debug, Clone, Deserialize)]
pub struct Target {
    pub name: String,
    pub url: Url,
    pub base_url: Url,
    pub selector: String,
    #[serde(default)]
    pub fetch_mode: FetchMode,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FetchMode {
    #[default]
    Http,
    /// Page content is populated by client-side scripts and must be rendered.
    Render,
}

impl fmt::Display for FetchMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FetchMode::Http => f.pad("http"),
            FetchMode::Render => f.pad("render"),
        }
    }
}

#[derive(Clone, Deserialize)]
pub struct EmailConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub smtp_server: Option<String>,
    #[serde(default = "default_smtp_port")]
    pub smtp_port: u16,
    #[serde(default)]
    pub sender_email: Option<String>,
    #[serde(default)]
    pub sender_password: Option<String>,
    #[serde(default)]
    pub recipient_email: Option<String>,
    #[serde(default = "default_true")]
    pub starttls: bool,
    #[serde(default = "default_subject_prefix")]
    pub subject_prefix: String,
}

impl Default for EmailConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            smtp_server: None,
            smtp_port: default_smtp_port(),
            sender_email: None,
            sender_password: None,
            recipient_email: None,
            starttls: true,
            subject_prefix: default_subject_prefix(),
        }
    }
}

// Password is masked so the config can be logged at debug level.
impl fmt::Debug for EmailConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EmailConfig")
            .field("enabled", &self.enabled)
            .field("smtp_server", &self.smtp_server)
            .field("smtp_port", &self.smtp_port)
            .field("sender_email", &self.sender_email)
            .field("sender_password", &self.sender_password.as_ref().map(|_| "***"))
            .field("recipient_email", &self.recipient_email)
            .field("starttls", &self.starttls)
            .field("subject_prefix", &self.subject_prefix)
            .finish()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct HttpConfig {
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            user_agent: default_user_agent(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

#[derive(Clone, Default, Deserialize)]
pub struct RenderConfig {
    #[serde(default)]
    pub api_key: Option<String>,
}

impl RenderConfig {
    /// Configured key, or `SPIDER_API_KEY` from the environment.
    pub fn resolve_api_key(&self) -> Option<String> {
        self.api_key
            .clone()
            .or_else(|| std::env::var("SPIDER_API_KEY").ok())
            .filter(|k| !k.trim().is_empty())
    }
}

impl fmt::Debug for RenderConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RenderConfig")
            .field("api_key", &self.api_key.as_ref().map(|_| "***"))
            .finish()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StateBackendKind {
    #[default]
    Json,
    Sqlite,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StateConfig {
    #[serde(default)]
    pub backend: StateBackendKind,
    #[serde(default = "default_state_path")]
    pub path: PathBuf,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            backend: StateBackendKind::default(),
            path: default_state_path(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct HealthConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_health_path")]
    pub path: String,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind: default_bind(),
            port: default_port(),
            path: default_health_path(),
        }
    }
}

impl HealthConfig {
    pub fn addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }
}

fn default_true() -> bool {
    true
}
fn default_smtp_port() -> u16 {
    587
}
fn default_subject_prefix() -> String {
    "New listings".to_string()
}
fn default_user_agent() -> String {
    DEFAULT_USER_AGENT.to_string()
}
fn default_timeout_secs() -> u64 {
    15
}
fn default_state_path() -> PathBuf {
    PathBuf::from("seen_items.json")
}
fn default_bind() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    8080
}
fn default_health_path() -> String {
    "/".to_string()
}

/// Load the config file, layer `NABORY_*` environment overrides on top and validate.
///
/// `PORT` (injected by most hosting platforms) wins over `health.port`.
pub fn load(path: &Path) -> Result<AppConfig> {
    let builder = config::Config::builder()
        .add_source(File::from(path).required(true))
        .add_source(
            Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

    let mut cfg = build(builder).with_context(|| format!("Failed to load config {:?}", path))?;

    if let Ok(port) = std::env::var("PORT") {
        cfg.health.port = port
            .trim()
            .parse()
            .with_context(|| format!("PORT is not a valid port number: {:?}", port))?;
    }

    Ok(cfg)
}

fn build(builder: ConfigBuilder<DefaultState>) -> Result<AppConfig> {
    let cfg: AppConfig = builder.build()?.try_deserialize()?;
    cfg.validate()?;
    Ok(cfg)
}

impl AppConfig {
    pub fn validate(&self) -> Result<()> {
        if self.check_interval_minutes == 0 {
            bail!("check_interval_minutes must be greater than zero");
        }
        if self.http.timeout_secs == 0 {
            bail!("http.timeout_secs must be greater than zero");
        }
        if self.targets.is_empty() {
            warn!("No targets configured; passes will be empty");
        }

        for (idx, target) in self.targets.iter().enumerate() {
            if target.name.trim().is_empty() {
                bail!("targets[{}]: name must not be empty", idx);
            }
            if let Err(e) = Selector::parse(&target.selector) {
                bail!(
                    "targets[{}] ({}): invalid selector {:?}: {}",
                    idx,
                    target.name,
                    target.selector,
                    e
                );
            }
            if target.base_url.cannot_be_a_base() {
                bail!(
                    "targets[{}] ({}): base_url {} cannot be used to resolve links",
                    idx,
                    target.name,
                    target.base_url
                );
            }
        }

        if self.email.enabled {
            let required = [
                ("email.smtp_server", &self.email.smtp_server),
                ("email.sender_email", &self.email.sender_email),
                ("email.recipient_email", &self.email.recipient_email),
            ];
            for (field, value) in required {
                if value.as_deref().map_or(true, |v| v.trim().is_empty()) {
                    bail!("{} is required when email is enabled", field);
                }
            }
        }

        if self.needs_render() && self.render.resolve_api_key().is_none() {
            bail!("render.api_key (or SPIDER_API_KEY) is required for targets with fetch_mode = \"render\"");
        }

        if !self.health.path.starts_with('/') {
            bail!("health.path must start with '/'");
        }

        Ok(())
    }

    pub fn needs_render(&self) -> bool {
        self.targets.iter().any(|t| t.fetch_mode == FetchMode::Render)
    }

    pub fn check_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.check_interval_minutes * 60)
    }
}

#[cfg(test)]
pub(crate) fn target(name: &str, url: &str, selector: &str) -> Target {
    Target {
        name: name.to_string(),
        url: Url::parse(url).unwrap(),
        base_url: Url::parse(url).unwrap(),
        selector: selector.to_string(),
        fetch_mode: FetchMode::Http,
    }
}
