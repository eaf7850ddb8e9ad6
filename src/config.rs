//! Configuration for the panel proxy.
//!
//! Layers, later wins: built-in defaults, optional YAML file (`--config`), environment.
//! The YAML file supports `$VAR`, `${VAR}`, `${VAR:-default}` via shellexpand.

use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Effective runtime configuration.
#[derive(Debug, Clone, Serialize)]
pub struct Config {
    /// Panel base URL, e.g. `http://panel.example.com`.
    pub panel_host: String,
    /// Path of the HTML login page, appended to `panel_host`.
    pub login_path: String,
    pub panel_user: String,
    #[serde(serialize_with = "redacted")]
    pub panel_pass: String,
    pub bind_address: String,
    pub port: u16,
    /// Timeout for every outbound panel request.
    pub timeout_ms: u64,
    /// Plain-text file holding the raw session cookie.
    pub cookie_file: PathBuf,
    pub log_level: String,
    /// "json" or "pretty".
    pub log_format: Option<String>,
    pub metrics_enabled: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            panel_host: "http://127.0.0.1".to_string(),
            login_path: "/NumberPanel/login".to_string(),
            panel_user: String::new(),
            panel_pass: String::new(),
            bind_address: "0.0.0.0".to_string(),
            port: 3001,
            timeout_ms: 15_000,
            cookie_file: PathBuf::from("session.cookie"),
            log_level: "info".to_string(),
            log_format: None,
            metrics_enabled: false,
        }
    }
}

fn redacted<S: serde::Serializer>(value: &str, s: S) -> Result<S::Ok, S::Error> {
    if value.is_empty() {
        s.serialize_str("")
    } else {
        s.serialize_str("[REDACTED]")
    }
}

/// YAML file shape. Every key is optional; missing keys keep the default.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    #[serde(default)]
    pub panel_host: Option<String>,
    #[serde(default)]
    pub login_path: Option<String>,
    #[serde(default)]
    pub panel_user: Option<String>,
    #[serde(default)]
    pub panel_pass: Option<String>,
    #[serde(default)]
    pub bind_address: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub cookie_file: Option<String>,
    #[serde(default)]
    pub log_level: Option<String>,
    #[serde(default)]
    pub log_format: Option<String>,
    #[serde(default)]
    pub metrics_enabled: Option<bool>,
}

impl Config {
    /// Defaults, then the optional YAML file, then process environment.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let mut config = Config::default();
        if let Some(path) = path {
            let file = load_file(path)?;
            config.apply_file(file);
        }
        config.apply_env(|name| std::env::var(name).ok())?;
        Ok(config)
    }

    fn apply_file(&mut self, file: FileConfig) {
        if let Some(v) = file.panel_host {
            self.panel_host = v;
        }
        if let Some(v) = file.login_path {
            self.login_path = v;
        }
        if let Some(v) = file.panel_user {
            self.panel_user = v;
        }
        if let Some(v) = file.panel_pass {
            self.panel_pass = v;
        }
        if let Some(v) = file.bind_address {
            self.bind_address = v;
        }
        if let Some(v) = file.port {
            self.port = v;
        }
        if let Some(v) = file.timeout_ms {
            self.timeout_ms = v;
        }
        if let Some(v) = file.cookie_file {
            self.cookie_file = PathBuf::from(v);
        }
        if let Some(v) = file.log_level {
            self.log_level = v;
        }
        if file.log_format.is_some() {
            self.log_format = file.log_format;
        }
        if let Some(v) = file.metrics_enabled {
            self.metrics_enabled = v;
        }
    }

    /// Apply env overrides. `lookup` is the env source (injectable for tests).
    /// Empty values are ignored.
    fn apply_env<F>(&mut self, lookup: F) -> anyhow::Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());
        if let Some(v) = get("PANEL_HOST") {
            self.panel_host = v;
        }
        if let Some(v) = get("LOGIN_PATH") {
            self.login_path = v;
        }
        if let Some(v) = get("PANEL_USER") {
            self.panel_user = v;
        }
        if let Some(v) = get("PANEL_PASS") {
            self.panel_pass = v;
        }
        if let Some(v) = get("BIND_ADDRESS") {
            self.bind_address = v;
        }
        if let Some(v) = get("PORT") {
            self.port = parse_env("PORT", &v)?;
        }
        if let Some(v) = get("TIMEOUT_MS") {
            self.timeout_ms = parse_env("TIMEOUT_MS", &v)?;
        }
        if let Some(v) = get("COOKIE_FILE") {
            self.cookie_file = PathBuf::from(v);
        }
        if let Some(v) = get("PANEL_PROXY_LOG_LEVEL") {
            self.log_level = v.trim().to_string();
        }
        if let Some(v) = get("PANEL_PROXY_LOG_FORMAT") {
            self.log_format = Some(v.trim().to_string());
        }
        if let Some(v) = get("METRICS_ENABLED") {
            self.metrics_enabled = parse_bool("METRICS_ENABLED", &v)?;
        }
        Ok(())
    }

    /// Full login page URL: host (without trailing slash) + login path.
    pub fn login_url(&self) -> String {
        join_url(&self.panel_host, &self.login_path)
    }

    /// Base host without trailing slash; downstream data paths are appended to it.
    pub fn panel_base(&self) -> &str {
        self.panel_host.trim_end_matches('/')
    }

    /// Sanity checks for `validate` and server startup.
    pub fn validate(&self) -> anyhow::Result<()> {
        let url = reqwest::Url::parse(&self.panel_host)
            .with_context(|| format!("panel_host is not a valid URL: {:?}", self.panel_host))?;
        if !matches!(url.scheme(), "http" | "https") {
            anyhow::bail!("panel_host must be http or https, got {:?}", url.scheme());
        }
        if self.timeout_ms == 0 {
            anyhow::bail!("timeout_ms must be greater than 0");
        }
        Ok(())
    }
}

fn join_url(host: &str, path: &str) -> String {
    let host = host.trim_end_matches('/');
    if path.is_empty() {
        host.to_string()
    } else if path.starts_with('/') {
        format!("{}{}", host, path)
    } else {
        format!("{}/{}", host, path)
    }
}

fn parse_env<T>(name: &str, value: &str) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    value
        .trim()
        .parse::<T>()
        .with_context(|| format!("env {} has invalid value {:?}", name, value))
}

fn parse_bool(name: &str, value: &str) -> anyhow::Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => anyhow::bail!("env {} has invalid boolean {:?}", name, other),
    }
}

/// Read and parse the YAML file after env expansion.
fn load_file(path: &Path) -> anyhow::Result<FileConfig> {
    let s = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("read config {:?}: {}", path, e))?;
    let expanded = expand_env_vars(&s)?;
    if expanded.trim().is_empty() {
        return Ok(FileConfig::default());
    }
    serde_yaml_ng::from_str(&expanded).map_err(|e| anyhow::anyhow!("parse config: {}", e))
}

/// Expand env vars: `$VAR`, `${VAR}`, `${VAR:-default}`. Unset vars expand to empty.
fn expand_env_vars(s: &str) -> anyhow::Result<String> {
    fn context(var: &str) -> Result<Option<std::borrow::Cow<'static, str>>, std::env::VarError> {
        match std::env::var(var) {
            Ok(v) => Ok(Some(v.into())),
            Err(std::env::VarError::NotPresent) => Ok(Some("".into())),
            Err(e) => Err(e),
        }
    }
    shellexpand::env_with_context(s, context)
        .map(|cow| cow.into_owned())
        .map_err(|e| anyhow::anyhow!("config env expansion: {} ({})", e.var_name, e.cause))
}
