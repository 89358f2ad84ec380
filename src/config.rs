//! Runtime settings: built-in defaults, then an optional `cua.toml`, then
//! environment variables (a `.env` file is loaded first and overrides the
//! process environment).

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tracing::debug;

use crate::computer::Dimensions;
use crate::cua::Endpoint;
use crate::error::{AgentError, Result};
use crate::orchestrator::OrchestratorConfig;
use crate::retry::RetryPolicy;

const LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EndpointKind {
    Azure,
    #[serde(rename = "openai")]
    OpenAi,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub endpoint: EndpointKind,
    pub azure_endpoint: Option<String>,
    pub azure_api_key: Option<String>,
    pub azure_api_version: String,
    pub openai_base_url: String,
    pub openai_api_key: Option<String>,
    pub model: String,
    pub temperature: Option<f32>,

    pub autoplay: bool,
    pub max_actions: usize,
    pub action_delay_ms: u64,
    pub require_consent: bool,
    pub safety_checks_enabled: bool,
    /// Logical screen size shown to the model; `[0, 0]` derives it from the
    /// physical screen.
    pub scale_dimensions: [u32; 2],
    pub parallel_tool_calls: bool,

    pub max_attempts: u32,
    pub rate_limit_wait_secs: u64,
    pub max_recoveries: usize,

    pub log_level: String,
    pub dry_run: bool,
    pub headless: bool,
    pub start_url: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            endpoint: EndpointKind::Azure,
            azure_endpoint: None,
            azure_api_key: None,
            azure_api_version: "2025-03-01-preview".into(),
            openai_base_url: "https://api.openai.com/v1".into(),
            openai_api_key: None,
            model: "computer-use-preview".into(),
            temperature: None,
            autoplay: false,
            max_actions: 50,
            action_delay_ms: 2000,
            require_consent: true,
            safety_checks_enabled: true,
            scale_dimensions: [1024, 768],
            parallel_tool_calls: false,
            max_attempts: 10,
            rate_limit_wait_secs: 10,
            max_recoveries: 1,
            log_level: "info".into(),
            dry_run: false,
            headless: false,
            start_url: None,
        }
    }
}

fn parse_bool(value: &str) -> bool {
    matches!(value.trim().to_ascii_lowercase().as_str(), "true" | "1" | "yes")
}

fn parse_num<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| AgentError::Config(format!("{key} must be a number, got '{value}'")))
}

fn parse_dimensions(value: &str) -> Result<[u32; 2]> {
    let value = value.trim().to_ascii_lowercase();
    if value == "auto" {
        return Ok([0, 0]);
    }
    let (w, h) = value.split_once('x').ok_or_else(|| {
        AgentError::Config(format!("CUA_SCALE_DIMENSIONS must look like 1024x768, got '{value}'"))
    })?;
    Ok([
        parse_num("CUA_SCALE_DIMENSIONS", w)?,
        parse_num("CUA_SCALE_DIMENSIONS", h)?,
    ])
}

impl Config {
    pub fn load() -> Result<Self> {
        if let Ok(path) = dotenvy::dotenv_override() {
            debug!(path = %path.display(), ".env loaded");
        }
        let mut cfg = match Self::config_path() {
            Some(path) => {
                debug!(path = %path.display(), "config file found");
                Self::from_toml_str(&std::fs::read_to_string(&path)?)?
            }
            None => Self::default(),
        };
        cfg.apply_env(|key| std::env::var(key).ok())?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn config_path() -> Option<PathBuf> {
        if let Ok(path) = std::env::var("CUA_CONFIG") {
            return Some(PathBuf::from(path));
        }
        let candidate = std::env::current_dir().ok()?.join("cua.toml");
        candidate.exists().then_some(candidate)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| AgentError::Config(e.to_string()))
    }

    /// Overlays settings found through `lookup` (normally the environment).
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("CUA_ENDPOINT") {
            self.endpoint = match v.trim().to_ascii_lowercase().as_str() {
                "azure" => EndpointKind::Azure,
                "openai" => EndpointKind::OpenAi,
                other => return Err(AgentError::Config(format!("unsupported endpoint: {other}"))),
            };
        }
        if let Some(v) = lookup("AZURE_OPENAI_ENDPOINT") {
            self.azure_endpoint = Some(v);
        }
        if let Some(v) = lookup("AZURE_OPENAI_API_KEY") {
            self.azure_api_key = Some(v);
        }
        if let Some(v) = lookup("AZURE_OPENAI_API_VERSION") {
            self.azure_api_version = v;
        }
        if let Some(v) = lookup("OPENAI_BASE_URL") {
            self.openai_base_url = v;
        }
        if let Some(v) = lookup("OPENAI_API_KEY") {
            self.openai_api_key = Some(v);
        }
        if let Some(v) = lookup("CUA_MODEL") {
            self.model = v;
        }
        if let Some(v) = lookup("CUA_AUTOPLAY") {
            self.autoplay = parse_bool(&v);
        }
        if let Some(v) = lookup("CUA_MAX_ACTIONS") {
            self.max_actions = parse_num("CUA_MAX_ACTIONS", &v)?;
        }
        if let Some(v) = lookup("CUA_ACTION_DELAY_MS") {
            self.action_delay_ms = parse_num("CUA_ACTION_DELAY_MS", &v)?;
        }
        if let Some(v) = lookup("CUA_SCALE_DIMENSIONS") {
            self.scale_dimensions = parse_dimensions(&v)?;
        }
        if let Some(v) = lookup("CUA_LOG_LEVEL") {
            self.log_level = v.trim().to_ascii_lowercase();
        }
        if let Some(v) = lookup("CUA_DRY_RUN") {
            self.dry_run = parse_bool(&v);
        }
        if let Some(v) = lookup("CUA_HEADLESS") {
            self.headless = parse_bool(&v);
        }
        if let Some(v) = lookup("CUA_START_URL") {
            self.start_url = Some(v);
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if !LOG_LEVELS.contains(&self.log_level.as_str()) {
            return Err(AgentError::Config(format!(
                "invalid log level '{}', expected one of {LOG_LEVELS:?}",
                self.log_level
            )));
        }
        if self.max_actions == 0 {
            return Err(AgentError::Config("max_actions must be at least 1".into()));
        }
        if self.max_attempts == 0 {
            return Err(AgentError::Config("max_attempts must be at least 1".into()));
        }
        // Dry runs fake the screen, not the model.
        self.endpoint().map(|_| ())
    }

    pub fn endpoint(&self) -> Result<Endpoint> {
        match self.endpoint {
            EndpointKind::Azure => {
                let endpoint = self.azure_endpoint.clone().ok_or_else(|| {
                    AgentError::Config(
                        "Azure endpoint is required, set AZURE_OPENAI_ENDPOINT".into(),
                    )
                })?;
                let api_key = self.azure_api_key.clone().ok_or_else(|| {
                    AgentError::Config("Azure API key is required, set AZURE_OPENAI_API_KEY".into())
                })?;
                Ok(Endpoint::Azure {
                    endpoint,
                    api_key,
                    api_version: self.azure_api_version.clone(),
                })
            }
            EndpointKind::OpenAi => {
                let api_key = self.openai_api_key.clone().ok_or_else(|| {
                    AgentError::Config("OpenAI API key is required, set OPENAI_API_KEY".into())
                })?;
                Ok(Endpoint::OpenAi {
                    base_url: self.openai_base_url.clone(),
                    api_key,
                })
            }
        }
    }

    pub fn scale_size(&self) -> Option<Dimensions> {
        match self.scale_dimensions {
            [0, _] | [_, 0] => None,
            [w, h] => Some(Dimensions::new(w, h)),
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            rate_limit_wait: Duration::from_secs(self.rate_limit_wait_secs),
        }
    }

    pub fn orchestrator(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            max_actions: self.max_actions,
            autoplay: self.autoplay,
            require_consent: self.require_consent,
            safety_checks_enabled: self.safety_checks_enabled,
            action_delay: Duration::from_millis(self.action_delay_ms),
            temperature: self.temperature,
            max_recoveries: self.max_recoveries,
        }
    }
}
