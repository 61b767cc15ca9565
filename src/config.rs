// src/config.rs

//! Service configuration.
//!
//! Read from a TOML file (default `dns-blm.toml`), after loading a `.env` file if one
//! exists. Secrets can be supplied through the environment instead of the file:
//! `DNS_BLM_VIRUSTOTAL_API_KEY` and `DNS_BLM_MAIL_PASSWORD` win over file values.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, info};

use crate::core::notifier::{MailSettings, NotifyError};
use crate::core::orchestrator::SCAN_TASK_NAME;
use crate::core::report::{ReportError, ReportFormat, ReportRenderer};
use crate::core::scanner::PollingSettings;
use crate::core::scheduler::{CronSchedule, ScheduleError};

pub const DEFAULT_CONFIG_FILE: &str = "dns-blm.toml";
pub const CONFIG_PATH_ENV: &str = "DNS_BLM_CONFIG";
pub const API_KEY_ENV: &str = "DNS_BLM_VIRUSTOTAL_API_KEY";
pub const MAIL_PASSWORD_ENV: &str = "DNS_BLM_MAIL_PASSWORD";

static DOMAIN_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(?i)([a-z0-9]([a-z0-9-]{0,61}[a-z0-9])?\.)+[a-z]{2,63}$")
        .unwrap_or_else(|e| panic!("domain pattern must compile: {e}"))
});

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid configuration: {0}")]
    Invalid(String),
    #[error("invalid mail configuration: {0}")]
    Mail(#[from] NotifyError),
    #[error("invalid timed task: {0}")]
    Schedule(#[from] ScheduleError),
    #[error("invalid report configuration: {0}")]
    Report(#[from] ReportError),
}

// --- Sections ---

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ApiCredentials {
    pub virus_total: String,
}

#[derive(Clone, Deserialize)]
pub struct MailConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    #[serde(default)]
    pub password: String,
    pub from: String,
    #[serde(default = "default_enable_ssl")]
    pub enable_ssl: bool,
}

fn default_enable_ssl() -> bool {
    true
}

impl std::fmt::Debug for MailConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MailConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("from", &self.from)
            .field("enable_ssl", &self.enable_ssl)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ReportConfig {
    pub format: ReportFormat,
    /// Handlebars template replacing the built-in HTML table.
    pub template: Option<String>,
}

/// Tuning of the VirusTotal scanner. Every field is optional.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct VirusTotalConfig {
    pub submit_retries: usize,
    pub poll_retries: usize,
    pub settle_delay_secs: u64,
    pub concurrency: usize,
}

impl Default for VirusTotalConfig {
    fn default() -> Self {
        let defaults = PollingSettings::default();
        Self {
            submit_retries: defaults.submit_retries,
            poll_retries: defaults.poll_retries,
            settle_delay_secs: defaults.settle_delay.as_secs(),
            concurrency: defaults.concurrency,
        }
    }
}

impl VirusTotalConfig {
    /// Retry budgets and concurrency must each be at least 1.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let limits = [
            ("submit_retries", self.submit_retries),
            ("poll_retries", self.poll_retries),
            ("concurrency", self.concurrency),
        ];
        match limits.iter().find(|(_, value)| *value == 0) {
            Some((key, _)) => Err(ConfigError::Invalid(format!("virustotal.{key} must be at least 1"))),
            None => Ok(()),
        }
    }

    pub fn polling_settings(&self) -> PollingSettings {
        PollingSettings {
            submit_retries: self.submit_retries,
            poll_retries: self.poll_retries,
            settle_delay: Duration::from_secs(self.settle_delay_secs),
            concurrency: self.concurrency,
        }
    }
}

// --- Root ---

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub debug: bool,
    #[serde(default)]
    pub domains: Vec<String>,
    pub report_receiver: String,
    #[serde(default)]
    pub api_credentials: ApiCredentials,
    pub mail: MailConfig,
    /// Task name to cron expression.
    #[serde(default)]
    pub timed_tasks: BTreeMap<String, String>,
    #[serde(default)]
    pub report: ReportConfig,
    #[serde(default)]
    pub virustotal: VirusTotalConfig,
}

impl AppConfig {
    /// Resolves the configuration path: explicit argument, then `DNS_BLM_CONFIG`,
    /// then `dns-blm.toml` in the working directory.
    pub fn resolve_path(explicit: Option<&Path>) -> PathBuf {
        explicit
            .map(Path::to_path_buf)
            .or_else(|| std::env::var_os(CONFIG_PATH_ENV).map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE))
    }

    /// Loads `.env`, reads and validates the file at `path`.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if let Ok(env_file) = dotenvy::dotenv() {
            debug!(path = %env_file.display(), "Loaded environment file.");
        }

        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config = Self::from_toml(&raw, path)?;
        config.apply_env_overrides(|key| std::env::var(key).ok());
        config.validate()?;

        info!(
            path = %path.display(),
            domains = config.domains.len(),
            timed_tasks = config.timed_tasks.len(),
            "Configuration loaded."
        );
        Ok(config)
    }

    fn from_toml(raw: &str, path: &Path) -> Result<Self, ConfigError> {
        toml::from_str(raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Replaces secrets with values from `lookup` when it has them.
    pub fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(key) = lookup(API_KEY_ENV).filter(|v| !v.trim().is_empty()) {
            self.api_credentials.virus_total = key;
        }
        if let Some(password) = lookup(MAIL_PASSWORD_ENV).filter(|v| !v.trim().is_empty()) {
            self.mail.password = password;
        }
    }

    /// Checks everything the service needs before it starts.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.domains.is_empty() {
            return Err(ConfigError::Invalid("at least one domain is required".into()));
        }
        if let Some(bad) = self.domains.iter().find(|d| !is_valid_domain(d)) {
            return Err(ConfigError::Invalid(format!("{bad:?} is not a valid domain name")));
        }
        if self.api_credentials.virus_total.trim().is_empty() {
            return Err(ConfigError::Invalid(format!(
                "api_credentials.virus_total is empty (or set {API_KEY_ENV})"
            )));
        }

        self.mail_settings().validate()?;
        self.virustotal.validate()?;

        if !self.timed_tasks.contains_key(SCAN_TASK_NAME) {
            return Err(ScheduleError::Missing {
                task: SCAN_TASK_NAME.to_string(),
            }
            .into());
        }
        for expression in self.timed_tasks.values() {
            CronSchedule::parse(expression)?;
        }

        self.report_renderer()?;
        Ok(())
    }

    pub fn mail_settings(&self) -> MailSettings {
        MailSettings {
            host: self.mail.host.clone(),
            port: self.mail.port,
            username: self.mail.username.clone(),
            password: self.mail.password.clone(),
            from: self.mail.from.clone(),
            to: self.report_receiver.clone(),
            enable_ssl: self.mail.enable_ssl,
        }
    }

    /// Builds the renderer for the configured report format, compiling the template.
    pub fn report_renderer(&self) -> Result<ReportRenderer, ReportError> {
        ReportRenderer::for_format(self.report.format, self.report.template.as_deref())
    }

    /// Domains trimmed and lower-cased, duplicates removed, order kept.
    pub fn normalized_domains(&self) -> Vec<String> {
        let mut domains: Vec<String> = Vec::with_capacity(self.domains.len());
        for domain in &self.domains {
            let domain = domain.trim().trim_end_matches('.').to_ascii_lowercase();
            if !domains.contains(&domain) {
                domains.push(domain);
            }
        }
        domains
    }
}

pub fn is_valid_domain(domain: &str) -> bool {
    let domain = domain.trim().trim_end_matches('.');
    domain.len() <= 253 && DOMAIN_PATTERN.is_match(domain)
}
