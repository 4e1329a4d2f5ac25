use crate::corpus::{DEFAULT_SKIP_PREFIXES, ErrorPolicy};
use crate::executor::{
    CommandExecutorConfig, DEFAULT_RSS_LIMIT_MB, DEFAULT_UNIT_TIMEOUT, DEFAULT_WATCHDOG_MARGIN,
};
use crate::oracle::SanitizerStackParser;
use crate::sanitizer::SanitizerOptions;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct TargetSettings {
    #[serde(default)]
    pub binary: Option<PathBuf>,
    #[serde(default = "default_unit_timeout_secs")]
    pub unit_timeout_secs: u64,
    #[serde(default = "default_rss_limit_mb")]
    pub rss_limit_mb: u64,
    #[serde(default = "default_watchdog_margin_secs")]
    pub watchdog_margin_secs: u64,
}

fn default_unit_timeout_secs() -> u64 {
    DEFAULT_UNIT_TIMEOUT.as_secs()
}

fn default_rss_limit_mb() -> u64 {
    DEFAULT_RSS_LIMIT_MB
}

fn default_watchdog_margin_secs() -> u64 {
    DEFAULT_WATCHDOG_MARGIN.as_secs()
}

impl Default for TargetSettings {
    fn default() -> Self {
        Self {
            binary: None,
            unit_timeout_secs: default_unit_timeout_secs(),
            rss_limit_mb: default_rss_limit_mb(),
            watchdog_margin_secs: default_watchdog_margin_secs(),
        }
    }
}

#[derive(Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct SanitizerSettings {
    /// Added to, or overriding, the built-in sanitizer options.
    #[serde(default)]
    pub extra_options: BTreeMap<String, String>,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct ClassifierSettings {
    #[serde(default = "default_true")]
    pub detect_ooms_and_hangs: bool,
    #[serde(default = "default_true")]
    pub include_ubsan: bool,
}

fn default_true() -> bool {
    true
}

impl Default for ClassifierSettings {
    fn default() -> Self {
        Self {
            detect_ooms_and_hangs: true,
            include_ubsan: true,
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct TriageSettings {
    #[serde(default = "default_skip_prefixes")]
    pub skip_prefixes: Vec<String>,
    #[serde(default)]
    pub on_error: ErrorPolicy,
}

pub fn default_skip_prefixes() -> Vec<String> {
    DEFAULT_SKIP_PREFIXES.iter().map(|p| p.to_string()).collect()
}

impl Default for TriageSettings {
    fn default() -> Self {
        Self {
            skip_prefixes: default_skip_prefixes(),
            on_error: ErrorPolicy::default(),
        }
    }
}

#[derive(Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct TriageConfig {
    #[serde(default)]
    pub target: TargetSettings,
    #[serde(default)]
    pub sanitizer: SanitizerSettings,
    #[serde(default)]
    pub classifier: ClassifierSettings,
    #[serde(default)]
    pub triage: TriageSettings,
}

impl TriageConfig {
    pub fn load_from_file(path: &Path) -> Result<Self, anyhow::Error> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read config file at {:?}: {}", path, e))?;
        Self::from_toml(&content).map_err(|e| {
            anyhow::anyhow!("Failed to parse TOML from config file {:?}: {}", path, e)
        })
    }

    pub fn from_toml(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    /// Executor settings for the configured target binary.
    pub fn executor_config(&self) -> Result<CommandExecutorConfig, anyhow::Error> {
        let binary = self
            .target
            .binary
            .clone()
            .ok_or_else(|| anyhow::anyhow!("No target binary configured"))?;
        Ok(CommandExecutorConfig {
            binary,
            unit_timeout: Duration::from_secs(self.target.unit_timeout_secs),
            rss_limit_mb: self.target.rss_limit_mb,
            watchdog_margin: Duration::from_secs(self.target.watchdog_margin_secs),
            sanitizer: SanitizerOptions::with_overrides(&self.sanitizer.extra_options),
        })
    }

    pub fn stack_parser(&self) -> SanitizerStackParser {
        SanitizerStackParser {
            detect_ooms_and_hangs: self.classifier.detect_ooms_and_hangs,
            include_ubsan: self.classifier.include_ubsan,
        }
    }
}
