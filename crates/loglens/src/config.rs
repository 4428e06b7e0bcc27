use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Context, Result};
use loglens_core::LoaderOptions;
use loglens_llm::LlmProvider;
use serde::{Deserialize, Serialize};

use crate::logging;

pub const DEFAULT_CONFIG_FILE: &str = "loglens.json";
pub const DEFAULT_RETRY_LIMIT: u32 = 3;
pub const DEFAULT_RETRY_DELAY_MS: u64 = 2000;

const KEYS: [&str; 12] = [
    "api_key",
    "data_dir",
    "save_dir",
    "verbose_logging",
    "provider",
    "model",
    "base_url",
    "retry_limit",
    "retry_delay_ms",
    "words_file",
    "csv_delimiter",
    "text_delimiter",
];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub api_key: String,
    pub data_dir: PathBuf,
    pub save_dir: PathBuf,
    pub verbose_logging: bool,
    pub provider: String,
    /// Empty means the provider's default model.
    pub model: String,
    pub base_url: String,
    pub retry_limit: u32,
    pub retry_delay_ms: u64,
    pub words_file: PathBuf,
    pub csv_delimiter: String,
    pub text_delimiter: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            data_dir: PathBuf::from("data"),
            save_dir: PathBuf::from("results"),
            verbose_logging: false,
            provider: LlmProvider::Deepseek.as_str().to_string(),
            model: String::new(),
            base_url: String::new(),
            retry_limit: DEFAULT_RETRY_LIMIT,
            retry_delay_ms: DEFAULT_RETRY_DELAY_MS,
            words_file: PathBuf::from("sensitive_words.json"),
            csv_delimiter: ",".to_string(),
            text_delimiter: "\t".to_string(),
        }
    }
}

impl AppConfig {
    /// Reads the stored configuration, writing the defaults when the file does
    /// not exist yet.
    pub fn load_file(path: &Path) -> Result<Self> {
        if !path.exists() {
            let config = Self::default();
            config.save(path)?;
            logging::verbose(format!("created default config at {}", path.display()));
            return Ok(config);
        }
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_json::from_str(&raw).with_context(|| format!("invalid config {}", path.display()))
    }

    /// Stored configuration with `LOGLENS_*` environment overrides applied.
    pub fn load_effective(path: &Path) -> Result<Self> {
        let mut config = Self::load_file(path)?;
        config.apply_env(|key| env::var(key).ok());
        Ok(config)
    }

    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(key) = lookup("LOGLENS_API_KEY").filter(|v| !v.trim().is_empty()) {
            self.api_key = key;
        }
        if let Some(provider) = lookup("LOGLENS_PROVIDER").filter(|v| !v.trim().is_empty()) {
            self.provider = provider;
        }
        if let Some(model) = lookup("LOGLENS_MODEL").filter(|v| !v.trim().is_empty()) {
            self.model = model;
        }
        if let Some(flag) = lookup("LOGLENS_VERBOSE") {
            self.verbose_logging = logging::parse_bool(&flag);
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json).with_context(|| format!("failed to write config {}", path.display()))
    }

    /// Updates one key from its textual form.
    pub fn set(&mut self, key: &str, value: &str) -> Result<()> {
        match key {
            "api_key" => self.api_key = value.trim().to_string(),
            "data_dir" => self.data_dir = PathBuf::from(value),
            "save_dir" => self.save_dir = PathBuf::from(value),
            "verbose_logging" => self.verbose_logging = logging::parse_bool(value),
            "provider" => {
                LlmProvider::from_str(value).ok_or_else(|| anyhow!("unknown provider {value}"))?;
                self.provider = value.trim().to_lowercase();
            }
            "model" => self.model = value.trim().to_string(),
            "base_url" => self.base_url = value.trim().to_string(),
            "retry_limit" => {
                let limit: u32 = value
                    .trim()
                    .parse()
                    .with_context(|| format!("retry_limit must be a number, got {value}"))?;
                if limit == 0 {
                    bail!("retry_limit must be at least 1");
                }
                self.retry_limit = limit;
            }
            "retry_delay_ms" => {
                self.retry_delay_ms = value
                    .trim()
                    .parse()
                    .with_context(|| format!("retry_delay_ms must be a number, got {value}"))?;
            }
            "words_file" => self.words_file = PathBuf::from(value),
            "csv_delimiter" => {
                delimiter_byte(key, value)?;
                self.csv_delimiter = value.to_string();
            }
            "text_delimiter" => {
                delimiter_byte(key, value)?;
                self.text_delimiter = value.to_string();
            }
            other => bail!("unknown config key {other} (known keys: {})", KEYS.join(", ")),
        }
        Ok(())
    }

    pub fn provider(&self) -> Result<LlmProvider> {
        LlmProvider::from_str(&self.provider)
            .ok_or_else(|| anyhow!("unknown provider {}", self.provider))
    }

    pub fn model_name(&self) -> Result<String> {
        if self.model.trim().is_empty() {
            Ok(self.provider()?.default_model().to_string())
        } else {
            Ok(self.model.trim().to_string())
        }
    }

    pub fn loader_options(&self) -> Result<LoaderOptions> {
        Ok(LoaderOptions {
            csv_delimiter: delimiter_byte("csv_delimiter", &self.csv_delimiter)?,
            text_delimiter: delimiter_byte("text_delimiter", &self.text_delimiter)?,
        })
    }

    /// Configuration checks that must pass before any oracle call.
    pub fn validate_for_oracle(&self) -> Result<()> {
        let provider = self.provider()?;
        if provider.requires_api_key() && self.api_key.trim().is_empty() {
            bail!(
                "api_key is not configured for provider {}; run `loglens config set api_key <KEY>` or set LOGLENS_API_KEY",
                provider.as_str()
            );
        }
        if self.retry_limit == 0 {
            bail!("retry_limit must be at least 1");
        }
        Ok(())
    }

    pub fn ensure_dirs(&self) -> Result<()> {
        for dir in [&self.data_dir, &self.save_dir] {
            fs::create_dir_all(dir)
                .with_context(|| format!("failed to create directory {}", dir.display()))?;
        }
        Ok(())
    }

    /// Printable form with the API key masked.
    pub fn redacted(&self) -> Self {
        let mut shown = self.clone();
        if !shown.api_key.is_empty() {
            let visible: String = shown.api_key.chars().take(5).collect();
            shown.api_key = format!("{visible}***");
        }
        shown
    }
}

fn delimiter_byte(key: &str, value: &str) -> Result<u8> {
    let unescaped = match value {
        "\\t" | "tab" => "\t",
        other => other,
    };
    match unescaped.as_bytes() {
        [byte] => Ok(*byte),
        _ => bail!("{key} must be a single ASCII character, got {value:?}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn missing_file_writes_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("loglens.json");
        let config = AppConfig::load_file(&path).unwrap();
        assert_eq!(config, AppConfig::default());
        assert!(path.exists());
        assert_eq!(config.retry_limit, 3);
        assert_eq!(config.retry_delay_ms, 2000);
        assert_eq!(config.model_name().unwrap(), "deepseek-reasoner");
    }

    #[test]
    fn partial_file_keeps_defaults_for_missing_keys() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("loglens.json");
        fs::write(&path, r#"{"api_key": "sk-abc", "retry_limit": 5}"#).unwrap();
        let config = AppConfig::load_file(&path).unwrap();
        assert_eq!(config.api_key, "sk-abc");
        assert_eq!(config.retry_limit, 5);
        assert_eq!(config.words_file, PathBuf::from("sensitive_words.json"));
    }

    #[test]
    fn set_validates_and_persists() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("loglens.json");
        let mut config = AppConfig::load_file(&path).unwrap();
        config.set("provider", "OpenAI").unwrap();
        config.set("text_delimiter", "\\t").unwrap();
        config.set("csv_delimiter", ";").unwrap();
        assert!(config.set("retry_limit", "0").is_err());
        assert!(config.set("csv_delimiter", ";;").is_err());
        assert!(config.set("provider", "mystery").is_err());
        assert!(config.set("colour", "blue").is_err());
        config.save(&path).unwrap();
        let reloaded = AppConfig::load_file(&path).unwrap();
        assert_eq!(reloaded.provider().unwrap(), LlmProvider::OpenAi);
        let options = reloaded.loader_options().unwrap();
        assert_eq!(options.csv_delimiter, b';');
        assert_eq!(options.text_delimiter, b'\t');
    }

    #[test]
    fn environment_overrides_file_values() {
        let mut config = AppConfig::default();
        config.apply_env(|key| match key {
            "LOGLENS_API_KEY" => Some("sk-env".to_string()),
            "LOGLENS_PROVIDER" => Some("local".to_string()),
            "LOGLENS_VERBOSE" => Some("yes".to_string()),
            _ => None,
        });
        assert_eq!(config.api_key, "sk-env");
        assert_eq!(config.provider().unwrap(), LlmProvider::Local);
        assert!(config.verbose_logging);
    }

    #[test]
    fn remote_provider_requires_api_key() {
        let config = AppConfig::default();
        let err = config.validate_for_oracle().unwrap_err();
        assert!(err.to_string().contains("api_key"));
        let local = AppConfig {
            provider: "local".to_string(),
            ..AppConfig::default()
        };
        assert!(local.validate_for_oracle().is_ok());
    }

    #[test]
    fn redacted_masks_api_key() {
        let config = AppConfig {
            api_key: "sk-1234567890".to_string(),
            ..AppConfig::default()
        };
        assert_eq!(config.redacted().api_key, "sk-12***");
    }
}
