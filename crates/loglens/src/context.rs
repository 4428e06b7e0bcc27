use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use loglens_core::{list_files, Analyzer, Pipeline, SharedWordStore, TableLoader, WordStore};
use loglens_llm::{CompletionClient, LlmClient};
use parking_lot::Mutex;

use crate::config::AppConfig;
use crate::logging;

/// Everything a command needs: the configuration, the shared word store and
/// the table loader with its cache.
pub struct AppContext {
    pub config: AppConfig,
    pub words: SharedWordStore,
    pub loader: Arc<Mutex<TableLoader>>,
}

impl AppContext {
    pub fn open(config: AppConfig) -> Result<Self> {
        config.ensure_dirs()?;
        let store = WordStore::load(&config.words_file).with_context(|| {
            format!("failed to load sensitive words from {}", config.words_file.display())
        })?;
        logging::verbose(format!(
            "loaded {} sensitive words from {}",
            store.len(),
            config.words_file.display()
        ));
        let loader = TableLoader::new(config.loader_options()?);
        Ok(Self {
            config,
            words: SharedWordStore::new(store),
            loader: Arc::new(Mutex::new(loader)),
        })
    }

    /// Opens the context for an analysis run. Oracle settings are checked
    /// before any directory or word file is created.
    pub fn open_for_analysis(config: AppConfig) -> Result<Self> {
        config.validate_for_oracle()?;
        Self::open(config)
    }

    /// Builds the analysis runner. Fails on configuration problems before any
    /// file is read or request sent.
    pub fn analyzer(&self) -> Result<Analyzer> {
        self.config.validate_for_oracle()?;
        let provider = self.config.provider()?;
        let model = self.config.model_name()?;
        let oracle = LlmClient::new(
            provider,
            model.clone(),
            Some(self.config.api_key.as_str()),
            Some(self.config.base_url.as_str()),
        )?;
        logging::stage("oracle", format!("using {} ({model})", provider.as_str()));
        let client = CompletionClient::new(
            Arc::new(oracle),
            Duration::from_millis(self.config.retry_delay_ms),
        )
        .with_redactor(Arc::new(self.words.clone()));
        let pipeline = Pipeline::new(client, self.words.clone(), self.config.retry_limit);
        Ok(Analyzer::new(
            Arc::new(pipeline),
            self.loader.clone(),
            self.config.data_dir.clone(),
        ))
    }

    /// Explicit file names, or every file in the data directory with `all`.
    pub fn select_files(&self, files: Vec<String>, all: bool) -> Result<Vec<String>> {
        let selected = if all {
            list_files(&self.config.data_dir)?
        } else {
            files
                .into_iter()
                .map(|name| name.trim().to_string())
                .filter(|name| !name.is_empty())
                .collect()
        };
        if selected.is_empty() {
            bail!(
                "no files selected; pass --files or --all (data directory: {})",
                self.config.data_dir.display()
            );
        }
        Ok(selected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn config_in(root: &std::path::Path) -> AppConfig {
        AppConfig {
            data_dir: root.join("data"),
            save_dir: root.join("results"),
            words_file: root.join("sensitive_words.json"),
            ..AppConfig::default()
        }
    }

    #[test]
    fn analysis_rejects_missing_key_before_touching_disk() {
        let dir = tempdir().unwrap();
        let config = config_in(dir.path());
        let err = AppContext::open_for_analysis(config.clone()).err().unwrap();
        assert!(err.to_string().contains("api_key"));
        assert!(!config.data_dir.exists());
        assert!(!config.save_dir.exists());
        assert!(!config.words_file.exists());
    }

    #[test]
    fn local_provider_opens_and_selects_files() {
        let dir = tempdir().unwrap();
        let config = AppConfig {
            provider: "local".to_string(),
            ..config_in(dir.path())
        };
        let ctx = AppContext::open_for_analysis(config).unwrap();
        assert!(ctx.config.data_dir.is_dir());
        assert!(ctx.config.words_file.is_file());
        assert!(ctx.select_files(Vec::new(), true).is_err());
        std::fs::write(ctx.config.data_dir.join("a.csv"), "x\n1\n").unwrap();
        assert_eq!(ctx.select_files(Vec::new(), true).unwrap(), vec!["a.csv"]);
        assert_eq!(
            ctx.select_files(vec![" b.log ".to_string(), "".to_string()], false).unwrap(),
            vec!["b.log"]
        );
        assert!(ctx.analyzer().is_ok());
    }
}
