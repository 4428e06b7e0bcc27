mod analyze;
mod anonymize;
mod cli;
mod config;
mod context;
mod logging;
mod words;

use anyhow::Result;
use clap::Parser;
use loglens_core::list_files;

use crate::cli::{Cli, Command, ConfigCommand};
use crate::config::AppConfig;
use crate::context::AppContext;

fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = AppConfig::load_effective(&cli.config)?;
    logging::init(cli.verbose || config.verbose_logging);
    match cli.command {
        Command::Config { action } => run_config(&cli.config, action),
        Command::Files => {
            config.ensure_dirs()?;
            for name in list_files(&config.data_dir)? {
                println!("{name}");
            }
            Ok(())
        }
        Command::Words { action } => words::run(&AppContext::open(config)?, action),
        Command::Analyze {
            request,
            files,
            all,
            mode,
            save,
            name,
            save_summary,
            preview,
        } => analyze::run(
            &AppContext::open_for_analysis(config)?,
            analyze::AnalyzeArgs {
                request,
                files,
                all,
                mode: mode.into(),
                save,
                name,
                save_summary,
                preview,
            },
        ),
        Command::Anonymize { files, all, output } => {
            anonymize::run(&AppContext::open(config)?, files, all, output)
        }
    }
}

fn run_config(path: &std::path::Path, action: ConfigCommand) -> Result<()> {
    match action {
        ConfigCommand::Show => {
            let effective = AppConfig::load_effective(path)?;
            println!("{}", serde_json::to_string_pretty(&effective.redacted())?);
        }
        ConfigCommand::Set { key, value } => {
            // The stored file only; environment overrides are never persisted.
            let mut stored = AppConfig::load_file(path)?;
            stored.set(&key, &value)?;
            stored.save(path)?;
            logging::stage("config", format!("{key} updated in {}", path.display()));
        }
    }
    Ok(())
}
