use std::path::PathBuf;

use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use loglens_core::Mode;

use crate::config::DEFAULT_CONFIG_FILE;

#[derive(Parser, Debug)]
#[command(
    name = "loglens",
    about = "Analyze log files with an LLM while keeping sensitive words local"
)]
pub struct Cli {
    #[arg(long, global = true, action = ArgAction::SetTrue)]
    pub verbose: bool,
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_FILE)]
    pub config: PathBuf,
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Manage the sensitive word list.
    Words {
        #[command(subcommand)]
        action: WordsCommand,
    },
    /// List the files available in the data directory.
    Files,
    /// Run an analysis over selected files.
    Analyze {
        request: String,
        #[arg(long, value_delimiter = ',')]
        files: Vec<String>,
        /// Select every file in the data directory.
        #[arg(long, default_value_t = false)]
        all: bool,
        #[arg(long, value_enum, default_value = "generate")]
        mode: ModeArg,
        /// Save the result table (and summary) to the save directory.
        #[arg(long, default_value_t = false)]
        save: bool,
        #[arg(long, default_value = "analysis_result")]
        name: String,
        /// With --save, also write the summary as a text file.
        #[arg(long, default_value_t = false, requires = "save")]
        save_summary: bool,
        /// Rows of the result table to print.
        #[arg(long, default_value_t = 20)]
        preview: usize,
    },
    /// Write copies of files with sensitive words replaced by placeholders.
    Anonymize {
        #[arg(long, value_delimiter = ',')]
        files: Vec<String>,
        #[arg(long, default_value_t = false)]
        all: bool,
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Show or change the stored configuration.
    Config {
        #[command(subcommand)]
        action: ConfigCommand,
    },
}

#[derive(Subcommand, Debug)]
pub enum WordsCommand {
    List,
    Add {
        word: String,
        #[arg(long)]
        placeholder: Option<String>,
    },
    Remove {
        word: String,
    },
    Update {
        old: String,
        new: String,
        #[arg(long, conflicts_with = "regenerate")]
        placeholder: Option<String>,
        /// Generate a fresh placeholder for the word.
        #[arg(long, default_value_t = false)]
        regenerate: bool,
    },
    Import {
        path: PathBuf,
    },
    Export {
        path: PathBuf,
    },
    /// Show how a text is masked and check that it restores exactly.
    Verify {
        text: String,
    },
}

#[derive(Subcommand, Debug)]
pub enum ConfigCommand {
    Show,
    Set { key: String, value: String },
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModeArg {
    Generate,
    Direct,
}

impl From<ModeArg> for Mode {
    fn from(value: ModeArg) -> Self {
        match value {
            ModeArg::Generate => Mode::Generate,
            ModeArg::Direct => Mode::Direct,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_analyze_with_file_list() {
        let cli = Cli::try_parse_from([
            "loglens",
            "analyze",
            "count failed logins",
            "--files",
            "a.csv,b.log",
            "--mode",
            "direct",
            "--save",
        ])
        .unwrap();
        assert_eq!(cli.config, PathBuf::from(DEFAULT_CONFIG_FILE));
        match cli.command {
            Command::Analyze {
                request,
                files,
                mode,
                save,
                ..
            } => {
                assert_eq!(request, "count failed logins");
                assert_eq!(files, vec!["a.csv", "b.log"]);
                assert_eq!(mode, ModeArg::Direct);
                assert!(save);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn update_rejects_placeholder_with_regenerate() {
        let parsed = Cli::try_parse_from([
            "loglens",
            "words",
            "update",
            "a",
            "b",
            "--placeholder",
            "[X]",
            "--regenerate",
        ]);
        assert!(parsed.is_err());
    }
}
