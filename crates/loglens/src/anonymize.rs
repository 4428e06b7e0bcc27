use std::path::PathBuf;

use anyhow::{Context, Result};
use loglens_core::{anonymize_file, sanitize_filename};

use crate::context::AppContext;
use crate::logging;

pub fn run(ctx: &AppContext, files: Vec<String>, all: bool, output: Option<PathBuf>) -> Result<()> {
    let files = ctx.select_files(files, all)?;
    let out_dir = output.unwrap_or_else(|| ctx.config.save_dir.clone());
    let options = ctx.config.loader_options()?;
    let words = ctx.words.read();
    if words.is_empty() {
        logging::info("the sensitive word list is empty; copies will match the originals");
    }
    for name in files {
        let source = ctx.config.data_dir.join(sanitize_filename(&name));
        let target = anonymize_file(&source, &out_dir, &words, &options)
            .with_context(|| format!("failed to anonymize {}", source.display()))?;
        println!("{}", target.display());
    }
    Ok(())
}
