use anyhow::{bail, Result};

use crate::cli::WordsCommand;
use crate::context::AppContext;
use crate::logging;

pub fn run(ctx: &AppContext, action: WordsCommand) -> Result<()> {
    match action {
        WordsCommand::List => {
            let store = ctx.words.read();
            if store.is_empty() {
                println!("(no sensitive words)");
            }
            for entry in store.entries() {
                println!("{}\t{}", entry.word, entry.placeholder);
            }
        }
        WordsCommand::Add { word, placeholder } => {
            let placeholder = ctx.words.write().add(&word, placeholder.as_deref())?;
            logging::stage("words", format!("added '{}' as {placeholder}", word.trim()));
        }
        WordsCommand::Remove { word } => {
            ctx.words.write().remove(&word)?;
            logging::stage("words", format!("removed '{word}'"));
        }
        WordsCommand::Update {
            old,
            new,
            placeholder,
            regenerate,
        } => {
            let placeholder = if regenerate {
                Some(String::new())
            } else {
                placeholder
            };
            let mut store = ctx.words.write();
            store.update(&old, &new, placeholder.as_deref())?;
            logging::stage(
                "words",
                format!(
                    "updated '{old}' to '{}' ({})",
                    new.trim(),
                    store.get(new.trim()).unwrap_or_default()
                ),
            );
        }
        WordsCommand::Import { path } => {
            let report = ctx.words.write().import_from(&path)?;
            logging::stage(
                "words",
                format!(
                    "imported {} words from {} ({} skipped)",
                    report.imported,
                    path.display(),
                    report.skipped
                ),
            );
        }
        WordsCommand::Export { path } => {
            let count = ctx.words.read().export_to(&path)?;
            logging::stage("words", format!("exported {count} words to {}", path.display()));
        }
        WordsCommand::Verify { text } => {
            let store = ctx.words.read();
            let (masked, counts) = store.forward_substitute(&text);
            println!("{masked}");
            for (word, count) in &counts {
                logging::verbose(format!("'{word}' replaced {count} time(s)"));
            }
            if store.verify_round_trip(&text) {
                logging::stage("words", "round trip ok");
            } else {
                bail!("round trip mismatch: restored text differs from the input");
            }
        }
    }
    Ok(())
}
