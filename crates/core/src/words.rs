//! Sensitive word store and the reversible substitution built on it.
//!
//! Words are kept ordered by descending length and replaced one word at a
//! time in that order, so a longer word is captured before any shorter word
//! overlapping it is tried ("Bobby" is replaced before "Bob"). Spans already
//! replaced are sealed: later words and the placeholders themselves are never
//! rescanned. Restoring works the same way over placeholders, longest first.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use indexmap::IndexMap;
use loglens_llm::Redactor;
use parking_lot::RwLock;
use rand::Rng;
use regex::{Regex, RegexBuilder};
use sha2::{Digest, Sha256};

use crate::error::{LensError, Result};
use crate::loader::{self, FileKind};

pub const WORD_HEADER: &str = "敏感词";
pub const REPLACEMENT_HEADER: &str = "替换词";

const WORD_HEADER_ALIASES: [&str; 3] = [WORD_HEADER, "sensitive", "word"];
const REPLACEMENT_HEADER_ALIASES: [&str; 3] = [REPLACEMENT_HEADER, "replacement", "placeholder"];
const IMPORT_ENCODINGS: [&str; 3] = ["utf-8", "gbk", "gb18030"];
const PLACEHOLDER_ATTEMPTS: usize = 16;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SensitiveEntry {
    pub word: String,
    pub placeholder: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ImportReport {
    pub imported: usize,
    pub skipped: usize,
}

#[derive(Debug, Default)]
pub struct WordStore {
    path: Option<PathBuf>,
    entries: IndexMap<String, String>,
    reverse: HashMap<String, String>,
    folded: HashMap<String, String>,
    /// Case-insensitive placeholder pattern and its word, longest placeholder first.
    restore_rules: Vec<(Regex, String)>,
}

impl WordStore {
    /// A store that is never persisted.
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Opens the JSON word file at `path`, creating an empty one when missing.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if !path.exists() {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                fs::create_dir_all(parent)?;
            }
            fs::write(&path, "{}")?;
        }
        let raw = fs::read_to_string(&path)?;
        let stored: IndexMap<String, String> = if raw.trim().is_empty() {
            IndexMap::new()
        } else {
            serde_json::from_str(&raw)?
        };
        let mut store = Self {
            path: Some(path),
            ..Self::default()
        };
        for (word, placeholder) in stored {
            let word = word.trim().to_string();
            if word.is_empty() || store.entries.contains_key(&word) {
                continue;
            }
            store.entries.insert(word, placeholder);
        }
        store.rebuild()?;
        tracing::debug!(words = store.len(), "loaded sensitive words");
        Ok(store)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, word: &str) -> Option<&str> {
        self.entries.get(word).map(String::as_str)
    }

    pub fn word_for(&self, placeholder: &str) -> Option<&str> {
        self.reverse.get(placeholder).map(String::as_str)
    }

    /// Entries in store order (longest word first).
    pub fn entries(&self) -> Vec<SensitiveEntry> {
        self.entries
            .iter()
            .map(|(word, placeholder)| SensitiveEntry {
                word: word.clone(),
                placeholder: placeholder.clone(),
            })
            .collect()
    }

    /// Adds `word`; a missing or blank placeholder is generated. Returns the
    /// placeholder stored for the word.
    pub fn add(&mut self, word: &str, placeholder: Option<&str>) -> Result<String> {
        let word = word.trim();
        if word.is_empty() {
            return Err(LensError::EmptyWord);
        }
        if self.entries.contains_key(word) {
            return Err(LensError::DuplicateWord(word.to_string()));
        }
        let placeholder = match placeholder.map(str::trim).filter(|p| !p.is_empty()) {
            Some(explicit) => {
                self.ensure_placeholder_free(explicit, None)?;
                explicit.to_string()
            }
            None => self.fresh_placeholder(word, None)?,
        };
        self.entries.insert(word.to_string(), placeholder.clone());
        self.commit()?;
        tracing::info!(word, "added sensitive word");
        Ok(placeholder)
    }

    pub fn remove(&mut self, word: &str) -> Result<()> {
        if self.entries.shift_remove(word).is_none() {
            return Err(LensError::UnknownWord(word.to_string()));
        }
        self.commit()?;
        tracing::info!(word, "removed sensitive word");
        Ok(())
    }

    /// Replaces `old_word` with `new_word`.
    ///
    /// `new_placeholder`: `None` keeps the current placeholder, a blank string
    /// generates a new one, anything else is used as given.
    pub fn update(
        &mut self,
        old_word: &str,
        new_word: &str,
        new_placeholder: Option<&str>,
    ) -> Result<()> {
        let Some(current) = self.entries.get(old_word).cloned() else {
            return Err(LensError::UnknownWord(old_word.to_string()));
        };
        let new_word = new_word.trim();
        if new_word.is_empty() {
            return Err(LensError::EmptyWord);
        }
        if new_word != old_word && self.entries.contains_key(new_word) {
            return Err(LensError::DuplicateWord(new_word.to_string()));
        }
        let placeholder = match new_placeholder.map(str::trim) {
            None => current,
            Some("") => self.fresh_placeholder(new_word, Some(old_word))?,
            Some(explicit) => {
                self.ensure_placeholder_free(explicit, Some(old_word))?;
                explicit.to_string()
            }
        };
        self.entries.shift_remove(old_word);
        self.entries.insert(new_word.to_string(), placeholder);
        self.commit()?;
        tracing::info!(old_word, new_word, "updated sensitive word");
        Ok(())
    }

    /// Imports words from a CSV or spreadsheet with a sensitive-word column and
    /// an optional replacement column. Existing words are left untouched.
    pub fn import_from(&mut self, path: impl AsRef<Path>) -> Result<ImportReport> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(LensError::FileNotFound(path.to_path_buf()));
        }
        let sheet = match FileKind::from_path(path) {
            Some(FileKind::Csv) => loader::read_delimited(path, b',', &IMPORT_ENCODINGS)?,
            Some(FileKind::Excel) => loader::read_spreadsheet(path)?,
            _ => {
                return Err(LensError::Import(format!(
                    "unsupported file {}; expected .csv, .xlsx or .xls",
                    path.display()
                )))
            }
        };
        let find = |aliases: &[&str]| {
            sheet.headers.iter().position(|header| {
                let header = header.trim();
                aliases.iter().any(|alias| header.eq_ignore_ascii_case(alias))
            })
        };
        let word_idx = find(&WORD_HEADER_ALIASES).ok_or_else(|| {
            LensError::Import(format!("file must contain a '{WORD_HEADER}' column"))
        })?;
        let replacement_idx = find(&REPLACEMENT_HEADER_ALIASES);
        let mut report = ImportReport::default();
        for row in &sheet.rows {
            let word = row.get(word_idx).map(|w| w.trim()).unwrap_or_default();
            if word.is_empty() || self.entries.contains_key(word) {
                report.skipped += 1;
                continue;
            }
            let replacement = replacement_idx
                .and_then(|idx| row.get(idx))
                .map(|r| r.trim())
                .filter(|r| !r.is_empty());
            match self.add(word, replacement) {
                Ok(_) => report.imported += 1,
                Err(err) => {
                    tracing::warn!(word, "skipped during import: {err}");
                    report.skipped += 1;
                }
            }
        }
        tracing::info!(
            imported = report.imported,
            skipped = report.skipped,
            "imported sensitive words from {}",
            path.display()
        );
        Ok(report)
    }

    /// Writes every entry as a two-column CSV (UTF-8 with BOM) or XLSX file.
    pub fn export_to(&self, path: impl AsRef<Path>) -> Result<usize> {
        let path = path.as_ref();
        if self.entries.is_empty() {
            return Err(LensError::EmptyStore);
        }
        match FileKind::from_path(path) {
            Some(FileKind::Csv) => {
                let mut file = fs::File::create(path)?;
                file.write_all(b"\xEF\xBB\xBF")?;
                let mut writer = csv::Writer::from_writer(file);
                writer.write_record([WORD_HEADER, REPLACEMENT_HEADER])?;
                for (word, placeholder) in &self.entries {
                    writer.write_record([word, placeholder])?;
                }
                writer.flush()?;
            }
            Some(FileKind::Excel) => {
                let mut workbook = rust_xlsxwriter::Workbook::new();
                let sheet = workbook.add_worksheet();
                sheet.write_string(0, 0, WORD_HEADER)?;
                sheet.write_string(0, 1, REPLACEMENT_HEADER)?;
                for (row, (word, placeholder)) in self.entries.iter().enumerate() {
                    let row = row as u32 + 1;
                    sheet.write_string(row, 0, word.as_str())?;
                    sheet.write_string(row, 1, placeholder.as_str())?;
                }
                workbook.save(path)?;
            }
            _ => {
                return Err(LensError::UnsupportedFormat {
                    path: path.to_path_buf(),
                    extension: extension_of(path),
                    supported: ".csv, .xlsx, .xls".to_string(),
                })
            }
        }
        Ok(self.entries.len())
    }

    /// Replaces every known word with its placeholder. Returns the new text and
    /// the number of replacements per word.
    pub fn forward_substitute(&self, text: &str) -> (String, BTreeMap<String, usize>) {
        let mut counts = BTreeMap::new();
        let mut segments = vec![Segment::Open(text)];
        for (word, placeholder) in &self.entries {
            let (next, hits) = seal(segments, placeholder, |open| {
                open.match_indices(word.as_str())
                    .map(|(start, found)| (start, start + found.len()))
                    .collect()
            });
            segments = next;
            if hits > 0 {
                counts.insert(word.clone(), hits);
            }
        }
        (join_segments(&segments), counts)
    }

    /// Replaces every placeholder, matched case-insensitively, with its word.
    pub fn inverse_substitute(&self, text: &str) -> String {
        let mut segments = vec![Segment::Open(text)];
        for (pattern, word) in &self.restore_rules {
            segments = seal(segments, word, |open| {
                pattern
                    .find_iter(open)
                    .map(|found| (found.start(), found.end()))
                    .collect()
            })
            .0;
        }
        join_segments(&segments)
    }

    pub fn verify_round_trip(&self, sample: &str) -> bool {
        let (forward, _) = self.forward_substitute(sample);
        self.inverse_substitute(&forward) == sample
    }

    fn ensure_placeholder_free(&self, placeholder: &str, except_word: Option<&str>) -> Result<()> {
        match self.folded.get(&placeholder.to_lowercase()) {
            Some(owner) if Some(owner.as_str()) != except_word => {
                Err(LensError::DuplicatePlaceholder {
                    placeholder: placeholder.to_string(),
                    word: owner.clone(),
                })
            }
            _ => Ok(()),
        }
    }

    fn fresh_placeholder(&self, word: &str, except_word: Option<&str>) -> Result<String> {
        for _ in 0..PLACEHOLDER_ATTEMPTS {
            let candidate = generate_placeholder(word);
            if self.ensure_placeholder_free(&candidate, except_word).is_ok() {
                return Ok(candidate);
            }
        }
        Err(LensError::Other(format!(
            "could not generate a unique placeholder for {word}"
        )))
    }

    fn commit(&mut self) -> Result<()> {
        self.rebuild()?;
        self.save()
    }

    fn save(&self) -> Result<()> {
        if let Some(path) = &self.path {
            let json = serde_json::to_string_pretty(&self.entries)?;
            fs::write(path, json)?;
        }
        Ok(())
    }

    /// Re-sorts entries and recomputes the reverse indexes and restore rules.
    fn rebuild(&mut self) -> Result<()> {
        self.entries.sort_by(|a, _, b, _| {
            b.chars()
                .count()
                .cmp(&a.chars().count())
                .then_with(|| a.cmp(b))
        });
        self.reverse = self
            .entries
            .iter()
            .map(|(word, placeholder)| (placeholder.clone(), word.clone()))
            .collect();
        self.folded = self
            .entries
            .iter()
            .map(|(word, placeholder)| (placeholder.to_lowercase(), word.clone()))
            .collect();
        let mut pairs: Vec<(&String, &String)> = self
            .entries
            .iter()
            .filter(|(_, placeholder)| !placeholder.is_empty())
            .map(|(word, placeholder)| (placeholder, word))
            .collect();
        pairs.sort_by(|a, b| {
            b.0.chars()
                .count()
                .cmp(&a.0.chars().count())
                .then_with(|| a.0.cmp(b.0))
        });
        self.restore_rules = pairs
            .into_iter()
            .map(|(placeholder, word)| {
                RegexBuilder::new(&regex::escape(placeholder))
                    .case_insensitive(true)
                    .build()
                    .map(|pattern| (pattern, word.clone()))
                    .map_err(|err| {
                        LensError::Other(format!("failed to compile placeholder {placeholder}: {err}"))
                    })
            })
            .collect::<Result<_>>()?;
        Ok(())
    }
}

/// Part of a text during substitution: still searchable, or already replaced.
#[derive(Debug, Clone, Copy)]
enum Segment<'a> {
    Open(&'a str),
    Sealed(&'a str),
}

/// Replaces the ranges `find` reports inside every open segment with a sealed
/// `replacement`. Returns the new segments and the number of replacements.
fn seal<'a>(
    segments: Vec<Segment<'a>>,
    replacement: &'a str,
    find: impl Fn(&str) -> Vec<(usize, usize)>,
) -> (Vec<Segment<'a>>, usize) {
    let mut out = Vec::with_capacity(segments.len());
    let mut hits = 0;
    for segment in segments {
        let Segment::Open(open) = segment else {
            out.push(segment);
            continue;
        };
        let mut last = 0;
        for (start, end) in find(open) {
            if start > last {
                out.push(Segment::Open(&open[last..start]));
            }
            out.push(Segment::Sealed(replacement));
            last = end;
            hits += 1;
        }
        if last < open.len() {
            out.push(Segment::Open(&open[last..]));
        }
    }
    (out, hits)
}

fn join_segments(segments: &[Segment<'_>]) -> String {
    segments
        .iter()
        .map(|segment| match segment {
            Segment::Open(text) | Segment::Sealed(text) => *text,
        })
        .collect()
}

fn generate_placeholder(word: &str) -> String {
    let digest = Sha256::digest(word.as_bytes());
    let nonce: u32 = rand::thread_rng().gen();
    format!(
        "[PROTECTED_{}_{:08X}]",
        hex::encode_upper(&digest[..4]),
        nonce
    )
}

fn extension_of(path: &Path) -> String {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| format!(".{}", ext.to_lowercase()))
        .unwrap_or_default()
}

/// Shared handle to the application's word store.
#[derive(Debug, Clone, Default)]
pub struct SharedWordStore(Arc<RwLock<WordStore>>);

impl SharedWordStore {
    pub fn new(store: WordStore) -> Self {
        Self(Arc::new(RwLock::new(store)))
    }

    pub fn read(&self) -> parking_lot::RwLockReadGuard<'_, WordStore> {
        self.0.read()
    }

    pub fn write(&self) -> parking_lot::RwLockWriteGuard<'_, WordStore> {
        self.0.write()
    }
}

impl Redactor for SharedWordStore {
    fn redact(&self, text: &str) -> String {
        self.read().forward_substitute(text).0
    }

    fn restore(&self, text: &str) -> String {
        self.read().inverse_substitute(text)
    }
}
