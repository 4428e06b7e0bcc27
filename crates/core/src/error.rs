use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum LensError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serde json error: {0}")]
    SerdeJson(#[from] serde_json::Error),
    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),
    #[error("xlsx error: {0}")]
    Xlsx(#[from] rust_xlsxwriter::XlsxError),
    #[error("configuration error: {0}")]
    Config(String),
    #[error("file not found: {0:?}")]
    FileNotFound(PathBuf),
    #[error("unsupported file format {extension:?} for {path:?} (supported: {supported})")]
    UnsupportedFormat {
        path: PathBuf,
        extension: String,
        supported: String,
    },
    #[error("failed to read {path:?}; attempted: {}", attempted.join(", "))]
    Unreadable {
        path: PathBuf,
        attempted: Vec<String>,
    },
    #[error("no files selected")]
    NoFilesSelected,
    #[error("sensitive word must not be empty")]
    EmptyWord,
    #[error("sensitive word already exists: {0}")]
    DuplicateWord(String),
    #[error("sensitive word does not exist: {0}")]
    UnknownWord(String),
    #[error("placeholder {placeholder} is already used by {word}")]
    DuplicatePlaceholder { placeholder: String, word: String },
    #[error("no sensitive words to export")]
    EmptyStore,
    #[error("import failed: {0}")]
    Import(String),
    #[error("analysis failed: {0}")]
    Analysis(String),
    #[error("oracle error: {0}")]
    Oracle(String),
    #[error("other: {0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, LensError>;

impl From<anyhow::Error> for LensError {
    fn from(value: anyhow::Error) -> Self {
        Self::Oracle(format!("{value:#}"))
    }
}
