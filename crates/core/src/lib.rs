mod analysis;
mod error;
mod export;
mod loader;
mod pipeline;
pub mod program;
mod table;
mod words;

pub use analysis::{AnalysisEvent, AnalysisHandle, AnalysisJob, Analyzer};
pub use error::{LensError, Result};
pub use export::{anonymize_file, export_result, unique_path, write_csv_with_bom, ExportedFiles};
pub use loader::{
    list_files, read_table, sanitize_filename, FileKind, LoaderOptions, RawSheet, TableLoader,
    TableSet, SUPPORTED_EXTENSIONS, TEXT_ENCODINGS,
};
pub use pipeline::{
    direct_prompt, execute_snippet, generation_prompt, strip_code_fence, ExecutionResult, Mode,
    Pipeline, Stage, DATA_DICT, NO_SUMMARY, RESULT_TABLE, SUMMARY,
};
pub use program::{Binding, Program, ProgramError};
pub use table::{infer_column, parse_datetime, Cell, ColumnType, Table};
pub use words::{
    ImportReport, SensitiveEntry, SharedWordStore, WordStore, REPLACEMENT_HEADER, WORD_HEADER,
};
