use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io::{BufReader, Read, Seek};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use calamine::{open_workbook, Data, Reader, Xls, Xlsx};
use csv::ReaderBuilder;
use encoding_rs::Encoding;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

use crate::error::{LensError, Result};
use crate::table::{Cell, Table};

pub const SUPPORTED_EXTENSIONS: [&str; 6] = [".csv", ".xlsx", ".xls", ".json", ".txt", ".log"];
pub const TEXT_ENCODINGS: [&str; 6] = [
    "utf-8",
    "gbk",
    "gb18030",
    "utf-16le",
    "utf-16be",
    "windows-1252",
];

static TRAILING_COMMA: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r",(\s*[\]}])").unwrap_or_else(|err| panic!("invalid trailing comma pattern: {err}"))
});

/// Loaded tables keyed by file name.
pub type TableSet = BTreeMap<String, Table>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    Csv,
    Excel,
    Json,
    Text,
}

impl FileKind {
    pub fn from_path(path: &Path) -> Option<Self> {
        let ext = path.extension()?.to_str()?.to_ascii_lowercase();
        match ext.as_str() {
            "csv" => Some(FileKind::Csv),
            "xlsx" | "xls" => Some(FileKind::Excel),
            "json" => Some(FileKind::Json),
            "txt" | "log" => Some(FileKind::Text),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct LoaderOptions {
    pub csv_delimiter: u8,
    pub text_delimiter: u8,
}

impl Default for LoaderOptions {
    fn default() -> Self {
        Self {
            csv_delimiter: b',',
            text_delimiter: b'\t',
        }
    }
}

/// Header row plus untyped fields, as read from a delimited file or worksheet.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawSheet {
    pub headers: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

#[derive(Debug)]
struct CachedLoad {
    base_dir: PathBuf,
    names: BTreeSet<String>,
    tables: Arc<TableSet>,
}

/// Loads selected files into tables and remembers the last file set.
#[derive(Debug, Default)]
pub struct TableLoader {
    options: LoaderOptions,
    cache: Option<CachedLoad>,
}

impl TableLoader {
    pub fn new(options: LoaderOptions) -> Self {
        Self {
            options,
            cache: None,
        }
    }

    /// Returns one table per requested file. Requesting exactly the same set of
    /// names from the same directory again returns the cached tables.
    pub fn load(&mut self, base_dir: &Path, file_names: &[String]) -> Result<Arc<TableSet>> {
        if !base_dir.is_dir() {
            return Err(LensError::Config(format!(
                "data directory does not exist: {}",
                base_dir.display()
            )));
        }
        let names: BTreeSet<String> = file_names.iter().map(|n| sanitize_filename(n)).collect();
        if names.is_empty() {
            return Err(LensError::NoFilesSelected);
        }
        if let Some(cached) = &self.cache {
            if cached.base_dir == base_dir && cached.names == names {
                tracing::debug!(files = names.len(), "table cache hit");
                return Ok(cached.tables.clone());
            }
        }
        let mut tables = TableSet::new();
        for name in &names {
            let table = read_table(&base_dir.join(name), &self.options)?;
            tracing::info!(
                file = name.as_str(),
                rows = table.height(),
                columns = table.width(),
                "loaded table"
            );
            tables.insert(name.clone(), table);
        }
        let tables = Arc::new(tables);
        self.cache = Some(CachedLoad {
            base_dir: base_dir.to_path_buf(),
            names,
            tables: tables.clone(),
        });
        Ok(tables)
    }
}

/// Strips characters that are not allowed in file names.
pub fn sanitize_filename(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .filter(|c| !matches!(c, '\\' | '/' | '*' | '?' | ':' | '"' | '<' | '>' | '|'))
        .collect();
    let cleaned = cleaned.trim();
    if cleaned.is_empty() {
        "unnamed_file".to_string()
    } else {
        cleaned.to_string()
    }
}

/// Non-hidden regular files directly inside `dir`, sorted by name.
pub fn list_files(dir: &Path) -> Result<Vec<String>> {
    if !dir.is_dir() {
        return Err(LensError::Config(format!(
            "data directory does not exist: {}",
            dir.display()
        )));
    }
    let mut names = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        if !name.starts_with('.') {
            names.push(name);
        }
    }
    names.sort();
    Ok(names)
}

pub fn read_table(path: &Path, options: &LoaderOptions) -> Result<Table> {
    if !path.is_file() {
        return Err(LensError::FileNotFound(path.to_path_buf()));
    }
    match FileKind::from_path(path) {
        Some(FileKind::Csv) => {
            let sheet = read_delimited(path, options.csv_delimiter, &TEXT_ENCODINGS)?;
            Ok(Table::from_raw_rows(sheet.headers, &sheet.rows))
        }
        Some(FileKind::Excel) => {
            let sheet = read_spreadsheet(path)?;
            Ok(Table::from_raw_rows(sheet.headers, &sheet.rows))
        }
        Some(FileKind::Json) => read_json(path),
        Some(FileKind::Text) => read_lines(path, options.text_delimiter),
        None => Err(LensError::UnsupportedFormat {
            path: path.to_path_buf(),
            extension: path
                .extension()
                .and_then(|ext| ext.to_str())
                .map(|ext| format!(".{ext}"))
                .unwrap_or_default(),
            supported: SUPPORTED_EXTENSIONS.join(", "),
        }),
    }
}

/// Reads a delimited text file with a header row, trying each encoding in turn.
pub(crate) fn read_delimited(path: &Path, delimiter: u8, encodings: &[&str]) -> Result<RawSheet> {
    read_decoded(path, encodings, |text| {
        parse_delimited(text, delimiter).map_err(|err| err.to_string())
    })
}

fn parse_delimited(text: &str, delimiter: u8) -> std::result::Result<RawSheet, csv::Error> {
    let mut reader = ReaderBuilder::new()
        .delimiter(delimiter)
        .flexible(true)
        .from_reader(text.as_bytes());
    let headers = reader
        .headers()?
        .iter()
        .map(|h| h.trim().to_string())
        .collect();
    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record?;
        if record.iter().all(|field| field.trim().is_empty()) {
            continue;
        }
        rows.push(record.iter().map(str::to_string).collect());
    }
    Ok(RawSheet { headers, rows })
}

/// Reads the first worksheet, trying the XLSX engine first and the legacy XLS
/// engine second.
pub(crate) fn read_spreadsheet(path: &Path) -> Result<RawSheet> {
    let mut attempted = Vec::new();
    match open_workbook::<Xlsx<_>, _>(path) {
        Ok(mut workbook) => match first_sheet::<BufReader<fs::File>, _>(&mut workbook) {
            Ok(sheet) => return Ok(sheet),
            Err(err) => attempted.push(format!("xlsx: {err}")),
        },
        Err(err) => attempted.push(format!("xlsx: {err}")),
    }
    match open_workbook::<Xls<_>, _>(path) {
        Ok(mut workbook) => match first_sheet::<BufReader<fs::File>, _>(&mut workbook) {
            Ok(sheet) => return Ok(sheet),
            Err(err) => attempted.push(format!("xls: {err}")),
        },
        Err(err) => attempted.push(format!("xls: {err}")),
    }
    tracing::warn!(path = %path.display(), "no spreadsheet engine could read file");
    Err(LensError::Unreadable {
        path: path.to_path_buf(),
        attempted,
    })
}

fn first_sheet<RS, R>(workbook: &mut R) -> std::result::Result<RawSheet, String>
where
    RS: Read + Seek,
    R: Reader<RS>,
{
    let range = workbook
        .worksheet_range_at(0)
        .ok_or_else(|| "workbook has no worksheets".to_string())?
        .map_err(|err| format!("{err:?}"))?;
    let mut rows = range
        .rows()
        .map(|row| row.iter().map(data_text).collect::<Vec<String>>());
    let headers = rows
        .next()
        .map(|header| header.into_iter().map(|h| h.trim().to_string()).collect())
        .unwrap_or_default();
    let rows = rows
        .filter(|row| row.iter().any(|field| !field.trim().is_empty()))
        .collect();
    Ok(RawSheet { headers, rows })
}

fn data_text(value: &Data) -> String {
    match value {
        Data::Empty | Data::Error(_) => String::new(),
        Data::String(s) | Data::DateTimeIso(s) | Data::DurationIso(s) => s.clone(),
        Data::Int(v) => v.to_string(),
        Data::Float(v) if v.fract() == 0.0 && v.abs() < 9.0e15 => format!("{}", *v as i64),
        Data::Float(v) => v.to_string(),
        Data::Bool(v) => v.to_string(),
        Data::DateTime(dt) => dt
            .as_datetime()
            .map(|dt| dt.format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_else(|| dt.as_f64().to_string()),
    }
}

fn read_json(path: &Path) -> Result<Table> {
    read_decoded(path, &TEXT_ENCODINGS, |text| {
        let value = match serde_json::from_str::<Value>(text) {
            Ok(value) => value,
            Err(first) => {
                let relaxed = TRAILING_COMMA.replace_all(text, "$1");
                serde_json::from_str::<Value>(&relaxed).map_err(|_| first.to_string())?
            }
        };
        Ok(json_table(&value))
    })
}

fn json_table(value: &Value) -> Table {
    match value {
        Value::Array(items) => {
            let mut names: Vec<String> = Vec::new();
            for item in items {
                match item {
                    Value::Object(map) => {
                        for key in map.keys() {
                            if !names.contains(key) {
                                names.push(key.clone());
                            }
                        }
                    }
                    _ => {
                        if !names.iter().any(|n| n == "value") {
                            names.push("value".to_string());
                        }
                    }
                }
            }
            let rows = items
                .iter()
                .map(|item| {
                    names
                        .iter()
                        .map(|name| match item {
                            Value::Object(map) => map.get(name).map(Cell::from_json),
                            other if name == "value" => Some(Cell::from_json(other)),
                            _ => None,
                        })
                        .map(|cell| cell.unwrap_or(Cell::Null))
                        .collect()
                })
                .collect();
            Table::from_rows(names, rows)
        }
        Value::Object(_) => {
            let mut fields = Vec::new();
            flatten_json("", value, &mut fields);
            let (names, row): (Vec<String>, Vec<Cell>) = fields.into_iter().unzip();
            Table::from_rows(names, vec![row])
        }
        scalar => Table::from_rows(vec!["value".to_string()], vec![vec![Cell::from_json(scalar)]]),
    }
}

fn flatten_json(prefix: &str, value: &Value, out: &mut Vec<(String, Cell)>) {
    match value {
        Value::Object(map) if !map.is_empty() => {
            for (key, nested) in map {
                let name = if prefix.is_empty() {
                    key.clone()
                } else {
                    format!("{prefix}.{key}")
                };
                flatten_json(&name, nested, out);
            }
        }
        other => out.push((prefix.to_string(), Cell::from_json(other))),
    }
}

/// Plain log lines: one record per non-blank line, split on `delimiter`.
fn read_lines(path: &Path, delimiter: u8) -> Result<Table> {
    let delimiter = delimiter as char;
    read_decoded(path, &TEXT_ENCODINGS, |text| {
        let rows: Vec<Vec<String>> = text
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| line.split(delimiter).map(str::to_string).collect())
            .collect();
        let width = rows.iter().map(Vec::len).max().unwrap_or(1);
        let names = (0..width)
            .map(|idx| match idx {
                0 => "event".to_string(),
                n => format!("field_{}", n + 1),
            })
            .collect();
        Ok(Table::from_raw_rows(names, &rows))
    })
}

/// Decodes `path` with the first encoding that both decodes cleanly and
/// parses. A byte-order mark, when present, selects the encoding outright.
fn read_decoded<T>(
    path: &Path,
    encodings: &[&str],
    parse: impl Fn(&str) -> std::result::Result<T, String>,
) -> Result<T> {
    let bytes = fs::read(path)?;
    let mut attempted = Vec::new();
    let candidates: Vec<(&'static Encoding, &[u8])> = match Encoding::for_bom(&bytes) {
        Some((encoding, bom_len)) => vec![(encoding, &bytes[bom_len..])],
        None => encodings
            .iter()
            .filter_map(|label| Encoding::for_label(label.as_bytes()))
            .map(|encoding| (encoding, bytes.as_slice()))
            .collect(),
    };
    for (encoding, payload) in candidates {
        let Some(text) = decode_strict(encoding, payload) else {
            attempted.push(format!("{} (invalid byte sequence)", encoding.name()));
            continue;
        };
        match parse(&text) {
            Ok(parsed) => {
                tracing::debug!(path = %path.display(), encoding = encoding.name(), "decoded file");
                return Ok(parsed);
            }
            Err(err) => attempted.push(format!("{} ({err})", encoding.name())),
        }
    }
    tracing::warn!(path = %path.display(), "no encoding could read file");
    Err(LensError::Unreadable {
        path: path.to_path_buf(),
        attempted,
    })
}

fn decode_strict(encoding: &'static Encoding, bytes: &[u8]) -> Option<String> {
    let text = encoding.decode_without_bom_handling_and_without_replacement(bytes)?;
    // NUL never appears in text logs; seeing one means the width is wrong.
    if text.contains('\0') {
        return None;
    }
    Some(text.into_owned())
}
