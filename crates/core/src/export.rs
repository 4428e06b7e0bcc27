use std::fs;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use crate::error::{LensError, Result};
use crate::loader::{read_table, FileKind, LoaderOptions};
use crate::pipeline::ExecutionResult;
use crate::table::{Cell, Table};
use crate::words::WordStore;

const UTF8_BOM: &[u8] = b"\xEF\xBB\xBF";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExportedFiles {
    pub table: Option<PathBuf>,
    pub summary: Option<PathBuf>,
}

/// `dir/stem.ext`, or `dir/stem_N.ext` with the smallest free `N`.
pub fn unique_path(dir: &Path, stem: &str, extension: &str) -> PathBuf {
    let candidate = dir.join(format!("{stem}.{extension}"));
    if !candidate.exists() {
        return candidate;
    }
    (1..)
        .map(|n| dir.join(format!("{stem}_{n}.{extension}")))
        .find(|path| !path.exists())
        .unwrap_or(candidate)
}

pub fn write_csv_with_bom(table: &Table, path: &Path, delimiter: u8) -> Result<()> {
    let mut file = BufWriter::new(fs::File::create(path)?);
    file.write_all(UTF8_BOM)?;
    table.write_csv(&mut file, delimiter)?;
    file.flush()?;
    Ok(())
}

/// Saves the result table as CSV and, when asked, the summary as text, both
/// named after `stem` without overwriting existing files.
pub fn export_result(
    result: &ExecutionResult,
    dir: &Path,
    stem: &str,
    with_summary: bool,
) -> Result<ExportedFiles> {
    if result.result_table.is_none() && !with_summary {
        return Err(LensError::Other("there is no result table to export".to_string()));
    }
    fs::create_dir_all(dir)?;
    let mut exported = ExportedFiles::default();
    if let Some(table) = &result.result_table {
        let path = unique_path(dir, stem, "csv");
        write_csv_with_bom(table, &path, b',')?;
        tracing::info!(path = %path.display(), rows = table.height(), "exported result table");
        exported.table = Some(path);
    }
    if with_summary {
        let path = unique_path(dir, stem, "txt");
        fs::write(&path, &result.summary)?;
        exported.summary = Some(path);
    }
    Ok(exported)
}

/// Writes a copy of `source` with every sensitive word in text cells replaced
/// by its placeholder, as `<stem>_anonymized.<ext>` inside `out_dir`.
pub fn anonymize_file(
    source: &Path,
    out_dir: &Path,
    words: &WordStore,
    options: &LoaderOptions,
) -> Result<PathBuf> {
    let kind = FileKind::from_path(source).ok_or_else(|| LensError::UnsupportedFormat {
        path: source.to_path_buf(),
        extension: source
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| format!(".{ext}"))
            .unwrap_or_default(),
        supported: crate::loader::SUPPORTED_EXTENSIONS.join(", "),
    })?;
    let table = read_table(source, options)?;
    let masked = table.map_text(|text| words.forward_substitute(text).0);
    let stem = source
        .file_stem()
        .and_then(|stem| stem.to_str())
        .unwrap_or("data");
    let extension = match kind {
        FileKind::Excel => "xlsx".to_string(),
        _ => source
            .extension()
            .and_then(|ext| ext.to_str())
            .unwrap_or("csv")
            .to_ascii_lowercase(),
    };
    fs::create_dir_all(out_dir)?;
    let target = out_dir.join(format!("{stem}_anonymized.{extension}"));
    match kind {
        FileKind::Csv => write_csv_with_bom(&masked, &target, options.csv_delimiter)?,
        FileKind::Excel => write_workbook(&masked, &target)?,
        FileKind::Json => {
            let records = serde_json::Value::Array(masked.to_records(usize::MAX));
            fs::write(&target, serde_json::to_string_pretty(&records)?)?;
        }
        FileKind::Text => write_lines(&masked, &target, options.text_delimiter as char)?,
    }
    tracing::info!(
        source = %source.display(),
        target = %target.display(),
        "wrote anonymized copy"
    );
    Ok(target)
}

fn write_workbook(table: &Table, path: &Path) -> Result<()> {
    let mut workbook = rust_xlsxwriter::Workbook::new();
    let sheet = workbook.add_worksheet();
    for (col, name) in table.column_names().iter().enumerate() {
        sheet.write_string(0, col as u16, name.as_str())?;
    }
    for row in 0..table.height() {
        let xl_row = row as u32 + 1;
        for col in 0..table.width() {
            let xl_col = col as u16;
            match table.cell(row, col) {
                Cell::Null => {}
                Cell::Bool(v) => {
                    sheet.write_boolean(xl_row, xl_col, *v)?;
                }
                Cell::Int(v) => {
                    sheet.write_number(xl_row, xl_col, *v as f64)?;
                }
                Cell::Float(v) => {
                    sheet.write_number(xl_row, xl_col, *v)?;
                }
                other => {
                    sheet.write_string(xl_row, xl_col, other.to_string())?;
                }
            }
        }
    }
    workbook.save(path)?;
    Ok(())
}

/// One line per row, fields joined by `delimiter`, trailing empty fields dropped.
fn write_lines(table: &Table, path: &Path, delimiter: char) -> Result<()> {
    let mut file = BufWriter::new(fs::File::create(path)?);
    let separator = delimiter.to_string();
    for row in table.rows() {
        let mut fields: Vec<String> = row.iter().map(Cell::to_string).collect();
        while fields.len() > 1 && fields.last().is_some_and(|f| f.is_empty()) {
            fields.pop();
        }
        writeln!(file, "{}", fields.join(&separator))?;
    }
    file.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn result_with_table() -> ExecutionResult {
        ExecutionResult {
            result_table: Some(Table::from_rows(
                vec!["user".into(), "hits".into()],
                vec![vec![Cell::text("张三"), Cell::Int(3)]],
            )),
            summary: "one user".into(),
            program: None,
        }
    }

    #[test]
    fn unique_names_count_up() {
        let dir = tempdir().unwrap();
        assert_eq!(unique_path(dir.path(), "r", "csv"), dir.path().join("r.csv"));
        fs::write(dir.path().join("r.csv"), "").unwrap();
        fs::write(dir.path().join("r_1.csv"), "").unwrap();
        assert_eq!(unique_path(dir.path(), "r", "csv"), dir.path().join("r_2.csv"));
    }

    #[test]
    fn exports_csv_with_bom_and_summary() {
        let dir = tempdir().unwrap();
        let first = export_result(&result_with_table(), dir.path(), "result", true).unwrap();
        let csv_path = first.table.unwrap();
        let bytes = fs::read(&csv_path).unwrap();
        assert!(bytes.starts_with(UTF8_BOM));
        assert_eq!(
            String::from_utf8(bytes[3..].to_vec()).unwrap(),
            "user,hits\n张三,3\n"
        );
        assert_eq!(fs::read_to_string(first.summary.unwrap()).unwrap(), "one user");

        let second = export_result(&result_with_table(), dir.path(), "result", false).unwrap();
        assert_eq!(second.table.unwrap(), dir.path().join("result_1.csv"));
        assert!(second.summary.is_none());
    }

    #[test]
    fn export_without_table_needs_summary() {
        let dir = tempdir().unwrap();
        let result = ExecutionResult {
            summary: "only words".into(),
            ..Default::default()
        };
        assert!(export_result(&result, dir.path(), "r", false).is_err());
        let exported = export_result(&result, dir.path(), "r", true).unwrap();
        assert!(exported.table.is_none());
    }

    #[test]
    fn anonymized_copies_mask_text_cells() {
        let dir = tempdir().unwrap();
        let mut words = WordStore::in_memory();
        words.add("root", Some("[P_ROOT]")).unwrap();
        let options = LoaderOptions::default();

        let csv_source = dir.path().join("auth.csv");
        fs::write(&csv_source, "user,msg\nroot,root login\nbob,ok\n").unwrap();
        let out = dir.path().join("out");
        let csv_copy = anonymize_file(&csv_source, &out, &words, &options).unwrap();
        assert_eq!(csv_copy, out.join("auth_anonymized.csv"));
        let text = fs::read_to_string(&csv_copy).unwrap();
        assert!(text.contains("[P_ROOT],[P_ROOT] login"));
        assert!(!text.contains("root"));

        let log_source = dir.path().join("app.log");
        fs::write(&log_source, "root\tdenied\nbob\n").unwrap();
        let log_copy = anonymize_file(&log_source, &out, &words, &options).unwrap();
        assert_eq!(
            fs::read_to_string(log_copy).unwrap(),
            "[P_ROOT]\tdenied\nbob\n"
        );

        let json_source = dir.path().join("events.json");
        fs::write(&json_source, r#"[{"who": "root", "n": 1}]"#).unwrap();
        let json_copy = anonymize_file(&json_source, &out, &words, &options).unwrap();
        let value: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(json_copy).unwrap()).unwrap();
        assert_eq!(value[0]["who"], "[P_ROOT]");
        assert_eq!(value[0]["n"], 1);
    }
}
