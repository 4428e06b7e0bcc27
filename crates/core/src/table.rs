use std::cmp::Ordering;
use std::collections::HashMap;
use std::fmt;
use std::io::Write;

use chrono::{DateTime, NaiveDate, NaiveDateTime};
use serde_json::{Map, Number, Value};

use crate::error::Result;

const NULL_MARKERS: [&str; 8] = ["", "NA", "N/A", "NaN", "nan", "null", "NULL", "#N/A"];
const DATETIME_FORMATS: [&str; 6] = [
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y/%m/%d %H:%M:%S",
    "%Y/%m/%d %H:%M",
];
const DATE_FORMATS: [&str; 2] = ["%Y-%m-%d", "%Y/%m/%d"];
const DISPLAY_DATETIME: &str = "%Y-%m-%d %H:%M:%S";

/// A single value of a loaded table.
#[derive(Debug, Clone, PartialEq)]
pub enum Cell {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    DateTime(NaiveDateTime),
}

impl Cell {
    pub fn text(value: impl Into<String>) -> Self {
        Cell::Text(value.into())
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Cell::Null)
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Cell::Int(v) => Some(*v as f64),
            Cell::Float(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Cell::Text(s) => Some(s.as_str()),
            _ => None,
        }
    }

    /// Total order used for sorting: nulls first, then booleans, numbers,
    /// timestamps and text.
    pub fn total_cmp(&self, other: &Cell) -> Ordering {
        if let (Some(a), Some(b)) = (self.as_f64(), other.as_f64()) {
            return a.total_cmp(&b);
        }
        match (self, other) {
            (Cell::Bool(a), Cell::Bool(b)) => a.cmp(b),
            (Cell::Text(a), Cell::Text(b)) => a.cmp(b),
            (Cell::DateTime(a), Cell::DateTime(b)) => a.cmp(b),
            _ => self.rank().cmp(&other.rank()),
        }
    }

    /// Equality used by filters and joins; integers and floats compare numerically.
    pub fn loose_eq(&self, other: &Cell) -> bool {
        match (self.as_f64(), other.as_f64()) {
            (Some(a), Some(b)) => a == b,
            _ => self == other,
        }
    }

    pub fn to_json(&self) -> Value {
        match self {
            Cell::Null => Value::Null,
            Cell::Bool(v) => Value::Bool(*v),
            Cell::Int(v) => Value::Number((*v).into()),
            Cell::Float(v) => Number::from_f64(*v)
                .map(Value::Number)
                .unwrap_or(Value::Null),
            Cell::Text(s) => Value::String(s.clone()),
            Cell::DateTime(dt) => Value::String(dt.format(DISPLAY_DATETIME).to_string()),
        }
    }

    pub fn from_json(value: &Value) -> Self {
        match value {
            Value::Null => Cell::Null,
            Value::Bool(v) => Cell::Bool(*v),
            Value::Number(n) => match n.as_i64() {
                Some(v) => Cell::Int(v),
                None => n.as_f64().map(Cell::Float).unwrap_or(Cell::Null),
            },
            Value::String(s) => Cell::Text(s.clone()),
            other => Cell::Text(other.to_string()),
        }
    }

    /// Hashable key for grouping and distinct rows.
    pub(crate) fn key(&self) -> String {
        match self {
            Cell::Null => "\u{0}null".to_string(),
            Cell::Float(v) if v.fract() == 0.0 && v.abs() < 9.0e15 => format!("n:{}", *v as i64),
            Cell::Int(v) => format!("n:{v}"),
            Cell::Float(v) => format!("n:{v}"),
            Cell::Bool(v) => format!("b:{v}"),
            Cell::Text(s) => format!("s:{s}"),
            Cell::DateTime(dt) => format!("d:{dt}"),
        }
    }

    fn rank(&self) -> u8 {
        match self {
            Cell::Null => 0,
            Cell::Bool(_) => 1,
            Cell::Int(_) | Cell::Float(_) => 2,
            Cell::DateTime(_) => 3,
            Cell::Text(_) => 4,
        }
    }
}

impl fmt::Display for Cell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Cell::Null => Ok(()),
            Cell::Bool(v) => write!(f, "{v}"),
            Cell::Int(v) => write!(f, "{v}"),
            Cell::Float(v) => write!(f, "{v}"),
            Cell::Text(s) => f.write_str(s),
            Cell::DateTime(dt) => write!(f, "{}", dt.format(DISPLAY_DATETIME)),
        }
    }
}

/// Declared type of a column, inferred from its values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    Null,
    Bool,
    Int,
    Float,
    DateTime,
    Text,
    Mixed,
}

impl ColumnType {
    pub fn of(values: &[Cell]) -> Self {
        let mut current = ColumnType::Null;
        for value in values {
            let kind = match value {
                Cell::Null => continue,
                Cell::Bool(_) => ColumnType::Bool,
                Cell::Int(_) => ColumnType::Int,
                Cell::Float(_) => ColumnType::Float,
                Cell::DateTime(_) => ColumnType::DateTime,
                Cell::Text(_) => ColumnType::Text,
            };
            current = match (current, kind) {
                (ColumnType::Null, kind) => kind,
                (a, b) if a == b => a,
                (ColumnType::Int, ColumnType::Float) | (ColumnType::Float, ColumnType::Int) => {
                    ColumnType::Float
                }
                _ => ColumnType::Mixed,
            };
        }
        current
    }

    pub fn is_numeric(&self) -> bool {
        matches!(self, ColumnType::Int | ColumnType::Float)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ColumnType::Null => "null",
            ColumnType::Bool => "bool",
            ColumnType::Int => "int64",
            ColumnType::Float => "float64",
            ColumnType::DateTime => "datetime",
            ColumnType::Text => "text",
            ColumnType::Mixed => "object",
        }
    }
}

/// Infers one column from raw text fields. The whole column must parse as a
/// type for that type to be chosen; anything else stays text.
pub fn infer_column(raw: &[String]) -> Vec<Cell> {
    let present: Vec<&str> = raw
        .iter()
        .map(|s| s.trim())
        .filter(|s| !NULL_MARKERS.contains(s))
        .collect();
    if present.is_empty() {
        return raw.iter().map(|_| Cell::Null).collect();
    }
    if present.iter().all(|s| s.parse::<i64>().is_ok()) {
        return convert_column(raw, |s| s.parse::<i64>().ok().map(Cell::Int));
    }
    if present.iter().all(|s| parse_float(s).is_some()) {
        return convert_column(raw, |s| parse_float(s).map(Cell::Float));
    }
    if present.iter().all(|s| parse_bool(s).is_some()) {
        return convert_column(raw, |s| parse_bool(s).map(Cell::Bool));
    }
    if present.iter().all(|s| parse_datetime(s).is_some()) {
        return convert_column(raw, |s| parse_datetime(s).map(Cell::DateTime));
    }
    convert_column(raw, |_| None)
}

fn convert_column(raw: &[String], parse: impl Fn(&str) -> Option<Cell>) -> Vec<Cell> {
    raw.iter()
        .map(|s| {
            let trimmed = s.trim();
            if NULL_MARKERS.contains(&trimmed) {
                Cell::Null
            } else {
                parse(trimmed).unwrap_or_else(|| Cell::Text(s.clone()))
            }
        })
        .collect()
}

fn parse_float(raw: &str) -> Option<f64> {
    if !raw.bytes().any(|b| b.is_ascii_digit()) {
        return None;
    }
    raw.parse::<f64>().ok().filter(|v| v.is_finite())
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.to_lowercase().as_str() {
        "true" => Some(true),
        "false" => Some(false),
        _ => None,
    }
}

pub fn parse_datetime(raw: &str) -> Option<NaiveDateTime> {
    for format in DATETIME_FORMATS {
        if let Ok(dt) = NaiveDateTime::parse_from_str(raw, format) {
            return Some(dt);
        }
    }
    for format in DATE_FORMATS {
        if let Ok(date) = NaiveDate::parse_from_str(raw, format) {
            return date.and_hms_opt(0, 0, 0);
        }
    }
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|dt| dt.naive_local())
}

/// In-memory columnar dataset. All columns have the same length.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Table {
    names: Vec<String>,
    columns: Vec<Vec<Cell>>,
}

impl Table {
    pub fn empty(names: Vec<String>) -> Self {
        let names = dedupe_names(names);
        let columns = names.iter().map(|_| Vec::new()).collect();
        Self { names, columns }
    }

    /// Builds a table from rows; short rows are padded with nulls and long rows
    /// are truncated to the header width.
    pub fn from_rows(names: Vec<String>, rows: Vec<Vec<Cell>>) -> Self {
        let mut table = Self::empty(names);
        for row in rows {
            table.push_row(row);
        }
        table
    }

    /// Builds a table from raw text fields, inferring each column's type.
    pub fn from_raw_rows(names: Vec<String>, rows: &[Vec<String>]) -> Self {
        let names = dedupe_names(names);
        let columns = (0..names.len())
            .map(|idx| {
                let raw: Vec<String> = rows
                    .iter()
                    .map(|row| row.get(idx).cloned().unwrap_or_default())
                    .collect();
                infer_column(&raw)
            })
            .collect();
        Self { names, columns }
    }

    pub fn from_columns(columns: Vec<(String, Vec<Cell>)>) -> Self {
        let height = columns.iter().map(|(_, v)| v.len()).max().unwrap_or(0);
        let (names, mut values): (Vec<String>, Vec<Vec<Cell>>) = columns.into_iter().unzip();
        for column in &mut values {
            column.resize(height, Cell::Null);
        }
        Self {
            names: dedupe_names(names),
            columns: values,
        }
    }

    pub fn push_row(&mut self, mut row: Vec<Cell>) {
        row.resize(self.names.len(), Cell::Null);
        for (column, cell) in self.columns.iter_mut().zip(row) {
            column.push(cell);
        }
    }

    pub fn column_names(&self) -> &[String] {
        &self.names
    }

    pub fn width(&self) -> usize {
        self.names.len()
    }

    pub fn height(&self) -> usize {
        self.columns.first().map(Vec::len).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.height() == 0
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.names.iter().position(|n| n == name)
    }

    pub fn column(&self, name: &str) -> Option<&[Cell]> {
        self.column_index(name).map(|idx| self.columns[idx].as_slice())
    }

    pub fn column_at(&self, idx: usize) -> &[Cell] {
        &self.columns[idx]
    }

    pub fn column_type(&self, name: &str) -> Option<ColumnType> {
        self.column(name).map(ColumnType::of)
    }

    pub fn cell(&self, row: usize, column: usize) -> &Cell {
        &self.columns[column][row]
    }

    pub fn row(&self, idx: usize) -> Vec<Cell> {
        self.columns.iter().map(|c| c[idx].clone()).collect()
    }

    pub fn rows(&self) -> impl Iterator<Item = Vec<Cell>> + '_ {
        (0..self.height()).map(move |idx| self.row(idx))
    }

    pub fn into_columns(self) -> Vec<(String, Vec<Cell>)> {
        self.names.into_iter().zip(self.columns).collect()
    }

    /// New table holding the given rows, in the given order.
    pub fn take(&self, indices: &[usize]) -> Table {
        let columns = self
            .columns
            .iter()
            .map(|c| indices.iter().map(|&i| c[i].clone()).collect())
            .collect();
        Table {
            names: self.names.clone(),
            columns,
        }
    }

    pub fn head(&self, n: usize) -> Table {
        let indices: Vec<usize> = (0..self.height().min(n)).collect();
        self.take(&indices)
    }

    /// Applies `f` to every text cell.
    pub fn map_text(&self, f: impl Fn(&str) -> String) -> Table {
        let columns = self
            .columns
            .iter()
            .map(|c| {
                c.iter()
                    .map(|cell| match cell {
                        Cell::Text(s) => Cell::Text(f(s)),
                        other => other.clone(),
                    })
                    .collect()
            })
            .collect();
        Table {
            names: self.names.clone(),
            columns,
        }
    }

    /// Stacks tables vertically; the column set is the union in first-seen order.
    pub fn concat<'a>(tables: impl IntoIterator<Item = &'a Table>) -> Table {
        let tables: Vec<&Table> = tables.into_iter().collect();
        let mut names: Vec<String> = Vec::new();
        for table in &tables {
            for name in &table.names {
                if !names.contains(name) {
                    names.push(name.clone());
                }
            }
        }
        let mut out = Table::empty(names);
        for table in tables {
            let mapping: Vec<Option<usize>> =
                out.names.iter().map(|n| table.column_index(n)).collect();
            for row in 0..table.height() {
                let cells = mapping
                    .iter()
                    .map(|idx| idx.map(|i| table.cell(row, i).clone()).unwrap_or(Cell::Null))
                    .collect();
                out.push_row(cells);
            }
        }
        out
    }

    pub fn to_records(&self, limit: usize) -> Vec<Value> {
        (0..self.height().min(limit))
            .map(|row| {
                let mut record = Map::new();
                for (idx, name) in self.names.iter().enumerate() {
                    record.insert(name.clone(), self.cell(row, idx).to_json());
                }
                Value::Object(record)
            })
            .collect()
    }

    pub fn write_csv<W: Write>(&self, writer: W, delimiter: u8) -> Result<()> {
        let mut csv = csv::WriterBuilder::new()
            .delimiter(delimiter)
            .from_writer(writer);
        csv.write_record(&self.names)?;
        for row in 0..self.height() {
            csv.write_record(self.columns.iter().map(|c| c[row].to_string()))?;
        }
        csv.flush()?;
        Ok(())
    }
}

/// Repeated or blank header names get positional suffixes so column lookup
/// stays unambiguous.
fn dedupe_names(names: Vec<String>) -> Vec<String> {
    let mut seen: HashMap<String, usize> = HashMap::new();
    names
        .into_iter()
        .enumerate()
        .map(|(idx, name)| {
            let base = if name.trim().is_empty() {
                format!("column_{}", idx + 1)
            } else {
                name
            };
            let count = seen.entry(base.clone()).or_insert(0);
            *count += 1;
            if *count == 1 {
                base
            } else {
                format!("{}.{}", base, *count - 1)
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(values: &[&str]) -> Vec<String> {
        values.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn infers_column_types() {
        assert_eq!(
            infer_column(&strings(&["1", "", "3"])),
            vec![Cell::Int(1), Cell::Null, Cell::Int(3)]
        );
        assert_eq!(
            infer_column(&strings(&["1", "2.5"])),
            vec![Cell::Float(1.0), Cell::Float(2.5)]
        );
        assert_eq!(
            infer_column(&strings(&["True", "false"])),
            vec![Cell::Bool(true), Cell::Bool(false)]
        );
        let dates = infer_column(&strings(&["2024-01-02 03:04:05", "2024-01-03"]));
        assert!(matches!(dates[0], Cell::DateTime(_)));
        assert_eq!(dates[1].to_string(), "2024-01-03 00:00:00");
        assert_eq!(
            infer_column(&strings(&["1", "abc"])),
            vec![Cell::text("1"), Cell::text("abc")]
        );
    }

    #[test]
    fn column_type_promotes_int_to_float() {
        assert_eq!(ColumnType::of(&[Cell::Int(1), Cell::Float(1.5)]), ColumnType::Float);
        assert_eq!(ColumnType::of(&[Cell::Null]), ColumnType::Null);
        assert_eq!(ColumnType::of(&[Cell::Int(1), Cell::text("x")]), ColumnType::Mixed);
    }

    #[test]
    fn duplicate_headers_are_suffixed() {
        let table = Table::empty(strings(&["a", "a", ""]));
        assert_eq!(table.column_names(), &strings(&["a", "a.1", "column_3"])[..]);
    }

    #[test]
    fn concat_unions_columns() {
        let a = Table::from_rows(strings(&["x"]), vec![vec![Cell::Int(1)]]);
        let b = Table::from_rows(strings(&["y", "x"]), vec![vec![Cell::text("b"), Cell::Int(2)]]);
        let merged = Table::concat([&a, &b]);
        assert_eq!(merged.column_names(), &strings(&["x", "y"])[..]);
        assert_eq!(merged.height(), 2);
        assert_eq!(merged.row(0), vec![Cell::Int(1), Cell::Null]);
        assert_eq!(merged.row(1), vec![Cell::Int(2), Cell::text("b")]);
    }

    #[test]
    fn csv_output_includes_header() {
        let table = Table::from_rows(
            strings(&["level", "count"]),
            vec![vec![Cell::text("ERROR"), Cell::Int(3)]],
        );
        let mut out = Vec::new();
        table.write_csv(&mut out, b',').unwrap();
        assert_eq!(String::from_utf8(out).unwrap(), "level,count\nERROR,3\n");
    }
}
