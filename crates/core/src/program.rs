//! Whitelisted table program produced by the oracle.
//!
//! A program is a JSON document of `let` steps evaluated in order against a
//! scope seeded with the loaded tables (`data_dict`). The interpreter only
//! knows table transformations, aggregations and text templates; it has no
//! access to files, the network or processes.
//!
//! ```json
//! {"steps": [
//!   {"let": "failed", "value": {"table": {"from": {"file": "auth.csv"},
//!       "ops": [{"filter": {"compare": {"column": "status", "op": "eq", "value": "FAIL"}}}]}}},
//!   {"let": "result_table", "value": {"table": {"from": {"var": "failed"},
//!       "ops": [{"value_counts": "user"}]}}},
//!   {"let": "summary", "value": {"text": "{failed.rows} failed logins"}}
//! ]}
//! ```

use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};

use indexmap::IndexMap;
use itertools::Itertools;
use regex::Regex;
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

use crate::loader::TableSet;
use crate::table::{parse_datetime, Cell, Table};

#[derive(Debug, Error)]
pub enum ProgramError {
    #[error("invalid program: {0}")]
    Parse(String),
    #[error("name '{0}' is not defined")]
    UnknownBinding(String),
    #[error("file '{name}' is not in data_dict (available: {available})")]
    UnknownFile { name: String, available: String },
    #[error("column '{column}' does not exist (available: {available})")]
    UnknownColumn { column: String, available: String },
    #[error("'{0}' is not a table")]
    NotATable(String),
    #[error("invalid regular expression {pattern:?}: {message}")]
    InvalidPattern { pattern: String, message: String },
    #[error("{0}")]
    Invalid(String),
    #[error("step {index} ('{name}'): {source}")]
    InStep {
        index: usize,
        name: String,
        source: Box<ProgramError>,
    },
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Program {
    pub steps: Vec<Step>,
}

impl Program {
    pub fn parse(text: &str) -> Result<Self, ProgramError> {
        serde_json::from_str(text).map_err(|err| ProgramError::Parse(err.to_string()))
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Step {
    #[serde(rename = "let")]
    pub name: String,
    pub value: Expr,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Expr {
    Table(TableExpr),
    Scalar(ScalarExpr),
    Text(String),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TableExpr {
    pub from: Source,
    #[serde(default)]
    pub ops: Vec<Op>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ScalarExpr {
    pub from: Source,
    #[serde(default)]
    pub column: Option<String>,
    pub func: AggFunc,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Source {
    File(String),
    Var(String),
    Concat(Vec<Source>),
    AllFiles(bool),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Op {
    Select(Vec<String>),
    Drop(Vec<String>),
    Rename(IndexMap<String, String>),
    Filter(Predicate),
    Sort(Vec<SortKey>),
    Limit(usize),
    /// Empty column list means whole rows.
    Distinct(Vec<String>),
    GroupBy(GroupBy),
    Cast(Cast),
    FillNull(FillNull),
    Join(Join),
    ValueCounts(String),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SortKey {
    pub column: String,
    #[serde(default)]
    pub descending: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GroupBy {
    pub keys: Vec<String>,
    #[serde(default)]
    pub aggregations: Vec<Aggregation>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Aggregation {
    #[serde(default)]
    pub column: Option<String>,
    pub func: AggFunc,
    #[serde(default)]
    pub alias: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggFunc {
    Count,
    Sum,
    Mean,
    Min,
    Max,
    CountDistinct,
    First,
    Last,
}

impl AggFunc {
    fn as_str(&self) -> &'static str {
        match self {
            AggFunc::Count => "count",
            AggFunc::Sum => "sum",
            AggFunc::Mean => "mean",
            AggFunc::Min => "min",
            AggFunc::Max => "max",
            AggFunc::CountDistinct => "count_distinct",
            AggFunc::First => "first",
            AggFunc::Last => "last",
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Cast {
    pub column: String,
    pub to: CastType,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CastType {
    Text,
    Int,
    Float,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FillNull {
    #[serde(default)]
    pub column: Option<String>,
    pub value: Value,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Join {
    pub with: Source,
    pub on: Vec<String>,
    #[serde(default)]
    pub how: JoinKind,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JoinKind {
    #[default]
    Inner,
    Left,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Predicate {
    Compare(Comparison),
    All(Vec<Predicate>),
    Any(Vec<Predicate>),
    Not(Box<Predicate>),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Comparison {
    pub column: String,
    pub op: CompareOp,
    #[serde(default)]
    pub value: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompareOp {
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
    Contains,
    StartsWith,
    EndsWith,
    Matches,
    In,
    IsNull,
    NotNull,
}

/// A value bound by a `let` step.
#[derive(Debug, Clone, PartialEq)]
pub enum Binding {
    Table(Table),
    Scalar(Cell),
    Text(String),
}

impl Binding {
    /// Text rendering for summaries; tables have none.
    pub fn as_text(&self) -> Option<String> {
        match self {
            Binding::Table(_) => None,
            Binding::Scalar(cell) => Some(cell.to_string()),
            Binding::Text(text) => Some(text.clone()),
        }
    }
}

pub type Scope = HashMap<String, Binding>;

/// Runs every step in order and returns the final bindings.
pub fn execute(program: &Program, data: &TableSet) -> Result<Scope, ProgramError> {
    let mut scope = Scope::new();
    for (idx, step) in program.steps.iter().enumerate() {
        let index = idx + 1;
        let in_step = |source: ProgramError| ProgramError::InStep {
            index,
            name: step.name.clone(),
            source: Box::new(source),
        };
        if step.name.trim().is_empty() || step.name.contains('.') {
            return Err(in_step(ProgramError::Invalid(format!(
                "invalid binding name {:?}",
                step.name
            ))));
        }
        let value = eval(&step.value, data, &scope).map_err(in_step)?;
        tracing::debug!(step = index, name = step.name.as_str(), "program step evaluated");
        scope.insert(step.name.clone(), value);
    }
    Ok(scope)
}

fn eval(expr: &Expr, data: &TableSet, scope: &Scope) -> Result<Binding, ProgramError> {
    match expr {
        Expr::Table(table_expr) => {
            let mut table = resolve(&table_expr.from, data, scope)?;
            for op in &table_expr.ops {
                table = apply(table, op, data, scope)?;
            }
            Ok(Binding::Table(table))
        }
        Expr::Scalar(scalar) => {
            let table = resolve(&scalar.from, data, scope)?;
            let cell = match &scalar.column {
                Some(column) => {
                    let idx = require(&table, column)?;
                    aggregate(scalar.func, table.column_at(idx).iter())?
                }
                None if scalar.func == AggFunc::Count => Cell::Int(table.height() as i64),
                None => {
                    return Err(ProgramError::Invalid(format!(
                        "aggregation '{}' needs a column",
                        scalar.func.as_str()
                    )))
                }
            };
            Ok(Binding::Scalar(cell))
        }
        Expr::Text(template) => render(template, scope).map(Binding::Text),
    }
}

fn resolve(source: &Source, data: &TableSet, scope: &Scope) -> Result<Table, ProgramError> {
    match source {
        Source::File(name) => data
            .get(name)
            .cloned()
            .ok_or_else(|| ProgramError::UnknownFile {
                name: name.clone(),
                available: data.keys().join(", "),
            }),
        Source::Var(name) => match scope.get(name) {
            Some(Binding::Table(table)) => Ok(table.clone()),
            Some(_) => Err(ProgramError::NotATable(name.clone())),
            None => Err(ProgramError::UnknownBinding(name.clone())),
        },
        Source::Concat(sources) => {
            let tables = sources
                .iter()
                .map(|source| resolve(source, data, scope))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(Table::concat(&tables))
        }
        Source::AllFiles(_) => Ok(Table::concat(data.values())),
    }
}

fn require(table: &Table, column: &str) -> Result<usize, ProgramError> {
    table
        .column_index(column)
        .ok_or_else(|| ProgramError::UnknownColumn {
            column: column.to_string(),
            available: table.column_names().join(", "),
        })
}

fn apply(table: Table, op: &Op, data: &TableSet, scope: &Scope) -> Result<Table, ProgramError> {
    match op {
        Op::Select(columns) => {
            let mut picked = Vec::with_capacity(columns.len());
            for column in columns {
                let idx = require(&table, column)?;
                picked.push((column.clone(), table.column_at(idx).to_vec()));
            }
            Ok(Table::from_columns(picked))
        }
        Op::Drop(columns) => {
            for column in columns {
                require(&table, column)?;
            }
            Ok(Table::from_columns(
                table
                    .into_columns()
                    .into_iter()
                    .filter(|(name, _)| !columns.contains(name))
                    .collect(),
            ))
        }
        Op::Rename(mapping) => {
            for old in mapping.keys() {
                require(&table, old)?;
            }
            Ok(Table::from_columns(
                table
                    .into_columns()
                    .into_iter()
                    .map(|(name, cells)| match mapping.get(&name) {
                        Some(new) => (new.clone(), cells),
                        None => (name, cells),
                    })
                    .collect(),
            ))
        }
        Op::Filter(predicate) => {
            let compiled = compile(predicate, &table)?;
            let keep: Vec<usize> = (0..table.height())
                .filter(|&row| compiled.test(&table, row))
                .collect();
            Ok(table.take(&keep))
        }
        Op::Sort(keys) => {
            let keys = keys
                .iter()
                .map(|key| require(&table, &key.column).map(|idx| (idx, key.descending)))
                .collect::<Result<Vec<_>, _>>()?;
            let mut order: Vec<usize> = (0..table.height()).collect();
            order.sort_by(|&a, &b| {
                keys.iter()
                    .map(|&(col, descending)| {
                        let ord = table.cell(a, col).total_cmp(table.cell(b, col));
                        if descending {
                            ord.reverse()
                        } else {
                            ord
                        }
                    })
                    .find(|ord| *ord != Ordering::Equal)
                    .unwrap_or(Ordering::Equal)
            });
            Ok(table.take(&order))
        }
        Op::Limit(n) => Ok(table.head(*n)),
        Op::Distinct(columns) => {
            let cols = if columns.is_empty() {
                (0..table.width()).collect()
            } else {
                columns
                    .iter()
                    .map(|c| require(&table, c))
                    .collect::<Result<Vec<_>, _>>()?
            };
            let mut seen = HashSet::new();
            let keep: Vec<usize> = (0..table.height())
                .filter(|&row| seen.insert(row_key(&table, row, &cols)))
                .collect();
            Ok(table.take(&keep))
        }
        Op::GroupBy(group) => group_by(&table, group),
        Op::Cast(cast) => {
            let idx = require(&table, &cast.column)?;
            let cells = table
                .column_at(idx)
                .iter()
                .map(|cell| {
                    cast_cell(cell, cast.to).ok_or_else(|| {
                        ProgramError::Invalid(format!(
                            "cannot cast '{cell}' in column '{}' to {:?}",
                            cast.column, cast.to
                        ))
                    })
                })
                .collect::<Result<Vec<_>, _>>()?;
            Ok(replace_column(table, idx, cells))
        }
        Op::FillNull(fill) => {
            let target = fill
                .column
                .as_deref()
                .map(|c| require(&table, c))
                .transpose()?;
            let value = Cell::from_json(&fill.value);
            Ok(Table::from_columns(
                table
                    .into_columns()
                    .into_iter()
                    .enumerate()
                    .map(|(idx, (name, cells))| {
                        if target.map_or(true, |t| t == idx) {
                            let filled = cells
                                .into_iter()
                                .map(|c| if c.is_null() { value.clone() } else { c })
                                .collect();
                            (name, filled)
                        } else {
                            (name, cells)
                        }
                    })
                    .collect(),
            ))
        }
        Op::Join(join) => {
            let right = resolve(&join.with, data, scope)?;
            join_tables(&table, &right, join)
        }
        Op::ValueCounts(column) => {
            let idx = require(&table, column)?;
            let mut counts: IndexMap<String, (Cell, i64)> = IndexMap::new();
            for cell in table.column_at(idx) {
                counts
                    .entry(cell.key())
                    .or_insert_with(|| (cell.clone(), 0))
                    .1 += 1;
            }
            let mut counts: Vec<(Cell, i64)> = counts.into_values().collect();
            counts.sort_by(|a, b| b.1.cmp(&a.1));
            let (values, totals): (Vec<Cell>, Vec<Cell>) = counts
                .into_iter()
                .map(|(cell, count)| (cell, Cell::Int(count)))
                .unzip();
            Ok(Table::from_columns(vec![
                (column.clone(), values),
                ("count".to_string(), totals),
            ]))
        }
    }
}

fn replace_column(table: Table, idx: usize, cells: Vec<Cell>) -> Table {
    let mut columns = table.into_columns();
    columns[idx].1 = cells;
    Table::from_columns(columns)
}

fn row_key(table: &Table, row: usize, cols: &[usize]) -> String {
    cols.iter()
        .map(|&col| table.cell(row, col).key())
        .collect::<Vec<_>>()
        .join("\u{1f}")
}

fn group_by(table: &Table, group: &GroupBy) -> Result<Table, ProgramError> {
    let key_cols = group
        .keys
        .iter()
        .map(|k| require(table, k))
        .collect::<Result<Vec<_>, _>>()?;
    let mut groups: IndexMap<String, Vec<usize>> = IndexMap::new();
    for row in 0..table.height() {
        groups
            .entry(row_key(table, row, &key_cols))
            .or_default()
            .push(row);
    }
    let mut columns: Vec<(String, Vec<Cell>)> = group
        .keys
        .iter()
        .zip(&key_cols)
        .map(|(name, &col)| {
            let cells = groups.values().map(|rows| table.cell(rows[0], col).clone()).collect();
            (name.clone(), cells)
        })
        .collect();
    for agg in &group.aggregations {
        let alias = agg.alias.clone().unwrap_or_else(|| match &agg.column {
            Some(column) => format!("{}_{}", agg.func.as_str(), column),
            None => agg.func.as_str().to_string(),
        });
        let cells = match &agg.column {
            Some(column) => {
                let col = require(table, column)?;
                groups
                    .values()
                    .map(|rows| aggregate(agg.func, rows.iter().map(|&r| table.cell(r, col))))
                    .collect::<Result<Vec<_>, _>>()?
            }
            None if agg.func == AggFunc::Count => groups
                .values()
                .map(|rows| Cell::Int(rows.len() as i64))
                .collect(),
            None => {
                return Err(ProgramError::Invalid(format!(
                    "aggregation '{}' needs a column",
                    agg.func.as_str()
                )))
            }
        };
        columns.push((alias, cells));
    }
    Ok(Table::from_columns(columns))
}

fn aggregate<'c>(
    func: AggFunc,
    cells: impl Iterator<Item = &'c Cell>,
) -> Result<Cell, ProgramError> {
    let values: Vec<&Cell> = cells.filter(|c| !c.is_null()).collect();
    let numbers = || -> Result<Vec<f64>, ProgramError> {
        values
            .iter()
            .map(|c| {
                c.as_f64().ok_or_else(|| {
                    ProgramError::Invalid(format!(
                        "'{}' needs numeric values, found '{c}'",
                        func.as_str()
                    ))
                })
            })
            .collect()
    };
    Ok(match func {
        AggFunc::Count => Cell::Int(values.len() as i64),
        AggFunc::CountDistinct => Cell::Int(
            values
                .iter()
                .map(|c| c.key())
                .collect::<HashSet<_>>()
                .len() as i64,
        ),
        AggFunc::Sum => {
            let floats = numbers()?;
            let ints = values.iter().try_fold(0i64, |acc, cell| match cell {
                Cell::Int(v) => acc.checked_add(*v),
                _ => None,
            });
            match ints {
                Some(total) => Cell::Int(total),
                None => Cell::Float(floats.iter().sum()),
            }
        }
        AggFunc::Mean => {
            let floats = numbers()?;
            if floats.is_empty() {
                Cell::Null
            } else {
                Cell::Float(floats.iter().sum::<f64>() / floats.len() as f64)
            }
        }
        AggFunc::Min => values
            .iter()
            .min_by(|a, b| a.total_cmp(b))
            .map(|c| (*c).clone())
            .unwrap_or(Cell::Null),
        AggFunc::Max => values
            .iter()
            .max_by(|a, b| a.total_cmp(b))
            .map(|c| (*c).clone())
            .unwrap_or(Cell::Null),
        AggFunc::First => values.first().map(|c| (*c).clone()).unwrap_or(Cell::Null),
        AggFunc::Last => values.last().map(|c| (*c).clone()).unwrap_or(Cell::Null),
    })
}

fn cast_cell(cell: &Cell, to: CastType) -> Option<Cell> {
    if cell.is_null() {
        return Some(Cell::Null);
    }
    match to {
        CastType::Text => Some(Cell::Text(cell.to_string())),
        CastType::Int => match cell {
            Cell::Int(v) => Some(Cell::Int(*v)),
            Cell::Float(v) if v.is_finite() => Some(Cell::Int(v.trunc() as i64)),
            Cell::Bool(v) => Some(Cell::Int(i64::from(*v))),
            Cell::DateTime(dt) => Some(Cell::Int(dt.and_utc().timestamp())),
            Cell::Text(s) => {
                let s = s.trim();
                s.parse::<i64>()
                    .ok()
                    .or_else(|| s.parse::<f64>().ok().filter(|v| v.is_finite()).map(|v| v.trunc() as i64))
                    .map(Cell::Int)
            }
            _ => None,
        },
        CastType::Float => match cell {
            Cell::Int(v) => Some(Cell::Float(*v as f64)),
            Cell::Float(v) => Some(Cell::Float(*v)),
            Cell::Bool(v) => Some(Cell::Float(if *v { 1.0 } else { 0.0 })),
            Cell::Text(s) => s.trim().parse::<f64>().ok().map(Cell::Float),
            _ => None,
        },
    }
}

fn join_tables(left: &Table, right: &Table, join: &Join) -> Result<Table, ProgramError> {
    if join.on.is_empty() {
        return Err(ProgramError::Invalid("join needs at least one key column".into()));
    }
    let left_keys = join
        .on
        .iter()
        .map(|k| require(left, k))
        .collect::<Result<Vec<_>, _>>()?;
    let right_keys = join
        .on
        .iter()
        .map(|k| require(right, k))
        .collect::<Result<Vec<_>, _>>()?;
    let right_extra: Vec<usize> = (0..right.width())
        .filter(|idx| !right_keys.contains(idx))
        .collect();
    let mut index: HashMap<String, Vec<usize>> = HashMap::new();
    for row in 0..right.height() {
        index.entry(row_key(right, row, &right_keys)).or_default().push(row);
    }
    let mut names: Vec<String> = left.column_names().to_vec();
    for &idx in &right_extra {
        let name = &right.column_names()[idx];
        if names.contains(name) {
            names.push(format!("{name}_right"));
        } else {
            names.push(name.clone());
        }
    }
    let mut out = Table::empty(names);
    for row in 0..left.height() {
        let matches = index.get(&row_key(left, row, &left_keys));
        match matches {
            Some(rows) => {
                for &other in rows {
                    let mut cells = left.row(row);
                    cells.extend(right_extra.iter().map(|&c| right.cell(other, c).clone()));
                    out.push_row(cells);
                }
            }
            None if join.how == JoinKind::Left => out.push_row(left.row(row)),
            None => {}
        }
    }
    Ok(out)
}

enum Test {
    Compare(CompareOp, Cell),
    Text(CompareOp, String),
    Matches(Regex),
    In(Vec<Cell>),
    IsNull,
    NotNull,
}

enum Compiled {
    Compare { column: usize, test: Test },
    All(Vec<Compiled>),
    Any(Vec<Compiled>),
    Not(Box<Compiled>),
}

fn compile(predicate: &Predicate, table: &Table) -> Result<Compiled, ProgramError> {
    Ok(match predicate {
        Predicate::All(items) => Compiled::All(
            items
                .iter()
                .map(|p| compile(p, table))
                .collect::<Result<_, _>>()?,
        ),
        Predicate::Any(items) => Compiled::Any(
            items
                .iter()
                .map(|p| compile(p, table))
                .collect::<Result<_, _>>()?,
        ),
        Predicate::Not(inner) => Compiled::Not(Box::new(compile(inner, table)?)),
        Predicate::Compare(cmp) => {
            let column = require(table, &cmp.column)?;
            let test = match cmp.op {
                CompareOp::IsNull => Test::IsNull,
                CompareOp::NotNull => Test::NotNull,
                CompareOp::Contains | CompareOp::StartsWith | CompareOp::EndsWith => {
                    Test::Text(cmp.op, json_text(&cmp.value))
                }
                CompareOp::Matches => {
                    let pattern = json_text(&cmp.value);
                    let regex = Regex::new(&pattern).map_err(|err| ProgramError::InvalidPattern {
                        pattern: pattern.clone(),
                        message: err.to_string(),
                    })?;
                    Test::Matches(regex)
                }
                CompareOp::In => match &cmp.value {
                    Value::Array(items) => Test::In(items.iter().map(Cell::from_json).collect()),
                    other => {
                        return Err(ProgramError::Invalid(format!(
                            "'in' expects a list of values, got {other}"
                        )))
                    }
                },
                op => Test::Compare(op, Cell::from_json(&cmp.value)),
            };
            Compiled::Compare { column, test }
        }
    })
}

fn json_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

impl Compiled {
    fn test(&self, table: &Table, row: usize) -> bool {
        match self {
            Compiled::All(items) => items.iter().all(|p| p.test(table, row)),
            Compiled::Any(items) => items.iter().any(|p| p.test(table, row)),
            Compiled::Not(inner) => !inner.test(table, row),
            Compiled::Compare { column, test } => {
                let cell = table.cell(row, *column);
                match test {
                    Test::IsNull => cell.is_null(),
                    Test::NotNull => !cell.is_null(),
                    Test::Compare(op, value) => compare(cell, *op, value),
                    Test::Text(op, needle) => {
                        if cell.is_null() {
                            return false;
                        }
                        let haystack = cell.to_string();
                        match op {
                            CompareOp::Contains => haystack.contains(needle.as_str()),
                            CompareOp::StartsWith => haystack.starts_with(needle.as_str()),
                            _ => haystack.ends_with(needle.as_str()),
                        }
                    }
                    Test::Matches(regex) => !cell.is_null() && regex.is_match(&cell.to_string()),
                    Test::In(values) => values.iter().any(|v| equals(cell, v)),
                }
            }
        }
    }
}

fn equals(cell: &Cell, value: &Cell) -> bool {
    if value.is_null() {
        return cell.is_null();
    }
    cell.loose_eq(&coerce(cell, value))
}

fn compare(cell: &Cell, op: CompareOp, value: &Cell) -> bool {
    match op {
        CompareOp::Eq => equals(cell, value),
        CompareOp::Ne => !equals(cell, value),
        _ => {
            let value = coerce(cell, value);
            if cell.is_null() || value.is_null() || !comparable(cell, &value) {
                return false;
            }
            let ord = cell.total_cmp(&value);
            match op {
                CompareOp::Gt => ord == Ordering::Greater,
                CompareOp::Ge => ord != Ordering::Less,
                CompareOp::Lt => ord == Ordering::Less,
                _ => ord != Ordering::Greater,
            }
        }
    }
}

fn comparable(a: &Cell, b: &Cell) -> bool {
    (a.as_f64().is_some() && b.as_f64().is_some())
        || std::mem::discriminant(a) == std::mem::discriminant(b)
}

/// Converts a literal from the program to the cell's type where that is
/// unambiguous, so `"2024-01-01"` compares against timestamps.
fn coerce(cell: &Cell, value: &Cell) -> Cell {
    match (cell, value) {
        (Cell::DateTime(_), Cell::Text(s)) => parse_datetime(s.trim())
            .map(Cell::DateTime)
            .unwrap_or_else(|| value.clone()),
        (Cell::Int(_) | Cell::Float(_), Cell::Text(s)) => s
            .trim()
            .parse::<f64>()
            .map(Cell::Float)
            .unwrap_or_else(|_| value.clone()),
        (Cell::Text(_), Cell::Int(_) | Cell::Float(_) | Cell::Bool(_)) => {
            Cell::Text(value.to_string())
        }
        _ => value.clone(),
    }
}

/// Expands `{name}`, `{name.rows}`, `{name.columns}` and
/// `{name.first.COLUMN}`; `{{` and `}}` are literal braces.
fn render(template: &str, scope: &Scope) -> Result<String, ProgramError> {
    let mut out = String::with_capacity(template.len());
    let mut chars = template.chars().peekable();
    while let Some(ch) = chars.next() {
        match ch {
            '{' if chars.peek() == Some(&'{') => {
                chars.next();
                out.push('{');
            }
            '}' if chars.peek() == Some(&'}') => {
                chars.next();
                out.push('}');
            }
            '{' => {
                let mut reference = String::new();
                loop {
                    match chars.next() {
                        Some('}') => break,
                        Some(c) => reference.push(c),
                        None => {
                            return Err(ProgramError::Invalid(format!(
                                "unclosed '{{' in text template: {template}"
                            )))
                        }
                    }
                }
                out.push_str(&lookup(reference.trim(), scope)?);
            }
            other => out.push(other),
        }
    }
    Ok(out)
}

fn lookup(reference: &str, scope: &Scope) -> Result<String, ProgramError> {
    let mut parts = reference.splitn(3, '.');
    let name = parts.next().unwrap_or_default();
    let binding = scope
        .get(name)
        .ok_or_else(|| ProgramError::UnknownBinding(name.to_string()))?;
    match (binding, parts.next(), parts.next()) {
        (binding, None, _) => binding.as_text().ok_or_else(|| {
            ProgramError::Invalid(format!(
                "'{name}' is a table; use {{{name}.rows}} or {{{name}.first.COLUMN}}"
            ))
        }),
        (Binding::Table(table), Some("rows"), None) => Ok(table.height().to_string()),
        (Binding::Table(table), Some("columns"), None) => Ok(table.column_names().join(", ")),
        (Binding::Table(table), Some("first"), Some(column)) => {
            let idx = require(table, column)?;
            Ok(if table.is_empty() {
                String::new()
            } else {
                table.cell(0, idx).to_string()
            })
        }
        (Binding::Table(_), _, _) => Err(ProgramError::Invalid(format!(
            "unknown table reference {{{reference}}}"
        ))),
        _ => Err(ProgramError::NotATable(name.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> TableSet {
        let auth = Table::from_rows(
            vec!["user".into(), "status".into(), "bytes".into()],
            vec![
                vec![Cell::text("root"), Cell::text("FAIL"), Cell::Int(10)],
                vec![Cell::text("alice"), Cell::text("OK"), Cell::Int(20)],
                vec![Cell::text("root"), Cell::text("FAIL"), Cell::Int(30)],
                vec![Cell::text("bob"), Cell::text("FAIL"), Cell::Null],
            ],
        );
        let users = Table::from_rows(
            vec!["user".into(), "team".into()],
            vec![
                vec![Cell::text("root"), Cell::text("ops")],
                vec![Cell::text("alice"), Cell::text("dev")],
            ],
        );
        let mut data = TableSet::new();
        data.insert("auth.csv".into(), auth);
        data.insert("users.csv".into(), users);
        data
    }

    fn run(json: &str) -> Result<Scope, ProgramError> {
        execute(&Program::parse(json)?, &sample())
    }

    fn table(scope: &Scope, name: &str) -> Table {
        match scope.get(name) {
            Some(Binding::Table(t)) => t.clone(),
            other => panic!("expected table binding, got {other:?}"),
        }
    }

    #[test]
    fn binds_file_table_and_text() {
        let scope = run(r#"{"steps": [
            {"let": "result_table", "value": {"table": {"from": {"file": "auth.csv"}}}},
            {"let": "summary", "value": {"text": "ok"}}
        ]}"#)
        .unwrap();
        assert_eq!(table(&scope, "result_table"), sample()["auth.csv"]);
        assert_eq!(scope["summary"], Binding::Text("ok".into()));
    }

    #[test]
    fn filter_group_and_sort() {
        let scope = run(r#"{"steps": [
            {"let": "t", "value": {"table": {"from": {"file": "auth.csv"}, "ops": [
                {"filter": {"compare": {"column": "status", "op": "eq", "value": "FAIL"}}},
                {"group_by": {"keys": ["user"], "aggregations": [
                    {"func": "count", "alias": "n"},
                    {"column": "bytes", "func": "sum"}
                ]}},
                {"sort": [{"column": "n", "descending": true}]}
            ]}}}
        ]}"#)
        .unwrap();
        let t = table(&scope, "t");
        assert_eq!(t.column_names(), &["user", "n", "sum_bytes"]);
        assert_eq!(t.row(0), vec![Cell::text("root"), Cell::Int(2), Cell::Int(40)]);
        assert_eq!(t.row(1), vec![Cell::text("bob"), Cell::Int(1), Cell::Int(0)]);
    }

    #[test]
    fn scalar_and_template_references() {
        let scope = run(r#"{"steps": [
            {"let": "fails", "value": {"table": {"from": {"file": "auth.csv"}, "ops": [
                {"filter": {"all": [
                    {"compare": {"column": "status", "op": "in", "value": ["FAIL"]}},
                    {"not": {"compare": {"column": "bytes", "op": "is_null"}}}
                ]}}
            ]}}},
            {"let": "avg", "value": {"scalar": {"from": {"var": "fails"}, "column": "bytes", "func": "mean"}}},
            {"let": "summary", "value": {"text": "{fails.rows} rows, first {fails.first.user}, mean {avg} {{x}}"}}
        ]}"#)
        .unwrap();
        assert_eq!(
            scope["summary"],
            Binding::Text("2 rows, first root, mean 20 {x}".into())
        );
    }

    #[test]
    fn join_and_value_counts() {
        let scope = run(r#"{"steps": [
            {"let": "joined", "value": {"table": {"from": {"file": "auth.csv"}, "ops": [
                {"join": {"with": {"file": "users.csv"}, "on": ["user"], "how": "left"}}
            ]}}},
            {"let": "inner", "value": {"table": {"from": {"file": "auth.csv"}, "ops": [
                {"join": {"with": {"file": "users.csv"}, "on": ["user"]}}
            ]}}},
            {"let": "counts", "value": {"table": {"from": {"file": "auth.csv"}, "ops": [
                {"value_counts": "user"}
            ]}}}
        ]}"#)
        .unwrap();
        let joined = table(&scope, "joined");
        assert_eq!(joined.height(), 4);
        assert_eq!(joined.column("team").unwrap()[3], Cell::Null);
        assert_eq!(table(&scope, "inner").height(), 3);
        let counts = table(&scope, "counts");
        assert_eq!(counts.row(0), vec![Cell::text("root"), Cell::Int(2)]);
    }

    #[test]
    fn select_rename_cast_and_fill() {
        let scope = run(r#"{"steps": [
            {"let": "t", "value": {"table": {"from": {"all_files": true}, "ops": [
                {"select": ["user", "bytes"]},
                {"fill_null": {"column": "bytes", "value": 0}},
                {"cast": {"column": "bytes", "to": "text"}},
                {"rename": {"bytes": "size"}},
                {"distinct": ["user"]},
                {"limit": 2}
            ]}}}
        ]}"#)
        .unwrap();
        let t = table(&scope, "t");
        assert_eq!(t.column_names(), &["user", "size"]);
        assert_eq!(t.height(), 2);
        assert_eq!(t.row(0), vec![Cell::text("root"), Cell::text("10")]);
    }

    #[test]
    fn undefined_names_are_reported() {
        let err = run(r#"{"steps": [
            {"let": "result_table", "value": {"table": {"from": {"var": "missing"}}}}
        ]}"#)
        .unwrap_err();
        let message = err.to_string();
        assert!(message.contains("missing"), "{message}");
        assert!(message.contains("not defined"), "{message}");
        assert!(message.starts_with("step 1"), "{message}");

        let err = run(r#"{"steps": [{"let": "s", "value": {"text": "{nothing}"}}]}"#).unwrap_err();
        assert!(err.to_string().contains("'nothing' is not defined"));
    }

    #[test]
    fn unknown_column_and_bad_json_fail() {
        let err = run(r#"{"steps": [{"let": "t", "value": {"table": {"from": {"file": "auth.csv"},
            "ops": [{"select": ["nope"]}]}}}]}"#)
        .unwrap_err();
        assert!(err.to_string().contains("column 'nope' does not exist"));
        assert!(matches!(Program::parse("result_table = df"), Err(ProgramError::Parse(_))));
    }

    #[test]
    fn regex_and_text_comparisons() {
        let scope = run(r#"{"steps": [
            {"let": "t", "value": {"table": {"from": {"file": "auth.csv"}, "ops": [
                {"filter": {"any": [
                    {"compare": {"column": "user", "op": "matches", "value": "^b"}},
                    {"compare": {"column": "user", "op": "ends_with", "value": "ice"}}
                ]}}
            ]}}},
            {"let": "big", "value": {"scalar": {"from": {"file": "auth.csv"}, "column": "bytes", "func": "max"}}}
        ]}"#)
        .unwrap();
        assert_eq!(table(&scope, "t").height(), 2);
        assert_eq!(scope["big"], Binding::Scalar(Cell::Int(30)));
    }
}
