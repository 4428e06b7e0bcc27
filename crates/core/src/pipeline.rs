use std::fmt;

use loglens_llm::{CompletionClient, CompletionOptions};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{json, Value};

use crate::error::Result;
use crate::loader::TableSet;
use crate::program::{self, Binding, Program};
use crate::table::{Cell, ColumnType, Table};
use crate::words::SharedWordStore;

pub const DATA_DICT: &str = "data_dict";
pub const RESULT_TABLE: &str = "result_table";
pub const SUMMARY: &str = "summary";
pub const NO_SUMMARY: &str = "Analysis finished but no summary was produced";

const GENERATION_SAMPLE_ROWS: usize = 2;
const DIRECT_SAMPLE_ROWS: usize = 3;
const DIRECT_TEMPERATURE: f32 = 0.6;

static LEADING_FENCE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^```[A-Za-z0-9_+.\-]*[ \t]*\r?\n?")
        .unwrap_or_else(|err| panic!("invalid fence pattern: {err}"))
});
static TRAILING_FENCE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\r?\n?```$").unwrap_or_else(|err| panic!("invalid fence pattern: {err}"))
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Mode {
    #[default]
    Generate,
    Direct,
}

/// Progress of one analysis invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Stage {
    Idle,
    RequestSanitized,
    CodeGenerated,
    CodeCleaned,
    Executed,
    DirectAnswerRequested,
    ResultSanitized,
    Complete,
    Failed(String),
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::Idle => f.write_str("idle"),
            Stage::RequestSanitized => f.write_str("request sanitized"),
            Stage::CodeGenerated => f.write_str("program generated"),
            Stage::CodeCleaned => f.write_str("program cleaned"),
            Stage::Executed => f.write_str("program executed"),
            Stage::DirectAnswerRequested => f.write_str("direct answer requested"),
            Stage::ResultSanitized => f.write_str("result restored"),
            Stage::Complete => f.write_str("complete"),
            Stage::Failed(reason) => write!(f, "failed: {reason}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct ExecutionResult {
    pub result_table: Option<Table>,
    pub summary: String,
    /// The program that was run, when one was generated.
    pub program: Option<String>,
}

/// Removes one leading fence line (with optional language tag) and one
/// trailing fence.
pub fn strip_code_fence(text: &str) -> String {
    let trimmed = text.trim();
    let without_leading = LEADING_FENCE.replace(trimmed, "");
    let without_trailing = TRAILING_FENCE.replace(&without_leading, "");
    without_trailing.trim().to_string()
}

/// Parses and runs `snippet` over `tables`. Never fails: errors are reported
/// through the summary.
pub fn execute_snippet(snippet: &str, tables: &TableSet) -> ExecutionResult {
    let outcome = Program::parse(snippet).and_then(|parsed| program::execute(&parsed, tables));
    match outcome {
        Ok(mut scope) => {
            let result_table = match scope.remove(RESULT_TABLE) {
                Some(Binding::Table(table)) => Some(table),
                Some(_) => {
                    tracing::warn!("{RESULT_TABLE} is not a table; ignoring it");
                    None
                }
                None => None,
            };
            let summary = scope
                .get(SUMMARY)
                .and_then(Binding::as_text)
                .unwrap_or_else(|| NO_SUMMARY.to_string());
            ExecutionResult {
                result_table,
                summary,
                program: Some(snippet.to_string()),
            }
        }
        Err(err) => {
            tracing::warn!("generated program failed: {err}");
            ExecutionResult {
                result_table: None,
                summary: format!("Code execution error: {err}\n\nExecuted code:\n{snippet}"),
                program: Some(snippet.to_string()),
            }
        }
    }
}

pub struct Pipeline {
    client: CompletionClient,
    words: SharedWordStore,
    retry_limit: u32,
}

impl Pipeline {
    pub fn new(client: CompletionClient, words: SharedWordStore, retry_limit: u32) -> Self {
        Self {
            client,
            words,
            retry_limit,
        }
    }

    pub fn run(
        &self,
        mode: Mode,
        request: &str,
        tables: &TableSet,
        progress: impl FnMut(Stage),
    ) -> Result<ExecutionResult> {
        match mode {
            Mode::Generate => self.generate_and_execute(request, tables, progress),
            Mode::Direct => self.direct_answer(request, tables, progress),
        }
    }

    pub fn generate_and_execute(
        &self,
        request: &str,
        tables: &TableSet,
        mut progress: impl FnMut(Stage),
    ) -> Result<ExecutionResult> {
        let sanitized = self.redact(request);
        progress(Stage::RequestSanitized);
        let prompt = generation_prompt(&sanitized, tables, |text| self.redact(text));
        let options = CompletionOptions {
            retry_limit: self.retry_limit,
            ..CompletionOptions::default()
        };
        let raw = self.client.complete(&prompt, &options)?;
        progress(Stage::CodeGenerated);
        let snippet = strip_code_fence(&raw);
        tracing::debug!(snippet = snippet.as_str(), "cleaned generated program");
        progress(Stage::CodeCleaned);
        let result = execute_snippet(&snippet, tables);
        progress(Stage::Executed);
        let restored = self.restore(result);
        progress(Stage::ResultSanitized);
        Ok(restored)
    }

    pub fn direct_answer(
        &self,
        request: &str,
        tables: &TableSet,
        mut progress: impl FnMut(Stage),
    ) -> Result<ExecutionResult> {
        let sanitized = self.redact(request);
        progress(Stage::RequestSanitized);
        let prompt = direct_prompt(&sanitized, tables, |text| self.redact(text));
        let options = CompletionOptions {
            temperature: DIRECT_TEMPERATURE,
            retry_limit: self.retry_limit,
            ..CompletionOptions::default()
        };
        progress(Stage::DirectAnswerRequested);
        let answer = self.client.complete(&prompt, &options)?;
        let restored = self.restore(ExecutionResult {
            result_table: None,
            summary: answer.trim().to_string(),
            program: None,
        });
        progress(Stage::ResultSanitized);
        Ok(restored)
    }

    fn redact(&self, text: &str) -> String {
        self.words.read().forward_substitute(text).0
    }

    fn restore(&self, result: ExecutionResult) -> ExecutionResult {
        let words = self.words.read();
        ExecutionResult {
            result_table: result
                .result_table
                .map(|table| table.map_text(|text| words.inverse_substitute(text))),
            summary: words.inverse_substitute(&result.summary),
            program: result.program,
        }
    }
}

/// Prompt asking for a table program over `data_dict`.
pub fn generation_prompt(
    request: &str,
    tables: &TableSet,
    redact: impl Fn(&str) -> String,
) -> String {
    let mut schema = String::new();
    for (name, table) in tables {
        let samples = table.head(GENERATION_SAMPLE_ROWS).map_text(&redact);
        schema.push_str(&format!(
            "- {DATA_DICT}[\"{name}\"]: columns {}\n  sample rows: {}\n",
            serde_json::to_string(table.column_names()).unwrap_or_default(),
            Value::Array(samples.to_records(GENERATION_SAMPLE_ROWS)),
        ));
    }
    format!(
        "Analysis request:\n{request}\n\n\
         Available data ({DATA_DICT} maps file name to table):\n{schema}\n\
         Write a JSON program that performs the analysis. Reply with the JSON only: \
         no function wrapper, no return statement, no explanation.\n\
         Program shape: {{\"steps\": [{{\"let\": NAME, \"value\": EXPR}}, ...]}}; steps run in order.\n\
         EXPR is one of:\n\
         - {{\"table\": {{\"from\": SOURCE, \"ops\": [OP, ...]}}}}\n\
         - {{\"scalar\": {{\"from\": SOURCE, \"column\": COLUMN, \"func\": AGG}}}}\n\
         - {{\"text\": TEMPLATE}} where TEMPLATE may use {{NAME}}, {{NAME.rows}}, {{NAME.columns}}, \
           {{NAME.first.COLUMN}} and {{{{ }}}} for literal braces\n\
         SOURCE: {{\"file\": FILE}} | {{\"var\": NAME}} | {{\"concat\": [SOURCE, ...]}} | {{\"all_files\": true}}\n\
         OP: {{\"select\": [COLUMN]}} | {{\"drop\": [COLUMN]}} | {{\"rename\": {{OLD: NEW}}}} | \
         {{\"filter\": PRED}} | {{\"sort\": [{{\"column\": COLUMN, \"descending\": BOOL}}]}} | \
         {{\"limit\": N}} | {{\"distinct\": [COLUMN]}} | \
         {{\"group_by\": {{\"keys\": [COLUMN], \"aggregations\": [{{\"column\": COLUMN, \"func\": AGG, \"alias\": NAME}}]}}}} | \
         {{\"cast\": {{\"column\": COLUMN, \"to\": \"text\"|\"int\"|\"float\"}}}} | \
         {{\"fill_null\": {{\"column\": COLUMN, \"value\": VALUE}}}} | \
         {{\"join\": {{\"with\": SOURCE, \"on\": [COLUMN], \"how\": \"inner\"|\"left\"}}}} | \
         {{\"value_counts\": COLUMN}}\n\
         PRED: {{\"compare\": {{\"column\": COLUMN, \"op\": CMP, \"value\": VALUE}}}} | {{\"all\": [PRED]}} | \
         {{\"any\": [PRED]}} | {{\"not\": PRED}}\n\
         CMP: eq ne gt ge lt le contains starts_with ends_with matches in is_null not_null\n\
         AGG: count sum mean min max count_distinct first last\n\
         The program must bind `{RESULT_TABLE}` to a table and `{SUMMARY}` to a text describing the findings.\n"
    )
}

/// Prompt asking for a natural-language answer from schema and statistics.
pub fn direct_prompt(request: &str, tables: &TableSet, redact: impl Fn(&str) -> String) -> String {
    let mut overview = String::new();
    for (name, table) in tables {
        let types: serde_json::Map<String, Value> = table
            .column_names()
            .iter()
            .map(|column| {
                let kind = table.column_type(column).unwrap_or(ColumnType::Null);
                (column.clone(), Value::String(kind.as_str().to_string()))
            })
            .collect();
        let samples = table.head(DIRECT_SAMPLE_ROWS).map_text(&redact);
        overview.push_str(&format!(
            "File: {name}\nRows: {}\nColumns: {}\nColumn types: {}\nSample rows: {}\n",
            table.height(),
            table.column_names().join(", "),
            Value::Object(types),
            Value::Array(samples.to_records(DIRECT_SAMPLE_ROWS)),
        ));
        let stats = numeric_stats(table);
        if !stats.is_empty() {
            overview.push_str(&format!("Numeric statistics: {}\n", Value::Object(stats)));
        }
        overview.push('\n');
    }
    format!(
        "Data overview:\n{overview}\
         Analysis request:\n{request}\n\n\
         Answer the request in natural language based on the data overview. \
         Do not write code.\n"
    )
}

fn numeric_stats(table: &Table) -> serde_json::Map<String, Value> {
    let mut stats = serde_json::Map::new();
    for (idx, column) in table.column_names().iter().enumerate() {
        let cells = table.column_at(idx);
        if !ColumnType::of(cells).is_numeric() {
            continue;
        }
        let values: Vec<f64> = cells.iter().filter_map(Cell::as_f64).collect();
        if values.is_empty() {
            continue;
        }
        let mean = values.iter().sum::<f64>() / values.len() as f64;
        let min = values.iter().copied().fold(f64::INFINITY, f64::min);
        let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        stats.insert(
            column.clone(),
            json!({ "mean": mean, "min": min, "max": max, "count": values.len() }),
        );
    }
    stats
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::words::WordStore;
    use loglens_llm::{LlmRequest, LlmResponse};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    fn tables() -> TableSet {
        let mut set = TableSet::new();
        set.insert(
            "auth.csv".into(),
            Table::from_rows(
                vec!["user".into(), "bytes".into()],
                vec![
                    vec![Cell::text("alice"), Cell::Int(5)],
                    vec![Cell::text("bob"), Cell::Int(7)],
                    vec![Cell::text("alice"), Cell::Int(9)],
                ],
            ),
        );
        set
    }

    fn words() -> SharedWordStore {
        let mut store = WordStore::in_memory();
        store.add("alice", Some("[PROTECTED_A]")).unwrap();
        SharedWordStore::new(store)
    }

    /// Oracle that records requests and always answers with `reply`.
    fn pipeline(reply: &'static str, seen: Arc<Mutex<Vec<LlmRequest>>>) -> Pipeline {
        let words = words();
        let client = CompletionClient::new(
            Arc::new(move |req: &LlmRequest| -> anyhow::Result<LlmResponse> {
                seen.lock().unwrap().push(req.clone());
                Ok(LlmResponse {
                    content: reply.to_string(),
                    prompt_tokens: 0,
                    completion_tokens: 0,
                })
            }),
            Duration::from_millis(0),
        )
        .with_redactor(Arc::new(words.clone()));
        Pipeline::new(client, words, 1)
    }

    #[test]
    fn strips_fences_with_language_tag() {
        assert_eq!(strip_code_fence("```json\n{\"steps\": []}\n```"), "{\"steps\": []}");
        assert_eq!(strip_code_fence("  ```\n{}\n```  "), "{}");
        assert_eq!(strip_code_fence("{\"a\": 1}"), "{\"a\": 1}");
        assert_eq!(strip_code_fence("```json {\"steps\": []}```"), "{\"steps\": []}");
    }

    #[test]
    fn fenced_program_executes() {
        let raw = "```json\n{\"steps\": [\
            {\"let\": \"result_table\", \"value\": {\"table\": {\"from\": {\"file\": \"auth.csv\"}}}},\
            {\"let\": \"summary\", \"value\": {\"text\": \"ok\"}}]}\n```";
        let result = execute_snippet(&strip_code_fence(raw), &tables());
        assert_eq!(result.result_table.as_ref(), tables().get("auth.csv"));
        assert_eq!(result.summary, "ok");
    }

    #[test]
    fn missing_summary_uses_fallback() {
        let result = execute_snippet(
            r#"{"steps": [{"let": "result_table", "value": {"text": "not a table"}}]}"#,
            &tables(),
        );
        assert!(result.result_table.is_none());
        assert_eq!(result.summary, NO_SUMMARY);
    }

    #[test]
    fn execution_errors_become_summary() {
        let snippet = r#"{"steps": [{"let": "result_table", "value": {"table": {"from": {"var": "df"}}}}]}"#;
        let result = execute_snippet(snippet, &tables());
        assert!(result.result_table.is_none());
        assert!(result.summary.starts_with("Code execution error: "));
        assert!(result.summary.contains("'df' is not defined"));
        assert!(result.summary.ends_with(&format!("Executed code:\n{snippet}")));
    }

    #[test]
    fn generation_prompt_is_redacted_and_results_restored() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let reply = "```json\n{\"steps\": [\
            {\"let\": \"result_table\", \"value\": {\"table\": {\"from\": {\"file\": \"auth.csv\"}, \"ops\": [\
                {\"filter\": {\"compare\": {\"column\": \"user\", \"op\": \"eq\", \"value\": \"[PROTECTED_A]\"}}}]}}},\
            {\"let\": \"summary\", \"value\": {\"text\": \"[PROTECTED_A] has {result_table.rows} rows\"}}]}\n```";
        let pipeline = pipeline(reply, seen.clone());
        let mut stages = Vec::new();
        let result = pipeline
            .generate_and_execute("what did alice do?", &tables(), |stage| stages.push(stage))
            .unwrap();
        let requests = seen.lock().unwrap();
        let prompt = &requests[0].user;
        assert!(prompt.contains(DATA_DICT));
        assert!(prompt.contains("[PROTECTED_A]"));
        assert!(!prompt.contains("alice"));
        assert_eq!(requests[0].max_tokens, Some(5000));
        assert_eq!(result.summary, "alice has 2 rows");
        let table = result.result_table.unwrap();
        assert_eq!(table.height(), 2);
        assert_eq!(table.cell(0, 0), &Cell::text("alice"));
        assert_eq!(
            stages,
            vec![
                Stage::RequestSanitized,
                Stage::CodeGenerated,
                Stage::CodeCleaned,
                Stage::Executed,
                Stage::ResultSanitized,
            ]
        );
    }

    #[test]
    fn direct_answer_includes_statistics() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let pipeline = pipeline("  [protected_a] sent the most bytes  ", seen.clone());
        let result = pipeline
            .direct_answer("who sent most?", &tables(), |_| {})
            .unwrap();
        assert_eq!(result.summary, "alice sent the most bytes");
        assert!(result.result_table.is_none());
        let request = seen.lock().unwrap()[0].clone();
        assert_eq!(request.max_tokens, Some(5000));
        assert_eq!(request.temperature, Some(0.6));
        let prompt = request.user;
        assert!(prompt.contains("Rows: 3"));
        assert!(prompt.contains("\"bytes\":\"int64\""));
        assert!(prompt.contains("\"max\":9.0"));
        assert!(!prompt.contains("alice"));
    }
}
