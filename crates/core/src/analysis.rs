//! Background analysis runs.
//!
//! Each call to [`Analyzer::start`] spawns one worker thread that loads the
//! selected files, drives the pipeline and reports back over a channel. The
//! caller never blocks on the oracle unless it chooses to wait.

use std::path::PathBuf;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::Mutex;

use crate::error::{LensError, Result};
use crate::loader::TableLoader;
use crate::pipeline::{ExecutionResult, Mode, Pipeline, Stage};

#[derive(Debug, Clone)]
pub struct AnalysisJob {
    pub request: String,
    pub files: Vec<String>,
    pub mode: Mode,
}

#[derive(Debug, Clone)]
pub enum AnalysisEvent {
    Progress(Stage),
    Completed(ExecutionResult),
    Failed(String),
}

pub struct AnalysisHandle {
    events: Receiver<AnalysisEvent>,
    worker: JoinHandle<()>,
}

impl AnalysisHandle {
    /// Blocks until the run finishes, passing every progress stage to
    /// `on_progress`.
    pub fn wait(self, mut on_progress: impl FnMut(&Stage)) -> Result<ExecutionResult> {
        let mut outcome = None;
        for event in self.events.iter() {
            match event {
                AnalysisEvent::Progress(stage) => on_progress(&stage),
                AnalysisEvent::Completed(result) => {
                    outcome = Some(Ok(result));
                    break;
                }
                AnalysisEvent::Failed(reason) => {
                    outcome = Some(Err(LensError::Analysis(reason)));
                    break;
                }
            }
        }
        if self.worker.join().is_err() {
            return Err(LensError::Analysis("analysis worker panicked".to_string()));
        }
        outcome.unwrap_or_else(|| {
            Err(LensError::Analysis(
                "analysis worker stopped without a result".to_string(),
            ))
        })
    }
}

#[derive(Clone)]
pub struct Analyzer {
    pipeline: Arc<Pipeline>,
    loader: Arc<Mutex<TableLoader>>,
    data_dir: PathBuf,
}

impl Analyzer {
    pub fn new(pipeline: Arc<Pipeline>, loader: Arc<Mutex<TableLoader>>, data_dir: PathBuf) -> Self {
        Self {
            pipeline,
            loader,
            data_dir,
        }
    }

    pub fn start(&self, job: AnalysisJob) -> AnalysisHandle {
        let (sender, events) = mpsc::channel();
        let analyzer = self.clone();
        let worker = thread::spawn(move || {
            let outcome = analyzer.run(&job, &sender);
            let event = match outcome {
                Ok(result) => {
                    let _ = sender.send(AnalysisEvent::Progress(Stage::Complete));
                    AnalysisEvent::Completed(result)
                }
                Err(err) => {
                    let reason = err.to_string();
                    tracing::error!("analysis failed: {reason}");
                    let _ = sender.send(AnalysisEvent::Progress(Stage::Failed(reason.clone())));
                    AnalysisEvent::Failed(reason)
                }
            };
            let _ = sender.send(event);
        });
        AnalysisHandle { events, worker }
    }

    fn run(&self, job: &AnalysisJob, sender: &Sender<AnalysisEvent>) -> Result<ExecutionResult> {
        let _ = sender.send(AnalysisEvent::Progress(Stage::Idle));
        if job.request.trim().is_empty() {
            return Err(LensError::Analysis("analysis request is empty".to_string()));
        }
        let tables = self.loader.lock().load(&self.data_dir, &job.files)?;
        tracing::info!(files = tables.len(), mode = ?job.mode, "starting analysis");
        self.pipeline.run(job.mode, &job.request, &tables, |stage| {
            tracing::info!(stage = %stage, "analysis progress");
            let _ = sender.send(AnalysisEvent::Progress(stage));
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loader::LoaderOptions;
    use crate::words::{SharedWordStore, WordStore};
    use loglens_llm::{CompletionClient, LlmRequest, LlmResponse};
    use std::fs;
    use std::time::Duration;
    use tempfile::tempdir;

    fn analyzer(dir: PathBuf, reply: &'static str) -> Analyzer {
        let words = SharedWordStore::new(WordStore::in_memory());
        let client = CompletionClient::new(
            Arc::new(move |_: &LlmRequest| -> anyhow::Result<LlmResponse> {
                Ok(LlmResponse {
                    content: reply.to_string(),
                    prompt_tokens: 0,
                    completion_tokens: 0,
                })
            }),
            Duration::from_millis(0),
        );
        Analyzer::new(
            Arc::new(Pipeline::new(client, words, 1)),
            Arc::new(Mutex::new(TableLoader::new(LoaderOptions::default()))),
            dir,
        )
    }

    #[test]
    fn worker_reports_progress_and_result() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("a.csv"), "host,hits\nweb,3\n").unwrap();
        let analyzer = analyzer(
            dir.path().to_path_buf(),
            r#"{"steps": [{"let": "result_table", "value": {"table": {"from": {"file": "a.csv"}}}},
                {"let": "summary", "value": {"text": "{result_table.rows} host"}}]}"#,
        );
        let handle = analyzer.start(AnalysisJob {
            request: "list hosts".into(),
            files: vec!["a.csv".into()],
            mode: Mode::Generate,
        });
        let mut stages = Vec::new();
        let result = handle.wait(|stage| stages.push(stage.clone())).unwrap();
        assert_eq!(result.summary, "1 host");
        assert_eq!(stages.first(), Some(&Stage::Idle));
        assert_eq!(stages.last(), Some(&Stage::Complete));
    }

    #[test]
    fn load_errors_fail_the_run() {
        let dir = tempdir().unwrap();
        let analyzer = analyzer(dir.path().to_path_buf(), "unused");
        let handle = analyzer.start(AnalysisJob {
            request: "anything".into(),
            files: vec!["missing.csv".into()],
            mode: Mode::Direct,
        });
        let mut stages = Vec::new();
        let err = handle.wait(|stage| stages.push(stage.clone())).unwrap_err();
        assert!(matches!(err, LensError::Analysis(_)));
        assert!(matches!(stages.last(), Some(Stage::Failed(_))));
    }

    #[test]
    fn empty_request_still_starts_idle() {
        let dir = tempdir().unwrap();
        let analyzer = analyzer(dir.path().to_path_buf(), "unused");
        let handle = analyzer.start(AnalysisJob {
            request: "   ".into(),
            files: vec!["a.csv".into()],
            mode: Mode::Generate,
        });
        let mut stages = Vec::new();
        let err = handle.wait(|stage| stages.push(stage.clone())).unwrap_err();
        assert!(err.to_string().contains("empty"));
        assert_eq!(stages.first(), Some(&Stage::Idle));
        assert!(matches!(stages.last(), Some(Stage::Failed(_))));
        assert_eq!(stages.len(), 2);
    }
}
