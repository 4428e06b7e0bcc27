use std::io::{self, Write};

use anyhow::Result;
use loglens_core::{export_result, AnalysisJob, ExecutionResult, Mode};

use crate::context::AppContext;
use crate::logging;

pub struct AnalyzeArgs {
    pub request: String,
    pub files: Vec<String>,
    pub all: bool,
    pub mode: Mode,
    pub save: bool,
    pub name: String,
    pub save_summary: bool,
    pub preview: usize,
}

pub fn run(ctx: &AppContext, args: AnalyzeArgs) -> Result<()> {
    let analyzer = ctx.analyzer()?;
    let files = ctx.select_files(args.files, args.all)?;
    logging::stage(
        "analyze",
        format!("{} file(s): {}", files.len(), files.join(", ")),
    );
    let handle = analyzer.start(AnalysisJob {
        request: args.request,
        files,
        mode: args.mode,
    });
    let result = handle.wait(|stage| logging::stage("analyze", stage.to_string()))?;

    if let Some(program) = &result.program {
        logging::verbose(format!("executed program:\n{program}"));
    }
    print_result(&result, args.preview)?;

    if args.save {
        let exported = export_result(&result, &ctx.config.save_dir, &args.name, args.save_summary)?;
        if let Some(path) = exported.table {
            logging::stage("export", format!("result table saved to {}", path.display()));
        }
        if let Some(path) = exported.summary {
            logging::stage("export", format!("summary saved to {}", path.display()));
        }
    }
    Ok(())
}

fn print_result(result: &ExecutionResult, preview: usize) -> Result<()> {
    let stdout = io::stdout();
    let mut out = stdout.lock();
    writeln!(out, "{}", result.summary)?;
    if let Some(table) = &result.result_table {
        writeln!(out)?;
        table.head(preview).write_csv(&mut out, b'\t')?;
        if table.height() > preview {
            writeln!(out, "... {} more row(s)", table.height() - preview)?;
        }
    }
    out.flush()?;
    Ok(())
}
