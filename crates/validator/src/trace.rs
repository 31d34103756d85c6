use std::path::Path;

use models::ValidationPayload;
use serde::Deserialize;
use uuid::Uuid;

/// One row of the workflow's tab-separated execution trace.
#[derive(Debug, Deserialize)]
pub struct ProcessTrace {
    pub name: String,
    pub status: String,
    pub exit: String,
}

#[derive(Debug, thiserror::Error)]
pub enum TraceError {
    #[error("failed to read workflow execution trace")]
    Io(#[from] std::io::Error),
    #[error("failed to parse workflow execution trace")]
    Parse(#[from] csv::Error),
}

pub fn trace_path(result_dir: &Path, uuid: &Uuid) -> std::path::PathBuf {
    result_dir
        .join("pipeline_info")
        .join(format!("execution_trace_{uuid}.txt"))
}

fn parse(raw: &[u8]) -> Result<Vec<ProcessTrace>, TraceError> {
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(b'\t')
        .from_reader(raw);

    Ok(reader.deserialize().collect::<Result<_, _>>()?)
}

/// Interpret the execution trace for a run whose launcher exited zero:
/// any process with a nonzero exit still fails the ingest, with the
/// process name and exit code surfaced to the submitter. Returns whether
/// the ingest has failed.
pub async fn evaluate(
    result_dir: &Path,
    uuid: &Uuid,
    payload: &mut ValidationPayload,
) -> bool {
    let path = trace_path(result_dir, uuid);

    let traces = match tokio::fs::read(&path).await.map_err(TraceError::from) {
        Ok(raw) => match parse(&raw) {
            Ok(traces) => traces,
            Err(err) => {
                tracing::error!(?path, error = %err, "unparseable execution trace");
                payload
                    .ingest_errors
                    .push("could not parse the workflow execution trace".to_string());
                return true;
            }
        },
        Err(err) => {
            tracing::error!(?path, error = %err, "could not open execution trace");
            payload
                .ingest_errors
                .push("could not open the workflow execution trace".to_string());
            return true;
        }
    };

    let mut failed = false;
    for process in &traces {
        if process.exit != "0" {
            // Trace names carry the full workflow scope; the last segment
            // is the process itself.
            let name = process.name.rsplit(':').next().unwrap_or(&process.name);
            payload.ingest_errors.push(format!(
                "workflow process {name} failed with exit code {} and status {}",
                process.exit, process.status,
            ));
            failed = true;
        }
    }
    failed
}
