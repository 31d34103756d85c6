//! Project validator for the metagenomics project: runs the
//! classification workflow over each approved submission, rejects
//! insufficiently dehumanised uploads, publishes cleaned reads, the
//! analysis report, per-classifier taxon reports and per-taxon binned
//! reads, and commits the record.

mod summary;

pub use summary::{human_fraction, QcMetrics, ReadsSummaryEntry, SummaryError};

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use models::ValidationPayload;
use onyx_client::Records;
use serde_json::Value;
use validator::exec::{RunStatus, Workflow};
use validator::publish::Publisher;
use validator::submit::{self, CreateOutcome, OpOutcome};

/// Submissions whose human-classified read fraction exceeds this are
/// rejected outright.
pub const DEFAULT_HUMAN_THRESHOLD: f64 = 0.001;

const HUMAN_REJECTION: &str = "Human reads detected above rejection threshold, please ensure \
     pre-upload dehumanisation has been performed properly";

/// How one validation ended.
#[derive(Debug)]
pub enum Terminal {
    /// Committed success: record published, artifacts live.
    Committed,
    /// Done, report only: a test run, an idempotent redelivery, or a
    /// failure recorded on the payload.
    Report,
    /// Recoverable failure: retry through the worker pool.
    Transient(String),
}

pub struct Validator<R> {
    pub records: R,
    pub store: objstore::Store,
    pub workflow: Workflow,
    pub result_dir: PathBuf,
    pub human_threshold: f64,
}

/// Workflow parameters for one submission: the read locations by
/// platform, plus the output directory keyed by submission UUID.
pub fn workflow_params(
    payload: &ValidationPayload,
    result_dir: &Path,
) -> Result<BTreeMap<String, String>, String> {
    let mut params = BTreeMap::new();
    params.insert(
        "out_dir".to_string(),
        result_dir.display().to_string(),
    );
    params.insert("sample_uuid".to_string(), payload.uuid.to_string());

    let uri = |ext: &str| -> Result<String, String> {
        payload
            .files
            .get(ext)
            .map(|meta| meta.uri.clone())
            .ok_or_else(|| format!("match carries no {ext} file"))
    };

    match payload.platform.as_str() {
        "illumina" => {
            params.insert("fastq_1".to_string(), uri(".1.fastq.gz")?);
            params.insert("fastq_2".to_string(), uri(".2.fastq.gz")?);
            params.insert("paired".to_string(), "true".to_string());
        }
        _ => {
            params.insert("fastq".to_string(), uri(".fastq.gz")?);
        }
    }

    Ok(params)
}

/// One derived artifact to publish, with the record field it is written
/// back under. Multi-file kinds share a field and accumulate a list.
#[derive(Debug, PartialEq)]
pub struct PlannedUpload {
    pub kind: &'static str,
    pub key: String,
    pub path: PathBuf,
    pub field: &'static str,
}

#[derive(Debug, thiserror::Error)]
pub enum PlanError {
    #[error("workflow results are missing {artifact}")]
    Missing { artifact: &'static str },
    #[error("failed to scan workflow results")]
    Io(#[from] std::io::Error),
}

/// Enumerate the publications for a completed run: cleaned reads, the
/// report, every classifier's taxon report, and each binned-read file.
pub async fn publication_plan(
    result_path: &Path,
    uuid: &uuid::Uuid,
    climb_id: &str,
) -> Result<Vec<PlannedUpload>, PlanError> {
    let mut plan = Vec::new();

    let reads = result_path
        .join("preprocess")
        .join(format!("{uuid}.fastp.fastq.gz"));
    if !reads.is_file() {
        return Err(PlanError::Missing {
            artifact: "cleaned reads",
        });
    }
    plan.push(PlannedUpload {
        kind: "reads",
        key: format!("{climb_id}.fastq.gz"),
        path: reads,
        field: "reads",
    });

    let report = result_path.join(format!("{uuid}_report.html"));
    if !report.is_file() {
        return Err(PlanError::Missing {
            artifact: "analysis report",
        });
    }
    plan.push(PlannedUpload {
        kind: "reports",
        key: format!("{climb_id}_report.html"),
        path: report,
        field: "ingest_report",
    });

    let mut classifications = tokio::fs::read_dir(result_path.join("classifications")).await?;
    while let Some(entry) = classifications.next_entry().await? {
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.ends_with("_report.txt") || name.ends_with(".kraken_report.txt") {
            plan.push(PlannedUpload {
                kind: "taxon-reports",
                key: format!("{climb_id}/{name}"),
                path: entry.path(),
                field: "taxon_reports",
            });
        }
    }

    for entry in summary::read_summary(result_path).await.map_err(|_| {
        PlanError::Missing {
            artifact: "binned-read summary",
        }
    })? {
        for filename in &entry.filenames {
            // Binned reads are summarised by their uncompressed name but
            // written gzipped.
            let gz = format!("{filename}.gz");
            let path = result_path.join("reads_by_taxa").join(&gz);
            if !path.is_file() {
                return Err(PlanError::Missing {
                    artifact: "binned reads",
                });
            }
            plan.push(PlannedUpload {
                kind: "binned-reads",
                key: format!("{climb_id}/{}.fastq.gz", entry.taxon),
                path,
                field: "binned_reads",
            });
        }
    }

    Ok(plan)
}

impl<R: Records> Validator<R> {
    /// Run the full validation state machine for one payload. Failures
    /// are recorded on the payload; the caller reports it at every
    /// terminal.
    #[tracing::instrument(skip_all, fields(artifact = %payload.artifact, uuid = %payload.uuid))]
    pub async fn validate(&self, payload: &mut ValidationPayload) -> Terminal {
        if !payload.onyx_test_create_status || !payload.validate {
            tracing::info!("payload arrived unvalidated, reporting as-is");
            return Terminal::Report;
        }

        // Content already attached to a published record is not ingested
        // twice.
        let fastq_etag = [".fastq.gz", ".1.fastq.gz"]
            .iter()
            .find_map(|ext| payload.files.get(*ext))
            .map(|meta| meta.etag.clone());
        if let Some(etag) = fastq_etag {
            match submit::ensure_file_unseen(&self.records, payload, "reads_etag", &etag).await {
                OpOutcome::Ok => (),
                OpOutcome::Failed { .. } => return Terminal::Report,
                OpOutcome::Transient(reason) => return Terminal::Transient(reason),
            }
        }

        let result_path = self.result_dir.join(payload.uuid.to_string());
        if let Err(err) = tokio::fs::create_dir_all(&result_path).await {
            return Terminal::Transient(format!("failed to create result directory: {err}"));
        }

        let params = match workflow_params(payload, &result_path) {
            Ok(params) => params,
            Err(message) => {
                payload.ingest_errors.push(message);
                return Terminal::Report;
            }
        };

        let run = match self.workflow.execute(&params, &result_path).await {
            Ok(run) => run,
            Err(err) => {
                return Terminal::Transient(format!("failed to launch workflow: {err:#}"));
            }
        };
        if let Err(err) = run.persist(&result_path).await {
            tracing::warn!(error = %err, "failed to persist workflow logs");
        }

        let terminal = self.after_workflow(payload, run.status, &result_path).await;

        // Intermediate workflow state is removed at every terminal.
        if let Err(err) = self.workflow.clean(&run.stdout).await {
            tracing::warn!(error = %err, "workflow clean pass failed");
        }
        terminal
    }

    async fn after_workflow(
        &self,
        payload: &mut ValidationPayload,
        status: RunStatus,
        result_path: &Path,
    ) -> Terminal {
        match status {
            RunStatus::TimedOut => {
                tracing::error!("workflow timed out");
                payload
                    .ingest_errors
                    .push("validation workflow timed out".to_string());
                return Terminal::Report;
            }
            RunStatus::Exited(0) => (),
            RunStatus::Exited(code) => {
                tracing::error!(code, "workflow exited nonzero");
                payload
                    .ingest_errors
                    .push(format!("validation workflow exited with non-0 exit code: {code}"));
                return Terminal::Report;
            }
        }

        let uuid = payload.uuid;
        if validator::trace::evaluate(result_path, &uuid, payload).await {
            return Terminal::Report;
        }

        match summary::human_fraction(result_path).await {
            Ok(fraction) if fraction > self.human_threshold => {
                tracing::warn!(fraction, "rejecting insufficiently dehumanised submission");
                payload.ingest_errors.push(HUMAN_REJECTION.to_string());
                return Terminal::Report;
            }
            Ok(_) => (),
            Err(err) => {
                tracing::error!(error = %err, "unreadable binned-read summary");
                payload
                    .ingest_errors
                    .push("could not read the binned-read summary".to_string());
                return Terminal::Report;
            }
        }

        // Test submissions validate end-to-end but never create records
        // or publish artifacts.
        if payload.test_flag {
            payload.test_ingest_result = true;
            tracing::info!("test submission validated");
            return Terminal::Report;
        }

        let Some(metadata_file) = payload.files.get(".csv").cloned() else {
            payload
                .ingest_errors
                .push("match is missing its metadata CSV".to_string());
            return Terminal::Report;
        };
        let metadata = match self
            .store
            .get_verified(&metadata_file.uri, &metadata_file.etag)
            .await
        {
            Ok(metadata) => metadata,
            Err(err) if err.is_integrity() => {
                payload.ingest_errors.push(err.to_string());
                return Terminal::Report;
            }
            Err(err) => return Terminal::Transient(format!("failed to fetch metadata: {err:#}")),
        };

        match submit::create_record(&self.records, payload, &metadata).await {
            CreateOutcome::Created => (),
            CreateOutcome::AlreadyPublished => {
                payload.ingested = true;
                return Terminal::Report;
            }
            CreateOutcome::Failed { .. } => return Terminal::Report,
            CreateOutcome::Transient(reason) => return Terminal::Transient(reason),
        }

        let climb_id = payload
            .climb_id
            .clone()
            .expect("create_record set the climb_id");

        let plan = match publication_plan(result_path, &uuid, &climb_id).await {
            Ok(plan) => plan,
            Err(err) => {
                tracing::error!(error = %err, "cannot plan publications");
                payload.ingest_errors.push(err.to_string());
                return Terminal::Report;
            }
        };

        let mut publisher = Publisher::new(&self.store);
        let mut fields: BTreeMap<String, Value> = BTreeMap::new();
        let mut lists: BTreeMap<&str, Vec<Value>> = BTreeMap::new();

        for upload in &plan {
            let bucket = models::publication_bucket(&payload.project, upload.kind);
            match publisher.publish(&bucket, &upload.key, &upload.path).await {
                Ok(published) => match upload.field {
                    field @ ("taxon_reports" | "binned_reads") => {
                        lists
                            .entry(field)
                            .or_default()
                            .push(Value::String(published.uri));
                    }
                    field => {
                        fields.insert(field.to_string(), Value::String(published.uri));
                        fields.insert(
                            format!("{field}_url"),
                            Value::String(published.presigned_url),
                        );
                    }
                },
                Err(err) => {
                    tracing::error!(error = %err, key = %upload.key, "publication failed");
                    payload
                        .ingest_errors
                        .push(format!("failed to publish {}", upload.kind));
                    publisher.rollback(payload).await;
                    return Terminal::Report;
                }
            }
        }
        for (field, values) in lists {
            fields.insert(field.to_string(), Value::Array(values));
        }

        match submit::update_record(&self.records, payload, &fields).await {
            OpOutcome::Ok => (),
            OpOutcome::Failed { .. } => {
                publisher.rollback(payload).await;
                return Terminal::Report;
            }
            OpOutcome::Transient(reason) => {
                publisher.rollback(payload).await;
                return Terminal::Transient(reason);
            }
        }

        match submit::unsuppress_record(&self.records, payload).await {
            OpOutcome::Ok => (),
            OpOutcome::Failed { .. } => {
                publisher.rollback(payload).await;
                return Terminal::Report;
            }
            OpOutcome::Transient(reason) => {
                publisher.rollback(payload).await;
                return Terminal::Transient(reason);
            }
        }

        payload.ingested = true;
        tracing::info!(%climb_id, "submission committed");
        Terminal::Committed
    }
}
