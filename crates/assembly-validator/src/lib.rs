//! Project validator for the bacterial-assembly project: runs the
//! assembly workflow, publishes the polished assembly, shares it with the
//! downstream genome registry, and commits the record.

mod registry;

pub use registry::{registry_metadata, HttpRegistry, Registry, RegistryError};

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use models::ValidationPayload;
use onyx_client::Records;
use serde_json::Value;
use validator::exec::{RunStatus, Workflow};
use validator::publish::Publisher;
use validator::submit::{self, CreateOutcome, OpOutcome};

/// How one validation ended.
#[derive(Debug)]
pub enum Terminal {
    Committed,
    Report,
    Transient(String),
}

pub struct Validator<R, G> {
    pub records: R,
    pub registry: G,
    pub store: objstore::Store,
    pub workflow: Workflow,
    pub result_dir: PathBuf,
}

/// Assembly workflows take the paired reads and an output directory
/// keyed by submission UUID.
pub fn workflow_params(
    payload: &ValidationPayload,
    result_dir: &Path,
) -> Result<BTreeMap<String, String>, String> {
    let uri = |ext: &str| -> Result<String, String> {
        payload
            .files
            .get(ext)
            .map(|meta| meta.uri.clone())
            .ok_or_else(|| format!("match carries no {ext} file"))
    };

    Ok(BTreeMap::from([
        ("out_dir".to_string(), result_dir.display().to_string()),
        ("sample_uuid".to_string(), payload.uuid.to_string()),
        ("fastq_1".to_string(), uri(".1.fastq.gz")?),
        ("fastq_2".to_string(), uri(".2.fastq.gz")?),
    ]))
}

/// The polished assembly the workflow leaves behind.
pub fn assembly_path(result_path: &Path, uuid: &uuid::Uuid) -> PathBuf {
    result_path
        .join("assembly")
        .join(format!("{uuid}.result.fasta"))
}

impl<R: Records, G: Registry> Validator<R, G> {
    #[tracing::instrument(skip_all, fields(artifact = %payload.artifact, uuid = %payload.uuid))]
    pub async fn validate(&self, payload: &mut ValidationPayload) -> Terminal {
        if !payload.onyx_test_create_status || !payload.validate {
            tracing::info!("payload arrived unvalidated, reporting as-is");
            return Terminal::Report;
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

        let assembly = assembly_path(result_path, &uuid);
        if !assembly.is_file() {
            payload
                .ingest_errors
                .push("workflow results are missing the polished assembly".to_string());
            return Terminal::Report;
        }

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

        let mut publisher = Publisher::new(&self.store);
        let bucket = models::publication_bucket(&payload.project, "assemblies");
        let key = format!("{climb_id}.assembly.fasta");

        let published = match publisher.publish(&bucket, &key, &assembly).await {
            Ok(published) => published,
            Err(err) => {
                tracing::error!(error = %err, "assembly publication failed");
                payload
                    .ingest_errors
                    .push("failed to publish assembly".to_string());
                return Terminal::Report;
            }
        };

        let fields = BTreeMap::from([
            ("assembly".to_string(), Value::String(published.uri.clone())),
            (
                "assembly_url".to_string(),
                Value::String(published.presigned_url.clone()),
            ),
        ]);
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

        if let Err(terminal) = self
            .submit_to_registry(payload, &climb_id, &published.presigned_url)
            .await
        {
            publisher.rollback(payload).await;
            return terminal;
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

    /// Share the published assembly with the genome registry and write
    /// the registry's identifier back onto the record.
    async fn submit_to_registry(
        &self,
        payload: &mut ValidationPayload,
        climb_id: &str,
        download_url: &str,
    ) -> Result<(), Terminal> {
        let filter = BTreeMap::from([("climb_id".to_string(), climb_id.to_string())]);
        let record = match self.records.filter(&payload.project, &filter).await {
            Ok(records) => match records.into_iter().next() {
                Some(record) => record,
                None => {
                    payload.record_create_error(
                        "onyx_errors",
                        "created record could not be retrieved for registry submission",
                    );
                    return Err(Terminal::Report);
                }
            },
            Err(err @ (onyx_client::Error::Connection(_) | onyx_client::Error::Server { .. })) => {
                return Err(Terminal::Transient(format!("record fetch failed: {err:#}")));
            }
            Err(err) => {
                payload.record_create_error("onyx_errors", err.to_string());
                return Err(Terminal::Report);
            }
        };

        let registry_id = match self
            .registry
            .submit_genome(download_url, &registry_metadata(&record))
            .await
        {
            Ok(id) => id,
            Err(RegistryError::Connection(err)) => {
                return Err(Terminal::Transient(format!(
                    "registry submission failed: {err}"
                )));
            }
            Err(err) => {
                tracing::error!(error = %err, "registry rejected the submission");
                payload.ingest_errors.push(err.to_string());
                return Err(Terminal::Report);
            }
        };

        let fields = BTreeMap::from([(
            "registry_id".to_string(),
            Value::String(registry_id),
        )]);
        match submit::update_record(&self.records, payload, &fields).await {
            OpOutcome::Ok => Ok(()),
            OpOutcome::Failed { .. } => Err(Terminal::Report),
            OpOutcome::Transient(reason) => Err(Terminal::Transient(reason)),
        }
    }
}
