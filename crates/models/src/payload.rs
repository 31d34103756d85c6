use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Version tag carried on every inter-stage message.
pub const PAYLOAD_VERSION: u32 = 1;

/// Exchange carrying raw object-store upload events.
pub const UPLOAD_EXCHANGE: &str = "inbound.s3";
/// Exchange carrying completed matches.
pub const MATCHED_EXCHANGE: &str = "inbound.matched";

/// Exchange routing ingest-checked payloads to the project's validator.
pub fn to_validate_exchange(project: &str) -> String {
    format!("inbound.to_validate.{project}")
}

/// Per-site result exchange: every stage reports here, success or failure.
pub fn results_exchange(project: &str, site: &str) -> String {
    format!("inbound.results.{project}.{site}")
}

/// Minimal committed-artifact notifications for downstream consumers.
pub fn new_artifact_exchange(project: &str) -> String {
    format!("inbound.new_artifact.{project}")
}

/// The pipeline stage which last touched a payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Matched,
    Ingest,
    Validator,
}

/// One uploaded file of a submission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileMeta {
    pub uri: String,
    pub etag: String,
    pub key: String,
    pub uploader: String,
    pub last_seen: DateTime<Utc>,
}

/// Accumulated field-keyed error messages for one stage. Stages append and
/// never clear; the map rides the payload to the result exchange.
pub type ErrorMap = BTreeMap<String, Vec<String>>;

pub fn record_error(map: &mut ErrorMap, field: &str, message: impl Into<String>) {
    map.entry(field.to_string()).or_default().push(message.into());
}

/// One complete, self-consistent file set, emitted by the matcher.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchMessage {
    pub payload_version: u32,
    pub stage: Stage,
    pub uuid: Uuid,
    pub artifact: String,
    pub project: String,
    pub sample_id: String,
    pub run_id: String,
    pub platform: String,
    pub site: String,
    pub uploaders: Vec<String>,
    /// Extension to file, covering exactly the project/platform file set.
    pub files: BTreeMap<String, FileMeta>,
    pub test_flag: bool,
    /// Nanoseconds since the epoch.
    pub match_timestamp: i64,
}

/// The match message as annotated by ingest and the project validator.
/// Later-stage fields default so that a payload can be deserialised at any
/// stage of its life.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationPayload {
    pub payload_version: u32,
    pub stage: Stage,
    pub uuid: Uuid,
    pub artifact: String,
    pub project: String,
    pub sample_id: String,
    pub run_id: String,
    pub platform: String,
    pub site: String,
    pub uploaders: Vec<String>,
    pub files: BTreeMap<String, FileMeta>,
    pub test_flag: bool,
    pub match_timestamp: i64,
    pub ingest_timestamp: i64,

    // Filled by ingest.
    #[serde(default)]
    pub onyx_test_create_status: bool,
    #[serde(default)]
    pub onyx_test_status_code: Option<u16>,
    #[serde(default)]
    pub onyx_test_create_errors: ErrorMap,
    /// Gate into workflow execution.
    #[serde(default)]
    pub validate: bool,

    // Filled by the project validator.
    #[serde(default)]
    pub climb_id: Option<String>,
    #[serde(default)]
    pub created: bool,
    #[serde(default)]
    pub ingested: bool,
    #[serde(default)]
    pub onyx_create_status: bool,
    #[serde(default)]
    pub onyx_status_code: Option<u16>,
    #[serde(default)]
    pub onyx_create_errors: ErrorMap,
    #[serde(default)]
    pub ingest_errors: Vec<String>,
    #[serde(default)]
    pub test_ingest_result: bool,
}

impl ValidationPayload {
    /// Carry a match into the validation stages. `ingest_timestamp` is
    /// stamped by the caller so tests stay deterministic.
    pub fn from_match(matched: MatchMessage, ingest_timestamp: i64) -> Self {
        let MatchMessage {
            payload_version,
            stage: _,
            uuid,
            artifact,
            project,
            sample_id,
            run_id,
            platform,
            site,
            uploaders,
            files,
            test_flag,
            match_timestamp,
        } = matched;

        Self {
            payload_version,
            stage: Stage::Ingest,
            uuid,
            artifact,
            project,
            sample_id,
            run_id,
            platform,
            site,
            uploaders,
            files,
            test_flag,
            match_timestamp,
            ingest_timestamp,
            onyx_test_create_status: false,
            onyx_test_status_code: None,
            onyx_test_create_errors: ErrorMap::new(),
            validate: false,
            climb_id: None,
            created: false,
            ingested: false,
            onyx_create_status: false,
            onyx_status_code: None,
            onyx_create_errors: ErrorMap::new(),
            ingest_errors: Vec::new(),
            test_ingest_result: false,
        }
    }

    pub fn record_test_error(&mut self, field: &str, message: impl Into<String>) {
        record_error(&mut self.onyx_test_create_errors, field, message);
    }

    pub fn record_create_error(&mut self, field: &str, message: impl Into<String>) {
        record_error(&mut self.onyx_create_errors, field, message);
    }
}

/// User-visible matcher-stage failure, published to the result exchange
/// for events which never became a match (malformed names, conflicting
/// submissions, already-published records).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchReport {
    pub payload_version: u32,
    pub stage: Stage,
    pub project: String,
    pub site: String,
    pub errors: Vec<String>,
    /// Nanoseconds since the epoch.
    pub timestamp: i64,
}

/// Published to `inbound.new_artifact.<project>` after a committed success.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewArtifact {
    pub ingest_timestamp: i64,
    pub climb_id: String,
    pub site: String,
    pub platform: String,
    pub match_uuid: Uuid,
}
