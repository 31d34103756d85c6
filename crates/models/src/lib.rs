mod config;
mod event;
mod name;
mod payload;

pub use config::{publication_bucket, ConfigError, FilesetSpec, PipelineConfig, ProjectConfig};
pub use event::{EventEnvelope, EventRecord, UploadedObject};
pub use name::{is_valid_identifier, BucketName, Environment, ObjectName, ParseError};
pub use payload::{
    new_artifact_exchange, record_error, results_exchange, to_validate_exchange, ErrorMap,
    FileMeta, MatchMessage, MatchReport, NewArtifact, Stage, ValidationPayload,
    MATCHED_EXCHANGE, PAYLOAD_VERSION, UPLOAD_EXCHANGE,
};
