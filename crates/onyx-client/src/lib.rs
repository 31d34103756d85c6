//! Client for Onyx, the record service which owns canonical submission
//! records. Every operation applies the common retry discipline
//! (connection errors: three attempts, three seconds apart) and the
//! four-way error classification the pipeline stages key their behaviour
//! off: connection, server, permission, and request (per-field) failures.

mod client;
mod metadata;

pub use client::{Client, Config};
pub use metadata::parse_metadata;

use std::collections::BTreeMap;

/// Field name to accumulated messages, as returned by Onyx on request
/// errors and threaded onto pipeline payloads.
pub type FieldErrors = BTreeMap<String, Vec<String>>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("failed to reach Onyx")]
    Connection(#[source] reqwest::Error),
    #[error("Onyx returned server error {status}")]
    Server { status: u16, body: String },
    #[error("Onyx denied the request ({status})")]
    Forbidden { status: u16, body: String },
    #[error("Onyx rejected the request ({status})")]
    Request { status: u16, messages: FieldErrors },
    #[error("failed to decode Onyx response")]
    Decode(#[source] serde_json::Error),
    #[error("invalid Onyx endpoint URL")]
    Url(#[from] url::ParseError),
    #[error("metadata CSV is malformed")]
    Csv(#[from] csv::Error),
    #[error("metadata CSV contains no data rows")]
    EmptyMetadata,
    #[error("metadata CSV contains more than one data row")]
    MultilineMetadata,
}

impl Error {
    /// Whether a human operator should be paged: true for everything other
    /// than request errors, which are user-correctable and reported on the
    /// result exchange instead.
    pub fn should_alert(&self) -> bool {
        !matches!(
            self,
            Error::Request { .. } | Error::EmptyMetadata | Error::MultilineMetadata | Error::Csv(_)
        )
    }

    pub fn status_code(&self) -> Option<u16> {
        match self {
            Error::Server { status, .. }
            | Error::Forbidden { status, .. }
            | Error::Request { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Per-field messages of a request error, if that is what this is.
    pub fn field_messages(&self) -> Option<&FieldErrors> {
        match self {
            Error::Request { messages, .. } => Some(messages),
            _ => None,
        }
    }
}

/// Identifiers returned by a successful create.
#[derive(Debug, Clone, Default, serde::Deserialize)]
pub struct RecordIds {
    pub climb_id: Option<String>,
    pub sample_id: Option<String>,
    pub run_id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Created {
    pub status: u16,
    pub ids: RecordIds,
}

/// The record-service operations the pipeline depends on. Stages take this
/// trait so tests can substitute scripted implementations; `Client` is the
/// production implementation.
#[async_trait::async_trait]
pub trait Records: Send + Sync {
    /// Create a record from a single-row metadata CSV, merging
    /// `extra_fields` over the CSV columns. With `test` set the service
    /// validates without persisting.
    async fn csv_create(
        &self,
        project: &str,
        csv: &[u8],
        extra_fields: &BTreeMap<String, serde_json::Value>,
        test: bool,
    ) -> Result<Created, Error>;

    /// Resolve a sample or run identifier to its canonical form. `None`
    /// when the identifier is unknown to the project.
    async fn identify(
        &self,
        project: &str,
        field: &str,
        value: &str,
    ) -> Result<Option<String>, Error>;

    /// Membership query: all records of `project` matching `fields`.
    async fn filter(
        &self,
        project: &str,
        fields: &BTreeMap<String, String>,
    ) -> Result<Vec<serde_json::Value>, Error>;

    async fn update(
        &self,
        project: &str,
        climb_id: &str,
        fields: &BTreeMap<String, serde_json::Value>,
    ) -> Result<(), Error>;

    /// Flip a suppressed record to published. Only called after every
    /// downstream publication has succeeded.
    async fn unsuppress(&self, project: &str, climb_id: &str) -> Result<(), Error>;
}
