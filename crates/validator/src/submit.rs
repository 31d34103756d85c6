use std::collections::BTreeMap;

use models::ValidationPayload;
use onyx_client::{Error, Records};
use serde_json::Value;

/// Classified outcome of a record-service side effect.
#[derive(Debug)]
pub enum OpOutcome {
    Ok,
    /// Recorded on the payload; `alert` pages an operator.
    Failed { alert: bool },
    /// Worth another attempt (connection or server failure after the
    /// client's own bounded retries).
    Transient(String),
}

/// Outcome of the real (suppressed) record create.
#[derive(Debug)]
pub enum CreateOutcome {
    /// A record exists for this submission; `climb_id` is on the payload.
    /// Either it was created now, or an existing suppressed record was
    /// adopted and updated in place.
    Created,
    /// The identity is already published: this is a redelivery of an
    /// already-committed submission. Terminal success, no new work.
    AlreadyPublished,
    Failed { alert: bool },
    Transient(String),
}

fn extra_fields(payload: &ValidationPayload) -> BTreeMap<String, Value> {
    [
        ("site".to_string(), Value::String(payload.site.clone())),
        (
            "sample_id".to_string(),
            Value::String(payload.sample_id.clone()),
        ),
        ("run_id".to_string(), Value::String(payload.run_id.clone())),
        // Records are created suppressed and only published after every
        // downstream publication succeeds.
        ("is_published".to_string(), Value::Bool(false)),
    ]
    .into_iter()
    .collect()
}

fn record_onyx_error(payload: &mut ValidationPayload, err: &Error) {
    match err.field_messages() {
        Some(messages) => {
            for (field, field_messages) in messages {
                for message in field_messages {
                    payload.record_create_error(field, message.clone());
                }
            }
        }
        None => payload.record_create_error("onyx_errors", err.to_string()),
    }
    if let Some(status) = err.status_code() {
        payload.onyx_status_code = Some(status);
    }
}

/// Create the submission's record from its metadata CSV. A create
/// rejection is re-examined against the existing records for the same
/// identity: an already-published record means this message was already
/// committed (idempotent redelivery); an existing suppressed record is
/// adopted and updated in place.
#[tracing::instrument(skip_all, fields(artifact = %payload.artifact, uuid = %payload.uuid))]
pub async fn create_record<R: Records>(
    records: &R,
    payload: &mut ValidationPayload,
    metadata: &[u8],
) -> CreateOutcome {
    let created = records
        .csv_create(&payload.project, metadata, &extra_fields(payload), false)
        .await;

    match created {
        Ok(created) => {
            payload.onyx_status_code = Some(created.status);
            match created.ids.climb_id {
                Some(climb_id) => {
                    tracing::info!(%climb_id, "created suppressed record");
                    payload.climb_id = Some(climb_id);
                    payload.created = true;
                    payload.onyx_create_status = true;
                    CreateOutcome::Created
                }
                None => {
                    // A create that returns no identifier is an impossible
                    // state; nothing downstream could ever reference it.
                    tracing::error!("record create returned no climb_id");
                    payload
                        .record_create_error("onyx_errors", "record create returned no climb_id");
                    CreateOutcome::Failed { alert: true }
                }
            }
        }
        Err(Error::Request { status, messages }) => {
            payload.onyx_status_code = Some(status);

            match find_existing(records, payload).await {
                Ok(Some(existing)) => {
                    if existing.is_published {
                        tracing::info!(
                            climb_id = %existing.climb_id,
                            "record already published, treating redelivery as committed"
                        );
                        payload.climb_id = Some(existing.climb_id);
                        payload.onyx_create_status = true;
                        CreateOutcome::AlreadyPublished
                    } else {
                        // Adopt the suppressed record and refresh it with
                        // the metadata of this submission.
                        tracing::info!(climb_id = %existing.climb_id, "adopting suppressed record");
                        payload.climb_id = Some(existing.climb_id.clone());
                        match update_record(records, payload, &metadata_fields(metadata)).await {
                            OpOutcome::Ok => {
                                payload.onyx_create_status = true;
                                CreateOutcome::Created
                            }
                            OpOutcome::Failed { alert } => CreateOutcome::Failed { alert },
                            OpOutcome::Transient(reason) => CreateOutcome::Transient(reason),
                        }
                    }
                }
                Ok(None) => {
                    // A genuine validation rejection.
                    for (field, field_messages) in &messages {
                        for message in field_messages {
                            payload.record_create_error(field, message.clone());
                        }
                    }
                    CreateOutcome::Failed { alert: false }
                }
                Err(outcome) => outcome,
            }
        }
        Err(err @ (Error::Connection(_) | Error::Server { .. })) => {
            CreateOutcome::Transient(format!("record create failed: {err:#}"))
        }
        Err(err) => {
            tracing::error!(error = %err, "record create failed");
            record_onyx_error(payload, &err);
            CreateOutcome::Failed {
                alert: err.should_alert(),
            }
        }
    }
}

/// CSV columns as update fields, for refreshing an adopted record.
fn metadata_fields(metadata: &[u8]) -> BTreeMap<String, Value> {
    onyx_client::parse_metadata(metadata)
        .map(|row| {
            row.into_iter()
                .filter(|(field, _)| field != "sample_id" && field != "run_id")
                .map(|(field, value)| (field, Value::String(value)))
                .collect()
        })
        .unwrap_or_default()
}

struct Existing {
    climb_id: String,
    is_published: bool,
}

/// Look up the record for this payload's identity, resolving the sample
/// and run identifiers to their canonical forms first.
async fn find_existing<R: Records>(
    records: &R,
    payload: &mut ValidationPayload,
) -> Result<Option<Existing>, CreateOutcome> {
    let mut canonical = BTreeMap::new();
    for field in ["sample_id", "run_id"] {
        let value = match field {
            "sample_id" => &payload.sample_id,
            _ => &payload.run_id,
        };
        match records.identify(&payload.project, field, value).await {
            Ok(Some(identifier)) => {
                canonical.insert(field.to_string(), identifier);
            }
            Ok(None) => return Ok(None),
            Err(err @ (Error::Connection(_) | Error::Server { .. })) => {
                return Err(CreateOutcome::Transient(format!(
                    "record identify failed: {err:#}"
                )));
            }
            Err(err) => {
                record_onyx_error(payload, &err);
                return Err(CreateOutcome::Failed {
                    alert: err.should_alert(),
                });
            }
        }
    }

    let found = match records.filter(&payload.project, &canonical).await {
        Ok(found) => found,
        Err(err @ (Error::Connection(_) | Error::Server { .. })) => {
            return Err(CreateOutcome::Transient(format!(
                "record filter failed: {err:#}"
            )));
        }
        Err(err) => {
            record_onyx_error(payload, &err);
            return Err(CreateOutcome::Failed {
                alert: err.should_alert(),
            });
        }
    };

    let Some(record) = found.first() else {
        // Identified but not found: an impossible state worth paging for.
        tracing::error!(artifact = %payload.artifact, "record identified but absent from filter");
        payload.record_create_error(
            "onyx_errors",
            "record was identified but could not be retrieved",
        );
        return Err(CreateOutcome::Failed { alert: true });
    };

    match record.get("climb_id").and_then(Value::as_str) {
        Some(climb_id) => Ok(Some(Existing {
            climb_id: climb_id.to_string(),
            is_published: record
                .get("is_published")
                .and_then(Value::as_bool)
                .unwrap_or(false),
        })),
        None => {
            payload.record_create_error("onyx_errors", "existing record carries no climb_id");
            Err(CreateOutcome::Failed { alert: true })
        }
    }
}

/// Update the payload's record, recording failures on the payload.
pub async fn update_record<R: Records>(
    records: &R,
    payload: &mut ValidationPayload,
    fields: &BTreeMap<String, Value>,
) -> OpOutcome {
    let Some(climb_id) = payload.climb_id.clone() else {
        payload.record_create_error("onyx_errors", "no climb_id to update");
        return OpOutcome::Failed { alert: true };
    };

    match records.update(&payload.project, &climb_id, fields).await {
        Ok(()) => OpOutcome::Ok,
        Err(err @ (Error::Connection(_) | Error::Server { .. })) => {
            OpOutcome::Transient(format!("record update failed: {err:#}"))
        }
        Err(err) => {
            tracing::error!(%climb_id, error = %err, "record update failed");
            record_onyx_error(payload, &err);
            OpOutcome::Failed {
                alert: err.should_alert(),
            }
        }
    }
}

/// Publish the record, the last step of a committed success.
pub async fn unsuppress_record<R: Records>(
    records: &R,
    payload: &mut ValidationPayload,
) -> OpOutcome {
    let Some(climb_id) = payload.climb_id.clone() else {
        payload.record_create_error("onyx_errors", "no climb_id to unsuppress");
        return OpOutcome::Failed { alert: true };
    };

    match records.unsuppress(&payload.project, &climb_id).await {
        Ok(()) => {
            tracing::info!(%climb_id, "record published");
            OpOutcome::Ok
        }
        Err(err @ (Error::Connection(_) | Error::Server { .. })) => {
            OpOutcome::Transient(format!("record unsuppress failed: {err:#}"))
        }
        Err(err) => {
            tracing::error!(%climb_id, error = %err, "record unsuppress failed");
            record_onyx_error(payload, &err);
            OpOutcome::Failed {
                alert: err.should_alert(),
            }
        }
    }
}

/// Reject a file whose content is already attached to a published record
/// (detected by etag).
pub async fn ensure_file_unseen<R: Records>(
    records: &R,
    payload: &mut ValidationPayload,
    etag_field: &str,
    etag: &str,
) -> OpOutcome {
    let fields = BTreeMap::from([
        (etag_field.to_string(), etag.to_string()),
        ("is_published".to_string(), "true".to_string()),
    ]);

    match records.filter(&payload.project, &fields).await {
        Ok(found) if found.is_empty() => OpOutcome::Ok,
        Ok(_) => {
            payload.ingest_errors.push(format!(
                "a published record already references this file content ({etag_field})",
            ));
            OpOutcome::Failed { alert: false }
        }
        Err(err @ (Error::Connection(_) | Error::Server { .. })) => {
            OpOutcome::Transient(format!("record filter failed: {err:#}"))
        }
        Err(err) => {
            record_onyx_error(payload, &err);
            OpOutcome::Failed {
                alert: err.should_alert(),
            }
        }
    }
}

/// Verify that the records grouped under `identifier` agree with each
/// other and with this submission's metadata on `fields`. Disagreements
/// are recorded as reconcile errors.
pub async fn reconcile<R: Records>(
    records: &R,
    payload: &mut ValidationPayload,
    metadata: &[u8],
    identifier: &str,
    fields: &[&str],
) -> OpOutcome {
    let value = match identifier {
        "sample_id" => payload.sample_id.clone(),
        "run_id" => payload.run_id.clone(),
        other => {
            payload.record_create_error(
                "onyx_errors",
                format!("cannot reconcile on unknown identifier {other}"),
            );
            return OpOutcome::Failed { alert: true };
        }
    };

    let canonical = match records.identify(&payload.project, identifier, &value).await {
        // Nothing to reconcile against yet.
        Ok(None) => return OpOutcome::Ok,
        Ok(Some(canonical)) => canonical,
        Err(err @ (Error::Connection(_) | Error::Server { .. })) => {
            return OpOutcome::Transient(format!("record identify failed: {err:#}"));
        }
        Err(err) => {
            record_onyx_error(payload, &err);
            return OpOutcome::Failed {
                alert: err.should_alert(),
            };
        }
    };

    let group = match records
        .filter(
            &payload.project,
            &BTreeMap::from([(identifier.to_string(), canonical)]),
        )
        .await
    {
        Ok(group) => group,
        Err(err @ (Error::Connection(_) | Error::Server { .. })) => {
            return OpOutcome::Transient(format!("record filter failed: {err:#}"));
        }
        Err(err) => {
            record_onyx_error(payload, &err);
            return OpOutcome::Failed {
                alert: err.should_alert(),
            };
        }
    };

    let row = onyx_client::parse_metadata(metadata).unwrap_or_default();

    let mut disagreeing = Vec::new();
    for field in fields {
        let mut values: Vec<&str> = group
            .iter()
            .filter_map(|record| record.get(*field).and_then(Value::as_str))
            .collect();
        if let Some(value) = row.get(*field) {
            values.push(value.as_str());
        }
        values.sort_unstable();
        values.dedup();

        if values.len() > 1 {
            disagreeing.push(*field);
        }
    }

    if disagreeing.is_empty() {
        OpOutcome::Ok
    } else {
        models::record_error(
            &mut payload.onyx_create_errors,
            "reconcile_errors",
            format!(
                "records grouped by {identifier} disagree on: {}",
                disagreeing.join(", "),
            ),
        );
        OpOutcome::Failed { alert: false }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use models::{MatchMessage, Stage, PAYLOAD_VERSION};
    use onyx_client::{Created, RecordIds};
    use std::sync::Mutex;
    use uuid::Uuid;

    /// Scripted record service for driving the create/adopt/published
    /// paths.
    #[derive(Default)]
    struct Script {
        create_results: Mutex<Vec<Result<Created, Error>>>,
        identified: Option<&'static str>,
        filtered: Vec<Value>,
        updates: Mutex<Vec<BTreeMap<String, Value>>>,
        unsuppressed: Mutex<u32>,
    }

    #[async_trait::async_trait]
    impl Records for Script {
        async fn csv_create(
            &self,
            _: &str,
            _: &[u8],
            extra: &BTreeMap<String, Value>,
            test: bool,
        ) -> Result<Created, Error> {
            assert!(!test, "validators only perform real creates");
            assert_eq!(extra["is_published"], Value::Bool(false));
            self.create_results
                .lock()
                .unwrap()
                .pop()
                .expect("unexpected create call")
        }

        async fn identify(&self, _: &str, _: &str, _: &str) -> Result<Option<String>, Error> {
            Ok(self.identified.map(str::to_string))
        }

        async fn filter(
            &self,
            _: &str,
            _: &BTreeMap<String, String>,
        ) -> Result<Vec<Value>, Error> {
            Ok(self.filtered.clone())
        }

        async fn update(
            &self,
            _: &str,
            _: &str,
            fields: &BTreeMap<String, Value>,
        ) -> Result<(), Error> {
            self.updates.lock().unwrap().push(fields.clone());
            Ok(())
        }

        async fn unsuppress(&self, _: &str, _: &str) -> Result<(), Error> {
            *self.unsuppressed.lock().unwrap() += 1;
            Ok(())
        }
    }

    fn payload() -> ValidationPayload {
        let matched = MatchMessage {
            payload_version: PAYLOAD_VERSION,
            stage: Stage::Matched,
            uuid: Uuid::new_v4(),
            artifact: "metagen.s1.r1".to_string(),
            project: "metagen".to_string(),
            sample_id: "s1".to_string(),
            run_id: "r1".to_string(),
            platform: "ont".to_string(),
            site: "birm".to_string(),
            uploaders: vec![],
            files: Default::default(),
            test_flag: false,
            match_timestamp: 1,
        };
        let mut payload = ValidationPayload::from_match(matched, 2);
        payload.validate = true;
        payload
    }

    const METADATA: &[u8] = b"sample_id,run_id,adm1\ns1,r1,GB-ENG\n";

    fn exists_rejection() -> Result<Created, Error> {
        let mut messages = onyx_client::FieldErrors::new();
        messages.insert(
            "sample_id".to_string(),
            vec!["record already exists".to_string()],
        );
        Err(Error::Request {
            status: 400,
            messages,
        })
    }

    #[tokio::test]
    async fn fresh_creates_set_the_climb_id() {
        let script = Script {
            create_results: Mutex::new(vec![Ok(Created {
                status: 201,
                ids: RecordIds {
                    climb_id: Some("C-123".to_string()),
                    ..Default::default()
                },
            })]),
            ..Default::default()
        };

        let mut payload = payload();
        let outcome = create_record(&script, &mut payload, METADATA).await;

        assert!(matches!(outcome, CreateOutcome::Created));
        assert_eq!(payload.climb_id.as_deref(), Some("C-123"));
        assert!(payload.created);
        assert!(payload.onyx_create_status);
        assert_eq!(payload.onyx_status_code, Some(201));
    }

    #[tokio::test]
    async fn published_records_mean_the_work_is_done() {
        let script = Script {
            create_results: Mutex::new(vec![exists_rejection()]),
            identified: Some("canonical"),
            filtered: vec![serde_json::json!({
                "climb_id": "C-9",
                "is_published": true,
            })],
            ..Default::default()
        };

        let mut payload = payload();
        let outcome = create_record(&script, &mut payload, METADATA).await;

        assert!(matches!(outcome, CreateOutcome::AlreadyPublished));
        assert_eq!(payload.climb_id.as_deref(), Some("C-9"));
        assert!(!payload.created);
    }

    #[tokio::test]
    async fn suppressed_records_are_adopted_and_updated() {
        let script = Script {
            create_results: Mutex::new(vec![exists_rejection()]),
            identified: Some("canonical"),
            filtered: vec![serde_json::json!({
                "climb_id": "C-9",
                "is_published": false,
            })],
            ..Default::default()
        };

        let mut payload = payload();
        let outcome = create_record(&script, &mut payload, METADATA).await;

        assert!(matches!(outcome, CreateOutcome::Created));
        assert_eq!(payload.climb_id.as_deref(), Some("C-9"));

        let updates = script.updates.lock().unwrap();
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0]["adm1"], Value::String("GB-ENG".to_string()));
        assert!(!updates[0].contains_key("sample_id"));
    }

    #[tokio::test]
    async fn unknown_identities_are_genuine_rejections() {
        let script = Script {
            create_results: Mutex::new(vec![exists_rejection()]),
            identified: None,
            ..Default::default()
        };

        let mut payload = payload();
        let outcome = create_record(&script, &mut payload, METADATA).await;

        assert!(matches!(outcome, CreateOutcome::Failed { alert: false }));
        assert_eq!(
            payload.onyx_create_errors["sample_id"],
            vec!["record already exists"],
        );
    }

    #[tokio::test]
    async fn identified_but_missing_records_page_an_operator() {
        let script = Script {
            create_results: Mutex::new(vec![exists_rejection()]),
            identified: Some("canonical"),
            filtered: vec![],
            ..Default::default()
        };

        let mut payload = payload();
        let outcome = create_record(&script, &mut payload, METADATA).await;

        assert!(matches!(outcome, CreateOutcome::Failed { alert: true }));
        assert!(payload.onyx_create_errors.contains_key("onyx_errors"));
    }

    #[tokio::test]
    async fn connection_failures_are_transient() {
        let script = Script {
            create_results: Mutex::new(vec![Err(Error::Server {
                status: 503,
                body: String::new(),
            })]),
            ..Default::default()
        };

        let mut payload = payload();
        assert!(matches!(
            create_record(&script, &mut payload, METADATA).await,
            CreateOutcome::Transient(_),
        ));
    }

    #[tokio::test]
    async fn unsuppress_flows_through_the_record_service() {
        let script = Script::default();
        let mut payload = payload();
        payload.climb_id = Some("C-123".to_string());

        assert!(matches!(
            unsuppress_record(&script, &mut payload).await,
            OpOutcome::Ok,
        ));
        assert_eq!(*script.unsuppressed.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn seen_files_are_rejected() {
        let script = Script {
            filtered: vec![serde_json::json!({"climb_id": "C-1"})],
            ..Default::default()
        };

        let mut payload = payload();
        let outcome =
            ensure_file_unseen(&script, &mut payload, "fastq_etag", "179d94f8").await;

        assert!(matches!(outcome, OpOutcome::Failed { alert: false }));
        assert!(payload.ingest_errors[0].contains("already references"));
    }

    #[tokio::test]
    async fn reconcile_flags_disagreeing_fields() {
        let script = Script {
            identified: Some("canonical"),
            filtered: vec![
                serde_json::json!({"adm1": "GB-ENG", "study": "alpha"}),
                serde_json::json!({"adm1": "GB-SCT", "study": "alpha"}),
            ],
            ..Default::default()
        };

        let mut payload = payload();
        let outcome = reconcile(
            &script,
            &mut payload,
            METADATA,
            "sample_id",
            &["adm1", "study"],
        )
        .await;

        assert!(matches!(outcome, OpOutcome::Failed { alert: false }));
        let errors = &payload.onyx_create_errors["reconcile_errors"];
        assert!(errors[0].contains("adm1"));
        assert!(!errors[0].contains("study"));
    }
}
