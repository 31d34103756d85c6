use models::{is_valid_identifier, MatchMessage, ValidationPayload};
use onyx_client::Records;
use serde_json::Value;

/// Where the metadata object comes from. Implemented by the object store;
/// tests substitute fixed responses.
#[async_trait::async_trait]
pub trait MetadataSource: Send + Sync {
    async fn fetch(&self, uri: &str, etag: &str) -> Result<Vec<u8>, objstore::Error>;
}

#[async_trait::async_trait]
impl MetadataSource for objstore::Store {
    async fn fetch(&self, uri: &str, etag: &str) -> Result<Vec<u8>, objstore::Error> {
        self.get_verified(uri, etag).await
    }
}

/// The disposition of one match message after acceptance checking.
#[derive(Debug)]
pub enum Verdict {
    /// Forward to `inbound.to_validate.<project>`, then acknowledge. The
    /// payload's `validate` field gates downstream execution.
    Forward(ValidationPayload),
    /// Terminal at this stage: publish the payload straight to the result
    /// exchange, then acknowledge.
    Drop(ValidationPayload),
    /// Transient failure: leave the delivery unacknowledged so it is
    /// redelivered.
    Retry { reason: String },
}

pub struct Ingest<S, R> {
    store: S,
    records: R,
}

impl<S: MetadataSource, R: Records> Ingest<S, R> {
    pub fn new(store: S, records: R) -> Self {
        Self { store, records }
    }

    /// Run the acceptance checks for one match. Exactly one of the three
    /// verdicts results; `Forward` and `Drop` each produce exactly one
    /// outbound message for this input.
    #[tracing::instrument(skip_all, fields(artifact = %matched.artifact, uuid = %matched.uuid))]
    pub async fn process(&self, matched: MatchMessage, now_ns: i64) -> Verdict {
        let mut payload = ValidationPayload::from_match(matched, now_ns);

        let Some(metadata_file) = payload.files.get(".csv").cloned() else {
            // The file-set specs all require a metadata CSV; a match
            // without one is a matcher defect, not a user error.
            tracing::error!("match message carries no metadata CSV");
            payload.record_test_error("metadata_csv", "match is missing its metadata CSV");
            return Verdict::Drop(payload);
        };

        // Character policy on the identifiers parsed from the filename.
        for (field, value) in [
            ("sample_id", payload.sample_id.clone()),
            ("run_id", payload.run_id.clone()),
        ] {
            if !is_valid_identifier(&value) {
                payload.record_test_error(
                    field,
                    format!(
                        "{field} contains invalid characters, must be alphanumeric and contain \
                         only hyphens and underscores",
                    ),
                );
            }
        }

        let metadata = match self.store.fetch(&metadata_file.uri, &metadata_file.etag).await {
            Ok(bytes) => bytes,
            Err(err) if err.is_integrity() => {
                // The metadata file was rewritten between matching and
                // ingest. The user sees the failure; the re-upload will
                // arrive as a fresh match.
                tracing::error!(error = %err, "metadata etag mismatch");
                payload.record_test_error("metadata_csv", err.to_string());
                return Verdict::Drop(payload);
            }
            Err(err) => {
                return Verdict::Retry {
                    reason: format!("failed to fetch metadata CSV: {err:#}"),
                };
            }
        };

        match onyx_client::parse_metadata(&metadata) {
            Ok(row) => {
                for field in ["sample_id", "run_id"] {
                    let in_filename = match field {
                        "sample_id" => &payload.sample_id,
                        _ => &payload.run_id,
                    };
                    if row.get(field).map(String::as_str) != Some(in_filename.as_str()) {
                        payload.record_test_error(field, "field does not match filename");
                    }
                }
            }
            Err(err) => {
                payload.record_test_error("metadata_csv", err.to_string());
            }
        }

        // Only a payload that passed every local check is worth a record
        // service round-trip.
        if !payload.onyx_test_create_errors.is_empty() {
            return Verdict::Forward(payload);
        }

        self.test_create(payload, &metadata).await
    }

    async fn test_create(&self, mut payload: ValidationPayload, metadata: &[u8]) -> Verdict {
        let extra = [
            ("site".to_string(), Value::String(payload.site.clone())),
            (
                "sample_id".to_string(),
                Value::String(payload.sample_id.clone()),
            ),
            ("run_id".to_string(), Value::String(payload.run_id.clone())),
            ("is_published".to_string(), Value::Bool(false)),
        ]
        .into_iter()
        .collect();

        match self
            .records
            .csv_create(&payload.project, metadata, &extra, true)
            .await
        {
            Ok(created) => {
                payload.onyx_test_status_code = Some(created.status);

                if let Some(climb_id) = created.ids.climb_id {
                    // A test create must never assign an identifier.
                    tracing::error!(%climb_id, "Onyx assigned a climb_id during a test create");
                    payload.record_test_error(
                        "onyx_errors",
                        "record service assigned an identifier during a test create",
                    );
                    return Verdict::Forward(payload);
                }

                if created.status == 201 {
                    payload.onyx_test_create_status = true;
                    payload.validate = true;
                } else {
                    tracing::error!(status = created.status, "unexpected test create status");
                    payload.record_test_error(
                        "onyx_errors",
                        format!("unexpected test create status: {}", created.status),
                    );
                }
                Verdict::Forward(payload)
            }
            Err(err) => {
                payload.onyx_test_status_code = err.status_code();

                match &err {
                    onyx_client::Error::Request { messages, .. } => {
                        for (field, field_messages) in messages {
                            for message in field_messages {
                                payload.record_test_error(field, message.clone());
                            }
                        }
                        Verdict::Forward(payload)
                    }
                    onyx_client::Error::Forbidden { .. } => {
                        tracing::error!(error = %err, "Onyx permissions failure");
                        payload.record_test_error("onyx_errors", err.to_string());
                        Verdict::Drop(payload)
                    }
                    onyx_client::Error::Connection(_) | onyx_client::Error::Server { .. } => {
                        Verdict::Retry {
                            reason: format!("Onyx test create failed: {err:#}"),
                        }
                    }
                    _ => {
                        tracing::error!(error = %err, "unhandled test create failure");
                        payload.record_test_error("onyx_errors", err.to_string());
                        Verdict::Forward(payload)
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use models::{FileMeta, Stage, PAYLOAD_VERSION};
    use onyx_client::{Created, Error, FieldErrors, RecordIds};
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use uuid::Uuid;

    struct FixedSource {
        body: Option<Vec<u8>>,
    }

    #[async_trait::async_trait]
    impl MetadataSource for FixedSource {
        async fn fetch(&self, uri: &str, etag: &str) -> Result<Vec<u8>, objstore::Error> {
            match &self.body {
                Some(body) => Ok(body.clone()),
                None => Err(objstore::Error::EtagMismatch {
                    bucket: "metagen-birm-ont-prod".to_string(),
                    key: uri.to_string(),
                    expected: etag.to_string(),
                    actual: "rewritten".to_string(),
                }),
            }
        }
    }

    /// Scripted record service: returns the configured outcome and counts
    /// create calls.
    struct ScriptedRecords {
        outcome: fn() -> Result<Created, Error>,
        creates: AtomicUsize,
    }

    impl ScriptedRecords {
        fn new(outcome: fn() -> Result<Created, Error>) -> Self {
            Self {
                outcome,
                creates: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait::async_trait]
    impl Records for ScriptedRecords {
        async fn csv_create(
            &self,
            _: &str,
            _: &[u8],
            _: &BTreeMap<String, Value>,
            test: bool,
        ) -> Result<Created, Error> {
            assert!(test, "ingest only ever performs test creates");
            self.creates.fetch_add(1, Ordering::SeqCst);
            (self.outcome)()
        }

        async fn identify(&self, _: &str, _: &str, _: &str) -> Result<Option<String>, Error> {
            unimplemented!("not used by ingest")
        }

        async fn filter(
            &self,
            _: &str,
            _: &BTreeMap<String, String>,
        ) -> Result<Vec<Value>, Error> {
            unimplemented!("not used by ingest")
        }

        async fn update(
            &self,
            _: &str,
            _: &str,
            _: &BTreeMap<String, Value>,
        ) -> Result<(), Error> {
            unimplemented!("not used by ingest")
        }

        async fn unsuppress(&self, _: &str, _: &str) -> Result<(), Error> {
            unimplemented!("not used by ingest")
        }
    }

    fn created_201() -> Result<Created, Error> {
        Ok(Created {
            status: 201,
            ids: RecordIds::default(),
        })
    }

    fn matched(sample_id: &str) -> MatchMessage {
        let mut files = BTreeMap::new();
        for (ext, key, etag) in [
            (".csv", "metagen.s1.r1.ont.csv", "A"),
            (".fastq.gz", "metagen.s1.r1.ont.fastq.gz", "B"),
        ] {
            files.insert(
                ext.to_string(),
                FileMeta {
                    uri: format!("s3://metagen-birm-ont-prod/{key}"),
                    etag: etag.to_string(),
                    key: key.to_string(),
                    uploader: "site-uploader".to_string(),
                    last_seen: chrono::Utc::now(),
                },
            );
        }

        MatchMessage {
            payload_version: PAYLOAD_VERSION,
            stage: Stage::Matched,
            uuid: Uuid::new_v4(),
            artifact: format!("metagen.{sample_id}.r1"),
            project: "metagen".to_string(),
            sample_id: sample_id.to_string(),
            run_id: "r1".to_string(),
            platform: "ont".to_string(),
            site: "birm".to_string(),
            uploaders: vec!["site-uploader".to_string()],
            files,
            test_flag: false,
            match_timestamp: 1,
        }
    }

    fn csv(sample_id: &str, run_id: &str) -> Vec<u8> {
        format!("sample_id,run_id,adm1\n{sample_id},{run_id},GB-ENG\n").into_bytes()
    }

    #[tokio::test]
    async fn clean_metadata_forwards_with_validate_set() {
        let records = ScriptedRecords::new(created_201);
        let ingest = Ingest::new(
            FixedSource {
                body: Some(csv("s1", "r1")),
            },
            records,
        );

        let Verdict::Forward(payload) = ingest.process(matched("s1"), 7).await else {
            panic!("expected forward");
        };

        assert!(payload.validate);
        assert!(payload.onyx_test_create_status);
        assert_eq!(payload.onyx_test_status_code, Some(201));
        assert!(payload.onyx_test_create_errors.is_empty());
        assert_eq!(payload.ingest_timestamp, 7);
        assert_eq!(ingest.records.creates.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn invalid_characters_fail_without_a_create() {
        let records = ScriptedRecords::new(created_201);
        let ingest = Ingest::new(
            FixedSource {
                body: Some(csv("foo!", "r1")),
            },
            records,
        );

        let Verdict::Forward(payload) = ingest.process(matched("foo!"), 7).await else {
            panic!("expected forward");
        };

        assert!(!payload.validate);
        assert!(payload.onyx_test_create_errors["sample_id"][0].contains("invalid characters"));
        assert_eq!(ingest.records.creates.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn metadata_must_match_the_filename() {
        let records = ScriptedRecords::new(created_201);
        let ingest = Ingest::new(
            FixedSource {
                body: Some(csv("other-sample", "r1")),
            },
            records,
        );

        let Verdict::Forward(payload) = ingest.process(matched("s1"), 7).await else {
            panic!("expected forward");
        };

        assert!(!payload.validate);
        assert_eq!(
            payload.onyx_test_create_errors["sample_id"],
            vec!["field does not match filename"],
        );
        assert_eq!(ingest.records.creates.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn multiline_metadata_is_rejected() {
        let records = ScriptedRecords::new(created_201);
        let ingest = Ingest::new(
            FixedSource {
                body: Some(b"sample_id,run_id\ns1,r1\ns2,r2\n".to_vec()),
            },
            records,
        );

        let Verdict::Forward(payload) = ingest.process(matched("s1"), 7).await else {
            panic!("expected forward");
        };

        assert!(!payload.validate);
        assert!(payload.onyx_test_create_errors.contains_key("metadata_csv"));
        assert_eq!(ingest.records.creates.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn etag_mismatch_is_terminal() {
        let records = ScriptedRecords::new(created_201);
        let ingest = Ingest::new(FixedSource { body: None }, records);

        let Verdict::Drop(payload) = ingest.process(matched("s1"), 7).await else {
            panic!("expected drop");
        };

        assert!(!payload.validate);
        assert!(payload.onyx_test_create_errors["metadata_csv"][0].contains("etag"));
        assert_eq!(ingest.records.creates.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn request_errors_annotate_the_payload() {
        fn rejected() -> Result<Created, Error> {
            let mut messages = FieldErrors::new();
            messages.insert("adm1".to_string(), vec!["is required".to_string()]);
            Err(Error::Request {
                status: 422,
                messages,
            })
        }

        let ingest = Ingest::new(
            FixedSource {
                body: Some(csv("s1", "r1")),
            },
            ScriptedRecords::new(rejected),
        );

        let Verdict::Forward(payload) = ingest.process(matched("s1"), 7).await else {
            panic!("expected forward");
        };

        assert!(!payload.validate);
        assert_eq!(payload.onyx_test_status_code, Some(422));
        assert_eq!(payload.onyx_test_create_errors["adm1"], vec!["is required"]);
    }

    #[tokio::test]
    async fn permission_failures_drop_with_alert() {
        fn forbidden() -> Result<Created, Error> {
            Err(Error::Forbidden {
                status: 403,
                body: "permission denied".to_string(),
            })
        }

        let ingest = Ingest::new(
            FixedSource {
                body: Some(csv("s1", "r1")),
            },
            ScriptedRecords::new(forbidden),
        );

        assert!(matches!(
            ingest.process(matched("s1"), 7).await,
            Verdict::Drop(_),
        ));
    }

    #[tokio::test]
    async fn connection_failures_requeue() {
        fn server_error() -> Result<Created, Error> {
            Err(Error::Server {
                status: 503,
                body: String::new(),
            })
        }

        let ingest = Ingest::new(
            FixedSource {
                body: Some(csv("s1", "r1")),
            },
            ScriptedRecords::new(server_error),
        );

        assert!(matches!(
            ingest.process(matched("s1"), 7).await,
            Verdict::Retry { .. },
        ));
    }

    #[tokio::test]
    async fn a_test_create_must_not_assign_an_identifier() {
        fn assigned() -> Result<Created, Error> {
            Ok(Created {
                status: 201,
                ids: RecordIds {
                    climb_id: Some("C-1".to_string()),
                    ..Default::default()
                },
            })
        }

        let ingest = Ingest::new(
            FixedSource {
                body: Some(csv("s1", "r1")),
            },
            ScriptedRecords::new(assigned),
        );

        let Verdict::Forward(payload) = ingest.process(matched("s1"), 7).await else {
            panic!("expected forward");
        };
        assert!(!payload.validate);
        assert!(payload.onyx_test_create_errors.contains_key("onyx_errors"));
    }
}
