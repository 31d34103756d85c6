use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use models::{
    EventRecord, FileMeta, MatchMessage, PipelineConfig, Stage, UploadedObject, PAYLOAD_VERSION,
};
use uuid::Uuid;

use crate::state::{StateError, StateStore, Submission};

/// The record-service lookup the matcher needs: whether a published record
/// already exists for an identity triple. Implemented by the Onyx client;
/// tests substitute scripted lookups.
#[async_trait::async_trait]
pub trait RecordIndex: Send + Sync {
    async fn is_published(
        &self,
        project: &str,
        sample_id: &str,
        run_id: &str,
    ) -> Result<bool, onyx_client::Error>;
}

#[async_trait::async_trait]
impl RecordIndex for onyx_client::Client {
    async fn is_published(
        &self,
        project: &str,
        sample_id: &str,
        run_id: &str,
    ) -> Result<bool, onyx_client::Error> {
        use onyx_client::Records;

        let fields = BTreeMap::from([
            ("sample_id".to_string(), sample_id.to_string()),
            ("run_id".to_string(), run_id.to_string()),
            ("is_published".to_string(), "true".to_string()),
        ]);
        Ok(!self.filter(project, &fields).await?.is_empty())
    }
}

/// What the binary should do with the event's outcome.
#[derive(Debug)]
pub enum Action {
    /// Emit a completed match.
    Dispatch(MatchMessage),
    /// Route a user-visible failure to `inbound.results.<project>.<site>`.
    Report {
        project: String,
        site: String,
        error: String,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum MatchError {
    /// The published-record lookup failed after retries. The event must
    /// not be acknowledged; it will be redelivered.
    #[error("record service lookup failed for artifact {artifact}")]
    RecordLookup {
        artifact: String,
        project: String,
        site: String,
        #[source]
        source: onyx_client::Error,
    },
    #[error(transparent)]
    State(#[from] StateError),
}

pub struct Matcher<R: RecordIndex> {
    config: PipelineConfig,
    state: StateStore,
    index: R,
    stale_after: Duration,
}

impl<R: RecordIndex> Matcher<R> {
    pub fn new(config: PipelineConfig, state: StateStore, index: R, stale_after: Duration) -> Self {
        Self {
            config,
            state,
            index,
            stale_after,
        }
    }

    /// Process one upload event to completion, returning the actions to
    /// publish. Parse failures yield `Report` actions (the event is done);
    /// lookup failures yield `Err` (the event must be redelivered).
    #[tracing::instrument(skip_all, fields(bucket = %record.s3.bucket.name, key = %record.s3.object.key))]
    pub async fn handle_event(
        &mut self,
        record: &EventRecord,
        now: DateTime<Utc>,
    ) -> Result<Vec<Action>, MatchError> {
        // Bucket first: it names the project and site every later failure
        // is reported under.
        let bucket = match models::BucketName::parse(&record.s3.bucket.name) {
            Ok(bucket) => bucket,
            Err(err) => {
                tracing::error!(error = %err, "event bucket does not follow the naming convention, dropping");
                return Ok(Vec::new());
            }
        };

        let Some(project) = self.config.project(&bucket.project) else {
            tracing::error!(project = %bucket.project, "event from unconfigured project, dropping");
            return Ok(Vec::new());
        };

        let report = |error: String| {
            vec![Action::Report {
                project: bucket.project.clone(),
                site: bucket.site.clone(),
                error,
            }]
        };

        if !project.sites.contains(&bucket.site) {
            return Ok(report(format!(
                "bucket {} does not belong to a configured site of project {}",
                bucket.name, bucket.project,
            )));
        }

        let spec = match self.config.fileset(&bucket.project, &bucket.platform) {
            Ok(spec) => spec.clone(),
            Err(err) => return Ok(report(err.to_string())),
        };

        let uploaded = match UploadedObject::from_record(record, &spec.accepted_extensions()) {
            Ok(uploaded) => uploaded,
            Err(err) => return Ok(report(err.to_string())),
        };

        let artifact = uploaded.object.artifact();
        let mut submission = match self.lookup(&artifact)? {
            Some(submission) => submission,
            None => Submission {
                artifact: artifact.clone(),
                project: uploaded.object.project.clone(),
                sample_id: uploaded.object.sample_id.clone(),
                run_id: uploaded.object.run_id.clone(),
                platform: uploaded.object.platform.clone(),
                site: uploaded.bucket.site.clone(),
                env: uploaded.bucket.env,
                uuid: Uuid::new_v4(),
                files: BTreeMap::new(),
                uploaders: Default::default(),
            },
        };

        // Every file of one submission must agree on the full identity.
        if submission.platform != uploaded.object.platform
            || submission.site != uploaded.bucket.site
            || submission.env != uploaded.bucket.env
        {
            return Ok(report(format!(
                "upload of {} conflicts with the in-progress submission for artifact {artifact} \
                 (platform/site/env disagree)",
                uploaded.object.key,
            )));
        }

        submission.files.insert(
            uploaded.object.ext.clone(),
            FileMeta {
                uri: uploaded.uri(),
                etag: uploaded.etag.clone(),
                key: uploaded.object.key.clone(),
                uploader: uploaded.uploader.clone(),
                last_seen: now,
            },
        );
        submission.uploaders.insert(uploaded.uploader.clone());
        self.state.save_pending(&submission, now)?;

        if !spec.is_complete(submission.files.keys().map(String::as_str)) {
            tracing::debug!(%artifact, observed = submission.files.len(), "submission still incomplete");
            return Ok(Vec::new());
        }

        self.complete(submission, now).await
    }

    /// The working record for `artifact`: the pending record if one
    /// exists, else the last-dispatched record re-opened under a fresh
    /// UUID (a re-upload of an already-matched submission).
    fn lookup(&self, artifact: &str) -> Result<Option<Submission>, StateError> {
        if let Some(pending) = self.state.pending(artifact)? {
            return Ok(Some(pending));
        }
        match self.state.dispatched(artifact)? {
            Some(mut dispatched) => {
                dispatched.uuid = Uuid::new_v4();
                tracing::info!(%artifact, uuid = %dispatched.uuid, "re-opened dispatched submission");
                Ok(Some(dispatched))
            }
            None => Ok(None),
        }
    }

    async fn complete(
        &mut self,
        submission: Submission,
        now: DateTime<Utc>,
    ) -> Result<Vec<Action>, MatchError> {
        let artifact = submission.artifact.clone();

        match self.state.dispatched(&artifact)? {
            None => {
                // First dispatch for this artifact: a published record with
                // the same identity forbids ingest of a new submission.
                let published = self
                    .index
                    .is_published(&submission.project, &submission.sample_id, &submission.run_id)
                    .await
                    .map_err(|source| MatchError::RecordLookup {
                        artifact: artifact.clone(),
                        project: submission.project.clone(),
                        site: submission.site.clone(),
                        source,
                    })?;

                if published {
                    self.state.clear_pending(&artifact)?;
                    return Ok(vec![Action::Report {
                        project: submission.project.clone(),
                        site: submission.site.clone(),
                        error: format!(
                            "a published record already exists for artifact {artifact}; \
                             a new submission cannot be ingested",
                        ),
                    }]);
                }
            }
            Some(previous) if previous.etags() == submission.etags() => {
                tracing::info!(%artifact, "identical file set already matched, suppressing");
                self.state.clear_pending(&artifact)?;
                return Ok(Vec::new());
            }
            Some(_) => {
                tracing::info!(%artifact, uuid = %submission.uuid, "etag set changed, re-dispatching");
            }
        }

        self.state.record_dispatch(&submission, now)?;

        let message = MatchMessage {
            payload_version: PAYLOAD_VERSION,
            stage: Stage::Matched,
            uuid: submission.uuid,
            artifact,
            project: submission.project,
            sample_id: submission.sample_id,
            run_id: submission.run_id,
            platform: submission.platform,
            site: submission.site,
            uploaders: submission.uploaders.into_iter().collect(),
            files: submission.files,
            test_flag: submission.env.is_test(),
            match_timestamp: now.timestamp_nanos_opt().unwrap_or_default(),
        };

        tracing::info!(artifact = %message.artifact, uuid = %message.uuid, "dispatching match");
        Ok(vec![Action::Dispatch(message)])
    }

    /// Drop working records with no activity inside the stale window.
    pub fn expire_stale(&mut self, now: DateTime<Utc>) -> Result<(), StateError> {
        for artifact in self.state.expire_pending(now - self.stale_after)? {
            tracing::warn!(%artifact, "expiring incomplete submission after idle timeout");
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use models::EventEnvelope;

    struct StaticIndex(bool);

    #[async_trait::async_trait]
    impl RecordIndex for StaticIndex {
        async fn is_published(&self, _: &str, _: &str, _: &str) -> Result<bool, onyx_client::Error> {
            Ok(self.0)
        }
    }

    struct FailingIndex;

    #[async_trait::async_trait]
    impl RecordIndex for FailingIndex {
        async fn is_published(&self, _: &str, _: &str, _: &str) -> Result<bool, onyx_client::Error> {
            Err(onyx_client::Error::Server {
                status: 503,
                body: "unavailable".to_string(),
            })
        }
    }

    fn config() -> PipelineConfig {
        serde_json::from_value(serde_json::json!({
            "version": "1",
            "configs": {
                "metagen": {
                    "sites": ["birm", "glas"],
                    "file_specs": {
                        "illumina": {
                            "files": {".csv": 1, ".1.fastq.gz": 1, ".2.fastq.gz": 1},
                            "match_size": 3,
                        },
                        "ont": {
                            "files": {".csv": 1, ".fastq.gz": 1},
                            "match_size": 2,
                        },
                    },
                },
            },
        }))
        .unwrap()
    }

    fn event(bucket: &str, key: &str, etag: &str) -> EventRecord {
        let envelope: EventEnvelope = serde_json::from_value(serde_json::json!({
            "Records": [{
                "eventTime": "2024-03-05T06:39:35.470367Z",
                "userIdentity": {"principalId": "site-uploader"},
                "s3": {
                    "bucket": {"name": bucket},
                    "object": {"key": key, "size": 100, "eTag": etag},
                },
            }]
        }))
        .unwrap();
        envelope.records.into_iter().next().unwrap()
    }

    fn matcher(index: StaticIndex) -> Matcher<StaticIndex> {
        Matcher::new(
            config(),
            StateStore::in_memory().unwrap(),
            index,
            Duration::hours(72),
        )
    }

    async fn drive<R: RecordIndex>(
        matcher: &mut Matcher<R>,
        events: &[EventRecord],
    ) -> Vec<Action> {
        let mut actions = Vec::new();
        for event in events {
            actions.extend(matcher.handle_event(event, Utc::now()).await.unwrap());
        }
        actions
    }

    fn paired_illumina(csv_etag: &str) -> Vec<EventRecord> {
        vec![
            event("metagen-birm-illumina-prod", "metagen.s1.r1.illumina.csv", csv_etag),
            event("metagen-birm-illumina-prod", "metagen.s1.r1.illumina.1.fastq.gz", "B"),
            event("metagen-birm-illumina-prod", "metagen.s1.r1.illumina.2.fastq.gz", "C"),
        ]
    }

    #[tokio::test]
    async fn happy_path_paired_illumina() {
        let mut matcher = matcher(StaticIndex(false));
        let actions = drive(&mut matcher, &paired_illumina("A")).await;

        let [Action::Dispatch(message)] = &actions[..] else {
            panic!("expected exactly one dispatch, got {actions:?}");
        };
        assert_eq!(
            message.files.keys().map(String::as_str).collect::<Vec<_>>(),
            vec![".1.fastq.gz", ".2.fastq.gz", ".csv"],
        );
        assert_eq!(message.artifact, "metagen.s1.r1");
        assert_eq!(message.files[".csv"].etag, "A");
        assert_eq!(message.uploaders, vec!["site-uploader"]);
        assert!(!message.test_flag);
    }

    #[tokio::test]
    async fn mismatched_samples_never_match() {
        let mut matcher = matcher(StaticIndex(false));
        let actions = drive(
            &mut matcher,
            &[
                event("metagen-birm-ont-prod", "metagen.sampleA.run1.ont.csv", "A"),
                event("metagen-birm-ont-prod", "metagen.sampleB.run1.ont.fastq.gz", "B"),
            ],
        )
        .await;

        assert!(actions.is_empty(), "{actions:?}");
    }

    #[tokio::test]
    async fn identical_resubmission_is_suppressed() {
        let mut matcher = matcher(StaticIndex(false));
        let first = drive(&mut matcher, &paired_illumina("A")).await;
        assert!(matches!(first[..], [Action::Dispatch(_)]));

        let second = drive(&mut matcher, &paired_illumina("A")).await;
        assert!(second.is_empty(), "{second:?}");
    }

    #[tokio::test]
    async fn updated_metadata_redispatches_with_new_uuid() {
        let mut matcher = matcher(StaticIndex(false));
        let first = drive(&mut matcher, &paired_illumina("A")).await;
        let [Action::Dispatch(first)] = &first[..] else {
            panic!();
        };

        let second = drive(
            &mut matcher,
            &[event(
                "metagen-birm-illumina-prod",
                "metagen.s1.r1.illumina.csv",
                "A-prime",
            )],
        )
        .await;
        let [Action::Dispatch(second)] = &second[..] else {
            panic!("expected re-dispatch, got {second:?}");
        };

        assert_ne!(first.uuid, second.uuid);
        assert_eq!(second.files[".csv"].etag, "A-prime");
        assert_eq!(second.files[".1.fastq.gz"].etag, "B");
    }

    #[tokio::test]
    async fn published_records_forbid_new_submissions() {
        let mut matcher = matcher(StaticIndex(true));
        let actions = drive(&mut matcher, &paired_illumina("A")).await;

        let [Action::Report { project, site, error }] = &actions[..] else {
            panic!("expected a report, got {actions:?}");
        };
        assert_eq!(project, "metagen");
        assert_eq!(site, "birm");
        assert!(error.contains("published record already exists"));
    }

    #[tokio::test]
    async fn lookup_failures_surface_for_redelivery() {
        let mut matcher = Matcher::new(
            config(),
            StateStore::in_memory().unwrap(),
            FailingIndex,
            Duration::hours(72),
        );

        let mut events = paired_illumina("A").into_iter();
        for event in events.by_ref().take(2) {
            assert!(matcher.handle_event(&event, Utc::now()).await.unwrap().is_empty());
        }
        let last = events.next().unwrap();
        assert!(matches!(
            matcher.handle_event(&last, Utc::now()).await,
            Err(MatchError::RecordLookup { .. }),
        ));
    }

    #[tokio::test]
    async fn malformed_keys_are_reported() {
        let mut matcher = matcher(StaticIndex(false));

        // Two sections.
        let actions = drive(
            &mut matcher,
            &[event("metagen-birm-ont-prod", "s1.r1.csv", "A")],
        )
        .await;
        assert!(matches!(actions[..], [Action::Report { .. }]));

        // Six sections.
        let actions = drive(
            &mut matcher,
            &[event("metagen-birm-ont-prod", "metagen.s1.r1.x.y.ont.csv", "A")],
        )
        .await;
        assert!(matches!(actions[..], [Action::Report { .. }]));

        // Unknown extension for the platform.
        let actions = drive(
            &mut matcher,
            &[event("metagen-birm-ont-prod", "metagen.s1.r1.ont.bam", "A")],
        )
        .await;
        assert!(matches!(actions[..], [Action::Report { .. }]));

        // Bucket/key platform disagreement.
        let actions = drive(
            &mut matcher,
            &[event("metagen-birm-ont-prod", "metagen.s1.r1.illumina.csv", "A")],
        )
        .await;
        assert!(matches!(actions[..], [Action::Report { .. }]));
    }

    #[tokio::test]
    async fn conflicting_identity_is_reported() {
        let mut matcher = matcher(StaticIndex(false));

        // Same artifact key arriving from a different site's bucket.
        let actions = drive(
            &mut matcher,
            &[
                event("metagen-birm-ont-prod", "metagen.s1.r1.ont.csv", "A"),
                event("metagen-glas-ont-prod", "metagen.s1.r1.ont.fastq.gz", "B"),
            ],
        )
        .await;

        let [Action::Report { error, .. }] = &actions[..] else {
            panic!("expected a report, got {actions:?}");
        };
        assert!(error.contains("disagree"));
    }

    #[tokio::test]
    async fn test_buckets_set_the_test_flag() {
        let mut matcher = matcher(StaticIndex(false));
        let actions = drive(
            &mut matcher,
            &[
                event("metagen-birm-ont-test", "metagen.s1.r1.ont.csv", "A"),
                event("metagen-birm-ont-test", "metagen.s1.r1.ont.fastq.gz", "B"),
            ],
        )
        .await;

        let [Action::Dispatch(message)] = &actions[..] else {
            panic!();
        };
        assert!(message.test_flag);
    }

    #[tokio::test]
    async fn state_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.sqlite");

        {
            let mut matcher = Matcher::new(
                config(),
                StateStore::open(&path).unwrap(),
                StaticIndex(false),
                Duration::hours(72),
            );
            let actions = drive(&mut matcher, &paired_illumina("A")).await;
            assert!(matches!(actions[..], [Action::Dispatch(_)]));
        }

        // A restarted matcher suppresses the identical re-submission.
        let mut matcher = Matcher::new(
            config(),
            StateStore::open(&path).unwrap(),
            StaticIndex(false),
            Duration::hours(72),
        );
        let actions = drive(&mut matcher, &paired_illumina("A")).await;
        assert!(actions.is_empty(), "{actions:?}");
    }

    #[tokio::test]
    async fn stale_submissions_expire() {
        let mut matcher = matcher(StaticIndex(false));
        let start = Utc::now();

        let events = paired_illumina("A");
        matcher.handle_event(&events[0], start).await.unwrap();

        matcher.expire_stale(start + Duration::hours(73)).unwrap();

        // The surviving files no longer complete a submission: only the
        // two fastqs are observed after expiry.
        let mut actions = Vec::new();
        for event in &events[1..] {
            actions.extend(
                matcher
                    .handle_event(event, start + Duration::hours(74))
                    .await
                    .unwrap(),
            );
        }
        assert!(actions.is_empty(), "{actions:?}");
    }
}
