use chrono::Utc;
use models::{new_artifact_exchange, results_exchange, NewArtifact, Stage, ValidationPayload};

/// Publish the detailed per-submission result. Every validator terminal,
/// success or failure, reports exactly once.
pub async fn report(fabric: &fabric::Fabric, payload: &ValidationPayload) -> Result<(), fabric::Error> {
    let mut payload = payload.clone();
    payload.stage = Stage::Validator;

    fabric
        .send(
            &results_exchange(&payload.project, &payload.site),
            &payload,
        )
        .await
}

/// Publish the minimal committed-artifact notification for downstream
/// consumers. Only called after a committed success.
pub async fn notify_new_artifact(
    fabric: &fabric::Fabric,
    payload: &ValidationPayload,
) -> Result<(), fabric::Error> {
    let climb_id = payload
        .climb_id
        .clone()
        .unwrap_or_default();

    fabric
        .send(
            &new_artifact_exchange(&payload.project),
            &NewArtifact {
                ingest_timestamp: Utc::now().timestamp_nanos_opt().unwrap_or_default(),
                climb_id,
                site: payload.site.clone(),
                platform: payload.platform.clone(),
                match_uuid: payload.uuid,
            },
        )
        .await
}
