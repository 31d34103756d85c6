use std::path::Path;

use models::ValidationPayload;

/// Uploads derived artifacts to publication buckets, tracking what was
/// written so a later failure can take everything back out again: a
/// validation that does not commit must leave nothing published.
pub struct Publisher<'s> {
    store: &'s objstore::Store,
    uploaded: Vec<(String, String)>,
}

/// A published artifact's addresses, written back onto the record.
#[derive(Debug)]
pub struct PublishedArtifact {
    pub uri: String,
    pub presigned_url: String,
}

impl<'s> Publisher<'s> {
    pub fn new(store: &'s objstore::Store) -> Self {
        Self {
            store,
            uploaded: Vec::new(),
        }
    }

    /// Upload `path` to `bucket/key` and presign its retrieval URL.
    pub async fn publish(
        &mut self,
        bucket: &str,
        key: &str,
        path: &Path,
    ) -> Result<PublishedArtifact, objstore::Error> {
        self.store.put_file(bucket, key, path).await?;
        self.uploaded.push((bucket.to_string(), key.to_string()));

        let presigned_url = self.store.presigned_get(bucket, key).await?;
        Ok(PublishedArtifact {
            uri: objstore::uri(bucket, key),
            presigned_url,
        })
    }

    /// Best-effort removal of everything published so far. Called on any
    /// terminal other than committed success.
    pub async fn rollback(self, payload: &ValidationPayload) {
        for (bucket, key) in &self.uploaded {
            if let Err(err) = self.store.delete(bucket, key).await {
                tracing::error!(
                    %bucket,
                    %key,
                    uuid = %payload.uuid,
                    error = %err,
                    "failed to roll back published artifact"
                );
            } else {
                tracing::info!(%bucket, %key, uuid = %payload.uuid, "rolled back published artifact");
            }
        }
    }

    pub fn published(&self) -> &[(String, String)] {
        &self.uploaded
    }
}
