//! Object-store helpers shared by the pipeline stages: etag-verified
//! fetches, publication uploads, and presigned retrieval URLs. The
//! pipeline never moves sequence data itself; it reads metadata objects
//! and writes derived artifacts.

use std::path::Path;
use std::time::Duration;

use aws_sdk_s3::presigning::PresigningConfig;
use aws_sdk_s3::primitives::ByteStream;

/// Presigned retrieval URLs expire after this long.
pub const PRESIGN_EXPIRY: Duration = Duration::from_secs(24 * 60 * 60);

type BoxedError = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("{uri:?} is not an s3:// URI")]
    Uri { uri: String },
    #[error("failed to fetch s3://{bucket}/{key}")]
    Get {
        bucket: String,
        key: String,
        #[source]
        source: BoxedError,
    },
    #[error(
        "etag of s3://{bucket}/{key} changed after matching (expected {expected:?}, got {actual:?})"
    )]
    EtagMismatch {
        bucket: String,
        key: String,
        expected: String,
        actual: String,
    },
    #[error("failed to upload s3://{bucket}/{key}")]
    Put {
        bucket: String,
        key: String,
        #[source]
        source: BoxedError,
    },
    #[error("failed to delete s3://{bucket}/{key}")]
    Delete {
        bucket: String,
        key: String,
        #[source]
        source: BoxedError,
    },
    #[error("failed to presign s3://{bucket}/{key}")]
    Presign {
        bucket: String,
        key: String,
        #[source]
        source: BoxedError,
    },
}

impl Error {
    /// An etag mismatch is a data-integrity failure (the object was
    /// rewritten mid-flight); everything else is transport.
    pub fn is_integrity(&self) -> bool {
        matches!(self, Error::EtagMismatch { .. })
    }
}

/// Split an `s3://bucket/key` URI.
pub fn parse_uri(uri: &str) -> Result<(&str, &str), Error> {
    uri.strip_prefix("s3://")
        .and_then(|rest| rest.split_once('/'))
        .filter(|(bucket, key)| !bucket.is_empty() && !key.is_empty())
        .ok_or_else(|| Error::Uri {
            uri: uri.to_string(),
        })
}

#[derive(Debug, Clone)]
pub struct Config {
    /// Object-store endpoint, e.g. `https://s3.climb.ac.uk`.
    pub endpoint: String,
}

#[derive(Clone)]
pub struct Store {
    client: aws_sdk_s3::Client,
}

impl Store {
    /// Build a store client from ambient credentials (environment or
    /// shared credentials file) and the configured endpoint.
    pub async fn connect(config: &Config) -> Self {
        let base = aws_config::load_from_env().await;
        let s3_config = aws_sdk_s3::config::Builder::from(&base)
            .endpoint_url(&config.endpoint)
            .force_path_style(true)
            .build();

        Self {
            client: aws_sdk_s3::Client::from_conf(s3_config),
        }
    }

    /// Fetch an object, verifying its etag still matches the one recorded
    /// at match time.
    pub async fn get_verified(&self, uri: &str, expected_etag: &str) -> Result<Vec<u8>, Error> {
        let (bucket, key) = parse_uri(uri)?;

        let object = self
            .client
            .get_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(|err| Error::Get {
                bucket: bucket.to_string(),
                key: key.to_string(),
                source: Box::new(err),
            })?;

        let actual = object.e_tag().unwrap_or_default().trim_matches('"');
        if actual != expected_etag {
            return Err(Error::EtagMismatch {
                bucket: bucket.to_string(),
                key: key.to_string(),
                expected: expected_etag.to_string(),
                actual: actual.to_string(),
            });
        }

        let body = object.body.collect().await.map_err(|err| Error::Get {
            bucket: bucket.to_string(),
            key: key.to_string(),
            source: Box::new(err),
        })?;

        Ok(body.into_bytes().to_vec())
    }

    /// Upload a local file to a publication bucket.
    pub async fn put_file(&self, bucket: &str, key: &str, path: &Path) -> Result<(), Error> {
        let put = |source: BoxedError| Error::Put {
            bucket: bucket.to_string(),
            key: key.to_string(),
            source,
        };

        let body = ByteStream::from_path(path)
            .await
            .map_err(|err| put(Box::new(err)))?;

        self.client
            .put_object()
            .bucket(bucket)
            .key(key)
            .body(body)
            .send()
            .await
            .map_err(|err| put(Box::new(err)))?;

        tracing::debug!(bucket, key, "uploaded");
        Ok(())
    }

    /// Remove a published object. Used to take artifacts back out of
    /// publication buckets when a validation fails after uploading.
    pub async fn delete(&self, bucket: &str, key: &str) -> Result<(), Error> {
        self.client
            .delete_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(|err| Error::Delete {
                bucket: bucket.to_string(),
                key: key.to_string(),
                source: Box::new(err),
            })?;
        Ok(())
    }

    /// Generate a presigned GET URL for a published object.
    pub async fn presigned_get(&self, bucket: &str, key: &str) -> Result<String, Error> {
        let presign = |source: BoxedError| Error::Presign {
            bucket: bucket.to_string(),
            key: key.to_string(),
            source,
        };

        let config = PresigningConfig::expires_in(PRESIGN_EXPIRY)
            .map_err(|err| presign(Box::new(err)))?;

        let request = self
            .client
            .get_object()
            .bucket(bucket)
            .key(key)
            .presigned(config)
            .await
            .map_err(|err| presign(Box::new(err)))?;

        Ok(request.uri().to_string())
    }
}

/// The canonical URI written back onto records for published artifacts.
pub fn uri(bucket: &str, key: &str) -> String {
    format!("s3://{bucket}/{key}")
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn uris_round_trip() {
        let (bucket, key) = parse_uri("s3://metagen-birm-ont-prod/metagen.s1.r1.ont.csv").unwrap();
        assert_eq!(bucket, "metagen-birm-ont-prod");
        assert_eq!(key, "metagen.s1.r1.ont.csv");
        assert_eq!(uri(bucket, key), "s3://metagen-birm-ont-prod/metagen.s1.r1.ont.csv");
    }

    #[test]
    fn bad_uris_are_rejected() {
        for bad in ["http://x/y", "s3://bucket-only", "s3:///key", ""] {
            assert!(matches!(parse_uri(bad), Err(Error::Uri { .. })), "{bad}");
        }
    }
}
