use chrono::{DateTime, Utc};
use serde::Deserialize;

use crate::name::{BucketName, ObjectName, ParseError};

/// The S3-style bucket-notification envelope posted by the object store on
/// every upload. Only the fields the pipeline consumes are modelled.
#[derive(Debug, Deserialize)]
pub struct EventEnvelope {
    #[serde(rename = "Records")]
    pub records: Vec<EventRecord>,
}

#[derive(Debug, Deserialize)]
pub struct EventRecord {
    #[serde(rename = "eventTime")]
    pub event_time: DateTime<Utc>,
    #[serde(rename = "userIdentity")]
    pub user_identity: UserIdentity,
    pub s3: S3Entity,
}

#[derive(Debug, Deserialize)]
pub struct UserIdentity {
    #[serde(rename = "principalId")]
    pub principal_id: String,
}

#[derive(Debug, Deserialize)]
pub struct S3Entity {
    pub bucket: S3Bucket,
    pub object: S3Object,
}

#[derive(Debug, Deserialize)]
pub struct S3Bucket {
    pub name: String,
}

#[derive(Debug, Deserialize)]
pub struct S3Object {
    pub key: String,
    #[serde(rename = "eTag")]
    pub etag: String,
    #[serde(default)]
    pub size: u64,
}

/// One upload, parsed and cross-checked against the bucket-naming and
/// object-naming conventions.
#[derive(Debug, Clone)]
pub struct UploadedObject {
    pub bucket: BucketName,
    pub object: ObjectName,
    pub etag: String,
    pub size: u64,
    pub uploader: String,
    pub event_time: DateTime<Utc>,
}

impl UploadedObject {
    pub fn from_record<S: AsRef<str>>(
        record: &EventRecord,
        accepted: &[S],
    ) -> Result<Self, ParseError> {
        let bucket = BucketName::parse(&record.s3.bucket.name)?;
        let object = ObjectName::parse(&record.s3.object.key, accepted)?;
        object.check_bucket(&bucket)?;

        Ok(Self {
            bucket,
            object,
            etag: record.s3.object.etag.clone(),
            size: record.s3.object.size,
            uploader: record.user_identity.principal_id.clone(),
            event_time: record.event_time,
        })
    }

    pub fn uri(&self) -> String {
        format!("s3://{}/{}", self.bucket.name, self.object.key)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn fixture(bucket: &str, key: &str, etag: &str) -> EventEnvelope {
        serde_json::from_value(serde_json::json!({
            "Records": [{
                "eventVersion": "2.2",
                "eventSource": "ceph:s3",
                "eventTime": "2024-03-05T06:39:35.470367Z",
                "eventName": "ObjectCreated:Put",
                "userIdentity": {"principalId": "site-uploader"},
                "s3": {
                    "s3SchemaVersion": "1.0",
                    "bucket": {"name": bucket},
                    "object": {"key": key, "size": 275, "eTag": etag},
                },
            }]
        }))
        .unwrap()
    }

    #[test]
    fn envelope_parses_and_cross_checks() {
        let envelope = fixture(
            "metagen-birm-ont-prod",
            "metagen.s1.r1.ont.csv",
            "7022ea6a3adb39323b5039c1d6587d08",
        );
        let uploaded =
            UploadedObject::from_record(&envelope.records[0], &[".csv", ".fastq.gz"]).unwrap();

        assert_eq!(uploaded.object.artifact(), "metagen.s1.r1");
        assert_eq!(uploaded.uploader, "site-uploader");
        assert_eq!(uploaded.size, 275);
        assert_eq!(
            uploaded.uri(),
            "s3://metagen-birm-ont-prod/metagen.s1.r1.ont.csv"
        );
    }

    #[test]
    fn bucket_key_disagreement_is_an_error() {
        let envelope = fixture(
            "metagen-birm-illumina-prod",
            "metagen.s1.r1.ont.csv",
            "abc",
        );
        assert!(matches!(
            UploadedObject::from_record(&envelope.records[0], &[".csv"]),
            Err(ParseError::Disagreement { field: "platform", .. }),
        ));
    }
}
