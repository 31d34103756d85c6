use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};

lazy_static! {
    static ref IDENTIFIER: Regex = Regex::new(r"^[A-Za-z0-9_-]+$").unwrap();
}

/// Returns whether `value` is acceptable as a sample or run identifier:
/// alphanumerics, hyphens and underscores only.
pub fn is_valid_identifier(value: &str) -> bool {
    IDENTIFIER.is_match(value)
}

#[derive(Debug, PartialEq, thiserror::Error)]
pub enum ParseError {
    #[error("object key {0:?} does not end in an accepted file extension")]
    Extension(String),
    #[error("object key {0:?} is not of the form <project>.<sample_id>.<run_id>.<platform>.<ext>")]
    KeySections(String),
    #[error("bucket name {0:?} is not of the form <project>-<site>-<platform>-<env>")]
    BucketSections(String),
    #[error("bucket environment {0:?} is not one of 'prod' or 'test'")]
    Environment(String),
    #[error("bucket and object key disagree on {field}: {in_bucket:?} vs {in_key:?}")]
    Disagreement {
        field: &'static str,
        in_bucket: String,
        in_key: String,
    },
}

/// Ingest environment encoded in the bucket name. Test submissions flow
/// through the full pipeline but never create or publish records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    Prod,
    Test,
}

impl Environment {
    pub fn is_test(&self) -> bool {
        matches!(self, Environment::Test)
    }
}

impl std::fmt::Display for Environment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Environment::Prod => f.write_str("prod"),
            Environment::Test => f.write_str("test"),
        }
    }
}

impl std::str::FromStr for Environment {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "prod" => Ok(Environment::Prod),
            "test" => Ok(Environment::Test),
            other => Err(ParseError::Environment(other.to_string())),
        }
    }
}

/// A parsed ingest bucket name: `<project>-<site>-<platform>-<env>`.
#[derive(Debug, Clone, PartialEq)]
pub struct BucketName {
    pub project: String,
    pub site: String,
    pub platform: String,
    pub env: Environment,
    pub name: String,
}

impl BucketName {
    pub fn parse(name: &str) -> Result<Self, ParseError> {
        let mut parts = name.split('-');

        match (parts.next(), parts.next(), parts.next(), parts.next(), parts.next()) {
            (Some(project), Some(site), Some(platform), Some(env), None) => Ok(Self {
                project: project.to_string(),
                site: site.to_string(),
                platform: platform.to_string(),
                env: env.parse()?,
                name: name.to_string(),
            }),
            _ => Err(ParseError::BucketSections(name.to_string())),
        }
    }
}

/// A parsed object key: `<project>.<sample_id>.<run_id>.<platform>.<ext>`,
/// where `<ext>` may itself contain dots (`.1.fastq.gz`) and is resolved
/// longest-first against the accepted extensions of the file-set spec.
#[derive(Debug, Clone, PartialEq)]
pub struct ObjectName {
    pub project: String,
    pub sample_id: String,
    pub run_id: String,
    pub platform: String,
    pub ext: String,
    pub key: String,
}

impl ObjectName {
    /// Parse `key` against the accepted extensions (leading dot included).
    /// `accepted` need not be sorted.
    pub fn parse<S: AsRef<str>>(key: &str, accepted: &[S]) -> Result<Self, ParseError> {
        let mut exts: Vec<&str> = accepted.iter().map(AsRef::as_ref).collect();
        exts.sort_by_key(|e| std::cmp::Reverse(e.len()));

        let ext = exts
            .into_iter()
            .find(|e| key.ends_with(*e))
            .ok_or_else(|| ParseError::Extension(key.to_string()))?;

        let stem = &key[..key.len() - ext.len()];
        let mut parts = stem.split('.');

        match (parts.next(), parts.next(), parts.next(), parts.next(), parts.next()) {
            (Some(project), Some(sample_id), Some(run_id), Some(platform), None)
                if !project.is_empty()
                    && !sample_id.is_empty()
                    && !run_id.is_empty()
                    && !platform.is_empty() =>
            {
                Ok(Self {
                    project: project.to_string(),
                    sample_id: sample_id.to_string(),
                    run_id: run_id.to_string(),
                    platform: platform.to_string(),
                    ext: ext.to_string(),
                    key: key.to_string(),
                })
            }
            _ => Err(ParseError::KeySections(key.to_string())),
        }
    }

    /// The identity under which files are correlated into submissions.
    pub fn artifact(&self) -> String {
        format!("{}.{}.{}", self.project, self.sample_id, self.run_id)
    }

    /// Verify that the bucket this object arrived in agrees with the
    /// project and platform encoded in its key.
    pub fn check_bucket(&self, bucket: &BucketName) -> Result<(), ParseError> {
        if self.project != bucket.project {
            return Err(ParseError::Disagreement {
                field: "project",
                in_bucket: bucket.project.clone(),
                in_key: self.project.clone(),
            });
        }
        if self.platform != bucket.platform {
            return Err(ParseError::Disagreement {
                field: "platform",
                in_bucket: bucket.platform.clone(),
                in_key: self.platform.clone(),
            });
        }
        Ok(())
    }
}
