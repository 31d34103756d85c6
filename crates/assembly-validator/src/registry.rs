use std::collections::BTreeMap;

use serde_json::Value;
use url::Url;

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("failed to reach the genome registry")]
    Connection(#[source] reqwest::Error),
    #[error("genome registry rejected the submission ({status}): {body}")]
    Rejected { status: u16, body: String },
    #[error("genome registry returned no submission id")]
    MissingId,
}

/// The downstream genome registry assemblies are shared with after
/// publication. Tests substitute scripted implementations.
#[async_trait::async_trait]
pub trait Registry: Send + Sync {
    /// Submit a genome by retrieval URL, returning the registry's
    /// submission identifier.
    async fn submit_genome(
        &self,
        download_url: &str,
        metadata: &BTreeMap<String, Value>,
    ) -> Result<String, RegistryError>;
}

pub struct HttpRegistry {
    http: reqwest::Client,
    endpoint: Url,
    api_key: String,
    collection: i64,
}

impl HttpRegistry {
    pub fn new(endpoint: Url, api_key: String, collection: i64) -> Self {
        Self {
            http: reqwest::Client::new(),
            endpoint,
            api_key,
            collection,
        }
    }
}

#[async_trait::async_trait]
impl Registry for HttpRegistry {
    async fn submit_genome(
        &self,
        download_url: &str,
        metadata: &BTreeMap<String, Value>,
    ) -> Result<String, RegistryError> {
        let body = serde_json::json!({
            "url": download_url,
            "collectionId": self.collection,
            "metadata": metadata,
        });

        let response = self
            .http
            .post(self.endpoint.clone())
            .header("X-API-Key", &self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(RegistryError::Connection)?;

        let status = response.status();
        if status != reqwest::StatusCode::CREATED {
            let body = response.text().await.unwrap_or_default();
            return Err(RegistryError::Rejected {
                status: status.as_u16(),
                body,
            });
        }

        let body: Value = response.json().await.map_err(RegistryError::Connection)?;
        match body.get("id") {
            Some(Value::String(id)) => Ok(id.clone()),
            Some(Value::Number(id)) => Ok(id.to_string()),
            _ => Err(RegistryError::MissingId),
        }
    }
}

/// The record fields shared with the registry: everything populated on
/// the record except the pipeline's own bookkeeping.
pub fn registry_metadata(record: &Value) -> BTreeMap<String, Value> {
    const IGNORED: &[&str] = &["climb_id", "sample_id", "run_id", "is_published"];

    let Value::Object(map) = record else {
        return BTreeMap::new();
    };

    map.iter()
        .filter(|(field, value)| !IGNORED.contains(&field.as_str()) && !value.is_null())
        .filter(|(_, value)| *value != &Value::String(String::new()))
        .map(|(field, value)| (field.clone(), value.clone()))
        .collect()
}
