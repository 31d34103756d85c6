use std::collections::BTreeMap;
use std::time::Duration;

use reqwest::StatusCode;
use serde_json::Value;
use url::Url;

use crate::{metadata::parse_metadata, Created, Error, FieldErrors, RecordIds, Records};

/// Connection errors are retried this many further times, this far apart,
/// before the failure is surfaced with an alert.
const CONNECT_RETRIES: u32 = 3;
const CONNECT_RETRY_PAUSE: Duration = Duration::from_secs(3);

#[derive(Debug, Clone)]
pub struct Config {
    /// Base URL of the Onyx deployment.
    pub base_url: Url,
    pub token: String,
}

/// Production `Records` implementation over the Onyx HTTP API. The client
/// is an explicit, injected value; credentials are per-instance, not
/// process-wide.
#[derive(Clone)]
pub struct Client {
    http: reqwest::Client,
    config: Config,
    retry_pause: Duration,
}

impl Client {
    pub fn new(config: Config) -> Self {
        Self {
            http: reqwest::Client::new(),
            config,
            retry_pause: CONNECT_RETRY_PAUSE,
        }
    }

    #[cfg(test)]
    fn with_retry_pause(mut self, pause: Duration) -> Self {
        self.retry_pause = pause;
        self
    }

    fn endpoint(&self, path: &str) -> Result<Url, Error> {
        Ok(self.config.base_url.join(path)?)
    }

    /// Issue `request`, classifying the outcome and retrying connection
    /// failures with the fixed policy.
    async fn execute(
        &self,
        request: reqwest::RequestBuilder,
    ) -> Result<(StatusCode, Value), Error> {
        let mut attempt = 0u32;
        loop {
            let request = request
                .try_clone()
                .expect("onyx requests carry no streaming body")
                .bearer_auth(&self.config.token);

            let outcome = match request.send().await {
                Ok(response) => classify(response).await,
                Err(err) => Err(Error::Connection(err)),
            };

            // Connection failures and server errors are transient; retry
            // them in place with the fixed policy.
            match outcome {
                Err(err @ (Error::Connection(_) | Error::Server { .. }))
                    if attempt < CONNECT_RETRIES =>
                {
                    attempt += 1;
                    tracing::warn!(
                        attempt,
                        error = %err,
                        "Onyx request failed, retrying in {:?}",
                        self.retry_pause,
                    );
                    tokio::time::sleep(self.retry_pause).await;
                }
                other => return other,
            }
        }
    }
}

/// Map a response onto the four-way classification, decoding the body of
/// successful responses as JSON.
async fn classify(response: reqwest::Response) -> Result<(StatusCode, Value), Error> {
    let status = response.status();
    let body = response.text().await.map_err(Error::Connection)?;

    classify_body(status, &body).map(|value| (status, value))
}

fn classify_body(status: StatusCode, body: &str) -> Result<Value, Error> {
    let json = || -> Result<Value, Error> {
        if body.is_empty() {
            Ok(Value::Null)
        } else {
            serde_json::from_str(body).map_err(Error::Decode)
        }
    };

    if status.is_success() {
        return json();
    }
    if status == StatusCode::FORBIDDEN {
        return Err(Error::Forbidden {
            status: status.as_u16(),
            body: body.to_string(),
        });
    }
    if status.is_client_error() {
        let messages: FieldErrors = json()
            .ok()
            .and_then(|mut value| value.get_mut("messages").map(Value::take))
            .and_then(|messages| serde_json::from_value(normalise_messages(messages)).ok())
            .unwrap_or_default();

        return Err(Error::Request {
            status: status.as_u16(),
            messages,
        });
    }

    Err(Error::Server {
        status: status.as_u16(),
        body: body.to_string(),
    })
}

/// Onyx reports single-message fields as bare strings; lift them to lists
/// so callers always see `field -> [messages]`.
fn normalise_messages(messages: Value) -> Value {
    let Value::Object(map) = messages else {
        return Value::Object(Default::default());
    };

    Value::Object(
        map.into_iter()
            .map(|(field, value)| match value {
                Value::String(s) => (field, Value::Array(vec![Value::String(s)])),
                other => (field, other),
            })
            .collect(),
    )
}

#[async_trait::async_trait]
impl Records for Client {
    async fn csv_create(
        &self,
        project: &str,
        csv: &[u8],
        extra_fields: &BTreeMap<String, Value>,
        test: bool,
    ) -> Result<Created, Error> {
        let mut fields: BTreeMap<String, Value> = parse_metadata(csv)?
            .into_iter()
            .map(|(k, v)| (k, Value::String(v)))
            .collect();
        fields.extend(extra_fields.clone());

        let mut url = self.endpoint(&format!("projects/{project}/"))?;
        if test {
            url.query_pairs_mut().append_pair("test", "true");
        }

        let (status, body) = self.execute(self.http.post(url).json(&fields)).await?;

        let ids: RecordIds = match body.get("data") {
            Some(data) => serde_json::from_value(data.clone()).map_err(Error::Decode)?,
            None => RecordIds::default(),
        };

        Ok(Created {
            status: status.as_u16(),
            ids,
        })
    }

    async fn identify(
        &self,
        project: &str,
        field: &str,
        value: &str,
    ) -> Result<Option<String>, Error> {
        let url = self.endpoint(&format!("projects/{project}/identify/{field}/"))?;
        let result = self
            .execute(self.http.post(url).json(&serde_json::json!({ "value": value })))
            .await;

        match result {
            Ok((_, body)) => Ok(body
                .get("data")
                .and_then(|data| data.get("identifier"))
                .and_then(Value::as_str)
                .map(str::to_string)),
            // An unknown identifier is an expected outcome, not a failure.
            Err(Error::Request { status: 404, .. }) => Ok(None),
            Err(err) => Err(err),
        }
    }

    async fn filter(
        &self,
        project: &str,
        fields: &BTreeMap<String, String>,
    ) -> Result<Vec<Value>, Error> {
        let mut url = self.endpoint(&format!("projects/{project}/"))?;
        for (field, value) in fields {
            url.query_pairs_mut().append_pair(field, value);
        }

        let (_, body) = self.execute(self.http.get(url)).await?;
        match body.get("data") {
            Some(Value::Array(records)) => Ok(records.clone()),
            _ => Ok(Vec::new()),
        }
    }

    async fn update(
        &self,
        project: &str,
        climb_id: &str,
        fields: &BTreeMap<String, Value>,
    ) -> Result<(), Error> {
        let url = self.endpoint(&format!("projects/{project}/{climb_id}/"))?;
        self.execute(self.http.patch(url).json(fields)).await?;
        Ok(())
    }

    async fn unsuppress(&self, project: &str, climb_id: &str) -> Result<(), Error> {
        let fields = BTreeMap::from([("is_published".to_string(), Value::Bool(true))]);
        self.update(project, climb_id, &fields).await
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn success_bodies_decode() {
        let body = r#"{"data": {"climb_id": "C-123", "sample_id": "S-1"}}"#;
        let value = classify_body(StatusCode::CREATED, body).unwrap();
        assert_eq!(value["data"]["climb_id"], "C-123");

        assert_eq!(classify_body(StatusCode::OK, "").unwrap(), Value::Null);
    }

    #[test]
    fn request_errors_carry_field_messages() {
        let body = r#"{"messages": {"sample_id": ["value already exists"], "adm1": "is required"}}"#;
        let err = classify_body(StatusCode::UNPROCESSABLE_ENTITY, body).unwrap_err();

        let messages = err.field_messages().unwrap();
        assert_eq!(messages["sample_id"], vec!["value already exists"]);
        assert_eq!(messages["adm1"], vec!["is required"]);
        assert_eq!(err.status_code(), Some(422));
        assert!(!err.should_alert());
    }

    #[test]
    fn forbidden_and_server_errors_alert() {
        let err = classify_body(StatusCode::FORBIDDEN, "denied").unwrap_err();
        assert!(matches!(err, Error::Forbidden { status: 403, .. }));
        assert!(err.should_alert());

        let err = classify_body(StatusCode::BAD_GATEWAY, "").unwrap_err();
        assert!(matches!(err, Error::Server { status: 502, .. }));
        assert!(err.should_alert());
    }

    #[test]
    fn unparseable_request_bodies_degrade_to_empty_messages() {
        let err = classify_body(StatusCode::BAD_REQUEST, "not json").unwrap_err();
        assert_eq!(err.field_messages().unwrap().len(), 0);
    }

    /// Two dropped connections followed by a healthy service: the create
    /// succeeds exactly once, with no caller-visible failure.
    #[tokio::test]
    async fn connection_failures_retry_until_the_service_recovers() {
        use std::collections::BTreeMap;
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            for _ in 0..2 {
                let (stream, _) = listener.accept().await.unwrap();
                drop(stream);
            }

            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 8192];
            let _ = stream.read(&mut buf).await;

            let body = r#"{"data": {"climb_id": "C-1", "sample_id": "s1", "run_id": "r1"}}"#;
            let response = format!(
                "HTTP/1.1 201 Created\r\ncontent-type: application/json\r\n\
                 content-length: {}\r\nconnection: close\r\n\r\n{body}",
                body.len(),
            );
            stream.write_all(response.as_bytes()).await.unwrap();
        });

        let client = Client::new(Config {
            base_url: format!("http://{addr}/").parse().unwrap(),
            token: "token".to_string(),
        })
        .with_retry_pause(Duration::from_millis(10));

        let created = client
            .csv_create(
                "metagen",
                b"sample_id,run_id\ns1,r1\n",
                &BTreeMap::new(),
                false,
            )
            .await
            .unwrap();

        assert_eq!(created.status, 201);
        assert_eq!(created.ids.climb_id.as_deref(), Some("C-1"));
    }
}
