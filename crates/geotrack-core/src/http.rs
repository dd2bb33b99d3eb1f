//! Upload transport and wire format.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

use geotrack_types::{Extras, LocationRecord};

use crate::config::{HttpMethod, TrackingConfig};
use crate::error::UploadError;

/// A fully built upload.
#[derive(Debug, Clone, PartialEq)]
pub struct UploadRequest {
    pub url: String,
    pub method: HttpMethod,
    pub headers: BTreeMap<String, String>,
    pub body: Value,
    pub timeout: Duration,
}

impl UploadRequest {
    /// Build the request for `records` from the current options.
    pub fn new(config: &TrackingConfig, records: &[LocationRecord]) -> Result<Self, UploadError> {
        Ok(Self {
            url: config.url.clone(),
            method: config.method,
            headers: config.headers.clone(),
            body: build_body(records, &config.params, config.batch_sync)?,
            timeout: config.http_timeout_duration(),
        })
    }
}

/// Status and body of a completed request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadResponse {
    pub status: u16,
    pub body: String,
}

impl UploadResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Something that can deliver a batch to the server.
///
/// Implementations report any HTTP status as `Ok`; only transport failures
/// are errors.
#[async_trait]
pub trait Uploader: Send + Sync {
    async fn upload(&self, request: UploadRequest) -> Result<UploadResponse, UploadError>;
}

/// Encode records into the upload body.
///
/// Batched bodies wrap the records as `{"locations": [...]}`; otherwise the
/// single record is the body. `params` entries become top-level keys.
pub fn build_body(records: &[LocationRecord], params: &Extras, batch: bool) -> Result<Value, UploadError> {
    let mut body = if batch {
        let mut map = serde_json::Map::new();
        map.insert("locations".to_string(), serde_json::to_value(records)?);
        map
    } else {
        let record = records
            .first()
            .ok_or_else(|| UploadError::InvalidRequest("no record to upload".into()))?;
        match serde_json::to_value(record)? {
            Value::Object(map) => map,
            other => return Ok(other),
        }
    };

    for (key, value) in params {
        body.insert(key.clone(), value.clone());
    }
    Ok(Value::Object(body))
}

/// [`Uploader`] backed by `reqwest`.
#[derive(Debug, Clone, Default)]
pub struct HttpUploader {
    client: reqwest::Client,
}

impl HttpUploader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Client whose connection attempts give up after `timeout`.
    ///
    /// The overall request timeout still comes from each [`UploadRequest`].
    pub fn with_connect_timeout(timeout: Duration) -> Result<Self, UploadError> {
        let client = reqwest::Client::builder().connect_timeout(timeout).build()?;
        Ok(Self { client })
    }

    /// Use a preconfigured client.
    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Uploader for HttpUploader {
    async fn upload(&self, request: UploadRequest) -> Result<UploadResponse, UploadError> {
        let method = match request.method {
            HttpMethod::Post => reqwest::Method::POST,
            HttpMethod::Put => reqwest::Method::PUT,
        };

        let mut builder = self
            .client
            .request(method, &request.url)
            .timeout(request.timeout)
            .header(reqwest::header::CONTENT_TYPE, "application/json");
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        let body = serde_json::to_vec(&request.body)?;

        debug!("{} {} ({} bytes)", request.method, request.url, body.len());

        let response = builder.body(body).send().await.map_err(|e| {
            if e.is_timeout() {
                UploadError::Timeout(request.timeout)
            } else {
                UploadError::from(e)
            }
        })?;

        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();
        Ok(UploadResponse { status, body })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use geotrack_types::Coords;
    use serde_json::json;

    fn record(uuid: &str) -> LocationRecord {
        let mut record = LocationRecord::new(
            Coords {
                latitude: 45.5,
                longitude: -73.5,
                accuracy: 5.0,
                speed: None,
                heading: None,
                altitude: None,
                altitude_accuracy: None,
            },
            1_700_000_000_000,
        );
        record.uuid = uuid.to_string();
        record
    }

    #[test]
    fn test_batch_body() {
        let mut params = Extras::new();
        params.insert("device_id".into(), json!("abc"));

        let body = build_body(&[record("a"), record("b")], &params, true).unwrap();
        let locations = body["locations"].as_array().unwrap();
        assert_eq!(locations.len(), 2);
        assert_eq!(locations[0]["uuid"], "a");
        assert_eq!(locations[1]["coords"]["latitude"], 45.5);
        assert_eq!(body["device_id"], "abc");
    }

    #[test]
    fn test_single_body() {
        let mut params = Extras::new();
        params.insert("user".into(), json!(7));

        let body = build_body(&[record("a")], &params, false).unwrap();
        assert_eq!(body["uuid"], "a");
        assert_eq!(body["user"], 7);
        assert!(body.get("locations").is_none());
    }

    #[test]
    fn test_single_body_requires_record() {
        let err = build_body(&[], &Extras::new(), false).unwrap_err();
        assert!(matches!(err, UploadError::InvalidRequest(_)));
    }

    #[test]
    fn test_request_from_config() {
        let config = TrackingConfig {
            url: "http://localhost/locations".into(),
            method: HttpMethod::Put,
            http_timeout: 12,
            headers: BTreeMap::from([("Authorization".to_string(), "Bearer x".to_string())]),
            ..Default::default()
        };
        let request = UploadRequest::new(&config, &[record("a")]).unwrap();
        assert_eq!(request.method, HttpMethod::Put);
        assert_eq!(request.timeout, Duration::from_secs(12));
        assert_eq!(request.headers["Authorization"], "Bearer x");
        assert!(request.body["locations"].is_array());
    }

    #[test]
    fn test_connect_timeout_client_builds() {
        let config = TrackingConfig {
            http_timeout: 7,
            ..Default::default()
        };
        assert!(HttpUploader::with_connect_timeout(config.http_timeout_duration()).is_ok());
    }

    #[test]
    fn test_response_success_range() {
        let ok = |status| UploadResponse { status, body: String::new() }.is_success();
        assert!(ok(200));
        assert!(ok(204));
        assert!(!ok(199));
        assert!(!ok(301));
        assert!(!ok(500));
    }
}
