use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{debug, warn};

use super::error::{Result, UploadError};
use super::file::LocalFile;

/// Longest file name or content type the grant endpoint accepts
pub const MAX_FIELD_LEN: usize = 255;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GrantRequest<'a> {
    file_name: &'a str,
    content_type: &'a str,
}

#[derive(Debug, Deserialize)]
struct GrantErrorBody {
    error: Option<String>,
    details: Option<serde_json::Value>,
}

fn default_method() -> String {
    "PUT".to_string()
}

/// Time-limited authorization to upload one object
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferDescriptor {
    #[serde(default = "default_method")]
    pub method: String,
    pub upload_url: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    pub object_name: String,
    pub public_url: String,
    pub expires_at: DateTime<Utc>,
}

impl TransferDescriptor {
    pub fn is_expired(&self) -> bool {
        self.expires_at <= Utc::now()
    }
}

/// Header carrying the caller's identity to the grant endpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentityHeader {
    pub name: String,
    pub value: String,
}

/// Client for the endpoint that issues upload grants
#[derive(Debug, Clone)]
pub struct GrantClient {
    client: reqwest::Client,
    endpoint: String,
    identity: Option<IdentityHeader>,
}

impl GrantClient {
    pub fn new(
        client: reqwest::Client,
        endpoint: impl Into<String>,
        identity: Option<IdentityHeader>,
    ) -> Self {
        Self {
            client,
            endpoint: endpoint.into(),
            identity,
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Ask the grant endpoint for a transfer descriptor for one file
    ///
    /// # Errors
    ///
    /// * `Validation` if the name or content type is empty or too long
    /// * `Authorization` if the endpoint answers with a non-success status
    /// * `Transport` if the endpoint can't be reached or its answer can't be parsed
    pub async fn request_grant(&self, file: &LocalFile) -> Result<TransferDescriptor> {
        let request = GrantRequest {
            file_name: file.name(),
            content_type: file.content_type(),
        };
        validate_field("fileName", request.file_name)?;
        validate_field("contentType", request.content_type)?;

        debug!(
            "Requesting upload grant for {} ({})",
            request.file_name, request.content_type
        );

        let mut builder = self.client.post(&self.endpoint).json(&request);
        if let Some(identity) = &self.identity {
            builder = builder.header(identity.name.as_str(), identity.value.as_str());
        }

        let response = builder.send().await?;
        let status = response.status();

        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            let body = serde_json::from_str::<GrantErrorBody>(&text).ok();
            if let Some(details) = body.as_ref().and_then(|b| b.details.as_ref()) {
                debug!("Grant rejection details: {}", details);
            }
            let message = error_message(status, body);
            warn!(
                "Grant request for {} rejected with {}: {}",
                request.file_name, status, message
            );
            return Err(UploadError::Authorization {
                status: status.as_u16(),
                message,
            });
        }

        let descriptor: TransferDescriptor = response.json().await.map_err(|e| {
            UploadError::Transport(format!("Malformed grant response: {}", e))
        })?;

        debug!(
            "Granted {} until {}",
            descriptor.object_name, descriptor.expires_at
        );

        Ok(descriptor)
    }
}

fn validate_field(field: &str, value: &str) -> Result<()> {
    let len = value.chars().count();
    if len == 0 || len > MAX_FIELD_LEN {
        return Err(UploadError::Validation(format!(
            "{} must be between 1 and {} characters (got {})",
            field, MAX_FIELD_LEN, len
        )));
    }
    Ok(())
}

/// Pull the `error` field out of a failure body, or fall back to the status line
fn error_message(status: StatusCode, body: Option<GrantErrorBody>) -> String {
    body.and_then(|b| b.error)
        .filter(|e| !e.is_empty())
        .unwrap_or_else(|| match status.canonical_reason() {
            Some(reason) => format!("{} {}", status.as_u16(), reason),
            None => status.as_u16().to_string(),
        })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use httptest::{Expectation, Server, matchers::*, responders::*};
    use serde_json::json;

    pub(crate) fn grant_json(upload_url: &str, object_name: &str) -> serde_json::Value {
        json!({
            "method": "PUT",
            "uploadUrl": upload_url,
            "headers": { "Content-Type": "image/png" },
            "objectName": object_name,
            "publicUrl": format!("https://cdn.example.com/{}", object_name),
            "expiresAt": (Utc::now() + chrono::Duration::minutes(10)).to_rfc3339(),
        })
    }

    fn png() -> LocalFile {
        LocalFile::from_bytes("a.png", Some("image/png".to_string()), vec![0u8; 16])
    }

    #[tokio::test]
    async fn test_request_grant_success() {
        let server = Server::run();
        server.expect(
            Expectation::matching(all_of![
                request::method_path("POST", "/api/uploads/sign"),
                request::headers(contains(("x-upload-token", "secret"))),
                request::body(json_decoded(eq(
                    json!({"fileName": "a.png", "contentType": "image/png"})
                ))),
            ])
            .respond_with(json_encoded(grant_json(
                "https://bucket.example.com/x",
                "uploads/u1/x-a.png",
            ))),
        );

        let client = GrantClient::new(
            reqwest::Client::new(),
            server.url("/api/uploads/sign").to_string(),
            Some(IdentityHeader {
                name: "x-upload-token".to_string(),
                value: "secret".to_string(),
            }),
        );

        let descriptor = client.request_grant(&png()).await.unwrap();
        assert_eq!(descriptor.method, "PUT");
        assert_eq!(descriptor.object_name, "uploads/u1/x-a.png");
        assert_eq!(
            descriptor.public_url,
            "https://cdn.example.com/uploads/u1/x-a.png"
        );
        assert!(!descriptor.is_expired());
    }

    #[tokio::test]
    async fn test_request_grant_uses_error_field() {
        let server = Server::run();
        server.expect(
            Expectation::matching(request::method_path("POST", "/sign")).respond_with(
                status_code(401).body(r#"{"error":"Missing authentication context"}"#),
            ),
        );

        let client = GrantClient::new(reqwest::Client::new(), server.url("/sign").to_string(), None);
        let err = client.request_grant(&png()).await.unwrap_err();

        assert!(matches!(err, UploadError::Authorization { status: 401, .. }));
        assert_eq!(err.to_string(), "Missing authentication context");
    }

    #[tokio::test]
    async fn test_request_grant_falls_back_to_status_line() {
        let server = Server::run();
        server.expect(
            Expectation::matching(request::method_path("POST", "/sign"))
                .respond_with(status_code(500).body("<html>oops</html>")),
        );

        let client = GrantClient::new(reqwest::Client::new(), server.url("/sign").to_string(), None);
        let err = client.request_grant(&png()).await.unwrap_err();
        assert_eq!(err.to_string(), "500 Internal Server Error");
    }

    #[tokio::test]
    async fn test_request_grant_defaults_content_type() {
        let server = Server::run();
        server.expect(
            Expectation::matching(request::body(json_decoded(eq(json!({
                "fileName": "blob",
                "contentType": "application/octet-stream"
            })))))
            .respond_with(json_encoded(grant_json("https://b/x", "uploads/blob"))),
        );

        let client = GrantClient::new(reqwest::Client::new(), server.url("/sign").to_string(), None);
        let file = LocalFile::from_bytes("blob", None, vec![1u8; 4]);
        assert!(client.request_grant(&file).await.is_ok());
    }

    #[tokio::test]
    async fn test_request_grant_validates_name_length() {
        // Nothing listens here; validation must fail before any request is made
        let client = GrantClient::new(reqwest::Client::new(), "http://127.0.0.1:9/sign", None);
        let file = LocalFile::from_bytes("a".repeat(256), None, vec![1u8; 4]);
        let err = client.request_grant(&file).await.unwrap_err();
        assert!(matches!(err, UploadError::Validation(_)));
    }

    #[tokio::test]
    async fn test_request_grant_transport_error() {
        let client = GrantClient::new(reqwest::Client::new(), "http://127.0.0.1:9/sign", None);
        let err = client.request_grant(&png()).await.unwrap_err();
        assert!(matches!(err, UploadError::Transport(_)));
    }

    #[test]
    fn test_descriptor_defaults() {
        let descriptor: TransferDescriptor = serde_json::from_value(json!({
            "uploadUrl": "https://b/x",
            "objectName": "o",
            "publicUrl": "https://cdn/o",
            "expiresAt": "2020-01-01T00:00:00Z",
        }))
        .unwrap();
        assert_eq!(descriptor.method, "PUT");
        assert!(descriptor.headers.is_empty());
        assert!(descriptor.is_expired());
    }
}
