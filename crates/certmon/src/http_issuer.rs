//! HTTP fallback issuer
//!
//! Requests a certificate from an issuance endpoint:
//!
//! ```text
//! POST <url>
//! Authorization: Bearer <agent token>
//! {"dns_sans": [..], "ip_sans": [..], "datacenter": "..", "node_name": ".."}
//!
//! 200 OK
//! {"certificate": "<PEM>", "private_key": "<PEM>", "ca_certificates": ["<PEM>", ..]}
//! ```

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use tracing::{debug, trace};
use url::Url;

use crate::certificate::CertificateValue;
use crate::config::IdentityRequest;
use crate::error::IssueError;
use crate::fallback::{FallbackIssuer, IssueContext};

/// Default request timeout
pub const DEFAULT_ISSUE_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Deserialize)]
struct IssueResponse {
    certificate: String,
    private_key: String,
    #[serde(default)]
    ca_certificates: Vec<String>,
}

/// Fallback issuer backed by an HTTP endpoint
#[derive(Debug, Clone)]
pub struct HttpIssuer {
    client: reqwest::Client,
    url: Url,
    timeout: Duration,
}

impl HttpIssuer {
    pub fn new(url: Url, timeout: Duration) -> Result<Self, IssueError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| IssueError::Transport(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            url,
            timeout,
        })
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    fn transport_error(&self, e: reqwest::Error) -> IssueError {
        if e.is_timeout() {
            IssueError::Timeout(self.timeout)
        } else {
            IssueError::Transport(e.to_string())
        }
    }

    async fn request(
        &self,
        ctx: &IssueContext,
        request: &IdentityRequest,
    ) -> Result<CertificateValue, IssueError> {
        let mut builder = self.client.post(self.url.clone()).json(request);
        if let Some(token) = ctx.token() {
            builder = builder.bearer_auth(token);
        }

        debug!(url = %self.url, attempt = ctx.attempt(), "Requesting certificate");

        let response = builder.send().await.map_err(|e| self.transport_error(e))?;
        let status = response.status();

        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            let body = response.text().await.unwrap_or_default();
            return Err(IssueError::Unauthorized(format!("{} - {}", status, body.trim())));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(IssueError::Backend(format!("{} - {}", status, body.trim())));
        }

        let issued: IssueResponse = response
            .json()
            .await
            .map_err(|e| IssueError::InvalidResponse(e.to_string()))?;

        trace!(
            ca_certificates = issued.ca_certificates.len(),
            "Received certificate from issuance endpoint"
        );

        let ca_pem = issued.ca_certificates.join("\n");
        let value = CertificateValue::from_pem(
            issued.certificate.as_bytes(),
            issued.private_key.as_bytes(),
            (!ca_pem.is_empty()).then_some(ca_pem.as_bytes()),
        )?;
        Ok(value)
    }
}

#[async_trait]
impl FallbackIssuer for HttpIssuer {
    async fn issue(
        &self,
        ctx: &IssueContext,
        request: &IdentityRequest,
    ) -> Result<CertificateValue, IssueError> {
        tokio::select! {
            _ = ctx.cancellation().cancelled() => Err(IssueError::Cancelled),
            result = self.request(ctx, request) => result,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::generate_pem;
    use serde_json::json;
    use std::net::{IpAddr, Ipv4Addr};
    use tokio_util::sync::CancellationToken;
    use wiremock::matchers::{body_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const LEAF_PATH: &str = "/v1/agent/certificate";

    fn identity() -> IdentityRequest {
        IdentityRequest {
            dns_sans: vec!["node-1.dc1.internal".to_string()],
            ip_sans: vec![IpAddr::V4(Ipv4Addr::new(10, 0, 0, 7))],
            datacenter: "dc1".to_string(),
            node_name: "node-1".to_string(),
        }
    }

    fn issuer(server: &MockServer) -> HttpIssuer {
        let url = Url::parse(&format!("{}{}", server.uri(), LEAF_PATH)).unwrap();
        HttpIssuer::new(url, Duration::from_secs(5)).unwrap()
    }

    fn ctx(token: Option<&str>) -> IssueContext {
        IssueContext::new(CancellationToken::new(), 1, token.map(str::to_string))
    }

    #[tokio::test]
    async fn test_issue_sends_identity_and_token() {
        let server = MockServer::start().await;
        let generated = generate_pem("node-1.dc1.internal");

        Mock::given(method("POST"))
            .and(path(LEAF_PATH))
            .and(header("authorization", "Bearer agent-token"))
            .and(body_json(json!({
                "dns_sans": ["node-1.dc1.internal"],
                "ip_sans": ["10.0.0.7"],
                "datacenter": "dc1",
                "node_name": "node-1",
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "certificate": generated.cert_pem,
                "private_key": generated.key_pem,
                "ca_certificates": [generated.ca_pem],
            })))
            .expect(1)
            .mount(&server)
            .await;

        let value = issuer(&server)
            .issue(&ctx(Some("agent-token")), &identity())
            .await
            .unwrap();

        assert_eq!(value.chain().len(), 1);
        assert!(value.serial().is_some());
    }

    #[tokio::test]
    async fn test_forbidden_maps_to_unauthorized() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(LEAF_PATH))
            .respond_with(ResponseTemplate::new(403).set_body_string("ACL not found"))
            .mount(&server)
            .await;

        let err = issuer(&server).issue(&ctx(None), &identity()).await.unwrap_err();

        assert!(matches!(err, IssueError::Unauthorized(msg) if msg.contains("ACL not found")));
    }

    #[tokio::test]
    async fn test_server_error_maps_to_backend() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(LEAF_PATH))
            .respond_with(ResponseTemplate::new(500).set_body_string("No cluster leader"))
            .mount(&server)
            .await;

        let err = issuer(&server).issue(&ctx(None), &identity()).await.unwrap_err();

        assert!(matches!(err, IssueError::Backend(msg) if msg.contains("500")));
    }

    #[tokio::test]
    async fn test_malformed_body_maps_to_invalid_response() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(LEAF_PATH))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"certificate": 42})))
            .mount(&server)
            .await;

        let err = issuer(&server).issue(&ctx(None), &identity()).await.unwrap_err();

        assert!(matches!(err, IssueError::InvalidResponse(_)));
    }

    #[tokio::test]
    async fn test_unparsable_certificate_is_certificate_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(LEAF_PATH))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "certificate": "not a certificate",
                "private_key": "not a key",
            })))
            .mount(&server)
            .await;

        let err = issuer(&server).issue(&ctx(None), &identity()).await.unwrap_err();

        assert!(matches!(err, IssueError::Certificate(_)));
    }

    #[tokio::test]
    async fn test_slow_endpoint_times_out() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(LEAF_PATH))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(5)))
            .mount(&server)
            .await;

        let url = Url::parse(&format!("{}{}", server.uri(), LEAF_PATH)).unwrap();
        let issuer = HttpIssuer::new(url, Duration::from_millis(100)).unwrap();
        let err = issuer.issue(&ctx(None), &identity()).await.unwrap_err();

        assert!(matches!(err, IssueError::Timeout(_)));
    }

    #[tokio::test]
    async fn test_cancelled_request_returns_cancelled() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(LEAF_PATH))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(30)))
            .mount(&server)
            .await;

        let ctx = ctx(None);
        ctx.cancellation().cancel();
        let err = issuer(&server).issue(&ctx, &identity()).await.unwrap_err();

        assert!(matches!(err, IssueError::Cancelled));
    }
}
