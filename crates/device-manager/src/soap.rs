use crate::wsse;
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::time::Duration;
use tracing::debug;

pub const SOAP_ENV_NS: &str = "http://www.w3.org/2003/05/soap-envelope";

/// One ONVIF operation ready to be wrapped in an envelope.
#[derive(Debug, Clone, PartialEq)]
pub struct OnvifRequest {
    pub namespace: &'static str,
    pub operation: &'static str,
    pub body: String,
}

impl OnvifRequest {
    /// SOAP 1.2 action URI, `<namespace>/<operation>`
    pub fn action(&self) -> String {
        format!("{}/{}", self.namespace, self.operation)
    }
}

/// Raw HTTP outcome of a SOAP call; faults are interpreted by the caller.
#[derive(Debug, Clone, PartialEq)]
pub struct SoapResponse {
    pub status: u16,
    pub body: String,
}

impl SoapResponse {
    pub fn is_http_success(&self) -> bool {
        self.status < 400
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SoapAuth {
    pub username: String,
    pub password: String,
}

impl SoapAuth {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

/// Trait for delivering SOAP requests to a device endpoint
#[async_trait]
pub trait SoapTransport: Send + Sync {
    async fn send(
        &self,
        endpoint: &str,
        request: &OnvifRequest,
        auth: Option<&SoapAuth>,
    ) -> Result<SoapResponse>;
}

/// SOAP over HTTP using reqwest
#[derive(Clone)]
pub struct HttpSoapTransport {
    http_client: reqwest::Client,
}

impl HttpSoapTransport {
    pub fn new(timeout: Duration) -> Result<Self> {
        let http_client = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .build()
            .context("failed to build SOAP http client")?;
        Ok(Self { http_client })
    }
}

#[async_trait]
impl SoapTransport for HttpSoapTransport {
    async fn send(
        &self,
        endpoint: &str,
        request: &OnvifRequest,
        auth: Option<&SoapAuth>,
    ) -> Result<SoapResponse> {
        let envelope = build_envelope(&request.body, auth)?;
        let content_type = format!(
            "application/soap+xml; charset=utf-8; action=\"{}\"",
            request.action()
        );

        debug!(operation = request.operation, endpoint, "sending ONVIF request");

        let mut builder = self
            .http_client
            .post(endpoint)
            .header("Content-Type", content_type)
            .body(envelope);

        // Some firmware ignores WS-Security and only honours HTTP auth
        if let Some(auth) = auth {
            builder = builder.basic_auth(&auth.username, Some(&auth.password));
        }

        let response = builder
            .send()
            .await
            .with_context(|| format!("{} request to {} failed", request.operation, endpoint))?;
        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();

        Ok(SoapResponse { status, body })
    }
}

/// Wrap a body in a SOAP 1.2 envelope, adding a UsernameToken header when
/// credentials are present.
pub fn build_envelope(body: &str, auth: Option<&SoapAuth>) -> Result<String> {
    let header = match auth {
        Some(auth) => wsse::build_wsse_header(&auth.username, &auth.password)?,
        None => String::new(),
    };
    Ok(format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<s:Envelope xmlns:s="{SOAP_ENV_NS}">
{header}  <s:Body xmlns:xsi="http://www.w3.org/2001/XMLSchema-instance" xmlns:xsd="http://www.w3.org/2001/XMLSchema">
    {body}
  </s:Body>
</s:Envelope>
"#
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_without_auth_has_no_header() {
        let envelope = build_envelope("<GetProfiles/>", None).unwrap();
        assert!(envelope.contains("<GetProfiles/>"));
        assert!(!envelope.contains("s:Header"));
        assert!(envelope.contains(SOAP_ENV_NS));
    }

    #[test]
    fn envelope_with_auth_carries_username_token() {
        let auth = SoapAuth::new("admin", "secret");
        let envelope = build_envelope("<GetProfiles/>", Some(&auth)).unwrap();
        assert!(envelope.contains("<s:Header>"));
        assert!(envelope.contains("<Username>admin</Username>"));
        assert!(!envelope.contains("secret"));
    }

    #[test]
    fn action_joins_namespace_and_operation() {
        let request = OnvifRequest {
            namespace: "http://www.onvif.org/ver10/media/wsdl",
            operation: "GetProfiles",
            body: String::new(),
        };
        assert_eq!(
            request.action(),
            "http://www.onvif.org/ver10/media/wsdl/GetProfiles"
        );
    }
}
