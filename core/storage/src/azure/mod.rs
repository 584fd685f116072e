//! Azure Storage backend.
//!
//! This module talks to the Table and Blob REST services with:
//! - Shared Key request signing
//! - Create-if-not-exists provisioning that treats "already exists" as success
//! - Service error codes surfaced as backend errors

pub mod auth;
pub mod blob;
pub mod table;

pub use auth::SharedKey;
pub use blob::AzureBlobClient;
pub use table::AzureTableClient;

use chrono::Utc;
use reqwest::Response;
use serde::{Deserialize, Serialize};
use url::Url;

use azkeep_common::{Error, Result};

/// Default endpoint suffix for public Azure.
pub const DEFAULT_ENDPOINT_SUFFIX: &str = "core.windows.net";

/// Header carrying the service error code.
const ERROR_CODE_HEADER: &str = "x-ms-error-code";

/// Endpoint configuration for the Azure backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AzureConfig {
    /// DNS suffix used to derive `https://{account}.{service}.{suffix}`.
    #[serde(default = "default_endpoint_suffix")]
    pub endpoint_suffix: String,
    /// Explicit table endpoint (e.g. an emulator); overrides the suffix.
    #[serde(default)]
    pub table_endpoint: Option<String>,
    /// Explicit blob endpoint (e.g. an emulator); overrides the suffix.
    #[serde(default)]
    pub blob_endpoint: Option<String>,
}

fn default_endpoint_suffix() -> String {
    DEFAULT_ENDPOINT_SUFFIX.to_string()
}

impl Default for AzureConfig {
    fn default() -> Self {
        Self {
            endpoint_suffix: default_endpoint_suffix(),
            table_endpoint: None,
            blob_endpoint: None,
        }
    }
}

impl AzureConfig {
    /// Table service base URL for `account`.
    pub fn table_url(&self, account: &str) -> Result<Url> {
        service_url(self.table_endpoint.as_deref(), account, "table", &self.endpoint_suffix)
    }

    /// Blob service base URL for `account`.
    pub fn blob_url(&self, account: &str) -> Result<Url> {
        service_url(self.blob_endpoint.as_deref(), account, "blob", &self.endpoint_suffix)
    }
}

fn service_url(explicit: Option<&str>, account: &str, service: &str, suffix: &str) -> Result<Url> {
    let raw = match explicit {
        Some(url) => url.to_string(),
        None => format!("https://{}.{}.{}/", account, service, suffix),
    };
    let url = Url::parse(&raw)
        .map_err(|e| Error::Configuration(format!("Invalid {} endpoint '{}': {}", service, raw, e)))?;
    if url.cannot_be_a_base() {
        return Err(Error::Configuration(format!(
            "Invalid {} endpoint '{}'",
            service, raw
        )));
    }
    Ok(url)
}

/// Append path segments to a service base URL.
///
/// Each segment is percent-encoded on its own.
pub(crate) fn resource_url<'a>(base: &Url, segments: impl IntoIterator<Item = &'a str>) -> Result<Url> {
    let mut url = base.clone();
    url.path_segments_mut()
        .map_err(|_| Error::Configuration(format!("Endpoint '{}' cannot hold a path", base)))?
        .pop_if_empty()
        .extend(segments);
    Ok(url)
}

/// Current time in the RFC 1123 form `x-ms-date` expects.
pub(crate) fn ms_date() -> String {
    Utc::now().format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

pub(crate) fn network_error(context: &str, e: reqwest::Error) -> Error {
    Error::Network(format!("{}: {}", context, e))
}

/// Convert a failed response into a backend error.
///
/// The code comes from the `x-ms-error-code` header, falling back to the
/// body (JSON for tables, XML for blobs).
pub(crate) async fn error_from_response(response: Response) -> Error {
    let status = response.status().as_u16();
    let header_code = response
        .headers()
        .get(ERROR_CODE_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let body = response.text().await.unwrap_or_default();

    let (body_code, message) = parse_error_body(&body);
    let code = header_code
        .or(body_code)
        .unwrap_or_else(|| "Unknown".to_string());
    let message = message.unwrap_or_else(|| {
        if body.is_empty() {
            format!("HTTP {}", status)
        } else {
            body.clone()
        }
    });

    Error::backend(status, code, message)
}

fn parse_error_body(body: &str) -> (Option<String>, Option<String>) {
    if let Ok(json) = serde_json::from_str::<serde_json::Value>(body) {
        let error = json.get("odata.error").or_else(|| json.get("error"));
        if let Some(error) = error {
            let code = error.get("code").and_then(|c| c.as_str()).map(str::to_string);
            let message = error
                .get("message")
                .and_then(|m| m.get("value").or(Some(m)))
                .and_then(|m| m.as_str())
                .map(str::to_string);
            return (code, message);
        }
    }

    (xml_element(body, "Code"), xml_element(body, "Message"))
}

fn xml_element(body: &str, tag: &str) -> Option<String> {
    let open = format!("<{}>", tag);
    let close = format!("</{}>", tag);
    let start = body.find(&open)? + open.len();
    let end = body[start..].find(&close)? + start;
    Some(body[start..end].trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_endpoints() {
        let config = AzureConfig::default();
        assert_eq!(
            config.table_url("acct").unwrap().as_str(),
            "https://acct.table.core.windows.net/"
        );
        assert_eq!(
            config.blob_url("acct").unwrap().as_str(),
            "https://acct.blob.core.windows.net/"
        );
    }

    #[test]
    fn test_explicit_endpoint_overrides_suffix() {
        let config: AzureConfig = serde_json::from_value(serde_json::json!({
            "table_endpoint": "http://127.0.0.1:10002/devstoreaccount1"
        }))
        .unwrap();

        let url = config.table_url("ignored").unwrap();
        let tables = resource_url(&url, ["Tables"]).unwrap();
        assert_eq!(tables.as_str(), "http://127.0.0.1:10002/devstoreaccount1/Tables");
        assert_eq!(config.endpoint_suffix, DEFAULT_ENDPOINT_SUFFIX);
    }

    #[test]
    fn test_invalid_endpoint_is_configuration_error() {
        let config = AzureConfig {
            blob_endpoint: Some("not a url".to_string()),
            ..AzureConfig::default()
        };
        assert!(matches!(config.blob_url("acct"), Err(Error::Configuration(_))));
    }

    #[test]
    fn test_resource_url_encodes_segments() {
        let base = Url::parse("https://acct.blob.core.windows.net/").unwrap();
        let url = resource_url(&base, ["reports", "run 1", "index.html"]).unwrap();
        assert_eq!(url.path(), "/reports/run%201/index.html");
    }

    #[test]
    fn test_parse_table_error_body() {
        let body = r#"{"odata.error":{"code":"EntityAlreadyExists","message":{"lang":"en-US","value":"The specified entity already exists."}}}"#;
        let (code, message) = parse_error_body(body);
        assert_eq!(code.as_deref(), Some("EntityAlreadyExists"));
        assert_eq!(message.as_deref(), Some("The specified entity already exists."));
    }

    #[test]
    fn test_parse_blob_error_body() {
        let body = "<?xml version=\"1.0\" encoding=\"utf-8\"?><Error><Code>ContainerNotFound</Code><Message>The specified container does not exist.</Message></Error>";
        let (code, message) = parse_error_body(body);
        assert_eq!(code.as_deref(), Some("ContainerNotFound"));
        assert_eq!(message.as_deref(), Some("The specified container does not exist."));
    }

    #[test]
    fn test_ms_date_format() {
        let date = ms_date();
        assert!(date.ends_with(" GMT"));
        assert_eq!(date.len(), "Fri, 01 Mar 2024 12:00:00 GMT".len());
    }
}
