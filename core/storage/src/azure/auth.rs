//! Shared Key request signing.
//!
//! Each request is signed with HMAC-SHA256 over a canonical string built
//! from its method, selected headers and resource path, keyed with the
//! base64-decoded account key.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use hmac::{Hmac, Mac};
use reqwest::header::{HeaderValue, AUTHORIZATION};
use reqwest::Request;
use sha2::Sha256;
use std::collections::BTreeMap;
use zeroize::Zeroizing;

use azkeep_common::{Error, Result};

use crate::config::Credentials;

type HmacSha256 = Hmac<Sha256>;

/// Standard headers covered by a blob service signature, in order.
const BLOB_SIGNED_HEADERS: [&str; 11] = [
    "content-encoding",
    "content-language",
    "content-length",
    "content-md5",
    "content-type",
    "date",
    "if-modified-since",
    "if-match",
    "if-none-match",
    "if-unmodified-since",
    "range",
];

/// Shared Key signer bound to one account.
pub struct SharedKey {
    account: String,
    key: Zeroizing<Vec<u8>>,
}

impl SharedKey {
    /// Create a signer from resolved credentials.
    ///
    /// # Errors
    /// - `Configuration` if the access key is not valid base64
    pub fn new(credentials: &Credentials) -> Result<Self> {
        let key = STANDARD
            .decode(credentials.access_key.expose())
            .map_err(|_| Error::Configuration("Storage access key is not valid base64".to_string()))?;

        Ok(Self {
            account: credentials.account.clone(),
            key: Zeroizing::new(key),
        })
    }

    /// Base64 HMAC-SHA256 of `string_to_sign`.
    pub fn sign(&self, string_to_sign: &str) -> Result<String> {
        let mut mac = HmacSha256::new_from_slice(&self.key)
            .map_err(|e| Error::Configuration(format!("Unusable access key: {}", e)))?;
        mac.update(string_to_sign.as_bytes());
        Ok(STANDARD.encode(mac.finalize().into_bytes()))
    }

    /// Sign a blob service request in place.
    pub fn authorize_blob(&self, request: &mut Request) -> Result<()> {
        let string_to_sign = self.blob_string_to_sign(request);
        self.attach(request, &string_to_sign)
    }

    /// Sign a table service request in place.
    pub fn authorize_table(&self, request: &mut Request) -> Result<()> {
        let string_to_sign = self.table_string_to_sign(request);
        self.attach(request, &string_to_sign)
    }

    fn attach(&self, request: &mut Request, string_to_sign: &str) -> Result<()> {
        let signature = self.sign(string_to_sign)?;
        let value = HeaderValue::from_str(&format!("SharedKey {}:{}", self.account, signature))
            .map_err(|e| Error::InvalidInput(format!("Invalid authorization header: {}", e)))?;
        request.headers_mut().insert(AUTHORIZATION, value);
        Ok(())
    }

    fn blob_string_to_sign(&self, request: &Request) -> String {
        let mut out = String::new();
        out.push_str(request.method().as_str());
        out.push('\n');

        for name in BLOB_SIGNED_HEADERS {
            let value = header_str(request, name);
            // A zero length is signed as empty.
            if !(name == "content-length" && value == "0") {
                out.push_str(value);
            }
            out.push('\n');
        }

        out.push_str(&canonicalized_headers(request));
        out.push_str(&format!("/{}{}", self.account, request.url().path()));

        let mut params: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for (name, value) in request.url().query_pairs() {
            params
                .entry(name.to_lowercase())
                .or_default()
                .push(value.into_owned());
        }
        for (name, mut values) in params {
            values.sort();
            out.push_str(&format!("\n{}:{}", name, values.join(",")));
        }

        out
    }

    fn table_string_to_sign(&self, request: &Request) -> String {
        let mut resource = format!("/{}{}", self.account, request.url().path());
        if let Some((_, comp)) = request.url().query_pairs().find(|(name, _)| name == "comp") {
            resource.push_str(&format!("?comp={}", comp));
        }

        format!(
            "{}\n{}\n{}\n{}\n{}",
            request.method().as_str(),
            header_str(request, "content-md5"),
            header_str(request, "content-type"),
            header_str(request, "x-ms-date"),
            resource
        )
    }
}

fn header_str<'a>(request: &'a Request, name: &str) -> &'a str {
    request
        .headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
}

/// `x-ms-*` headers as sorted `name:value\n` lines.
fn canonicalized_headers(request: &Request) -> String {
    let mut headers: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
    for (name, value) in request.headers() {
        if name.as_str().starts_with("x-ms-") {
            if let Ok(value) = value.to_str() {
                headers.entry(name.as_str()).or_default().push(value.trim());
            }
        }
    }

    headers
        .into_iter()
        .map(|(name, values)| format!("{}:{}\n", name, values.join(",")))
        .collect()
}
