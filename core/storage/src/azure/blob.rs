//! Azure Blob service client.

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::header::{CONTENT_LENGTH, CONTENT_TYPE};
use reqwest::{Client, Method, Request, RequestBuilder, Response, StatusCode};
use tracing::debug;
use url::Url;

use azkeep_common::{Error, Result};

use super::auth::SharedKey;
use super::{error_from_response, ms_date, network_error, resource_url};
use crate::backend::{BlobBackend, PublicAccess};
use crate::config::Credentials;

/// Blob service API version.
const BLOB_API_VERSION: &str = "2020-12-06";

/// Azure Blob service client bound to one account.
pub struct AzureBlobClient {
    http: Client,
    signer: SharedKey,
    base: Url,
}

impl AzureBlobClient {
    /// Create a client. No I/O happens until the first request.
    ///
    /// # Errors
    /// - Access key is not valid base64
    pub fn new(http: Client, credentials: &Credentials, base: Url) -> Result<Self> {
        Ok(Self {
            http,
            signer: SharedKey::new(credentials)?,
            base,
        })
    }

    /// Container URL.
    fn container_url(&self, container: &str) -> Result<Url> {
        resource_url(&self.base, [container])
    }

    /// Address of a blob. `/` in the name separates virtual directories.
    pub fn blob_url(&self, container: &str, name: &str) -> Result<Url> {
        resource_url(&self.base, std::iter::once(container).chain(name.split('/')))
    }

    fn request(&self, method: Method, url: Url) -> RequestBuilder {
        self.http
            .request(method, url)
            .header("x-ms-date", ms_date())
            .header("x-ms-version", BLOB_API_VERSION)
    }

    /// Sign and send a request.
    async fn send(&self, builder: RequestBuilder, context: &str) -> Result<Response> {
        let mut request = builder
            .build()
            .map_err(|e| Error::InvalidInput(format!("{}: {}", context, e)))?;
        self.signer.authorize_blob(&mut request)?;

        debug!("{} {}", request.method(), request.url());

        self.http
            .execute(request)
            .await
            .map_err(|e| network_error(context, e))
    }

    /// Unsigned GET for a blob in a publicly readable container.
    fn public_request(&self, container: &str, name: &str) -> Result<Request> {
        let url = self.blob_url(container, name)?;
        self.http
            .get(url)
            .header("x-ms-version", BLOB_API_VERSION)
            .build()
            .map_err(|e| Error::InvalidInput(format!("Failed to fetch blob: {}", e)))
    }
}

async fn read_body(response: Response) -> Result<Bytes> {
    if !response.status().is_success() {
        return Err(error_from_response(response).await);
    }
    response
        .bytes()
        .await
        .map_err(|e| Error::Network(format!("Failed to read blob content: {}", e)))
}

#[async_trait]
impl BlobBackend for AzureBlobClient {
    async fn create_container_if_not_exists(
        &self,
        container: &str,
        access: PublicAccess,
    ) -> Result<bool> {
        let mut url = self.container_url(container)?;
        url.query_pairs_mut().append_pair("restype", "container");

        let mut builder = self
            .request(Method::PUT, url)
            .header(CONTENT_LENGTH, "0");
        if let Some(level) = access.header_value() {
            builder = builder.header("x-ms-blob-public-access", level);
        }

        let response = self.send(builder, "Failed to create container").await?;

        let status = response.status();
        if status.is_success() {
            return Ok(true);
        }

        let err = error_from_response(response).await;
        if status == StatusCode::CONFLICT && err.code() == Some("ContainerAlreadyExists") {
            return Ok(false);
        }
        Err(err)
    }

    async fn put_block_blob(
        &self,
        container: &str,
        name: &str,
        data: Bytes,
        content_type: &str,
    ) -> Result<u16> {
        let url = self.blob_url(container, name)?;

        let response = self
            .send(
                self.request(Method::PUT, url)
                    .header("x-ms-blob-type", "BlockBlob")
                    .header(CONTENT_TYPE, content_type)
                    .header(CONTENT_LENGTH, data.len().to_string())
                    .body(data),
                "Failed to upload blob",
            )
            .await?;

        if response.status().is_success() {
            Ok(response.status().as_u16())
        } else {
            Err(error_from_response(response).await)
        }
    }

    async fn get_blob(&self, container: &str, name: &str) -> Result<Bytes> {
        let url = self.blob_url(container, name)?;
        let response = self
            .send(self.request(Method::GET, url), "Failed to download blob")
            .await?;

        read_body(response).await
    }

    async fn get_public_blob(&self, container: &str, name: &str) -> Result<Bytes> {
        let request = self.public_request(container, name)?;
        debug!("GET {} (anonymous)", request.url());

        let response = self
            .http
            .execute(request)
            .await
            .map_err(|e| network_error("Failed to fetch blob", e))?;

        read_body(response).await
    }
}
