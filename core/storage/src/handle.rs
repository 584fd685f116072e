//! Handle providers.
//!
//! A provider turns the current credential values into a ready-to-use
//! client. Credentials are re-resolved on every call and construction does
//! no network I/O.

use reqwest::Client;
use std::sync::Arc;

use azkeep_common::{Error, Result};

use crate::azure::{AzureBlobClient, AzureConfig, AzureTableClient};
use crate::backend::{BlobBackend, TableBackend};
use crate::config::CredentialSource;
use crate::memory::MemoryStorage;

/// Produces table handles.
pub trait TableHandleProvider: Send + Sync {
    /// Construct a table client from the current credentials.
    ///
    /// # Errors
    /// - `Configuration` if credentials cannot be resolved
    fn table_handle(&self) -> Result<Arc<dyn TableBackend>>;
}

/// Produces blob handles.
pub trait BlobHandleProvider: Send + Sync {
    /// Construct a blob client from the current credentials.
    ///
    /// # Errors
    /// - `Configuration` if credentials cannot be resolved
    fn blob_handle(&self) -> Result<Arc<dyn BlobBackend>>;
}

/// Handle provider for the Azure Storage REST services.
pub struct AzureHandleProvider {
    source: CredentialSource,
    config: AzureConfig,
    http: Client,
}

impl AzureHandleProvider {
    /// Create a provider.
    ///
    /// The HTTP connection pool is shared across handles; credentials are not.
    pub fn new(source: CredentialSource, config: AzureConfig) -> Result<Self> {
        let http = Client::builder()
            .user_agent(concat!("azkeep/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| Error::Configuration(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            source,
            config,
            http,
        })
    }
}

impl TableHandleProvider for AzureHandleProvider {
    fn table_handle(&self) -> Result<Arc<dyn TableBackend>> {
        let credentials = self.source.credentials()?;
        let base = self.config.table_url(&credentials.account)?;
        Ok(Arc::new(AzureTableClient::new(
            self.http.clone(),
            &credentials,
            base,
        )?))
    }
}

impl BlobHandleProvider for AzureHandleProvider {
    fn blob_handle(&self) -> Result<Arc<dyn BlobBackend>> {
        let credentials = self.source.credentials()?;
        let base = self.config.blob_url(&credentials.account)?;
        Ok(Arc::new(AzureBlobClient::new(
            self.http.clone(),
            &credentials,
            base,
        )?))
    }
}

/// Handle provider onto an in-memory service.
pub struct MemoryHandleProvider {
    source: CredentialSource,
    storage: Arc<MemoryStorage>,
}

impl MemoryHandleProvider {
    pub fn new(source: CredentialSource, storage: Arc<MemoryStorage>) -> Self {
        Self { source, storage }
    }
}

impl TableHandleProvider for MemoryHandleProvider {
    fn table_handle(&self) -> Result<Arc<dyn TableBackend>> {
        let credentials = self.source.credentials()?;
        Ok(Arc::new(self.storage.handle(credentials)))
    }
}

impl BlobHandleProvider for MemoryHandleProvider {
    fn blob_handle(&self) -> Result<Arc<dyn BlobBackend>> {
        let credentials = self.source.credentials()?;
        Ok(Arc::new(self.storage.handle(credentials)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DeploymentConfig, ACCESS_KEY_ENV, ACCOUNT_ENV};

    #[test]
    fn test_azure_handles_construct_without_io() {
        let source = CredentialSource::from_vars(
            [(ACCOUNT_ENV, "acct"), (ACCESS_KEY_ENV, "a2V5")],
            DeploymentConfig::default(),
        );
        let provider = AzureHandleProvider::new(source, AzureConfig::default()).unwrap();

        assert!(provider.table_handle().is_ok());
        assert!(provider.blob_handle().is_ok());
    }

    #[test]
    fn test_missing_credentials_fail_handle_construction() {
        let source = CredentialSource::from_vars(Vec::<(String, String)>::new(), DeploymentConfig::default());
        let provider = AzureHandleProvider::new(source, AzureConfig::default()).unwrap();

        assert!(matches!(provider.table_handle(), Err(Error::Configuration(_))));
        assert!(matches!(provider.blob_handle(), Err(Error::Configuration(_))));
    }

    #[tokio::test]
    async fn test_memory_handles_share_storage() {
        let storage = Arc::new(MemoryStorage::new("acct", "a2V5"));
        let provider = MemoryHandleProvider::new(
            CredentialSource::from_vars(
                Vec::<(String, String)>::new(),
                DeploymentConfig::with_credentials("acct", "a2V5"),
            ),
            storage.clone(),
        );

        provider
            .table_handle()
            .unwrap()
            .create_table_if_not_exists("shared")
            .await
            .unwrap();
        let created_again = provider
            .table_handle()
            .unwrap()
            .create_table_if_not_exists("shared")
            .await
            .unwrap();

        assert!(!created_again);
        assert_eq!(storage.table_names().await, vec!["shared".to_string()]);
    }
}
