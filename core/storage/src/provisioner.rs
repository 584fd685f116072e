//! Lazy provisioning of tables and containers.

use std::sync::Arc;
use tracing::{debug, warn};

use azkeep_common::{Error, Result};

use crate::backend::{BlobBackend, PublicAccess, TableBackend};
use crate::handle::{BlobHandleProvider, TableHandleProvider};

/// Access level every provisioned container is created with.
pub const CONTAINER_ACCESS: PublicAccess = PublicAccess::Blob;

/// Guarantees a table or container exists before it is written to.
///
/// Nothing is remembered between calls: every call issues a
/// create-if-not-exists request. The service makes that idempotent, so
/// concurrent callers provisioning the same name all succeed.
pub struct ResourceProvisioner {
    tables: Arc<dyn TableHandleProvider>,
    blobs: Arc<dyn BlobHandleProvider>,
}

impl ResourceProvisioner {
    pub fn new(tables: Arc<dyn TableHandleProvider>, blobs: Arc<dyn BlobHandleProvider>) -> Self {
        Self { tables, blobs }
    }

    /// Create `table` if absent and return a handle to use with it.
    ///
    /// # Postconditions
    /// - `table` exists, whether this call or an earlier one created it
    /// - The returned handle uses the credentials resolved for this call
    ///
    /// # Errors
    /// - `Configuration` if no handle can be constructed
    /// - `Provisioning` wrapping the service's failure
    pub async fn ensure_table(&self, table: &str) -> Result<Arc<dyn TableBackend>> {
        let handle = self.tables.table_handle()?;

        match handle.create_table_if_not_exists(table).await {
            Ok(created) => {
                debug!("table {} ready (created: {})", table, created);
                Ok(handle)
            }
            Err(e) => {
                warn!("Failed to provision table {}: {}", table, e);
                Err(Error::Provisioning {
                    resource: table.to_string(),
                    source: Box::new(e),
                })
            }
        }
    }

    /// Create `container` with blob-level public read access if absent and
    /// return a handle to use with it.
    ///
    /// # Postconditions
    /// - `container` exists
    /// - A container created by this call allows anonymous blob reads; an
    ///   existing container keeps whatever access level it has
    ///
    /// # Errors
    /// - `Configuration` if no handle can be constructed
    /// - `Provisioning` wrapping the service's failure
    pub async fn ensure_container(&self, container: &str) -> Result<Arc<dyn BlobBackend>> {
        let handle = self.blobs.blob_handle()?;

        match handle
            .create_container_if_not_exists(container, CONTAINER_ACCESS)
            .await
        {
            Ok(created) => {
                debug!("container {} ready (created: {})", container, created);
                Ok(handle)
            }
            Err(e) => {
                warn!("Failed to provision container {}: {}", container, e);
                Err(Error::Provisioning {
                    resource: container.to_string(),
                    source: Box::new(e),
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CredentialSource, DeploymentConfig, ACCESS_KEY_ENV};
    use crate::handle::MemoryHandleProvider;
    use crate::memory::MemoryStorage;

    fn provisioner(source: CredentialSource) -> (Arc<MemoryStorage>, ResourceProvisioner) {
        let storage = Arc::new(MemoryStorage::new("acct", "a2V5"));
        let provider = Arc::new(MemoryHandleProvider::new(source, storage.clone()));
        (storage, ResourceProvisioner::new(provider.clone(), provider))
    }

    fn valid_source() -> CredentialSource {
        CredentialSource::from_vars(
            Vec::<(String, String)>::new(),
            DeploymentConfig::with_credentials("acct", "a2V5"),
        )
    }

    #[tokio::test]
    async fn test_ensure_table_is_idempotent() {
        let (storage, provisioner) = provisioner(valid_source());

        provisioner.ensure_table("builds").await.unwrap();
        provisioner.ensure_table("builds").await.unwrap();

        assert_eq!(storage.table_names().await, vec!["builds".to_string()]);
    }

    #[tokio::test]
    async fn test_ensure_container_sets_blob_access() {
        let (storage, provisioner) = provisioner(valid_source());

        provisioner.ensure_container("reports").await.unwrap();

        assert_eq!(
            storage.container_access("reports").await,
            Some(PublicAccess::Blob)
        );
    }

    #[tokio::test]
    async fn test_backend_failure_is_wrapped_unmodified() {
        let source = CredentialSource::from_vars(
            [(ACCESS_KEY_ENV, "d3Jvbmc=")],
            DeploymentConfig::with_credentials("acct", "a2V5"),
        );
        let (storage, provisioner) = provisioner(source);

        let err = provisioner.ensure_table("builds").await.err().unwrap();
        match &err {
            Error::Provisioning { resource, source } => {
                assert_eq!(resource, "builds");
                assert_eq!(source.status(), Some(403));
                assert_eq!(source.code(), Some("AuthenticationFailed"));
            }
            other => panic!("expected provisioning error, got {:?}", other),
        }
        assert!(storage.table_names().await.is_empty());
    }

    #[tokio::test]
    async fn test_missing_credentials_are_not_provisioning_errors() {
        let source = CredentialSource::from_vars(
            Vec::<(String, String)>::new(),
            DeploymentConfig::default(),
        );
        let (_, provisioner) = provisioner(source);

        let err = provisioner.ensure_container("reports").await.err().unwrap();
        assert!(matches!(err, Error::Configuration(_)));
    }
}
