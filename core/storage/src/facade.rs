//! The storage facade: the operations the rest of the application uses.

use bytes::Bytes;
use std::sync::Arc;
use tracing::{debug, warn};

use azkeep_common::{Entity, Result};

use crate::azure::AzureConfig;
use crate::backend::{Query, QueryPage};
use crate::config::CredentialSource;
use crate::handle::{AzureHandleProvider, BlobHandleProvider, MemoryHandleProvider, TableHandleProvider};
use crate::memory::MemoryStorage;
use crate::provisioner::ResourceProvisioner;

/// Content type for uploads that are valid UTF-8.
pub const TEXT_CONTENT_TYPE: &str = "text/plain;charset=utf-8";
/// Content type for all other uploads.
pub const BINARY_CONTENT_TYPE: &str = "application/octet-stream";

/// Table and blob operations with lazy provisioning.
///
/// Write-shaped operations (insert, update, delete, upload) provision their
/// table or container first; reads do not. Each operation makes exactly one
/// data request and never retries: failures reach the caller unmodified.
pub struct StorageFacade {
    tables: Arc<dyn TableHandleProvider>,
    blobs: Arc<dyn BlobHandleProvider>,
    provisioner: ResourceProvisioner,
}

impl StorageFacade {
    pub fn new(tables: Arc<dyn TableHandleProvider>, blobs: Arc<dyn BlobHandleProvider>) -> Self {
        let provisioner = ResourceProvisioner::new(tables.clone(), blobs.clone());
        Self {
            tables,
            blobs,
            provisioner,
        }
    }

    /// Facade over Azure Storage.
    pub fn azure(source: CredentialSource, config: AzureConfig) -> Result<Self> {
        let provider = Arc::new(AzureHandleProvider::new(source, config)?);
        Ok(Self::new(provider.clone(), provider))
    }

    /// Facade over an in-memory service.
    pub fn memory(source: CredentialSource, storage: Arc<MemoryStorage>) -> Self {
        let provider = Arc::new(MemoryHandleProvider::new(source, storage));
        Self::new(provider.clone(), provider)
    }

    /// Fetch one page of entities matching `query`.
    ///
    /// The table is assumed to exist; querying a missing table fails with
    /// the service's not-found error.
    pub async fn get_table_rows(&self, table: &str, query: &Query) -> Result<Vec<Entity>> {
        self.get_table_page(table, query)
            .await
            .map(|page| page.entities)
    }

    /// Like [`StorageFacade::get_table_rows`], keeping the continuation token.
    pub async fn get_table_page(&self, table: &str, query: &Query) -> Result<QueryPage> {
        debug!("query {} filter={:?}", table, query.filter);
        let result = async {
            let handle = self.tables.table_handle()?;
            handle.query_entities(table, query).await
        }
        .await;
        logged("query", table, result)
    }

    /// Insert a new entity, creating the table if needed.
    ///
    /// # Returns
    /// The service's status code for the insert.
    ///
    /// # Errors
    /// - An entity with the same key pair exists
    /// - Provisioning failed
    pub async fn insert_entity(&self, table: &str, entity: &Entity) -> Result<u16> {
        debug!("insert {}({}, {})", table, entity.partition_key(), entity.row_key());
        let result = async {
            let handle = self.provisioner.ensure_table(table).await?;
            handle.insert_entity(table, entity).await
        }
        .await;
        logged("insert", table, result)
    }

    /// Insert the entity, or merge it into an existing one with the same
    /// key pair. Properties not present in `entity` are left untouched.
    ///
    /// # Returns
    /// The service's status code for the merge.
    pub async fn update_entity(&self, table: &str, entity: &Entity) -> Result<u16> {
        debug!("upsert {}({}, {})", table, entity.partition_key(), entity.row_key());
        let result = async {
            let handle = self.provisioner.ensure_table(table).await?;
            handle.insert_or_merge_entity(table, entity).await
        }
        .await;
        logged("upsert", table, result)
    }

    /// Delete the entity with `entity`'s key pair.
    ///
    /// Only success or failure is reported; fetch the entity first if its
    /// last state matters.
    ///
    /// # Errors
    /// - Entity not found
    /// - Provisioning failed
    pub async fn delete_entity(&self, table: &str, entity: &Entity) -> Result<()> {
        debug!("delete {}({}, {})", table, entity.partition_key(), entity.row_key());
        let result = async {
            let handle = self.provisioner.ensure_table(table).await?;
            handle
                .delete_entity(table, entity.partition_key(), entity.row_key())
                .await
        }
        .await;
        logged("delete", table, result).map(|_| ())
    }

    /// Upload a blob, creating the container (publicly readable per blob)
    /// if needed.
    ///
    /// Content type is text for valid UTF-8 and binary otherwise.
    pub async fn upload_blob(
        &self,
        container: &str,
        name: &str,
        data: impl Into<Bytes>,
    ) -> Result<u16> {
        let data = data.into();
        let content_type = if std::str::from_utf8(&data).is_ok() {
            TEXT_CONTENT_TYPE
        } else {
            BINARY_CONTENT_TYPE
        };
        self.upload_blob_with_type(container, name, data, content_type)
            .await
    }

    /// Upload a blob with an explicit content type.
    pub async fn upload_blob_with_type(
        &self,
        container: &str,
        name: &str,
        data: impl Into<Bytes>,
        content_type: &str,
    ) -> Result<u16> {
        let data = data.into();
        debug!("upload {}/{} ({} bytes)", container, name, data.len());
        let result = async {
            let handle = self.provisioner.ensure_container(container).await?;
            handle
                .put_block_blob(container, name, data, content_type)
                .await
        }
        .await;
        logged("upload", container, result)
    }

    /// Read a blob with the configured credentials.
    pub async fn download_blob(&self, container: &str, name: &str) -> Result<Bytes> {
        debug!("download {}/{}", container, name);
        let result = async {
            let handle = self.blobs.blob_handle()?;
            handle.get_blob(container, name).await
        }
        .await;
        logged("download", container, result)
    }

    /// Read a blob anonymously, the way any client of a public container
    /// would. Fails for private containers.
    pub async fn download_public_blob(&self, container: &str, name: &str) -> Result<Bytes> {
        debug!("download {}/{} (anonymous)", container, name);
        let result = async {
            let handle = self.blobs.blob_handle()?;
            handle.get_public_blob(container, name).await
        }
        .await;
        logged("public download", container, result)
    }
}

fn logged<T>(operation: &str, resource: &str, result: Result<T>) -> Result<T> {
    if let Err(e) = &result {
        warn!("{} on {} failed: {}", operation, resource, e);
    }
    result
}
