//! In-memory storage backend for testing.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

use azkeep_common::{Entity, Error, Result};

use crate::backend::{BlobBackend, ContinuationToken, PublicAccess, Query, QueryPage, TableBackend};
use crate::config::Credentials;
use crate::filter::Filter;

type Table = BTreeMap<(String, String), Entity>;

#[derive(Debug, Clone)]
struct StoredBlob {
    data: Bytes,
    content_type: String,
}

#[derive(Debug)]
struct Container {
    access: PublicAccess,
    blobs: HashMap<String, StoredBlob>,
}

/// In-memory table and blob service.
///
/// Mirrors the status codes and error codes of the hosted service closely
/// enough for the facade's contract to be exercised without a network. All
/// data is lost on drop.
pub struct MemoryStorage {
    account: String,
    access_key: String,
    tables: RwLock<HashMap<String, Table>>,
    containers: RwLock<HashMap<String, Container>>,
}

impl MemoryStorage {
    /// Create an empty service that accepts the given account and key.
    pub fn new(account: impl Into<String>, access_key: impl Into<String>) -> Self {
        Self {
            account: account.into(),
            access_key: access_key.into(),
            tables: RwLock::new(HashMap::new()),
            containers: RwLock::new(HashMap::new()),
        }
    }

    /// Bind a handle to the given credentials.
    ///
    /// Credentials are checked per request, not here.
    pub fn handle(self: &Arc<Self>, credentials: Credentials) -> MemoryHandle {
        MemoryHandle {
            storage: Arc::clone(self),
            credentials,
        }
    }

    /// Names of all existing tables, sorted.
    pub async fn table_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tables.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    /// Public access level of a container, if it exists.
    pub async fn container_access(&self, container: &str) -> Option<PublicAccess> {
        self.containers.read().await.get(container).map(|c| c.access)
    }

    /// Read a blob without credentials.
    ///
    /// Succeeds only when the container grants anonymous read access.
    pub async fn read_public_blob(&self, container: &str, name: &str) -> Result<Bytes> {
        let containers = self.containers.read().await;
        let not_found = || Error::backend(404, "ResourceNotFound", "The specified resource does not exist.");

        let container = containers.get(container).ok_or_else(not_found)?;
        if container.access == PublicAccess::Private {
            return Err(not_found());
        }
        container
            .blobs
            .get(name)
            .map(|blob| blob.data.clone())
            .ok_or_else(not_found)
    }

    /// Content type a blob was stored with.
    pub async fn blob_content_type(&self, container: &str, name: &str) -> Option<String> {
        self.containers
            .read()
            .await
            .get(container)
            .and_then(|c| c.blobs.get(name))
            .map(|blob| blob.content_type.clone())
    }
}

fn table_not_found() -> Error {
    Error::backend(404, "TableNotFound", "The table specified does not exist.")
}

fn container_not_found() -> Error {
    Error::backend(404, "ContainerNotFound", "The specified container does not exist.")
}

fn stamp(entity: &mut Entity) {
    entity.set_system_properties(Utc::now(), format!("W/\"{}\"", Uuid::new_v4()));
}

/// A handle onto a [`MemoryStorage`], bound to one credential pair.
#[derive(Clone)]
pub struct MemoryHandle {
    storage: Arc<MemoryStorage>,
    credentials: Credentials,
}

impl MemoryHandle {
    fn authorize(&self) -> Result<()> {
        let creds = &self.credentials;
        if creds.account != self.storage.account || creds.access_key.expose() != self.storage.access_key {
            return Err(Error::backend(
                403,
                "AuthenticationFailed",
                "Server failed to authenticate the request.",
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl TableBackend for MemoryHandle {
    async fn create_table_if_not_exists(&self, table: &str) -> Result<bool> {
        self.authorize()?;
        let mut tables = self.storage.tables.write().await;
        if tables.contains_key(table) {
            return Ok(false);
        }
        debug!("memory: created table {}", table);
        tables.insert(table.to_string(), Table::new());
        Ok(true)
    }

    async fn query_entities(&self, table: &str, query: &Query) -> Result<QueryPage> {
        self.authorize()?;

        let filter = query
            .filter
            .as_deref()
            .map(Filter::parse)
            .transpose()
            .map_err(|e| Error::backend(400, "InvalidInput", e.to_string()))?;

        let tables = self.storage.tables.read().await;
        let rows = tables.get(table).ok_or_else(table_not_found)?;

        let start = query
            .continuation
            .as_ref()
            .map(|token| {
                (
                    token.next_partition_key.clone(),
                    token.next_row_key.clone().unwrap_or_default(),
                )
            })
            .unwrap_or_default();

        let limit = query.top.map(|n| n as usize).unwrap_or(usize::MAX);
        let mut matching = rows
            .range(start..)
            .filter(|(_, entity)| filter.as_ref().map_or(true, |f| f.matches(entity)));

        let mut entities = Vec::new();
        for (_, entity) in matching.by_ref().take(limit) {
            let mut entity = entity.clone();
            if !query.select.is_empty() {
                entity.project(&query.select);
            }
            entities.push(entity);
        }

        let continuation = matching.next().map(|((pk, rk), _)| ContinuationToken {
            next_partition_key: pk.clone(),
            next_row_key: Some(rk.clone()),
        });

        Ok(QueryPage {
            entities,
            continuation,
        })
    }

    async fn insert_entity(&self, table: &str, entity: &Entity) -> Result<u16> {
        self.authorize()?;
        let mut tables = self.storage.tables.write().await;
        let rows = tables.get_mut(table).ok_or_else(table_not_found)?;

        let key = (entity.partition_key().to_string(), entity.row_key().to_string());
        if rows.contains_key(&key) {
            return Err(Error::backend(
                409,
                "EntityAlreadyExists",
                "The specified entity already exists.",
            ));
        }

        let mut stored = entity.clone();
        stamp(&mut stored);
        rows.insert(key, stored);
        Ok(204)
    }

    async fn insert_or_merge_entity(&self, table: &str, entity: &Entity) -> Result<u16> {
        self.authorize()?;
        let mut tables = self.storage.tables.write().await;
        let rows = tables.get_mut(table).ok_or_else(table_not_found)?;

        let key = (entity.partition_key().to_string(), entity.row_key().to_string());
        let stored = rows
            .entry(key)
            .or_insert_with(|| Entity::new(entity.partition_key(), entity.row_key()));
        stored.merge_from(entity);
        stamp(stored);
        Ok(204)
    }

    async fn delete_entity(&self, table: &str, partition_key: &str, row_key: &str) -> Result<u16> {
        self.authorize()?;
        let mut tables = self.storage.tables.write().await;
        let rows = tables.get_mut(table).ok_or_else(table_not_found)?;

        match rows.remove(&(partition_key.to_string(), row_key.to_string())) {
            Some(_) => Ok(204),
            None => Err(Error::backend(
                404,
                "ResourceNotFound",
                "The specified resource does not exist.",
            )),
        }
    }
}

#[async_trait]
impl BlobBackend for MemoryHandle {
    async fn create_container_if_not_exists(
        &self,
        container: &str,
        access: PublicAccess,
    ) -> Result<bool> {
        self.authorize()?;
        let mut containers = self.storage.containers.write().await;
        if containers.contains_key(container) {
            return Ok(false);
        }
        debug!("memory: created container {} ({:?})", container, access);
        containers.insert(
            container.to_string(),
            Container {
                access,
                blobs: HashMap::new(),
            },
        );
        Ok(true)
    }

    async fn put_block_blob(
        &self,
        container: &str,
        name: &str,
        data: Bytes,
        content_type: &str,
    ) -> Result<u16> {
        self.authorize()?;
        let mut containers = self.storage.containers.write().await;
        let container = containers.get_mut(container).ok_or_else(container_not_found)?;
        container.blobs.insert(
            name.to_string(),
            StoredBlob {
                data,
                content_type: content_type.to_string(),
            },
        );
        Ok(201)
    }

    async fn get_blob(&self, container: &str, name: &str) -> Result<Bytes> {
        self.authorize()?;
        let containers = self.storage.containers.read().await;
        let container = containers.get(container).ok_or_else(container_not_found)?;
        container
            .blobs
            .get(name)
            .map(|blob| blob.data.clone())
            .ok_or_else(|| Error::backend(404, "BlobNotFound", "The specified blob does not exist."))
    }

    async fn get_public_blob(&self, container: &str, name: &str) -> Result<Bytes> {
        self.storage.read_public_blob(container, name).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle() -> (Arc<MemoryStorage>, MemoryHandle) {
        let storage = Arc::new(MemoryStorage::new("devaccount", "a2V5"));
        let handle = storage.handle(Credentials::new("devaccount", "a2V5"));
        (storage, handle)
    }

    #[tokio::test]
    async fn test_create_table_reports_existing() {
        let (storage, handle) = handle();
        assert!(handle.create_table_if_not_exists("builds").await.unwrap());
        assert!(!handle.create_table_if_not_exists("builds").await.unwrap());
        assert_eq!(storage.table_names().await, vec!["builds".to_string()]);
    }

    #[tokio::test]
    async fn test_wrong_key_is_rejected() {
        let (storage, _) = handle();
        let intruder = storage.handle(Credentials::new("devaccount", "d3Jvbmc="));

        let err = intruder.create_table_if_not_exists("builds").await.unwrap_err();
        assert_eq!(err.status(), Some(403));
        assert_eq!(err.code(), Some("AuthenticationFailed"));
    }

    #[tokio::test]
    async fn test_query_pages_with_continuation() {
        let (_, handle) = handle();
        handle.create_table_if_not_exists("runs").await.unwrap();
        for i in 0..5 {
            let entity = Entity::new("site", format!("{:02}", i));
            handle.insert_entity("runs", &entity).await.unwrap();
        }

        let first = handle.query_entities("runs", &Query::all().top(2)).await.unwrap();
        assert_eq!(first.entities.len(), 2);
        let token = first.continuation.clone().unwrap();
        assert_eq!(token.next_row_key.as_deref(), Some("02"));

        let second = handle
            .query_entities("runs", &Query::all().top(10).resume(token))
            .await
            .unwrap();
        let keys: Vec<&str> = second.entities.iter().map(|e| e.row_key()).collect();
        assert_eq!(keys, vec!["02", "03", "04"]);
        assert!(second.continuation.is_none());
    }

    #[tokio::test]
    async fn test_query_select_projects_payload() {
        let (_, handle) = handle();
        handle.create_table_if_not_exists("runs").await.unwrap();
        let entity = Entity::new("p", "r")
            .with("Keep", 1)
            .unwrap()
            .with("Drop", 2)
            .unwrap();
        handle.insert_entity("runs", &entity).await.unwrap();

        let page = handle
            .query_entities("runs", &Query::all().select(["Keep"]))
            .await
            .unwrap();
        let props: Vec<&String> = page.entities[0].properties().keys().collect();
        assert_eq!(props, vec!["Keep"]);
    }

    #[tokio::test]
    async fn test_invalid_filter_is_bad_request() {
        let (_, handle) = handle();
        handle.create_table_if_not_exists("runs").await.unwrap();

        let err = handle
            .query_entities("runs", &Query::filter("RowKey eq"))
            .await
            .unwrap_err();
        assert_eq!(err.status(), Some(400));
    }

    #[tokio::test]
    async fn test_insert_assigns_system_properties() {
        let (_, handle) = handle();
        handle.create_table_if_not_exists("runs").await.unwrap();
        handle.insert_entity("runs", &Entity::new("p", "r")).await.unwrap();

        let page = handle.query_entities("runs", &Query::by_key("p", "r")).await.unwrap();
        assert!(page.entities[0].timestamp().is_some());
        assert!(page.entities[0].etag().is_some());
    }

    #[tokio::test]
    async fn test_private_container_hides_blobs() {
        let (storage, handle) = handle();
        handle
            .create_container_if_not_exists("private", PublicAccess::Private)
            .await
            .unwrap();
        handle
            .put_block_blob("private", "b", Bytes::from_static(b"x"), "text/plain")
            .await
            .unwrap();

        assert_eq!(handle.get_blob("private", "b").await.unwrap(), Bytes::from_static(b"x"));
        let err = storage.read_public_blob("private", "b").await.unwrap_err();
        assert_eq!(err.status(), Some(404));
    }

    #[tokio::test]
    async fn test_public_read_ignores_credentials() {
        let (storage, handle) = handle();
        handle
            .create_container_if_not_exists("site", PublicAccess::Blob)
            .await
            .unwrap();
        handle
            .put_block_blob("site", "index.html", Bytes::from_static(b"<p>"), "text/html")
            .await
            .unwrap();

        let stranger = storage.handle(Credentials::new("elsewhere", "d3Jvbmc="));
        assert_eq!(
            stranger.get_public_blob("site", "index.html").await.unwrap(),
            Bytes::from_static(b"<p>")
        );
        assert_eq!(stranger.get_blob("site", "index.html").await.unwrap_err().status(), Some(403));
    }

    #[tokio::test]
    async fn test_put_into_missing_container_fails() {
        let (_, handle) = handle();
        let err = handle
            .put_block_blob("nowhere", "b", Bytes::new(), "text/plain")
            .await
            .unwrap_err();
        assert_eq!(err.code(), Some("ContainerNotFound"));
    }
}
