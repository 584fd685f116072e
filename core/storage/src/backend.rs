//! Backend trait definitions.

use async_trait::async_trait;
use bytes::Bytes;

use azkeep_common::{Entity, Result};

/// Continuation state returned by a query page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContinuationToken {
    pub next_partition_key: String,
    pub next_row_key: Option<String>,
}

/// A table query: filter, projection, page size and continuation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Query {
    /// OData `$filter` expression.
    pub filter: Option<String>,
    /// Properties to return (`$select`). Keys are always returned.
    pub select: Vec<String>,
    /// Maximum entities in the page (`$top`).
    pub top: Option<u32>,
    /// Where to resume a previous query.
    pub continuation: Option<ContinuationToken>,
}

impl Query {
    /// Query matching every entity in the table.
    pub fn all() -> Self {
        Self::default()
    }

    /// Query with a filter expression.
    pub fn filter(expr: impl Into<String>) -> Self {
        Self {
            filter: Some(expr.into()),
            ..Self::default()
        }
    }

    /// Query addressing a single entity by key pair.
    pub fn by_key(partition_key: &str, row_key: &str) -> Self {
        Self::filter(
            crate::filter::Filter::eq("PartitionKey", partition_key)
                .and(crate::filter::Filter::eq("RowKey", row_key))
                .to_string(),
        )
    }

    pub fn select<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.select = columns.into_iter().map(Into::into).collect();
        self
    }

    pub fn top(mut self, n: u32) -> Self {
        self.top = Some(n);
        self
    }

    pub fn resume(mut self, token: ContinuationToken) -> Self {
        self.continuation = Some(token);
        self
    }
}

/// One page of query results.
#[derive(Debug, Clone, Default)]
pub struct QueryPage {
    pub entities: Vec<Entity>,
    pub continuation: Option<ContinuationToken>,
}

/// Anonymous read access granted on a container.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublicAccess {
    /// Authenticated access only.
    Private,
    /// Anyone holding a blob's address can read it.
    Blob,
    /// Anyone can read blobs and list the container.
    Container,
}

impl PublicAccess {
    /// Value of the `x-ms-blob-public-access` header, if one is sent.
    pub fn header_value(self) -> Option<&'static str> {
        match self {
            PublicAccess::Private => None,
            PublicAccess::Blob => Some("blob"),
            PublicAccess::Container => Some("container"),
        }
    }
}

/// Table storage operations.
///
/// Each method issues exactly one request to the service. Write methods
/// return the HTTP status the service answered with.
#[async_trait]
pub trait TableBackend: Send + Sync {
    /// Create the table unless it already exists.
    ///
    /// # Returns
    /// `true` if this call created the table, `false` if it already existed.
    async fn create_table_if_not_exists(&self, table: &str) -> Result<bool>;

    /// Fetch a single page of entities matching the query.
    ///
    /// # Errors
    /// - Table not found
    /// - Malformed filter
    async fn query_entities(&self, table: &str, query: &Query) -> Result<QueryPage>;

    /// Insert a new entity.
    ///
    /// # Errors
    /// - An entity with the same key pair exists
    async fn insert_entity(&self, table: &str, entity: &Entity) -> Result<u16>;

    /// Insert the entity, or merge its properties into the existing one.
    async fn insert_or_merge_entity(&self, table: &str, entity: &Entity) -> Result<u16>;

    /// Delete the entity with the given key pair, regardless of ETag.
    ///
    /// # Errors
    /// - Entity not found
    async fn delete_entity(&self, table: &str, partition_key: &str, row_key: &str)
        -> Result<u16>;
}

/// Blob storage operations.
#[async_trait]
pub trait BlobBackend: Send + Sync {
    /// Create the container unless it already exists.
    ///
    /// `access` only applies when the container is created.
    async fn create_container_if_not_exists(
        &self,
        container: &str,
        access: PublicAccess,
    ) -> Result<bool>;

    /// Write a block blob, replacing any existing blob of the same name.
    async fn put_block_blob(
        &self,
        container: &str,
        name: &str,
        data: Bytes,
        content_type: &str,
    ) -> Result<u16>;

    /// Read a blob's content.
    async fn get_blob(&self, container: &str, name: &str) -> Result<Bytes>;

    /// Read a blob anonymously, without credentials.
    ///
    /// # Errors
    /// - Blob not found, or its container does not allow public reads
    async fn get_public_blob(&self, container: &str, name: &str) -> Result<Bytes>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_by_key_quotes_values() {
        let query = Query::by_key("o'brien", "7");
        assert_eq!(
            query.filter.as_deref(),
            Some("(PartitionKey eq 'o''brien') and (RowKey eq '7')")
        );
    }

    #[test]
    fn test_private_access_sends_no_header() {
        assert_eq!(PublicAccess::Private.header_value(), None);
        assert_eq!(PublicAccess::Blob.header_value(), Some("blob"));
    }
}
