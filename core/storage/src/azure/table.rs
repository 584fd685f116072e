//! Azure Table service client.

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, CONTENT_TYPE, IF_MATCH};
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::debug;
use url::Url;

use azkeep_common::{Entity, Error, Result};

use super::auth::SharedKey;
use super::{error_from_response, ms_date, network_error, resource_url};
use crate::backend::{ContinuationToken, Query, QueryPage, TableBackend};
use crate::config::Credentials;

/// Table service API version.
const TABLE_API_VERSION: &str = "2019-02-02";

const JSON_NO_METADATA: &str = "application/json;odata=nometadata";
const JSON_MINIMAL_METADATA: &str = "application/json;odata=minimalmetadata";

const NEXT_PARTITION_KEY_HEADER: &str = "x-ms-continuation-nextpartitionkey";
const NEXT_ROW_KEY_HEADER: &str = "x-ms-continuation-nextrowkey";

#[derive(Debug, Deserialize)]
struct QueryResponse {
    #[serde(default)]
    value: Vec<Map<String, Value>>,
}

/// Azure Table service client bound to one account.
///
/// Stateless apart from the connection pool; cheap to construct.
pub struct AzureTableClient {
    http: Client,
    signer: SharedKey,
    base: Url,
}

impl AzureTableClient {
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

    /// Path segment addressing one entity: `table(PartitionKey='..',RowKey='..')`.
    fn entity_segment(table: &str, partition_key: &str, row_key: &str) -> String {
        format!(
            "{}(PartitionKey='{}',RowKey='{}')",
            table,
            partition_key.replace('\'', "''"),
            row_key.replace('\'', "''")
        )
    }

    fn request(&self, method: Method, url: Url) -> RequestBuilder {
        self.http
            .request(method, url)
            .header("x-ms-date", ms_date())
            .header("x-ms-version", TABLE_API_VERSION)
            .header("DataServiceVersion", "3.0;NetFx")
            .header("MaxDataServiceVersion", "3.0;NetFx")
    }

    /// Sign and send a request.
    async fn send(&self, builder: RequestBuilder, context: &str) -> Result<Response> {
        let mut request = builder
            .build()
            .map_err(|e| Error::InvalidInput(format!("{}: {}", context, e)))?;
        self.signer.authorize_table(&mut request)?;

        debug!("{} {}", request.method(), request.url());

        self.http
            .execute(request)
            .await
            .map_err(|e| network_error(context, e))
    }

    fn json_body(entity: &Entity) -> Result<Vec<u8>> {
        serde_json::to_vec(&entity.to_json()).map_err(|e| Error::Serialization(e.to_string()))
    }

    fn continuation(headers: &HeaderMap) -> Option<ContinuationToken> {
        let get = |name: &str| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        };
        get(NEXT_PARTITION_KEY_HEADER).map(|next_partition_key| ContinuationToken {
            next_partition_key,
            next_row_key: get(NEXT_ROW_KEY_HEADER),
        })
    }

    fn query_params(query: &Query) -> Vec<(&'static str, String)> {
        let mut params = Vec::new();
        if let Some(filter) = &query.filter {
            params.push(("$filter", filter.clone()));
        }
        if !query.select.is_empty() {
            params.push(("$select", query.select.join(",")));
        }
        if let Some(top) = query.top {
            params.push(("$top", top.to_string()));
        }
        if let Some(token) = &query.continuation {
            params.push(("NextPartitionKey", token.next_partition_key.clone()));
            if let Some(row_key) = &token.next_row_key {
                params.push(("NextRowKey", row_key.clone()));
            }
        }
        params
    }
}

#[async_trait]
impl TableBackend for AzureTableClient {
    async fn create_table_if_not_exists(&self, table: &str) -> Result<bool> {
        let url = resource_url(&self.base, ["Tables"])?;
        let body = serde_json::to_vec(&serde_json::json!({ "TableName": table }))?;

        let response = self
            .send(
                self.request(Method::POST, url)
                    .header(CONTENT_TYPE, "application/json")
                    .header(ACCEPT, JSON_NO_METADATA)
                    .header("Prefer", "return-no-content")
                    .body(body),
                "Failed to create table",
            )
            .await?;

        let status = response.status();
        if status.is_success() {
            return Ok(true);
        }

        let err = error_from_response(response).await;
        if status == StatusCode::CONFLICT && err.code() == Some("TableAlreadyExists") {
            return Ok(false);
        }
        Err(err)
    }

    async fn query_entities(&self, table: &str, query: &Query) -> Result<QueryPage> {
        let url = resource_url(&self.base, [format!("{}()", table).as_str()])?;

        let response = self
            .send(
                self.request(Method::GET, url)
                    .header(ACCEPT, JSON_MINIMAL_METADATA)
                    .query(&Self::query_params(query)),
                "Failed to query entities",
            )
            .await?;

        if !response.status().is_success() {
            return Err(error_from_response(response).await);
        }

        let continuation = Self::continuation(response.headers());
        let body: QueryResponse = response
            .json()
            .await
            .map_err(|e| Error::Serialization(format!("Failed to parse query response: {}", e)))?;

        let entities = body
            .value
            .iter()
            .map(Entity::from_json)
            .collect::<Result<Vec<_>>>()?;

        Ok(QueryPage {
            entities,
            continuation,
        })
    }

    async fn insert_entity(&self, table: &str, entity: &Entity) -> Result<u16> {
        let url = resource_url(&self.base, [table])?;

        let response = self
            .send(
                self.request(Method::POST, url)
                    .header(CONTENT_TYPE, "application/json")
                    .header(ACCEPT, JSON_NO_METADATA)
                    .header("Prefer", "return-no-content")
                    .body(Self::json_body(entity)?),
                "Failed to insert entity",
            )
            .await?;

        if response.status().is_success() {
            Ok(response.status().as_u16())
        } else {
            Err(error_from_response(response).await)
        }
    }

    async fn insert_or_merge_entity(&self, table: &str, entity: &Entity) -> Result<u16> {
        let segment = Self::entity_segment(table, entity.partition_key(), entity.row_key());
        let url = resource_url(&self.base, [segment.as_str()])?;
        let merge = Method::from_bytes(b"MERGE")
            .map_err(|e| Error::InvalidInput(format!("Invalid method: {}", e)))?;

        // No If-Match header: the service inserts when the entity is absent.
        let response = self
            .send(
                self.request(merge, url)
                    .header(CONTENT_TYPE, "application/json")
                    .header(ACCEPT, JSON_NO_METADATA)
                    .body(Self::json_body(entity)?),
                "Failed to merge entity",
            )
            .await?;

        if response.status().is_success() {
            Ok(response.status().as_u16())
        } else {
            Err(error_from_response(response).await)
        }
    }

    async fn delete_entity(&self, table: &str, partition_key: &str, row_key: &str) -> Result<u16> {
        let segment = Self::entity_segment(table, partition_key, row_key);
        let url = resource_url(&self.base, [segment.as_str()])?;

        let response = self
            .send(
                self.request(Method::DELETE, url)
                    .header(ACCEPT, JSON_NO_METADATA)
                    .header(IF_MATCH, HeaderValue::from_static("*")),
                "Failed to delete entity",
            )
            .await?;

        if response.status().is_success() {
            Ok(response.status().as_u16())
        } else {
            Err(error_from_response(response).await)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entity_segment_escapes_quotes() {
        assert_eq!(
            AzureTableClient::entity_segment("people", "o'brien", "1"),
            "people(PartitionKey='o''brien',RowKey='1')"
        );
    }

    #[test]
    fn test_query_params() {
        let query = Query::filter("RowKey eq '1'")
            .select(["Name", "Score"])
            .top(10)
            .resume(ContinuationToken {
                next_partition_key: "1!8!c2l0ZQ--".to_string(),
                next_row_key: None,
            });

        let params = AzureTableClient::query_params(&query);
        assert_eq!(
            params,
            vec![
                ("$filter", "RowKey eq '1'".to_string()),
                ("$select", "Name,Score".to_string()),
                ("$top", "10".to_string()),
                ("NextPartitionKey", "1!8!c2l0ZQ--".to_string()),
            ]
        );
    }

    #[test]
    fn test_continuation_headers() {
        let mut headers = HeaderMap::new();
        assert!(AzureTableClient::continuation(&headers).is_none());

        headers.insert(NEXT_PARTITION_KEY_HEADER, HeaderValue::from_static("1!4!cA--"));
        headers.insert(NEXT_ROW_KEY_HEADER, HeaderValue::from_static("1!4!cg--"));
        let token = AzureTableClient::continuation(&headers).unwrap();
        assert_eq!(token.next_partition_key, "1!4!cA--");
        assert_eq!(token.next_row_key.as_deref(), Some("1!4!cg--"));
    }

    #[test]
    fn test_construction_does_no_io() {
        let client = AzureTableClient::new(
            Client::new(),
            &Credentials::new("acct", "a2V5"),
            Url::parse("https://acct.table.core.windows.net/").unwrap(),
        );
        assert!(client.is_ok());
    }
}
