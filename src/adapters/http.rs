//! HTTP Document Backend
//!
//! Implements the `DocumentBackend` port against a JSON/HTTP document store
//! gateway. Routes:
//!
//! ```text
//! GET    {base}/collections/{c}/documents/{id}     -> payload | 404
//! PUT    {base}/collections/{c}/documents/{id}     (set)
//! PATCH  {base}/collections/{c}/documents/{id}     (update)
//! DELETE {base}/collections/{c}/documents/{id}
//! POST   {base}/collections/{c}:query              -> {"documents": [{id, data}]}
//! POST   {base}/collections/{c}:count              -> {"count": n}
//! POST   {base}:commit                             {"writes": [...]}
//! ```

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::config::DEFAULT_MAX_BATCH_OPS;
use crate::domain::ports::{
    Document, DocumentBackend, Filters, OrderBy, Payload, QueryOptions, WriteOp,
};
use crate::error::{Error, Result};

/// Configuration for the HTTP backend
#[derive(Debug, Clone)]
pub struct HttpBackendConfig {
    /// Gateway base URL, without trailing slash
    pub base_url: String,
    /// Optional bearer token
    pub api_token: Option<String>,
    /// Per-request timeout
    pub request_timeout: Duration,
    /// Maximum operations per commit
    pub max_batch_ops: usize,
}

impl Default for HttpBackendConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8700".to_string(),
            api_token: None,
            request_timeout: Duration::from_secs(10),
            max_batch_ops: DEFAULT_MAX_BATCH_OPS,
        }
    }
}

// =============================================================================
// Wire Types
// =============================================================================

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct QueryRequest<'a> {
    filters: &'a Filters,
    #[serde(skip_serializing_if = "Option::is_none")]
    order_by: Option<&'a OrderBy>,
    #[serde(skip_serializing_if = "Option::is_none")]
    limit: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    offset: Option<usize>,
}

#[derive(Debug, Serialize)]
struct CountRequest<'a> {
    filters: &'a Filters,
}

#[derive(Debug, Serialize)]
struct CommitRequest<'a> {
    writes: &'a [WriteOp],
}

#[derive(Debug, Deserialize)]
struct WireDocument {
    id: String,
    #[serde(default)]
    data: Option<Payload>,
}

#[derive(Debug, Deserialize)]
struct QueryResponse {
    documents: Vec<WireDocument>,
}

#[derive(Debug, Deserialize)]
struct CountResponse {
    count: u64,
}

// =============================================================================
// Backend
// =============================================================================

/// Document store reached over HTTP
pub struct HttpDocumentBackend {
    config: HttpBackendConfig,
    client: Client,
}

impl HttpDocumentBackend {
    /// Create a new HTTP backend
    pub fn new(config: HttpBackendConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| Error::Internal(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self { config, client })
    }

    fn document_url(&self, collection: &str, id: &str) -> String {
        format!(
            "{}/collections/{}/documents/{}",
            self.config.base_url,
            urlencoding::encode(collection),
            urlencoding::encode(id)
        )
    }

    fn collection_url(&self, collection: &str, verb: &str) -> String {
        format!(
            "{}/collections/{}:{}",
            self.config.base_url,
            urlencoding::encode(collection),
            verb
        )
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.config.api_token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn send(&self, request: RequestBuilder) -> Result<Response> {
        let response = self.authorize(request).send().await?;
        check_status(response).await
    }
}

/// Map non-success statuses into the error taxonomy
async fn check_status(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    if status == StatusCode::TOO_MANY_REQUESTS {
        return Err(Error::quota("backend", format!("store rejected request: {}", body)));
    }
    if status.is_server_error() {
        return Err(Error::BackendUnavailable(format!("{}: {}", status, body)));
    }
    Err(Error::Internal(format!("store returned {}: {}", status, body)))
}

#[async_trait]
impl DocumentBackend for HttpDocumentBackend {
    #[instrument(skip(self))]
    async fn get(&self, collection: &str, id: &str) -> Result<Option<Document>> {
        let url = self.document_url(collection, id);
        let response = self.authorize(self.client.get(&url)).send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            debug!("Document {}/{} not found", collection, id);
            return Ok(None);
        }
        let response = check_status(response).await?;
        // A `null` body means the store has no payload for this id
        let payload: Option<Payload> = response.json().await?;
        Ok(payload.map(|data| Document::new(collection, id, data)))
    }

    #[instrument(skip(self, filters, options))]
    async fn query(
        &self,
        collection: &str,
        filters: &Filters,
        options: &QueryOptions,
    ) -> Result<Vec<Document>> {
        let body = QueryRequest {
            filters,
            order_by: options.order_by.as_ref(),
            limit: options.limit,
            offset: options.offset,
        };
        let url = self.collection_url(collection, "query");
        let response = self.send(self.client.post(&url).json(&body)).await?;
        let parsed: QueryResponse = response.json().await?;

        Ok(parsed
            .documents
            .into_iter()
            .filter_map(|d| d.data.map(|data| Document::new(collection, d.id, data)))
            .collect())
    }

    #[instrument(skip(self, filters))]
    async fn count(&self, collection: &str, filters: &Filters) -> Result<u64> {
        let url = self.collection_url(collection, "count");
        let response = self
            .send(self.client.post(&url).json(&CountRequest { filters }))
            .await?;
        let parsed: CountResponse = response.json().await?;
        Ok(parsed.count)
    }

    #[instrument(skip(self, data))]
    async fn set(&self, collection: &str, id: &str, data: &Payload) -> Result<()> {
        let url = self.document_url(collection, id);
        self.send(self.client.put(&url).json(data)).await?;
        Ok(())
    }

    #[instrument(skip(self, data))]
    async fn update(&self, collection: &str, id: &str, data: &Payload) -> Result<()> {
        let url = self.document_url(collection, id);
        self.send(self.client.patch(&url).json(data)).await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn delete(&self, collection: &str, id: &str) -> Result<()> {
        let url = self.document_url(collection, id);
        let response = self.authorize(self.client.delete(&url)).send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(());
        }
        check_status(response).await?;
        Ok(())
    }

    #[instrument(skip(self, ops), fields(ops = ops.len()))]
    async fn batch_commit(&self, ops: &[WriteOp]) -> Result<()> {
        if ops.len() > self.config.max_batch_ops {
            return Err(Error::Internal(format!(
                "batch of {} ops exceeds backend ceiling {}",
                ops.len(),
                self.config.max_batch_ops
            )));
        }
        let url = format!("{}:commit", self.config.base_url);
        self.send(self.client.post(&url).json(&CommitRequest { writes: ops }))
            .await?;
        Ok(())
    }

    fn max_batch_ops(&self) -> usize {
        self.config.max_batch_ops
    }

    fn name(&self) -> &str {
        "http"
    }
}

impl std::fmt::Debug for HttpDocumentBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpDocumentBackend")
            .field("base_url", &self.config.base_url)
            .field("max_batch_ops", &self.config.max_batch_ops)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_urls_are_encoded() {
        let backend = HttpDocumentBackend::new(HttpBackendConfig {
            base_url: "http://store".into(),
            ..Default::default()
        })
        .unwrap();

        assert_eq!(
            backend.document_url("users", "a/b c"),
            "http://store/collections/users/documents/a%2Fb%20c"
        );
        assert_eq!(
            backend.collection_url("services", "query"),
            "http://store/collections/services:query"
        );
    }

    #[test]
    fn test_query_request_shape() {
        let mut filters = Filters::new();
        filters.insert("category".into(), serde_json::json!("streaming"));
        let order = OrderBy::asc("price");
        let body = QueryRequest {
            filters: &filters,
            order_by: Some(&order),
            limit: Some(5),
            offset: None,
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["filters"]["category"], "streaming");
        assert_eq!(json["orderBy"]["field"], "price");
        assert_eq!(json["limit"], 5);
        assert!(json.get("offset").is_none());
    }

    #[test]
    fn test_wire_document_null_data() {
        let parsed: QueryResponse =
            serde_json::from_str(r#"{"documents":[{"id":"a","data":null},{"id":"b","data":{"x":1}}]}"#)
                .unwrap();
        assert!(parsed.documents[0].data.is_none());
        assert!(parsed.documents[1].data.is_some());
    }
}
