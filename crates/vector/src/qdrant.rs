use std::time::Duration;

use async_trait::async_trait;
use engram_config::VectorSettings;
use reqwest::{Method, RequestBuilder, StatusCode};
use serde_json::{json, Value};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::VectorError;
use crate::filters::SearchFilters;
use crate::{MemoryPayload, ScoredPoint, VectorStore};

/// Qdrant gateway over its HTTP API.
///
/// Construction never touches the network; an unreachable Qdrant degrades
/// the operations that need it instead of failing startup.
#[derive(Debug, Clone)]
pub struct QdrantStore {
    http: reqwest::Client,
    base_url: String,
    collection: String,
    api_key: Option<String>,
    dims: usize,
}

impl QdrantStore {
    pub fn new(settings: &VectorSettings, dims: usize) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_default();
        Self {
            http,
            base_url: settings.url.trim_end_matches('/').to_string(),
            collection: settings.collection.clone(),
            api_key: settings.api_key.clone(),
            dims,
        }
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let url = format!("{}{path}", self.base_url);
        let builder = self.http.request(method, url);
        match &self.api_key {
            Some(key) => builder.header("api-key", key),
            None => builder,
        }
    }

    async fn expect_ok(response: reqwest::Response) -> Result<Value, VectorError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response.json().await?);
        }
        let body = response.text().await.unwrap_or_default();
        Err(VectorError::Request(format!("qdrant returned {status}: {body}")))
    }

    fn collection_path(&self, suffix: &str) -> String {
        format!("/collections/{}{suffix}", self.collection)
    }
}

#[async_trait]
impl VectorStore for QdrantStore {
    async fn ensure_ready(&self) -> Result<(), VectorError> {
        let response = self
            .request(Method::GET, &self.collection_path(""))
            .send()
            .await?;
        if response.status().is_success() {
            return Ok(());
        }
        if response.status() != StatusCode::NOT_FOUND {
            return Err(VectorError::Request(format!(
                "qdrant returned {} probing collection {}",
                response.status(),
                self.collection
            )));
        }

        info!(collection = %self.collection, dims = self.dims, "creating vector collection");
        let response = self
            .request(Method::PUT, &self.collection_path(""))
            .json(&json!({"vectors": {"size": self.dims, "distance": "Cosine"}}))
            .send()
            .await?;
        // A concurrent creator may have won the race.
        if response.status() == StatusCode::CONFLICT {
            return Ok(());
        }
        Self::expect_ok(response).await.map(|_| ())
    }

    async fn upsert(
        &self,
        id: Uuid,
        vector: Vec<f32>,
        payload: MemoryPayload,
    ) -> Result<(), VectorError> {
        let body = json!({
            "points": [{
                "id": id.to_string(),
                "vector": vector,
                "payload": serde_json::to_value(&payload)?,
            }]
        });
        let response = self
            .request(Method::PUT, &format!("{}?wait=true", self.collection_path("/points")))
            .json(&body)
            .send()
            .await?;
        Self::expect_ok(response).await?;
        debug!(%id, "vector point upserted");
        Ok(())
    }

    async fn search(
        &self,
        vector: Vec<f32>,
        limit: usize,
        filters: &SearchFilters,
    ) -> Result<Vec<ScoredPoint>, VectorError> {
        let mut body = json!({
            "vector": vector,
            "limit": limit,
            "with_payload": true,
        });
        if !filters.is_empty() {
            body["filter"] = filters.to_qdrant();
        }
        let response = self
            .request(Method::POST, &self.collection_path("/points/search"))
            .json(&body)
            .send()
            .await?;
        let value = Self::expect_ok(response).await?;

        let hits = value
            .get("result")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        let mut points = Vec::with_capacity(hits.len());
        for hit in hits {
            let Some(id) = hit.get("id").and_then(Value::as_str).and_then(|raw| Uuid::parse_str(raw).ok())
            else {
                continue;
            };
            let score = hit.get("score").and_then(Value::as_f64).unwrap_or(0.0) as f32;
            let payload: MemoryPayload =
                serde_json::from_value(hit.get("payload").cloned().unwrap_or(Value::Null))?;
            points.push(ScoredPoint { id, score, payload });
        }
        Ok(points)
    }

    async fn get(&self, id: Uuid) -> Result<Option<MemoryPayload>, VectorError> {
        let body = json!({"ids": [id.to_string()], "with_payload": true});
        let response = self
            .request(Method::POST, &self.collection_path("/points"))
            .json(&body)
            .send()
            .await?;
        let value = Self::expect_ok(response).await?;
        let Some(point) = value
            .get("result")
            .and_then(Value::as_array)
            .and_then(|points| points.first())
        else {
            return Ok(None);
        };
        let payload: MemoryPayload =
            serde_json::from_value(point.get("payload").cloned().unwrap_or(Value::Null))?;
        Ok(Some(payload))
    }

    async fn delete(&self, id: Uuid) -> Result<(), VectorError> {
        let body = json!({"points": [id.to_string()]});
        let response = self
            .request(
                Method::POST,
                &format!("{}?wait=true", self.collection_path("/points/delete")),
            )
            .json(&body)
            .send()
            .await?;
        Self::expect_ok(response).await?;
        Ok(())
    }
}
