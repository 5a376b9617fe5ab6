use async_trait::async_trait;
use eyre::{eyre, Result};
use serde_json::Value;
use std::collections::HashMap;

use crate::retry::{retry_after_hint, RetryPolicy, TransportError};

/// Answers "is this code already embedded?" against the vector index.
#[async_trait]
pub trait ExtractionIndex: Send + Sync {
    async fn is_extracted(&self, code: &str) -> Result<bool>;

    /// Batched variant; the default just issues independent queries.
    async fn verify_batch(&self, codes: &[String]) -> Result<HashMap<String, bool>> {
        let mut out = HashMap::with_capacity(codes.len());
        for code in codes {
            out.insert(code.clone(), self.is_extracted(code).await?);
        }
        Ok(out)
    }
}

/// HTTP client for the vector index scroll endpoint.
///
/// A code counts as extracted when at least one point carries a
/// `video_code` payload matching it. Transport failures are fail-open
/// (assume not extracted, WARN) unless strict mode is on.
#[derive(Debug, Clone)]
pub struct VectorIndexClient {
    base_url: String,
    collection: String,
    http: reqwest::Client,
    retry: RetryPolicy,
    strict: bool,
}

impl VectorIndexClient {
    pub fn new(
        base_url: impl Into<String>,
        collection: impl Into<String>,
        http: reqwest::Client,
        retry: RetryPolicy,
        strict: bool,
    ) -> Self {
        let base_url = base_url.into();
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            collection: collection.into(),
            http,
            retry,
            strict,
        }
    }

    async fn scroll_has_point(&self, code: &str) -> Result<bool, TransportError> {
        let url = format!(
            "{}/collections/{}/points/scroll",
            self.base_url, self.collection
        );
        let body = serde_json::json!({
            "filter": {
                "must": [
                    { "key": "video_code", "match": { "value": code } }
                ]
            },
            "limit": 1,
            "with_payload": false,
            "with_vector": false,
        });

        let res = self
            .http
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(TransportError::from_reqwest)?;

        let status = res.status();
        if !status.is_success() {
            let hint = retry_after_hint(res.headers());
            let body = res.text().await.unwrap_or_default();
            return Err(TransportError::from_status(status, hint, body));
        }

        let payload: Value = res
            .json()
            .await
            .map_err(|e| TransportError::permanent(format!("invalid scroll response: {e}")))?;
        let has_point = payload
            .get("result")
            .and_then(|r| r.get("points"))
            .and_then(|p| p.as_array())
            .map(|points| !points.is_empty())
            .unwrap_or(false);
        Ok(has_point)
    }
}

#[async_trait]
impl ExtractionIndex for VectorIndexClient {
    async fn is_extracted(&self, code: &str) -> Result<bool> {
        match self
            .retry
            .call("index scroll", || self.scroll_has_point(code))
            .await
        {
            Ok(found) => Ok(found),
            Err(err) if !self.strict => {
                tracing::warn!(code, error = %err, "vector index unreachable; assuming not extracted");
                Ok(false)
            }
            Err(err) => Err(eyre!("vector index query for {code} failed: {err}")),
        }
    }
}
