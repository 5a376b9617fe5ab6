use async_trait::async_trait;
use eyre::{eyre, Result};
use sqlx::postgres::PgPool;
use std::collections::HashSet;

use crate::retry::{RetryPolicy, TransportError};

/// Hard upper bound on a single enumeration page, whatever the caller asks for.
pub const MAX_PAGE_SIZE: usize = 1000;

pub(crate) fn clamp_page_size(requested: usize) -> usize {
    requested.clamp(1, MAX_PAGE_SIZE)
}

/// One candidate identifier produced by enumeration.
///
/// `id` is the position in the source's total order: the primary key for
/// relational rows, a stable enumeration ordinal for object-store listings
/// (S3 lists keys lexicographically). The checkpoint advances along it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub code: String,
    pub platform: String,
    pub id: Option<i64>,
}

#[derive(Debug, Clone, Default)]
pub struct Page {
    pub items: Vec<Candidate>,
    pub next_cursor: Option<String>,
    pub done: bool,
}

/// A paginated stream of candidate identifiers in a stable total order.
#[async_trait]
pub trait ItemSource: Send {
    async fn next_page(&mut self, page_size: usize, cursor: Option<String>) -> Result<Page>;
}

/// Extracts `(platform, code)` from an object key shaped
/// `<platform>/<code>/<asset...>`.
pub(crate) fn parse_object_key(key: &str) -> Option<(String, String)> {
    let mut parts = key.split('/');
    let platform = parts.next()?;
    let code = parts.next()?;
    let asset = parts.next()?;
    if platform.is_empty() || code.is_empty() || asset.is_empty() {
        return None;
    }
    Some((platform.to_string(), code.to_string()))
}

/// Lists keys under a bucket prefix using server-side pagination tokens.
pub struct ObjectStoreSource {
    client: aws_sdk_s3::Client,
    bucket: String,
    prefix: String,
    retry: RetryPolicy,
    next_ordinal: i64,
}

impl ObjectStoreSource {
    pub fn new(
        client: aws_sdk_s3::Client,
        bucket: impl Into<String>,
        prefix: impl Into<String>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            client,
            bucket: bucket.into(),
            prefix: prefix.into(),
            retry,
            next_ordinal: 0,
        }
    }
}

#[async_trait]
impl ItemSource for ObjectStoreSource {
    async fn next_page(&mut self, page_size: usize, cursor: Option<String>) -> Result<Page> {
        let page_size = clamp_page_size(page_size);
        let cursor_token = cursor;

        let resp = self
            .retry
            .call("list objects", || {
                let req = self
                    .client
                    .list_objects_v2()
                    .bucket(self.bucket.clone())
                    .prefix(self.prefix.clone())
                    .max_keys(page_size as i32)
                    .set_continuation_token(cursor_token.clone());
                async move {
                    req.send()
                        .await
                        .map_err(|err| TransportError::transient(format!("{err}")))
                }
            })
            .await
            .map_err(|err| {
                eyre!(
                    "failed to list {}/{}: {err}",
                    self.bucket,
                    self.prefix
                )
            })?;

        let mut seen: HashSet<String> = HashSet::new();
        let mut items = Vec::new();
        for obj in resp.contents() {
            let Some(key) = obj.key() else { continue };
            let Some((platform, code)) = parse_object_key(key) else {
                tracing::warn!(key, "object key does not match <platform>/<code>/<asset>; skipping");
                continue;
            };
            if !seen.insert(code.clone()) {
                continue;
            }
            self.next_ordinal += 1;
            items.push(Candidate {
                code,
                platform,
                id: Some(self.next_ordinal),
            });
        }

        let next_cursor = resp.next_continuation_token().map(str::to_string);
        let done = !resp.is_truncated().unwrap_or(false);
        Ok(Page {
            items,
            next_cursor,
            done,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct VideoRow {
    id: i64,
    platform: String,
    code: String,
}

const PAGE_QUERY: &str = r#"
    SELECT id, platform, code
    FROM videos
    WHERE id > $1 AND is_downloaded AND NOT is_embedded
    ORDER BY id
    LIMIT $2
"#;

/// Keyset pagination over the `videos` table, never more than
/// [`MAX_PAGE_SIZE`] rows per page.
pub struct DbItemSource {
    pool: PgPool,
    start_after: i64,
}

impl DbItemSource {
    /// `start_after` is the checkpoint value: enumeration begins strictly
    /// after it.
    pub fn new(pool: PgPool, start_after: i64) -> Self {
        Self { pool, start_after }
    }
}

#[async_trait]
impl ItemSource for DbItemSource {
    async fn next_page(&mut self, page_size: usize, cursor: Option<String>) -> Result<Page> {
        let limit = clamp_page_size(page_size);
        let after: i64 = match cursor {
            Some(raw) => raw
                .parse()
                .map_err(|e| eyre!("invalid enumeration cursor {raw:?}: {e}"))?,
            None => self.start_after,
        };

        let rows: Vec<VideoRow> = sqlx::query_as(PAGE_QUERY)
            .bind(after)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| eyre!("failed to page videos after id {after}: {e}"))?;

        let done = rows.len() < limit;
        let items: Vec<Candidate> = rows
            .into_iter()
            .map(|row| Candidate {
                code: row.code,
                platform: row.platform,
                id: Some(row.id),
            })
            .collect();
        let next_cursor = items
            .last()
            .and_then(|c| c.id)
            .map(|id| id.to_string());

        Ok(Page {
            items,
            next_cursor,
            done,
        })
    }
}
