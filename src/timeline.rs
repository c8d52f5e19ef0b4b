//! Timeline fetcher capability and its timeline-proxy HTTP client.
//!
//! The upstream social API itself lives behind a proxy service; this module
//! only speaks the proxy's JSON protocol.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt, TryStreamExt};
use reqwest::{Client, StatusCode, Url};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use crate::config::Config;
use crate::model::{Credentials, FetchedPost, FollowedAccount, PostPayload, TimelineFilters};

/// Lazy, finite sequence of posts newer than the requested marker.
pub type PostStream = BoxStream<'static, Result<FetchedPost>>;

#[async_trait]
pub trait TimelineFetcher: Send + Sync {
    /// Posts of `account` newer than `since`, honoring `filters`.
    async fn fetch_recent(
        &self,
        account: &FollowedAccount,
        credentials: &Credentials,
        since: Option<&str>,
        filters: TimelineFilters,
    ) -> Result<PostStream>;

    /// The single most recent post of `account`, if it has any.
    async fn fetch_most_recent_one(
        &self,
        account: &FollowedAccount,
        credentials: &Credentials,
    ) -> Result<Option<FetchedPost>>;
}

/// Caps how many upstream requests run at once across all units.
pub struct RateLimited<F> {
    inner: F,
    permits: Arc<Semaphore>,
}

impl<F> RateLimited<F> {
    pub fn new(inner: F, max_concurrent: usize) -> Self {
        Self {
            inner,
            permits: Arc::new(Semaphore::new(max_concurrent.max(1))),
        }
    }
}

#[async_trait]
impl<F: TimelineFetcher> TimelineFetcher for RateLimited<F> {
    async fn fetch_recent(
        &self,
        account: &FollowedAccount,
        credentials: &Credentials,
        since: Option<&str>,
        filters: TimelineFilters,
    ) -> Result<PostStream> {
        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .context("timeline limiter closed")?;
        let posts = self.inner.fetch_recent(account, credentials, since, filters).await?;
        // The permit is held until the stream is dropped.
        Ok(posts
            .map(move |item| {
                let _held = &permit;
                item
            })
            .boxed())
    }

    async fn fetch_most_recent_one(
        &self,
        account: &FollowedAccount,
        credentials: &Credentials,
    ) -> Result<Option<FetchedPost>> {
        let _permit = self.permits.acquire().await.context("timeline limiter closed")?;
        self.inner.fetch_most_recent_one(account, credentials).await
    }
}

#[derive(Clone)]
pub struct HttpTimelineFetcher {
    http: Client,
    endpoint: Url,
    page_size: u32,
}

impl fmt::Debug for HttpTimelineFetcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpTimelineFetcher")
            .field("endpoint", &self.endpoint)
            .field("page_size", &self.page_size)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Serialize)]
struct TimelineRequest {
    access_token: String,
    access_secret: String,
    user_id: String,
    account_id: String,
    screen_name: String,
    since_id: Option<String>,
    max_id: Option<String>,
    count: u32,
    ignore_retweets: bool,
    ignore_replies: bool,
}

#[derive(Debug, Deserialize)]
struct TimelineResponse {
    #[serde(default)]
    posts: Vec<WirePost>,
}

#[derive(Debug, Deserialize)]
struct WirePost {
    id: String,
    #[serde(flatten)]
    payload: PostPayload,
}

struct PageCursor {
    fetcher: HttpTimelineFetcher,
    request: TimelineRequest,
    exhausted: bool,
}

impl HttpTimelineFetcher {
    pub fn new(base_url: Url, page_size: u32, timeout: Duration) -> Result<Self> {
        let endpoint = base_url
            .join("v1/timeline")
            .context("invalid timeline base URL")?;
        let http = Client::builder()
            .user_agent("tw-digest/0.1")
            .timeout(timeout)
            .build()
            .context("failed to build timeline HTTP client")?;
        Ok(Self {
            http,
            endpoint,
            page_size: page_size.max(1),
        })
    }

    pub fn from_config(cfg: &Config) -> Result<Self> {
        let mut base = cfg.timeline.base_url.trim_end_matches('/').to_string();
        base.push('/');
        let base_url = Url::parse(&base).context("invalid timeline.base_url")?;
        Self::new(
            base_url,
            cfg.timeline.page_size,
            Duration::from_secs(cfg.timeline.request_timeout_seconds),
        )
    }

    fn request(&self, account: &FollowedAccount, credentials: &Credentials) -> TimelineRequest {
        TimelineRequest {
            access_token: credentials.access_token.clone(),
            access_secret: credentials.token_secret.clone(),
            user_id: credentials.user_id.clone(),
            account_id: account.external_id.clone(),
            screen_name: account.screen_name.clone(),
            since_id: None,
            max_id: None,
            count: self.page_size,
            ignore_retweets: false,
            ignore_replies: false,
        }
    }

    async fn fetch_page(&self, request: &TimelineRequest) -> Result<Vec<FetchedPost>> {
        debug!(account = %request.account_id, since = ?request.since_id, max = ?request.max_id, "fetching timeline page");
        let res = self
            .http
            .post(self.endpoint.clone())
            .json(request)
            .send()
            .await
            .context("failed to reach timeline proxy")?;

        if res.status() == StatusCode::TOO_MANY_REQUESTS {
            let body = res.text().await.unwrap_or_default();
            warn!(account = %request.account_id, "rate limited by timeline proxy: {}", body);
            return Err(anyhow!("received 429 from timeline proxy: {}", body));
        }
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            return Err(anyhow!("timeline proxy error {}: {}", status, body));
        }

        let page: TimelineResponse = res.json().await.context("invalid timeline response JSON")?;
        Ok(page
            .posts
            .into_iter()
            .map(|post| FetchedPost {
                external_id: post.id,
                account_id: request.account_id.clone(),
                payload: post.payload,
            })
            .collect())
    }
}

/// Page backwards from the newest post until a short or empty page.
async fn next_page(mut cursor: PageCursor) -> Result<Option<(Vec<FetchedPost>, PageCursor)>> {
    if cursor.exhausted {
        return Ok(None);
    }
    let page = cursor.fetcher.fetch_page(&cursor.request).await?;
    if page.is_empty() {
        return Ok(None);
    }
    let oldest = page
        .iter()
        .filter_map(|p| p.external_id.parse::<u64>().ok())
        .min();
    cursor.exhausted = page.len() < cursor.request.count as usize;
    match oldest.and_then(|id| id.checked_sub(1)) {
        Some(max_id) => cursor.request.max_id = Some(max_id.to_string()),
        None => cursor.exhausted = true,
    }
    Ok(Some((page, cursor)))
}

#[async_trait]
impl TimelineFetcher for HttpTimelineFetcher {
    async fn fetch_recent(
        &self,
        account: &FollowedAccount,
        credentials: &Credentials,
        since: Option<&str>,
        filters: TimelineFilters,
    ) -> Result<PostStream> {
        let mut request = self.request(account, credentials);
        request.since_id = since.map(str::to_string);
        request.ignore_retweets = filters.ignore_retweets;
        request.ignore_replies = filters.ignore_replies;
        let cursor = PageCursor {
            fetcher: self.clone(),
            request,
            exhausted: false,
        };
        Ok(stream::try_unfold(cursor, next_page)
            .map_ok(|page| stream::iter(page.into_iter().map(Ok::<_, anyhow::Error>)))
            .try_flatten()
            .boxed())
    }

    async fn fetch_most_recent_one(
        &self,
        account: &FollowedAccount,
        credentials: &Credentials,
    ) -> Result<Option<FetchedPost>> {
        let mut request = self.request(account, credentials);
        request.count = 1;
        let page = self.fetch_page(&request).await?;
        Ok(page.into_iter().next())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn account() -> FollowedAccount {
        FollowedAccount {
            external_id: "42".into(),
            display_name: "Alice".into(),
            screen_name: "alice".into(),
            avatar_url: String::new(),
        }
    }

    fn credentials() -> Credentials {
        Credentials {
            user_id: "7".into(),
            access_token: "token".into(),
            token_secret: "secret".into(),
        }
    }

    fn wire(id: &str) -> serde_json::Value {
        json!({
            "id": id,
            "text": format!("post {id}"),
            "author_id": "42",
            "author_name": "Alice",
            "author_screen_name": "alice"
        })
    }

    fn fetcher(server: &MockServer, page_size: u32) -> HttpTimelineFetcher {
        let base = Url::parse(&format!("{}/", server.uri())).unwrap();
        HttpTimelineFetcher::new(base, page_size, Duration::from_secs(5)).unwrap()
    }

    #[tokio::test]
    async fn pages_backwards_until_short_page() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/timeline"))
            .and(body_partial_json(json!({ "since_id": "100", "max_id": null, "ignore_replies": true })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "posts": [wire("104"), wire("103")] })))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/v1/timeline"))
            .and(body_partial_json(json!({ "since_id": "100", "max_id": "102" })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "posts": [wire("101")] })))
            .expect(1)
            .mount(&server)
            .await;

        let filters = TimelineFilters {
            ignore_retweets: false,
            ignore_replies: true,
        };
        let posts: Vec<FetchedPost> = fetcher(&server, 2)
            .fetch_recent(&account(), &credentials(), Some("100"), filters)
            .await
            .unwrap()
            .try_collect()
            .await
            .unwrap();
        let ids: Vec<&str> = posts.iter().map(|p| p.external_id.as_str()).collect();
        assert_eq!(ids, vec!["104", "103", "101"]);
        assert!(posts.iter().all(|p| p.account_id == "42"));
        assert_eq!(posts[0].payload.author_screen_name, "alice");
    }

    #[tokio::test]
    async fn most_recent_one_handles_empty_timeline() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/timeline"))
            .and(body_partial_json(json!({ "count": 1 })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "posts": [] })))
            .mount(&server)
            .await;

        let found = fetcher(&server, 20)
            .fetch_most_recent_one(&account(), &credentials())
            .await
            .unwrap();
        assert!(found.is_none());
    }

    struct Canned;

    #[async_trait]
    impl TimelineFetcher for Canned {
        async fn fetch_recent(
            &self,
            account: &FollowedAccount,
            _credentials: &Credentials,
            _since: Option<&str>,
            _filters: TimelineFilters,
        ) -> Result<PostStream> {
            let post = FetchedPost {
                external_id: "1".into(),
                account_id: account.external_id.clone(),
                payload: PostPayload::default(),
            };
            Ok(stream::iter(vec![Ok(post)]).boxed())
        }

        async fn fetch_most_recent_one(
            &self,
            _account: &FollowedAccount,
            _credentials: &Credentials,
        ) -> Result<Option<FetchedPost>> {
            Ok(None)
        }
    }

    #[tokio::test]
    async fn open_stream_holds_its_permit() {
        let limited = RateLimited::new(Canned, 1);
        let posts = limited
            .fetch_recent(&account(), &credentials(), None, TimelineFilters::default())
            .await
            .unwrap();

        let blocked = tokio::time::timeout(
            Duration::from_millis(50),
            limited.fetch_most_recent_one(&account(), &credentials()),
        )
        .await;
        assert!(blocked.is_err());

        let drained: Vec<FetchedPost> = posts.try_collect().await.unwrap();
        assert_eq!(drained.len(), 1);
        // try_collect consumed the stream and with it the permit.
        let found = limited.fetch_most_recent_one(&account(), &credentials()).await.unwrap();
        assert!(found.is_none());
    }

    #[tokio::test]
    async fn error_status_is_reported() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(429).set_body_string("slow down"))
            .mount(&server)
            .await;

        let err = fetcher(&server, 20)
            .fetch_most_recent_one(&account(), &credentials())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("429"));
    }
}
