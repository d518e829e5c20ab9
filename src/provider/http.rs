use async_trait::async_trait;
use reqwest::{Client, StatusCode, Url};
use serde_json::Value;
use std::fmt;
use std::time::Duration;
use tracing::{debug, warn};

use super::{Fetch, FetchError};

pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
pub const PER_PAGE: usize = 100;
pub const MAX_PAGES: u32 = 10;

/// A GET against one of the REST surfaces. The query lives in `url`.
#[derive(Clone, PartialEq, Eq)]
pub struct ApiRequest {
    pub url: Url,
    pub headers: Vec<(&'static str, String)>,
}

impl fmt::Debug for ApiRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // header values carry credentials
        f.debug_struct("ApiRequest")
            .field("url", &self.url.as_str())
            .field(
                "headers",
                &self.headers.iter().map(|(name, _)| *name).collect::<Vec<_>>(),
            )
            .finish()
    }
}

impl ApiRequest {
    pub fn new(url: Url, headers: Vec<(&'static str, String)>) -> Self {
        Self { url, headers }
    }

    pub fn query(mut self, key: &str, value: &str) -> Self {
        self.url.query_pairs_mut().append_pair(key, value);
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Transport seam between the adapters and the network.
#[async_trait]
pub trait JsonFetcher: Send + Sync {
    /// `Ok(None)` for a 404 or an empty body.
    async fn get_json(&self, request: ApiRequest) -> Fetch<Value>;
}

/// reqwest-backed fetcher with a uniform per-request timeout.
#[derive(Clone)]
pub struct HttpFetcher {
    http: Client,
}

impl fmt::Debug for HttpFetcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpFetcher").finish_non_exhaustive()
    }
}

impl HttpFetcher {
    pub fn new() -> Result<Self, reqwest::Error> {
        let http = Client::builder()
            .user_agent(concat!("git-watchbot/", env!("CARGO_PKG_VERSION")))
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Self { http })
    }
}

#[async_trait]
impl JsonFetcher for HttpFetcher {
    async fn get_json(&self, request: ApiRequest) -> Fetch<Value> {
        let mut builder = self.http.get(request.url.clone());
        for (name, value) in &request.headers {
            builder = builder.header(*name, value);
        }
        let res = builder.send().await?;
        let status = res.status();
        debug!(url = %request.url, %status, "api response");
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            return Err(FetchError::Status(status.as_u16()));
        }
        let body = res.text().await?;
        if body.trim().is_empty() {
            return Ok(None);
        }
        match serde_json::from_str::<Value>(&body) {
            Ok(Value::Null) => Ok(None),
            Ok(value) => Ok(Some(value)),
            Err(err) => Err(FetchError::Decode(err.to_string())),
        }
    }
}

/// Collect a paged list with `page`/`per_page`, stopping on a short, empty
/// or non-list page and never requesting more than [`MAX_PAGES`] pages.
/// A failure on the first page is returned; a later one keeps what was
/// already collected.
pub async fn paginate(fetcher: &dyn JsonFetcher, request: &ApiRequest) -> Fetch<Vec<Value>> {
    let mut items = Vec::new();
    for page in 1..=MAX_PAGES {
        let req = request
            .clone()
            .query("page", &page.to_string())
            .query("per_page", &PER_PAGE.to_string());
        let batch = match fetcher.get_json(req).await {
            Ok(Some(Value::Array(batch))) => batch,
            Ok(_) => break,
            Err(err) if page == 1 => return Err(err),
            Err(err) => {
                warn!(%err, page, url = %request.url, "pagination stopped early");
                break;
            }
        };
        if batch.is_empty() {
            break;
        }
        let short = batch.len() < PER_PAGE;
        items.extend(batch);
        if short {
            break;
        }
    }
    if items.is_empty() {
        Ok(None)
    } else {
        Ok(Some(items))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::testing::ScriptedFetcher;
    use serde_json::json;

    fn full_page() -> Value {
        Value::Array((0..PER_PAGE).map(|i| json!({ "i": i })).collect())
    }

    #[tokio::test]
    async fn pagination_is_capped() {
        let fetcher = ScriptedFetcher::default();
        // upstream claims far more pages than the cap
        for page in 1..=15 {
            fetcher.respond(
                &format!("https://api.test/list?page={page}&per_page=100"),
                full_page(),
            );
        }
        let req = ApiRequest::new(Url::parse("https://api.test/list").unwrap(), vec![]);
        let items = paginate(&fetcher, &req).await.unwrap().unwrap();
        assert_eq!(items.len(), PER_PAGE * MAX_PAGES as usize);
        assert_eq!(fetcher.urls().len(), MAX_PAGES as usize);
    }

    #[tokio::test]
    async fn short_page_stops_pagination() {
        let fetcher = ScriptedFetcher::default();
        fetcher.respond("https://api.test/list?x=1&page=1&per_page=100", full_page());
        fetcher.respond(
            "https://api.test/list?x=1&page=2&per_page=100",
            json!([{ "i": 1 }]),
        );
        let req = ApiRequest::new(Url::parse("https://api.test/list").unwrap(), vec![])
            .query("x", "1");
        let items = paginate(&fetcher, &req).await.unwrap().unwrap();
        assert_eq!(items.len(), PER_PAGE + 1);
        assert_eq!(fetcher.urls().len(), 2);
    }

    #[tokio::test]
    async fn first_page_failure_is_an_error_later_is_partial() {
        let fetcher = ScriptedFetcher::default();
        fetcher.fail("https://api.test/a?page=1&per_page=100", 500);
        let req = ApiRequest::new(Url::parse("https://api.test/a").unwrap(), vec![]);
        assert!(matches!(
            paginate(&fetcher, &req).await,
            Err(FetchError::Status(500))
        ));

        fetcher.respond("https://api.test/b?page=1&per_page=100", full_page());
        fetcher.fail("https://api.test/b?page=2&per_page=100", 502);
        let req = ApiRequest::new(Url::parse("https://api.test/b").unwrap(), vec![]);
        let items = paginate(&fetcher, &req).await.unwrap().unwrap();
        assert_eq!(items.len(), PER_PAGE);
    }

    #[test]
    fn debug_output_hides_header_values() {
        let req = ApiRequest::new(
            Url::parse("https://api.test/").unwrap(),
            vec![("Authorization", "Bearer secret".into())],
        );
        let out = format!("{:?}", req);
        assert!(out.contains("Authorization"));
        assert!(!out.contains("secret"));
        assert_eq!(req.header("authorization"), Some("Bearer secret"));
    }
}
