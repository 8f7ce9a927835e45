//! Search capability used for turn augmentation and the standalone search endpoint.
//!
//! A search never fails on "no results". Transport failures are folded into an empty result
//! set whose `source` tag says what went wrong, so callers never have to handle an error.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::focusgroup::clients::common::get_shared_http_client;
use crate::focusgroup::model::SearchResult;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchResponse {
    pub results: Vec<SearchResult>,
    /// Which provider answered, e.g. `brave`, `brave-error` or `mock`.
    pub source: String,
}

#[async_trait]
pub trait SearchCapability: Send + Sync {
    async fn search(&self, query: &str) -> SearchResponse;
}

const BRAVE_ENDPOINT: &str = "https://api.search.brave.com/res/v1/web/search";
const BRAVE_RESULT_COUNT: usize = 5;

/// Brave web search.
pub struct BraveSearch {
    api_key: String,
    endpoint: String,
    timeout: Duration,
}

impl BraveSearch {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            endpoint: BRAVE_ENDPOINT.to_string(),
            timeout: Duration::from_secs(15),
        }
    }

    /// Point at a different host, e.g. a local stub.
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    async fn fetch(&self, query: &str) -> Result<Vec<SearchResult>, reqwest::Error> {
        let url = format!(
            "{}?q={}&count={}",
            self.endpoint,
            urlencoding::encode(query),
            BRAVE_RESULT_COUNT
        );
        let body: BraveResponse = get_shared_http_client()
            .get(url)
            .header("Accept", "application/json")
            .header("X-Subscription-Token", &self.api_key)
            .timeout(self.timeout)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        Ok(body
            .web
            .map(|web| web.results)
            .unwrap_or_default()
            .into_iter()
            .map(|r| SearchResult {
                title: r.title,
                url: r.url,
                description: r.description.unwrap_or_default(),
            })
            .collect())
    }
}

#[derive(Deserialize)]
struct BraveResponse {
    web: Option<BraveWeb>,
}

#[derive(Deserialize)]
struct BraveWeb {
    #[serde(default)]
    results: Vec<BraveHit>,
}

#[derive(Deserialize)]
struct BraveHit {
    title: String,
    url: String,
    description: Option<String>,
}

#[async_trait]
impl SearchCapability for BraveSearch {
    async fn search(&self, query: &str) -> SearchResponse {
        match self.fetch(query).await {
            Ok(results) => SearchResponse {
                results,
                source: "brave".to_string(),
            },
            Err(err) => {
                log::error!("focusgroup::search::BraveSearch: request failed: {}", err);
                SearchResponse {
                    results: Vec::new(),
                    source: "brave-error".to_string(),
                }
            }
        }
    }
}

/// Deterministic placeholder results used when no search key is configured.
pub struct MockSearch;

#[async_trait]
impl SearchCapability for MockSearch {
    async fn search(&self, query: &str) -> SearchResponse {
        let encoded = urlencoding::encode(query);
        let results = vec![
            SearchResult {
                title: format!("Research on: {}", query),
                url: format!("https://example.com/research/{}", encoded),
                description: format!(
                    "Findings related to \"{}\". Placeholder result; configure a search key for live results.",
                    query
                ),
            },
            SearchResult {
                title: format!("{} - Industry Report", query),
                url: format!("https://example.com/report/{}", encoded),
                description: format!("Industry data and trends for \"{}\". Placeholder result.", query),
            },
            SearchResult {
                title: format!("Expert Analysis: {}", query),
                url: format!("https://example.com/analysis/{}", encoded),
                description: format!("Expert perspectives on \"{}\". Placeholder result.", query),
            },
        ];
        SearchResponse {
            results,
            source: "mock".to_string(),
        }
    }
}

/// Brave when a key is available, otherwise [`MockSearch`].
pub fn search_from_key(api_key: Option<&str>) -> Box<dyn SearchCapability> {
    match api_key.filter(|k| !k.trim().is_empty()) {
        Some(key) => Box::new(BraveSearch::new(key)),
        None => Box::new(MockSearch),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn mock_search_is_deterministic() {
        let a = MockSearch.search("remote work").await;
        let b = MockSearch.search("remote work").await;
        assert_eq!(a, b);
        assert_eq!(a.source, "mock");
        assert_eq!(a.results.len(), 3);
        assert_eq!(a.results[0].url, "https://example.com/research/remote%20work");
    }

    #[tokio::test]
    async fn unreachable_brave_endpoint_yields_empty_tagged_result() {
        let search = BraveSearch::new("key").with_endpoint("http://127.0.0.1:9/search");
        let response = search.search("anything").await;
        assert!(response.results.is_empty());
        assert_eq!(response.source, "brave-error");
    }
}
