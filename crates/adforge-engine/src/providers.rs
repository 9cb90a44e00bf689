//! Search-provider contract and the built-in JSON-API provider.
//!
//! Scraping recipes for specific engines live outside the engine; anything
//! implementing [`SearchProvider`] can be slotted into the broker. The
//! shipped default speaks the SearxNG `format=json` image-search API.

use async_trait::async_trait;
use reqwest::Url;
use serde::Deserialize;

/// Provider failures the broker wants to distinguish from generic transport
/// errors.
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    /// The instance throttled us; counts as a failure but is expected under
    /// load.
    #[error("provider rate-limited the request (http 429)")]
    RateLimited,
}

/// One image hit from any provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    /// Direct image URL.
    pub url: String,
    /// Name of the provider that surfaced it.
    pub provider: String,
    /// Declared width, 0 when unknown.
    pub width: u32,
    /// Declared height, 0 when unknown.
    pub height: u32,
    /// Result title, possibly empty.
    pub title: String,
}

/// A search backend. Implementations raise on transport errors and do not
/// dedupe among themselves; the broker handles both.
#[async_trait]
pub trait SearchProvider: Send + Sync {
    /// Stable provider name used in logs, stats, and artifact metadata.
    fn name(&self) -> &str;

    /// Return up to `max_results` candidates for `query`, provider order
    /// preserved.
    async fn search(&self, query: &str, max_results: usize) -> anyhow::Result<Vec<Candidate>>;
}

const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) \
     AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

#[derive(Debug, Deserialize)]
struct SearxResponse {
    #[serde(default)]
    results: Vec<SearxResult>,
}

#[derive(Debug, Deserialize)]
struct SearxResult {
    #[serde(default)]
    img_src: String,
    #[serde(default)]
    title: String,
    #[serde(default)]
    resolution: Option<String>,
}

/// Image search against a SearxNG instance's JSON API.
pub struct SearxProvider {
    name: String,
    base_url: Url,
    http: reqwest::Client,
}

impl SearxProvider {
    /// Build a provider for one instance. Each provider owns its HTTP client
    /// (and therefore its connection pool).
    pub fn new(name: impl Into<String>, base_url: Url, timeout: std::time::Duration) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(timeout)
            .build()?;
        Ok(Self {
            name: name.into(),
            base_url,
            http,
        })
    }
}

// "1920x1080" or "1920 x 1080".
fn parse_resolution(raw: &str) -> Option<(u32, u32)> {
    let (w, h) = raw.split_once(['x', 'X'])?;
    Some((w.trim().parse().ok()?, h.trim().parse().ok()?))
}

#[async_trait]
impl SearchProvider for SearxProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn search(&self, query: &str, max_results: usize) -> anyhow::Result<Vec<Candidate>> {
        let mut url = self.base_url.join("search")?;
        url.query_pairs_mut()
            .append_pair("q", query)
            .append_pair("format", "json")
            .append_pair("categories", "images");

        let res = self.http.get(url).send().await?;
        if res.status() == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(ProviderError::RateLimited.into());
        }
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            anyhow::bail!("http {status}: {body}");
        }

        let body: SearxResponse = res.json().await?;
        let mut out = Vec::new();
        for result in body.results {
            if result.img_src.is_empty() {
                continue;
            }
            let (width, height) = result
                .resolution
                .as_deref()
                .and_then(parse_resolution)
                .unwrap_or((0, 0));
            out.push(Candidate {
                url: result.img_src,
                provider: self.name.clone(),
                width,
                height,
                title: result.title,
            });
            if out.len() >= max_results {
                break;
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolution_parsing() {
        assert_eq!(parse_resolution("1920x1080"), Some((1920, 1080)));
        assert_eq!(parse_resolution("640 X 480"), Some((640, 480)));
        assert_eq!(parse_resolution("unknown"), None);
        assert_eq!(parse_resolution(""), None);
    }

    #[test]
    fn response_shape_tolerates_missing_fields() {
        let body: SearxResponse = serde_json::from_str(
            r#"{"results":[
                {"img_src":"http://a/img.png","title":"A","resolution":"800x600"},
                {"img_src":"","title":"no image"},
                {"title":"missing img_src"}
            ],"query":"q"}"#,
        )
        .unwrap();
        assert_eq!(body.results.len(), 3);
        assert_eq!(body.results[0].img_src, "http://a/img.png");
        assert!(body.results[2].img_src.is_empty());
    }
}
