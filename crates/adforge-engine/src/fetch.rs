//! Candidate image download.

use async_trait::async_trait;

/// Fetches raw image bytes for a candidate URL.
///
/// `Ok(None)` means "skip this candidate" (non-success status or undersized
/// body); `Err` means a transport failure worth retrying.
#[async_trait]
pub trait ImageFetcher: Send + Sync {
    /// Download the body at `url`.
    async fn fetch(&self, url: &str) -> anyhow::Result<Option<Vec<u8>>>;
}

const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) \
     AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";
const ACCEPT: &str = "image/webp,image/apng,image/*,*/*;q=0.8";

/// Plain HTTP downloader. Each worker owns one, so each worker keeps its own
/// connection pool.
pub struct HttpFetcher {
    http: reqwest::Client,
    min_bytes: usize,
}

impl HttpFetcher {
    /// Build a fetcher with the given per-request timeout and minimum
    /// acceptable body size.
    pub fn new(timeout: std::time::Duration, min_bytes: usize) -> anyhow::Result<Self> {
        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert(reqwest::header::ACCEPT, ACCEPT.parse()?);
        let http = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .default_headers(headers)
            .timeout(timeout)
            .build()?;
        Ok(Self { http, min_bytes })
    }
}

#[async_trait]
impl ImageFetcher for HttpFetcher {
    async fn fetch(&self, url: &str) -> anyhow::Result<Option<Vec<u8>>> {
        let res = self.http.get(url).send().await?;
        if res.status() != reqwest::StatusCode::OK {
            return Ok(None);
        }
        if let Some(len) = res.content_length() {
            if (len as usize) < self.min_bytes {
                return Ok(None);
            }
        }
        let body = res.bytes().await?;
        if body.len() < self.min_bytes {
            return Ok(None);
        }
        Ok(Some(body.to_vec()))
    }
}
