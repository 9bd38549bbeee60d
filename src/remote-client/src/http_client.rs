use async_trait::async_trait;
use fscache_lib::{CacheError, CacheResult};
use log::{debug, warn};
use reqwest::{header, Client, Response, StatusCode};
use serde_json::json;
use std::time::Duration;
use url::Url;

use crate::{RemoteStat, RemoteStore};

const GET_TIMEOUT: Duration = Duration::from_secs(30);
const PUT_TIMEOUT: Duration = Duration::from_secs(60);

const RETRY_BASE_DELAY: Duration = Duration::from_millis(100);
const RETRY_MAX_DELAY: Duration = Duration::from_secs(5);
const RETRY_ATTEMPTS: u32 = 5;

fn backoff_delay(attempt: u32) -> Duration {
    let delay = RETRY_BASE_DELAY.saturating_mul(1u32 << attempt.min(16));
    delay.min(RETRY_MAX_DELAY)
}

fn is_transient_status(status: StatusCode) -> bool {
    status.is_server_error()
}

/// HTTP client for the remote object store API.
///
/// Transient failures (timeout, connect error, 5xx) are retried with
/// exponential backoff; once the retry budget is spent they surface as
/// `NotReady`. 4xx responses fail immediately through the shared status
/// mapping.
pub struct HttpRemoteStore {
    base_url: String,
}

impl HttpRemoteStore {
    pub fn new(base_url: &str) -> CacheResult<Self> {
        let parsed = Url::parse(base_url).map_err(|e| {
            CacheError::InvalidParam(format!("invalid remote base url {}: {}", base_url, e))
        })?;
        Ok(Self {
            base_url: parsed.as_str().trim_end_matches('/').to_string(),
        })
    }

    fn build_http_client(timeout: Duration) -> CacheResult<Client> {
        Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| CacheError::Internal(format!("Failed to create client: {}", e)))
    }

    fn api_url(&self, endpoint: &str, path: &str) -> String {
        format!(
            "{}/api/{}/{}",
            self.base_url,
            endpoint,
            path.trim_start_matches('/')
        )
    }

    async fn send_with_retry<F>(&self, op: &str, url: &str, build: F) -> CacheResult<Response>
    where
        F: Fn() -> reqwest::RequestBuilder,
    {
        let mut last_err = String::new();
        for attempt in 0..RETRY_ATTEMPTS {
            if attempt > 0 {
                tokio::time::sleep(backoff_delay(attempt - 1)).await;
            }
            match build().send().await {
                Ok(res) => {
                    let status = res.status();
                    if is_transient_status(status) {
                        last_err = format!("HTTP {}", status);
                        warn!("{} {} failed ({}), attempt {}", op, url, status, attempt + 1);
                        continue;
                    }
                    if !status.is_success() {
                        return Err(CacheError::from_http_status(status, url.to_string()));
                    }
                    return Ok(res);
                }
                Err(e) if e.is_timeout() || e.is_connect() => {
                    last_err = e.to_string();
                    warn!("{} {} failed ({}), attempt {}", op, url, e, attempt + 1);
                }
                Err(e) => {
                    return Err(CacheError::RemoteError(format!(
                        "{} {} failed: {}",
                        op, url, e
                    )));
                }
            }
        }
        Err(CacheError::NotReady(format!(
            "{} {} failed after {} attempts: {}",
            op, url, RETRY_ATTEMPTS, last_err
        )))
    }
}

#[async_trait]
impl RemoteStore for HttpRemoteStore {
    async fn stat(&self, path: &str) -> CacheResult<RemoteStat> {
        let url = self.api_url("info", path);
        let client = Self::build_http_client(GET_TIMEOUT)?;
        let res = self.send_with_retry("stat", &url, || client.get(&url)).await?;
        res.json::<RemoteStat>()
            .await
            .map_err(|e| CacheError::RemoteError(format!("invalid stat body for {}: {}", url, e)))
    }

    async fn list(&self, path: &str) -> CacheResult<Vec<String>> {
        let url = self.api_url("list", path);
        let client = Self::build_http_client(GET_TIMEOUT)?;
        let res = self.send_with_retry("list", &url, || client.get(&url)).await?;
        res.json::<Vec<String>>()
            .await
            .map_err(|e| CacheError::RemoteError(format!("invalid list body for {}: {}", url, e)))
    }

    async fn fetch(&self, path: &str, offset: u64, len: u64) -> CacheResult<Vec<u8>> {
        if len == 0 {
            return Ok(Vec::new());
        }
        let url = self.api_url("data", path);
        let client = Self::build_http_client(GET_TIMEOUT)?;
        let range = format!("bytes={}-{}", offset, offset + len - 1);
        let res = self
            .send_with_retry("fetch", &url, || {
                client.get(&url).header(header::RANGE, range.clone())
            })
            .await?;
        let body = res
            .bytes()
            .await
            .map_err(|e| CacheError::RemoteError(format!("read body failed for {}: {}", url, e)))?;
        if body.len() as u64 != len {
            return Err(CacheError::VerifyError(format!(
                "short fetch for {} [{}, +{}): got {} bytes",
                path,
                offset,
                len,
                body.len()
            )));
        }
        debug!("fetched {} bytes at {} from {}", len, offset, path);
        Ok(body.to_vec())
    }

    async fn put_range(
        &self,
        path: &str,
        offset: u64,
        data: &[u8],
        total: u64,
    ) -> CacheResult<()> {
        let url = self.api_url("data", path);
        let client = Self::build_http_client(PUT_TIMEOUT)?;
        let content_range = if data.is_empty() {
            format!("bytes */{}", total)
        } else {
            format!("bytes {}-{}/{}", offset, offset + data.len() as u64 - 1, total)
        };
        let body = data.to_vec();
        self.send_with_retry("put_range", &url, || {
            client
                .put(&url)
                .header("Content-Type", "application/octet-stream")
                .header("Content-Range", content_range.clone())
                .body(body.clone())
        })
        .await?;
        debug!("put {} bytes at {} to {}", data.len(), offset, path);
        Ok(())
    }

    async fn put_object(&self, path: &str, data: &[u8]) -> CacheResult<()> {
        let url = self.api_url("data", path);
        let client = Self::build_http_client(PUT_TIMEOUT)?;
        let body = data.to_vec();
        self.send_with_retry("put_object", &url, || {
            client
                .put(&url)
                .header("Content-Type", "application/octet-stream")
                .body(body.clone())
        })
        .await?;
        Ok(())
    }

    async fn create(&self, path: &str, directory: bool) -> CacheResult<()> {
        let url = format!("{}?directory={}", self.api_url("create", path), directory);
        let client = Self::build_http_client(PUT_TIMEOUT)?;
        self.send_with_retry("create", &url, || client.post(&url)).await?;
        Ok(())
    }

    async fn rename(&self, old_path: &str, new_path: &str) -> CacheResult<()> {
        let url = format!("{}/api/rename", self.base_url);
        let client = Self::build_http_client(PUT_TIMEOUT)?;
        let body = json!({ "old_path": old_path, "new_path": new_path });
        self.send_with_retry("rename", &url, || client.post(&url).json(&body))
            .await?;
        Ok(())
    }

    async fn delete(&self, path: &str) -> CacheResult<()> {
        let url = self.api_url("delete", path);
        let client = Self::build_http_client(PUT_TIMEOUT)?;
        match self.send_with_retry("delete", &url, || client.delete(&url)).await {
            Ok(_) => Ok(()),
            // The local unlink already happened; a vanished remote object is
            // the desired end state.
            Err(err) if err.is_not_found() => Ok(()),
            Err(err) => Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_schedule() {
        assert_eq!(backoff_delay(0), Duration::from_millis(100));
        assert_eq!(backoff_delay(1), Duration::from_millis(200));
        assert_eq!(backoff_delay(2), Duration::from_millis(400));
        assert_eq!(backoff_delay(3), Duration::from_millis(800));
        // Capped no matter how far the schedule runs.
        assert_eq!(backoff_delay(10), RETRY_MAX_DELAY);
    }

    #[test]
    fn test_transient_statuses() {
        assert!(is_transient_status(StatusCode::INTERNAL_SERVER_ERROR));
        assert!(is_transient_status(StatusCode::SERVICE_UNAVAILABLE));
        assert!(!is_transient_status(StatusCode::NOT_FOUND));
        assert!(!is_transient_status(StatusCode::FORBIDDEN));
    }

    #[test]
    fn test_api_url_building() {
        let store = HttpRemoteStore::new("http://r/").unwrap();
        assert_eq!(store.api_url("data", "/a/b.txt"), "http://r/api/data/a/b.txt");
        assert_eq!(store.api_url("info", "a.txt"), "http://r/api/info/a.txt");
    }

    #[test]
    fn test_invalid_base_url_is_refused() {
        assert!(HttpRemoteStore::new("not a url").is_err());
    }
}
