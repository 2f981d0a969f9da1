use log::{debug, warn};
use reqwest::{Client, Method, StatusCode, Url};
use rofs_models::{BackendError, RemoteBackend, RemoteInfo, WriteRun};
use std::str::FromStr;
use std::time::Duration;
use tokio::runtime::Runtime;

pub mod stub;

const GET_DEADLINE: Duration = Duration::from_secs(30);
const PUT_DEADLINE: Duration = Duration::from_secs(60);

// Exponential backoff for transient failures (timeout or 5xx).
const RETRY_ATTEMPTS: u32 = 5;
const BACKOFF_BASE: Duration = Duration::from_millis(100);
const BACKOFF_CAP: Duration = Duration::from_secs(5);

pub struct HttpBackend {
    runtime: Runtime, // from tokio, drives the async client behind a blocking facade
    base_url: Url,
    client: Client,
}

fn status_error(status: StatusCode, path: &str) -> BackendError {
    match status {
        StatusCode::NOT_FOUND => BackendError::NotFound(path.to_string()),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => BackendError::Unauthorized,
        StatusCode::CONFLICT => BackendError::Conflict(path.to_string()),
        s if s.is_server_error() => BackendError::Transient(format!("status {} for {}", s, path)),
        s => BackendError::Fatal(format!("status {} for {}", s, path)),
    }
}

fn request_error(e: reqwest::Error) -> BackendError {
    if e.is_timeout() {
        BackendError::Transient(format!("timeout: {}", e))
    } else {
        BackendError::Fatal(e.to_string())
    }
}

/// Retries `op` on transient errors with exponential backoff. Anything else
/// fails through immediately.
fn with_retry<T>(what: &str, mut op: impl FnMut() -> Result<T, BackendError>) -> Result<T, BackendError> {
    let mut delay = BACKOFF_BASE;
    let mut last = None;
    for attempt in 1..=RETRY_ATTEMPTS {
        match op() {
            Ok(v) => return Ok(v),
            Err(e @ BackendError::Transient(_)) => {
                warn!("{}: attempt {}/{} failed: {}", what, attempt, RETRY_ATTEMPTS, e);
                last = Some(e);
                if attempt < RETRY_ATTEMPTS {
                    std::thread::sleep(delay);
                    delay = (delay * 2).min(BACKOFF_CAP);
                }
            }
            Err(e) => return Err(e),
        }
    }
    Err(last.expect("retry loop ran at least once"))
}

impl HttpBackend {
    pub fn new(base_url: String) -> Result<Self, BackendError> {
        let client = Client::builder()
            .build()
            .map_err(|e| BackendError::Fatal(format!("unable to build the HTTP client: {}", e)))?;
        let base_url = Url::from_str(&base_url)
            .map_err(|e| BackendError::Fatal(format!("bad remote base url: {}", e)))?;
        let runtime = Runtime::new()
            .map_err(|e| BackendError::Fatal(format!("unable to build a Runtime object: {}", e)))?;
        Ok(Self { runtime, base_url, client })
    }

    fn endpoint(&self, prefix: &str, path: &str) -> Result<Url, BackendError> {
        self.base_url
            .join(&format!("{}/{}", prefix, path.trim_start_matches('/')))
            .map_err(|e| BackendError::Fatal(e.to_string()))
    }

    fn send(&self, req: reqwest::RequestBuilder, path: &str) -> Result<reqwest::Response, BackendError> {
        let resp = self
            .runtime
            .block_on(async { req.send().await })
            .map_err(request_error)?;
        if resp.status().is_success() {
            Ok(resp)
        } else {
            Err(status_error(resp.status(), path))
        }
    }
}

impl RemoteBackend for HttpBackend {
    fn info(&self, path: &str) -> Result<RemoteInfo, BackendError> {
        let url = self.endpoint("api/info", path)?;
        with_retry("info", || {
            let resp = self.send(self.client.get(url.clone()).timeout(GET_DEADLINE), path)?;
            self.runtime
                .block_on(async { resp.json::<RemoteInfo>().await })
                .map_err(|e| BackendError::Fatal(format!("bad info body: {}", e)))
        })
    }

    fn list(&self, path: &str) -> Result<Vec<String>, BackendError> {
        let url = self.endpoint("api/list", path)?;
        with_retry("list", || {
            let resp = self.send(self.client.get(url.clone()).timeout(GET_DEADLINE), path)?;
            self.runtime
                .block_on(async { resp.json::<Vec<String>>().await })
                .map_err(|e| BackendError::Fatal(format!("bad list body: {}", e)))
        })
    }

    fn fetch(&self, path: &str, offset: u64, length: u64) -> Result<Vec<u8>, BackendError> {
        let url = self.endpoint("api/data", path)?;
        // Range end is inclusive
        let range = format!("bytes={}-{}", offset, offset + length.saturating_sub(1));
        with_retry("fetch", || {
            let req = self
                .client
                .get(url.clone())
                .header(reqwest::header::RANGE, range.clone())
                .timeout(GET_DEADLINE);
            let resp = self.send(req, path)?;
            let body: bytes::Bytes = self
                .runtime
                .block_on(async { resp.bytes().await })
                .map_err(request_error)?;
            if body.len() as u64 != length {
                // short or long answer: discard, the caller must not trust it
                return Err(BackendError::Integrity { expected: length, got: body.len() as u64 });
            }
            debug!("fetched {} bytes at {} from {}", length, offset, path);
            Ok(body.to_vec())
        })
    }

    fn flush(&self, path: &str, size: u64, runs: &[WriteRun]) -> Result<(), BackendError> {
        let url = self.endpoint("api/data", path)?;
        if runs.is_empty() {
            // the object shrank to nothing and no data run carries the new
            // size: a whole-object PUT with an empty body replaces it
            return with_retry("flush", || {
                let req = self.client.put(url.clone()).body(Vec::new()).timeout(PUT_DEADLINE);
                self.send(req, path).map(|_| ())
            });
        }
        for run in runs {
            let end = run.offset + run.data.len() as u64;
            let content_range = format!("bytes {}-{}/{}", run.offset, end.saturating_sub(1), size);
            with_retry("flush", || {
                let req = self
                    .client
                    .put(url.clone())
                    .header(reqwest::header::CONTENT_RANGE, content_range.clone())
                    .body(run.data.clone())
                    .timeout(PUT_DEADLINE);
                self.send(req, path).map(|_| ())
            })?;
            debug!("flushed {} bytes at {} to {}", run.data.len(), run.offset, path);
        }
        Ok(())
    }

    fn create(&self, path: &str, directory: bool) -> Result<(), BackendError> {
        let mut url = self.endpoint("api/create", path)?;
        url.query_pairs_mut().append_pair("directory", if directory { "true" } else { "false" });
        with_retry("create", || self.send(self.client.request(Method::POST, url.clone()).timeout(PUT_DEADLINE), path).map(|_| ()))
    }

    fn rename(&self, old_path: &str, new_path: &str) -> Result<(), BackendError> {
        let url = self
            .base_url
            .join("api/rename")
            .map_err(|e| BackendError::Fatal(e.to_string()))?;
        let body = serde_json::json!({ "old_path": old_path, "new_path": new_path });
        with_retry("rename", || {
            let req = self.client.post(url.clone()).json(&body).timeout(PUT_DEADLINE);
            self.send(req, old_path).map(|_| ())
        })
    }

    fn delete(&self, path: &str) -> Result<(), BackendError> {
        let url = self.endpoint("api/delete", path)?;
        with_retry("delete", || self.send(self.client.delete(url.clone()).timeout(PUT_DEADLINE), path).map(|_| ()))
    }
}
