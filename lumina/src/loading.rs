//! Data loading capability: the byte-stream interface the pipeline consumes
//! and the default `reqwest`-backed implementation.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::StreamExt;
use futures::stream::BoxStream;
use url::Url;

use crate::error::DataLoadError;

/// Cache behaviour requested from the underlying HTTP layer. Part of the
/// data-load coalescing key: requests with different policies must not share
/// a download.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum RequestCachePolicy {
    #[default]
    UseProtocolCachePolicy,
    ReloadIgnoringCacheData,
}

/// A pre-built outgoing request.
#[derive(Debug, Clone, PartialEq)]
pub struct DataRequest {
    pub url: Url,
    pub headers: Vec<(String, String)>,
    pub timeout: Option<Duration>,
    pub cache_policy: RequestCachePolicy,
    pub allows_cellular_access: bool,
}

impl DataRequest {
    pub fn new(url: Url) -> Self {
        Self {
            url,
            headers: Vec::new(),
            timeout: None,
            cache_policy: RequestCachePolicy::default(),
            allows_cellular_access: true,
        }
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Response freshness validator used to resume interrupted downloads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Validator {
    ETag(String),
    LastModified(String),
}

impl Validator {
    /// Value placed in the `If-Range` header of a resumed request.
    pub fn if_range_value(&self) -> &str {
        match self {
            Validator::ETag(value) => value,
            Validator::LastModified(value) => value,
        }
    }
}

/// Metadata of the response a byte stream belongs to. Delivered with the
/// first chunk of the stream.
#[derive(Debug, Clone, PartialEq)]
pub struct UrlResponseInfo {
    pub url: Url,
    pub status_code: u16,
    /// `Content-Length` of this response, when the server sent one.
    pub expected_content_length: Option<u64>,
    pub validator: Option<Validator>,
}

impl UrlResponseInfo {
    /// True when the server honoured a range request (HTTP 206), meaning
    /// previously retained bytes may be prepended.
    pub fn accepted_range(&self) -> bool {
        self.status_code == 206
    }
}

/// One element of a data stream: a chunk of bytes plus, on the first chunk,
/// the response metadata.
#[derive(Debug, Clone)]
pub struct DataChunk {
    pub data: Bytes,
    pub response: Option<UrlResponseInfo>,
}

/// Ordered stream of chunks ending exactly once: `None` on success, an error
/// item on failure. Dropping the stream cancels the underlying transfer.
pub type DataStream = BoxStream<'static, Result<DataChunk, DataLoadError>>;

/// Capability the pipeline uses to fetch raw bytes.
pub trait DataLoading: Send + Sync {
    fn load(&self, request: &DataRequest) -> DataStream;
}

/// User-supplied asynchronous byte producer, usable in place of a URL.
#[derive(Clone)]
pub struct DataPublisher {
    /// Stable identifier standing in for the URL in cache fingerprints.
    pub id: String,
    make: Arc<dyn Fn() -> DataStream + Send + Sync>,
}

impl DataPublisher {
    pub fn new(id: impl Into<String>, make: impl Fn() -> DataStream + Send + Sync + 'static) -> Self {
        Self {
            id: id.into(),
            make: Arc::new(make),
        }
    }

    pub(crate) fn open(&self) -> DataStream {
        (self.make)()
    }
}

impl fmt::Debug for DataPublisher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataPublisher").field("id", &self.id).finish()
    }
}

/// Default data loader backed by a pooled `reqwest` client with streaming
/// bodies.
#[derive(Debug, Clone)]
pub struct UrlSessionDataLoader {
    client: reqwest::Client,
}

impl UrlSessionDataLoader {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }

    /// Use a custom-configured client (pool sizes, proxies, timeouts).
    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

impl Default for UrlSessionDataLoader {
    fn default() -> Self {
        Self::new()
    }
}

impl DataLoading for UrlSessionDataLoader {
    fn load(&self, request: &DataRequest) -> DataStream {
        let client = self.client.clone();
        let request = request.clone();
        Box::pin(async_stream::stream! {
            let mut builder = client.get(request.url.clone());
            for (name, value) in &request.headers {
                builder = builder.header(name.as_str(), value.as_str());
            }
            if request.cache_policy == RequestCachePolicy::ReloadIgnoringCacheData {
                builder = builder.header("Cache-Control", "no-cache");
            }
            if let Some(timeout) = request.timeout {
                builder = builder.timeout(timeout);
            }

            let response = match builder.send().await {
                Ok(response) => response,
                Err(err) => {
                    yield Err(DataLoadError::Transport(err));
                    return;
                }
            };

            let status = response.status();
            if !status.is_success() {
                yield Err(DataLoadError::Status(status.as_u16()));
                return;
            }

            let validator = header_value(&response, "etag")
                .map(Validator::ETag)
                .or_else(|| header_value(&response, "last-modified").map(Validator::LastModified));
            let mut info = Some(UrlResponseInfo {
                url: request.url.clone(),
                status_code: status.as_u16(),
                expected_content_length: response.content_length(),
                validator,
            });

            let mut body = response.bytes_stream();
            while let Some(chunk) = body.next().await {
                match chunk {
                    Ok(data) => yield Ok(DataChunk { data, response: info.take() }),
                    Err(err) => {
                        yield Err(DataLoadError::Transport(err));
                        return;
                    }
                }
            }
        })
    }
}

fn header_value(response: &reqwest::Response, name: &str) -> Option<String> {
    response
        .headers()
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validator_if_range_values() {
        assert_eq!(Validator::ETag("\"abc\"".into()).if_range_value(), "\"abc\"");
        assert_eq!(
            Validator::LastModified("Tue, 01 Jan 2036 00:00:00 GMT".into()).if_range_value(),
            "Tue, 01 Jan 2036 00:00:00 GMT"
        );
    }

    #[test]
    fn partial_content_accepts_range() {
        let info = UrlResponseInfo {
            url: Url::parse("https://example.com/a.jpg").unwrap(),
            status_code: 206,
            expected_content_length: Some(700),
            validator: None,
        };
        assert!(info.accepted_range());
        assert!(
            !UrlResponseInfo {
                status_code: 200,
                ..info
            }
            .accepted_range()
        );
    }
}
