//! Shared HTTP plumbing: bounded redirect-following for blob fetches,
//! response error mapping, and the digest-verifying byte stream.

use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use futures_util::stream::{BoxStream, Stream, StreamExt};
use reqwest::header::{AUTHORIZATION, LOCATION, USER_AGENT};
use reqwest::{Client, Method, Response, StatusCode};
use serde::Deserialize;
use tracing::trace;
use url::Url;

use crate::digest::Digest;
use crate::error::{RegistryError, Result};

/// Hop bound for blob redirect-following. Never configurable: an unbounded
/// redirect chain is a server misbehavior, not a client option.
pub(crate) const MAX_REDIRECTS: u32 = 3;

/// Captured status/headers of one response in a redirect chain.
///
/// The first entry is authoritative for `Docker-Content-Digest`; the last
/// one for payload headers (`Content-Length`, `Content-Type`).
#[derive(Debug, Clone)]
pub struct ResponseInfo {
    pub status: u16,
    pub url: String,
    pub headers: reqwest::header::HeaderMap,
}

impl ResponseInfo {
    pub(crate) fn from_response(response: &Response) -> Self {
        Self {
            status: response.status().as_u16(),
            url: response.url().to_string(),
            headers: response.headers().clone(),
        }
    }

    /// Header value as a string, if present and valid UTF-8.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    pub fn content_length(&self) -> Option<u64> {
        self.header("content-length").and_then(|v| v.parse().ok())
    }
}

fn host_key(url: &Url) -> (Option<String>, Option<u16>) {
    (
        url.host_str().map(|h| h.to_string()),
        url.port_or_known_default(),
    )
}

/// Issue `method` against `start`, following up to [`MAX_REDIRECTS`]
/// 302/307 responses. Registry auth headers are only attached when the
/// request target shares the original host; they are never forwarded to
/// offloaded storage on another host.
pub(crate) async fn follow_redirects(
    client: &Client,
    method: Method,
    start: Url,
    auth_header: Option<&str>,
    user_agent: &str,
) -> Result<(Response, Vec<ResponseInfo>)> {
    let origin = host_key(&start);
    let mut url = start.clone();
    let mut chain = Vec::new();
    let mut redirects = 0u32;

    loop {
        let mut request = client
            .request(method.clone(), url.clone())
            .header(USER_AGENT, user_agent);
        if let Some(header) = auth_header {
            if host_key(&url) == origin {
                request = request.header(AUTHORIZATION, header);
            }
        }

        let response = request.send().await?;
        chain.push(ResponseInfo::from_response(&response));
        let status = response.status();

        if status == StatusCode::FOUND || status == StatusCode::TEMPORARY_REDIRECT {
            redirects += 1;
            if redirects > MAX_REDIRECTS {
                return Err(RegistryError::TooManyRedirects {
                    limit: MAX_REDIRECTS,
                    url: start.to_string(),
                });
            }
            let location = response
                .headers()
                .get(LOCATION)
                .and_then(|v| v.to_str().ok())
                .ok_or_else(|| {
                    RegistryError::InvalidContent(format!(
                        "redirect response from {url} is missing a Location header"
                    ))
                })?;
            let next = url.join(location)?;
            trace!(from = %url, to = %next, redirects, "following blob redirect");
            url = next;
            continue;
        }

        if !status.is_success() {
            return Err(error_from_response(response).await);
        }
        return Ok((response, chain));
    }
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    errors: Option<Vec<ApiError>>,
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    code: Option<String>,
    message: Option<String>,
}

fn clip(text: &str, max: usize) -> String {
    let text = text.trim();
    if text.len() <= max {
        return text.to_string();
    }
    let mut end = max;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}…", &text[..end])
}

/// Map a non-success response to an error, preserving which taxonomy
/// category applies and where the request went.
///
/// Registries answer 404s for some endpoints with large HTML dumps; those
/// are normalized to a plain "not found" instead of leaking the page into
/// the error message.
pub(crate) async fn error_from_response(response: Response) -> RegistryError {
    let status = response.status();
    let url = response.url().to_string();
    let json = response
        .headers()
        .get("content-type")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.split(';').next().unwrap_or(v).trim() == "application/json")
        .unwrap_or(false);
    let body = response.text().await.unwrap_or_default();

    let message = if json {
        match serde_json::from_str::<ApiErrorBody>(&body) {
            Ok(parsed) => {
                if let Some(errors) = parsed.errors {
                    errors
                        .iter()
                        .map(|e| match (&e.code, &e.message) {
                            (Some(code), Some(message)) => format!("{code}: {message}"),
                            (_, Some(message)) => message.clone(),
                            (Some(code), _) => code.clone(),
                            _ => "unknown error".to_string(),
                        })
                        .collect::<Vec<_>>()
                        .join("; ")
                } else if let Some(error) = parsed.error {
                    error
                } else {
                    clip(&body, 200)
                }
            }
            Err(_) => clip(&body, 200),
        }
    } else if status == StatusCode::NOT_FOUND {
        "not found".to_string()
    } else {
        clip(&body, 200)
    };

    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            RegistryError::Authentication(format!("{url}: {message}"))
        }
        StatusCode::NOT_FOUND => RegistryError::NotFound(format!("{url}: {message}")),
        _ => RegistryError::UnexpectedStatus {
            status: status.as_u16(),
            url,
            message,
        },
    }
}

/// A blob byte stream that hashes every chunk and verifies byte count and
/// digest once the underlying stream ends.
///
/// Mismatches surface as the stream's final item, because they are only
/// knowable after the consumer has already received the bytes; consumers
/// must treat a stream error as fatal even when earlier chunks were
/// written downstream.
pub struct BlobStream {
    inner: BoxStream<'static, Result<Bytes>>,
    hasher: Option<crate::digest::DigestHasher>,
    expected: Digest,
    expected_len: Option<u64>,
    received: u64,
    done: bool,
}

impl BlobStream {
    pub(crate) fn new(
        inner: BoxStream<'static, Result<Bytes>>,
        expected: Digest,
        expected_len: Option<u64>,
    ) -> Self {
        let hasher = Some(expected.hasher());
        Self {
            inner,
            hasher,
            expected,
            expected_len,
            received: 0,
            done: false,
        }
    }

    /// Total bytes seen so far.
    pub fn bytes_received(&self) -> u64 {
        self.received
    }

    fn finish(&mut self) -> Result<()> {
        if let Some(expected) = self.expected_len {
            if self.received != expected {
                return Err(RegistryError::Download(format!(
                    "unexpected downloaded size: expected {expected} bytes, downloaded {} bytes",
                    self.received
                )));
            }
        }
        if let Some(hasher) = self.hasher.take() {
            let computed = hasher.finalize_hex();
            if computed != self.expected.hex() {
                return Err(RegistryError::BadDigest(format!(
                    "expected {}, downloaded content hashed to {}:{computed}",
                    self.expected,
                    self.expected.algorithm()
                )));
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for BlobStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlobStream")
            .field("expected", &self.expected)
            .field("expected_len", &self.expected_len)
            .field("received", &self.received)
            .field("done", &self.done)
            .finish_non_exhaustive()
    }
}

impl Stream for BlobStream {
    type Item = Result<Bytes>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.done {
            return Poll::Ready(None);
        }
        match this.inner.poll_next_unpin(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Some(Ok(chunk))) => {
                this.received += chunk.len() as u64;
                if let Some(hasher) = this.hasher.as_mut() {
                    hasher.update(&chunk);
                }
                Poll::Ready(Some(Ok(chunk)))
            }
            Poll::Ready(Some(Err(err))) => {
                this.done = true;
                Poll::Ready(Some(Err(err)))
            }
            Poll::Ready(None) => {
                this.done = true;
                match this.finish() {
                    Ok(()) => Poll::Ready(None),
                    Err(err) => Poll::Ready(Some(Err(err))),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::digest::sha256_digest;
    use futures_util::stream;

    fn chunked(parts: &[&'static [u8]]) -> BoxStream<'static, Result<Bytes>> {
        stream::iter(
            parts
                .iter()
                .map(|p| Ok(Bytes::from_static(p)))
                .collect::<Vec<_>>(),
        )
        .boxed()
    }

    async fn drain(mut stream: BlobStream) -> (Vec<u8>, Option<RegistryError>) {
        let mut bytes = Vec::new();
        while let Some(item) = stream.next().await {
            match item {
                Ok(chunk) => bytes.extend_from_slice(&chunk),
                Err(err) => return (bytes, Some(err)),
            }
        }
        (bytes, None)
    }

    #[tokio::test]
    async fn test_blob_stream_accepts_matching_content() {
        let expected = Digest::parse(&sha256_digest(b"hello world")).unwrap();
        let stream = BlobStream::new(chunked(&[b"hello ", b"world"]), expected, Some(11));
        let (bytes, err) = drain(stream).await;
        assert_eq!(bytes, b"hello world");
        assert!(err.is_none());
    }

    #[tokio::test]
    async fn test_blob_stream_flags_short_read_even_with_matching_digest() {
        let expected = Digest::parse(&sha256_digest(b"hello world")).unwrap();
        let stream = BlobStream::new(chunked(&[b"hello ", b"world"]), expected, Some(100));
        let (bytes, err) = drain(stream).await;
        assert_eq!(bytes, b"hello world");
        assert!(matches!(err, Some(RegistryError::Download(_))));
    }

    #[tokio::test]
    async fn test_blob_stream_flags_digest_mismatch_with_matching_length() {
        let expected = Digest::parse(&sha256_digest(b"other bytes")).unwrap();
        let stream = BlobStream::new(chunked(&[b"hello world"]), expected, Some(11));
        let (_, err) = drain(stream).await;
        assert!(matches!(err, Some(RegistryError::BadDigest(_))));
    }

    #[tokio::test]
    async fn test_blob_stream_without_content_length_still_checks_digest() {
        let expected = Digest::parse(&sha256_digest(b"hello world")).unwrap();
        let stream = BlobStream::new(chunked(&[b"hello world"]), expected, None);
        let (_, err) = drain(stream).await;
        assert!(err.is_none());
    }
}
