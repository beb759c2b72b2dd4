//! HTTP access to package registries.
//!
//! Verifiers talk to registries only through [`Transport`], so tests can
//! substitute canned responses and the CLI can share one connection pool
//! between every verifier.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;

use crate::error::{ProvenanceError, Result};
use crate::sigstore::DigestAlgorithm;

/// Accept header for the JSON form of the PyPI Simple API (PEP 691).
pub const PYPI_SIMPLE_JSON: &str = "application/vnd.pypi.simple.v1+json";

/// Longest error body kept in `HttpStatus` errors.
const MAX_ERROR_BODY: usize = 512;

/// Deserialize `null` as the type's default. Registries send `null` for
/// absent fields as often as they omit them.
pub(crate) fn null_as_default<'de, D, T>(deserializer: D) -> std::result::Result<T, D::Error>
where
    D: serde::Deserializer<'de>,
    T: Default + serde::Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// GET `url` and return the full body. Non-2xx responses are errors.
    async fn get(
        &self,
        url: &str,
        accept: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<Vec<u8>>;

    /// Download `url` and return its digest.
    async fn digest(
        &self,
        url: &str,
        algorithm: DigestAlgorithm,
        cancel: &CancellationToken,
    ) -> Result<Vec<u8>> {
        let body = self.get(url, None, cancel).await?;
        Ok(algorithm.digest(&body))
    }
}

/// `reqwest`-backed transport with a client-wide timeout.
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new(timeout: Duration, user_agent: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(user_agent)
            .build()
            .map_err(|e| ProvenanceError::Config(format!("failed to create HTTP client: {e}")))?;
        Ok(Self { client })
    }

    async fn send(
        &self,
        url: &str,
        accept: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<reqwest::Response> {
        let mut request = self.client.get(url);
        if let Some(accept) = accept {
            request = request.header(reqwest::header::ACCEPT, accept);
        }

        tracing::debug!(url, "GET");
        let response = tokio::select! {
            _ = cancel.cancelled() => return Err(ProvenanceError::Cancelled),
            response = request.send() => response.map_err(|e| classify(url, e))?,
        };

        let status = response.status();
        if !status.is_success() {
            let body = tokio::select! {
                _ = cancel.cancelled() => return Err(ProvenanceError::Cancelled),
                body = response.text() => body.unwrap_or_default(),
            };
            return Err(ProvenanceError::HttpStatus {
                url: url.to_string(),
                status: status.as_u16(),
                body: truncate(body),
            });
        }
        Ok(response)
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn get(
        &self,
        url: &str,
        accept: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<Vec<u8>> {
        let response = self.send(url, accept, cancel).await?;
        let body = tokio::select! {
            _ = cancel.cancelled() => return Err(ProvenanceError::Cancelled),
            body = response.bytes() => body.map_err(|e| classify(url, e))?,
        };
        Ok(body.to_vec())
    }

    /// Streams the body through the hasher instead of buffering it.
    async fn digest(
        &self,
        url: &str,
        algorithm: DigestAlgorithm,
        cancel: &CancellationToken,
    ) -> Result<Vec<u8>> {
        let mut response = self.send(url, None, cancel).await?;
        let mut hasher = algorithm.hasher();
        loop {
            let chunk = tokio::select! {
                _ = cancel.cancelled() => return Err(ProvenanceError::Cancelled),
                chunk = response.chunk() => chunk.map_err(|e| classify(url, e))?,
            };
            match chunk {
                Some(bytes) => hasher.update(&bytes),
                None => break,
            }
        }
        Ok(hasher.finalize())
    }
}

fn classify(url: &str, err: reqwest::Error) -> ProvenanceError {
    if err.is_timeout() {
        ProvenanceError::Timeout {
            url: url.to_string(),
        }
    } else {
        ProvenanceError::Http {
            url: url.to_string(),
            source: err,
        }
    }
}

fn truncate(mut body: String) -> String {
    if body.len() > MAX_ERROR_BODY {
        let mut end = MAX_ERROR_BODY;
        while !body.is_char_boundary(end) {
            end -= 1;
        }
        body.truncate(end);
        body.push_str("...");
    }
    body
}


#[cfg(test)]
mod tests {
    use super::fake::FakeTransport;
    use super::*;

    #[test]
    fn truncates_long_bodies_on_char_boundary() {
        let body = "é".repeat(MAX_ERROR_BODY);
        let truncated = truncate(body);
        assert!(truncated.ends_with("..."));
        assert!(truncated.len() <= MAX_ERROR_BODY + 3);
        assert_eq!(truncate("short".to_string()), "short");
    }

    #[tokio::test]
    async fn default_digest_hashes_body() {
        let transport = FakeTransport::new().with_body("https://x/a.tgz", b"abc".to_vec());
        let digest = transport
            .digest("https://x/a.tgz", DigestAlgorithm::Sha256, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(digest, DigestAlgorithm::Sha256.digest(b"abc"));
    }

    #[tokio::test]
    async fn cancelled_token_short_circuits() {
        let transport = FakeTransport::new().with_body("https://x/a", b"abc".to_vec());
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = transport.get("https://x/a", None, &cancel).await.unwrap_err();
        assert!(matches!(err, ProvenanceError::Cancelled));
    }

    #[test]
    fn builds_http_client() {
        assert!(HttpTransport::new(Duration::from_secs(5), "dockhand-test").is_ok());
    }

    #[tokio::test]
    async fn cancel_interrupts_stalled_error_body() {
        use std::io::{Read, Write};

        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        std::thread::spawn(move || {
            if let Ok((mut stream, _)) = listener.accept() {
                let mut request = [0u8; 1024];
                let _ = stream.read(&mut request);
                let _ = stream.write_all(
                    b"HTTP/1.1 503 Service Unavailable\r\nContent-Length: 4096\r\n\r\npartial",
                );
                let _ = stream.flush();
                // Hold the connection open with the body unfinished.
                std::thread::sleep(Duration::from_secs(10));
            }
        });

        let transport = HttpTransport::new(Duration::from_secs(60), "dockhand-test").unwrap();
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            trigger.cancel();
        });

        let url = format!("http://{addr}/stalled");
        let result = tokio::time::timeout(
            Duration::from_secs(5),
            transport.get(&url, None, &cancel),
        )
        .await
        .expect("cancellation did not interrupt the error body read");
        assert!(matches!(result, Err(ProvenanceError::Cancelled)));
    }
}
