//! Request issuing: turn a [`ChatRequest`] plus credentials into a byte
//! source over the streaming response body.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{Error, SourceError};
use crate::protocol::ChatRequest;
use crate::source::{BoxByteSource, ByteSource};

/// Capability for opening one streaming exchange.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Issue the request and return the response byte source, or raise on
    /// non-2xx / missing body. The token is wired into the source so a
    /// cancelled turn stops pulling and releases the connection.
    async fn connect(
        &self,
        request: &ChatRequest,
        cancel: CancellationToken,
    ) -> Result<BoxByteSource, Error>;
}

/// Connector configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ConnectorConfig {
    pub api_key: String,
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_timeout_secs() -> u64 {
    300
}

/// Request body on the wire: the caller's request plus `stream: true`.
#[derive(Serialize)]
struct StreamingBody<'a> {
    #[serde(flatten)]
    request: &'a ChatRequest,
    stream: bool,
}

/// reqwest-backed [`Connector`].
pub struct HttpConnector {
    client: reqwest::Client,
    config: ConnectorConfig,
}

impl HttpConnector {
    /// # Errors
    ///
    /// Returns [`Error::Transport`] when the HTTP client cannot be built.
    pub fn new(config: ConnectorConfig) -> Result<Self, Error> {
        let client = reqwest::Client::builder()
            .tcp_nodelay(true)
            .connect_timeout(Duration::from_secs(5))
            .redirect(reqwest::redirect::Policy::none())
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|err| Error::Transport(format!("Failed to build HTTP client: {err}")))?;
        Ok(Self { client, config })
    }

    fn completions_url(&self) -> String {
        format!(
            "{}/chat/completions",
            self.config.base_url.trim_end_matches('/')
        )
    }
}

#[async_trait]
impl Connector for HttpConnector {
    async fn connect(
        &self,
        request: &ChatRequest,
        cancel: CancellationToken,
    ) -> Result<BoxByteSource, Error> {
        let url = self.completions_url();
        debug!(model = %request.model, %url, "opening chat completions stream");

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.config.api_key)
            .json(&StreamingBody {
                request,
                stream: true,
            })
            .send()
            .await
            .map_err(|err| Error::Transport(format!("Request dispatch failed: {err}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Upstream(upstream_message(status.as_u16(), &body)));
        }

        Ok(Box::new(CancellableSource::new(
            response.bytes_stream().boxed(),
            cancel,
        )))
    }
}

/// Prefer the upstream's own `error.message` over a raw body excerpt.
fn upstream_message(status: u16, body: &str) -> String {
    #[derive(Deserialize)]
    struct Envelope {
        error: EnvelopeBody,
    }
    #[derive(Deserialize)]
    struct EnvelopeBody {
        message: String,
    }

    if let Ok(envelope) = serde_json::from_str::<Envelope>(body) {
        return format!("status {status}: {}", envelope.error.message);
    }
    let excerpt: String = body.chars().take(200).collect();
    format!("status {status}: {excerpt}")
}

/// Byte source over a chunk stream, raced against a cancellation token.
///
/// Cancellation surfaces as a read failure, which the frame decoder treats
/// as a benign end of stream. Dropping the source releases the connection.
pub struct CancellableSource<E> {
    stream: BoxStream<'static, Result<Bytes, E>>,
    cancel: CancellationToken,
}

impl<E> CancellableSource<E> {
    #[must_use]
    pub fn new(stream: BoxStream<'static, Result<Bytes, E>>, cancel: CancellationToken) -> Self {
        Self { stream, cancel }
    }
}

#[async_trait]
impl<E> ByteSource for CancellableSource<E>
where
    E: std::fmt::Display + Send,
{
    async fn pull(&mut self) -> Result<Option<Bytes>, SourceError> {
        tokio::select! {
            () = self.cancel.cancelled() => {
                Err(SourceError("pull cancelled".to_string()))
            }
            chunk = self.stream.next() => match chunk {
                Some(Ok(bytes)) => Ok(Some(bytes)),
                Some(Err(err)) => Err(SourceError(err.to_string())),
                None => Ok(None),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{ChatMessage, Role};

    #[test]
    fn test_config_defaults() {
        let config: ConnectorConfig = serde_json::from_str(r#"{"api_key":"sk-1"}"#).unwrap();
        assert_eq!(config.base_url, "https://api.openai.com/v1");
        assert_eq!(config.timeout_secs, 300);
    }

    #[test]
    fn test_completions_url_strips_trailing_slash() {
        let connector = HttpConnector::new(ConnectorConfig {
            api_key: "sk-1".to_string(),
            base_url: "http://localhost:8080/v1/".to_string(),
            timeout_secs: 30,
        })
        .unwrap();
        assert_eq!(
            connector.completions_url(),
            "http://localhost:8080/v1/chat/completions"
        );
    }

    #[test]
    fn test_streaming_body_forces_stream_true() {
        let request = ChatRequest {
            model: "gpt-4".to_string(),
            messages: vec![ChatMessage {
                role: Role::User,
                content: "Hello, World!".to_string(),
                name: None,
            }],
            functions: None,
        };
        let body = serde_json::to_value(StreamingBody {
            request: &request,
            stream: true,
        })
        .unwrap();
        assert_eq!(body["stream"], true);
        assert_eq!(body["model"], "gpt-4");
        assert_eq!(body["messages"][0]["content"], "Hello, World!");
    }

    #[test]
    fn test_upstream_message_prefers_envelope() {
        let body = r#"{"error":{"message":"Incorrect API key provided"}}"#;
        assert_eq!(
            upstream_message(401, body),
            "status 401: Incorrect API key provided"
        );
        assert_eq!(upstream_message(502, "Bad Gateway"), "status 502: Bad Gateway");
    }

    #[tokio::test]
    async fn test_cancellable_source_pulls_until_end() {
        let chunks = futures_util::stream::iter(vec![
            Ok::<Bytes, std::convert::Infallible>(Bytes::from_static(b"a")),
            Ok(Bytes::from_static(b"b")),
        ]);
        let mut source = CancellableSource::new(chunks.boxed(), CancellationToken::new());
        assert_eq!(source.pull().await.unwrap(), Some(Bytes::from_static(b"a")));
        assert_eq!(source.pull().await.unwrap(), Some(Bytes::from_static(b"b")));
        assert_eq!(source.pull().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_cancellable_source_cancelled_pull_is_a_read_failure() {
        let pending = futures_util::stream::pending::<Result<Bytes, std::convert::Infallible>>();
        let cancel = CancellationToken::new();
        let mut source = CancellableSource::new(pending.boxed(), cancel.clone());
        cancel.cancel();
        assert!(source.pull().await.is_err());
    }
}
