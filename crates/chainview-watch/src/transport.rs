use chainview_core::RawFrame;
use eventsource_stream::Eventsource;
use futures_util::stream::{BoxStream, StreamExt};
use reqwest::header::{ACCEPT, CACHE_CONTROL};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};
use url::Url;

const MAX_BODY_EXCERPT: usize = 512;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("http client setup failed: {0}")]
    Client(String),
    #[error("failed to connect to {url}: {message}")]
    Connect { url: String, message: String },
    #[error("stream handshake failed with status {status}")]
    Handshake { status: u16, body: String },
    #[error("stream read failed: {0}")]
    Stream(String),
    #[error("stream ended before the session completed")]
    UnexpectedEof,
}

impl TransportError {
    /// The most specific message available for reporting upstream.
    pub fn surfaced_message(&self) -> String {
        match self {
            TransportError::Handshake { status, body } => {
                let body = body.trim();
                if body.is_empty() {
                    format!("stream handshake failed with status {status}")
                } else {
                    format!("HTTP {status}: {}", excerpt(body))
                }
            }
            TransportError::Connect { message, .. } => message.clone(),
            other => other.to_string(),
        }
    }
}

pub type FrameStream = BoxStream<'static, Result<RawFrame, TransportError>>;

/// Opens server-sent event streams over HTTP.
#[derive(Clone)]
pub struct SseTransport {
    client: reqwest::Client,
}

impl SseTransport {
    pub fn new(connect_timeout: Duration) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .build()
            .map_err(|err| TransportError::Client(err.to_string()))?;
        Ok(Self { client })
    }

    pub async fn open(&self, url: &Url) -> Result<FrameStream, TransportError> {
        debug!("stream_open: {url}");
        let response = self
            .client
            .get(url.clone())
            .header(ACCEPT, "text/event-stream")
            .header(CACHE_CONTROL, "no-cache")
            .send()
            .await
            .map_err(|err| TransportError::Connect {
                url: url.to_string(),
                message: err.to_string(),
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(TransportError::Handshake {
                status: status.as_u16(),
                body,
            });
        }
        info!(status = status.as_u16(), "stream_opened: {url}");

        let frames = response.bytes_stream().eventsource().map(|event| match event {
            Ok(event) => Ok(RawFrame {
                event: Some(event.event).filter(|name| !name.trim().is_empty()),
                data: event.data,
                id: Some(event.id).filter(|id| !id.trim().is_empty()),
            }),
            Err(err) => Err(TransportError::Stream(err.to_string())),
        });
        Ok(frames.boxed())
    }
}

fn excerpt(text: &str) -> String {
    if text.chars().count() <= MAX_BODY_EXCERPT {
        return text.to_string();
    }
    let mut clipped = text.chars().take(MAX_BODY_EXCERPT).collect::<String>();
    clipped.push('…');
    clipped
}
