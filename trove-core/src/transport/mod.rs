//! Pluggable HTTP transport.
//!
//! The client never talks to `reqwest` directly; it builds a
//! [`StoreRequest`] and hands it to a [`Transport`]. Authentication beyond
//! basic credentials belongs to the transport implementation.

pub mod http;

use crate::Result;
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::Stream;
use futures_util::stream::{self, BoxStream, StreamExt};
use reqwest::Method;
use reqwest::header::HeaderMap;
use std::pin::Pin;

pub use http::HttpTransport;

/// Streaming response body.
pub type BodyStream = BoxStream<'static, std::io::Result<Bytes>>;

/// Streaming request body. `Sync` so it can be handed to `reqwest`.
pub type UploadStream = Pin<Box<dyn Stream<Item = std::io::Result<Bytes>> + Send + Sync>>;

pub enum RequestBody {
    Empty,
    Json(Bytes),
    Stream { stream: UploadStream, length: u64 },
}

impl RequestBody {
    pub fn bytes(data: Bytes) -> Self {
        let length = data.len() as u64;
        RequestBody::Stream {
            stream: Box::pin(stream::iter(std::iter::once(Ok(data)))),
            length,
        }
    }

    pub fn content_length(&self) -> Option<u64> {
        match self {
            RequestBody::Empty => Some(0),
            RequestBody::Json(data) => Some(data.len() as u64),
            RequestBody::Stream { length, .. } => Some(*length),
        }
    }
}

pub struct StoreRequest {
    pub method: Method,
    /// Absolute URL, already including the API version prefix and query.
    pub url: url::Url,
    pub headers: HeaderMap,
    pub body: RequestBody,
}

pub struct StoreResponse {
    pub status: u16,
    pub headers: HeaderMap,
    /// `None` when the server did not declare a length (chunked encoding).
    pub content_length: Option<u64>,
    pub body: BodyStream,
}

impl StoreResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(name)
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .filter(|value| !value.is_empty())
    }

    /// Drains the body into memory.
    pub async fn bytes(mut self) -> Result<Bytes> {
        let mut out = Vec::new();
        while let Some(chunk) = self.body.next().await {
            out.extend_from_slice(&chunk?);
        }
        Ok(Bytes::from(out))
    }
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Sends a request. Network failures are reported as
    /// `TroveError::Transport`; any HTTP status is a successful send.
    async fn send(&self, request: StoreRequest) -> Result<StoreResponse>;
}
