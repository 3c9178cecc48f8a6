use super::{RequestBody, StoreRequest, StoreResponse, Transport};
use crate::{Result, TroveError};
use async_trait::async_trait;
use futures_util::{StreamExt, TryStreamExt};
use reqwest::header::{CONTENT_LENGTH, HeaderMap};
use std::time::Duration;

/// `reqwest`-backed transport.
#[derive(Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new(timeout: Option<Duration>) -> Result<Self> {
        let mut builder = reqwest::Client::builder();
        if let Some(timeout) = timeout {
            builder = builder.timeout(timeout);
        }
        let client = builder
            .build()
            .map_err(|e| TroveError::Config(format!("cannot build http client: {}", e)))?;
        Ok(Self { client })
    }

    pub fn from_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, request: StoreRequest) -> Result<StoreResponse> {
        let StoreRequest {
            method,
            url,
            headers,
            body,
        } = request;

        let mut builder = self.client.request(method.clone(), url.clone()).headers(headers);
        builder = match body {
            RequestBody::Empty => builder,
            RequestBody::Json(data) => builder.body(data),
            RequestBody::Stream { stream, length } => builder
                .header(CONTENT_LENGTH, length)
                .body(reqwest::Body::wrap_stream(stream)),
        };

        let response = builder
            .send()
            .await
            .map_err(|e| TroveError::transport(format!("{} {}", method, url.path()), e))?;

        let status = response.status().as_u16();
        let headers = response.headers().clone();
        let content_length = declared_length(&headers);
        let body = response
            .bytes_stream()
            .map_err(std::io::Error::other)
            .boxed();

        Ok(StoreResponse {
            status,
            headers,
            content_length,
            body,
        })
    }
}

/// The `Content-Length` the server declared. Negative or malformed values
/// count as unknown.
fn declared_length(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(CONTENT_LENGTH)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse::<u64>().ok())
}
