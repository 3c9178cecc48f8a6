//! Store client: request construction and structured error decoding.

use crate::channel::Channel;
use crate::params::{API_VERSION, ErrorCode, ErrorResponse};
use crate::transport::{HttpTransport, RequestBody, StoreRequest, StoreResponse, Transport};
use crate::{Result, TroveError};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use bytes::Bytes;
use reqwest::Method;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, HeaderMap, HeaderName, HeaderValue};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::sync::Arc;
use std::time::Duration;

/// Location of the public store.
pub const DEFAULT_STORE_URL: &str = "https://api.jujucharms.com/charmstore";

/// Payloads at least this large are uploaded in multiple parts.
pub const DEFAULT_MIN_MULTIPART_UPLOAD_SIZE: u64 = 5 * 1024 * 1024;

const ERROR_EXCERPT_LIMIT: usize = 1024;

#[derive(Clone, Default)]
pub struct StoreClientBuilder {
    url: Option<String>,
    user: Option<String>,
    password: Option<String>,
    headers: Vec<(String, String)>,
    channel: Option<Channel>,
    stats_disabled: bool,
    min_multipart_upload_size: Option<u64>,
    timeout: Option<Duration>,
    transport: Option<Arc<dyn Transport>>,
}

impl StoreClientBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    pub fn user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }

    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn channel(mut self, channel: Channel) -> Self {
        self.channel = Some(channel);
        self
    }

    pub fn disable_stats(mut self) -> Self {
        self.stats_disabled = true;
        self
    }

    pub fn min_multipart_upload_size(mut self, size: u64) -> Self {
        self.min_multipart_upload_size = Some(size);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Replaces the default `reqwest` transport.
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    fn resolve_url(&self) -> Result<String> {
        let raw = self
            .url
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .unwrap_or(DEFAULT_STORE_URL)
            .trim_end_matches('/')
            .to_string();

        let parsed = url::Url::parse(&raw)
            .map_err(|e| TroveError::Config(format!("invalid store url {:?}: {}", raw, e)))?;
        if parsed.scheme() != "http" && parsed.scheme() != "https" {
            return Err(TroveError::Config(format!(
                "unsupported store url scheme '{}': expected http | https",
                parsed.scheme()
            )));
        }

        Ok(raw)
    }

    fn resolve_headers(&self) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();
        for (name, value) in &self.headers {
            let name = HeaderName::from_bytes(name.trim().as_bytes())
                .map_err(|e| TroveError::Config(format!("invalid header name {:?}: {}", name, e)))?;
            let value = HeaderValue::from_str(value.trim())
                .map_err(|e| TroveError::Config(format!("invalid value for header {}: {}", name, e)))?;
            headers.append(name, value);
        }
        Ok(headers)
    }

    pub fn build(&self) -> Result<StoreClient> {
        let url = self.resolve_url()?;
        let headers = self.resolve_headers()?;

        let user = self
            .user
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(str::to_string);
        if user.is_none() && self.password.is_some() {
            return Err(TroveError::Config(
                "store password given without a user".to_string(),
            ));
        }

        let min_multipart_upload_size = self
            .min_multipart_upload_size
            .unwrap_or(DEFAULT_MIN_MULTIPART_UPLOAD_SIZE);
        if min_multipart_upload_size == 0 {
            return Err(TroveError::Config(
                "multipart upload threshold must be positive".to_string(),
            ));
        }

        let transport = match &self.transport {
            Some(transport) => transport.clone(),
            None => Arc::new(HttpTransport::new(self.timeout)?),
        };

        Ok(StoreClient {
            url,
            user,
            password: self.password.clone().unwrap_or_default(),
            headers,
            channel: self.channel,
            stats_disabled: self.stats_disabled,
            min_multipart_upload_size,
            transport,
        })
    }
}

/// Client for the store HTTP API.
///
/// Cloning is cheap; clones share the transport.
#[derive(Clone)]
pub struct StoreClient {
    url: String,
    user: Option<String>,
    password: String,
    headers: HeaderMap,
    channel: Option<Channel>,
    stats_disabled: bool,
    min_multipart_upload_size: u64,
    transport: Arc<dyn Transport>,
}

impl StoreClient {
    pub fn builder() -> StoreClientBuilder {
        StoreClientBuilder::new()
    }

    pub fn server_url(&self) -> &str {
        &self.url
    }

    pub fn channel(&self) -> Option<Channel> {
        self.channel
    }

    /// Returns a client that scopes every request to `channel`.
    pub fn with_channel(&self, channel: Channel) -> Self {
        let mut client = self.clone();
        client.channel = Some(channel);
        client
    }

    /// Stops archive downloads from counting towards download statistics.
    pub fn disable_stats(&mut self) {
        self.stats_disabled = true;
    }

    pub fn stats_disabled(&self) -> bool {
        self.stats_disabled
    }

    pub fn set_header(&mut self, name: HeaderName, value: HeaderValue) {
        self.headers.append(name, value);
    }

    pub fn min_multipart_upload_size(&self) -> u64 {
        self.min_multipart_upload_size
    }

    pub fn set_min_multipart_upload_size(&mut self, size: u64) {
        self.min_multipart_upload_size = size.max(1);
    }

    /// Sends a request to `path` below the versioned API root.
    ///
    /// `path` must start with `/` and may carry a query string. Any status
    /// other than 200 is decoded into an error, so a returned response is
    /// always a success.
    pub async fn do_request(
        &self,
        method: Method,
        path: &str,
        body: RequestBody,
        extra_headers: HeaderMap,
    ) -> Result<StoreResponse> {
        if !path.starts_with('/') {
            return Err(TroveError::InvalidRequest(format!(
                "path {:?} is not absolute",
                path
            )));
        }

        let mut url = url::Url::parse(&format!("{}/{}{}", self.url, API_VERSION, path))
            .map_err(|e| TroveError::InvalidRequest(format!("invalid request path {:?}: {}", path, e)))?;
        if let Some(channel) = self.channel {
            url.query_pairs_mut().append_pair("channel", channel.as_str());
        }

        let mut headers = extra_headers;
        for (name, value) in &self.headers {
            headers.append(name.clone(), value.clone());
        }
        if let Some(user) = &self.user {
            let credentials = STANDARD.encode(format!("{}:{}", user, self.password));
            let value = HeaderValue::from_str(&format!("Basic {}", credentials))
                .map_err(|e| TroveError::Config(format!("invalid credentials: {}", e)))?;
            headers.insert(AUTHORIZATION, value);
        }

        let response = self
            .transport
            .send(StoreRequest {
                method,
                url,
                headers,
                body,
            })
            .await?;

        if response.status == 200 {
            return Ok(response);
        }
        Err(decode_error_response(response).await)
    }

    /// GETs `path` and decodes the JSON response.
    pub async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let response = self
            .do_request(Method::GET, path, RequestBody::Empty, HeaderMap::new())
            .await?;
        decode_json(response).await
    }

    /// Sends `value` as a JSON body and decodes the JSON response.
    pub async fn send_json<B, T>(&self, method: Method, path: &str, value: &B) -> Result<T>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let response = self.send_json_raw(method, path, value).await?;
        decode_json(response).await
    }

    /// Sends `value` as a JSON body, ignoring any response content.
    pub async fn put_json<B: Serialize + ?Sized>(&self, path: &str, value: &B) -> Result<()> {
        self.send_json_raw(Method::PUT, path, value).await?;
        Ok(())
    }

    pub async fn post_json<B: Serialize + ?Sized>(&self, path: &str, value: &B) -> Result<()> {
        self.send_json_raw(Method::POST, path, value).await?;
        Ok(())
    }

    async fn send_json_raw<B: Serialize + ?Sized>(
        &self,
        method: Method,
        path: &str,
        value: &B,
    ) -> Result<StoreResponse> {
        let data = serde_json::to_vec(value)?;
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        self.do_request(method, path, RequestBody::Json(Bytes::from(data)), headers)
            .await
    }
}

pub(crate) async fn decode_json<T: DeserializeOwned>(response: StoreResponse) -> Result<T> {
    let data = response
        .bytes()
        .await
        .map_err(|e| e.with_context("cannot read response body"))?;
    serde_json::from_slice(&data).map_err(|e| {
        TroveError::protocol(format!(
            "cannot unmarshal response {}: {}",
            size_limit(&data),
            e
        ))
    })
}

async fn decode_error_response(response: StoreResponse) -> TroveError {
    let status = response.status;
    let is_json = response
        .header(CONTENT_TYPE.as_str())
        .map(|value| value.starts_with("application/json"))
        .unwrap_or(false);

    let data = match response.bytes().await {
        Ok(data) => data,
        Err(e) => return e.with_context("cannot read response body"),
    };
    if !is_json {
        return TroveError::protocol(format!(
            "unexpected response status from server: {}",
            status
        ));
    }

    let decoded: ErrorResponse = match serde_json::from_slice(&data) {
        Ok(decoded) => decoded,
        Err(_) => {
            return TroveError::protocol(format!(
                "cannot unmarshal error response {}",
                size_limit(&data)
            ));
        }
    };
    if decoded.message.is_empty() {
        return TroveError::protocol(format!(
            "error response with empty message {}",
            size_limit(&data)
        ));
    }

    error_from_response(decoded)
}

fn error_from_response(response: ErrorResponse) -> TroveError {
    let ErrorResponse {
        message,
        code,
        info,
    } = response;

    match code.unwrap_or(ErrorCode::Unknown) {
        code @ (ErrorCode::NotFound | ErrorCode::MetadataNotFound) => {
            TroveError::NotFound { message, code }
        }
        ErrorCode::Unauthorized => TroveError::Unauthorized(message),
        ErrorCode::TermAgreementRequired => TroveError::TermsRequired {
            terms: info.map(|info| info.terms).unwrap_or_default(),
            context: None,
        },
        code => TroveError::Api { code, message },
    }
}

/// Renders at most 1024 bytes of `data` for inclusion in an error message.
fn size_limit(data: &[u8]) -> String {
    if data.len() <= ERROR_EXCERPT_LIMIT {
        return format!("{:?}", String::from_utf8_lossy(data));
    }
    format!(
        "{:?} ... [{} bytes omitted]",
        String::from_utf8_lossy(&data[..ERROR_EXCERPT_LIMIT]),
        data.len() - ERROR_EXCERPT_LIMIT
    )
}

/// Encodes query parameters for appending to an API path.
pub(crate) fn query(pairs: &[(&str, &str)]) -> String {
    let mut serializer = url::form_urlencoded::Serializer::new(String::new());
    for (key, value) in pairs {
        serializer.append_pair(key, value);
    }
    serializer.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeStore;

    #[test]
    fn test_builder_defaults_and_validation() {
        let fake = Arc::new(FakeStore::new());
        let client = StoreClient::builder().transport(fake.clone()).build().unwrap();
        assert_eq!(client.server_url(), DEFAULT_STORE_URL);
        assert_eq!(
            client.min_multipart_upload_size(),
            DEFAULT_MIN_MULTIPART_UPLOAD_SIZE
        );
        assert!(!client.stats_disabled());

        let err = StoreClient::builder()
            .url("ftp://example.com")
            .transport(fake.clone())
            .build()
            .err()
            .unwrap();
        assert!(matches!(err, TroveError::Config(_)));

        let err = StoreClient::builder()
            .password("secret")
            .transport(fake)
            .build()
            .err()
            .unwrap();
        assert!(matches!(err, TroveError::Config(_)));
    }

    #[tokio::test]
    async fn test_request_carries_auth_headers_and_channel() {
        let fake = Arc::new(FakeStore::new());
        fake.respond_json("GET", "/whoami", r#"{"User":"bob","Groups":[]}"#);
        let client = StoreClient::builder()
            .url("http://store.test/")
            .user("bob")
            .password("pw")
            .header("X-Trace", "1")
            .channel(Channel::Edge)
            .transport(fake.clone())
            .build()
            .unwrap();

        let _: serde_json::Value = client.get_json("/whoami").await.unwrap();

        let request = fake.last_request().unwrap();
        assert_eq!(request.url, "http://store.test/v5/whoami?channel=edge");
        assert_eq!(
            request.header("authorization").as_deref(),
            Some("Basic Ym9iOnB3")
        );
        assert_eq!(request.header("x-trace").as_deref(), Some("1"));
    }

    #[tokio::test]
    async fn test_relative_path_is_rejected_before_sending() {
        let fake = Arc::new(FakeStore::new());
        let client = StoreClient::builder().transport(fake.clone()).build().unwrap();
        let err = client
            .get_json::<serde_json::Value>("whoami")
            .await
            .unwrap_err();
        assert!(matches!(err, TroveError::InvalidRequest(_)));
        assert!(fake.requests().is_empty());
    }

    #[test]
    fn test_error_codes_map_to_variants() {
        let response = |code: ErrorCode| ErrorResponse {
            message: "boom".to_string(),
            code: Some(code),
            info: None,
        };
        assert!(error_from_response(response(ErrorCode::NotFound)).is_not_found());
        assert!(error_from_response(response(ErrorCode::MetadataNotFound)).is_not_found());
        assert!(error_from_response(response(ErrorCode::Unauthorized)).is_authorization_error());
        assert!(matches!(
            error_from_response(response(ErrorCode::Forbidden)),
            TroveError::Api {
                code: ErrorCode::Forbidden,
                ..
            }
        ));

        let terms = ErrorResponse {
            message: "terms".to_string(),
            code: Some(ErrorCode::TermAgreementRequired),
            info: Some(crate::params::ErrorInfo {
                terms: vec!["term1/1".to_string(), "term2/3".to_string()],
            }),
        };
        let err = error_from_response(terms);
        assert!(err.to_string().contains("trove agree term1/1 term2/3"));
    }

    #[tokio::test]
    async fn test_non_json_error_is_protocol_error() {
        let fake = Arc::new(FakeStore::new());
        fake.respond_status("GET", "/whoami", 502, "text/plain", b"bad gateway".to_vec());
        let client = StoreClient::builder()
            .url("http://store.test")
            .transport(fake)
            .build()
            .unwrap();
        let err = client
            .get_json::<serde_json::Value>("/whoami")
            .await
            .unwrap_err();
        assert!(matches!(err, TroveError::Protocol(_)));
        assert!(err.to_string().contains("502"));
        assert!(!err.is_api_error());
    }

    #[test]
    fn test_size_limit_truncates_long_bodies() {
        let data = vec![b'x'; 1500];
        let excerpt = size_limit(&data);
        assert!(excerpt.ends_with("... [476 bytes omitted]"));
        assert_eq!(size_limit(b"short"), "\"short\"");
    }

    #[test]
    fn test_query_encoding() {
        assert_eq!(
            query(&[("hash", "ab"), ("filename", "my file.zip")]),
            "hash=ab&filename=my+file.zip"
        );
    }
}
