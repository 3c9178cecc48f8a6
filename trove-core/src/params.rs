//! Wire types exchanged with the store API.

use crate::channel::Channel;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

pub const API_VERSION: &str = "v5";

pub const ENTITY_ID_HEADER: &str = "Entity-Id";
pub const CONTENT_HASH_HEADER: &str = "Content-Sha384";
pub const METADATA_HEADER: &str = "Trove-Metadata";

/// Closed set of error codes the store attaches to structured errors.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorCode {
    #[serde(rename = "not found")]
    NotFound,
    #[serde(rename = "metadata not found")]
    MetadataNotFound,
    #[serde(rename = "forbidden")]
    Forbidden,
    #[serde(rename = "bad request")]
    BadRequest,
    #[serde(rename = "duplicate upload")]
    DuplicateUpload,
    #[serde(rename = "multiple errors")]
    MultipleErrors,
    #[serde(rename = "unauthorized")]
    Unauthorized,
    #[serde(rename = "method not allowed")]
    MethodNotAllowed,
    #[serde(rename = "service unavailable")]
    ServiceUnavailable,
    #[serde(rename = "entity id not allowed")]
    EntityIdNotAllowed,
    #[serde(rename = "invalid entity")]
    InvalidEntity,
    #[serde(rename = "read only")]
    ReadOnly,
    #[serde(rename = "term agreement required")]
    TermAgreementRequired,
    #[serde(other)]
    Unknown,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::NotFound => "not found",
            ErrorCode::MetadataNotFound => "metadata not found",
            ErrorCode::Forbidden => "forbidden",
            ErrorCode::BadRequest => "bad request",
            ErrorCode::DuplicateUpload => "duplicate upload",
            ErrorCode::MultipleErrors => "multiple errors",
            ErrorCode::Unauthorized => "unauthorized",
            ErrorCode::MethodNotAllowed => "method not allowed",
            ErrorCode::ServiceUnavailable => "service unavailable",
            ErrorCode::EntityIdNotAllowed => "entity id not allowed",
            ErrorCode::InvalidEntity => "invalid entity",
            ErrorCode::ReadOnly => "read only",
            ErrorCode::TermAgreementRequired => "term agreement required",
            ErrorCode::Unknown => "unknown",
        }
    }
}

/// Structured error body returned with any non-200 JSON response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    #[serde(rename = "Message", default)]
    pub message: String,
    #[serde(rename = "Code", default)]
    pub code: Option<ErrorCode>,
    #[serde(rename = "Info", default, skip_serializing_if = "Option::is_none")]
    pub info: Option<ErrorInfo>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ErrorInfo {
    #[serde(rename = "Terms", default)]
    pub terms: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveUploadResponse {
    #[serde(rename = "Id")]
    pub id: String,
    #[serde(rename = "PromulgatedId", default, skip_serializing_if = "Option::is_none")]
    pub promulgated_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceUploadResponse {
    #[serde(rename = "Revision")]
    pub revision: u32,
}

/// Server-side state of a multipart upload session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadInfoResponse {
    #[serde(rename = "UploadId")]
    pub upload_id: String,
    #[serde(rename = "Expires")]
    pub expires: DateTime<Utc>,
    #[serde(rename = "MinPartSize")]
    pub min_part_size: u64,
    #[serde(rename = "MaxPartSize")]
    pub max_part_size: u64,
    #[serde(rename = "MaxParts")]
    pub max_parts: u32,
    #[serde(rename = "Parts", default)]
    pub parts: Vec<Part>,
}

/// Body of the request that finalizes a multipart upload.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Parts {
    #[serde(rename = "Parts", default)]
    pub parts: Vec<Part>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Part {
    #[serde(rename = "Offset", default)]
    pub offset: u64,
    #[serde(rename = "Size", default)]
    pub size: u64,
    #[serde(rename = "Complete", default)]
    pub complete: bool,
    #[serde(rename = "Hash", default)]
    pub hash: String,
}

impl Part {
    /// A part the server holds a usable copy of.
    pub fn is_valid(&self) -> bool {
        self.complete && !self.hash.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinishUploadResponse {
    #[serde(rename = "Hash")]
    pub hash: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishRequest {
    #[serde(rename = "Channels")]
    pub channels: Vec<Channel>,
    #[serde(rename = "Resources", default)]
    pub resources: HashMap<String, u32>,
}

/// Resource metadata as reported by the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resource {
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "Type", default)]
    pub resource_type: String,
    #[serde(rename = "Path", default)]
    pub path: String,
    #[serde(rename = "Description", default)]
    pub description: String,
    #[serde(rename = "Revision")]
    pub revision: u32,
    #[serde(rename = "Fingerprint", default)]
    pub fingerprint: String,
    #[serde(rename = "Size", default)]
    pub size: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdResponse {
    #[serde(rename = "Id")]
    pub id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdRevisionResponse {
    #[serde(rename = "Revision")]
    pub revision: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HashResponse {
    #[serde(rename = "Sum")]
    pub sum: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SupportedSeriesResponse {
    #[serde(rename = "SupportedSeries", default)]
    pub supported_series: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WhoAmIResponse {
    #[serde(rename = "User")]
    pub user: String,
    #[serde(rename = "Groups", default)]
    pub groups: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DockerResourceUploadRequest {
    #[serde(rename = "Digest")]
    pub digest: String,
    /// Set only for images hosted outside the store's registry.
    #[serde(rename = "ImageName", default, skip_serializing_if = "String::is_empty")]
    pub image_name: String,
}

/// Registry location and credentials for a docker image resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DockerInfoResponse {
    #[serde(rename = "ImageName")]
    pub image_name: String,
    #[serde(rename = "Username", default)]
    pub username: String,
    #[serde(rename = "Password", default)]
    pub password: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Info,
    Warning,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogType {
    #[serde(rename = "ingestion")]
    Ingestion,
    #[serde(rename = "legacyStatistics")]
    LegacyStatistics,
}

/// One entry of the store's log database.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Log {
    #[serde(rename = "Data")]
    pub data: serde_json::Value,
    #[serde(rename = "Level")]
    pub level: LogLevel,
    #[serde(rename = "Type")]
    pub log_type: LogType,
    #[serde(rename = "URLs", default)]
    pub urls: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StatsUpdateType {
    Download,
    Traffic,
    Deploy,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsUpdateEntry {
    #[serde(rename = "Timestamp")]
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "CharmReference")]
    pub charm_reference: String,
    #[serde(rename = "Type")]
    pub update_type: StatsUpdateType,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsUpdateRequest {
    #[serde(rename = "Entries")]
    pub entries: Vec<StatsUpdateEntry>,
}
