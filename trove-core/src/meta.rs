//! Metadata queries.
//!
//! Callers name the metadata they want with a [`MetaQuery`] and decode each
//! returned value themselves:
//!
//! ```ignore
//! let query = MetaQuery::new().want("archive-size").want("extra-info/digest");
//! let result = client.meta(&id, &query).await?;
//! let size: ArchiveSize = result.decode("archive-size")?.unwrap_or_default();
//! ```

use crate::channel::Channel;
use crate::client::{StoreClient, query};
use crate::id::{ArtifactId, BUNDLE_SERIES};
use crate::params::{
    ErrorCode, HashResponse, IdResponse, IdRevisionResponse, Log, LogLevel, LogType,
    PublishRequest, StatsUpdateRequest, SupportedSeriesResponse, WhoAmIResponse,
};
use crate::{Result, TroveError};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use std::collections::HashMap;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetaQuery {
    includes: Vec<String>,
}

impl MetaQuery {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a metadata key such as `charm-metadata` or `extra-info/attr`.
    pub fn want(mut self, key: impl Into<String>) -> Self {
        let key = key.into();
        if !self.includes.contains(&key) {
            self.includes.push(key);
        }
        self
    }

    pub fn includes(&self) -> &[String] {
        &self.includes
    }
}

#[derive(Deserialize)]
struct RawMetaResponse {
    #[serde(rename = "Id")]
    id: String,
    #[serde(rename = "Meta", default)]
    meta: HashMap<String, serde_json::Value>,
}

/// Values returned for a [`MetaQuery`], still in their JSON form.
#[derive(Debug, Clone)]
pub struct MetaResult {
    pub id: ArtifactId,
    values: HashMap<String, serde_json::Value>,
}

impl MetaResult {
    /// Decodes the value returned for `key`. The store omits keys it has
    /// no metadata for, which yields `Ok(None)`.
    pub fn decode<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.values.get(key) {
            Some(value) => serde_json::from_value(value.clone())
                .map(Some)
                .map_err(|e| TroveError::protocol(format!("cannot unmarshal {}: {}", key, e))),
            None => Ok(None),
        }
    }

    pub fn contains(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(String::as_str)
    }
}

/// Latest revision of an entity, as reported by [`StoreClient::latest`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LatestRevision {
    pub revision: u32,
    pub sha256: String,
}

#[derive(Deserialize)]
struct LatestMeta {
    #[serde(rename = "id-revision")]
    id_revision: IdRevisionResponse,
    #[serde(rename = "hash256")]
    hash256: HashResponse,
}

#[derive(Deserialize)]
struct LatestEntry {
    #[serde(rename = "Meta")]
    meta: LatestMeta,
}

impl StoreClient {
    /// Fetches the metadata named by `query` for `id`, along with the fully
    /// qualified id it resolved to.
    pub async fn meta(&self, id: &ArtifactId, query: &MetaQuery) -> Result<MetaResult> {
        let mut path = format!("/{}/meta/any", id.path());
        if !query.includes().is_empty() {
            let pairs: Vec<(&str, &str)> = query
                .includes()
                .iter()
                .map(|key| ("include", key.as_str()))
                .collect();
            path.push('?');
            path.push_str(&crate::client::query(&pairs));
        }

        let raw: RawMetaResponse = self
            .get_json(&path)
            .await
            .map_err(|e| e.with_context(&format!("cannot get {:?}", path)))?;
        Ok(MetaResult {
            id: ArtifactId::parse(&raw.id)?,
            values: raw.meta,
        })
    }

    /// Resolves `id` to a fully qualified id and its supported series.
    pub async fn resolve(&self, id: &ArtifactId) -> Result<(ArtifactId, Vec<String>)> {
        let query = MetaQuery::new().want("id").want("supported-series");
        let result = match self.meta(id, &query).await {
            Ok(result) => result,
            Err(e) if e.is_not_found() => {
                let kind = match id.series.as_deref() {
                    Some(BUNDLE_SERIES) => "bundle",
                    Some(_) => "charm",
                    None => "charm or bundle",
                };
                return Err(TroveError::NotFound {
                    message: format!("cannot resolve URL {:?}: {} not found", id.to_string(), kind),
                    code: ErrorCode::NotFound,
                });
            }
            Err(e) => return Err(e),
        };

        let resolved = match result.decode::<IdResponse>("id")? {
            Some(response) => ArtifactId::parse(&response.id)?,
            None => result.id.clone(),
        };
        let series = result
            .decode::<SupportedSeriesResponse>("supported-series")?
            .map(|response| response.supported_series)
            .unwrap_or_default();
        Ok((resolved, series))
    }

    /// Looks up the latest revision of each id. Ids the store does not know
    /// (or will not show) get a `NotFound` entry instead of failing the
    /// whole call.
    pub async fn latest(&self, ids: &[ArtifactId]) -> Result<Vec<Result<LatestRevision>>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let names: Vec<String> = ids.iter().map(|id| id.with_revision(None).to_string()).collect();
        let mut pairs = vec![
            ("ignore-auth", "1"),
            ("include", "id-revision"),
            ("include", "hash256"),
        ];
        pairs.extend(names.iter().map(|name| ("id", name.as_str())));
        let path = format!("/meta/any?{}", query(&pairs));

        let mut results: HashMap<String, LatestEntry> = self
            .get_json(&path)
            .await
            .map_err(|e| e.with_context("cannot get metadata from the store"))?;

        Ok(names
            .iter()
            .zip(ids)
            .map(|(name, id)| match results.remove(name) {
                Some(entry) => Ok(LatestRevision {
                    revision: entry.meta.id_revision.revision,
                    sha256: entry.meta.hash256.sum,
                }),
                None => Err(TroveError::NotFound {
                    message: format!("{} {:?} not found", id.kind(), name),
                    code: ErrorCode::NotFound,
                }),
            })
            .collect())
    }

    /// Sets extra-info keys on `id`; keys not present are left alone.
    pub async fn put_extra_info(
        &self,
        id: &ArtifactId,
        info: &HashMap<String, serde_json::Value>,
    ) -> Result<()> {
        self.put_json(&format!("/{}/meta/extra-info", id.path()), info)
            .await
    }

    /// Sets common-info keys, shared by every revision of `id`.
    pub async fn put_common_info(
        &self,
        id: &ArtifactId,
        info: &HashMap<String, serde_json::Value>,
    ) -> Result<()> {
        self.put_json(&format!("/{}/meta/common-info", id.path()), info)
            .await
    }

    pub async fn whoami(&self) -> Result<WhoAmIResponse> {
        self.get_json("/whoami").await
    }

    /// Publishes `id` to `channels` with the given resource revisions.
    pub async fn publish(
        &self,
        id: &ArtifactId,
        channels: &[Channel],
        resources: HashMap<String, u32>,
    ) -> Result<()> {
        if channels.is_empty() {
            return Err(TroveError::InvalidRequest(format!(
                "no channels given to publish {}",
                id
            )));
        }
        if let Some(channel) = channels.iter().find(|channel| !channel.is_published()) {
            return Err(TroveError::InvalidRequest(format!(
                "cannot publish to the {} channel",
                channel
            )));
        }
        let request = PublishRequest {
            channels: channels.to_vec(),
            resources,
        };
        self.put_json(&format!("/{}/publish", id.path()), &request)
            .await
    }

    /// Records `message` in the store's log database, tagged with `ids`.
    pub async fn log(
        &self,
        log_type: LogType,
        level: LogLevel,
        message: &str,
        ids: &[ArtifactId],
    ) -> Result<()> {
        let logs = [Log {
            data: serde_json::Value::String(message.to_string()),
            level,
            log_type,
            urls: ids.iter().map(ArtifactId::to_string).collect(),
        }];
        self.post_json("/log", &logs)
            .await
            .map_err(|e| e.with_context("cannot send log message"))
    }

    /// Reports download, traffic or deploy events for the store's
    /// statistics.
    pub async fn stats_update(&self, request: &StatsUpdateRequest) -> Result<()> {
        self.put_json("/stats/update", request).await
    }
}
