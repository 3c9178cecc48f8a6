//! Charms and bundles served from the local filesystem.

use crate::artifact::Artifact;
use crate::id::{ArtifactId, ArtifactKind, BUNDLE_SERIES, Schema};
use crate::params::ErrorCode;
use crate::{Result, TroveError};
use std::path::{Path, PathBuf};
use tokio::fs;

fn entity_not_found(id: &ArtifactId, root: &Path) -> TroveError {
    TroveError::NotFound {
        message: format!("entity not found in {:?}: {}", root.display().to_string(), id),
        code: ErrorCode::NotFound,
    }
}

fn repo_not_found(root: &Path) -> TroveError {
    TroveError::NotFound {
        message: format!("no repository found at {:?}", root.display().to_string()),
        code: ErrorCode::NotFound,
    }
}

async fn check_local_id(id: &ArtifactId, root: &Path) -> Result<()> {
    if id.schema != Schema::Local {
        return Err(TroveError::InvalidRequest(format!(
            "local repository got id with non-local schema: {:?}",
            id.to_string()
        )));
    }
    match fs::metadata(root).await {
        Ok(metadata) if metadata.is_dir() => Ok(()),
        Ok(_) => Err(repo_not_found(root)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(repo_not_found(root)),
        Err(e) => Err(e.into()),
    }
}

fn expect_kind(id: &ArtifactId, kind: ArtifactKind) -> Result<()> {
    if id.kind() == kind {
        return Ok(());
    }
    Err(TroveError::InvalidRequest(format!(
        "expected a {} id, got {} id {:?}",
        kind,
        id.kind(),
        id.to_string()
    )))
}

fn might_be_charm(path: &Path, metadata: &std::fs::Metadata) -> bool {
    let Some(name) = path.file_name().map(|n| n.to_string_lossy()) else {
        return false;
    };
    if metadata.is_dir() {
        !name.starts_with('.')
    } else {
        name.ends_with(".charm")
    }
}

/// A directory of per-series charm directories, for example:
///
/// ```text
/// repo/trusty/mysql/
/// repo/trusty/wordpress.charm
/// repo/xenial/wordpress/
/// repo/bundle/wiki/
/// ```
#[derive(Debug, Clone)]
pub struct LocalRepository {
    root: PathBuf,
}

impl LocalRepository {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        if root.as_os_str().is_empty() {
            return Err(TroveError::Config(
                "path to local repository not specified".to_string(),
            ));
        }
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Fills in the revision of `id`. Bundles have no revision files and
    /// always resolve to revision 0.
    pub async fn resolve(&self, id: &ArtifactId) -> Result<ArtifactId> {
        if id.series.is_none() {
            return Err(TroveError::InvalidRequest(format!(
                "no series specified for {}",
                id
            )));
        }
        if id.revision.is_some() {
            return Ok(id.clone());
        }
        if id.kind() == ArtifactKind::Bundle {
            return Ok(id.with_revision(Some(0)));
        }
        let (_, revision) = self.find_charm(id).await?;
        Ok(id.with_revision(Some(revision)))
    }

    /// Finds the charm `id` names. Without a revision the highest one
    /// wins; among equal candidates the first in name order is used.
    pub async fn get(&self, id: &ArtifactId) -> Result<Artifact> {
        self.find_charm(id).await.map(|(artifact, _)| artifact)
    }

    pub async fn get_bundle(&self, id: &ArtifactId) -> Result<Artifact> {
        check_local_id(id, &self.root).await?;
        expect_kind(id, ArtifactKind::Bundle)?;

        let path = self.root.join(BUNDLE_SERIES).join(id.name.as_str());
        match fs::metadata(&path).await {
            Ok(metadata) if metadata.is_dir() => {}
            _ => return Err(entity_not_found(id, &self.root)),
        }
        match Artifact::open(&path).await? {
            artifact @ Artifact::BundleDir(_) => Ok(artifact),
            _ => Err(entity_not_found(id, &self.root)),
        }
    }

    /// Latest revision of each charm, ignoring any revision in the ids.
    pub async fn latest(&self, ids: &[ArtifactId]) -> Vec<Result<u32>> {
        let mut results = Vec::with_capacity(ids.len());
        for id in ids {
            results.push(
                self.find_charm(&id.with_revision(None))
                    .await
                    .map(|(_, revision)| revision),
            );
        }
        results
    }

    async fn find_charm(&self, id: &ArtifactId) -> Result<(Artifact, u32)> {
        check_local_id(id, &self.root).await?;
        expect_kind(id, ArtifactKind::Charm)?;
        let Some(series) = id.series.as_deref() else {
            return Err(TroveError::InvalidRequest(format!(
                "no series specified for {}",
                id
            )));
        };

        let series_dir = self.root.join(series);
        let mut entries = match fs::read_dir(&series_dir).await {
            Ok(entries) => entries,
            Err(_) => return Err(entity_not_found(id, &self.root)),
        };
        let mut paths = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            paths.push(entry.path());
        }
        paths.sort();

        let mut latest: Option<(Artifact, u32)> = None;
        for path in paths {
            // Follows symlinks.
            let metadata = fs::metadata(&path).await?;
            if !might_be_charm(&path, &metadata) {
                continue;
            }
            let (artifact, name, revision) = match read_charm(&path).await {
                Ok(found) => found,
                Err(e) => {
                    tracing::warn!("Failed to load charm at {}: {}", path.display(), e);
                    continue;
                }
            };
            if name != id.name.as_str() {
                continue;
            }
            if id.revision == Some(revision) {
                return Ok((artifact, revision));
            }
            if latest.as_ref().is_none_or(|(_, best)| revision > *best) {
                latest = Some((artifact, revision));
            }
        }

        match (id.revision, latest) {
            (None, Some(found)) => Ok(found),
            _ => Err(entity_not_found(id, &self.root)),
        }
    }
}

async fn read_charm(path: &Path) -> Result<(Artifact, String, u32)> {
    let artifact = Artifact::open(path).await?;
    if artifact.kind() != ArtifactKind::Charm {
        return Err(TroveError::InvalidRequest(format!(
            "{} holds a bundle",
            path.display()
        )));
    }
    let meta = artifact.charm_metadata().await?;
    let revision = artifact.revision().await?.unwrap_or(0);
    Ok((artifact, meta.name, revision))
}

/// A single charm or bundle addressed by its path.
#[derive(Debug, Clone)]
pub struct CharmPath {
    artifact: Artifact,
}

impl CharmPath {
    pub async fn new(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if path.as_os_str().is_empty() {
            return Err(TroveError::InvalidRequest(
                "path to charm not specified".to_string(),
            ));
        }
        let artifact = Artifact::open(path).await?;
        Ok(Self { artifact })
    }

    pub fn artifact(&self) -> &Artifact {
        &self.artifact
    }

    /// Builds the `local:` id of the entity at this path. For a charm,
    /// `series` defaults to the first series it supports and must be one of
    /// them otherwise. Bundles are named after their directory and resolve
    /// to revision 0.
    pub async fn resolve(&self, series: Option<&str>) -> Result<ArtifactId> {
        if series == Some(BUNDLE_SERIES) || self.artifact.kind() == ArtifactKind::Bundle {
            self.artifact.bundle_metadata().await?;
            let name = self
                .artifact
                .path()
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            return local_id(BUNDLE_SERIES, &name, 0);
        }

        let meta = self.artifact.charm_metadata().await?;
        let series = match series {
            Some(series) if !valid_series(series, &meta.series) => {
                return Err(TroveError::InvalidRequest(format!(
                    "series {:?} not supported by charm",
                    series
                )));
            }
            Some(series) => series.to_string(),
            None => meta.series.first().cloned().ok_or_else(|| {
                TroveError::InvalidRequest("no series specified".to_string())
            })?,
        };
        let revision = self.artifact.revision().await?.unwrap_or(0);
        local_id(&series, &meta.name, revision)
    }

    /// Returns the charm if `id` names it: same name, and the same revision
    /// when `id` carries one.
    pub async fn get(&self, id: &ArtifactId) -> Result<Artifact> {
        let root = self.artifact.path();
        check_local_id(id, root).await?;
        expect_kind(id, ArtifactKind::Charm)?;

        let meta = self.artifact.charm_metadata().await?;
        let revision = self.artifact.revision().await?.unwrap_or(0);
        if meta.name != id.name.as_str() || id.revision.is_some_and(|r| r != revision) {
            return Err(entity_not_found(id, root));
        }
        if let Some(series) = id.series.as_deref() {
            if !valid_series(series, &meta.series) {
                return Err(TroveError::InvalidRequest(format!(
                    "series {:?} not supported by charm",
                    series
                )));
            }
        }
        Ok(self.artifact.clone())
    }

    pub async fn get_bundle(&self, id: &ArtifactId) -> Result<Artifact> {
        check_local_id(id, self.artifact.path()).await?;
        expect_kind(id, ArtifactKind::Bundle)?;
        if self.artifact.kind() != ArtifactKind::Bundle {
            return Err(entity_not_found(id, self.artifact.path()));
        }
        Ok(self.artifact.clone())
    }
}

fn valid_series(series: &str, supported: &[String]) -> bool {
    supported.is_empty() || supported.iter().any(|s| s == series)
}

fn local_id(series: &str, name: &str, revision: u32) -> Result<ArtifactId> {
    ArtifactId::parse(&format!("local:{}/{}-{}", series, name, revision))
}
