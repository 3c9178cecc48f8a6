//! Charms and bundles on local disk, as directories or archives.
//!
//! Archives are gzip-compressed tarballs. Packing a directory is
//! deterministic: entries are sorted, timestamps and owners are zeroed, and
//! hidden files are left out, so the same tree always hashes the same.

use crate::id::ArtifactKind;
use crate::verify::compute_hash;
use crate::{Result, TroveError};
use bytes::Bytes;
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use tar::{EntryType, Header};

pub const CHARM_METADATA_FILE: &str = "metadata.yaml";
pub const BUNDLE_METADATA_FILE: &str = "bundle.yaml";
pub const REVISION_FILE: &str = "revision";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Artifact {
    CharmDir(PathBuf),
    CharmArchive(PathBuf),
    BundleDir(PathBuf),
    BundleArchive(PathBuf),
}

/// Archive bytes ready to be sent to the store.
#[derive(Debug, Clone)]
pub struct ArchiveContent {
    pub data: Bytes,
    /// Lowercase hex SHA-384 of `data`.
    pub hash: String,
    pub size: u64,
}

impl ArchiveContent {
    fn new(data: Vec<u8>) -> Self {
        let hash = compute_hash(&data);
        let size = data.len() as u64;
        Self {
            data: Bytes::from(data),
            hash,
            size,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CharmMetadata {
    pub name: String,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub series: Vec<String>,
    #[serde(default)]
    pub subordinate: bool,
    #[serde(default)]
    pub resources: BTreeMap<String, ResourceMeta>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceMeta {
    #[serde(rename = "type", default = "default_resource_type")]
    pub resource_type: String,
    #[serde(default)]
    pub filename: String,
    #[serde(default)]
    pub description: String,
}

fn default_resource_type() -> String {
    "file".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BundleMetadata {
    /// Older bundles call these `services`.
    #[serde(default, alias = "services")]
    pub applications: BTreeMap<String, ApplicationSpec>,
    #[serde(default)]
    pub series: Option<String>,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplicationSpec {
    pub charm: String,
    #[serde(default)]
    pub num_units: u32,
    #[serde(default)]
    pub options: BTreeMap<String, serde_yaml::Value>,
}

impl Artifact {
    /// Works out what lives at `path`. A directory is a bundle when it has a
    /// `bundle.yaml` and a charm when it has a `metadata.yaml`; archives are
    /// classified the same way by their top-level entries.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let metadata = tokio::fs::metadata(&path).await?;

        if metadata.is_dir() {
            if tokio::fs::try_exists(path.join(BUNDLE_METADATA_FILE)).await? {
                return Ok(Artifact::BundleDir(path));
            }
            if tokio::fs::try_exists(path.join(CHARM_METADATA_FILE)).await? {
                return Ok(Artifact::CharmDir(path));
            }
            return Err(TroveError::InvalidRequest(format!(
                "no charm or bundle found in directory {}",
                path.display()
            )));
        }

        let archive = path.clone();
        let names = blocking(move || archive_entry_names(&archive)).await?;
        if names.iter().any(|name| name == BUNDLE_METADATA_FILE) {
            Ok(Artifact::BundleArchive(path))
        } else if names.iter().any(|name| name == CHARM_METADATA_FILE) {
            Ok(Artifact::CharmArchive(path))
        } else {
            Err(TroveError::InvalidRequest(format!(
                "no charm or bundle found in archive {}",
                path.display()
            )))
        }
    }

    pub fn kind(&self) -> ArtifactKind {
        match self {
            Artifact::CharmDir(_) | Artifact::CharmArchive(_) => ArtifactKind::Charm,
            Artifact::BundleDir(_) | Artifact::BundleArchive(_) => ArtifactKind::Bundle,
        }
    }

    pub fn path(&self) -> &Path {
        match self {
            Artifact::CharmDir(path)
            | Artifact::CharmArchive(path)
            | Artifact::BundleDir(path)
            | Artifact::BundleArchive(path) => path,
        }
    }

    pub fn is_dir(&self) -> bool {
        matches!(self, Artifact::CharmDir(_) | Artifact::BundleDir(_))
    }

    /// Returns the archive form of this artifact. Archives are read as they
    /// are; directories are packed.
    pub async fn open_archive(&self) -> Result<ArchiveContent> {
        let path = self.path().to_path_buf();
        let data = if self.is_dir() {
            blocking(move || pack_dir(&path)).await?
        } else {
            tokio::fs::read(&path).await?
        };
        let content = ArchiveContent::new(data);
        tracing::debug!(
            "Opened {} archive {} ({} bytes, sha384 {})",
            self.kind(),
            self.path().display(),
            content.size,
            content.hash
        );
        Ok(content)
    }

    pub async fn charm_metadata(&self) -> Result<CharmMetadata> {
        if self.kind() != ArtifactKind::Charm {
            return Err(TroveError::InvalidRequest(format!(
                "{} is a bundle, not a charm",
                self.path().display()
            )));
        }
        let raw = self.require_file(CHARM_METADATA_FILE).await?;
        Ok(serde_yaml::from_slice(&raw)?)
    }

    pub async fn bundle_metadata(&self) -> Result<BundleMetadata> {
        if self.kind() != ArtifactKind::Bundle {
            return Err(TroveError::InvalidRequest(format!(
                "{} is a charm, not a bundle",
                self.path().display()
            )));
        }
        let raw = self.require_file(BUNDLE_METADATA_FILE).await?;
        Ok(serde_yaml::from_slice(&raw)?)
    }

    /// The revision recorded in a charm's `revision` file. Bundles carry
    /// none, and neither do charms without the file.
    pub async fn revision(&self) -> Result<Option<u32>> {
        if self.kind() == ArtifactKind::Bundle {
            return Ok(None);
        }
        let Some(raw) = self.read_file(REVISION_FILE).await? else {
            return Ok(None);
        };
        let text = String::from_utf8_lossy(&raw);
        text.trim().parse::<u32>().map(Some).map_err(|e| {
            TroveError::InvalidRequest(format!(
                "invalid revision file in {}: {}",
                self.path().display(),
                e
            ))
        })
    }

    async fn require_file(&self, name: &str) -> Result<Vec<u8>> {
        self.read_file(name).await?.ok_or_else(|| {
            TroveError::InvalidRequest(format!("{} not found in {}", name, self.path().display()))
        })
    }

    async fn read_file(&self, name: &str) -> Result<Option<Vec<u8>>> {
        if self.is_dir() {
            return match tokio::fs::read(self.path().join(name)).await {
                Ok(data) => Ok(Some(data)),
                Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
                Err(e) => Err(e.into()),
            };
        }
        let path = self.path().to_path_buf();
        let name = name.to_string();
        blocking(move || read_archive_entry(&path, &name)).await
    }
}

async fn blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| TroveError::Io(io::Error::other(e)))?
}

fn is_hidden(name: &std::ffi::OsStr) -> bool {
    name.to_string_lossy().starts_with('.')
}

/// Packs the tree below `root` into a gzip-compressed tarball.
pub fn pack_dir(root: &Path) -> Result<Vec<u8>> {
    let mut builder = tar::Builder::new(Vec::new());
    builder.follow_symlinks(false);

    let walker = walkdir::WalkDir::new(root)
        .min_depth(1)
        .sort_by(|a, b| a.file_name().cmp(b.file_name()))
        .into_iter()
        .filter_entry(|entry| !is_hidden(entry.file_name()));
    for entry in walker {
        let entry = entry.map_err(|e| TroveError::Io(io::Error::other(e)))?;
        let path = entry.path();
        let rel = path
            .strip_prefix(root)
            .map_err(|e| TroveError::Io(io::Error::other(e)))?;
        let rel = rel.to_string_lossy().replace('\\', "/");
        let metadata = std::fs::symlink_metadata(path)?;
        let file_type = metadata.file_type();

        let mut header = Header::new_gnu();
        header.set_mtime(0);
        header.set_uid(0);
        header.set_gid(0);
        if file_type.is_dir() {
            header.set_entry_type(EntryType::Directory);
            header.set_mode(0o755);
            header.set_size(0);
            builder.append_data(&mut header, &rel, io::empty())?;
        } else if file_type.is_file() {
            header.set_entry_type(EntryType::Regular);
            header.set_mode(if is_executable(&metadata) { 0o755 } else { 0o644 });
            header.set_size(metadata.len());
            builder.append_data(&mut header, &rel, File::open(path)?)?;
        } else if file_type.is_symlink() {
            let target = std::fs::read_link(path)?;
            if target.is_absolute() {
                return Err(TroveError::InvalidRequest(format!(
                    "symlink {} points outside the charm",
                    path.display()
                )));
            }
            header.set_entry_type(EntryType::Symlink);
            header.set_mode(0o777);
            header.set_size(0);
            header.set_link_name(&target)?;
            builder.append_data(&mut header, &rel, io::empty())?;
        } else {
            tracing::debug!("Skipping special file {} while packing", path.display());
        }
    }

    builder.finish()?;
    let tar_bytes = builder.into_inner()?;
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(&tar_bytes)?;
    Ok(encoder.finish()?)
}

#[cfg(unix)]
fn is_executable(metadata: &std::fs::Metadata) -> bool {
    use std::os::unix::fs::PermissionsExt;
    metadata.permissions().mode() & 0o111 != 0
}

#[cfg(not(unix))]
fn is_executable(_metadata: &std::fs::Metadata) -> bool {
    false
}

fn normalize_entry_name(path: &Path) -> String {
    let name = path.to_string_lossy();
    name.trim_start_matches("./").trim_end_matches('/').to_string()
}

fn archive_entry_names(path: &Path) -> Result<Vec<String>> {
    let mut archive = tar::Archive::new(GzDecoder::new(File::open(path)?));
    let mut names = Vec::new();
    for entry in archive.entries()? {
        let entry = entry?;
        names.push(normalize_entry_name(&entry.path()?));
    }
    Ok(names)
}

fn read_archive_entry(path: &Path, name: &str) -> Result<Option<Vec<u8>>> {
    let mut archive = tar::Archive::new(GzDecoder::new(File::open(path)?));
    for entry in archive.entries()? {
        let mut entry = entry?;
        if normalize_entry_name(&entry.path()?) != name {
            continue;
        }
        let mut data = Vec::new();
        entry.read_to_end(&mut data)?;
        return Ok(Some(data));
    }
    Ok(None)
}
