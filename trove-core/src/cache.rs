use crate::client::StoreClient;
use crate::id::ArtifactId;
use crate::verify::{ContentDigest, copy_verified, hash_file};
use crate::{Result, TroveError};
use std::path::{Path, PathBuf};
use tokio::fs;
use ulid::Ulid;

/// Directory of downloaded archives, one file per fully qualified id.
///
/// Entries are never removed here. Concurrent fetches of the same id may
/// both download; the final rename leaves whichever finished last.
#[derive(Debug, Clone)]
pub struct ArchiveCache {
    dir: PathBuf,
}

impl ArchiveCache {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Where the archive of the fully qualified `id` is kept.
    pub fn entry_path(&self, id: &ArtifactId) -> PathBuf {
        self.dir
            .join(format!("{}.{}", id.quote(), id.kind().as_str()))
    }

    /// Returns the path of a verified local copy of the archive of `id`,
    /// downloading it when the cached copy is missing or differs from the
    /// store's.
    pub async fn archive_path(&self, client: &StoreClient, id: &ArtifactId) -> Result<PathBuf> {
        fs::create_dir_all(&self.dir)
            .await
            .map_err(|source| TroveError::CacheUnavailable {
                path: self.dir.display().to_string(),
                source,
            })?;

        let download = client.fetch_archive(id).await?;
        let path = self.entry_path(&download.id);
        let expected = download.digest();

        if self.is_current(&path, &expected).await {
            tracing::debug!("Reusing cached archive {} for {}", path.display(), download.id);
            return Ok(path);
        }

        let temp_path = self.dir.join(format!(
            ".{}-download-{}.tmp",
            download.id.kind().as_str(),
            Ulid::new()
        ));
        let mut file = fs::File::create(&temp_path).await?;
        let copied = copy_verified(download.body, &mut file, &expected).await;
        let synced = match copied {
            Ok(_) => file.sync_all().await.map_err(TroveError::from),
            Err(e) => Err(e),
        };
        drop(file);

        if let Err(e) = synced {
            let _ = fs::remove_file(&temp_path).await;
            return Err(e);
        }
        if let Err(e) = fs::rename(&temp_path, &path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(e.into());
        }

        tracing::debug!(
            "Cached archive {} ({} bytes) at {}",
            download.id,
            expected.size,
            path.display()
        );
        Ok(path)
    }

    async fn is_current(&self, path: &Path, expected: &ContentDigest) -> bool {
        match fs::metadata(path).await {
            Ok(metadata) if metadata.is_file() => {}
            _ => return false,
        }
        match hash_file(path).await {
            Ok(actual) => match expected.check(&actual.hash, actual.size) {
                Ok(()) => true,
                Err(e) => {
                    tracing::debug!("Cached archive {} is stale: {}", path.display(), e);
                    false
                }
            },
            Err(e) => {
                tracing::warn!("Cannot read cached archive {}: {}", path.display(), e);
                false
            }
        }
    }
}
