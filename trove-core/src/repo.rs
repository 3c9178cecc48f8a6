//! Repositories: the store (through a local archive cache), a local
//! directory tree, or a single charm path.

use crate::artifact::Artifact;
use crate::cache::ArchiveCache;
use crate::channel::Channel;
use crate::client::{StoreClient, StoreClientBuilder};
use crate::id::{ArtifactId, ArtifactKind, Schema};
use crate::local::{CharmPath, LocalRepository};
use crate::meta::LatestRevision;
use crate::params::{METADATA_HEADER, Resource};
use crate::progress::Progress;
use crate::resource::Fingerprint;
use crate::upload::FileSource;
use crate::{Result, TroveError};
use reqwest::header::{HeaderName, HeaderValue};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncWrite;

/// Settings for [`CharmStore::new`].
#[derive(Clone, Default)]
pub struct CharmStoreParams {
    pub client: StoreClientBuilder,
    pub cache_dir: PathBuf,
}

/// A resource revision that was copied out and matched the store's
/// fingerprint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceData {
    pub fingerprint: Fingerprint,
    pub revision: Option<u32>,
    pub size: u64,
}

/// Store-backed repository. Archives are kept in an [`ArchiveCache`].
#[derive(Clone)]
pub struct CharmStore {
    client: StoreClient,
    cache: ArchiveCache,
}

impl CharmStore {
    pub fn new(params: CharmStoreParams) -> Result<Self> {
        if params.cache_dir.as_os_str().is_empty() {
            return Err(TroveError::Config(
                "archive cache directory not specified".to_string(),
            ));
        }
        Ok(Self::from_client(params.client.build()?, params.cache_dir))
    }

    pub fn from_client(client: StoreClient, cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            client,
            cache: ArchiveCache::new(cache_dir),
        }
    }

    pub fn client(&self) -> &StoreClient {
        &self.client
    }

    pub fn cache(&self) -> &ArchiveCache {
        &self.cache
    }

    pub fn url(&self) -> &str {
        self.client.server_url()
    }

    /// Returns a copy whose downloads do not count towards store
    /// statistics.
    pub fn with_test_mode(&self) -> Self {
        let mut store = self.clone();
        store.client.disable_stats();
        store
    }

    /// Returns a copy that sends each attribute as a `Trove-Metadata: k=v`
    /// header on every request.
    pub fn with_metadata_attrs(&self, attrs: &BTreeMap<String, String>) -> Result<Self> {
        let mut store = self.clone();
        let name = HeaderName::from_static("trove-metadata");
        for (key, value) in attrs {
            let value = HeaderValue::from_str(&format!("{}={}", key, value)).map_err(|e| {
                TroveError::Config(format!("invalid {} attribute {:?}: {}", METADATA_HEADER, key, e))
            })?;
            store.client.set_header(name.clone(), value);
        }
        Ok(store)
    }

    /// Returns the cached archive of charm `id`, downloading it if needed.
    pub async fn get(&self, id: &ArtifactId) -> Result<Artifact> {
        expect_store_kind(id, ArtifactKind::Charm)?;
        let path = self.cache.archive_path(&self.client, id).await?;
        Ok(Artifact::CharmArchive(path))
    }

    /// Returns the cached archive of bundle `id`, downloading it if needed.
    pub async fn get_bundle(&self, id: &ArtifactId) -> Result<Artifact> {
        expect_store_kind(id, ArtifactKind::Bundle)?;
        let path = self.cache.archive_path(&self.client, id).await?;
        Ok(Artifact::BundleArchive(path))
    }

    pub async fn resolve(&self, id: &ArtifactId) -> Result<(ArtifactId, Vec<String>)> {
        self.client.resolve(id).await
    }

    pub async fn latest(&self, ids: &[ArtifactId]) -> Result<Vec<Result<LatestRevision>>> {
        self.client.latest(ids).await
    }

    /// Latest revision of a single id.
    pub async fn latest_revision(&self, id: &ArtifactId) -> Result<u32> {
        let mut results = self.latest(std::slice::from_ref(id)).await?;
        match results.pop() {
            Some(result) if results.is_empty() => result.map(|latest| latest.revision),
            _ => Err(TroveError::protocol(format!(
                "expected 1 result, got {}",
                results.len() + 1
            ))),
        }
    }

    pub async fn list_resources(&self, id: &ArtifactId) -> Result<Vec<Resource>> {
        self.client.list_resources(id).await
    }

    /// Streams resource `name` of `id` into `dest` and checks it against
    /// the fingerprint the store advertised. `None` selects the latest
    /// revision. On a mismatch `dest` is left holding what was received.
    pub async fn get_resource<W>(
        &self,
        id: &ArtifactId,
        name: &str,
        revision: Option<u32>,
        dest: &mut W,
    ) -> Result<ResourceData>
    where
        W: AsyncWrite + Unpin,
    {
        let download = self.client.get_resource(id, name, revision).await?;
        let fingerprint = download.fingerprint.clone();
        let size = download.copy_verified(dest).await?;
        Ok(ResourceData {
            fingerprint,
            revision,
            size,
        })
    }

    /// Uploads the file at `path` as resource `name` of `id`.
    pub async fn upload_resource_file(
        &self,
        id: &ArtifactId,
        name: &str,
        path: &Path,
        progress: Arc<dyn Progress>,
    ) -> Result<u32> {
        let source = FileSource::open(path).await?;
        let filename = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| name.to_string());
        self.client
            .upload_resource(id, name, &filename, Arc::new(source), progress)
            .await
    }

    pub async fn publish(
        &self,
        id: &ArtifactId,
        channels: &[Channel],
        resources: HashMap<String, u32>,
    ) -> Result<()> {
        self.client.publish(id, channels, resources).await
    }
}

fn expect_store_kind(id: &ArtifactId, kind: ArtifactKind) -> Result<()> {
    if id.kind() != kind {
        return Err(TroveError::InvalidRequest(format!(
            "expected a {} id, got {} id {:?}",
            kind,
            id.kind(),
            id.to_string()
        )));
    }
    Ok(())
}

/// Any of the places charms and bundles can come from.
#[derive(Clone)]
pub enum Repository {
    Store(CharmStore),
    Local(LocalRepository),
    Path(CharmPath),
}

impl Repository {
    pub async fn get(&self, id: &ArtifactId) -> Result<Artifact> {
        match self {
            Repository::Store(store) => store.get(id).await,
            Repository::Local(local) => local.get(id).await,
            Repository::Path(path) => path.get(id).await,
        }
    }

    pub async fn get_bundle(&self, id: &ArtifactId) -> Result<Artifact> {
        match self {
            Repository::Store(store) => store.get_bundle(id).await,
            Repository::Local(local) => local.get_bundle(id).await,
            Repository::Path(path) => path.get_bundle(id).await,
        }
    }

    /// Resolves `id` to a fully qualified id. Only the store reports
    /// supported series; other repositories return an empty list.
    pub async fn resolve(&self, id: &ArtifactId) -> Result<(ArtifactId, Vec<String>)> {
        match self {
            Repository::Store(store) => store.resolve(id).await,
            Repository::Local(local) => Ok((local.resolve(id).await?, Vec::new())),
            Repository::Path(path) => Ok((path.resolve(id.series.as_deref()).await?, Vec::new())),
        }
    }
}

/// Picks the repository that can serve `reference`: `cs:` ids go to the
/// store, `local:` ids to the repository at `local_root`, and anything else
/// is tried as the path of a single charm or bundle.
pub async fn infer_repository(
    reference: &str,
    store: CharmStoreParams,
    local_root: Option<&Path>,
) -> Result<Repository> {
    if let Ok(id) = ArtifactId::parse(reference) {
        return match id.schema {
            Schema::Store => Ok(Repository::Store(CharmStore::new(store)?)),
            Schema::Local => {
                let root = local_root.ok_or_else(|| {
                    TroveError::Config("path to local repository not specified".to_string())
                })?;
                Ok(Repository::Local(LocalRepository::new(root)?))
            }
        };
    }

    match CharmPath::new(reference).await {
        Ok(path) => Ok(Repository::Path(path)),
        Err(TroveError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => Err(
            TroveError::InvalidRequest(format!("not a valid charm path: {}", reference)),
        ),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::NoProgress;
    use crate::testing::FakeStore;

    fn store(fake: &Arc<FakeStore>, cache_dir: &Path) -> CharmStore {
        let client = StoreClient::builder()
            .url("http://store.test")
            .transport(fake.clone())
            .build()
            .unwrap();
        CharmStore::from_client(client, cache_dir)
    }

    #[tokio::test]
    async fn test_get_checks_kind_and_caches() {
        let temp_dir = tempfile::tempdir().unwrap();
        let fake = Arc::new(FakeStore::new());
        fake.put_archive("cs:trusty/wordpress", b"charm bytes");
        fake.put_archive("cs:bundle/wiki", b"bundle bytes");
        let store = store(&fake, temp_dir.path());

        let charm = store
            .get(&ArtifactId::parse("cs:trusty/wordpress").unwrap())
            .await
            .unwrap();
        assert!(matches!(charm, Artifact::CharmArchive(_)));
        assert_eq!(std::fs::read(charm.path()).unwrap(), b"charm bytes");

        let bundle = store
            .get_bundle(&ArtifactId::parse("cs:bundle/wiki").unwrap())
            .await
            .unwrap();
        assert!(matches!(bundle, Artifact::BundleArchive(_)));

        let before = fake.requests().len();
        let err = store
            .get(&ArtifactId::parse("cs:bundle/wiki").unwrap())
            .await
            .unwrap_err();
        assert!(matches!(err, TroveError::InvalidRequest(_)));
        let err = store
            .get_bundle(&ArtifactId::parse("cs:trusty/wordpress").unwrap())
            .await
            .unwrap_err();
        assert!(matches!(err, TroveError::InvalidRequest(_)));
        assert_eq!(fake.requests().len(), before);
    }

    #[tokio::test]
    async fn test_test_mode_and_metadata_attrs() {
        let temp_dir = tempfile::tempdir().unwrap();
        let fake = Arc::new(FakeStore::new());
        fake.put_archive("cs:trusty/wordpress", b"charm bytes");

        let mut attrs = BTreeMap::new();
        attrs.insert("environment_uuid".to_string(), "1234".to_string());
        attrs.insert("cloud".to_string(), "aws".to_string());
        let store = store(&fake, temp_dir.path())
            .with_test_mode()
            .with_metadata_attrs(&attrs)
            .unwrap();

        store
            .get(&ArtifactId::parse("cs:trusty/wordpress").unwrap())
            .await
            .unwrap();
        let request = fake.last_request().unwrap();
        assert_eq!(request.path, "/trusty/wordpress/archive?stats=0");
        let values: Vec<&str> = request
            .headers
            .get_all("Trove-Metadata")
            .iter()
            .map(|v| v.to_str().unwrap())
            .collect();
        assert_eq!(values, vec!["cloud=aws", "environment_uuid=1234"]);
    }

    #[tokio::test]
    async fn test_get_resource_returns_verified_data() {
        let temp_dir = tempfile::tempdir().unwrap();
        let fake = Arc::new(FakeStore::new());
        fake.put_resource("trusty/wordpress-0", "db", b"dump");
        let store = store(&fake, temp_dir.path());

        let mut out = Vec::new();
        let data = store
            .get_resource(&ArtifactId::parse("cs:trusty/wordpress-0").unwrap(), "db", None, &mut out)
            .await
            .unwrap();
        assert_eq!(out, b"dump");
        assert_eq!(data.size, 4);
        assert_eq!(data.fingerprint, Fingerprint::generate(b"dump"));
    }

    #[tokio::test]
    async fn test_get_resource_with_oversized_declared_length() {
        let temp_dir = tempfile::tempdir().unwrap();
        let fake = Arc::new(FakeStore::new());
        let hash = crate::verify::compute_hash(b"abc");
        fake.respond_with(
            "GET",
            "/trusty/wordpress-0/resource/db",
            200,
            &[("Content-Sha384", &hash)],
            b"abc".to_vec(),
            Some(1 << 62),
        );
        let store = store(&fake, temp_dir.path());

        let mut out = Vec::new();
        let err = store
            .get_resource(&ArtifactId::parse("cs:trusty/wordpress-0").unwrap(), "db", None, &mut out)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            TroveError::SizeMismatch {
                expected,
                actual: 3
            } if expected == 1 << 62
        ));
        assert_eq!(out, b"abc");
    }

    #[tokio::test]
    async fn test_upload_resource_file_uses_file_name() {
        let temp_dir = tempfile::tempdir().unwrap();
        let fake = Arc::new(FakeStore::new());
        let store = store(&fake, temp_dir.path().join("cache").as_path());
        let file = temp_dir.path().join("dump.sql");
        std::fs::write(&file, b"create table t;").unwrap();

        let id = ArtifactId::parse("cs:~bob/trusty/wordpress-0").unwrap();
        let revision = store
            .upload_resource_file(&id, "db", &file, Arc::new(NoProgress))
            .await
            .unwrap();
        assert_eq!(revision, 0);
        assert_eq!(
            fake.resource_content("~bob/trusty/wordpress-0", "db", 0).unwrap(),
            bytes::Bytes::from_static(b"create table t;")
        );
        let request = fake.last_request().unwrap();
        assert!(request.path.contains("filename=dump.sql"));
    }

    #[tokio::test]
    async fn test_latest_revision() {
        let temp_dir = tempfile::tempdir().unwrap();
        let fake = Arc::new(FakeStore::new());
        fake.respond_json(
            "GET",
            "/meta/any",
            r#"{"cs:trusty/wordpress":{"Meta":{"id-revision":{"Revision":12},"hash256":{"Sum":"abc"}}}}"#,
        );
        let store = store(&fake, temp_dir.path());

        let revision = store
            .latest_revision(&ArtifactId::parse("cs:trusty/wordpress-3").unwrap())
            .await
            .unwrap();
        assert_eq!(revision, 12);
        let err = store
            .latest_revision(&ArtifactId::parse("cs:trusty/mysql").unwrap())
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_infer_repository() {
        let temp_dir = tempfile::tempdir().unwrap();
        let params = CharmStoreParams {
            client: StoreClient::builder().url("http://store.test"),
            cache_dir: temp_dir.path().join("cache"),
        };

        let repo = infer_repository("cs:trusty/wordpress", params.clone(), None)
            .await
            .unwrap();
        assert!(matches!(repo, Repository::Store(_)));

        let repo = infer_repository("local:trusty/wordpress", params.clone(), Some(temp_dir.path()))
            .await
            .unwrap();
        assert!(matches!(repo, Repository::Local(_)));
        assert!(
            infer_repository("local:trusty/wordpress", params.clone(), None)
                .await
                .is_err()
        );

        let charm = temp_dir.path().join("my-charm");
        std::fs::create_dir_all(&charm).unwrap();
        std::fs::write(charm.join("metadata.yaml"), "name: my-charm\nseries: [xenial]\n").unwrap();
        let repo = infer_repository(charm.to_str().unwrap(), params.clone(), None)
            .await
            .unwrap();
        let (id, series) = repo
            .resolve(&ArtifactId::parse("local:xenial/my-charm").unwrap())
            .await
            .unwrap();
        assert_eq!(id.to_string(), "local:xenial/my-charm-0");
        assert!(series.is_empty());

        let missing = temp_dir.path().join("missing");
        let err = infer_repository(missing.to_str().unwrap(), params, None)
            .await
            .err()
            .unwrap();
        assert!(err.to_string().contains("not a valid charm path"));
    }
}
