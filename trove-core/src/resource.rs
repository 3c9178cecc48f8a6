//! Resources attached to charms.

use crate::client::{StoreClient, query};
use crate::id::ArtifactId;
use crate::params::{
    CONTENT_HASH_HEADER, DockerInfoResponse, DockerResourceUploadRequest, Resource,
    ResourceUploadResponse,
};
use crate::transport::{BodyStream, RequestBody};
use crate::verify::hashing_copy;
use crate::{Result, TroveError};
use reqwest::Method;
use reqwest::header::HeaderMap;
use sha2::{Digest, Sha384};
use std::fmt;
use std::str::FromStr;
use tokio::io::AsyncWrite;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FingerprintAlgorithm {
    Sha384,
}

impl FingerprintAlgorithm {
    pub fn as_str(&self) -> &'static str {
        match self {
            FingerprintAlgorithm::Sha384 => "sha384",
        }
    }

    fn digest_len(&self) -> usize {
        match self {
            FingerprintAlgorithm::Sha384 => 48,
        }
    }
}

/// Content digest of a resource, tagged with the algorithm that produced it.
///
/// Rendered as `<algorithm>:<hex>`. Kept apart from archive hashes, which
/// are plain hex strings.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint {
    algorithm: FingerprintAlgorithm,
    digest: Vec<u8>,
}

impl Fingerprint {
    pub fn generate(data: &[u8]) -> Self {
        Self {
            algorithm: FingerprintAlgorithm::Sha384,
            digest: Sha384::digest(data).to_vec(),
        }
    }

    pub fn from_hex(algorithm: FingerprintAlgorithm, hex_digest: &str) -> Result<Self> {
        let digest = hex::decode(hex_digest.trim()).map_err(|e| {
            TroveError::protocol(format!("invalid fingerprint {:?}: {}", hex_digest, e))
        })?;
        if digest.len() != algorithm.digest_len() {
            return Err(TroveError::protocol(format!(
                "invalid {} fingerprint length {} (want {})",
                algorithm.as_str(),
                digest.len(),
                algorithm.digest_len()
            )));
        }
        Ok(Self { algorithm, digest })
    }

    /// Parses `sha384:<hex>`; bare hex is read as SHA-384.
    pub fn parse(s: &str) -> Result<Self> {
        match s.split_once(':') {
            Some(("sha384", hex_digest)) => Self::from_hex(FingerprintAlgorithm::Sha384, hex_digest),
            Some((other, _)) => Err(TroveError::protocol(format!(
                "unsupported fingerprint algorithm {:?}",
                other
            ))),
            None => Self::from_hex(FingerprintAlgorithm::Sha384, s),
        }
    }

    pub fn algorithm(&self) -> FingerprintAlgorithm {
        self.algorithm
    }

    pub fn hex(&self) -> String {
        hex::encode(&self.digest)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.digest
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.algorithm.as_str(), self.hex())
    }
}

impl FromStr for Fingerprint {
    type Err = TroveError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl Resource {
    pub fn parsed_fingerprint(&self) -> Result<Fingerprint> {
        Fingerprint::parse(&self.fingerprint)
    }
}

/// An open resource body. Dropping it closes the body.
pub struct ResourceDownload {
    pub fingerprint: Fingerprint,
    /// Declared length, when the store sent one.
    pub size: Option<u64>,
    pub body: BodyStream,
}

impl ResourceDownload {
    /// Copies the body into `dest`, failing if it does not match the
    /// advertised fingerprint or length.
    pub async fn copy_verified<W>(self, dest: &mut W) -> Result<u64>
    where
        W: AsyncWrite + Unpin,
    {
        let (digest, copied) = hashing_copy::<Sha384, _, _>(self.body, dest, |e| {
            TroveError::transport("cannot read resource body", e)
        })
        .await?;

        if let Some(size) = self.size {
            if size != copied {
                return Err(TroveError::SizeMismatch {
                    expected: size,
                    actual: copied,
                });
            }
        }
        let actual = Fingerprint {
            algorithm: FingerprintAlgorithm::Sha384,
            digest,
        };
        if actual != self.fingerprint {
            return Err(TroveError::HashMismatch {
                expected: self.fingerprint.to_string(),
                actual: actual.to_string(),
            });
        }
        Ok(copied)
    }
}

fn revision_suffix(revision: Option<u32>) -> String {
    revision.map(|r| format!("/{}", r)).unwrap_or_default()
}

impl StoreClient {
    /// Opens resource `name` of `id`; `None` selects the latest revision.
    pub async fn get_resource(
        &self,
        id: &ArtifactId,
        name: &str,
        revision: Option<u32>,
    ) -> Result<ResourceDownload> {
        let path = format!("/{}/resource/{}{}", id.path(), name, revision_suffix(revision));
        let response = self
            .do_request(Method::GET, &path, RequestBody::Empty, HeaderMap::new())
            .await
            .map_err(|e| e.with_context("cannot get resource"))?;

        let hash = response.header(CONTENT_HASH_HEADER).ok_or_else(|| {
            TroveError::protocol(format!("no {} header found in response", CONTENT_HASH_HEADER))
        })?;
        let fingerprint = Fingerprint::from_hex(FingerprintAlgorithm::Sha384, hash)?;

        Ok(ResourceDownload {
            fingerprint,
            size: response.content_length,
            body: response.body,
        })
    }

    pub async fn resource_meta(
        &self,
        id: &ArtifactId,
        name: &str,
        revision: Option<u32>,
    ) -> Result<Resource> {
        let path = format!(
            "/{}/meta/resources/{}{}",
            id.path(),
            name,
            revision_suffix(revision)
        );
        self.get_json(&path)
            .await
            .map_err(|e| e.with_context(&format!("cannot get {:?}", path)))
    }

    pub async fn list_resources(&self, id: &ArtifactId) -> Result<Vec<Resource>> {
        self.get_json(&format!("/{}/meta/resources", id.path()))
            .await
            .map_err(|e| e.with_context("cannot get resource metadata from the store"))
    }

    /// Records docker image `digest` as a new revision of resource `name`.
    /// `image_name` is empty when the image was pushed to the store's own
    /// registry.
    pub async fn add_docker_resource(
        &self,
        id: &ArtifactId,
        name: &str,
        image_name: &str,
        digest: &str,
    ) -> Result<u32> {
        let request = DockerResourceUploadRequest {
            digest: digest.to_string(),
            image_name: image_name.to_string(),
        };
        let response: ResourceUploadResponse = self
            .send_json(
                Method::POST,
                &format!("/{}/resource/{}", id.path(), name),
                &request,
            )
            .await?;
        Ok(response.revision)
    }

    /// Where to pull the docker image of resource `name` from.
    pub async fn docker_resource_download_info(
        &self,
        id: &ArtifactId,
        name: &str,
    ) -> Result<DockerInfoResponse> {
        self.get_json(&format!("/{}/resource/{}", id.path(), name))
            .await
    }

    /// The tag and push credentials for uploading a docker image for
    /// resource `name`.
    pub async fn docker_resource_upload_info(
        &self,
        id: &ArtifactId,
        name: &str,
    ) -> Result<DockerInfoResponse> {
        self.get_json(&format!(
            "/{}/docker-resource-upload-info?{}",
            id.path(),
            query(&[("resource-name", name)])
        ))
        .await
    }
}
