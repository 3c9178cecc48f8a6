use crate::client::{StoreClient, query};
use crate::id::ArtifactId;
use crate::params::{CONTENT_HASH_HEADER, ENTITY_ID_HEADER};
use crate::transport::{BodyStream, RequestBody};
use crate::verify::ContentDigest;
use crate::{Result, TroveError};
use reqwest::Method;
use reqwest::header::HeaderMap;

/// An archive whose headers have been validated but whose body has not
/// been read yet. Dropping it closes the body.
pub struct ArchiveDownload {
    /// Fully qualified id the store resolved the request to.
    pub id: ArtifactId,
    /// Lowercase hex SHA-384 of the body, as advertised by the store.
    pub hash: String,
    pub size: u64,
    pub body: BodyStream,
}

impl ArchiveDownload {
    pub fn digest(&self) -> ContentDigest {
        ContentDigest::new(self.hash.clone(), self.size)
    }
}

impl std::fmt::Debug for ArchiveDownload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArchiveDownload")
            .field("id", &self.id)
            .field("hash", &self.hash)
            .field("size", &self.size)
            .finish_non_exhaustive()
    }
}

impl StoreClient {
    /// Starts downloading the archive of `id`.
    ///
    /// The returned body is unverified; copy it through
    /// [`crate::verify::copy_verified`] with [`ArchiveDownload::digest`].
    pub async fn fetch_archive(&self, id: &ArtifactId) -> Result<ArchiveDownload> {
        let mut path = format!("/{}/archive", id.path());
        if self.stats_disabled() {
            path.push('?');
            path.push_str(&query(&[("stats", "0")]));
        }

        let response = self
            .do_request(Method::GET, &path, RequestBody::Empty, HeaderMap::new())
            .await
            .map_err(|e| e.with_context("cannot get archive"))?;

        // An early return below drops `response` and with it the body.
        let entity_id = response.header(ENTITY_ID_HEADER).ok_or_else(|| {
            TroveError::protocol(format!("no {} header found in response", ENTITY_ID_HEADER))
        })?;
        let canonical = ArtifactId::parse(entity_id).map_err(|e| {
            TroveError::protocol(format!("invalid entity id found in response: {}", e))
        })?;
        if !canonical.is_fully_qualified() {
            return Err(TroveError::protocol(format!(
                "archive get returned not fully qualified entity id {:?}",
                canonical.to_string()
            )));
        }

        let hash = response
            .header(CONTENT_HASH_HEADER)
            .ok_or_else(|| {
                TroveError::protocol(format!(
                    "no {} header found in response",
                    CONTENT_HASH_HEADER
                ))
            })?
            .to_ascii_lowercase();
        if hash.len() != 96 || !hash.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(TroveError::protocol(format!(
                "malformed {} header {:?}",
                CONTENT_HASH_HEADER, hash
            )));
        }

        let size = response
            .content_length
            .ok_or_else(|| TroveError::protocol("no content length found in response"))?;

        Ok(ArchiveDownload {
            id: canonical,
            hash,
            size,
            body: response.body,
        })
    }
}
