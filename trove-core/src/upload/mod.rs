//! Archive and resource uploads.
//!
//! Resources at least [`StoreClient::min_multipart_upload_size`] bytes long
//! go through a resumable multipart session; smaller ones, and any upload
//! to a store without multipart support, are sent in a single request.

pub mod session;
pub mod source;

pub use session::{PartRange, UploadSession};
pub use source::{ContentSource, FileSource, RangeReader, hash_range};

use crate::artifact::Artifact;
use crate::client::{StoreClient, decode_json, query};
use crate::id::ArtifactId;
use crate::params::{
    ArchiveUploadResponse, FinishUploadResponse, Part, ResourceUploadResponse, UploadInfoResponse,
};
use crate::progress::{NoProgress, Progress, progress_stream};
use crate::transport::RequestBody;
use crate::{Result, TroveError};
use reqwest::Method;
use reqwest::header::{CONTENT_TYPE, HeaderMap, HeaderValue};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Attempts made for each part before giving up.
pub const MAX_PART_ATTEMPTS: usize = 10;

/// Content type of uploaded archives, which are gzip-compressed tarballs.
pub const ARCHIVE_CONTENT_TYPE: &str = "application/gzip";

pub struct UploadResourceOperationRequest {
    pub id: ArtifactId,
    pub name: String,
    /// Recorded by the store as the resource's original file name.
    pub filename: String,
    pub content: Arc<dyn ContentSource>,
    pub progress: Arc<dyn Progress>,
    /// Session to resume instead of starting a new one.
    pub upload_id: Option<String>,
}

impl UploadResourceOperationRequest {
    pub fn new(
        id: ArtifactId,
        name: impl Into<String>,
        filename: impl Into<String>,
        content: Arc<dyn ContentSource>,
    ) -> Self {
        Self {
            id,
            name: name.into(),
            filename: filename.into(),
            content,
            progress: Arc::new(NoProgress),
            upload_id: None,
        }
    }

    pub fn progress(mut self, progress: Arc<dyn Progress>) -> Self {
        self.progress = progress;
        self
    }

    pub fn resume(mut self, upload_id: impl Into<String>) -> Self {
        self.upload_id = Some(upload_id.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadResourceOperationResult {
    pub revision: u32,
    /// Empty when the resource was sent in a single request.
    pub upload_id: String,
}

#[derive(Clone)]
pub struct UploadResourceOperation {
    client: StoreClient,
}

impl UploadResourceOperation {
    pub fn new(client: StoreClient) -> Self {
        Self { client }
    }

    pub async fn run(
        &self,
        request: UploadResourceOperationRequest,
    ) -> Result<UploadResourceOperationResult> {
        if request.content.size() >= self.client.min_multipart_upload_size() {
            self.upload_multipart(&request).await
        } else {
            self.upload_single_part(&request).await
        }
    }

    async fn upload_single_part(
        &self,
        request: &UploadResourceOperationRequest,
    ) -> Result<UploadResourceOperationResult> {
        let progress = request.progress.clone();
        progress.start("", None);

        let size = request.content.size();
        let digest = hash_range(request.content.as_ref(), 0, size).await?;

        let path = format!(
            "/{}/resource/{}?{}",
            request.id.path(),
            request.name,
            query(&[("hash", digest.hash.as_str()), ("filename", request.filename.as_str())])
        );
        let body = RequestBody::Stream {
            stream: progress_stream(request.content.open_range(0, size).await?, 0, progress),
            length: size,
        };
        let response = self
            .client
            .do_request(Method::POST, &path, body, octet_stream_headers())
            .await
            .map_err(|e| e.with_context("cannot post resource"))?;
        let result: ResourceUploadResponse = decode_json(response).await?;

        debug!(
            id = %request.id,
            resource = %request.name,
            revision = result.revision,
            size,
            "uploaded resource in a single request"
        );
        Ok(UploadResourceOperationResult {
            revision: result.revision,
            upload_id: String::new(),
        })
    }

    async fn upload_multipart(
        &self,
        request: &UploadResourceOperationRequest,
    ) -> Result<UploadResourceOperationResult> {
        let info = match &request.upload_id {
            None => match self.create_session().await {
                Ok(info) => info,
                Err(e) if e.is_not_found() => {
                    debug!("store has no multipart upload support, sending a single request");
                    return self.upload_single_part(request).await;
                }
                Err(e) => return Err(e),
            },
            Some(upload_id) => self.resume_session(upload_id).await?,
        };

        let mut session = UploadSession::from(info);
        let progress = request.progress.clone();
        progress.start(&session.upload_id, Some(session.expires));

        let total = request.content.size();
        let preferred = session.preferred_part_size(total)?;
        info!(
            upload_id = %session.upload_id,
            size = total,
            part_size = preferred,
            resumed = request.upload_id.is_some(),
            "uploading resource in parts"
        );

        let mut offset = 0;
        let mut index = 0;
        while offset < total {
            if index >= session.max_parts as usize {
                return Err(TroveError::PartSizing(format!(
                    "upload {} needs more than {} parts",
                    session.upload_id, session.max_parts
                )));
            }

            let range = session.choose_part_range(index, offset, total, preferred)?;
            if range.end() <= offset {
                return Err(TroveError::PartSizing(format!(
                    "empty part {} at offset {}",
                    index, offset
                )));
            }

            match range {
                PartRange::Uploaded { end, .. } => {
                    debug!(upload_id = %session.upload_id, part = index, "part already uploaded");
                    progress.transferred(end);
                }
                PartRange::Pending { start, end } => {
                    let hash = self
                        .upload_part(&session.upload_id, index, request, start, end)
                        .await?;
                    session = session.apply_completed(
                        index,
                        Part {
                            offset: start,
                            size: end - start,
                            complete: true,
                            hash,
                        },
                    );
                }
            }
            offset = range.end();
            index += 1;
        }

        progress.finalizing();
        let revision = self.finalize(&session, request).await?;
        info!(
            upload_id = %session.upload_id,
            revision,
            "multipart upload finalized"
        );
        Ok(UploadResourceOperationResult {
            revision,
            upload_id: session.upload_id,
        })
    }

    async fn create_session(&self) -> Result<UploadInfoResponse> {
        let response = self
            .client
            .do_request(Method::POST, "/upload", RequestBody::Empty, HeaderMap::new())
            .await?;
        decode_json(response).await
    }

    async fn resume_session(&self, upload_id: &str) -> Result<UploadInfoResponse> {
        let info: UploadInfoResponse = match self
            .client
            .get_json(&format!("/upload/{}", upload_id))
            .await
        {
            Ok(info) => info,
            Err(e) if e.is_not_found() => {
                return Err(TroveError::UploadSessionNotFound {
                    upload_id: upload_id.to_string(),
                });
            }
            Err(e) => return Err(e),
        };
        if info.upload_id != upload_id {
            return Err(TroveError::protocol(format!(
                "unexpected upload id in response (got {:?} want {:?})",
                info.upload_id, upload_id
            )));
        }
        Ok(info)
    }

    /// Sends `[start, end)` as part `index` and returns its hash.
    ///
    /// The range is hashed once up front and the hash is sent with every
    /// attempt; each attempt streams the range from a freshly opened
    /// reader. Store rejections end the retries at once; any other
    /// failure is reported to the progress sink, which is then rewound to
    /// `start`, and the part is sent again.
    async fn upload_part(
        &self,
        upload_id: &str,
        index: usize,
        request: &UploadResourceOperationRequest,
        start: u64,
        end: u64,
    ) -> Result<String> {
        let len = end - start;
        let hash = hash_range(request.content.as_ref(), start, len).await?.hash;
        let path = format!(
            "/upload/{}/{}?{}",
            upload_id,
            index,
            query(&[("hash", hash.as_str()), ("offset", start.to_string().as_str())])
        );

        let mut attempt = 0;
        loop {
            attempt += 1;
            let reader = request.content.open_range(start, len).await?;
            let body = RequestBody::Stream {
                stream: progress_stream(reader, start, request.progress.clone()),
                length: len,
            };
            match self
                .client
                .do_request(Method::PUT, &path, body, octet_stream_headers())
                .await
            {
                Ok(_) => {
                    debug!(upload_id, part = index, start, end, attempt, "part uploaded");
                    return Ok(hash);
                }
                Err(e) if e.is_api_error() => return Err(e),
                Err(e) if attempt >= MAX_PART_ATTEMPTS => {
                    return Err(TroveError::TooManyAttempts {
                        attempts: attempt,
                        last: Box::new(e),
                    });
                }
                Err(e) => {
                    warn!(upload_id, part = index, attempt, error = %e, "part upload failed, retrying");
                    request.progress.error(&e);
                    request.progress.transferred(start);
                }
            }
        }
    }

    /// Commits the session and attaches the result to the resource. Not
    /// retried: a failure here can be retried by resuming the session.
    async fn finalize(
        &self,
        session: &UploadSession,
        request: &UploadResourceOperationRequest,
    ) -> Result<u32> {
        let _: FinishUploadResponse = self
            .client
            .send_json(
                Method::PUT,
                &format!("/upload/{}", session.upload_id),
                &session.finalize_request(),
            )
            .await?;

        let path = format!(
            "/{}/resource/{}?{}",
            request.id.path(),
            request.name,
            query(&[
                ("upload-id", session.upload_id.as_str()),
                ("filename", request.filename.as_str())
            ])
        );
        let response = self
            .client
            .do_request(Method::POST, &path, RequestBody::Empty, HeaderMap::new())
            .await
            .map_err(|e| e.with_context("cannot post resource"))?;
        let result: ResourceUploadResponse = decode_json(response).await?;
        Ok(result.revision)
    }
}

fn octet_stream_headers() -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(
        CONTENT_TYPE,
        HeaderValue::from_static("application/octet-stream"),
    );
    headers
}

impl StoreClient {
    /// Uploads a resource for `id`, returning its new revision.
    pub async fn upload_resource(
        &self,
        id: &ArtifactId,
        name: &str,
        filename: &str,
        content: Arc<dyn ContentSource>,
        progress: Arc<dyn Progress>,
    ) -> Result<u32> {
        let request = UploadResourceOperationRequest::new(id.clone(), name, filename, content)
            .progress(progress);
        let result = UploadResourceOperation::new(self.clone()).run(request).await?;
        Ok(result.revision)
    }

    /// Like [`StoreClient::upload_resource`], but continues the multipart
    /// session `upload_id`. Fails with `UploadSessionNotFound` when the
    /// store no longer knows the session.
    pub async fn resume_upload_resource(
        &self,
        upload_id: &str,
        id: &ArtifactId,
        name: &str,
        filename: &str,
        content: Arc<dyn ContentSource>,
        progress: Arc<dyn Progress>,
    ) -> Result<u32> {
        let request = UploadResourceOperationRequest::new(id.clone(), name, filename, content)
            .progress(progress)
            .resume(upload_id);
        let result = UploadResourceOperation::new(self.clone()).run(request).await?;
        Ok(result.revision)
    }

    /// Uploads a charm or bundle to `id`, which must not carry a revision.
    /// Returns the id the store assigned.
    pub async fn upload_archive(&self, id: &ArtifactId, artifact: &Artifact) -> Result<ArtifactId> {
        if id.revision.is_some() {
            return Err(TroveError::InvalidRequest(format!(
                "revision specified in {:?}, but should not be specified",
                id.to_string()
            )));
        }
        self.push_archive(id, artifact, None).await
    }

    /// Uploads a charm or bundle to `id`, which must carry a revision.
    /// `promulgated` additionally publishes it under the unowned id with
    /// that revision.
    pub async fn upload_archive_with_revision(
        &self,
        id: &ArtifactId,
        artifact: &Artifact,
        promulgated: Option<u32>,
    ) -> Result<ArtifactId> {
        if id.revision.is_none() {
            return Err(TroveError::InvalidRequest(format!(
                "revision not specified in {:?}",
                id.to_string()
            )));
        }
        self.push_archive(id, artifact, promulgated).await
    }

    async fn push_archive(
        &self,
        id: &ArtifactId,
        artifact: &Artifact,
        promulgated: Option<u32>,
    ) -> Result<ArtifactId> {
        if artifact.kind() != id.kind() {
            return Err(TroveError::InvalidRequest(format!(
                "cannot upload a {} as {}",
                artifact.kind(),
                id
            )));
        }
        let archive = artifact.open_archive().await?;

        let (method, params) = match id.revision {
            None => (Method::POST, vec![("hash", archive.hash.clone())]),
            Some(_) => {
                let mut params = vec![("hash", archive.hash.clone())];
                if let Some(revision) = promulgated {
                    let promulgated_id = id.without_user().with_revision(Some(revision));
                    params.push(("promulgated", promulgated_id.path()));
                }
                (Method::PUT, params)
            }
        };
        let pairs: Vec<(&str, &str)> = params.iter().map(|(k, v)| (*k, v.as_str())).collect();
        let path = format!("/{}/archive?{}", id.path(), query(&pairs));

        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static(ARCHIVE_CONTENT_TYPE));
        let size = archive.size;
        let response = self
            .do_request(method, &path, RequestBody::bytes(archive.data), headers)
            .await
            .map_err(|e| e.with_context("cannot post archive"))?;
        let result: ArchiveUploadResponse = decode_json(response).await?;

        debug!(id = %result.id, size, "archive uploaded");
        ArtifactId::parse(&result.id)
    }
}
