//! Integrity checks for archive and part content.
//!
//! Archives and upload parts are hashed with SHA-384 and compared as
//! lowercase hex. Resource fingerprints use their own type, see
//! [`crate::resource::Fingerprint`].

use crate::transport::BodyStream;
use crate::{Result, TroveError};
use futures_util::StreamExt;
use sha2::{Digest, Sha384};
use std::path::Path;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio_util::io::ReaderStream;

/// Read size used when hashing files and upload ranges.
pub const HASH_CHUNK_SIZE: usize = 64 * 1024;

/// Expected hash and size of some content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentDigest {
    pub hash: String,
    pub size: u64,
}

impl ContentDigest {
    pub fn new(hash: impl Into<String>, size: u64) -> Self {
        Self {
            hash: hash.into(),
            size,
        }
    }

    pub fn of(data: &[u8]) -> Self {
        Self {
            hash: compute_hash(data),
            size: data.len() as u64,
        }
    }

    /// Compares observed values against this digest. Size is checked first.
    pub fn check(&self, actual_hash: &str, actual_size: u64) -> Result<()> {
        if actual_size != self.size {
            return Err(TroveError::SizeMismatch {
                expected: self.size,
                actual: actual_size,
            });
        }
        if !actual_hash.eq_ignore_ascii_case(&self.hash) {
            return Err(TroveError::HashMismatch {
                expected: self.hash.clone(),
                actual: actual_hash.to_string(),
            });
        }
        Ok(())
    }
}

/// Compute the SHA-384 hash of data as lowercase hex.
pub fn compute_hash(data: &[u8]) -> String {
    let mut hasher = Sha384::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Verify that data matches the expected hash and size.
pub fn verify_bytes(data: &[u8], expected: &ContentDigest) -> Result<()> {
    expected.check(&compute_hash(data), data.len() as u64)
}

/// Copies `body` into `dest`, feeding every chunk to a `D` hasher. Read
/// failures are mapped through `read_error`. Returns the finished digest
/// and the number of bytes copied.
pub(crate) async fn hashing_copy<D, W, E>(
    mut body: BodyStream,
    dest: &mut W,
    read_error: E,
) -> Result<(Vec<u8>, u64)>
where
    D: Digest,
    W: AsyncWrite + Unpin,
    E: Fn(std::io::Error) -> TroveError,
{
    let mut hasher = D::new();
    let mut size = 0u64;
    while let Some(chunk) = body.next().await {
        let chunk = chunk.map_err(&read_error)?;
        hasher.update(&chunk);
        dest.write_all(&chunk).await?;
        size += chunk.len() as u64;
    }
    dest.flush().await?;
    Ok((hasher.finalize().to_vec(), size))
}

/// Copies `body` into `dest` while hashing it, then checks the result
/// against `expected`. Returns the number of bytes copied.
pub async fn copy_verified<W>(
    body: BodyStream,
    dest: &mut W,
    expected: &ContentDigest,
) -> Result<u64>
where
    W: AsyncWrite + Unpin,
{
    let (digest, size) = hashing_copy::<Sha384, _, _>(body, dest, |e| {
        TroveError::transport("cannot read archive body", e)
    })
    .await?;
    expected.check(&hex::encode(digest), size)?;
    Ok(size)
}

/// Hashes a stream without keeping its content.
pub async fn hash_stream(body: BodyStream) -> Result<ContentDigest> {
    let (digest, size) =
        hashing_copy::<Sha384, _, _>(body, &mut tokio::io::sink(), TroveError::Io).await?;
    Ok(ContentDigest::new(hex::encode(digest), size))
}

/// Hashes a file on disk.
pub async fn hash_file(path: &Path) -> Result<ContentDigest> {
    let file = tokio::fs::File::open(path).await?;
    hash_stream(ReaderStream::with_capacity(file, HASH_CHUNK_SIZE).boxed()).await
}

/// Checks an existing file against `expected`.
pub async fn verify_file(path: &Path, expected: &ContentDigest) -> Result<()> {
    let actual = hash_file(path).await?;
    expected.check(&actual.hash, actual.size)
}
