use crate::verify::{ContentDigest, HASH_CHUNK_SIZE, hash_stream};
use crate::{Result, TroveError};
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use std::io::{Cursor, SeekFrom};
use std::path::{Path, PathBuf};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeekExt};
use tokio_util::io::ReaderStream;

/// Reader over one range of a [`ContentSource`].
pub type RangeReader = Box<dyn AsyncRead + Send + Sync + Unpin>;

/// Random-access content being uploaded.
///
/// Each range is opened independently, so a retried part is read again
/// from its start rather than from wherever a previous attempt stopped.
#[async_trait]
pub trait ContentSource: Send + Sync {
    fn size(&self) -> u64;

    /// Opens a reader that yields at most `len` bytes starting at `offset`.
    async fn open_range(&self, offset: u64, len: u64) -> Result<RangeReader>;
}

#[async_trait]
impl ContentSource for Bytes {
    fn size(&self) -> u64 {
        self.len() as u64
    }

    async fn open_range(&self, offset: u64, len: u64) -> Result<RangeReader> {
        let end = offset.saturating_add(len);
        if end > self.size() {
            return Err(changed_underfoot(self.size(), offset, len));
        }
        Ok(Box::new(Cursor::new(self.slice(offset as usize..end as usize))))
    }
}

/// A file on disk whose size is captured when it is opened.
#[derive(Debug, Clone)]
pub struct FileSource {
    path: PathBuf,
    size: u64,
}

impl FileSource {
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let metadata = tokio::fs::metadata(&path).await?;
        if !metadata.is_file() {
            return Err(TroveError::InvalidRequest(format!(
                "{} is not a regular file",
                path.display()
            )));
        }
        Ok(Self {
            path,
            size: metadata.len(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl ContentSource for FileSource {
    fn size(&self) -> u64 {
        self.size
    }

    async fn open_range(&self, offset: u64, len: u64) -> Result<RangeReader> {
        let mut file = tokio::fs::File::open(&self.path).await?;
        file.seek(SeekFrom::Start(offset)).await?;
        Ok(Box::new(file.take(len)))
    }
}

/// Hashes `len` bytes of `source` starting at `offset` in one streaming
/// pass. Fails if the source no longer holds that many bytes.
pub async fn hash_range(source: &dyn ContentSource, offset: u64, len: u64) -> Result<ContentDigest> {
    let reader = source.open_range(offset, len).await?;
    let digest = hash_stream(ReaderStream::with_capacity(reader, HASH_CHUNK_SIZE).boxed()).await?;
    if digest.size != len {
        return Err(changed_underfoot(source.size(), offset, len));
    }
    Ok(digest)
}

fn changed_underfoot(size: u64, offset: u64, len: u64) -> TroveError {
    TroveError::InvalidRequest(format!(
        "content changed underfoot? (initial size {}, cannot read {} bytes at offset {})",
        size, len, offset
    ))
}
