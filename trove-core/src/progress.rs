use crate::TroveError;
use crate::transport::UploadStream;
use crate::upload::RangeReader;
use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use std::sync::Arc;
use tokio_util::io::ReaderStream;

/// Size of the slices an upload body is fed to the transport in.
pub const PROGRESS_CHUNK_SIZE: usize = 64 * 1024;

/// Receives notifications about an upload in progress.
///
/// Events arrive in this order: one `start`, then any number of
/// `transferred` and `error` calls, then `finalizing` once all parts of a
/// multipart upload have been sent. The transferred total may go down after
/// an `error` because the failed part is sent again from its start.
pub trait Progress: Send + Sync {
    /// `upload_id` is empty when the payload is sent in a single request.
    fn start(&self, upload_id: &str, expires: Option<DateTime<Utc>>);

    fn transferred(&self, total: u64);

    /// A non-fatal error; the failed request is about to be retried.
    fn error(&self, err: &TroveError);

    fn finalizing(&self);
}

pub struct NoProgress;

impl Progress for NoProgress {
    fn start(&self, _upload_id: &str, _expires: Option<DateTime<Utc>>) {}

    fn transferred(&self, _total: u64) {}

    fn error(&self, _err: &TroveError) {}

    fn finalizing(&self) {}
}

/// Streams `reader` as a request body, reporting `start + bytes sent so
/// far` to `progress` as each chunk is pulled by the transport.
pub fn progress_stream(reader: RangeReader, start: u64, progress: Arc<dyn Progress>) -> UploadStream {
    let mut sent = start;
    Box::pin(
        ReaderStream::with_capacity(reader, PROGRESS_CHUNK_SIZE).map(move |chunk| {
            let chunk = chunk?;
            sent += chunk.len() as u64;
            progress.transferred(sent);
            Ok(chunk)
        }),
    )
}

const KIB: u64 = 1024;
const MIB: u64 = 1024 * KIB;
const GIB: u64 = 1024 * MIB;

pub fn format_byte_count(n: u64) -> String {
    if n < 10 * MIB {
        format!("{:.0}KiB", n as f64 / KIB as f64)
    } else if n < 10 * GIB {
        format!("{:.1}MiB", n as f64 / MIB as f64)
    } else {
        format!("{:.1}GiB", n as f64 / GIB as f64)
    }
}
