use crate::params::{Part, Parts, UploadInfoResponse};
use crate::{Result, TroveError};
use chrono::{DateTime, Utc};

/// Snapshot of a multipart upload session.
///
/// A snapshot is never changed in place: recording a finished part yields
/// a new snapshot through [`UploadSession::apply_completed`]. A session
/// must only be driven by one caller at a time; resuming the same upload
/// id from two places corrupts the server-side part bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadSession {
    pub upload_id: String,
    pub expires: DateTime<Utc>,
    pub min_part_size: u64,
    pub max_part_size: u64,
    pub max_parts: u32,
    pub parts: Vec<Part>,
}

/// Byte range `[start, end)` chosen for one part index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartRange {
    /// The server already holds this part.
    Uploaded { start: u64, end: u64 },
    /// This part must be sent.
    Pending { start: u64, end: u64 },
}

impl PartRange {
    pub fn end(&self) -> u64 {
        match self {
            PartRange::Uploaded { end, .. } | PartRange::Pending { end, .. } => *end,
        }
    }
}

impl From<UploadInfoResponse> for UploadSession {
    fn from(info: UploadInfoResponse) -> Self {
        Self {
            upload_id: info.upload_id,
            expires: info.expires,
            min_part_size: info.min_part_size,
            max_part_size: info.max_part_size,
            max_parts: info.max_parts,
            parts: info.parts,
        }
    }
}

impl UploadSession {
    /// Largest payload this session can accept.
    pub fn max_payload_size(&self) -> u64 {
        self.max_part_size.saturating_mul(self.max_parts as u64)
    }

    /// Part size used wherever no server-side boundary constrains the
    /// choice: `ceil(total / max_parts)` raised to at least
    /// `min_part_size`.
    pub fn preferred_part_size(&self, total: u64) -> Result<u64> {
        if self.max_parts == 0 {
            return Err(TroveError::PartSizing(format!(
                "upload {} allows no parts",
                self.upload_id
            )));
        }
        let max_parts = self.max_parts as u64;
        let preferred = total.div_ceil(max_parts);
        if preferred > self.max_part_size {
            return Err(TroveError::PayloadTooLarge {
                max_bytes: self.max_payload_size(),
            });
        }
        Ok(preferred.max(self.min_part_size).max(1))
    }

    /// Chooses the range for part `index`, which starts at `offset`.
    ///
    /// - a part the session already records as complete is kept, provided
    ///   it starts where the previous part ended
    /// - a gap ending at the immediately following complete part becomes
    ///   exactly one part, which must respect the part size bounds
    /// - a wider gap is shared evenly by the parts in it, the last of them
    ///   taking any remainder
    /// - with no complete part ahead, the preferred size is used
    pub fn choose_part_range(
        &self,
        index: usize,
        offset: u64,
        total: u64,
        preferred: u64,
    ) -> Result<PartRange> {
        if let Some(part) = self.parts.get(index).filter(|part| part.complete) {
            if part.offset != offset {
                return Err(TroveError::protocol(format!(
                    "offset mismatch at part {} (want {} got {})",
                    index, offset, part.offset
                )));
            }
            return Ok(PartRange::Uploaded {
                start: offset,
                end: offset + part.size,
            });
        }

        let next_uploaded = self
            .parts
            .iter()
            .enumerate()
            .skip(index + 1)
            .find(|(_, part)| part.is_valid())
            .map(|(next, part)| (next, part.offset));

        match next_uploaded {
            None => Ok(PartRange::Pending {
                start: offset,
                end: offset.saturating_add(preferred).min(total),
            }),
            Some((next, next_offset)) if next == index + 1 => {
                let size = next_offset.checked_sub(offset).ok_or_else(|| {
                    TroveError::protocol(format!(
                        "part {} starts at {} before current offset {}",
                        next, next_offset, offset
                    ))
                })?;
                if size < self.min_part_size {
                    return Err(TroveError::PartSizing(format!(
                        "remaining part {} is too small ({} bytes, minimum {})",
                        index, size, self.min_part_size
                    )));
                }
                if size > self.max_part_size {
                    return Err(TroveError::PartSizing(format!(
                        "remaining part {} is too large ({} bytes, maximum {})",
                        index, size, self.max_part_size
                    )));
                }
                Ok(PartRange::Pending {
                    start: offset,
                    end: next_offset,
                })
            }
            Some((next, next_offset)) => {
                let gap = next_offset.checked_sub(offset).ok_or_else(|| {
                    TroveError::protocol(format!(
                        "part {} starts at {} before current offset {}",
                        next, next_offset, offset
                    ))
                })?;
                let size = gap / (next - index) as u64;
                Ok(PartRange::Pending {
                    start: offset,
                    end: offset + size,
                })
            }
        }
    }

    /// Returns a snapshot with `part` recorded at `index`.
    pub fn apply_completed(&self, index: usize, part: Part) -> UploadSession {
        let mut next = self.clone();
        if index < next.parts.len() {
            next.parts[index] = part;
        } else {
            next.parts.resize(index, Part::default());
            next.parts.push(part);
        }
        next
    }

    /// Body of the finalize request.
    pub fn finalize_request(&self) -> Parts {
        Parts {
            parts: self.parts.clone(),
        }
    }
}
