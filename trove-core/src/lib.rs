//! Trove Core - client library for a charm and bundle store
//!
//! - SHA-384 verified archive downloads into a content-checked local cache
//! - Resumable multipart resource uploads with per-part retries
//! - Local repositories and single-path charms behind one `Repository` type

pub mod artifact;
pub mod cache;
pub mod channel;
pub mod client;
pub mod error;
pub mod fetch;
pub mod id;
pub mod local;
pub mod meta;
pub mod monitor;
pub mod params;
pub mod progress;
pub mod repo;
pub mod resource;
pub mod transport;
pub mod upload;
pub mod verify;

#[cfg(test)]
mod testing;

pub use artifact::{Artifact, ArchiveContent, BundleMetadata, CharmMetadata};
pub use cache::ArchiveCache;
pub use channel::Channel;
pub use client::{DEFAULT_STORE_URL, StoreClient, StoreClientBuilder};
pub use error::{Result, TroveError};
pub use fetch::ArchiveDownload;
pub use id::{ArtifactId, ArtifactKind};
pub use local::{CharmPath, LocalRepository};
pub use meta::{LatestRevision, MetaQuery, MetaResult};
pub use monitor::{Monitor, MonitorProgress, Status, StatusSetter};
pub use params::{ErrorCode, LogLevel, LogType, StatsUpdateRequest};
pub use progress::{NoProgress, Progress};
pub use repo::{CharmStore, CharmStoreParams, Repository, ResourceData, infer_repository};
pub use resource::{Fingerprint, ResourceDownload};
pub use transport::{HttpTransport, Transport};
pub use upload::{ContentSource, FileSource, RangeReader, UploadSession, hash_range};
pub use verify::{ContentDigest, compute_hash, copy_verified};
