//! Persistence boundary of the loader.
//!
//! The archive proper is an external collaborator; this crate defines the
//! operations the loader needs from it, an in-memory implementation used by
//! tests and small deployments, and the dependency-ordered staging layer the
//! orchestrator writes through.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use thiserror::Error;

use hoard_model::{
    Content, Directory, ExtId, ObjectId, Origin, OriginVisit, OriginVisitStatus, Release, Snapshot,
    VisitStatus, VisitType,
};

mod memory;
mod staging;

pub use memory::MemoryStorage;
pub use staging::{BatchLimits, Stager, WriteStats};

/// Errors related to communication with the store.
#[derive(Debug, Error, PartialEq)]
pub enum StoreError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// The operations the loader requires from the archive.
///
/// All `*_add` operations are idempotent on object id: writing an existing id
/// is a no-op. The batched variants return the number of objects actually
/// written, which is what makes uneventful visits detectable.
#[async_trait]
pub trait Storage: Send + Sync {
    async fn content_add(&self, contents: Vec<Content>) -> Result<usize, StoreError>;
    async fn directory_add(&self, directories: Vec<Directory>) -> Result<usize, StoreError>;
    async fn release_add(&self, releases: Vec<Release>) -> Result<usize, StoreError>;
    async fn snapshot_add(&self, snapshot: Snapshot) -> Result<usize, StoreError>;
    async fn extid_add(&self, extids: Vec<ExtId>) -> Result<usize, StoreError>;

    async fn origin_add(&self, origin: Origin) -> Result<(), StoreError>;

    /// Allocates the next visit id for the origin.
    async fn origin_visit_add(
        &self,
        origin: &str,
        visit_type: VisitType,
        date: DateTime<Utc>,
    ) -> Result<OriginVisit, StoreError>;

    async fn origin_visit_status_add(&self, status: OriginVisitStatus) -> Result<(), StoreError>;

    async fn snapshot_get(&self, id: ObjectId) -> Result<Option<Snapshot>, StoreError>;

    /// The snapshot of the most recent visit of `origin` whose terminal
    /// status is one of `allowed_statuses`, if any.
    async fn snapshot_get_latest(
        &self,
        origin: &str,
        allowed_statuses: &[VisitStatus],
    ) -> Result<Option<Snapshot>, StoreError>;

    /// All stored ExtID records of the given type matching any of `extids`.
    async fn extid_get_from_extid(
        &self,
        extid_type: &str,
        extids: &[Bytes],
    ) -> Result<Vec<ExtId>, StoreError>;

    /// Which of `ids` have no stored content. Used by tests and audits, not
    /// by the hot path (staging never pre-checks contents).
    async fn content_missing(&self, ids: &[ObjectId]) -> Result<Vec<ObjectId>, StoreError>;

    async fn directory_get(&self, id: ObjectId) -> Result<Option<Directory>, StoreError>;
    async fn release_get(&self, id: ObjectId) -> Result<Option<Release>, StoreError>;
}

#[async_trait]
impl<A> Storage for A
where
    A: AsRef<dyn Storage> + Send + Sync,
{
    async fn content_add(&self, contents: Vec<Content>) -> Result<usize, StoreError> {
        self.as_ref().content_add(contents).await
    }

    async fn directory_add(&self, directories: Vec<Directory>) -> Result<usize, StoreError> {
        self.as_ref().directory_add(directories).await
    }

    async fn release_add(&self, releases: Vec<Release>) -> Result<usize, StoreError> {
        self.as_ref().release_add(releases).await
    }

    async fn snapshot_add(&self, snapshot: Snapshot) -> Result<usize, StoreError> {
        self.as_ref().snapshot_add(snapshot).await
    }

    async fn extid_add(&self, extids: Vec<ExtId>) -> Result<usize, StoreError> {
        self.as_ref().extid_add(extids).await
    }

    async fn origin_add(&self, origin: Origin) -> Result<(), StoreError> {
        self.as_ref().origin_add(origin).await
    }

    async fn origin_visit_add(
        &self,
        origin: &str,
        visit_type: VisitType,
        date: DateTime<Utc>,
    ) -> Result<OriginVisit, StoreError> {
        self.as_ref()
            .origin_visit_add(origin, visit_type, date)
            .await
    }

    async fn origin_visit_status_add(&self, status: OriginVisitStatus) -> Result<(), StoreError> {
        self.as_ref().origin_visit_status_add(status).await
    }

    async fn snapshot_get(&self, id: ObjectId) -> Result<Option<Snapshot>, StoreError> {
        self.as_ref().snapshot_get(id).await
    }

    async fn snapshot_get_latest(
        &self,
        origin: &str,
        allowed_statuses: &[VisitStatus],
    ) -> Result<Option<Snapshot>, StoreError> {
        self.as_ref()
            .snapshot_get_latest(origin, allowed_statuses)
            .await
    }

    async fn extid_get_from_extid(
        &self,
        extid_type: &str,
        extids: &[Bytes],
    ) -> Result<Vec<ExtId>, StoreError> {
        self.as_ref().extid_get_from_extid(extid_type, extids).await
    }

    async fn content_missing(&self, ids: &[ObjectId]) -> Result<Vec<ObjectId>, StoreError> {
        self.as_ref().content_missing(ids).await
    }

    async fn directory_get(&self, id: ObjectId) -> Result<Option<Directory>, StoreError> {
        self.as_ref().directory_get(id).await
    }

    async fn release_get(&self, id: ObjectId) -> Result<Option<Release>, StoreError> {
        self.as_ref().release_get(id).await
    }
}
