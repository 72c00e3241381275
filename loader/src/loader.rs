//! The package-loader orchestrator.
//!
//! `load()` drives one visit of one origin: enumerate versions through the
//! adapter, materialise each artifact (fetch, unpack, hash), wrap it into a
//! synthetic release, assemble the snapshot and commit everything in
//! dependency order. One bad artifact loses its branch, not the visit; the
//! visit-status machine records how far we got.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::time::Duration;

use bytes::Bytes;
use chrono::Utc;
use futures::StreamExt;
use serde::Deserialize;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};
use url::Url;

use hoard_model::{
    BranchTarget, ExtId, ExtIdTargetType, ObjectId, Origin, OriginVisit, OriginVisitStatus,
    Snapshot, VisitStatus,
};
use hoard_store::{BatchLimits, Stager, Storage, StoreError, WriteStats};

use crate::adapters::{release_branch, PackageAdapter, PackageInfo};
use crate::errors::{AdapterError, ArchiveError, FetchError};
use crate::fetch::{FetchConfig, Fetcher};
use crate::ingest::{ingest_tree, IngestError};
use crate::unpack::{unpack, ArchiveKind};

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct LoaderConfig {
    pub fetch: FetchConfig,
    pub batch: BatchLimits,
    /// Concurrent artifact downloads within one version. 1 disables
    /// prefetching entirely; processing order is sequential either way.
    pub fetch_concurrency: usize,
    /// Attempts per store checkpoint before the visit gives up.
    pub store_attempts: u32,
    pub store_retry_delay: Duration,
    /// Wall-clock cap for one artifact, fetch to release.
    pub artifact_timeout: Duration,
    /// Wall-clock cap for the whole visit.
    pub visit_timeout: Duration,
    /// Where per-visit scratch directories live; the system temp dir if
    /// unset.
    pub scratch_root: Option<PathBuf>,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            fetch: FetchConfig::default(),
            batch: BatchLimits::default(),
            fetch_concurrency: 4,
            store_attempts: 3,
            store_retry_delay: Duration::from_secs(1),
            artifact_timeout: Duration::from_secs(3600),
            visit_timeout: Duration::from_secs(6 * 3600),
            scratch_root: None,
        }
    }
}

/// Why one branch fell out of the snapshot.
#[derive(Debug, Error)]
pub enum BranchError {
    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error(transparent)]
    Archive(#[from] ArchiveError),

    #[error(transparent)]
    Ingest(#[from] IngestError),

    #[error("building release: {0}")]
    Adapter(AdapterError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("artifact processing exceeded the wall-clock cap")]
    Timeout,
}

impl BranchError {
    fn store_error(&self) -> Option<&StoreError> {
        match self {
            BranchError::Store(e) | BranchError::Ingest(IngestError::Store(e)) => Some(e),
            _ => None,
        }
    }
}

/// One dropped branch, with enough context to reproduce the failure.
#[derive(Debug)]
pub struct BranchFailure {
    pub branch: String,
    pub version: String,
    pub url: Option<Url>,
    pub error: BranchError,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LoadStats {
    /// Branches ingested (or deduplicated within) this visit.
    pub new_branches: usize,
    /// Branches carried over unchanged from the previous snapshot.
    pub reused_branches: usize,
    pub write: WriteStats,
}

/// What `load()` always returns; no error escapes it.
#[derive(Debug)]
pub struct LoadResult {
    pub origin: String,
    /// 0 when the visit row itself could not be created.
    pub visit: u64,
    pub status: VisitStatus,
    pub snapshot: Option<ObjectId>,
    /// The visit completed but wrote no new objects.
    pub uneventful: bool,
    pub stats: LoadStats,
    pub failures: Vec<BranchFailure>,
    /// Visit-level error, when the terminal status is failed/not_found.
    pub error: Option<String>,
}

/// Visit-level failures: these short-circuit to the terminal status write.
#[derive(Debug, Error)]
enum VisitError {
    #[error("origin not found upstream")]
    NotFound,

    #[error("adapter failure: {0}")]
    Adapter(AdapterError),

    #[error("store failure: {0}")]
    Store(StoreError),

    #[error("cannot create scratch directory: {0}")]
    Scratch(std::io::Error),

    #[error("visit cancelled")]
    Cancelled,

    #[error("visit exceeded the wall-clock cap")]
    Timeout,
}

impl VisitError {
    fn from_adapter(e: AdapterError) -> Self {
        match e {
            AdapterError::NotFound => VisitError::NotFound,
            other => VisitError::Adapter(other),
        }
    }

    fn terminal_status(&self) -> VisitStatus {
        match self {
            VisitError::NotFound => VisitStatus::NotFound,
            _ => VisitStatus::Failed,
        }
    }
}

struct VisitOutcome {
    status: VisitStatus,
    snapshot: Option<ObjectId>,
    stats: LoadStats,
    failures: Vec<BranchFailure>,
}

/// Drives visits against one storage backend. One `load()` call is one
/// logical task; there is no shared mutable state across calls beyond the
/// storage itself.
pub struct Loader<S> {
    storage: S,
    config: LoaderConfig,
    cancel: CancellationToken,
}

impl<S: Storage> Loader<S> {
    pub fn new(storage: S, config: LoaderConfig) -> Self {
        Self {
            storage,
            config,
            cancel: CancellationToken::new(),
        }
    }

    /// Handle for cancelling in-flight visits from outside.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Loads `origin` through `adapter`. Never fails: every outcome,
    /// including visit-level errors, is folded into the returned
    /// [`LoadResult`].
    #[instrument(skip_all, fields(origin = origin, visit_type = %adapter.visit_type()))]
    pub async fn load(&self, origin: &str, adapter: &dyn PackageAdapter) -> LoadResult {
        let visit = match self.start_visit(origin, adapter).await {
            Ok(visit) => visit,
            Err(e) => {
                warn!(%e, "could not open the visit");
                return LoadResult {
                    origin: origin.to_string(),
                    visit: 0,
                    status: VisitStatus::Failed,
                    snapshot: None,
                    uneventful: false,
                    stats: LoadStats::default(),
                    failures: Vec::new(),
                    error: Some(e.to_string()),
                };
            }
        };

        let body = self.visit_body(origin, adapter, &visit);
        tokio::pin!(body);
        let outcome = tokio::select! {
            _ = self.cancel.cancelled() => Err(VisitError::Cancelled),
            result = tokio::time::timeout(self.config.visit_timeout, &mut body) => {
                match result {
                    Err(_) => Err(VisitError::Timeout),
                    Ok(inner) => inner,
                }
            }
        };

        let (status, snapshot, stats, failures, mut error) = match outcome {
            Ok(outcome) => (
                outcome.status,
                outcome.snapshot,
                outcome.stats,
                outcome.failures,
                None,
            ),
            Err(e) => {
                warn!(%e, "visit aborted");
                (
                    e.terminal_status(),
                    None,
                    LoadStats::default(),
                    Vec::new(),
                    Some(e.to_string()),
                )
            }
        };

        // Best-effort terminal status; the result reports the computed
        // status even if the write keeps failing.
        if let Err(e) = self.write_status(origin, visit.visit, status, snapshot).await {
            warn!(%e, "could not record the terminal visit status");
            error.get_or_insert_with(|| e.to_string());
        }

        LoadResult {
            origin: origin.to_string(),
            visit: visit.visit,
            status,
            snapshot,
            uneventful: matches!(status, VisitStatus::Full | VisitStatus::Partial)
                && stats.write.total() == 0,
            stats,
            failures,
            error,
        }
    }

    async fn start_visit(
        &self,
        origin: &str,
        adapter: &dyn PackageAdapter,
    ) -> Result<OriginVisit, StoreError> {
        self.storage.origin_add(Origin::new(origin)).await?;
        let visit = self
            .storage
            .origin_visit_add(origin, adapter.visit_type(), Utc::now())
            .await?;
        self.write_status(origin, visit.visit, VisitStatus::Created, None)
            .await?;
        Ok(visit)
    }

    async fn visit_body(
        &self,
        origin: &str,
        adapter: &dyn PackageAdapter,
        visit: &OriginVisit,
    ) -> Result<VisitOutcome, VisitError> {
        self.write_status(origin, visit.visit, VisitStatus::Ongoing, None)
            .await
            .map_err(VisitError::Store)?;

        // The scratch dir is exclusive to this visit and removed on drop,
        // whichever way the visit ends.
        let scratch = match &self.config.scratch_root {
            Some(root) => tempfile::Builder::new().prefix("visit-").tempdir_in(root),
            None => tempfile::Builder::new().prefix("visit-").tempdir(),
        }
        .map_err(VisitError::Scratch)?;
        let fetcher = Fetcher::new(scratch.path(), self.config.fetch.clone());

        let versions = adapter
            .get_versions(&fetcher)
            .await
            .map_err(VisitError::from_adapter)?;
        let default_version = adapter
            .get_default_version(&fetcher)
            .await
            .map_err(VisitError::from_adapter)?;
        let previous = self
            .storage
            .snapshot_get_latest(origin, &[VisitStatus::Full, VisitStatus::Partial])
            .await
            .map_err(VisitError::Store)?;

        let mut snapshot = Snapshot::new();
        let mut failures: Vec<BranchFailure> = Vec::new();
        let mut new_branches = 0;
        let mut reused_branches = 0;
        // extid -> release id, for versions sharing one artifact.
        let mut seen_extids: HashMap<(String, Bytes), ObjectId> = HashMap::new();
        let mut stager = Stager::new(&self.storage, self.config.batch);

        for version in &versions {
            let infos = match adapter.get_package_info(&fetcher, version).await {
                Ok(infos) => infos,
                Err(e) => {
                    warn!(%version, %e, "cannot enumerate artifacts");
                    failures.push(BranchFailure {
                        branch: release_branch(version),
                        version: version.clone(),
                        url: None,
                        error: BranchError::Adapter(e),
                    });
                    continue;
                }
            };

            // Branch collisions are an adapter bug; last-writer-wins would
            // silently drop a release.
            let mut names = HashSet::new();
            for (branch, _) in &infos {
                if !names.insert(branch.clone()) {
                    return Err(VisitError::Adapter(AdapterError::Inconsistent(format!(
                        "duplicate branch {} in version {}",
                        branch, version
                    ))));
                }
            }

            // Warm the per-visit download cache across this version's
            // artifacts; failures surface during sequential processing.
            if adapter.parallel_fetch() && self.config.fetch_concurrency > 1 && infos.len() > 1 {
                let mut prefetches: Vec<std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send + '_>>> =
                    Vec::with_capacity(infos.len());
                for (_, info) in &infos {
                    prefetches.push(Box::pin(prefetch_one(&fetcher, info)));
                }
                futures::stream::iter(prefetches)
                    .buffer_unordered(self.config.fetch_concurrency)
                    .collect::<Vec<()>>()
                    .await;
            }

            for (branch, info) in infos {
                let branch_bytes = Bytes::from(branch.clone().into_bytes());

                if adapter.reuse_known_artifacts() {
                    if let Some(prev_release) = self
                        .known_release(previous.as_ref(), &branch_bytes, &info)
                        .await
                        .map_err(VisitError::Store)?
                    {
                        debug!(%branch, "branch unchanged since the previous snapshot");
                        snapshot
                            .add_branch(branch_bytes, BranchTarget::Release(prev_release))
                            .map_err(|e| {
                                VisitError::Adapter(AdapterError::Inconsistent(e.to_string()))
                            })?;
                        reused_branches += 1;
                        continue;
                    }
                }

                if let Some(claim) = &info.extid {
                    if let Some(release_id) = seen_extids.get(&claim.key()) {
                        debug!(%branch, "artifact already ingested this visit");
                        snapshot
                            .add_branch(branch_bytes, BranchTarget::Release(*release_id))
                            .map_err(|e| {
                                VisitError::Adapter(AdapterError::Inconsistent(e.to_string()))
                            })?;
                        new_branches += 1;
                        continue;
                    }
                }

                let processed = tokio::time::timeout(
                    self.config.artifact_timeout,
                    self.process_branch(&fetcher, adapter, &info, &mut stager),
                )
                .await;

                match processed {
                    Err(_) => {
                        warn!(%branch, "artifact exceeded its wall-clock cap");
                        failures.push(BranchFailure {
                            branch,
                            version: version.clone(),
                            url: Some(info.url.clone()),
                            error: BranchError::Timeout,
                        });
                    }
                    Ok(Err(e)) => {
                        // Transient store trouble aborts the visit once the
                        // checkpoint retries are exhausted; anything else is
                        // the branch's own problem.
                        if e.store_error().is_some() {
                            self.retry_flush(&mut stager)
                                .await
                                .map_err(VisitError::Store)?;
                        }
                        warn!(%branch, %e, "branch failed");
                        failures.push(BranchFailure {
                            branch,
                            version: version.clone(),
                            url: Some(info.url.clone()),
                            error: e,
                        });
                    }
                    Ok(Ok(None)) => {
                        debug!(%branch, "adapter produced no release, branch skipped");
                    }
                    Ok(Ok(Some((release_id, directory_id)))) => {
                        snapshot
                            .add_branch(branch_bytes, BranchTarget::Release(release_id))
                            .map_err(|e| {
                                VisitError::Adapter(AdapterError::Inconsistent(e.to_string()))
                            })?;
                        if let Some(claim) = &info.extid {
                            stager
                                .stage_extid(ExtId {
                                    extid_type: claim.extid_type.clone(),
                                    extid_version: claim.extid_version,
                                    extid: claim.extid.clone(),
                                    target_type: ExtIdTargetType::Directory,
                                    target: directory_id,
                                })
                                .await
                                .map_err(VisitError::Store)?;
                            seen_extids.insert(claim.key(), release_id);
                        }
                        new_branches += 1;
                    }
                }
            }
        }

        if let Some(default) = &default_version {
            if let Some(target) = default_branch_target(&snapshot, default) {
                snapshot
                    .add_branch(Bytes::from_static(b"HEAD"), BranchTarget::Alias(target))
                    .map_err(|e| VisitError::Adapter(AdapterError::Inconsistent(e.to_string())))?;
            }
        }

        let status = if failures.is_empty() {
            VisitStatus::Full
        } else if !snapshot.is_empty() {
            VisitStatus::Partial
        } else {
            VisitStatus::Failed
        };

        let (snapshot_id, write) = if status == VisitStatus::Failed {
            // No snapshot for a visit that produced nothing; objects already
            // flushed stay, the store is idempotent about them.
            (None, stager.stats())
        } else {
            let write = self
                .retry_commit(&mut stager, &snapshot)
                .await
                .map_err(VisitError::Store)?;
            (Some(snapshot.id()), write)
        };

        Ok(VisitOutcome {
            status,
            snapshot: snapshot_id,
            stats: LoadStats {
                new_branches,
                reused_branches,
                write,
            },
            failures,
        })
    }

    /// fetch -> unpack -> hash -> release, for one artifact.
    async fn process_branch(
        &self,
        fetcher: &Fetcher,
        adapter: &dyn PackageAdapter,
        info: &PackageInfo,
        stager: &mut Stager<'_, S>,
    ) -> Result<Option<(ObjectId, ObjectId)>, BranchError> {
        let archive = fetcher.fetch(&info.url, &info.expected()).await?;

        let mut dest = archive.clone().into_os_string();
        dest.push(".unpacked");
        let dest = PathBuf::from(dest);
        let kind = ArchiveKind::infer(&info.archive_filename());
        let tree = unpack(&archive, kind, &dest).await?;

        let directory_id = ingest_tree(&tree, stager).await?;

        let release = match adapter
            .build_release(info, &tree, directory_id)
            .await
            .map_err(BranchError::Adapter)?
        {
            Some(release) => release,
            None => return Ok(None),
        };
        let release_id = release.id();
        stager.stage_release(release).await?;
        Ok(Some((release_id, directory_id)))
    }

    /// A branch is reusable when its name survives from the previous
    /// snapshot *and* its ExtID is already stored; either alone is not
    /// enough (renames and re-uploads both invalidate the shortcut).
    async fn known_release(
        &self,
        previous: Option<&Snapshot>,
        branch: &[u8],
        info: &PackageInfo,
    ) -> Result<Option<ObjectId>, StoreError> {
        let Some(previous) = previous else {
            return Ok(None);
        };
        let Some(BranchTarget::Release(prev_release)) = previous.branch(branch) else {
            return Ok(None);
        };
        let Some(claim) = &info.extid else {
            return Ok(None);
        };
        let hits = self
            .storage
            .extid_get_from_extid(&claim.extid_type, std::slice::from_ref(&claim.extid))
            .await?;
        Ok(hits
            .iter()
            .any(|hit| hit.extid_version == claim.extid_version)
            .then_some(*prev_release))
    }

    async fn retry_commit(
        &self,
        stager: &mut Stager<'_, S>,
        snapshot: &Snapshot,
    ) -> Result<WriteStats, StoreError> {
        let mut attempt = 0;
        loop {
            match stager.commit(Some(snapshot)).await {
                Ok(stats) => return Ok(stats),
                Err(e) if attempt + 1 < self.config.store_attempts => {
                    attempt += 1;
                    warn!(attempt, %e, "store checkpoint failed, retrying");
                    tokio::time::sleep(self.config.store_retry_delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn retry_flush(&self, stager: &mut Stager<'_, S>) -> Result<(), StoreError> {
        let mut attempt = 0;
        loop {
            match stager.flush_objects().await {
                Ok(()) => return Ok(()),
                Err(e) if attempt + 1 < self.config.store_attempts => {
                    attempt += 1;
                    warn!(attempt, %e, "store flush failed, retrying");
                    tokio::time::sleep(self.config.store_retry_delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn write_status(
        &self,
        origin: &str,
        visit: u64,
        status: VisitStatus,
        snapshot: Option<ObjectId>,
    ) -> Result<(), StoreError> {
        let record = OriginVisitStatus {
            origin: origin.to_string(),
            visit,
            date: Utc::now(),
            status,
            snapshot,
        };
        let mut attempt = 0;
        loop {
            match self.storage.origin_visit_status_add(record.clone()).await {
                Ok(()) => return Ok(()),
                Err(e) if attempt + 1 < self.config.store_attempts => {
                    attempt += 1;
                    warn!(attempt, %e, "status write failed, retrying");
                    tokio::time::sleep(self.config.store_retry_delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Warms the fetcher's cache for one artifact; fetch errors surface later
/// during sequential processing, so they're discarded here.
async fn prefetch_one(fetcher: &Fetcher, info: &PackageInfo) {
    let _ = fetcher.fetch(&info.url, &info.expected()).await;
}

/// The branch `HEAD` should alias for the default version: the plain
/// `releases/<version>` branch, or the single per-filename branch a
/// multi-artifact convention produced.
fn default_branch_target(snapshot: &Snapshot, default_version: &str) -> Option<Bytes> {
    let exact = Bytes::from(release_branch(default_version).into_bytes());
    if snapshot.branch(&exact).is_some() {
        return Some(exact);
    }
    let prefix = format!("releases/{}/", default_version).into_bytes();
    let mut candidates = snapshot
        .branches()
        .filter(|(name, _)| name.starts_with(&prefix[..]));
    let (name, _) = candidates.next()?;
    if candidates.next().is_none() {
        Some(name.clone())
    } else {
        None
    }
}
