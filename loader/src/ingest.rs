//! Turns an unpacked artifact tree into Content and Directory objects.
//!
//! The walk is post-order (children before their directory), so directories
//! are staged leaves-first and every id is known by the time its parent
//! serialises. The returned id is the root directory's, which is what the
//! synthetic release will point at.

use std::collections::HashMap;
use std::os::unix::ffi::{OsStrExt, OsStringExt};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use bytes::Bytes;
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tracing::instrument;
use walkdir::WalkDir;

use hoard_model::{Content, Directory, EntryTarget, ModelError, MultiHash, ObjectId};
use hoard_store::{Stager, Storage, StoreError};

const READ_CHUNK: usize = 64 * 1024;

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("unsupported file type at {0}")]
    FileType(PathBuf),

    #[error("unable to stat {0}: {1}")]
    Stat(PathBuf, std::io::Error),

    #[error("unable to read {0}: {1}")]
    Read(PathBuf, std::io::Error),

    #[error("invalid tree: {0}")]
    Model(#[from] ModelError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Walks the tree under `root` and stages a Content per regular file and
/// symlink target plus a Directory per directory, returning the root
/// directory id.
#[instrument(skip(stager), fields(root = ?root), err)]
pub async fn ingest_tree<S: Storage + ?Sized>(
    root: &Path,
    stager: &mut Stager<'_, S>,
) -> Result<ObjectId, IngestError> {
    // Partially assembled directories, keyed by path relative to the root.
    let mut directories: HashMap<PathBuf, Directory> = HashMap::new();

    for dir_entry in WalkDir::new(root).follow_links(false).contents_first(true) {
        let dir_entry = dir_entry.map_err(|e| {
            let path = e.path().map(Path::to_path_buf).unwrap_or_default();
            IngestError::Stat(
                path,
                e.into_io_error()
                    .unwrap_or_else(|| std::io::Error::other("walk error")),
            )
        })?;

        let path = dir_entry.path();
        let rel = path
            .strip_prefix(root)
            .expect("walked entry outside the ingestion root")
            .to_path_buf();
        let file_type = dir_entry.file_type();

        let target = if file_type.is_file() {
            let metadata = dir_entry
                .metadata()
                .map_err(|e| IngestError::Stat(path.to_path_buf(), e.into()))?;
            let content = hash_file(path, metadata.len()).await?;
            let id = content.id();
            stager.stage_content(content).await?;
            EntryTarget::File {
                id,
                executable: metadata.permissions().mode() & 0o100 != 0,
            }
        } else if file_type.is_symlink() {
            let link_target = tokio::fs::read_link(path)
                .await
                .map_err(|e| IngestError::Read(path.to_path_buf(), e))?;
            let content =
                Content::from_data(Bytes::from(link_target.into_os_string().into_vec()));
            let id = content.id();
            stager.stage_content(content).await?;
            EntryTarget::Symlink { id }
        } else if file_type.is_dir() {
            // contents_first means every child already registered itself.
            let directory = directories.remove(&rel).unwrap_or_default();
            let id = directory.id();
            stager.stage_directory(directory).await?;
            if rel.as_os_str().is_empty() {
                return Ok(id);
            }
            EntryTarget::Directory { id }
        } else {
            return Err(IngestError::FileType(path.to_path_buf()));
        };

        let name = Bytes::copy_from_slice(
            rel.file_name()
                .expect("non-root entry without a file name")
                .as_bytes(),
        );
        let parent = rel.parent().unwrap_or_else(|| Path::new("")).to_path_buf();
        directories.entry(parent).or_default().add(name, target)?;
    }

    // The walk always yields the root directory last.
    unreachable!("directory walk ended without the root entry");
}

/// Streams one file through the four-digest hasher.
async fn hash_file(path: &Path, length: u64) -> Result<Content, IngestError> {
    let mut file = tokio::fs::File::open(path)
        .await
        .map_err(|e| IngestError::Read(path.to_path_buf(), e))?;

    let mut hasher = MultiHash::new(length);
    let mut data = Vec::with_capacity(length as usize);
    let mut chunk = vec![0u8; READ_CHUNK];
    loop {
        let n = file
            .read(&mut chunk)
            .await
            .map_err(|e| IngestError::Read(path.to_path_buf(), e))?;
        if n == 0 {
            break;
        }
        hasher.update(&chunk[..n]);
        data.extend_from_slice(&chunk[..n]);
    }

    Ok(Content {
        hashes: hasher.finalize(),
        data: data.into(),
    })
}
