use std::path::{Component, Path, PathBuf};

use tokio::io::BufReader;
use tokio_stream::StreamExt;
use tracing::instrument;

use crate::decompression::DecompressedReader;
use crate::errors::ArchiveError;

/// Archive container kinds the loader recognises, inferred from the artifact
/// filename when the registry does not say.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ArchiveKind {
    Tar,
    TarGz,
    TarBz2,
    TarXz,
    Zip,
    Jar,
    /// Rubygems package: outer tar whose `data.tar.gz` member is the payload.
    Gem,
    /// crates.io package, a gzipped tar under another name.
    Crate,
    /// `ar` container with a `data.tar.*` payload; decoding delegated to the
    /// external dpkg toolchain.
    Deb,
    /// cpio payload; decoding delegated to the external rpm toolchain.
    Rpm,
}

impl ArchiveKind {
    pub fn infer(filename: &str) -> Option<Self> {
        let name = filename.to_ascii_lowercase();
        if name.ends_with(".tar.gz") || name.ends_with(".tgz") {
            Some(Self::TarGz)
        } else if name.ends_with(".tar.bz2") || name.ends_with(".tbz2") {
            Some(Self::TarBz2)
        } else if name.ends_with(".tar.xz") || name.ends_with(".txz") {
            Some(Self::TarXz)
        } else if name.ends_with(".tar") {
            Some(Self::Tar)
        } else if name.ends_with(".zip") {
            Some(Self::Zip)
        } else if name.ends_with(".jar") {
            Some(Self::Jar)
        } else if name.ends_with(".gem") {
            Some(Self::Gem)
        } else if name.ends_with(".crate") {
            Some(Self::Crate)
        } else if name.ends_with(".deb") {
            Some(Self::Deb)
        } else if name.ends_with(".rpm") {
            Some(Self::Rpm)
        } else {
            None
        }
    }
}

/// Extracts `archive` into `dest`, which is created and must be inside the
/// visit's scratch directory.
///
/// Entry paths and symlink targets escaping `dest` are rejected as
/// [`ArchiveError::UnsafeArchive`]. File permissions are normalised to
/// 0o644/0o755; symlinks are preserved as symlinks, dangling targets
/// included.
#[instrument(skip_all, fields(archive = ?archive, kind = ?kind), err)]
pub async fn unpack(
    archive: &Path,
    kind: Option<ArchiveKind>,
    dest: &Path,
) -> Result<PathBuf, ArchiveError> {
    let kind = match kind {
        Some(kind) => kind,
        None => {
            let name = archive
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            ArchiveKind::infer(&name)
                .ok_or_else(|| ArchiveError::UnknownKind(archive.to_path_buf()))?
        }
    };

    tokio::fs::create_dir_all(dest).await?;

    match kind {
        ArchiveKind::Tar
        | ArchiveKind::TarGz
        | ArchiveKind::TarBz2
        | ArchiveKind::TarXz
        | ArchiveKind::Crate => unpack_tar(archive, dest).await?,
        ArchiveKind::Zip | ArchiveKind::Jar => unpack_zip(archive, dest).await?,
        ArchiveKind::Gem => unpack_gem(archive, dest).await?,
        ArchiveKind::Deb | ArchiveKind::Rpm => return Err(ArchiveError::UnsupportedKind(kind)),
    }

    Ok(dest.to_path_buf())
}

/// Tar and compressed-tar extraction. The decompression layer sniffs the
/// actual codec, so a `.crate` or mislabelled `.tar` works the same way.
async fn unpack_tar(archive: &Path, dest: &Path) -> Result<(), ArchiveError> {
    let file = tokio::fs::File::open(archive).await?;
    let reader = DecompressedReader::new(BufReader::new(file));
    let mut tar = tokio_tar::Archive::new(reader);

    let mut entries = tar.entries()?;
    while let Some(mut entry) = entries.try_next().await? {
        let raw_path = entry.path()?.into_owned();
        let Some(rel) = sanitize_entry_path(&raw_path)? else {
            // "." / "./" entries describe the root itself.
            continue;
        };
        let target = dest.join(&rel);

        match entry.header().entry_type() {
            tokio_tar::EntryType::Directory => {
                tokio::fs::create_dir_all(&target).await?;
            }
            tokio_tar::EntryType::Regular
            | tokio_tar::EntryType::GNUSparse
            | tokio_tar::EntryType::Continuous => {
                if let Some(parent) = target.parent() {
                    tokio::fs::create_dir_all(parent).await?;
                }
                let mut out = tokio::fs::File::create(&target).await?;
                tokio::io::copy(&mut entry, &mut out).await?;
                let executable = entry.header().mode()? & 0o100 != 0;
                set_normalised_perms(&target, executable).await?;
            }
            tokio_tar::EntryType::Symlink => {
                let link_target = entry.link_name()?.ok_or_else(|| {
                    std::io::Error::new(
                        std::io::ErrorKind::InvalidData,
                        "symlink entry without a target",
                    )
                })?;
                sanitize_symlink_target(&link_target, &rel)?;
                if let Some(parent) = target.parent() {
                    tokio::fs::create_dir_all(parent).await?;
                }
                tokio::fs::symlink(&link_target, &target).await?;
            }
            tokio_tar::EntryType::XGlobalHeader | tokio_tar::EntryType::XHeader => continue,
            other => {
                return Err(ArchiveError::Decode(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    format!("unsupported tar entry type {:?} at {:?}", other, raw_path),
                )))
            }
        }
    }
    Ok(())
}

async fn unpack_zip(archive: &Path, dest: &Path) -> Result<(), ArchiveError> {
    let archive = archive.to_path_buf();
    let dest = dest.to_path_buf();
    tokio::task::spawn_blocking(move || unpack_zip_sync(&archive, &dest))
        .await
        .map_err(|e| ArchiveError::Decode(std::io::Error::other(e)))?
}

fn unpack_zip_sync(archive: &Path, dest: &Path) -> Result<(), ArchiveError> {
    use std::io::Read;

    let file = std::fs::File::open(archive)?;
    let mut zip = zip::ZipArchive::new(file)
        .map_err(|e| ArchiveError::Decode(std::io::Error::other(e)))?;

    for index in 0..zip.len() {
        let mut entry = zip
            .by_index(index)
            .map_err(|e| ArchiveError::Decode(std::io::Error::other(e)))?;
        // enclosed_name already refuses traversal and absolute paths.
        let rel = entry
            .enclosed_name()
            .ok_or_else(|| ArchiveError::UnsafeArchive {
                path: PathBuf::from(entry.name()),
            })?;
        let target = dest.join(&rel);

        if entry.is_dir() {
            std::fs::create_dir_all(&target)?;
            continue;
        }
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let mode = entry.unix_mode().unwrap_or(0o644);
        if mode & 0o170000 == 0o120000 {
            let mut link_target = Vec::new();
            entry.read_to_end(&mut link_target)?;
            let link_target = PathBuf::from(String::from_utf8_lossy(&link_target).into_owned());
            sanitize_symlink_target(&link_target, &rel)?;
            std::os::unix::fs::symlink(&link_target, &target)?;
        } else {
            let mut out = std::fs::File::create(&target)?;
            std::io::copy(&mut entry, &mut out)?;
            let perms = if mode & 0o100 != 0 { 0o755 } else { 0o644 };
            std::fs::set_permissions(
                &target,
                std::os::unix::fs::PermissionsExt::from_mode(perms),
            )?;
        }
    }
    Ok(())
}

/// Rubygems packages are a plain outer tar holding `data.tar.gz` (the file
/// tree) next to `metadata.gz`; only the payload is extracted.
async fn unpack_gem(archive: &Path, dest: &Path) -> Result<(), ArchiveError> {
    let outer_dir = tempfile::tempdir_in(dest.parent().unwrap_or_else(|| Path::new(".")))?;
    unpack_tar(archive, outer_dir.path()).await?;

    let payload = outer_dir.path().join("data.tar.gz");
    if !payload.exists() {
        return Err(ArchiveError::Decode(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "gem archive without a data.tar.gz payload",
        )));
    }
    unpack_tar(&payload, dest).await
}

async fn set_normalised_perms(path: &Path, executable: bool) -> Result<(), std::io::Error> {
    let mode = if executable { 0o755 } else { 0o644 };
    tokio::fs::set_permissions(path, std::os::unix::fs::PermissionsExt::from_mode(mode)).await
}

/// Normalises an entry path, rejecting anything that could land outside the
/// extraction root. Returns `None` for entries denoting the root itself.
fn sanitize_entry_path(path: &Path) -> Result<Option<PathBuf>, ArchiveError> {
    if path.is_absolute() {
        return Err(ArchiveError::UnsafeArchive {
            path: path.to_path_buf(),
        });
    }
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(ArchiveError::UnsafeArchive {
                    path: path.to_path_buf(),
                })
            }
        }
    }
    if out.as_os_str().is_empty() {
        Ok(None)
    } else {
        Ok(Some(out))
    }
}

/// Checks, lexically, that a symlink's target stays under the extraction
/// root. Dangling targets are fine; escaping ones are not.
fn sanitize_symlink_target(target: &Path, link_rel: &Path) -> Result<(), ArchiveError> {
    if target.is_absolute() {
        return Err(ArchiveError::UnsafeArchive {
            path: target.to_path_buf(),
        });
    }
    // Walk from the link's parent directory.
    let mut depth: isize = link_rel.components().count() as isize - 1;
    for component in target.components() {
        match component {
            Component::Normal(_) => depth += 1,
            Component::CurDir => {}
            Component::ParentDir => {
                depth -= 1;
                if depth < 0 {
                    return Err(ArchiveError::UnsafeArchive {
                        path: target.to_path_buf(),
                    });
                }
            }
            Component::RootDir | Component::Prefix(_) => {
                return Err(ArchiveError::UnsafeArchive {
                    path: target.to_path_buf(),
                })
            }
        }
    }
    Ok(())
}
