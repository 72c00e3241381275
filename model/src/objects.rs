use std::collections::BTreeMap;

use bstr::ByteSlice;
use bytes::Bytes;
use chrono::{DateTime, FixedOffset, Utc};
use thiserror::Error;

use crate::canonical;
use crate::digests::{ContentHashes, MultiHash, ObjectId};

/// Errors raised when assembling Directory or Snapshot objects.
#[derive(Debug, Error, PartialEq)]
pub enum ModelError {
    /// Multiple entries with the same name encountered
    #[error("{:?} is a duplicate name", .0.as_bstr())]
    DuplicateName(Bytes),
    /// Invalid entry name encountered
    #[error("{:?} is not a valid entry name", .0.as_bstr())]
    InvalidName(Bytes),
    /// Multiple branches with the same name encountered
    #[error("{:?} is a duplicate branch", .0.as_bstr())]
    DuplicateBranch(Bytes),
}

/// A file's bytes, identified by four parallel digests.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct Content {
    pub hashes: ContentHashes,
    pub data: Bytes,
}

impl Content {
    pub fn from_data(data: Bytes) -> Self {
        let hashes = MultiHash::from_data(&data);
        Self { hashes, data }
    }

    /// The 20-byte id other objects reference this content by.
    pub fn id(&self) -> ObjectId {
        self.hashes.sha1_git
    }

    pub fn length(&self) -> u64 {
        self.hashes.length
    }
}

/// What a directory entry points at. The target id of a symlink is the
/// content id of the link-target bytes, not of any resolved file.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum EntryTarget {
    File { id: ObjectId, executable: bool },
    Directory { id: ObjectId },
    Symlink { id: ObjectId },
}

impl EntryTarget {
    /// Normalised permission bits for the canonical serialisation.
    pub fn perms(&self) -> u32 {
        match self {
            EntryTarget::File {
                executable: false, ..
            } => 0o100644,
            EntryTarget::File {
                executable: true, ..
            } => 0o100755,
            EntryTarget::Directory { .. } => 0o040000,
            EntryTarget::Symlink { .. } => 0o120000,
        }
    }

    pub fn id(&self) -> ObjectId {
        match self {
            EntryTarget::File { id, .. }
            | EntryTarget::Directory { id }
            | EntryTarget::Symlink { id } => *id,
        }
    }
}

/// An ordered set of named entries. Names are unique and kept sorted, which
/// is what makes the canonical serialisation (and therefore the id)
/// reproducible.
///
/// Entry names:
///  - MUST not contain slashes or null bytes
///  - MUST not be '.' or '..'
///  - MUST not be empty
#[derive(Default, Clone, PartialEq, Eq, Debug)]
pub struct Directory {
    entries: BTreeMap<Bytes, EntryTarget>,
}

impl Directory {
    pub fn new() -> Self {
        Directory {
            entries: BTreeMap::new(),
        }
    }

    /// Adds an entry, rejecting invalid and duplicate names.
    pub fn add(&mut self, name: Bytes, target: EntryTarget) -> Result<(), ModelError> {
        validate_entry_name(&name)?;
        match self.entries.entry(name) {
            std::collections::btree_map::Entry::Vacant(e) => {
                e.insert(target);
                Ok(())
            }
            std::collections::btree_map::Entry::Occupied(occupied) => {
                Err(ModelError::DuplicateName(occupied.key().to_owned()))
            }
        }
    }

    /// Iterates over all entries, sorted by name.
    pub fn entries(&self) -> impl Iterator<Item = (&Bytes, &EntryTarget)> + '_ {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn id(&self) -> ObjectId {
        canonical::directory_id(self)
    }
}

fn validate_entry_name(name: &[u8]) -> Result<(), ModelError> {
    if name.is_empty()
        || name == b".."
        || name == b"."
        || name.contains(&0x00)
        || name.contains(&b'/')
    {
        Err(ModelError::InvalidName(name.to_owned().into()))
    } else {
        Ok(())
    }
}

/// An author or packager, kept as the raw `Name <email>` byte string the
/// upstream metadata provided.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct Person {
    pub fullname: Bytes,
}

impl Person {
    pub fn from_fullname(fullname: impl Into<Bytes>) -> Self {
        Self {
            fullname: fullname.into(),
        }
    }

    /// The sentinel used when upstream names nobody.
    pub fn empty() -> Self {
        Self {
            fullname: Bytes::new(),
        }
    }
}

/// A synthetic release wrapping one directory tree. Always synthetic, always
/// targeting a directory.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct Release {
    pub name: Bytes,
    pub message: Bytes,
    pub author: Option<Person>,
    pub date: Option<DateTime<FixedOffset>>,
    pub target: ObjectId,
}

impl Release {
    pub fn id(&self) -> ObjectId {
        canonical::release_id(self)
    }
}

#[derive(Clone, PartialEq, Eq, Debug)]
pub enum BranchTarget {
    Release(ObjectId),
    /// Target is another branch name inside the same snapshot.
    Alias(Bytes),
    Revision(ObjectId),
}

/// Mapping from branch names to release (or alias) targets, representing the
/// state of an origin at one visit. The empty snapshot is valid and has a
/// well-defined id.
#[derive(Default, Clone, PartialEq, Eq, Debug)]
pub struct Snapshot {
    branches: BTreeMap<Bytes, BranchTarget>,
}

impl Snapshot {
    pub fn new() -> Self {
        Snapshot {
            branches: BTreeMap::new(),
        }
    }

    /// Adds a branch. Overwriting an existing branch is forbidden, the caller
    /// decides what a collision means.
    pub fn add_branch(&mut self, name: Bytes, target: BranchTarget) -> Result<(), ModelError> {
        match self.branches.entry(name) {
            std::collections::btree_map::Entry::Vacant(e) => {
                e.insert(target);
                Ok(())
            }
            std::collections::btree_map::Entry::Occupied(occupied) => {
                Err(ModelError::DuplicateBranch(occupied.key().to_owned()))
            }
        }
    }

    pub fn branch(&self, name: &[u8]) -> Option<&BranchTarget> {
        self.branches.get(name)
    }

    /// Iterates over all branches, sorted by name.
    pub fn branches(&self) -> impl Iterator<Item = (&Bytes, &BranchTarget)> + '_ {
        self.branches.iter()
    }

    pub fn len(&self) -> usize {
        self.branches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.branches.is_empty()
    }

    pub fn id(&self) -> ObjectId {
        canonical::snapshot_id(self)
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum ExtIdTargetType {
    Directory,
    Release,
    Revision,
}

/// An external fingerprint (checksum, manifest hash, url) mapped to a
/// previously ingested target. Additive: once written, never rewritten.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct ExtId {
    pub extid_type: String,
    pub extid_version: u32,
    pub extid: Bytes,
    pub target_type: ExtIdTargetType,
    pub target: ObjectId,
}

/// Stable upstream identity of one package.
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub struct Origin {
    pub url: String,
}

impl Origin {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

/// Closed enumeration of the registered loader kinds.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum VisitType {
    Arch,
    Archive,
    Aur,
    Bioconductor,
    Conda,
    Content,
    Cpan,
    Cran,
    Crates,
    Debian,
    Deposit,
    Directory,
    Golang,
    Hackage,
    Hex,
    Maven,
    Nixguix,
    Npm,
    Opam,
    Pubdev,
    Puppet,
    Pypi,
    Rpm,
    Rubygems,
}

impl VisitType {
    pub fn as_str(&self) -> &'static str {
        match self {
            VisitType::Arch => "arch",
            VisitType::Archive => "archive",
            VisitType::Aur => "aur",
            VisitType::Bioconductor => "bioconductor",
            VisitType::Conda => "conda",
            VisitType::Content => "content",
            VisitType::Cpan => "cpan",
            VisitType::Cran => "cran",
            VisitType::Crates => "crates",
            VisitType::Debian => "debian",
            VisitType::Deposit => "deposit",
            VisitType::Directory => "directory",
            VisitType::Golang => "golang",
            VisitType::Hackage => "hackage",
            VisitType::Hex => "hex",
            VisitType::Maven => "maven",
            VisitType::Nixguix => "nixguix",
            VisitType::Npm => "npm",
            VisitType::Opam => "opam",
            VisitType::Pubdev => "pubdev",
            VisitType::Puppet => "puppet",
            VisitType::Pypi => "pypi",
            VisitType::Rpm => "rpm",
            VisitType::Rubygems => "rubygems",
        }
    }
}

impl std::fmt::Display for VisitType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One ingestion attempt on an origin.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct OriginVisit {
    pub origin: String,
    /// Monotonic per origin, allocated by the store.
    pub visit: u64,
    pub visit_type: VisitType,
    pub date: DateTime<Utc>,
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum VisitStatus {
    Created,
    Ongoing,
    Full,
    Partial,
    Failed,
    NotFound,
}

impl VisitStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            VisitStatus::Created => "created",
            VisitStatus::Ongoing => "ongoing",
            VisitStatus::Full => "full",
            VisitStatus::Partial => "partial",
            VisitStatus::Failed => "failed",
            VisitStatus::NotFound => "not_found",
        }
    }

    /// Whether this status ends the visit lifecycle.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            VisitStatus::Full | VisitStatus::Partial | VisitStatus::Failed | VisitStatus::NotFound
        )
    }
}

impl std::fmt::Display for VisitStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A point in a visit's lifecycle, possibly carrying the snapshot produced.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct OriginVisitStatus {
    pub origin: String,
    pub visit: u64,
    pub date: DateTime<Utc>,
    pub status: VisitStatus,
    pub snapshot: Option<ObjectId>,
}
