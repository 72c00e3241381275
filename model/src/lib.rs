//! Object model of the archive: contents, directories, releases, snapshots
//! and their canonical, content-addressed identifiers.

pub mod canonical;
mod digests;
mod objects;

pub use digests::{sha1_object_id, ContentHashes, Error as DigestError, MultiHash, ObjectId, ID_LEN};
pub use objects::{
    BranchTarget, Content, Directory, EntryTarget, ExtId, ExtIdTargetType, ModelError, Origin,
    OriginVisit, OriginVisitStatus, Person, Release, Snapshot, VisitStatus, VisitType,
};
