//! Canonical serialisations.
//!
//! Every id stored by the archive is reproducible from the bytes produced
//! here; none of the encodings carry random salts or clock reads. Changing
//! any of these layouts invalidates every id ever computed, so they are
//! fixed byte-for-byte and covered by exact-bytes tests.

use crate::digests::{sha1_object_id, ObjectId};
use crate::objects::{BranchTarget, Directory, Release, Snapshot};

/// One directory entry encodes as `<perms-as-ascii-octal> SP <name> NUL
/// <20-byte target id>`; the directory is the concatenation of its entries
/// in name order.
pub fn directory_bytes(directory: &Directory) -> Vec<u8> {
    let mut out = Vec::new();
    for (name, target) in directory.entries() {
        out.extend_from_slice(format!("{:o}", target.perms()).as_bytes());
        out.push(b' ');
        out.extend_from_slice(name);
        out.push(0);
        out.extend_from_slice(target.id().as_slice());
    }
    out
}

pub fn directory_id(directory: &Directory) -> ObjectId {
    sha1_object_id(&directory_bytes(directory))
}

/// A release is a header block of `key value` lines followed by a blank line
/// and the raw message bytes. Optional headers are omitted entirely when the
/// field is absent, never defaulted.
pub fn release_bytes(release: &Release) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(b"name ");
    out.extend_from_slice(&release.name);
    out.push(b'\n');
    out.extend_from_slice(format!("target {}\n", release.target).as_bytes());
    out.extend_from_slice(b"target_type dir\n");
    if let Some(author) = &release.author {
        out.extend_from_slice(b"author ");
        out.extend_from_slice(&author.fullname);
        out.push(b'\n');
    }
    if let Some(date) = &release.date {
        out.extend_from_slice(format!("date {}\n", date.to_rfc3339()).as_bytes());
    }
    out.extend_from_slice(b"synthetic true\n");
    out.push(b'\n');
    out.extend_from_slice(&release.message);
    out
}

pub fn release_id(release: &Release) -> ObjectId {
    sha1_object_id(&release_bytes(release))
}

/// Single-byte tags for snapshot branch targets.
fn branch_target_tag(target: &BranchTarget) -> u8 {
    match target {
        BranchTarget::Release(_) => b'r',
        BranchTarget::Alias(_) => b'a',
        BranchTarget::Revision(_) => b'v',
    }
}

/// Snapshot entries encode as `<branch name> NUL <target type byte>
/// <target>`, concatenated in branch-name order. An alias's target is the
/// referenced branch name; anything else is a 20-byte id.
pub fn snapshot_bytes(snapshot: &Snapshot) -> Vec<u8> {
    let mut out = Vec::new();
    for (name, target) in snapshot.branches() {
        out.extend_from_slice(name);
        out.push(0);
        out.push(branch_target_tag(target));
        match target {
            BranchTarget::Release(id) | BranchTarget::Revision(id) => {
                out.extend_from_slice(id.as_slice())
            }
            BranchTarget::Alias(branch) => out.extend_from_slice(branch),
        }
    }
    out
}

pub fn snapshot_id(snapshot: &Snapshot) -> ObjectId {
    sha1_object_id(&snapshot_bytes(snapshot))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::objects::{EntryTarget, Person};
    use chrono::DateTime;

    fn id_of(fill: u8) -> ObjectId {
        ObjectId::from([fill; 20])
    }

    #[test]
    fn directory_entry_layout() {
        let mut d = Directory::new();
        d.add(
            "lib".into(),
            EntryTarget::Directory { id: id_of(0xd1) },
        )
        .unwrap();
        d.add(
            "README".into(),
            EntryTarget::File {
                id: id_of(0xf1),
                executable: false,
            },
        )
        .unwrap();
        d.add(
            "run.sh".into(),
            EntryTarget::File {
                id: id_of(0xf2),
                executable: true,
            },
        )
        .unwrap();
        d.add(
            "link".into(),
            EntryTarget::Symlink { id: id_of(0x51) },
        )
        .unwrap();

        let mut expected = Vec::new();
        // Sorted: README, lib, link, run.sh
        expected.extend_from_slice(b"100644 README\0");
        expected.extend_from_slice(&[0xf1; 20]);
        expected.extend_from_slice(b"40000 lib\0");
        expected.extend_from_slice(&[0xd1; 20]);
        expected.extend_from_slice(b"120000 link\0");
        expected.extend_from_slice(&[0x51; 20]);
        expected.extend_from_slice(b"100755 run.sh\0");
        expected.extend_from_slice(&[0xf2; 20]);

        assert_eq!(directory_bytes(&d), expected);
    }

    #[test]
    fn empty_directory_has_stable_id() {
        let d = Directory::new();
        assert_eq!(directory_bytes(&d), b"");
        // sha1 of the empty input; the empty tree is a legal object.
        assert_eq!(
            d.id().to_hex(),
            "da39a3ee5e6b4b0d3255bfef95601890afd80709"
        );
    }

    #[test]
    fn release_block_layout() {
        let release = Release {
            name: "1.1.5".into(),
            message: "Synthetic release for pub.dev source package bezier version 1.1.5\n".into(),
            author: Some(Person::from_fullname("Aaron Barrett <aaron@aaronbarrett.com>")),
            date: Some(
                DateTime::parse_from_rfc3339("2019-12-22T03:17:30.805225Z").unwrap(),
            ),
            target: id_of(0xd0),
        };

        let bytes = release_bytes(&release);
        let expected_head = format!(
            "name 1.1.5\ntarget {}\ntarget_type dir\nauthor Aaron Barrett <aaron@aaronbarrett.com>\ndate 2019-12-22T03:17:30.805225+00:00\nsynthetic true\n\n",
            id_of(0xd0)
        );
        let mut expected = expected_head.into_bytes();
        expected.extend_from_slice(
            b"Synthetic release for pub.dev source package bezier version 1.1.5\n",
        );
        assert_eq!(bytes, expected);
    }

    #[test]
    fn release_omits_absent_author_and_date() {
        let release = Release {
            name: "0.0.1".into(),
            message: "msg".into(),
            author: None,
            date: None,
            target: id_of(1),
        };
        let bytes = release_bytes(&release);
        let text = String::from_utf8(bytes).unwrap();
        assert!(!text.contains("author"));
        assert!(!text.contains("date"));
        assert!(text.ends_with("synthetic true\n\nmsg"));
    }

    #[test]
    fn release_id_changes_with_name_only() {
        let base = Release {
            name: "0.0.3-beta".into(),
            message: "m".into(),
            author: None,
            date: None,
            target: id_of(7),
        };
        let renamed = Release {
            name: "0.0.3".into(),
            ..base.clone()
        };
        assert_ne!(base.id(), renamed.id());
    }

    #[test]
    fn snapshot_layout_and_alias() {
        let mut s = Snapshot::new();
        s.add_branch(
            "releases/0.0.4".into(),
            BranchTarget::Release(id_of(0xaa)),
        )
        .unwrap();
        s.add_branch(
            "HEAD".into(),
            BranchTarget::Alias("releases/0.0.4".into()),
        )
        .unwrap();

        let mut expected = Vec::new();
        // "HEAD" sorts before "releases/..."
        expected.extend_from_slice(b"HEAD\0a");
        expected.extend_from_slice(b"releases/0.0.4");
        expected.extend_from_slice(b"releases/0.0.4\0r");
        expected.extend_from_slice(&[0xaa; 20]);

        assert_eq!(snapshot_bytes(&s), expected);
    }

    #[test]
    fn empty_snapshot_id_is_well_defined() {
        let a = Snapshot::new();
        let b = Snapshot::new();
        assert_eq!(a.id(), b.id());
        assert_eq!(
            a.id().to_hex(),
            "da39a3ee5e6b4b0d3255bfef95601890afd80709"
        );
    }

    #[test]
    fn ids_are_reproducible() {
        let make = || {
            let mut d = Directory::new();
            d.add(
                "a".into(),
                EntryTarget::File {
                    id: id_of(3),
                    executable: false,
                },
            )
            .unwrap();
            d
        };
        assert_eq!(make().id(), make().id());
    }
}
