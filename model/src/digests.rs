use blake2::Blake2s256;
use data_encoding::HEXLOWER;
use sha1::{Digest, Sha1};
use sha2::Sha256;
use thiserror::Error;

pub const ID_LEN: usize = 20;

/// A 20-byte intrinsic object identifier (the sha1-git scheme).
///
/// Every Directory, Release and Snapshot id stored by the archive is one of
/// these, computed over the object's canonical serialisation.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectId([u8; ID_LEN]);

#[derive(Error, Debug, PartialEq)]
pub enum Error {
    #[error("invalid digest length: {0}")]
    InvalidDigestLen(usize),

    #[error("invalid hex digest: {0}")]
    InvalidHexDigest(String),
}

impl ObjectId {
    pub fn as_slice(&self) -> &[u8] {
        &self.0[..]
    }

    pub fn into_bytes(self) -> [u8; ID_LEN] {
        self.0
    }

    /// Parses a 40-character lowercase hex string.
    pub fn from_hex(s: &str) -> Result<Self, Error> {
        let bytes = HEXLOWER
            .decode(s.as_bytes())
            .map_err(|_| Error::InvalidHexDigest(s.to_string()))?;
        bytes.try_into()
    }

    pub fn to_hex(&self) -> String {
        HEXLOWER.encode(&self.0)
    }
}

impl From<[u8; ID_LEN]> for ObjectId {
    fn from(value: [u8; ID_LEN]) -> Self {
        Self(value)
    }
}

impl From<&[u8; ID_LEN]> for ObjectId {
    fn from(value: &[u8; ID_LEN]) -> Self {
        Self(*value)
    }
}

impl TryFrom<Vec<u8>> for ObjectId {
    type Error = Error;

    fn try_from(value: Vec<u8>) -> Result<Self, Self::Error> {
        value
            .as_slice()
            .try_into()
            .map(Self)
            .map_err(|_| Error::InvalidDigestLen(value.len()))
    }
}

impl TryFrom<&[u8]> for ObjectId {
    type Error = Error;

    fn try_from(value: &[u8]) -> Result<Self, Self::Error> {
        value
            .try_into()
            .map(Self)
            .map_err(|_| Error::InvalidDigestLen(value.len()))
    }
}

impl std::fmt::Display for ObjectId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", HEXLOWER.encode(&self.0))
    }
}

impl std::fmt::Debug for ObjectId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ObjectId({})", HEXLOWER.encode(&self.0))
    }
}

/// The four parallel digests identifying a file's bytes, plus its length.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct ContentHashes {
    pub sha1: [u8; 20],
    pub sha1_git: ObjectId,
    pub sha256: [u8; 32],
    pub blake2s256: [u8; 32],
    pub length: u64,
}

/// Streaming hasher computing all four content digests in a single pass.
///
/// The sha1-git digest uses the git blob scheme, so the total length must be
/// known up front to seed the `blob <len>\0` header.
pub struct MultiHash {
    sha1: Sha1,
    sha1_git: Sha1,
    sha256: Sha256,
    blake2s256: Blake2s256,
    length: u64,
    written: u64,
}

impl MultiHash {
    pub fn new(length: u64) -> Self {
        let mut sha1_git = Sha1::new();
        sha1_git.update(format!("blob {}\0", length).as_bytes());
        Self {
            sha1: Sha1::new(),
            sha1_git,
            sha256: Sha256::new(),
            blake2s256: Blake2s256::new(),
            length,
            written: 0,
        }
    }

    /// Hashes the whole buffer at once.
    pub fn from_data(data: &[u8]) -> ContentHashes {
        let mut h = Self::new(data.len() as u64);
        h.update(data);
        h.finalize()
    }

    pub fn update(&mut self, data: &[u8]) {
        self.sha1.update(data);
        self.sha1_git.update(data);
        self.sha256.update(data);
        self.blake2s256.update(data);
        self.written += data.len() as u64;
    }

    /// Number of bytes hashed so far. Callers verifying a declared length
    /// compare against this after the stream is drained.
    pub fn written(&self) -> u64 {
        self.written
    }

    pub fn finalize(self) -> ContentHashes {
        debug_assert_eq!(
            self.length, self.written,
            "MultiHash seeded with a length different from the bytes written"
        );
        ContentHashes {
            sha1: self.sha1.finalize().into(),
            sha1_git: ObjectId::from(<[u8; 20]>::from(self.sha1_git.finalize())),
            sha256: self.sha256.finalize().into(),
            blake2s256: self.blake2s256.finalize().into(),
            length: self.length,
        }
    }
}

/// sha1 over raw bytes, without any header. This is the digest used for
/// canonically serialised Directory, Release and Snapshot objects.
pub fn sha1_object_id(canonical: &[u8]) -> ObjectId {
    let mut h = Sha1::new();
    h.update(canonical);
    ObjectId::from(<[u8; 20]>::from(h.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn object_id_hex_roundtrip() {
        let id = ObjectId::from_hex("da39a3ee5e6b4b0d3255bfef95601890afd80709").unwrap();
        assert_eq!(id.to_hex(), "da39a3ee5e6b4b0d3255bfef95601890afd80709");
        assert_eq!(id.as_slice().len(), ID_LEN);
    }

    #[test]
    fn object_id_rejects_wrong_length() {
        assert_eq!(
            ObjectId::try_from(vec![0u8; 32]),
            Err(Error::InvalidDigestLen(32))
        );
    }

    #[test]
    fn empty_content_hashes() {
        let hashes = MultiHash::from_data(b"");
        assert_eq!(hashes.length, 0);
        // Well-known digests of the empty input.
        assert_eq!(
            HEXLOWER.encode(&hashes.sha1),
            "da39a3ee5e6b4b0d3255bfef95601890afd80709"
        );
        // Git's empty blob.
        assert_eq!(
            hashes.sha1_git.to_hex(),
            "e69de29bb2d1d6434b8b29ae775ad8c2e48c5391"
        );
        assert_eq!(
            HEXLOWER.encode(&hashes.sha256),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
        assert_eq!(
            HEXLOWER.encode(&hashes.blake2s256),
            "69217a3079908094e11121d042354a7c1f55b6482ca1a51e1b250dfd1ed0eef9"
        );
    }

    #[test]
    fn blob_header_is_part_of_sha1_git() {
        let hashes = MultiHash::from_data(b"hello world\n");
        // `echo 'hello world' | git hash-object --stdin`
        assert_eq!(
            hashes.sha1_git.to_hex(),
            "3b18e512dba79e4c8300dd08aeb37f8e728b8dad"
        );
        assert_eq!(hashes.length, 12);
    }

    #[test]
    fn streaming_matches_oneshot() {
        let mut streamed = MultiHash::new(11);
        streamed.update(b"hello");
        streamed.update(b" ");
        streamed.update(b"world");
        assert_eq!(streamed.finalize(), MultiHash::from_data(b"hello world"));
    }
}
