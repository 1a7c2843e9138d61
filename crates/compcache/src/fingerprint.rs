use crate::error::CacheError;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::io::Read;
use std::path::Path;
use std::sync::OnceLock;
use std::time::UNIX_EPOCH;

/// Length of a fingerprint in hex characters (SHA-256).
pub const FINGERPRINT_HEX_LEN: usize = 64;

/// A SHA-256 content digest stored as lowercase hex.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn from_bytes(bytes: impl AsRef<[u8]>) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(bytes.as_ref());
        Self(hex::encode(hasher.finalize()))
    }

    /// Streams the file's contents through SHA-256.
    ///
    /// A missing or unreadable file is reported as [`CacheError::UnreadableInput`]; callers
    /// decide whether that is a hard error or a forced miss.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, CacheError> {
        let path = path.as_ref();
        let unreadable = |source| CacheError::UnreadableInput {
            path: path.to_path_buf(),
            source,
        };
        let file = std::fs::File::open(path).map_err(unreadable)?;
        let mut hasher = Sha256::new();
        let mut reader = std::io::BufReader::new(file);
        let mut buf = [0_u8; 64 * 1024];
        loop {
            let read = reader.read(&mut buf).map_err(unreadable)?;
            if read == 0 {
                break;
            }
            hasher.update(&buf[..read]);
        }
        Ok(Self(hex::encode(hasher.finalize())))
    }

    /// Fingerprint of file metadata (size + mtime) rather than contents.
    ///
    /// Used for the compiler binary, where hashing tens of megabytes per invocation would
    /// dominate the hit path.
    pub fn from_file_metadata(path: impl AsRef<Path>) -> Result<Self, CacheError> {
        let path = path.as_ref();
        let meta = std::fs::metadata(path).map_err(|source| CacheError::UnreadableInput {
            path: path.to_path_buf(),
            source,
        })?;
        let modified_nanos: u128 = match meta.modified().map(|t| t.duration_since(UNIX_EPOCH)) {
            Ok(Ok(dur)) => dur.as_nanos(),
            Ok(Err(_)) | Err(_) => {
                static REPORTED: OnceLock<()> = OnceLock::new();
                if REPORTED.set(()).is_ok() {
                    tracing::debug!(
                        target = "compcache",
                        path = %path.display(),
                        "file mtime unavailable; using 0 for metadata fingerprint"
                    );
                }
                0
            }
        };

        let mut bytes = Vec::with_capacity(8 + 16);
        bytes.extend_from_slice(&meta.len().to_le_bytes());
        bytes.extend_from_slice(&modified_nanos.to_le_bytes());
        Ok(Self::from_bytes(bytes))
    }

    /// Parses a hex digest read back from disk or the network.
    pub fn parse(text: &str) -> Option<Self> {
        let valid = text.len() == FINGERPRINT_HEX_LEN
            && text.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'));
        valid.then(|| Self(text.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Short prefix used to bucket digests into subdirectories.
    pub fn shard(&self) -> &str {
        &self.0[..2]
    }
}

impl TryFrom<String> for Fingerprint {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value).ok_or_else(|| format!("invalid fingerprint of length {}", value.len()))
    }
}

impl From<Fingerprint> for String {
    fn from(value: Fingerprint) -> Self {
        value.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Incremental digest over a sequence of length-prefixed fields.
///
/// Every field is framed by its length, so `["ab", "c"]` and `["a", "bc"]` never collide.
#[derive(Clone)]
pub struct FingerprintBuilder {
    hasher: Sha256,
}

impl FingerprintBuilder {
    /// Starts a digest in the given domain; different domains never produce equal digests
    /// for the same fields.
    pub fn new(domain: &str) -> Self {
        let mut builder = Self {
            hasher: Sha256::new(),
        };
        builder.field(domain.as_bytes());
        builder
    }

    pub fn field(&mut self, bytes: impl AsRef<[u8]>) -> &mut Self {
        let bytes = bytes.as_ref();
        self.hasher.update((bytes.len() as u64).to_le_bytes());
        self.hasher.update(bytes);
        self
    }

    pub fn str_field(&mut self, text: &str) -> &mut Self {
        self.field(text.as_bytes())
    }

    pub fn u32_field(&mut self, value: u32) -> &mut Self {
        self.field(value.to_le_bytes())
    }

    pub fn fingerprint(&mut self, fingerprint: &Fingerprint) -> &mut Self {
        self.field(fingerprint.as_str().as_bytes())
    }

    pub fn finish(&self) -> Fingerprint {
        Fingerprint(hex::encode(self.hasher.clone().finalize()))
    }
}

impl fmt::Debug for FingerprintBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FingerprintBuilder").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_bytes_is_deterministic_sha256() {
        let fp = Fingerprint::from_bytes(b"abc");
        assert_eq!(
            fp.as_str(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        assert_eq!(fp, Fingerprint::from_bytes(b"abc"));
        assert_eq!(fp.shard(), "ba");
    }

    #[test]
    fn from_file_matches_from_bytes() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("bar.h");
        std::fs::write(&path, b"#define BAR 1\n").unwrap();
        assert_eq!(
            Fingerprint::from_file(&path).unwrap(),
            Fingerprint::from_bytes(b"#define BAR 1\n")
        );
    }

    #[test]
    fn missing_file_is_unreadable_input() {
        let tmp = tempfile::tempdir().unwrap();
        let err = Fingerprint::from_file(tmp.path().join("gone.h")).unwrap_err();
        assert!(matches!(err, CacheError::UnreadableInput { .. }), "{err:?}");
    }

    #[test]
    fn parse_rejects_non_digests() {
        let fp = Fingerprint::from_bytes(b"x");
        assert_eq!(Fingerprint::parse(fp.as_str()), Some(fp.clone()));
        assert!(Fingerprint::parse("../../etc/passwd").is_none());
        assert!(Fingerprint::parse(&fp.as_str().to_uppercase()).is_none());
        assert!(Fingerprint::parse(&fp.as_str()[..10]).is_none());

        let json = serde_json::to_string(&fp).unwrap();
        assert_eq!(serde_json::from_str::<Fingerprint>(&json).unwrap(), fp);
        assert!(serde_json::from_str::<Fingerprint>("\"nothex\"").is_err());
    }

    #[test]
    fn builder_frames_fields() {
        let a = FingerprintBuilder::new("t").str_field("ab").str_field("c").finish();
        let b = FingerprintBuilder::new("t").str_field("a").str_field("bc").finish();
        assert_ne!(a, b);

        let other_domain = FingerprintBuilder::new("u").str_field("ab").str_field("c").finish();
        assert_ne!(a, other_domain);
    }
}
