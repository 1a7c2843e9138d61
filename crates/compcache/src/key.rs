//! Cache and manifest keys, and the digests that produce them.

use crate::command::{compiler_identity, key_arguments, ArgumentScope, CompileRequest};
use crate::error::CacheError;
use crate::fingerprint::{Fingerprint, FingerprintBuilder};
use crate::path::PathNormalizer;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;

/// Bumped whenever the key derivation or the entry layout changes incompatibly.
pub const CACHE_LAYOUT_VERSION: u32 = 1;

/// Bumped whenever the manifest file schema changes incompatibly.
pub const MANIFEST_FORMAT_VERSION: u32 = 1;

macro_rules! digest_key {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(Fingerprint);

        impl $name {
            pub fn from_fingerprint(fingerprint: Fingerprint) -> Self {
                Self(fingerprint)
            }

            /// Parses key text read back from a directory name, a manifest or the network.
            pub fn parse(text: &str) -> Result<Self, CacheError> {
                Fingerprint::parse(text)
                    .map(Self)
                    .ok_or_else(|| CacheError::InvalidKey {
                        key: text.chars().take(80).collect(),
                    })
            }

            pub fn as_str(&self) -> &str {
                self.0.as_str()
            }

            pub fn shard(&self) -> &str {
                self.0.shard()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                self.0.fmt(f)
            }
        }
    };
}

digest_key!(
    /// Identifies one stored compilation result.
    CacheKey
);

digest_key!(
    /// Identifies the set of manifest entries that may apply to a source + command line.
    ManifestKey
);

/// Everything about a request that does not depend on header contents.
///
/// Computed once per invocation and shared by both key strategies.
#[derive(Clone, Debug)]
pub struct RequestIdentity {
    pub compiler: Fingerprint,
    pub source_path: String,
    pub source: Fingerprint,
}

impl RequestIdentity {
    pub fn compute(
        request: &CompileRequest,
        normalizer: &PathNormalizer,
    ) -> Result<Self, CacheError> {
        Ok(Self {
            compiler: compiler_identity(request, normalizer)?,
            source_path: normalizer.normalize(&request.source_path()),
            source: Fingerprint::from_file(request.source_path())?,
        })
    }
}

/// Key of the manifest for this source file, command line and source contents.
pub fn manifest_key(
    request: &CompileRequest,
    identity: &RequestIdentity,
    normalizer: &PathNormalizer,
) -> ManifestKey {
    let mut builder = FingerprintBuilder::new("manifest");
    builder
        .u32_field(CACHE_LAYOUT_VERSION)
        .u32_field(MANIFEST_FORMAT_VERSION)
        .fingerprint(&identity.compiler);
    let arguments = key_arguments(&request.arguments, ArgumentScope::Direct, normalizer);
    builder.u32_field(arguments.len() as u32);
    for argument in &arguments {
        builder.str_field(argument);
    }
    builder
        .str_field(&identity.source_path)
        .fingerprint(&identity.source);
    ManifestKey(builder.finish())
}

/// Direct-mode cache key: the manifest key plus every included header in include order.
///
/// The source fingerprint is already part of `manifest`. Headers are given as
/// (normalized path, fingerprint) pairs.
pub fn direct_cache_key<'a>(
    manifest: &ManifestKey,
    headers: impl IntoIterator<Item = (&'a str, &'a Fingerprint)>,
) -> CacheKey {
    let mut builder = FingerprintBuilder::new("direct");
    builder
        .u32_field(CACHE_LAYOUT_VERSION)
        .fingerprint(&manifest.0);
    for (path, fingerprint) in headers {
        builder.str_field(path).fingerprint(fingerprint);
    }
    CacheKey(builder.finish())
}

/// Preprocessor-mode cache key: compiler, stripped arguments and the preprocessed text.
pub fn preprocessor_cache_key(
    request: &CompileRequest,
    compiler: &Fingerprint,
    preprocessed: &[u8],
    normalizer: &PathNormalizer,
) -> CacheKey {
    let mut builder = FingerprintBuilder::new("preprocessor");
    builder.u32_field(CACHE_LAYOUT_VERSION).fingerprint(compiler);
    let arguments = key_arguments(&request.arguments, ArgumentScope::Preprocessed, normalizer);
    builder.u32_field(arguments.len() as u32);
    for argument in &arguments {
        builder.str_field(argument);
    }
    builder.field(preprocessed);
    CacheKey(builder.finish())
}

/// Drops duplicates and the source itself from a compiler-reported include list, keeping
/// first-seen order.
pub(crate) fn dedup_includes<'a>(
    includes: &'a [std::path::PathBuf],
    source: &Path,
) -> Vec<&'a Path> {
    let mut seen = std::collections::HashSet::new();
    includes
        .iter()
        .map(|p| p.as_path())
        .filter(|p| *p != source)
        .filter(|p| seen.insert(*p))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(dir: &Path, args: &[&str]) -> CompileRequest {
        CompileRequest {
            compiler: dir.join("cl.exe"),
            arguments: args.iter().map(|s| s.to_string()).collect(),
            source: "foo.cpp".into(),
            output: "foo.obj".into(),
            working_dir: dir.to_path_buf(),
        }
    }

    fn setup() -> tempfile::TempDir {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("cl.exe"), b"compiler").unwrap();
        std::fs::write(tmp.path().join("foo.cpp"), b"int main() {}\n").unwrap();
        tmp
    }

    #[test]
    fn manifest_key_ignores_output_location() {
        let tmp = setup();
        let normalizer = PathNormalizer::default();
        let a = request(tmp.path(), &["/c", "/O2", "/Foa.obj"]);
        let b = request(tmp.path(), &["/c", "/O2", "/Fob.obj"]);
        let id = RequestIdentity::compute(&a, &normalizer).unwrap();
        assert_eq!(
            manifest_key(&a, &id, &normalizer),
            manifest_key(&b, &id, &normalizer)
        );

        let c = request(tmp.path(), &["/c", "/Od"]);
        assert_ne!(
            manifest_key(&a, &id, &normalizer),
            manifest_key(&c, &id, &normalizer)
        );
    }

    #[test]
    fn manifest_key_tracks_source_contents() {
        let tmp = setup();
        let normalizer = PathNormalizer::default();
        let req = request(tmp.path(), &["/c"]);
        let before = RequestIdentity::compute(&req, &normalizer).unwrap();
        std::fs::write(tmp.path().join("foo.cpp"), b"int main() { return 1; }\n").unwrap();
        let after = RequestIdentity::compute(&req, &normalizer).unwrap();
        assert_ne!(
            manifest_key(&req, &before, &normalizer),
            manifest_key(&req, &after, &normalizer)
        );
    }

    #[test]
    fn direct_key_depends_on_header_order_and_content() {
        let manifest = ManifestKey::from_fingerprint(Fingerprint::from_bytes(b"m"));
        let a = Fingerprint::from_bytes(b"a");
        let b = Fingerprint::from_bytes(b"b");
        let ab = direct_cache_key(&manifest, [("a.h", &a), ("b.h", &b)]);
        assert_eq!(ab, direct_cache_key(&manifest, [("a.h", &a), ("b.h", &b)]));
        assert_ne!(ab, direct_cache_key(&manifest, [("b.h", &b), ("a.h", &a)]));
        assert_ne!(ab, direct_cache_key(&manifest, [("a.h", &b), ("b.h", &b)]));
    }

    #[test]
    fn preprocessor_key_ignores_defines_but_not_codegen() {
        let tmp = setup();
        let normalizer = PathNormalizer::default();
        let compiler = Fingerprint::from_bytes(b"cl");
        let text = b"int main() {}\n";
        let plain = preprocessor_cache_key(&request(tmp.path(), &["/c"]), &compiler, text, &normalizer);
        let defined = preprocessor_cache_key(
            &request(tmp.path(), &["/c", "/DUNUSED"]),
            &compiler,
            text,
            &normalizer,
        );
        let optimized = preprocessor_cache_key(
            &request(tmp.path(), &["/c", "/O2"]),
            &compiler,
            text,
            &normalizer,
        );
        assert_eq!(plain, defined);
        assert_ne!(plain, optimized);
        assert_ne!(
            plain,
            preprocessor_cache_key(&request(tmp.path(), &["/c"]), &compiler, b"int x;\n", &normalizer)
        );
    }

    #[test]
    fn parse_rejects_traversal() {
        let err = CacheKey::parse("../escape").unwrap_err();
        assert!(matches!(err, CacheError::InvalidKey { .. }));
    }

    #[test]
    fn includes_are_deduplicated_in_order() {
        let source = Path::new("/p/foo.cpp");
        let includes = vec![
            "/p/b.h".into(),
            "/p/a.h".into(),
            "/p/foo.cpp".into(),
            "/p/b.h".into(),
        ];
        let deduped = dedup_includes(&includes, source);
        assert_eq!(deduped, vec![Path::new("/p/b.h"), Path::new("/p/a.h")]);
    }
}
