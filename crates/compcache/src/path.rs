use std::path::{Path, PathBuf};

/// Placeholder that stands in for the configured base directory inside keys and manifests.
pub const BASE_DIR_PLACEHOLDER: &str = "?";

/// Turns filesystem paths into the stable text that enters keys and manifests.
///
/// - separators are always `/`
/// - on case-insensitive targets the text is lowercased
/// - a configured base directory prefix collapses to [`BASE_DIR_PLACEHOLDER`], which lets
///   identical checkouts in different locations share entries
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PathNormalizer {
    base_dir: Option<String>,
    case_insensitive: bool,
}

impl Default for PathNormalizer {
    fn default() -> Self {
        Self::new(None)
    }
}

impl PathNormalizer {
    /// Normalizer for the host platform's path semantics.
    pub fn new(base_dir: Option<&Path>) -> Self {
        Self::with_case_sensitivity(base_dir, cfg!(windows))
    }

    pub fn with_case_sensitivity(base_dir: Option<&Path>, case_insensitive: bool) -> Self {
        let base_dir = base_dir
            .map(|dir| normalize_text(&dir.to_string_lossy(), case_insensitive))
            .map(|dir| dir.trim_end_matches('/').to_string())
            .filter(|dir| !dir.is_empty());
        Self {
            base_dir,
            case_insensitive,
        }
    }

    pub fn normalize(&self, path: &Path) -> String {
        let text = normalize_text(&path.to_string_lossy(), self.case_insensitive);
        self.collapse_base_dir(text)
    }

    /// Collapses the base directory inside a free-form argument such as `-I/src/proj/include`.
    pub fn normalize_argument(&self, argument: &str) -> String {
        let Some(base) = &self.base_dir else {
            return argument.to_string();
        };
        let comparable = normalize_text(argument, self.case_insensitive);
        match comparable.find(base.as_str()) {
            Some(idx) if is_boundary(&comparable, idx + base.len()) => {
                // Replace in the normalized text; the argument is only ever hashed.
                let mut out = String::with_capacity(comparable.len());
                out.push_str(&comparable[..idx]);
                out.push_str(BASE_DIR_PLACEHOLDER);
                out.push_str(&comparable[idx + base.len()..]);
                out
            }
            _ => argument.to_string(),
        }
    }

    /// Inverse of [`Self::normalize`] for paths recorded in manifests.
    pub fn expand(&self, normalized: &str) -> PathBuf {
        match (&self.base_dir, normalized.strip_prefix(BASE_DIR_PLACEHOLDER)) {
            (Some(base), Some(rest)) => PathBuf::from(format!("{base}{rest}")),
            _ => PathBuf::from(normalized),
        }
    }

    fn collapse_base_dir(&self, text: String) -> String {
        let Some(base) = &self.base_dir else {
            return text;
        };
        match text.strip_prefix(base.as_str()) {
            Some(rest) if rest.is_empty() || rest.starts_with('/') => {
                format!("{BASE_DIR_PLACEHOLDER}{rest}")
            }
            _ => text,
        }
    }
}

fn normalize_text(text: &str, case_insensitive: bool) -> String {
    let text = text.replace('\\', "/");
    if case_insensitive {
        text.to_lowercase()
    } else {
        text
    }
}

fn is_boundary(text: &str, idx: usize) -> bool {
    idx == text.len() || text[idx..].starts_with('/')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn separators_are_unified() {
        let normalizer = PathNormalizer::with_case_sensitivity(None, false);
        assert_eq!(
            normalizer.normalize(Path::new("src\\lib\\Foo.h")),
            "src/lib/Foo.h"
        );
    }

    #[test]
    fn case_is_folded_on_case_insensitive_targets() {
        let normalizer = PathNormalizer::with_case_sensitivity(None, true);
        assert_eq!(
            normalizer.normalize(Path::new("C:\\Proj\\Include\\Bar.H")),
            "c:/proj/include/bar.h"
        );
    }

    #[test]
    fn base_dir_collapses_and_expands() {
        let normalizer =
            PathNormalizer::with_case_sensitivity(Some(Path::new("/work/checkout/")), false);
        let normalized = normalizer.normalize(Path::new("/work/checkout/include/bar.h"));
        assert_eq!(normalized, "?/include/bar.h");
        assert_eq!(
            normalizer.expand(&normalized),
            PathBuf::from("/work/checkout/include/bar.h")
        );

        // Sibling directories sharing a name prefix are left alone.
        assert_eq!(
            normalizer.normalize(Path::new("/work/checkout2/bar.h")),
            "/work/checkout2/bar.h"
        );
        assert_eq!(normalizer.expand("/usr/include/stdio.h"), PathBuf::from("/usr/include/stdio.h"));
    }

    #[test]
    fn arguments_collapse_embedded_base_dir() {
        let normalizer =
            PathNormalizer::with_case_sensitivity(Some(Path::new("/work/checkout")), false);
        assert_eq!(
            normalizer.normalize_argument("-I/work/checkout/include"),
            "-I?/include"
        );
        assert_eq!(normalizer.normalize_argument("-O2"), "-O2");
    }
}
