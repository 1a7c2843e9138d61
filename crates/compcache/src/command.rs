//! The compiler-facing collaborators: the normalized command description handed over by the
//! command-line classifier and the wrapper that actually runs the compiler.

use crate::error::CacheError;
use crate::fingerprint::{Fingerprint, FingerprintBuilder};
use crate::path::PathNormalizer;
use std::path::PathBuf;

/// A cacheable compiler invocation, already classified and normalized by the CLI layer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CompileRequest {
    /// Path of the real compiler binary.
    pub compiler: PathBuf,
    /// The cache-relevant argument subset, in command-line order.
    pub arguments: Vec<String>,
    /// The single source file being compiled.
    pub source: PathBuf,
    /// Where the object file must end up.
    pub output: PathBuf,
    /// Directory the compiler runs in.
    pub working_dir: PathBuf,
}

impl CompileRequest {
    pub fn source_path(&self) -> PathBuf {
        self.working_dir.join(&self.source)
    }

    pub fn output_path(&self) -> PathBuf {
        self.working_dir.join(&self.output)
    }
}

/// Result of running the real compiler.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CompileOutput {
    pub exit_code: i32,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    /// The object file the compiler produced.
    pub object_path: PathBuf,
    /// Headers the compiler reported including, in include order (e.g. `/showIncludes`).
    pub includes: Vec<PathBuf>,
}

impl CompileOutput {
    pub fn succeeded(&self) -> bool {
        self.exit_code == 0
    }
}

/// Launches the real compiler. Implemented by the process-wrapper layer.
pub trait CompilerWrapper {
    /// Runs only the preprocessor and returns its output.
    fn preprocess(&self, request: &CompileRequest) -> Result<Vec<u8>, CacheError>;

    /// Runs the full compilation, collecting the include list.
    fn compile(&self, request: &CompileRequest) -> Result<CompileOutput, CacheError>;
}

/// Switches that only say where outputs go; they never change the object bytes.
const OUTPUT_ONLY_PREFIXES: &[&str] = &["Fo", "MP"];

/// Preprocessor switches that take a value, matched by prefix (`/DFOO`, `-I include`).
const PREPROCESSOR_VALUE_SWITCHES: &[&str] = &["AI", "D", "FI", "FU", "I", "U"];

/// Long preprocessor switches recognized only in their `-` spelling (`-include pch.h`).
const DASH_PREPROCESSOR_VALUE_SWITCHES: &[&str] = &["include", "isystem"];

/// Preprocessor switches without a value, matched exactly.
const PREPROCESSOR_FLAGS: &[&str] = &["C", "E", "EP", "P", "X", "u"];

/// Which arguments take part in a key.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ArgumentScope {
    /// Everything except output locations. Used for direct-mode manifest keys.
    Direct,
    /// Additionally drops switches whose effect is already visible in preprocessed text.
    Preprocessed,
}

/// Filters and normalizes the arguments that contribute to a key.
///
/// Known switches are recognized before anything else, so `/Foout/a/main.obj` or `/DX=a/b`
/// are switches even though their values contain `/`. Everything unrecognized, including
/// absolute Unix paths such as `/usr/include/extra.h`, is kept.
pub fn key_arguments(
    arguments: &[String],
    scope: ArgumentScope,
    normalizer: &PathNormalizer,
) -> Vec<String> {
    let mut out = Vec::with_capacity(arguments.len());
    let mut skip_value = false;
    for arg in arguments {
        if std::mem::take(&mut skip_value) {
            continue;
        }
        let Some(switch) = switch_body(arg) else {
            out.push(normalizer.normalize_argument(arg));
            continue;
        };
        let dashed = arg.starts_with('-');

        let dash_output = dashed && switch.starts_with('o') && !switch.starts_with("openmp");
        if switch == "o" || dash_output {
            // `-o out.o` or `-oout.o`
            skip_value = switch == "o";
            continue;
        }
        if OUTPUT_ONLY_PREFIXES.iter().any(|p| switch.starts_with(p)) {
            continue;
        }

        if scope == ArgumentScope::Preprocessed {
            if PREPROCESSOR_FLAGS.contains(&switch) {
                continue;
            }
            if let Some(prefix) = preprocessor_value_switch(switch, dashed) {
                skip_value = switch.len() == prefix.len();
                continue;
            }
        }

        out.push(normalizer.normalize_argument(arg));
    }
    out
}

fn switch_body(arg: &str) -> Option<&str> {
    let body = arg.strip_prefix('/').or_else(|| arg.strip_prefix('-'))?;
    (!body.is_empty()).then_some(body)
}

/// The preprocessor switch `switch` is spelled with, if any.
///
/// `D` and `U` must be followed by a macro name, so a bare path like `/Users/me/extra.h` is
/// not read as `/U`.
fn preprocessor_value_switch(switch: &str, dashed: bool) -> Option<&'static str> {
    let long_forms: &'static [&'static str] = if dashed {
        DASH_PREPROCESSOR_VALUE_SWITCHES
    } else {
        &[]
    };
    PREPROCESSOR_VALUE_SWITCHES
        .iter()
        .chain(long_forms)
        .copied()
        .find(|prefix| match switch.strip_prefix(prefix) {
            Some(value) if matches!(*prefix, "D" | "U") => {
                value.is_empty() || starts_with_macro_name(value)
            }
            Some(_) => true,
            None => false,
        })
}

fn starts_with_macro_name(value: &str) -> bool {
    let name_len = value
        .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
        .unwrap_or(value.len());
    let name = &value[..name_len];
    !name.is_empty()
        && !name.starts_with(|c: char| c.is_ascii_digit())
        && matches!(value[name_len..].chars().next(), None | Some('=' | '#'))
}

/// Stable identity of the compiler binary: its normalized path plus size and mtime.
pub fn compiler_identity(
    request: &CompileRequest,
    normalizer: &PathNormalizer,
) -> Result<Fingerprint, CacheError> {
    let metadata = Fingerprint::from_file_metadata(&request.compiler)?;
    Ok(FingerprintBuilder::new("compiler")
        .str_field(&normalizer.normalize(&request.compiler))
        .fingerprint(&metadata)
        .finish())
}
