#![allow(dead_code)]

use compcache::{
    CacheConfig, CacheEngine, CacheError, CompileOutput, CompileRequest, CompilerWrapper,
    Fingerprint,
};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tempfile::TempDir;

/// A stand-in compiler that understands exactly one directive: `#include "file"`.
///
/// The "object" it produces is derived from the fully expanded text and the arguments, so
/// two compilations yield equal objects exactly when a real compiler would.
/// A source containing `#error` fails with exit code 2.
#[derive(Debug, Default)]
pub struct FakeCompiler {
    pub compiles: AtomicUsize,
    pub preprocesses: AtomicUsize,
}

impl FakeCompiler {
    pub fn compiles(&self) -> usize {
        self.compiles.load(Ordering::SeqCst)
    }

    pub fn preprocesses(&self) -> usize {
        self.preprocesses.load(Ordering::SeqCst)
    }
}

fn expand(path: &Path, out: &mut String, includes: &mut Vec<PathBuf>, depth: usize) -> Result<(), String> {
    if depth > 32 {
        return Err(format!("include nesting too deep at {}", path.display()));
    }
    let text = std::fs::read_to_string(path)
        .map_err(|err| format!("cannot open {}: {err}", path.display()))?;
    for line in text.lines() {
        let include = line
            .trim()
            .strip_prefix("#include")
            .map(str::trim)
            .and_then(|rest| rest.strip_prefix('"'))
            .and_then(|rest| rest.strip_suffix('"'));
        match include {
            Some(name) => {
                let header = path.parent().unwrap_or(Path::new(".")).join(name);
                includes.push(header.clone());
                expand(&header, out, includes, depth + 1)?;
            }
            None => {
                out.push_str(line);
                out.push('\n');
            }
        }
    }
    Ok(())
}

impl CompilerWrapper for FakeCompiler {
    fn preprocess(&self, request: &CompileRequest) -> Result<Vec<u8>, CacheError> {
        self.preprocesses.fetch_add(1, Ordering::SeqCst);
        let mut text = String::new();
        expand(&request.source_path(), &mut text, &mut Vec::new(), 0)
            .map_err(|message| CacheError::Compiler { message })?;
        Ok(text.into_bytes())
    }

    fn compile(&self, request: &CompileRequest) -> Result<CompileOutput, CacheError> {
        self.compiles.fetch_add(1, Ordering::SeqCst);
        let source_name = request
            .source
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        let mut text = String::new();
        let mut includes = Vec::new();
        if let Err(message) = expand(&request.source_path(), &mut text, &mut includes, 0) {
            return Ok(CompileOutput {
                exit_code: 1,
                stdout: format!("{source_name}\r\n").into_bytes(),
                stderr: message.into_bytes(),
                object_path: request.output_path(),
                includes,
            });
        }
        if text.contains("#error") {
            return Ok(CompileOutput {
                exit_code: 2,
                stdout: format!("{source_name}\r\n").into_bytes(),
                stderr: b"fatal error C1189: #error".to_vec(),
                object_path: request.output_path(),
                includes,
            });
        }

        let object = format!(
            "OBJ {} {}",
            request.arguments.join(" "),
            Fingerprint::from_bytes(text.as_bytes())
        );
        std::fs::write(request.output_path(), object.as_bytes())
            .map_err(|err| CacheError::Compiler {
                message: err.to_string(),
            })?;

        Ok(CompileOutput {
            exit_code: 0,
            stdout: format!("{source_name}\r\n").into_bytes(),
            stderr: Vec::new(),
            object_path: request.output_path(),
            includes,
        })
    }
}

/// A scratch checkout with a compiler binary, sources and a cache root.
pub struct Workspace {
    pub tmp: TempDir,
}

impl Workspace {
    pub fn new() -> Self {
        let ws = Self {
            tmp: tempfile::tempdir().unwrap(),
        };
        std::fs::create_dir_all(ws.src()).unwrap();
        std::fs::create_dir_all(ws.path().join("bin")).unwrap();
        std::fs::write(ws.compiler(), b"fake compiler 19.40").unwrap();
        ws
    }

    pub fn path(&self) -> &Path {
        self.tmp.path()
    }

    pub fn src(&self) -> PathBuf {
        self.path().join("src")
    }

    pub fn compiler(&self) -> PathBuf {
        self.path().join("bin").join("cl.exe")
    }

    pub fn cache_root(&self) -> PathBuf {
        self.path().join("cache")
    }

    pub fn write(&self, name: &str, contents: &str) {
        let path = self.src().join(name);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(path, contents).unwrap();
    }

    pub fn read_src(&self, name: &str) -> Vec<u8> {
        std::fs::read(self.src().join(name)).unwrap()
    }

    pub fn request(&self, source: &str, output: &str, args: &[&str]) -> CompileRequest {
        request_in(&self.compiler(), &self.src(), source, output, args)
    }

    pub fn config(&self) -> CacheConfig {
        let mut config = CacheConfig::with_root(self.cache_root());
        config.lock_timeout = Duration::from_secs(30);
        config
    }

    pub fn engine(&self) -> CacheEngine {
        CacheEngine::open(self.config()).unwrap()
    }

    pub fn preprocessor_engine(&self) -> CacheEngine {
        let mut config = self.config();
        config.direct_mode = false;
        CacheEngine::open(config).unwrap()
    }
}

pub fn request_in(
    compiler: &Path,
    working_dir: &Path,
    source: &str,
    output: &str,
    args: &[&str],
) -> CompileRequest {
    CompileRequest {
        compiler: compiler.to_path_buf(),
        arguments: args.iter().map(|a| a.to_string()).collect(),
        source: PathBuf::from(source),
        output: PathBuf::from(output),
        working_dir: working_dir.to_path_buf(),
    }
}
