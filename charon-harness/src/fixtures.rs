//! Deterministic fixtures and the filesystem oracle.
//!
//! Content and names are derived from integer seeds with BLAKE3 so that the
//! same seed always yields byte-identical files and different seeds yield
//! distinct ones. The oracle reads the sandbox after an `await_operations`
//! barrier; it never polls for intermediate states.

use std::io;
use std::path::{Path, PathBuf};

use crate::error::{HarnessError, HarnessResult};
use crate::logging::{LogLevel, ScenarioLog};
use crate::sandbox::resolve_under;

/// Number of lines in generated content.
pub const CONTENT_LINES: u64 = 4;

/// Lowercase hex BLAKE3 digest of the decimal form of `value`.
fn hash_decimal(value: u64) -> String {
    blake3::hash(value.to_string().as_bytes()).to_hex().to_string()
}

/// Content for `seed`: one digest per line for `seed + i`, joined by `\n`
/// with no trailing newline.
pub fn generate_content(seed: u64) -> String {
    (0..CONTENT_LINES)
        .map(|i| hash_decimal(seed.wrapping_add(i)))
        .collect::<Vec<_>>()
        .join("\n")
}

/// File name stem for `seed`.
pub fn generate_name(seed: u64) -> String {
    hash_decimal(seed)
}

/// A relative path and the content to write there.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileFixture {
    pub path: PathBuf,
    pub content: String,
}

impl FileFixture {
    pub fn new(path: impl Into<PathBuf>, content: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            content: content.into(),
        }
    }

    /// Fixture at `path` with [`generate_content`] for `seed`.
    pub fn from_seed(path: impl Into<PathBuf>, seed: u64) -> Self {
        Self::new(path, generate_content(seed))
    }
}

/// Reads and writes files under a sandbox root.
///
/// All paths are relative to the root; lookups that find nothing return
/// `None` or `false` instead of failing.
#[derive(Clone)]
pub struct FixtureOracle {
    root: PathBuf,
    log: Option<ScenarioLog>,
}

impl FixtureOracle {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            log: None,
        }
    }

    /// Report every check to `log`.
    pub fn with_log(mut self, log: ScenarioLog) -> Self {
        self.log = Some(log);
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn resolve(&self, relative: impl AsRef<Path>) -> HarnessResult<PathBuf> {
        resolve_under(&self.root, relative.as_ref())
    }

    fn note(&self, level: LogLevel, message: impl FnOnce() -> String) {
        if let Some(log) = &self.log {
            log.oracle(level, message());
        }
    }

    pub fn create_dir(&self, relative: impl AsRef<Path>) -> HarnessResult<PathBuf> {
        let path = self.resolve(relative)?;
        std::fs::create_dir_all(&path)
            .map_err(|e| HarnessError::fixture_io("create dir", &path, e))?;
        self.note(LogLevel::Debug, || format!("created dir {}", path.display()));
        Ok(path)
    }

    /// Write `content`, creating parents and replacing any existing file.
    pub fn write_file(&self, relative: impl AsRef<Path>, content: impl AsRef<[u8]>) -> HarnessResult<PathBuf> {
        let path = self.resolve(relative)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| HarnessError::fixture_io("create dir", parent, e))?;
        }
        std::fs::write(&path, content.as_ref())
            .map_err(|e| HarnessError::fixture_io("write file", &path, e))?;
        self.note(LogLevel::Debug, || format!("wrote {}", path.display()));
        Ok(path)
    }

    pub fn write_fixture(&self, fixture: &FileFixture) -> HarnessResult<PathBuf> {
        self.write_file(&fixture.path, &fixture.content)
    }

    /// Raw bytes, or `None` if nothing exists at the path.
    pub fn read_bytes(&self, relative: impl AsRef<Path>) -> HarnessResult<Option<Vec<u8>>> {
        let path = self.resolve(relative)?;
        match std::fs::read(&path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(HarnessError::fixture_io("read file", &path, e)),
        }
    }

    /// Content as text, or `None` if nothing exists at the path.
    pub fn read_file(&self, relative: impl AsRef<Path>) -> HarnessResult<Option<String>> {
        Ok(self
            .read_bytes(relative)?
            .map(|bytes| String::from_utf8_lossy(&bytes).into_owned()))
    }

    /// Number of entries in a directory, or `None` if it is not one.
    pub fn file_count(&self, relative: impl AsRef<Path>) -> HarnessResult<Option<usize>> {
        Ok(self.list_files(relative)?.map(|files| files.len()))
    }

    /// Entries of a directory as sorted paths relative to the sandbox root,
    /// or `None` if the path is not a directory.
    pub fn list_files(&self, relative: impl AsRef<Path>) -> HarnessResult<Option<Vec<PathBuf>>> {
        let relative = relative.as_ref();
        let path = self.resolve(relative)?;
        if !path.is_dir() {
            return Ok(None);
        }
        let entries = std::fs::read_dir(&path)
            .map_err(|e| HarnessError::fixture_io("list dir", &path, e))?;
        let mut files = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| HarnessError::fixture_io("list dir", &path, e))?;
            files.push(relative.join(entry.file_name()));
        }
        files.sort();
        Ok(Some(files))
    }

    /// True iff both files exist with the same file name and the same bytes.
    pub fn files_equal(&self, a: impl AsRef<Path>, b: impl AsRef<Path>) -> HarnessResult<bool> {
        let (a, b) = (a.as_ref(), b.as_ref());
        if a.file_name() != b.file_name() {
            self.note(LogLevel::Warn, || {
                format!("names differ: {} vs {}", a.display(), b.display())
            });
            return Ok(false);
        }
        let equal = match (self.read_bytes(a)?, self.read_bytes(b)?) {
            (Some(left), Some(right)) => left == right,
            _ => false,
        };
        if !equal {
            self.note(LogLevel::Warn, || {
                format!("contents differ or missing: {} vs {}", a.display(), b.display())
            });
        }
        Ok(equal)
    }

    /// True iff the file exists and holds exactly `expected`.
    pub fn validate_file(&self, relative: impl AsRef<Path>, expected: impl AsRef<[u8]>) -> HarnessResult<bool> {
        let relative = relative.as_ref();
        let valid = self
            .read_bytes(relative)?
            .is_some_and(|bytes| bytes == expected.as_ref());
        self.note(if valid { LogLevel::Debug } else { LogLevel::Warn }, || {
            format!("validate {}: {}", relative.display(), if valid { "ok" } else { "mismatch" })
        });
        Ok(valid)
    }

    pub fn is_dir_with_n_files(&self, relative: impl AsRef<Path>, expected: usize) -> HarnessResult<bool> {
        let relative = relative.as_ref();
        let count = self.file_count(relative)?;
        self.note(LogLevel::Debug, || {
            format!("{} holds {count:?} entries, expected {expected}", relative.display())
        });
        Ok(count == Some(expected))
    }

    pub fn is_empty_dir(&self, relative: impl AsRef<Path>) -> HarnessResult<bool> {
        self.is_dir_with_n_files(relative, 0)
    }
}
