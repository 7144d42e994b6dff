//! Compiled unit - a source folder, its content hash and its last good binary
//!
//! ```text
//! <units_dir>/<unit>/
//!   Cargo.toml  main.rs        generated by the toolchain
//!   Storage.rs  Add.rs ...     tool sources
//!   tools.json                 manifest of the last successful compile
//!   bin/<hash>                 binary named by content hash
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::schema::ToolSchema;
use super::toolchain::CodeError;

pub const MANIFEST_FILE: &str = "tools.json";
pub const BIN_DIR: &str = "bin";

/// Persisted record of the last successful compile
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UnitManifest {
    pub hash: String,
    pub binary: String,
    pub tools: Vec<ToolSchema>,
    /// Per-file SHA-256, so single-file changes are visible
    pub files: BTreeMap<String, String>,
}

impl UnitManifest {
    pub fn load(dir: &Path) -> Option<Self> {
        let bytes = std::fs::read(dir.join(MANIFEST_FILE)).ok()?;
        match serde_json::from_slice(&bytes) {
            Ok(manifest) => Some(manifest),
            Err(e) => {
                tracing::warn!(dir = %dir.display(), error = %e, "Ignoring unreadable manifest");
                None
            }
        }
    }

    pub fn save(&self, dir: &Path) -> std::io::Result<()> {
        let json = serde_json::to_vec_pretty(self)?;
        std::fs::write(dir.join(MANIFEST_FILE), json)
    }
}

/// Result of hashing a unit's sources
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentHash {
    pub hash: String,
    pub files: BTreeMap<String, String>,
}

/// SHA-256 over the sorted tool sources (names and contents)
///
/// Only files with `extension` count; files in `generated` are skipped.
pub fn content_hash(dir: &Path, extension: &str, generated: &[&str]) -> std::io::Result<ContentHash> {
    let files = source_files(dir, extension, generated)?;
    let mut total = Sha256::new();
    let mut per_file = BTreeMap::new();

    for name in files {
        let bytes = std::fs::read(dir.join(&name))?;
        total.update(name.as_bytes());
        total.update([0u8]);
        total.update((bytes.len() as u64).to_le_bytes());
        total.update(&bytes);
        per_file.insert(name, hex::encode(Sha256::digest(&bytes)));
    }

    Ok(ContentHash {
        hash: hex::encode(total.finalize()),
        files: per_file,
    })
}

/// Sorted tool source file names in `dir`
pub fn source_files(dir: &Path, extension: &str, generated: &[&str]) -> std::io::Result<Vec<String>> {
    let mut names = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        let matches_ext = Path::new(&name).extension().is_some_and(|e| e == extension);
        if matches_ext && !generated.contains(&name.as_str()) {
            names.push(name);
        }
    }
    names.sort();
    Ok(names)
}

/// Compile-time state of one unit
#[derive(Debug, Clone, Default)]
pub struct CompiledUnit {
    pub name: String,
    pub dir: PathBuf,
    /// Hash of the sources the current binary (or error) was built from
    pub hash: String,
    /// Empty means the last compile succeeded
    pub compile_error: String,
    pub errors: Vec<CodeError>,
    pub binary: Option<PathBuf>,
    pub tools: Vec<ToolSchema>,
}

impl CompiledUnit {
    /// Restore from `tools.json` when its binary still exists
    pub fn open(name: impl Into<String>, dir: impl Into<PathBuf>) -> Self {
        let mut unit = Self {
            name: name.into(),
            dir: dir.into(),
            ..Self::default()
        };
        if let Some(manifest) = UnitManifest::load(&unit.dir) {
            let binary = unit.dir.join(&manifest.binary);
            if binary.exists() {
                unit.hash = manifest.hash;
                unit.binary = Some(binary);
                unit.tools = manifest.tools;
            }
        }
        unit
    }

    pub fn binary_path(&self, hash: &str) -> PathBuf {
        self.dir.join(BIN_DIR).join(hash)
    }

    pub fn has_standing_error(&self) -> bool {
        !self.compile_error.is_empty()
    }

    /// Recompile when the hash moved or the expected binary is gone
    ///
    /// A failed compile of the same sources is not retried.
    pub fn is_stale(&self, hash: &str) -> bool {
        self.hash != hash || (!self.has_standing_error() && !self.binary_path(hash).exists())
    }

    /// Remove every binary except the one for `keep`
    pub fn prune_binaries(&self, keep: &str) -> usize {
        let Ok(entries) = std::fs::read_dir(self.dir.join(BIN_DIR)) else {
            return 0;
        };
        let mut removed = 0;
        for entry in entries.flatten() {
            if entry.file_name().to_string_lossy() == keep {
                continue;
            }
            match std::fs::remove_file(entry.path()) {
                Ok(()) => removed += 1,
                Err(e) => tracing::warn!(path = %entry.path().display(), error = %e, "Failed to prune binary"),
            }
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_ignores_generated_and_foreign_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("Add.rs"), "a").unwrap();
        let before = content_hash(dir.path(), "rs", &["main.rs"]).unwrap();

        std::fs::write(dir.path().join("main.rs"), "generated").unwrap();
        std::fs::write(dir.path().join("notes.txt"), "x").unwrap();
        let after = content_hash(dir.path(), "rs", &["main.rs"]).unwrap();
        assert_eq!(before, after);

        std::fs::write(dir.path().join("Add.rs"), "b").unwrap();
        let changed = content_hash(dir.path(), "rs", &["main.rs"]).unwrap();
        assert_ne!(before.hash, changed.hash);
        assert_eq!(changed.files.len(), 1);
    }

    #[test]
    fn test_hash_covers_file_names() {
        let a = tempfile::tempdir().unwrap();
        let b = tempfile::tempdir().unwrap();
        std::fs::write(a.path().join("Add.rs"), "same").unwrap();
        std::fs::write(b.path().join("Sub.rs"), "same").unwrap();
        assert_ne!(
            content_hash(a.path(), "rs", &[]).unwrap().hash,
            content_hash(b.path(), "rs", &[]).unwrap().hash
        );
    }

    #[test]
    fn test_prune_keeps_current() {
        let dir = tempfile::tempdir().unwrap();
        let unit = CompiledUnit::open("Calc", dir.path());
        std::fs::create_dir_all(dir.path().join(BIN_DIR)).unwrap();
        for h in ["old1", "old2", "cur"] {
            std::fs::write(unit.binary_path(h), h).unwrap();
        }
        assert_eq!(unit.prune_binaries("cur"), 2);
        assert!(unit.binary_path("cur").exists());
        assert!(!unit.binary_path("old1").exists());
    }

    #[test]
    fn test_open_restores_manifest_with_binary() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join(BIN_DIR)).unwrap();
        std::fs::write(dir.path().join(BIN_DIR).join("abc"), "bin").unwrap();
        UnitManifest {
            hash: "abc".into(),
            binary: format!("{BIN_DIR}/abc"),
            ..UnitManifest::default()
        }
        .save(dir.path())
        .unwrap();

        let unit = CompiledUnit::open("Calc", dir.path());
        assert_eq!(unit.hash, "abc");
        assert!(!unit.is_stale("abc"));
        assert!(unit.is_stale("def"));
    }
}
