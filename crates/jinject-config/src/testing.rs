//! Test environment abstraction for isolated testing.
//!
//! Provides `TestEnvironment` to manage:
//! - A private scratch tree per test
//! - Stand-in archives
//! - Deterministic modification-time bumps for reload tests
//!
//! # Usage
//!
//! ```ignore
//! use jinject_config::testing::TestEnvironment;
//!
//! #[test]
//! fn test_something() {
//!     let env = TestEnvironment::new().unwrap();
//!     let jar = env.create_archive("app.jar").unwrap();
//!     env.bump_mtime(&jar, 10).unwrap();
//! }
//! ```

use filetime::FileTime;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, SystemTime};
use tempfile::TempDir;

/// Atomic counter for unique test IDs
static TEST_COUNTER: AtomicU32 = AtomicU32::new(0);

/// Zip local-file-header magic, enough for a stand-in archive.
const ARCHIVE_MAGIC: &[u8] = b"PK\x03\x04";

/// Isolated test environment with unique paths
pub struct TestEnvironment {
    /// Temporary directory (dropped on cleanup)
    _temp_dir: TempDir,
    /// Root of the scratch tree
    pub root: PathBuf,
    /// Directory for stand-in archives
    pub artifacts_dir: PathBuf,
    /// Directory for `.jinject/config.toml`
    pub config_dir: PathBuf,
    /// Unique test ID
    pub test_id: u32,
}

impl TestEnvironment {
    /// Create a new isolated test environment
    pub fn new() -> anyhow::Result<Self> {
        let test_id = TEST_COUNTER.fetch_add(1, Ordering::Relaxed);
        let temp_dir = TempDir::new()?;
        let root = temp_dir.path().to_path_buf();

        let artifacts_dir = root.join("artifacts");
        let config_dir = root.join(".jinject");
        std::fs::create_dir_all(&artifacts_dir)?;
        std::fs::create_dir_all(&config_dir)?;

        Ok(Self {
            _temp_dir: temp_dir,
            root,
            artifacts_dir,
            config_dir,
            test_id,
        })
    }

    /// Create a test file with content
    pub fn create_file(&self, relative_path: &str, content: &[u8]) -> anyhow::Result<PathBuf> {
        let path = self.root.join(relative_path);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&path, content)?;
        Ok(path)
    }

    /// Create a stand-in archive under `artifacts/`
    pub fn create_archive(&self, name: &str) -> anyhow::Result<PathBuf> {
        let path = self.artifacts_dir.join(name);
        let mut content = ARCHIVE_MAGIC.to_vec();
        content.extend_from_slice(format!("test-{}", self.test_id).as_bytes());
        std::fs::write(&path, content)?;
        Ok(path)
    }

    /// Write a project config file and return its path
    pub fn write_config(&self, toml: &str) -> anyhow::Result<PathBuf> {
        let path = self.config_dir.join("config.toml");
        std::fs::write(&path, toml)?;
        Ok(path)
    }

    /// Move a file's modification time forward by `secs` from its current
    /// value, independent of filesystem timestamp granularity.
    pub fn bump_mtime(&self, path: &Path, secs: u64) -> anyhow::Result<SystemTime> {
        let current = std::fs::metadata(path)?.modified()?;
        let next = current + Duration::from_secs(secs);
        filetime::set_file_mtime(path, FileTime::from_system_time(next))?;
        Ok(next)
    }
}

impl Default for TestEnvironment {
    fn default() -> Self {
        Self::new().expect("Failed to create test environment")
    }
}
