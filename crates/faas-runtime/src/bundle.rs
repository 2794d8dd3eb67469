//! Handler packaging - resolve the handler library, unpacking an archive first if configured
//!
//! Archive layout:
//! ```text
//! handler.zip
//! ├── libmain.so           # Entry library (ZIP_ENTRY_RELATIVE_FILE_PATH)
//! ├── libhelpers.so        # Companion libraries the entry links against
//! └── data/
//!     └── thresholds.json  # Any other files the handler reads
//! ```
//!
//! The whole archive is extracted once at startup into the target directory,
//! and that directory is registered on the [`SearchPath`] so the loader can
//! make companion libraries available to the entry library.

use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};

use chrono::{DateTime, Utc};
use zip::ZipArchive;

use crate::config::RuntimeConfig;
use crate::error::StartupError;

/// Directories consulted for companion libraries, most recent first
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SearchPath {
    dirs: Vec<PathBuf>,
}

impl SearchPath {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a directory ahead of the existing ones; no-op if already present
    pub fn register(&mut self, dir: impl Into<PathBuf>) {
        let dir = dir.into();
        if !self.dirs.contains(&dir) {
            self.dirs.insert(0, dir);
        }
    }

    pub fn dirs(&self) -> &[PathBuf] {
        &self.dirs
    }

    pub fn is_empty(&self) -> bool {
        self.dirs.is_empty()
    }
}

/// Final, loadable handler location
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedModule {
    /// Handler library path
    pub path: PathBuf,
    /// Directories holding companion libraries
    pub search_path: SearchPath,
}

/// Resolve the handler library from configuration
///
/// In archive mode this extracts the archive and checks that the entry
/// exists inside the extraction directory. In plain mode the configured
/// module path is returned as-is; its existence is a startup check.
pub fn resolve(config: &RuntimeConfig) -> Result<ResolvedModule, StartupError> {
    let Some(archive) = &config.archive else {
        return Ok(ResolvedModule {
            path: config.module_path.clone(),
            search_path: SearchPath::new(),
        });
    };

    let extracted = extract_archive(&archive.path, &archive.target_dir)?;
    tracing::info!(
        archive = ?archive.path,
        target = ?archive.target_dir,
        files = extracted,
        "Extracted handler archive"
    );

    let entry_missing = || StartupError::ArchiveEntryMissing {
        entry: archive.entry.clone(),
        target_dir: archive.target_dir.clone(),
    };

    if !is_contained(&archive.entry) {
        return Err(entry_missing());
    }
    let path = archive.target_dir.join(&archive.entry);
    if !path.is_file() {
        return Err(entry_missing());
    }

    let mut search_path = SearchPath::new();
    search_path.register(&archive.target_dir);
    if let Some(parent) = path.parent() {
        search_path.register(parent);
    }

    Ok(ResolvedModule { path, search_path })
}

/// Extract every file of a zip archive into `target_dir`
///
/// Existing files are overwritten, so extracting again on restart is safe.
/// Entries whose names would escape the target directory are skipped.
/// Returns the number of files written.
pub fn extract_archive(archive_path: &Path, target_dir: &Path) -> Result<usize, StartupError> {
    if !archive_path.is_file() {
        return Err(StartupError::ArchiveMissing(archive_path.to_path_buf()));
    }

    let invalid = |reason: String| StartupError::ArchiveInvalid {
        path: archive_path.to_path_buf(),
        reason,
    };

    let file = fs::File::open(archive_path).map_err(|e| invalid(e.to_string()))?;
    let mut archive = ZipArchive::new(file).map_err(|e| invalid(e.to_string()))?;

    fs::create_dir_all(target_dir)
        .map_err(|e| invalid(format!("cannot create {:?}: {}", target_dir, e)))?;

    tracing::debug!("Extracting archive with {} entries", archive.len());

    let mut count = 0;
    for i in 0..archive.len() {
        let mut entry = archive.by_index(i).map_err(|e| invalid(e.to_string()))?;

        let Some(relative) = entry.enclosed_name() else {
            tracing::warn!(name = entry.name(), "Skipping archive entry outside the target directory");
            continue;
        };
        let out_path = target_dir.join(relative);

        if entry.is_dir() {
            fs::create_dir_all(&out_path).map_err(|e| invalid(e.to_string()))?;
            continue;
        }

        if let Some(parent) = out_path.parent() {
            fs::create_dir_all(parent).map_err(|e| invalid(e.to_string()))?;
        }
        let mut out = fs::File::create(&out_path).map_err(|e| invalid(e.to_string()))?;
        io::copy(&mut entry, &mut out).map_err(|e| invalid(e.to_string()))?;

        #[cfg(unix)]
        if let Some(mode) = entry.unix_mode() {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&out_path, fs::Permissions::from_mode(mode & 0o777 | 0o600))
                .map_err(|e| invalid(e.to_string()))?;
        }

        tracing::debug!("Extracted {:?}", out_path);
        count += 1;
    }

    Ok(count)
}

/// Modification time of the handler library, if readable
pub fn module_mtime(path: &Path) -> Option<DateTime<Utc>> {
    fs::metadata(path)
        .and_then(|meta| meta.modified())
        .ok()
        .map(DateTime::<Utc>::from)
}

/// Check if a file is a shared library
pub fn is_shared_library(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|ext| ext.to_str()),
        Some("so" | "dylib" | "dll")
    ) || path
        .file_name()
        .and_then(|name| name.to_str())
        .map(|name| name.contains(".so."))
        .unwrap_or(false)
}

// Relative, and never steps above its root
fn is_contained(path: &Path) -> bool {
    !path.as_os_str().is_empty()
        && path
            .components()
            .all(|component| matches!(component, Component::Normal(_) | Component::CurDir))
}
