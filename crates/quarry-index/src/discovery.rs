//! Workspace file discovery.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use ignore::WalkBuilder;
use ignore::gitignore::{Gitignore, GitignoreBuilder};
use ignore::overrides::{Override, OverrideBuilder};

use crate::config::IndexerConfig;
use crate::error::Result;
use crate::languages::{Lang, detect_language, extension_of};
use crate::session::{FileError, FileStage};

const BINARY_EXTENSIONS: &[&str] = &[
    "png", "jpg", "jpeg", "gif", "bmp", "ico", "webp", "tiff", "psd", "pdf", "zip", "gz", "tgz",
    "tar", "bz2", "xz", "7z", "rar", "jar", "war", "class", "exe", "dll", "so", "dylib", "a", "o",
    "obj", "lib", "wasm", "pyc", "pyo", "woff", "woff2", "ttf", "otf", "eot", "mp3", "mp4", "wav",
    "ogg", "flac", "avi", "mov", "mkv", "webm", "bin", "dat", "db", "sqlite", "sqlite3", "parquet",
];

/// A file selected for indexing. Consumed by exactly one worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileTask {
    pub abs_path: PathBuf,
    /// Relative to the workspace root, `/`-separated.
    pub rel_path: String,
    pub size: u64,
    pub language: Option<Lang>,
    /// Content hash from the last successful index of this path.
    pub previous_hash: Option<String>,
}

#[derive(Debug, Default)]
pub struct Discovery {
    /// Sorted by relative path.
    pub tasks: Vec<FileTask>,
    pub skipped_too_large: usize,
    pub skipped_binary: usize,
    pub errors: Vec<FileError>,
}

#[must_use]
pub fn is_binary_extension(path: &Path) -> bool {
    extension_of(path).is_some_and(|ext| BINARY_EXTENSIONS.contains(&ext.as_str()))
}

/// Workspace-relative path with `/` separators, or `None` outside `root`.
#[must_use]
pub fn relative_path(root: &Path, path: &Path) -> Option<String> {
    let rel = path.strip_prefix(root).ok()?;
    let parts: Vec<_> = rel
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect();
    if parts.is_empty() {
        return None;
    }
    Some(parts.join("/"))
}

fn build_overrides(root: &Path, config: &IndexerConfig) -> Result<Override> {
    let mut builder = OverrideBuilder::new(root);
    for glob in &config.include {
        builder.add(glob)?;
    }
    for glob in &config.exclude {
        builder.add(&format!("!{glob}"))?;
    }
    Ok(builder.build()?)
}

/// Walk `root` and build the task queue.
///
/// `previous` maps relative paths to content hashes of the last index, so
/// workers can skip unchanged files.
///
/// # Errors
///
/// Returns an error if an include or exclude glob is invalid. Unreadable
/// entries are reported in [`Discovery::errors`].
pub fn discover(
    root: &Path,
    config: &IndexerConfig,
    previous: &HashMap<String, String>,
) -> Result<Discovery> {
    let overrides = build_overrides(root, config)?;
    let walker = WalkBuilder::new(root)
        .hidden(!config.include_hidden)
        .git_ignore(config.respect_gitignore)
        .git_global(false)
        .git_exclude(config.respect_gitignore)
        .ignore(config.respect_gitignore)
        .require_git(false)
        .overrides(overrides)
        .build();

    let mut discovery = Discovery::default();
    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                tracing::warn!("walk error: {e}");
                discovery
                    .errors
                    .push(FileError::new(String::new(), FileStage::Discover, e));
                continue;
            }
        };
        if !entry.file_type().is_some_and(|ft| ft.is_file()) {
            continue;
        }
        let path = entry.path();
        let Some(rel_path) = relative_path(root, path) else {
            continue;
        };
        if is_binary_extension(path) {
            discovery.skipped_binary += 1;
            continue;
        }
        let size = match entry.metadata() {
            Ok(meta) => meta.len(),
            Err(e) => {
                discovery
                    .errors
                    .push(FileError::new(rel_path, FileStage::Discover, e));
                continue;
            }
        };
        if size > config.max_file_size {
            tracing::debug!(file = %rel_path, size, "skipping oversized file");
            discovery.skipped_too_large += 1;
            continue;
        }
        let previous_hash = previous.get(&rel_path).cloned();
        discovery.tasks.push(FileTask {
            abs_path: path.to_path_buf(),
            language: detect_language(path),
            rel_path,
            size,
            previous_hash,
        });
    }
    discovery.tasks.sort_by(|a, b| a.rel_path.cmp(&b.rel_path));

    tracing::info!(
        files = discovery.tasks.len(),
        too_large = discovery.skipped_too_large,
        binary = discovery.skipped_binary,
        "discovery finished"
    );
    Ok(discovery)
}

/// Applies the discovery rules to single paths reported by the file watcher.
pub struct PathFilter {
    root: PathBuf,
    overrides: Override,
    gitignore: Option<Gitignore>,
    include_hidden: bool,
}

impl PathFilter {
    /// # Errors
    ///
    /// Returns an error if a glob is invalid.
    pub fn new(root: &Path, config: &IndexerConfig) -> Result<Self> {
        let gitignore = if config.respect_gitignore {
            let mut builder = GitignoreBuilder::new(root);
            // A missing .gitignore is not an error.
            let _ = builder.add(root.join(".gitignore"));
            Some(builder.build()?)
        } else {
            None
        };
        Ok(Self {
            root: root.to_path_buf(),
            overrides: build_overrides(root, config)?,
            gitignore,
            include_hidden: config.include_hidden,
        })
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Whether `path` (absolute, a file) would be picked up by discovery,
    /// ignoring size and existence.
    #[must_use]
    pub fn accepts(&self, path: &Path) -> bool {
        let Ok(rel) = path.strip_prefix(&self.root) else {
            return false;
        };
        if rel.as_os_str().is_empty() || is_binary_extension(rel) {
            return false;
        }
        if !self.include_hidden
            && rel
                .components()
                .any(|c| c.as_os_str().to_string_lossy().starts_with('.'))
        {
            return false;
        }
        if rel
            .ancestors()
            .skip(1)
            .filter(|a| !a.as_os_str().is_empty())
            .any(|dir| self.overrides.matched(dir, true).is_ignore())
        {
            return false;
        }
        if self.overrides.matched(rel, false).is_ignore() {
            return false;
        }
        if let Some(gitignore) = &self.gitignore
            && gitignore.matched_path_or_any_parents(rel, false).is_ignore()
        {
            return false;
        }
        true
    }
}
