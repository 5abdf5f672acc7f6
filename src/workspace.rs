//! Job workspace filesystem and archive creation.
//!
//! Generated paths come from model output, so every write goes through [`safe_relative_path`]:
//! absolute paths and `..` components are rejected instead of escaping the job directory.

use crate::error::StorageError;
use crate::job::GeneratedFile;
use std::fs;
use std::io::Write;
use std::path::{Component, Path, PathBuf};
use tracing::debug;
use walkdir::WalkDir;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

/// `./a/b.html`, `/a/b.html` and `a\b.html` all name `a/b.html`.
pub fn normalize_path(path: &str) -> String {
    let forward = path.trim().replace('\\', "/");
    let mut rest = forward.as_str();
    loop {
        if let Some(stripped) = rest.strip_prefix("./") {
            rest = stripped;
        } else if let Some(stripped) = rest.strip_prefix('/') {
            rest = stripped;
        } else {
            break;
        }
    }
    rest.to_string()
}

/// Canonical form of a planned path, the key files are matched, deduplicated and written by.
/// Fails for paths that still leave the workspace once leading `/` and `./` are stripped.
pub fn canonical_plan_path(path: &str) -> Result<String, StorageError> {
    let relative = safe_relative_path(&normalize_path(path))?;
    let parts: Vec<String> = relative
        .components()
        .map(|component| component.as_os_str().to_string_lossy().into_owned())
        .collect();
    Ok(parts.join("/"))
}

/// Resolve a generated path to a relative path that stays inside its root.
pub fn safe_relative_path(path: &str) -> Result<PathBuf, StorageError> {
    let normalized = path.trim().replace('\\', "/");
    let mut relative = PathBuf::new();
    for component in Path::new(&normalized).components() {
        match component {
            Component::Normal(part) => relative.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(StorageError::InvalidPath(format!(
                    "generated path escapes the workspace: {}",
                    path
                )))
            }
        }
    }
    if relative.as_os_str().is_empty() {
        return Err(StorageError::InvalidPath(format!(
            "empty generated path: '{}'",
            path
        )));
    }
    Ok(relative)
}

/// Write every file under `root`, creating parent directories. Returns the written paths.
pub fn write_files(root: &Path, files: &[GeneratedFile]) -> Result<Vec<PathBuf>, StorageError> {
    fs::create_dir_all(root)?;
    let mut written = Vec::with_capacity(files.len());
    for file in files {
        let target = root.join(safe_relative_path(&file.path)?);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&target, &file.content)?;
        debug!(path = %target.display(), bytes = file.content.len(), "Wrote file");
        written.push(target);
    }
    Ok(written)
}

/// Relative paths of every regular file below `root`, sorted.
pub fn list_files(root: &Path) -> Result<Vec<PathBuf>, StorageError> {
    let mut files = Vec::new();
    for entry in WalkDir::new(root).sort_by_file_name() {
        let entry = entry?;
        if entry.file_type().is_file() {
            let relative = entry
                .path()
                .strip_prefix(root)
                .map_err(|e| StorageError::InvalidPath(e.to_string()))?;
            files.push(relative.to_path_buf());
        }
    }
    files.sort();
    Ok(files)
}

/// Mirror `source` into `destination`. Returns the number of files copied.
pub fn copy_tree(source: &Path, destination: &Path) -> Result<usize, StorageError> {
    fs::create_dir_all(destination)?;
    let mut copied = 0;
    for relative in list_files(source)? {
        let target = destination.join(&relative);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::copy(source.join(&relative), &target)?;
        copied += 1;
    }
    debug!(
        source = %source.display(),
        destination = %destination.display(),
        copied,
        "Copied tree"
    );
    Ok(copied)
}

/// Creates the downloadable archive of a finished job.
pub trait ArchiveWriter: Send + Sync {
    fn create_zip(&self, source_dir: &Path, zip_path: &Path) -> Result<PathBuf, StorageError>;
}

/// Deflate-compressed zip with forward-slash entry names.
#[derive(Debug, Default, Clone, Copy)]
pub struct ZipArchiveWriter;

impl ArchiveWriter for ZipArchiveWriter {
    fn create_zip(&self, source_dir: &Path, zip_path: &Path) -> Result<PathBuf, StorageError> {
        if let Some(parent) = zip_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = fs::File::create(zip_path)?;
        let mut writer = ZipWriter::new(file);
        let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);

        let entries = list_files(source_dir)?;
        for relative in &entries {
            let name = relative
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");
            writer.start_file(name, options)?;
            let bytes = fs::read(source_dir.join(relative))?;
            writer.write_all(&bytes)?;
        }
        writer.finish()?;
        debug!(zip = %zip_path.display(), entries = entries.len(), "Created archive");
        Ok(zip_path.to_path_buf())
    }
}
