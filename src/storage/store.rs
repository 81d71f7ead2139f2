use anyhow::{anyhow, Context, Result};
use log::warn;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tokio::fs;

use super::path;

/// Kind of a directory entry. `Dir` orders before `File`, which is the
/// listing order the API exposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    Dir,
    File,
}

/// One entry of a listing as it appears on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileEntry {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: EntryKind,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub size: Option<u64>,
}

/// A shared folder exposed under the virtual root as `/<name>`.
#[derive(Debug, Clone)]
pub struct SharedRoot {
    pub name: String,
    pub dir: PathBuf,
}

/// Maps logical share paths onto the local filesystem. The logical root
/// `/` is virtual: it lists the share roots and resolves to nothing.
#[derive(Debug, Clone, Default)]
pub struct SharedStore {
    roots: Vec<SharedRoot>,
}

impl SharedStore {
    pub fn new(roots: Vec<SharedRoot>) -> Self {
        let mut seen: Vec<String> = Vec::new();
        let mut unique = Vec::new();
        for root in roots {
            if seen.contains(&root.name) {
                warn!("Ignoring duplicate share root name '{}'", root.name);
                continue;
            }
            seen.push(root.name.clone());
            unique.push(root);
        }
        Self { roots: unique }
    }

    pub fn roots(&self) -> &[SharedRoot] {
        &self.roots
    }

    /// Resolve a logical path to an existing filesystem path. The root
    /// and unknown or dot-relative segments resolve to `None`.
    pub async fn resolve(&self, logical: &str) -> Option<PathBuf> {
        let normalized = path::normalize(Some(logical));
        let segments = path::split_segments(&normalized);
        let (first, rest) = segments.split_first()?;
        let root = self.roots.iter().find(|r| r.name == *first)?;
        let mut current = root.dir.clone();
        for segment in rest {
            if !path::is_valid_segment(segment) {
                return None;
            }
            current = current.join(segment);
        }
        match fs::metadata(&current).await {
            Ok(_) => Some(current),
            Err(_) => None,
        }
    }

    /// List a logical path. Unresolved or non-directory paths list
    /// empty. Entries come back sorted directories first, then by
    /// case-insensitive name.
    pub async fn list(&self, logical: Option<&str>) -> (String, Vec<FileEntry>) {
        let normalized = path::normalize(logical);
        if normalized == "/" {
            let mut entries: Vec<FileEntry> = self
                .roots
                .iter()
                .map(|r| FileEntry {
                    name: r.name.clone(),
                    kind: EntryKind::Dir,
                    size: None,
                })
                .collect();
            entries.sort_by_key(|e| e.name.to_lowercase());
            return (normalized, entries);
        }
        let Some(dir) = self.resolve(&normalized).await else {
            return (normalized, Vec::new());
        };
        let Ok(mut reader) = fs::read_dir(&dir).await else {
            return (normalized, Vec::new());
        };
        let mut entries = Vec::new();
        while let Ok(Some(child)) = reader.next_entry().await {
            let name = match child.file_name().into_string() {
                Ok(name) => name,
                Err(_) => continue,
            };
            let Ok(meta) = child.metadata().await else {
                continue;
            };
            if meta.is_dir() {
                entries.push(FileEntry {
                    name,
                    kind: EntryKind::Dir,
                    size: None,
                });
            } else {
                entries.push(FileEntry {
                    name,
                    kind: EntryKind::File,
                    size: Some(meta.len()),
                });
            }
        }
        entries.sort_by(|a, b| {
            a.kind
                .cmp(&b.kind)
                .then_with(|| a.name.to_lowercase().cmp(&b.name.to_lowercase()))
        });
        (normalized, entries)
    }

    /// Open a shared file for reading.
    pub async fn open_read(&self, logical: &str) -> Result<fs::File> {
        let resolved = self
            .resolve(logical)
            .await
            .ok_or_else(|| anyhow!("path not found: {}", logical))?;
        let meta = fs::metadata(&resolved).await?;
        if !meta.is_file() {
            return Err(anyhow!("not a file: {}", logical));
        }
        fs::File::open(&resolved)
            .await
            .with_context(|| format!("failed to open {}", logical))
    }

    /// Create `name` under a logical directory for writing, replacing
    /// any existing same-named entry (last write wins).
    pub async fn create_file(&self, parent_logical: &str, name: &str) -> Result<fs::File> {
        if !path::is_valid_segment(name) {
            return Err(anyhow!("invalid file name: {}", name));
        }
        let parent = self
            .resolve(parent_logical)
            .await
            .ok_or_else(|| anyhow!("parent not found: {}", parent_logical))?;
        if !fs::metadata(&parent).await?.is_dir() {
            return Err(anyhow!("parent is not a directory: {}", parent_logical));
        }
        let target = parent.join(name);
        if let Ok(existing) = fs::metadata(&target).await {
            if existing.is_dir() {
                fs::remove_dir_all(&target).await?;
            } else {
                fs::remove_file(&target).await?;
            }
        }
        fs::File::create(&target)
            .await
            .with_context(|| format!("failed to create {}/{}", parent_logical, name))
    }

    /// Create a single directory named `name` under a logical parent.
    pub async fn mkdir(&self, parent_logical: &str, name: &str) -> Result<PathBuf> {
        if !path::is_valid_segment(name) {
            return Err(anyhow!("invalid directory name: {}", name));
        }
        let parent = self
            .resolve(parent_logical)
            .await
            .ok_or_else(|| anyhow!("parent not found: {}", parent_logical))?;
        if !fs::metadata(&parent).await?.is_dir() {
            return Err(anyhow!("parent is not a directory: {}", parent_logical));
        }
        let target = parent.join(name);
        fs::create_dir(&target)
            .await
            .with_context(|| format!("failed to create directory {}/{}", parent_logical, name))?;
        Ok(target)
    }

    /// Recursively delete a logical path. The virtual root and the
    /// share roots themselves are configuration, not data, and cannot
    /// be deleted.
    pub async fn delete(&self, logical: &str) -> Result<()> {
        let normalized = path::normalize(Some(logical));
        let segments = path::split_segments(&normalized);
        if segments.is_empty() {
            return Err(anyhow!("cannot delete the root"));
        }
        if segments.len() == 1 {
            return Err(anyhow!("cannot delete a share root: {}", normalized));
        }
        let resolved = self
            .resolve(&normalized)
            .await
            .ok_or_else(|| anyhow!("path not found: {}", normalized))?;
        let meta = fs::metadata(&resolved).await?;
        if meta.is_dir() {
            fs::remove_dir_all(&resolved).await?;
        } else {
            fs::remove_file(&resolved).await?;
        }
        Ok(())
    }

    /// Best-effort content type by file extension.
    pub fn mime_type(&self, name: &str) -> String {
        mime_guess::from_path(name)
            .first_or_octet_stream()
            .to_string()
    }
}
