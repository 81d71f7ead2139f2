//! Copy and move orchestration between devices.
//!
//! Transfers run sequentially, depth-first, and abort on the first
//! failure. Before anything is written the destination directory is
//! checked for name collisions; a conflict or a failed check aborts the
//! whole transfer with nothing transferred.

use anyhow::{anyhow, Context, Result};
use futures_util::StreamExt;
use log::{debug, info, warn};
use reqwest::Body;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio_util::io::ReaderStream;

use crate::api::models::{EntryKind, FileEntry};
use crate::api::PeerClient;
use crate::storage::{path as share_path, SharedStore};

/// A device a transfer reads from or writes to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: &str, port: u16) -> Self {
        Self {
            host: host.to_string(),
            port,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferMode {
    Copy,
    Move,
}

/// Terminal state of one transfer request.
#[derive(Debug, PartialEq, Eq)]
pub enum TransferOutcome {
    Completed { items: usize },
    /// An entry with this name already exists at the destination.
    Conflict { name: String },
    /// The destination could not be checked for collisions.
    CheckFailed,
    /// An item failed mid-transfer; everything after it was skipped.
    Failed { name: String, reason: String },
}

#[derive(Debug, Clone)]
pub struct TransferProgress {
    pub done: usize,
    pub total: usize,
    pub name: String,
}

/// Type of progress callback for transfers.
pub type ProgressCallback = Arc<dyn Fn(TransferProgress) + Send + Sync>;

struct ProgressTracker<'a> {
    done: usize,
    total: usize,
    callback: Option<&'a ProgressCallback>,
}

impl ProgressTracker<'_> {
    fn step(&mut self, name: &str) {
        self.done += 1;
        if let Some(callback) = self.callback {
            callback(TransferProgress {
                done: self.done,
                total: self.total,
                name: name.to_string(),
            });
        }
    }
}

/// Runs transfers between this device and its peers. Paths on the local
/// endpoint go through the store directly; if a direct write ever
/// fails, subsequent local writes are relayed through this device's own
/// HTTP server instead.
pub struct TransferOrchestrator {
    client: PeerClient,
    store: Arc<SharedStore>,
    local: Endpoint,
    relay_writes: AtomicBool,
}

impl TransferOrchestrator {
    pub fn new(store: Arc<SharedStore>, local: Endpoint) -> Result<Self> {
        Ok(Self {
            client: PeerClient::new()?,
            store,
            local,
            relay_writes: AtomicBool::new(false),
        })
    }

    fn is_local(&self, endpoint: &Endpoint) -> bool {
        endpoint == &self.local
    }

    /// Copy or move `source_paths` into the `dest_path` directory.
    pub async fn transfer(
        &self,
        source: &Endpoint,
        source_paths: &[String],
        dest: &Endpoint,
        dest_path: &str,
        mode: TransferMode,
        progress: Option<ProgressCallback>,
    ) -> TransferOutcome {
        // Collision check before any write.
        let existing = match self.list_entries(dest, dest_path).await {
            Ok(entries) => entries,
            Err(e) => {
                warn!("Cannot check destination {}: {:#}", dest_path, e);
                return TransferOutcome::CheckFailed;
            }
        };
        let taken: HashSet<&str> = existing.iter().map(|e| e.name.as_str()).collect();
        for path in source_paths {
            let name = item_name(path);
            if taken.contains(name) {
                info!("Transfer aborted, '{}' already exists at {}", name, dest_path);
                return TransferOutcome::Conflict {
                    name: name.to_string(),
                };
            }
        }

        let mut total = 0;
        for path in source_paths {
            match self.count_items(source, path).await {
                Ok(count) => total += count,
                Err(e) => {
                    warn!("Cannot inspect source {}: {:#}", path, e);
                    return TransferOutcome::CheckFailed;
                }
            }
        }

        let mut tracker = ProgressTracker {
            done: 0,
            total,
            callback: progress.as_ref(),
        };
        for path in source_paths {
            let name = item_name(path).to_string();
            if let Err(e) = self
                .copy_tree(source, path, dest, dest_path, &mut tracker)
                .await
            {
                warn!("Transfer of {} failed: {:#}", path, e);
                return TransferOutcome::Failed {
                    name,
                    reason: format!("{:#}", e),
                };
            }
            if mode == TransferMode::Move {
                if let Err(e) = self.delete_entry(source, path).await {
                    warn!("Failed to delete {} after move: {:#}", path, e);
                    return TransferOutcome::Failed {
                        name,
                        reason: format!("{:#}", e),
                    };
                }
            }
        }
        info!(
            "Transfer complete: {} item(s) into {}:{}{}",
            tracker.done, dest.host, dest.port, dest_path
        );
        TransferOutcome::Completed {
            items: tracker.done,
        }
    }

    /// Items (files and directories) a transfer of `path` will create.
    async fn count_items(&self, endpoint: &Endpoint, path: &str) -> Result<usize> {
        let entry = self.entry_of(endpoint, path).await?;
        let mut total = 1;
        if entry.kind == EntryKind::Dir {
            let mut stack = vec![path.to_string()];
            while let Some(dir) = stack.pop() {
                for child in self.list_entries(endpoint, &dir).await? {
                    total += 1;
                    if child.kind == EntryKind::Dir {
                        stack.push(share_path::join(&dir, &child.name));
                    }
                }
            }
        }
        Ok(total)
    }

    /// Materialize one source item under `dest_dir`, depth-first.
    async fn copy_tree(
        &self,
        source: &Endpoint,
        src_root: &str,
        dest: &Endpoint,
        dest_dir: &str,
        tracker: &mut ProgressTracker<'_>,
    ) -> Result<()> {
        let root = self.entry_of(source, src_root).await?;
        let mut stack = vec![(root, src_root.to_string(), dest_dir.to_string())];
        while let Some((entry, src_path, dest_parent)) = stack.pop() {
            match entry.kind {
                EntryKind::File => {
                    debug!("Copying file {} into {}", src_path, dest_parent);
                    self.copy_file(source, &src_path, dest, &dest_parent, &entry.name)
                        .await?;
                }
                EntryKind::Dir => {
                    debug!("Creating directory {}/{}", dest_parent, entry.name);
                    self.make_dir(dest, &dest_parent, &entry.name).await?;
                    let dest_child = share_path::join(&dest_parent, &entry.name);
                    let mut children = self.list_entries(source, &src_path).await?;
                    // Reversed so the stack pops them in listing order.
                    children.reverse();
                    for child in children {
                        let child_path = share_path::join(&src_path, &child.name);
                        stack.push((child, child_path, dest_child.clone()));
                    }
                }
            }
            tracker.step(&entry.name);
        }
        Ok(())
    }

    async fn copy_file(
        &self,
        source: &Endpoint,
        src_path: &str,
        dest: &Endpoint,
        dest_parent: &str,
        name: &str,
    ) -> Result<()> {
        if self.is_local(dest) && !self.relay_writes.load(Ordering::SeqCst) {
            match self.write_local_direct(source, src_path, dest_parent, name).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    warn!(
                        "Direct write of {} failed ({:#}), relaying through own server",
                        name, e
                    );
                    self.relay_writes.store(true, Ordering::SeqCst);
                }
            }
        }
        let target = if self.is_local(dest) { &self.local } else { dest };
        let body = self.source_body(source, src_path).await?;
        self.client
            .upload(&target.host, target.port, dest_parent, name, body)
            .await
    }

    /// Write straight into the local store, streaming from wherever the
    /// source lives.
    async fn write_local_direct(
        &self,
        source: &Endpoint,
        src_path: &str,
        dest_parent: &str,
        name: &str,
    ) -> Result<()> {
        let mut file = self.store.create_file(dest_parent, name).await?;
        if self.is_local(source) {
            let mut reader = self.store.open_read(src_path).await?;
            tokio::io::copy(&mut reader, &mut file)
                .await
                .with_context(|| format!("failed to copy {}", src_path))?;
        } else {
            let response = self
                .client
                .download(&source.host, source.port, src_path)
                .await?;
            let mut stream = response.bytes_stream();
            while let Some(chunk) = stream.next().await {
                let chunk = chunk.with_context(|| format!("download of {} failed", src_path))?;
                file.write_all(&chunk)
                    .await
                    .with_context(|| format!("failed to write {}/{}", dest_parent, name))?;
            }
        }
        file.flush().await?;
        Ok(())
    }

    /// Streamed request body reading from the source item.
    async fn source_body(&self, source: &Endpoint, src_path: &str) -> Result<Body> {
        if self.is_local(source) {
            let reader = self.store.open_read(src_path).await?;
            Ok(Body::wrap_stream(ReaderStream::new(reader)))
        } else {
            let response = self
                .client
                .download(&source.host, source.port, src_path)
                .await?;
            Ok(Body::wrap_stream(response.bytes_stream()))
        }
    }

    async fn list_entries(&self, endpoint: &Endpoint, path: &str) -> Result<Vec<FileEntry>> {
        if self.is_local(endpoint) {
            if self.store.resolve(path).await.is_none() && share_path::normalize(Some(path)) != "/"
            {
                return Err(anyhow!("path not found: {}", path));
            }
            Ok(self.store.list(Some(path)).await.1)
        } else {
            Ok(self
                .client
                .list(&endpoint.host, endpoint.port, path)
                .await?
                .entries)
        }
    }

    async fn make_dir(&self, endpoint: &Endpoint, parent: &str, name: &str) -> Result<()> {
        if self.is_local(endpoint) && !self.relay_writes.load(Ordering::SeqCst) {
            self.store.mkdir(parent, name).await?;
            Ok(())
        } else {
            let target = if self.is_local(endpoint) {
                &self.local
            } else {
                endpoint
            };
            self.client.mkdir(&target.host, target.port, parent, name).await
        }
    }

    async fn delete_entry(&self, endpoint: &Endpoint, path: &str) -> Result<()> {
        if self.is_local(endpoint) {
            self.store.delete(path).await
        } else {
            self.client.delete(&endpoint.host, endpoint.port, path).await
        }
    }

    async fn entry_of(&self, endpoint: &Endpoint, path: &str) -> Result<FileEntry> {
        let name = item_name(path);
        if name.is_empty() {
            return Err(anyhow!("cannot transfer the root"));
        }
        if self.is_local(endpoint) {
            let resolved = self
                .store
                .resolve(path)
                .await
                .ok_or_else(|| anyhow!("path not found: {}", path))?;
            let meta = tokio::fs::metadata(&resolved).await?;
            Ok(FileEntry {
                name: name.to_string(),
                kind: if meta.is_dir() {
                    EntryKind::Dir
                } else {
                    EntryKind::File
                },
                size: meta.is_file().then(|| meta.len()),
            })
        } else {
            let parent = share_path::parent(path);
            let listing = self
                .client
                .list(&endpoint.host, endpoint.port, &parent)
                .await?;
            listing
                .entries
                .into_iter()
                .find(|e| e.name == name)
                .ok_or_else(|| anyhow!("{} not found on {}", path, endpoint.host))
        }
    }
}

/// Final segment of a logical path, the name a transfer creates at the
/// destination.
fn item_name(path: &str) -> &str {
    share_path::split_segments(path).last().copied().unwrap_or("")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::FileServer;
    use crate::storage::SharedRoot;
    use std::sync::Mutex;
    use tempfile::{tempdir, TempDir};

    struct TestDevice {
        dir: TempDir,
        store: Arc<SharedStore>,
        server: FileServer,
    }

    impl TestDevice {
        async fn start() -> Self {
            let dir = tempdir().unwrap();
            let store = Arc::new(SharedStore::new(vec![SharedRoot {
                name: "share".to_string(),
                dir: dir.path().to_path_buf(),
            }]));
            let server = FileServer::start(store.clone(), 0).await.unwrap();
            Self { dir, store, server }
        }

        fn endpoint(&self) -> Endpoint {
            Endpoint::new("127.0.0.1", self.server.port())
        }

        fn orchestrator(&self) -> TransferOrchestrator {
            TransferOrchestrator::new(self.store.clone(), self.endpoint()).unwrap()
        }
    }

    #[tokio::test]
    async fn copies_directory_tree_to_remote() {
        let local = TestDevice::start().await;
        let remote = TestDevice::start().await;
        std::fs::create_dir_all(local.dir.path().join("photos/trip")).unwrap();
        std::fs::write(local.dir.path().join("photos/one.jpg"), b"first").unwrap();
        std::fs::write(local.dir.path().join("photos/trip/two.jpg"), b"second").unwrap();

        let seen: Arc<Mutex<Vec<(usize, usize)>>> = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = seen.clone();
        let progress: ProgressCallback = Arc::new(move |p: TransferProgress| {
            seen_clone.lock().unwrap().push((p.done, p.total));
        });

        let orchestrator = local.orchestrator();
        let outcome = orchestrator
            .transfer(
                &local.endpoint(),
                &["/share/photos".to_string()],
                &remote.endpoint(),
                "/share",
                TransferMode::Copy,
                Some(progress),
            )
            .await;

        assert_eq!(outcome, TransferOutcome::Completed { items: 4 });
        assert_eq!(
            std::fs::read(remote.dir.path().join("photos/one.jpg")).unwrap(),
            b"first"
        );
        assert_eq!(
            std::fs::read(remote.dir.path().join("photos/trip/two.jpg")).unwrap(),
            b"second"
        );
        // Source untouched on copy.
        assert!(local.dir.path().join("photos/one.jpg").exists());
        let seen = seen.lock().unwrap();
        assert_eq!(seen.last(), Some(&(4, 4)));
    }

    #[tokio::test]
    async fn move_deletes_source_after_copy() {
        let local = TestDevice::start().await;
        let remote = TestDevice::start().await;
        std::fs::write(remote.dir.path().join("report.pdf"), b"contents").unwrap();

        let orchestrator = local.orchestrator();
        let outcome = orchestrator
            .transfer(
                &remote.endpoint(),
                &["/share/report.pdf".to_string()],
                &local.endpoint(),
                "/share",
                TransferMode::Move,
                None,
            )
            .await;

        assert_eq!(outcome, TransferOutcome::Completed { items: 1 });
        assert_eq!(
            std::fs::read(local.dir.path().join("report.pdf")).unwrap(),
            b"contents"
        );
        assert!(!remote.dir.path().join("report.pdf").exists());
    }

    #[tokio::test]
    async fn name_collision_aborts_before_any_write() {
        let local = TestDevice::start().await;
        let remote = TestDevice::start().await;
        std::fs::write(local.dir.path().join("a.txt"), b"x").unwrap();
        std::fs::write(local.dir.path().join("b.txt"), b"y").unwrap();
        std::fs::write(remote.dir.path().join("b.txt"), b"already here").unwrap();

        let orchestrator = local.orchestrator();
        let outcome = orchestrator
            .transfer(
                &local.endpoint(),
                &["/share/a.txt".to_string(), "/share/b.txt".to_string()],
                &remote.endpoint(),
                "/share",
                TransferMode::Copy,
                None,
            )
            .await;

        assert_eq!(
            outcome,
            TransferOutcome::Conflict {
                name: "b.txt".to_string()
            }
        );
        // Nothing was written, not even the non-conflicting item.
        assert!(!remote.dir.path().join("a.txt").exists());
        assert_eq!(
            std::fs::read(remote.dir.path().join("b.txt")).unwrap(),
            b"already here"
        );
    }

    #[tokio::test]
    async fn unreachable_destination_is_check_failed() {
        let local = TestDevice::start().await;
        std::fs::write(local.dir.path().join("a.txt"), b"x").unwrap();

        let orchestrator = local.orchestrator();
        let outcome = orchestrator
            .transfer(
                &local.endpoint(),
                &["/share/a.txt".to_string()],
                &Endpoint::new("127.0.0.1", 1),
                "/share",
                TransferMode::Copy,
                None,
            )
            .await;

        assert_eq!(outcome, TransferOutcome::CheckFailed);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn failed_write_aborts_move_and_preserves_source() {
        let local = TestDevice::start().await;
        let remote = TestDevice::start().await;
        // A backslash is a legal byte in the source file name but never
        // a valid share segment, so both the direct write and the
        // relayed upload fail regardless of who runs the tests.
        std::fs::write(remote.dir.path().join("keep\\it.txt"), b"precious").unwrap();

        let orchestrator = local.orchestrator();
        let outcome = orchestrator
            .transfer(
                &remote.endpoint(),
                &["/share/keep\\it.txt".to_string()],
                &local.endpoint(),
                "/share",
                TransferMode::Move,
                None,
            )
            .await;

        assert!(
            matches!(outcome, TransferOutcome::Failed { ref name, .. } if name == "keep\\it.txt")
        );
        // The source survives a failed move.
        assert_eq!(
            std::fs::read(remote.dir.path().join("keep\\it.txt")).unwrap(),
            b"precious"
        );
    }
}
