pub mod handlers;

use anyhow::{Context, Result};
use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post};
use axum::Router;
use log::{error, info};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::oneshot;

use crate::storage::SharedStore;

/// Build the router for the file-serving API.
pub fn create_router(store: Arc<SharedStore>) -> Router {
    Router::new()
        .route("/", get(handlers::index))
        .route("/api/v1/ping", get(handlers::ping))
        .route("/api/v1/list", get(handlers::list))
        .route("/api/v1/file", get(handlers::file))
        .route("/api/v1/upload", post(handlers::upload))
        .route("/api/v1/mkdir", post(handlers::mkdir))
        .route("/api/v1/delete", post(handlers::delete))
        .with_state(store)
        .layer(DefaultBodyLimit::disable())
}

/// Running HTTP server over a shared store. Dropping the handle leaves
/// the server running; call `stop` to shut it down.
pub struct FileServer {
    addr: SocketAddr,
    shutdown: Option<oneshot::Sender<()>>,
}

impl FileServer {
    /// Bind and start serving. Port 0 picks an ephemeral port; the
    /// actually bound address is available via `local_addr`.
    pub async fn start(store: Arc<SharedStore>, port: u16) -> Result<Self> {
        let listener = TcpListener::bind(SocketAddr::from(([0, 0, 0, 0], port)))
            .await
            .with_context(|| format!("failed to bind port {}", port))?;
        let addr = listener.local_addr()?;
        let router = create_router(store);
        let (tx, rx) = oneshot::channel();

        tokio::spawn(async move {
            let serve = axum::serve(listener, router).with_graceful_shutdown(async {
                let _ = rx.await;
            });
            match serve.await {
                Ok(()) => info!("File server shut down"),
                Err(e) => error!("File server error: {}", e),
            }
        });

        info!("File server listening on {}", addr);
        Ok(Self {
            addr,
            shutdown: Some(tx),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Signal the server to stop accepting connections.
    pub fn stop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
            info!("Sent shutdown signal to file server");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{SharedRoot, SharedStore};
    use tempfile::tempdir;

    async fn start_test_server(dir: &std::path::Path) -> FileServer {
        let store = Arc::new(SharedStore::new(vec![SharedRoot {
            name: "share".to_string(),
            dir: dir.to_path_buf(),
        }]));
        FileServer::start(store, 0).await.unwrap()
    }

    fn base(server: &FileServer) -> String {
        format!("http://127.0.0.1:{}", server.port())
    }

    #[tokio::test]
    async fn ping_and_empty_listing() {
        let dir = tempdir().unwrap();
        let server = start_test_server(dir.path()).await;
        let base = base(&server);

        let body = reqwest::get(format!("{}/api/v1/ping", base))
            .await
            .unwrap()
            .text()
            .await
            .unwrap();
        assert_eq!(body, "ok");

        let listing: serde_json::Value = reqwest::get(format!("{}/api/v1/list", base))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(listing["path"], "/");
        assert_eq!(listing["entries"][0]["name"], "share");
        assert_eq!(listing["entries"][0]["type"], "dir");

        let listing: serde_json::Value =
            reqwest::get(format!("{}/api/v1/list?path=/share", base))
                .await
                .unwrap()
                .json()
                .await
                .unwrap();
        assert_eq!(listing["path"], "/share");
        assert_eq!(listing["entries"].as_array().unwrap().len(), 0);
    }

    #[tokio::test]
    async fn ranged_download() {
        let dir = tempdir().unwrap();
        let payload: Vec<u8> = (0u8..100).collect();
        std::fs::write(dir.path().join("data.bin"), &payload).unwrap();
        let server = start_test_server(dir.path()).await;
        let base = base(&server);
        let client = reqwest::Client::new();
        let url = format!("{}/api/v1/file?path=/share/data.bin", base);

        let full = client.get(&url).send().await.unwrap();
        assert_eq!(full.status(), 200);
        assert_eq!(full.headers()["accept-ranges"], "bytes");
        assert_eq!(full.bytes().await.unwrap().as_ref(), &payload[..]);

        let partial = client
            .get(&url)
            .header("Range", "bytes=10-19")
            .send()
            .await
            .unwrap();
        assert_eq!(partial.status(), 206);
        assert_eq!(partial.headers()["content-range"], "bytes 10-19/100");
        assert_eq!(partial.headers()["content-length"], "10");
        assert_eq!(partial.bytes().await.unwrap().as_ref(), &payload[10..20]);

        let tail = client
            .get(&url)
            .header("Range", "bytes=90-")
            .send()
            .await
            .unwrap();
        assert_eq!(tail.status(), 206);
        assert_eq!(tail.bytes().await.unwrap().as_ref(), &payload[90..]);

        let bad = client
            .get(&url)
            .header("Range", "bytes=oops")
            .send()
            .await
            .unwrap();
        assert_eq!(bad.status(), 400);
    }

    #[tokio::test]
    async fn missing_file_is_404_and_missing_path_is_400() {
        let dir = tempdir().unwrap();
        let server = start_test_server(dir.path()).await;
        let base = base(&server);
        let client = reqwest::Client::new();

        let missing = client
            .get(format!("{}/api/v1/file?path=/share/nope.txt", base))
            .send()
            .await
            .unwrap();
        assert_eq!(missing.status(), 404);

        let no_path = client
            .get(format!("{}/api/v1/file", base))
            .send()
            .await
            .unwrap();
        assert_eq!(no_path.status(), 400);
    }

    #[tokio::test]
    async fn upload_writes_and_overwrites() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), b"old").unwrap();
        let server = start_test_server(dir.path()).await;
        let base = base(&server);
        let client = reqwest::Client::new();

        let form = reqwest::multipart::Form::new().part(
            "file",
            reqwest::multipart::Part::bytes(b"fresh bytes".to_vec()).file_name("a.txt"),
        );
        let response = client
            .post(format!("{}/api/v1/upload?path=/share", base))
            .multipart(form)
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 200);
        assert_eq!(
            std::fs::read(dir.path().join("a.txt")).unwrap(),
            b"fresh bytes"
        );

        // no file part
        let form = reqwest::multipart::Form::new().text("other", "x");
        let response = client
            .post(format!("{}/api/v1/upload?path=/share", base))
            .multipart(form)
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 400);

        // missing target directory
        let form = reqwest::multipart::Form::new().part(
            "file",
            reqwest::multipart::Part::bytes(b"x".to_vec()).file_name("b.txt"),
        );
        let response = client
            .post(format!("{}/api/v1/upload?path=/share/missing", base))
            .multipart(form)
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 404);
    }

    #[tokio::test]
    async fn mkdir_and_delete_round_trip() {
        let dir = tempdir().unwrap();
        let server = start_test_server(dir.path()).await;
        let base = base(&server);
        let client = reqwest::Client::new();

        let response = client
            .post(format!("{}/api/v1/mkdir?path=/share&name=docs", base))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 200);
        assert!(dir.path().join("docs").is_dir());

        std::fs::write(dir.path().join("docs/f.txt"), b"x").unwrap();
        let response = client
            .post(format!("{}/api/v1/delete?path=/share/docs", base))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 200);
        assert!(!dir.path().join("docs").exists());

        // share roots are not deletable
        let response = client
            .post(format!("{}/api/v1/delete?path=/share", base))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 400);
    }
}
