//! Request handlers for the file-serving API.

use axum::body::Body;
use axum::extract::{Multipart, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{Html, IntoResponse, Response};
use axum::Json;
use log::{debug, warn};
use serde::Deserialize;
use std::io::SeekFrom;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio_util::io::ReaderStream;

use crate::api::models::Listing;
use crate::storage::{path as share_path, SharedStore};

/// Error type mapped onto HTTP statuses. Internal failures never leak
/// details to the peer beyond a generic message.
#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    NotFound(String),
    Internal(anyhow::Error),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg).into_response(),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg).into_response(),
            ApiError::Internal(err) => {
                warn!("Request failed: {:#}", err);
                (StatusCode::INTERNAL_SERVER_ERROR, "internal error".to_string()).into_response()
            }
        }
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        ApiError::Internal(err)
    }
}

#[derive(Deserialize)]
pub struct PathQuery {
    pub path: Option<String>,
}

#[derive(Deserialize)]
pub struct MkdirQuery {
    pub path: Option<String>,
    pub name: Option<String>,
}

pub async fn ping() -> &'static str {
    "ok"
}

pub async fn list(
    State(store): State<Arc<SharedStore>>,
    Query(query): Query<PathQuery>,
) -> Json<Listing> {
    let (path, entries) = store.list(query.path.as_deref()).await;
    Json(Listing { path, entries })
}

pub async fn file(
    State(store): State<Arc<SharedStore>>,
    Query(query): Query<PathQuery>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let path = query
        .path
        .filter(|p| !p.trim().is_empty())
        .ok_or_else(|| ApiError::BadRequest("missing path".to_string()))?;
    let resolved = store
        .resolve(&path)
        .await
        .ok_or_else(|| ApiError::NotFound("file not found".to_string()))?;
    let meta = tokio::fs::metadata(&resolved)
        .await
        .map_err(|_| ApiError::NotFound("file not found".to_string()))?;
    if !meta.is_file() {
        return Err(ApiError::NotFound("not a file".to_string()));
    }
    let total = meta.len();
    let mime = store.mime_type(&path);

    let range = match headers.get(header::RANGE) {
        Some(value) => {
            let raw = value
                .to_str()
                .map_err(|_| ApiError::BadRequest("invalid range header".to_string()))?;
            Some(
                parse_range(raw, total)
                    .ok_or_else(|| ApiError::BadRequest("invalid range".to_string()))?,
            )
        }
        None => None,
    };

    let mut file = tokio::fs::File::open(&resolved)
        .await
        .map_err(|e| ApiError::Internal(e.into()))?;

    match range {
        None => {
            debug!("Serving {} ({} bytes)", path, total);
            let stream = ReaderStream::new(file);
            Response::builder()
                .status(StatusCode::OK)
                .header(header::ACCEPT_RANGES, "bytes")
                .header(header::CONTENT_TYPE, mime)
                .header(header::CONTENT_LENGTH, total)
                .body(Body::from_stream(stream))
                .map_err(|e| ApiError::Internal(e.into()))
        }
        Some((start, end)) => {
            let length = end - start + 1;
            debug!("Serving {} range {}-{}/{}", path, start, end, total);
            file.seek(SeekFrom::Start(start))
                .await
                .map_err(|e| ApiError::Internal(e.into()))?;
            let stream = ReaderStream::new(file.take(length));
            Response::builder()
                .status(StatusCode::PARTIAL_CONTENT)
                .header(header::ACCEPT_RANGES, "bytes")
                .header(header::CONTENT_TYPE, mime)
                .header(header::CONTENT_LENGTH, length)
                .header(
                    header::CONTENT_RANGE,
                    format!("bytes {}-{}/{}", start, end, total),
                )
                .body(Body::from_stream(stream))
                .map_err(|e| ApiError::Internal(e.into()))
        }
    }
}

pub async fn upload(
    State(store): State<Arc<SharedStore>>,
    Query(query): Query<PathQuery>,
    mut multipart: Multipart,
) -> Result<StatusCode, ApiError> {
    let parent = query
        .path
        .filter(|p| !p.trim().is_empty())
        .ok_or_else(|| ApiError::BadRequest("missing path".to_string()))?;
    let resolved = store
        .resolve(&parent)
        .await
        .ok_or_else(|| ApiError::NotFound("target directory not found".to_string()))?;
    let meta = tokio::fs::metadata(&resolved)
        .await
        .map_err(|_| ApiError::NotFound("target directory not found".to_string()))?;
    if !meta.is_dir() {
        return Err(ApiError::NotFound("target is not a directory".to_string()));
    }

    let mut uploaded = false;
    while let Some(mut field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::BadRequest(format!("invalid multipart body: {}", e)))?
    {
        if field.name() != Some("file") {
            continue;
        }
        let file_name = field
            .file_name()
            .filter(|n| !n.is_empty())
            .unwrap_or("upload.bin")
            .to_string();
        let mut target = store.create_file(&parent, &file_name).await?;
        while let Some(chunk) = field
            .chunk()
            .await
            .map_err(|e| ApiError::BadRequest(format!("invalid multipart body: {}", e)))?
        {
            target
                .write_all(&chunk)
                .await
                .map_err(|e| ApiError::Internal(e.into()))?;
        }
        target.flush().await.map_err(|e| ApiError::Internal(e.into()))?;
        debug!("Uploaded {} into {}", file_name, parent);
        uploaded = true;
    }

    if uploaded {
        Ok(StatusCode::OK)
    } else {
        Err(ApiError::BadRequest("no file part".to_string()))
    }
}

pub async fn mkdir(
    State(store): State<Arc<SharedStore>>,
    Query(query): Query<MkdirQuery>,
) -> Result<StatusCode, ApiError> {
    let parent = query
        .path
        .filter(|p| !p.trim().is_empty())
        .ok_or_else(|| ApiError::BadRequest("missing path".to_string()))?;
    let name = query
        .name
        .filter(|n| !n.trim().is_empty())
        .ok_or_else(|| ApiError::BadRequest("missing name".to_string()))?;
    if !share_path::is_valid_segment(&name) {
        return Err(ApiError::BadRequest("invalid name".to_string()));
    }
    if store.resolve(&parent).await.is_none() {
        return Err(ApiError::NotFound("parent not found".to_string()));
    }
    store
        .mkdir(&parent, &name)
        .await
        .map_err(|e| ApiError::BadRequest(e.to_string()))?;
    Ok(StatusCode::OK)
}

pub async fn delete(
    State(store): State<Arc<SharedStore>>,
    Query(query): Query<PathQuery>,
) -> Result<StatusCode, ApiError> {
    let path = query
        .path
        .filter(|p| !p.trim().is_empty())
        .ok_or_else(|| ApiError::BadRequest("missing path".to_string()))?;
    let segments = share_path::split_segments(&path);
    if segments.len() <= 1 {
        return Err(ApiError::BadRequest("cannot delete a share root".to_string()));
    }
    if store.resolve(&path).await.is_none() {
        return Err(ApiError::NotFound("path not found".to_string()));
    }
    store.delete(&path).await?;
    Ok(StatusCode::OK)
}

/// Minimal browsable index of a path with download links and an upload
/// form.
pub async fn index(
    State(store): State<Arc<SharedStore>>,
    Query(query): Query<PathQuery>,
) -> Html<String> {
    let (path, entries) = store.list(query.path.as_deref()).await;
    let mut html = String::new();
    html.push_str("<html><body><h1>lanshelf</h1>");
    html.push_str(&format!("<p>Path: {}</p><ul>", escape_html(&path)));
    for entry in &entries {
        let entry_path = share_path::join(&path, &entry.name);
        let name = escape_html(&entry.name);
        match entry.kind {
            crate::storage::store::EntryKind::Dir => html.push_str(&format!(
                "<li>[dir] <a href=\"/?path={}\">{}</a></li>",
                escape_html(&entry_path),
                name
            )),
            crate::storage::store::EntryKind::File => html.push_str(&format!(
                "<li>[file] <a href=\"/api/v1/file?path={}\">{}</a></li>",
                escape_html(&entry_path),
                name
            )),
        }
    }
    html.push_str("</ul>");
    html.push_str(&format!(
        "<form method=\"post\" enctype=\"multipart/form-data\" action=\"/api/v1/upload?path={}\">\
         <input type=\"file\" name=\"file\" /><button type=\"submit\">Upload</button></form>",
        escape_html(&path)
    ));
    html.push_str("</body></html>");
    Html(html)
}

fn escape_html(value: &str) -> String {
    value
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

/// Parse a single `bytes=S-E` or `bytes=S-` range against a file of
/// `total` bytes. The end is clipped to the last byte. Returns `None`
/// for anything malformed or unsatisfiable.
pub fn parse_range(header: &str, total: u64) -> Option<(u64, u64)> {
    let spec = header.strip_prefix("bytes=")?.trim();
    if spec.contains(',') || total == 0 {
        return None;
    }
    let (start_text, end_text) = spec.split_once('-')?;
    let start: u64 = start_text.trim().parse().ok()?;
    let end = if end_text.trim().is_empty() {
        total - 1
    } else {
        end_text.trim().parse().ok()?
    };
    let end = end.min(total - 1);
    if start > end {
        return None;
    }
    Some((start, end))
}
