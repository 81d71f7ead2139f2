use serde::{Deserialize, Serialize};

pub use crate::storage::store::{EntryKind, FileEntry};

/// Response body of `GET /api/v1/list`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Listing {
    pub path: String,
    pub entries: Vec<FileEntry>,
}
