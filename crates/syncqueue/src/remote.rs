//! Remote persistence service seam.
//!
//! The queue hands each item to a [`RemotePersistence`] implementation and
//! only cares whether the write succeeded. [`FileDocumentStore`] is a
//! document store kept in a local directory, used by the `syncq` binary and
//! by tests that want to inspect what was written.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::item::{OperationKind, WriteRequest};

/// Destination for dispatched queue items.
///
/// Later writes for the same entity overwrite earlier ones, so a write may be
/// repeated safely.
#[async_trait]
pub trait RemotePersistence: Send + Sync + std::fmt::Debug {
    /// Perform a merge-write (`SaveProgress`) or tombstone-write
    /// (`ClearProgress`) against the document named by
    /// `request.target_entity_id`.
    ///
    /// # Errors
    ///
    /// Returns an error if the write did not happen; the queue retries it.
    async fn write(&self, request: &WriteRequest) -> Result<()>;
}

/// A [`RemotePersistence`] storing one JSON document per entity in a directory.
#[derive(Debug, Clone)]
pub struct FileDocumentStore {
    root: PathBuf,
}

impl FileDocumentStore {
    /// Create a store rooted at `root`. The directory is created on first write.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Directory holding the documents.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Read the document for `entity_id`, if one exists.
    ///
    /// # Errors
    ///
    /// Returns an error if the document exists but cannot be read or parsed.
    pub async fn read(&self, entity_id: &str) -> Result<Option<Value>> {
        let path = self.document_path(entity_id);
        match tokio::fs::read_to_string(&path).await {
            Ok(text) => Ok(Some(serde_json::from_str(&text)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn document_path(&self, entity_id: &str) -> PathBuf {
        let name = blake3::hash(entity_id.as_bytes()).to_hex();
        self.root.join(format!("{name}.json"))
    }

    async fn store(&self, entity_id: &str, document: &Value) -> Result<()> {
        tokio::fs::create_dir_all(&self.root)
            .await
            .map_err(|source| Error::DirectoryCreate {
                path: self.root.clone(),
                source,
            })?;

        let path = self.document_path(entity_id);
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, serde_json::to_vec_pretty(document)?).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }
}

/// Merge the top-level fields of `payload` into `existing`.
///
/// Tombstones and non-object documents are replaced. Non-object payloads are
/// stored under `value`.
fn merge_document(existing: Option<Value>, payload: Option<&Value>) -> Map<String, Value> {
    let mut document = match existing {
        Some(Value::Object(map)) if !is_tombstone(&map) => map,
        _ => Map::new(),
    };

    match payload {
        Some(Value::Object(fields)) => {
            for (key, value) in fields {
                document.insert(key.clone(), value.clone());
            }
        }
        Some(other) => {
            document.insert("value".to_string(), other.clone());
        }
        None => {}
    }
    document
}

fn is_tombstone(document: &Map<String, Value>) -> bool {
    document.get("deleted").and_then(Value::as_bool) == Some(true)
}

#[async_trait]
impl RemotePersistence for FileDocumentStore {
    async fn write(&self, request: &WriteRequest) -> Result<()> {
        let entity_id = request.target_entity_id.as_str();
        if entity_id.trim().is_empty() {
            return Err(Error::InvalidEntityId(entity_id.to_string()));
        }

        let now = Value::String(Utc::now().to_rfc3339());
        let document = match request.operation_kind {
            OperationKind::SaveProgress => {
                let existing = match self.read(entity_id).await {
                    Ok(existing) => existing,
                    Err(Error::Json(e)) => {
                        warn!(entity_id, error = %e, "remote document is corrupt; replacing it");
                        None
                    }
                    Err(e) => return Err(e),
                };
                let mut document = merge_document(existing, request.payload.as_ref());
                document.insert("entity_id".to_string(), Value::from(entity_id));
                document.insert("updated_at".to_string(), now);
                Value::Object(document)
            }
            OperationKind::ClearProgress => serde_json::json!({
                "entity_id": entity_id,
                "deleted": true,
                "deleted_at": now,
            }),
        };

        self.store(entity_id, &document).await?;
        debug!(
            entity_id,
            operation = %request.operation_kind,
            "remote document written"
        );
        Ok(())
    }
}
