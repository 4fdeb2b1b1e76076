//! Filesystem content store for embedded mode.
//!
//! Serves the same contract the server's contents API exposes over HTTP, but
//! directly against the server's root directory.

use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};

use crate::backend::traits::{BackendError, ContentEntry, ContentStore};

pub struct LocalContentStore {
    root: PathBuf,
}

impl LocalContentStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Join `path` under the store root, rejecting traversal outside it.
    fn resolve(&self, path: &str) -> Result<PathBuf, BackendError> {
        let rel = Path::new(path);
        if rel.is_absolute()
            || rel
                .components()
                .any(|c| matches!(c, Component::ParentDir | Component::Prefix(_)))
        {
            return Err(BackendError::NotFound(format!(
                "path '{path}' escapes the content root"
            )));
        }
        Ok(self.root.join(rel))
    }
}

fn entry_kind(path: &Path, is_dir: bool) -> &'static str {
    if is_dir {
        "directory"
    } else if path.extension().is_some_and(|ext| ext == "ipynb") {
        "notebook"
    } else {
        "file"
    }
}

/// A minimal empty v4 notebook.
fn empty_notebook_json() -> Result<String, BackendError> {
    let notebook = nbformat::v4::Notebook {
        metadata: nbformat::v4::Metadata {
            kernelspec: None,
            language_info: None,
            authors: None,
            additional: HashMap::new(),
        },
        nbformat: 4,
        nbformat_minor: 5,
        cells: vec![],
    };
    nbformat::serialize_notebook(&nbformat::Notebook::V4(notebook))
        .map_err(|e| BackendError::Protocol(e.to_string()))
}

#[async_trait]
impl ContentStore for LocalContentStore {
    async fn get(&self, path: &str) -> Result<String, BackendError> {
        let full = self.resolve(path)?;
        tokio::fs::read_to_string(&full).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                BackendError::NotFound(format!("'{path}' not found"))
            } else {
                BackendError::Io(e)
            }
        })
    }

    async fn save(&self, path: &str, content: &str) -> Result<(), BackendError> {
        let full = self.resolve(path)?;
        if let Some(parent) = full.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&full, content).await?;
        Ok(())
    }

    async fn create(&self, path: &str) -> Result<(), BackendError> {
        let full = self.resolve(path)?;
        if full.exists() {
            return Err(BackendError::Conflict(format!("'{path}' already exists")));
        }
        self.save(path, &empty_notebook_json()?).await
    }

    async fn delete(&self, path: &str) -> Result<(), BackendError> {
        let full = self.resolve(path)?;
        tokio::fs::remove_file(&full).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                BackendError::NotFound(format!("'{path}' not found"))
            } else {
                BackendError::Io(e)
            }
        })
    }

    async fn list(&self, path: &str) -> Result<Vec<ContentEntry>, BackendError> {
        let full = self.resolve(path)?;
        let mut dir = tokio::fs::read_dir(&full).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                BackendError::NotFound(format!("'{path}' not found"))
            } else {
                BackendError::Io(e)
            }
        })?;

        let mut entries = Vec::new();
        while let Some(entry) = dir.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            let metadata = entry.metadata().await?;
            let child_path = if path.is_empty() {
                name.clone()
            } else {
                format!("{path}/{name}")
            };
            let last_modified = metadata
                .modified()
                .ok()
                .map(|t| DateTime::<Utc>::from(t).format("%Y-%m-%d %H:%M:%S").to_string());
            entries.push(ContentEntry {
                kind: entry_kind(&entry.path(), metadata.is_dir()).to_string(),
                size: (!metadata.is_dir()).then(|| metadata.len()),
                name,
                path: child_path,
                last_modified,
            });
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    async fn id_for(&self, path: &str) -> Result<String, BackendError> {
        let full = self.resolve(path)?;
        let mut hasher = Sha256::new();
        hasher.update(full.to_string_lossy().as_bytes());
        // 6 bytes = 12 hex chars, plenty for a per-server document id
        Ok(hex::encode(&hasher.finalize()[..6]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn create_get_delete_round_trip() {
        let tmp = tempfile::TempDir::new().unwrap();
        let store = LocalContentStore::new(tmp.path());

        store.create("analysis.ipynb").await.unwrap();
        let raw = store.get("analysis.ipynb").await.unwrap();
        assert!(raw.contains("\"nbformat\": 4"));

        assert!(matches!(
            store.create("analysis.ipynb").await,
            Err(BackendError::Conflict(_))
        ));

        store.delete("analysis.ipynb").await.unwrap();
        assert!(matches!(
            store.get("analysis.ipynb").await,
            Err(BackendError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn list_reports_kinds_and_sizes() {
        let tmp = tempfile::TempDir::new().unwrap();
        let store = LocalContentStore::new(tmp.path());
        store.create("nb.ipynb").await.unwrap();
        store.save("data/readme.txt", "hello").await.unwrap();

        let entries = store.list("").await.unwrap();
        let kinds: Vec<(&str, &str)> = entries
            .iter()
            .map(|e| (e.name.as_str(), e.kind.as_str()))
            .collect();
        assert_eq!(kinds, vec![("data", "directory"), ("nb.ipynb", "notebook")]);

        let nested = store.list("data").await.unwrap();
        assert_eq!(nested[0].kind, "file");
        assert_eq!(nested[0].size, Some(5));
        assert_eq!(nested[0].path, "data/readme.txt");
    }

    #[tokio::test]
    async fn id_for_is_stable_and_distinct() {
        let tmp = tempfile::TempDir::new().unwrap();
        let store = LocalContentStore::new(tmp.path());
        let a1 = store.id_for("a.ipynb").await.unwrap();
        let a2 = store.id_for("a.ipynb").await.unwrap();
        let b = store.id_for("b.ipynb").await.unwrap();
        assert_eq!(a1, a2);
        assert_ne!(a1, b);
        assert_eq!(a1.len(), 12);
    }

    #[tokio::test]
    async fn traversal_is_rejected() {
        let tmp = tempfile::TempDir::new().unwrap();
        let store = LocalContentStore::new(tmp.path());
        assert!(store.get("../etc/passwd").await.is_err());
        assert!(store.get("/etc/passwd").await.is_err());
    }
}
