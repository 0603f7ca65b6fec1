//! Content I/O collaborator.
//!
//! Rooms read and write files only through [`ContentsManager`]. The
//! filesystem implementation resolves repository-relative paths under a
//! root directory and keeps the file identity tracker informed of moves,
//! copies and deletions it performs itself.

use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::file_id::FileIdManager;

/// On-disk representation of a document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileFormat {
    /// UTF-8 text, materialized as a JSON string
    Text,
    /// JSON document, materialized as-is
    Json,
}

impl FileFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileFormat::Text => "text",
            FileFormat::Json => "json",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "text" => Some(FileFormat::Text),
            "json" => Some(FileFormat::Json),
            _ => None,
        }
    }
}

/// A file as returned by the contents collaborator.
#[derive(Debug, Clone, PartialEq)]
pub struct FileModel {
    pub path: String,
    /// `None` when read without body.
    pub content: Option<Value>,
    pub format: FileFormat,
    pub last_modified: SystemTime,
}

/// Arguments to [`ContentsManager::write`].
#[derive(Debug, Clone)]
pub struct SaveRequest {
    pub path: String,
    pub content: Value,
    pub format: FileFormat,
    pub doc_type: String,
}

/// Contents errors.
#[derive(Debug, Error)]
pub enum ContentsError {
    #[error("no such file: {0}")]
    NotFound(String),
    #[error("path escapes the root directory: {0}")]
    InvalidPath(String),
    #[error("content does not match format {format:?}: {reason}")]
    InvalidContent { format: FileFormat, reason: String },
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

#[async_trait]
pub trait ContentsManager: Send + Sync {
    async fn read(
        &self,
        path: &str,
        format: FileFormat,
        with_body: bool,
    ) -> Result<FileModel, ContentsError>;

    /// Persist content; the returned model carries the new modification time.
    async fn write(&self, request: SaveRequest) -> Result<FileModel, ContentsError>;

    async fn rename(&self, from: &str, to: &str) -> Result<(), ContentsError>;

    async fn copy(&self, from: &str, to: &str) -> Result<(), ContentsError>;

    async fn delete(&self, path: &str) -> Result<(), ContentsError>;
}

/// [`ContentsManager`] over a local directory.
pub struct FsContents {
    root: PathBuf,
    file_ids: Option<Arc<FileIdManager>>,
}

impl FsContents {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            file_ids: None,
        }
    }

    /// Report renames, copies and deletions to the file identity tracker.
    pub fn with_file_ids(mut self, file_ids: Arc<FileIdManager>) -> Self {
        self.file_ids = Some(file_ids);
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, path: &str) -> Result<PathBuf, ContentsError> {
        let relative = Path::new(path);
        let escapes = relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
        if escapes {
            return Err(ContentsError::InvalidPath(path.to_string()));
        }
        Ok(self.root.join(relative))
    }

    async fn modified(full: &Path, path: &str) -> Result<SystemTime, ContentsError> {
        match tokio::fs::metadata(full).await {
            Ok(meta) => Ok(meta.modified()?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(ContentsError::NotFound(path.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl ContentsManager for FsContents {
    async fn read(
        &self,
        path: &str,
        format: FileFormat,
        with_body: bool,
    ) -> Result<FileModel, ContentsError> {
        let full = self.resolve(path)?;
        let last_modified = Self::modified(&full, path).await?;
        let content = if with_body {
            let raw = tokio::fs::read_to_string(&full).await?;
            Some(match format {
                FileFormat::Text => Value::String(raw),
                FileFormat::Json => serde_json::from_str(&raw)?,
            })
        } else {
            None
        };
        Ok(FileModel {
            path: path.to_string(),
            content,
            format,
            last_modified,
        })
    }

    async fn write(&self, request: SaveRequest) -> Result<FileModel, ContentsError> {
        let full = self.resolve(&request.path)?;
        let body = match request.format {
            FileFormat::Text => request
                .content
                .as_str()
                .ok_or_else(|| ContentsError::InvalidContent {
                    format: FileFormat::Text,
                    reason: "expected a string".to_string(),
                })?
                .to_string(),
            FileFormat::Json => {
                let mut s = serde_json::to_string_pretty(&request.content)?;
                s.push('\n');
                s
            }
        };
        if let Some(parent) = full.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&full, body).await?;
        let last_modified = Self::modified(&full, &request.path).await?;
        log::debug!("Wrote {} ({})", request.path, request.doc_type);
        Ok(FileModel {
            path: request.path,
            content: Some(request.content),
            format: request.format,
            last_modified,
        })
    }

    async fn rename(&self, from: &str, to: &str) -> Result<(), ContentsError> {
        let src = self.resolve(from)?;
        let dst = self.resolve(to)?;
        Self::modified(&src, from).await?;
        if let Some(parent) = dst.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::rename(&src, &dst).await?;
        if let Some(ids) = &self.file_ids {
            if let Err(e) = ids.moved(from, to).await {
                log::warn!("File id update after rename {from} -> {to} failed: {e}");
            }
        }
        Ok(())
    }

    async fn copy(&self, from: &str, to: &str) -> Result<(), ContentsError> {
        let src = self.resolve(from)?;
        let dst = self.resolve(to)?;
        Self::modified(&src, from).await?;
        if let Some(parent) = dst.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::copy(&src, &dst).await?;
        if let Some(ids) = &self.file_ids {
            if let Err(e) = ids.copied(from, to).await {
                log::warn!("File id update after copy {from} -> {to} failed: {e}");
            }
        }
        Ok(())
    }

    async fn delete(&self, path: &str) -> Result<(), ContentsError> {
        let full = self.resolve(path)?;
        let meta = match tokio::fs::metadata(&full).await {
            Ok(meta) => meta,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(ContentsError::NotFound(path.to_string()));
            }
            Err(e) => return Err(e.into()),
        };
        if meta.is_dir() {
            tokio::fs::remove_dir_all(&full).await?;
        } else {
            tokio::fs::remove_file(&full).await?;
        }
        if let Some(ids) = &self.file_ids {
            if let Err(e) = ids.deleted(path).await {
                log::warn!("File id update after delete of {path} failed: {e}");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_text_write_then_read() {
        let dir = tempfile::tempdir().unwrap();
        let contents = FsContents::new(dir.path());
        let written = contents
            .write(SaveRequest {
                path: "notes/a.txt".into(),
                content: json!("hello"),
                format: FileFormat::Text,
                doc_type: "file".into(),
            })
            .await
            .unwrap();

        let read = contents.read("notes/a.txt", FileFormat::Text, true).await.unwrap();
        assert_eq!(read.content, Some(json!("hello")));
        assert_eq!(read.last_modified, written.last_modified);

        let meta_only = contents.read("notes/a.txt", FileFormat::Text, false).await.unwrap();
        assert!(meta_only.content.is_none());
    }

    #[tokio::test]
    async fn test_json_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let contents = FsContents::new(dir.path());
        let nb = json!({"cells": [], "metadata": {}, "nbformat": 4, "nbformat_minor": 5});
        contents
            .write(SaveRequest {
                path: "a.ipynb".into(),
                content: nb.clone(),
                format: FileFormat::Json,
                doc_type: "notebook".into(),
            })
            .await
            .unwrap();
        let read = contents.read("a.ipynb", FileFormat::Json, true).await.unwrap();
        assert_eq!(read.content, Some(nb));
    }

    #[tokio::test]
    async fn test_missing_file_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let contents = FsContents::new(dir.path());
        let err = contents.read("nope.txt", FileFormat::Text, true).await.unwrap_err();
        assert!(matches!(err, ContentsError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_rejects_escaping_paths() {
        let dir = tempfile::tempdir().unwrap();
        let contents = FsContents::new(dir.path());
        let err = contents.read("../etc/passwd", FileFormat::Text, true).await.unwrap_err();
        assert!(matches!(err, ContentsError::InvalidPath(_)));
    }

    #[tokio::test]
    async fn test_rename_copy_delete() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), "x").unwrap();
        let contents = FsContents::new(dir.path());

        contents.rename("a.txt", "sub/b.txt").await.unwrap();
        assert!(dir.path().join("sub/b.txt").exists());
        contents.copy("sub/b.txt", "c.txt").await.unwrap();
        assert!(dir.path().join("c.txt").exists());
        contents.delete("sub").await.unwrap();
        assert!(!dir.path().join("sub").exists());
        assert!(matches!(
            contents.delete("sub").await,
            Err(ContentsError::NotFound(_))
        ));
    }
}
