//! Local-filesystem storage backend.
//!
//! Finalization is an atomic rename after removing any prior tree, so a
//! half-moved archive layout is never observable.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use futures::StreamExt;
use log::{debug, info};
use tokio::io::AsyncReadExt;

use super::{
    scan_local_tree, FinalizeProgress, FinalizeProgressFn, StorageAdapter, UploadProgress,
    UploadProgressFn,
};

const PART_SIZE: u64 = 8 * 1024 * 1024;

/// Storage rooted at a base directory on the local filesystem.
pub struct LocalStorage {
    base: PathBuf,
    temp_base: PathBuf,
}

impl LocalStorage {
    pub fn new(base: impl Into<PathBuf>, temp_base: impl Into<PathBuf>) -> Self {
        Self {
            base: base.into(),
            temp_base: temp_base.into(),
        }
    }

    /// Resolve an adapter-relative path under the base, refusing traversal.
    fn resolve(&self, path: &str) -> Result<PathBuf> {
        let mut resolved = self.base.clone();
        for component in path.split('/') {
            if component.is_empty() || component == "." {
                continue;
            }
            if component == ".." {
                anyhow::bail!("path escapes storage root: {path}");
            }
            resolved.push(component);
        }
        Ok(resolved)
    }
}

#[async_trait]
impl StorageAdapter for LocalStorage {
    async fn write_file(&self, path: &str, data: Bytes) -> Result<()> {
        let target = self.resolve(path)?;
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&target, &data)
            .await
            .with_context(|| format!("failed to write {}", target.display()))
    }

    async fn write_file_from(
        &self,
        path: &str,
        local: &Path,
        progress: Option<UploadProgressFn>,
    ) -> Result<()> {
        let target = self.resolve(path)?;
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let total_bytes = tokio::fs::metadata(local).await?.len();
        let total_parts = total_bytes.div_ceil(PART_SIZE).max(1);

        let mut reader = tokio::fs::File::open(local)
            .await
            .with_context(|| format!("failed to open {}", local.display()))?;
        let mut writer = tokio::fs::File::create(&target)
            .await
            .with_context(|| format!("failed to create {}", target.display()))?;

        let mut uploaded: u64 = 0;
        let mut part_number: u64 = 0;
        let mut buffer = vec![0u8; PART_SIZE as usize];
        loop {
            let read = reader.read(&mut buffer).await?;
            if read == 0 {
                break;
            }
            tokio::io::AsyncWriteExt::write_all(&mut writer, &buffer[..read]).await?;
            uploaded += read as u64;
            part_number += 1;
            if let Some(cb) = &progress {
                cb(UploadProgress {
                    total_bytes,
                    uploaded_bytes: uploaded,
                    part_number,
                    total_parts,
                    current_part_bytes: read as u64,
                });
            }
        }
        tokio::io::AsyncWriteExt::flush(&mut writer).await?;
        Ok(())
    }

    async fn read_stream(&self, path: &str) -> Result<BoxStream<'static, Result<Bytes>>> {
        let target = self.resolve(path)?;
        let file = tokio::fs::File::open(&target)
            .await
            .with_context(|| format!("failed to open {}", target.display()))?;

        let stream = futures::stream::unfold(file, |mut file| async move {
            let mut buffer = vec![0u8; 64 * 1024];
            match file.read(&mut buffer).await {
                Ok(0) => None,
                Ok(read) => {
                    buffer.truncate(read);
                    Some((Ok(Bytes::from(buffer)), file))
                }
                Err(e) => Some((Err(anyhow::Error::from(e)), file)),
            }
        });
        Ok(stream.boxed())
    }

    async fn list_files(&self, prefix: &str) -> Result<Vec<String>> {
        let root = self.resolve(prefix)?;
        if !root.exists() {
            return Ok(Vec::new());
        }
        let (files, _) = scan_local_tree(&root).await?;
        let prefix = prefix.trim_matches('/');
        Ok(files
            .into_iter()
            .map(|f| {
                if prefix.is_empty() {
                    f.relative
                } else {
                    format!("{prefix}/{}", f.relative)
                }
            })
            .collect())
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        Ok(self.resolve(path)?.exists())
    }

    async fn create_temp_dir(&self, id: &str) -> Result<PathBuf> {
        let dir = self.temp_base.join(format!("crawl-{id}"));
        tokio::fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("failed to create temp dir {}", dir.display()))?;
        Ok(dir)
    }

    async fn move_to_final(
        &self,
        temp_dir: &Path,
        id: &str,
        progress: Option<FinalizeProgressFn>,
    ) -> Result<String> {
        let final_prefix = format!("archives/{id}");
        let final_path = self.resolve(&final_prefix)?;

        let (files, total_bytes) = scan_local_tree(temp_dir).await?;
        let files_total = files.len() as u64;
        if let Some(cb) = &progress {
            cb(FinalizeProgress {
                total_bytes,
                uploaded_bytes: 0,
                files_total,
                files_uploaded: 0,
                current_file: None,
            });
        }

        // Replace-then-rename keeps the final path atomic on one filesystem.
        if final_path.exists() {
            debug!("Removing prior archive at {}", final_path.display());
            tokio::fs::remove_dir_all(&final_path).await.ok();
        }
        if let Some(parent) = final_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        match tokio::fs::rename(temp_dir, &final_path).await {
            Ok(()) => {}
            Err(rename_err) => {
                // Cross-device temp roots fall back to copy + delete.
                debug!("Rename failed ({rename_err}), copying tree instead");
                for file in &files {
                    let target = final_path.join(&file.relative);
                    if let Some(parent) = target.parent() {
                        tokio::fs::create_dir_all(parent).await?;
                    }
                    tokio::fs::copy(&file.absolute, &target).await.with_context(|| {
                        format!("failed to copy {}", file.absolute.display())
                    })?;
                }
                tokio::fs::remove_dir_all(temp_dir).await.ok();
            }
        }

        if let Some(cb) = &progress {
            cb(FinalizeProgress {
                total_bytes,
                uploaded_bytes: total_bytes,
                files_total,
                files_uploaded: files_total,
                current_file: None,
            });
        }

        info!(
            "Archive finalized at {} ({} files, {} bytes)",
            final_path.display(),
            files_total,
            total_bytes
        );
        Ok(final_prefix)
    }

    async fn get_size(&self, prefix: &str) -> Result<u64> {
        let root = self.resolve(prefix)?;
        if root.is_file() {
            return Ok(tokio::fs::metadata(&root).await?.len());
        }
        if !root.exists() {
            return Ok(0);
        }
        let (_, total) = scan_local_tree(&root).await?;
        Ok(total)
    }

    async fn delete_dir(&self, prefix: &str) -> Result<()> {
        let target = self.resolve(prefix)?;
        if target.is_file() {
            tokio::fs::remove_file(&target).await?;
        } else if target.exists() {
            tokio::fs::remove_dir_all(&target).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn storage(dir: &TempDir) -> LocalStorage {
        LocalStorage::new(dir.path().join("store"), dir.path().join("tmp"))
    }

    #[tokio::test]
    async fn write_then_exists_and_size() {
        let dir = TempDir::new().expect("tempdir");
        let storage = storage(&dir);

        storage
            .write_file("archives/x/index.html", Bytes::from_static(b"<html></html>"))
            .await
            .expect("write");
        assert!(storage.exists("archives/x/index.html").await.expect("exists"));
        assert_eq!(storage.get_size("archives/x").await.expect("size"), 13);
    }

    #[tokio::test]
    async fn move_to_final_is_idempotent() {
        let dir = TempDir::new().expect("tempdir");
        let storage = storage(&dir);

        for round in 0..2 {
            let temp = storage.create_temp_dir("job1").await.expect("temp");
            tokio::fs::write(temp.join("index.html"), format!("round {round}"))
                .await
                .expect("write");
            let prefix = storage
                .move_to_final(&temp, "job1", None)
                .await
                .expect("finalize");
            assert_eq!(prefix, "archives/job1");
        }

        let files = storage.list_files("archives/job1").await.expect("list");
        assert_eq!(files, vec!["archives/job1/index.html"]);
    }

    #[tokio::test]
    async fn traversal_is_refused() {
        let dir = TempDir::new().expect("tempdir");
        let storage = storage(&dir);
        assert!(storage.exists("../outside").await.is_err());
    }

    #[tokio::test]
    async fn delete_dir_handles_files_and_trees() {
        let dir = TempDir::new().expect("tempdir");
        let storage = storage(&dir);

        storage
            .write_file("archives/y/a.txt", Bytes::from_static(b"a"))
            .await
            .expect("write");
        storage
            .write_file("archives/y.zip", Bytes::from_static(b"zip"))
            .await
            .expect("write");

        storage.delete_dir("archives/y").await.expect("delete dir");
        storage.delete_dir("archives/y.zip").await.expect("delete file");
        assert!(!storage.exists("archives/y").await.expect("exists"));
        assert!(!storage.exists("archives/y.zip").await.expect("exists"));
    }

    #[tokio::test]
    async fn streamed_write_reports_progress() {
        let dir = TempDir::new().expect("tempdir");
        let storage = storage(&dir);

        let source = dir.path().join("big.bin");
        tokio::fs::write(&source, vec![7u8; 1024]).await.expect("write");

        let events = std::sync::Arc::new(parking_lot::Mutex::new(Vec::new()));
        let sink = std::sync::Arc::clone(&events);
        storage
            .write_file_from(
                "archives/z.zip",
                &source,
                Some(std::sync::Arc::new(move |p: UploadProgress| {
                    sink.lock().push(p);
                })),
            )
            .await
            .expect("upload");

        let events = events.lock();
        assert!(!events.is_empty());
        let last = events.last().expect("events");
        assert_eq!(last.uploaded_bytes, 1024);
        assert_eq!(last.total_bytes, 1024);
    }
}
