//! Object-store storage backend.
//!
//! Wraps any [`object_store::ObjectStore`] implementation (S3-compatible,
//! GCS, Azure, local, in-memory) behind the adapter surface. Crawl output is
//! staged on the local filesystem; finalization uploads the staged tree key
//! by key and only then removes the staging copy, so a failed upload leaves
//! the temp tree intact for retry.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use futures::{StreamExt, TryStreamExt};
use log::{debug, info};
use object_store::path::Path as ObjectPath;
use object_store::{ObjectStore, PutPayload, WriteMultipart};
use tokio::io::AsyncReadExt;

use super::{
    scan_local_tree, FinalizeProgress, FinalizeProgressFn, StorageAdapter, UploadProgress,
    UploadProgressFn,
};

const PART_SIZE: usize = 8 * 1024 * 1024;

/// Storage backed by an object store, with local temp staging.
pub struct ObjectStorage {
    store: Arc<dyn ObjectStore>,
    temp_base: PathBuf,
}

impl ObjectStorage {
    pub fn new(store: Arc<dyn ObjectStore>, temp_base: impl Into<PathBuf>) -> Self {
        Self {
            store,
            temp_base: temp_base.into(),
        }
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<()> {
        let prefix_path = ObjectPath::from(prefix.trim_matches('/'));
        let keys: Vec<ObjectPath> = self
            .store
            .list(Some(&prefix_path))
            .map_ok(|meta| meta.location)
            .try_collect()
            .await
            .context("failed to list prefix for deletion")?;
        for key in keys {
            self.store
                .delete(&key)
                .await
                .with_context(|| format!("failed to delete {key}"))?;
        }
        Ok(())
    }
}

#[async_trait]
impl StorageAdapter for ObjectStorage {
    async fn write_file(&self, path: &str, data: Bytes) -> Result<()> {
        let location = ObjectPath::from(path.trim_matches('/'));
        self.store
            .put(&location, PutPayload::from(data))
            .await
            .with_context(|| format!("failed to put {location}"))?;
        Ok(())
    }

    async fn write_file_from(
        &self,
        path: &str,
        local: &Path,
        progress: Option<UploadProgressFn>,
    ) -> Result<()> {
        let location = ObjectPath::from(path.trim_matches('/'));
        let total_bytes = tokio::fs::metadata(local).await?.len();
        let total_parts = total_bytes.div_ceil(PART_SIZE as u64).max(1);

        let upload = self
            .store
            .put_multipart(&location)
            .await
            .with_context(|| format!("failed to begin multipart upload for {location}"))?;
        let mut writer = WriteMultipart::new(upload);

        let mut reader = tokio::fs::File::open(local)
            .await
            .with_context(|| format!("failed to open {}", local.display()))?;
        let mut buffer = vec![0u8; PART_SIZE];
        let mut uploaded: u64 = 0;
        let mut part_number: u64 = 0;

        loop {
            let read = reader.read(&mut buffer).await?;
            if read == 0 {
                break;
            }
            writer.write(&buffer[..read]);
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

        writer
            .finish()
            .await
            .with_context(|| format!("failed to finish multipart upload for {location}"))?;
        Ok(())
    }

    async fn read_stream(&self, path: &str) -> Result<BoxStream<'static, Result<Bytes>>> {
        let location = ObjectPath::from(path.trim_matches('/'));
        let result = self
            .store
            .get(&location)
            .await
            .with_context(|| format!("failed to get {location}"))?;
        Ok(result.into_stream().map_err(anyhow::Error::from).boxed())
    }

    async fn list_files(&self, prefix: &str) -> Result<Vec<String>> {
        let prefix_path = ObjectPath::from(prefix.trim_matches('/'));
        let mut keys: Vec<String> = self
            .store
            .list(Some(&prefix_path))
            .map_ok(|meta| meta.location.to_string())
            .try_collect()
            .await
            .context("failed to list prefix")?;
        keys.sort();
        Ok(keys)
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        let location = ObjectPath::from(path.trim_matches('/'));
        match self.store.head(&location).await {
            Ok(_) => Ok(true),
            Err(object_store::Error::NotFound { .. }) => {
                // A "directory" exists when anything lives under it.
                Ok(!self.list_files(path).await?.is_empty())
            }
            Err(e) => Err(e.into()),
        }
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

        // Idempotence: any prior archive under this id goes first.
        self.delete_prefix(&final_prefix).await?;

        let (files, total_bytes) = scan_local_tree(temp_dir).await?;
        let files_total = files.len() as u64;
        let mut uploaded_bytes: u64 = 0;
        let mut files_uploaded: u64 = 0;

        for file in &files {
            if let Some(cb) = &progress {
                cb(FinalizeProgress {
                    total_bytes,
                    uploaded_bytes,
                    files_total,
                    files_uploaded,
                    current_file: Some(file.relative.clone()),
                });
            }

            let data = tokio::fs::read(&file.absolute)
                .await
                .with_context(|| format!("failed to read {}", file.absolute.display()))?;
            let location = ObjectPath::from(format!("{final_prefix}/{}", file.relative));
            self.store
                .put(&location, PutPayload::from(Bytes::from(data)))
                .await
                .with_context(|| format!("failed to upload {location}"))?;

            uploaded_bytes += file.size;
            files_uploaded += 1;
        }

        if let Some(cb) = &progress {
            cb(FinalizeProgress {
                total_bytes,
                uploaded_bytes,
                files_total,
                files_uploaded,
                current_file: None,
            });
        }

        debug!("Removing staged tree {}", temp_dir.display());
        tokio::fs::remove_dir_all(temp_dir).await.ok();

        info!("Archive uploaded to {final_prefix} ({files_uploaded} files, {uploaded_bytes} bytes)");
        Ok(final_prefix)
    }

    async fn get_size(&self, prefix: &str) -> Result<u64> {
        let prefix_path = ObjectPath::from(prefix.trim_matches('/'));
        let total = self
            .store
            .list(Some(&prefix_path))
            .try_fold(0u64, |acc, meta| async move { Ok(acc + meta.size) })
            .await
            .context("failed to size prefix")?;
        if total > 0 {
            return Ok(total);
        }
        // A single object (the prebuilt zip) is not under its own prefix.
        match self.store.head(&ObjectPath::from(prefix.trim_matches('/'))).await {
            Ok(meta) => Ok(meta.size),
            Err(object_store::Error::NotFound { .. }) => Ok(0),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete_dir(&self, prefix: &str) -> Result<()> {
        self.delete_prefix(prefix).await?;
        // The prefix itself may name a single object (`archives/<id>.zip`).
        let location = ObjectPath::from(prefix.trim_matches('/'));
        match self.store.delete(&location).await {
            Ok(()) => Ok(()),
            Err(object_store::Error::NotFound { .. }) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
