//! Storage adapter: one surface over the local filesystem and object
//! stores.
//!
//! All paths are adapter-relative (`archives/<id>/index.html`). Crawl output
//! is always staged in a local temp tree (the engine writes plain files);
//! `move_to_final` then promotes that tree into the adapter's backing store,
//! reporting byte- and file-level progress as it goes.

mod local;
mod object;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use object_store::prefix::PrefixStore;
use object_store::ObjectStore;
use url::Url;

pub use local::LocalStorage;
pub use object::ObjectStorage;

/// Process-level storage roots from which per-site adapters are built.
///
/// Each site picks its own backend through `storage_type`/`storage_path`:
/// `local` sites live under `local_base` (optionally inside a
/// `storage_path` subtree), object-backed sites name their store with a URL
/// (`s3://bucket/prefix`, `gs://…`, `az://…`, `memory:///`).
#[derive(Debug, Clone)]
pub struct StorageConfig {
    local_base: PathBuf,
    temp_base: PathBuf,
}

impl StorageConfig {
    pub fn new(local_base: impl Into<PathBuf>, temp_base: impl Into<PathBuf>) -> Self {
        Self {
            local_base: local_base.into(),
            temp_base: temp_base.into(),
        }
    }

    /// Build the adapter for one site.
    pub fn adapter_for(
        &self,
        storage_type: &str,
        storage_path: Option<&str>,
    ) -> Result<Arc<dyn StorageAdapter>> {
        let storage_path = storage_path.map(str::trim).filter(|p| !p.is_empty());

        match storage_type.trim().to_ascii_lowercase().as_str() {
            "" | "local" => {
                let base = match storage_path {
                    Some(sub) => {
                        let sub = Path::new(sub);
                        if sub.is_absolute() {
                            sub.to_path_buf()
                        } else {
                            self.local_base.join(sub)
                        }
                    }
                    None => self.local_base.clone(),
                };
                Ok(Arc::new(LocalStorage::new(base, self.temp_base.clone())))
            }
            "object" | "s3" | "gcs" | "azure" | "memory" => {
                let raw = storage_path.ok_or_else(|| {
                    anyhow::anyhow!("object-backed sites need a storage_path URL")
                })?;
                let url = Url::parse(raw)
                    .with_context(|| format!("invalid object store URL {raw:?}"))?;
                let (store, prefix) = object_store::parse_url(&url)
                    .with_context(|| format!("unsupported object store URL {raw:?}"))?;
                let store: Arc<dyn ObjectStore> = if prefix.as_ref().is_empty() {
                    Arc::from(store)
                } else {
                    Arc::new(PrefixStore::new(store, prefix))
                };
                Ok(Arc::new(ObjectStorage::new(store, self.temp_base.clone())))
            }
            other => Err(anyhow::anyhow!(
                "unknown storage_type {other:?} (expected local, object, s3, gcs, azure or memory)"
            )),
        }
    }
}

/// Byte-level progress for one streamed upload.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UploadProgress {
    pub total_bytes: u64,
    pub uploaded_bytes: u64,
    pub part_number: u64,
    pub total_parts: u64,
    pub current_part_bytes: u64,
}

/// File-level progress for a finalize (temp → archive) move.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FinalizeProgress {
    pub total_bytes: u64,
    pub uploaded_bytes: u64,
    pub files_total: u64,
    pub files_uploaded: u64,
    pub current_file: Option<String>,
}

pub type UploadProgressFn = Arc<dyn Fn(UploadProgress) + Send + Sync>;
pub type FinalizeProgressFn = Arc<dyn Fn(FinalizeProgress) + Send + Sync>;

/// Uniform file/object interface the job processor works against.
#[async_trait]
pub trait StorageAdapter: Send + Sync {
    /// Write a whole in-memory buffer at `path`.
    async fn write_file(&self, path: &str, data: Bytes) -> Result<()>;

    /// Stream a local file into `path`, reporting part-by-part progress.
    async fn write_file_from(
        &self,
        path: &str,
        local: &Path,
        progress: Option<UploadProgressFn>,
    ) -> Result<()>;

    /// Stream the object at `path`.
    async fn read_stream(&self, path: &str) -> Result<BoxStream<'static, Result<Bytes>>>;

    /// Recursively list files under `prefix`, adapter-relative.
    async fn list_files(&self, prefix: &str) -> Result<Vec<String>>;

    /// Whether a file or any object under `path` exists.
    async fn exists(&self, path: &str) -> Result<bool>;

    /// Create (or designate) the local staging directory for crawl `id`.
    /// Never touches the network: object stores stage locally too.
    async fn create_temp_dir(&self, id: &str) -> Result<PathBuf>;

    /// Promote a finished temp tree to `archives/<id>`, replacing any prior
    /// archive under that id. Idempotent: re-running with the same inputs
    /// converges on the same final tree. Returns the final prefix.
    async fn move_to_final(
        &self,
        temp_dir: &Path,
        id: &str,
        progress: Option<FinalizeProgressFn>,
    ) -> Result<String>;

    /// Total bytes stored under `prefix`.
    async fn get_size(&self, prefix: &str) -> Result<u64>;

    /// Delete everything under `prefix` (a directory tree or single file).
    async fn delete_dir(&self, prefix: &str) -> Result<()>;
}

/// One file found in a local tree scan.
#[derive(Debug, Clone)]
pub(crate) struct ScannedFile {
    pub absolute: PathBuf,
    pub relative: String,
    pub size: u64,
}

/// Walk a local tree, returning every file with its root-relative path.
pub(crate) async fn scan_local_tree(root: &Path) -> Result<(Vec<ScannedFile>, u64)> {
    let root = root.to_path_buf();
    tokio::task::spawn_blocking(move || {
        let mut files = Vec::new();
        let mut total = 0u64;
        for entry in jwalk::WalkDir::new(&root).skip_hidden(false).sort(true) {
            let entry = match entry {
                Ok(e) => e,
                Err(_) => continue,
            };
            if !entry.file_type().is_file() {
                continue;
            }
            let absolute = entry.path();
            let size = entry.metadata().map(|m| m.len()).unwrap_or(0);
            let relative = absolute
                .strip_prefix(&root)
                .unwrap_or(&absolute)
                .to_string_lossy()
                .replace('\\', "/");
            total += size;
            files.push(ScannedFile {
                absolute,
                relative,
                size,
            });
        }
        Ok((files, total))
    })
    .await
    .map_err(|e| anyhow::anyhow!("tree scan task panicked: {e}"))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn config(dir: &TempDir) -> StorageConfig {
        StorageConfig::new(dir.path().join("store"), dir.path().join("tmp"))
    }

    #[tokio::test]
    async fn local_sites_land_under_the_base() {
        let dir = TempDir::new().expect("tempdir");
        let adapter = config(&dir).adapter_for("local", None).expect("adapter");

        adapter
            .write_file("archives/x/index.html", Bytes::from_static(b"x"))
            .await
            .expect("write");
        assert!(dir
            .path()
            .join("store/archives/x/index.html")
            .exists());
    }

    #[tokio::test]
    async fn local_storage_path_selects_a_subtree() {
        let dir = TempDir::new().expect("tempdir");
        let adapter = config(&dir)
            .adapter_for("local", Some("clients/acme"))
            .expect("adapter");

        adapter
            .write_file("archives/y/index.html", Bytes::from_static(b"y"))
            .await
            .expect("write");
        assert!(dir
            .path()
            .join("store/clients/acme/archives/y/index.html")
            .exists());
    }

    #[tokio::test]
    async fn object_sites_resolve_their_url() {
        let dir = TempDir::new().expect("tempdir");
        let adapter = config(&dir)
            .adapter_for("memory", Some("memory:///"))
            .expect("adapter");

        adapter
            .write_file("archives/z/index.html", Bytes::from_static(b"z"))
            .await
            .expect("write");
        assert!(adapter.exists("archives/z/index.html").await.expect("exists"));
    }

    #[test]
    fn object_sites_require_a_url() {
        let dir = TempDir::new().expect("tempdir");
        assert!(config(&dir).adapter_for("s3", None).is_err());
        assert!(config(&dir).adapter_for("s3", Some("   ")).is_err());
    }

    #[test]
    fn unknown_storage_type_is_rejected() {
        let dir = TempDir::new().expect("tempdir");
        let err = config(&dir).adapter_for("ftp", None).err().expect("expected error");
        assert!(err.to_string().contains("unknown storage_type"));
    }
}
