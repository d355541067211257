//! Prebuilt archive ZIP.
//!
//! The download users get is a deflate ZIP of the finished archive tree,
//! built file-by-file on the blocking pool so large media never sits in
//! memory all at once.

use std::fs::File;
use std::io::{self, BufWriter};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use log::info;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

/// Build a ZIP of `source_dir` at `zip_path`. Returns the ZIP's size in
/// bytes.
pub async fn build_zip(source_dir: &Path, zip_path: &Path) -> Result<u64> {
    let source_dir = source_dir.to_path_buf();
    let zip_path = zip_path.to_path_buf();
    tokio::task::spawn_blocking(move || build_zip_blocking(&source_dir, &zip_path))
        .await
        .map_err(|e| anyhow::anyhow!("zip task panicked: {e}"))?
}

fn build_zip_blocking(source_dir: &Path, zip_path: &Path) -> Result<u64> {
    if let Some(parent) = zip_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let file = File::create(zip_path)
        .with_context(|| format!("failed to create {}", zip_path.display()))?;
    let mut writer = ZipWriter::new(BufWriter::new(file));
    let options = SimpleFileOptions::default()
        .compression_method(CompressionMethod::Deflated)
        .unix_permissions(0o644);

    let mut entries: Vec<PathBuf> = jwalk::WalkDir::new(source_dir)
        .skip_hidden(false)
        .sort(true)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .map(|entry| entry.path())
        .collect();
    entries.sort();

    let mut files = 0usize;
    for path in entries {
        let name = path
            .strip_prefix(source_dir)
            .unwrap_or(&path)
            .to_string_lossy()
            .replace('\\', "/");
        writer
            .start_file(name.as_str(), options)
            .with_context(|| format!("failed to start zip entry {name}"))?;
        let mut reader = File::open(&path)
            .with_context(|| format!("failed to open {}", path.display()))?;
        io::copy(&mut reader, &mut writer)
            .with_context(|| format!("failed to compress {name}"))?;
        files += 1;
    }

    let mut inner = writer.finish().context("failed to finish zip")?;
    io::Write::flush(&mut inner).context("failed to flush zip")?;
    drop(inner);
    let size = std::fs::metadata(zip_path)?.len();
    info!(
        "Built {} ({files} files, {size} bytes)",
        zip_path.display()
    );
    Ok(size)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn zips_a_tree_and_roundtrips() {
        let dir = TempDir::new().expect("tempdir");
        let source = dir.path().join("archive");
        std::fs::create_dir_all(source.join("css")).expect("mkdir");
        std::fs::write(source.join("index.html"), "<html>home</html>").expect("write");
        std::fs::write(source.join("css/site.css"), "body{margin:0}").expect("write");

        let zip_path = dir.path().join("archive.zip");
        let size = build_zip(&source, &zip_path).await.expect("zip");
        assert!(size > 0);

        let mut archive =
            zip::ZipArchive::new(File::open(&zip_path).expect("open")).expect("read zip");
        let names: Vec<String> = (0..archive.len())
            .map(|i| archive.by_index(i).expect("entry").name().to_string())
            .collect();
        assert!(names.contains(&"index.html".to_string()));
        assert!(names.contains(&"css/site.css".to_string()));

        let mut body = String::new();
        io::Read::read_to_string(
            &mut archive.by_name("index.html").expect("entry"),
            &mut body,
        )
        .expect("read");
        assert_eq!(body, "<html>home</html>");
    }
}
