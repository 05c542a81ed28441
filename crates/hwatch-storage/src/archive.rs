use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use tokio::fs;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct ArchivedPage {
    pub content_hash: String,
    pub path: PathBuf,
}

/// Pages whose markup no longer matched the extraction descriptor, kept at
/// `<root>/<YYYYmmdd_HHMMSS>/<source>/<sha256>.html`.
#[derive(Debug, Clone)]
pub struct PageArchive {
    root: PathBuf,
}

fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

impl PageArchive {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Existing files are never rewritten; a new page lands via temp file +
    /// rename so readers never see a partial write.
    pub async fn archive_page(
        &self,
        fetched_at: DateTime<Utc>,
        source_id: &str,
        bytes: &[u8],
    ) -> anyhow::Result<ArchivedPage> {
        let content_hash = sha256_hex(bytes);
        let dir = self
            .root
            .join(fetched_at.format("%Y%m%d_%H%M%S").to_string())
            .join(source_id);
        let path = dir.join(format!("{content_hash}.html"));

        if !fs::try_exists(&path)
            .await
            .with_context(|| format!("checking {}", path.display()))?
        {
            fs::create_dir_all(&dir)
                .await
                .with_context(|| format!("creating {}", dir.display()))?;
            write_atomically(&dir, &path, bytes).await?;
        }

        Ok(ArchivedPage { content_hash, path })
    }
}

async fn write_atomically(dir: &Path, path: &Path, bytes: &[u8]) -> anyhow::Result<()> {
    let temp_path = dir.join(format!(".{}.tmp", Uuid::new_v4()));
    fs::write(&temp_path, bytes)
        .await
        .with_context(|| format!("writing {}", temp_path.display()))?;
    if let Err(err) = fs::rename(&temp_path, path).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(err).with_context(|| format!("renaming into {}", path.display()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn page_hashing_is_stable() {
        assert_eq!(
            sha256_hex(b"hello world"),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[tokio::test]
    async fn same_page_lands_on_one_stamped_path() {
        let dir = tempdir().unwrap();
        let archive = PageArchive::new(dir.path());
        let fetched_at = DateTime::parse_from_rfc3339("2021-03-05T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc);

        let first = archive
            .archive_page(fetched_at, "cases", b"<html>drifted</html>")
            .await
            .unwrap();
        let second = archive
            .archive_page(fetched_at, "cases", b"<html>drifted</html>")
            .await
            .unwrap();

        assert_eq!(first.path, second.path);
        assert!(first
            .path
            .starts_with(dir.path().join("20210305_120000").join("cases")));
        assert_eq!(std::fs::read(&first.path).unwrap(), b"<html>drifted</html>");
        let entries = std::fs::read_dir(first.path.parent().unwrap()).unwrap().count();
        assert_eq!(entries, 1);
    }
}
