use std::path::{Path, PathBuf};

use async_trait::async_trait;
use walkdir::WalkDir;

use crate::error::{Error, Result};
use crate::store::backend::{matches_listing, Backend};

/// Filesystem-backed destination, rooted at the destination's bucket path.
pub struct LocalFs {
    root: PathBuf,
}

impl LocalFs {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        LocalFs { root: root.into() }
    }

    fn full(&self, remote: &str) -> PathBuf {
        self.root.join(remote)
    }
}

#[async_trait]
impl Backend for LocalFs {
    async fn exists(&self, remote: &str) -> Result<bool> {
        tokio::fs::try_exists(self.full(remote))
            .await
            .map_err(|e| Error::Store(format!("stat {remote}: {e}")))
    }

    async fn upload(&self, local: &Path, remote: &str) -> Result<()> {
        let dest = self.full(remote);
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| Error::Store(format!("mkdir for {remote}: {e}")))?;
        }
        tokio::fs::copy(local, &dest)
            .await
            .map_err(|e| Error::Store(format!("upload {remote}: {e}")))?;
        Ok(())
    }

    async fn download(&self, remote: &str, local: &Path) -> Result<()> {
        let src = self.full(remote);
        match tokio::fs::copy(&src, local).await {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(Error::Integrity(remote.to_string()))
            }
            Err(e) => Err(Error::Store(format!("download {remote}: {e}"))),
        }
    }

    async fn remove(&self, remote: &str) -> Result<()> {
        tokio::fs::remove_file(self.full(remote))
            .await
            .map_err(|e| Error::Store(format!("remove {remote}: {e}")))
    }

    async fn list(
        &self,
        prefix: &str,
        recursive: bool,
        pattern: Option<&str>,
    ) -> Result<Vec<String>> {
        let pattern = pattern
            .map(glob::Pattern::new)
            .transpose()
            .map_err(|e| Error::Config(format!("bad list pattern: {e}")))?;
        let base = self.full(prefix);
        let mut out = Vec::new();

        let depth = if recursive { usize::MAX } else { 1 };
        for entry in WalkDir::new(&base).min_depth(1).max_depth(depth) {
            let entry = entry.map_err(|e| Error::Store(format!("list {prefix}: {e}")))?;
            let rel = entry
                .path()
                .strip_prefix(&self.root)
                .unwrap_or(entry.path())
                .to_string_lossy()
                .into_owned();
            let name = if entry.file_type().is_dir() {
                format!("{rel}/")
            } else {
                rel
            };
            if matches_listing(&name, pattern.as_ref()) {
                out.push(name);
            }
        }
        out.sort();
        Ok(out)
    }
}
