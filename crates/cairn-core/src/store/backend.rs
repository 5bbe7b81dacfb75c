use std::path::Path;

use async_trait::async_trait;

use crate::error::Result;

/// Capability set required of a destination backend.
///
/// `exists` answers with a value, never with an error, when the object is
/// simply absent; `download` reports absence as an `Integrity` error and
/// reserves `Store` for real I/O failures.
#[async_trait]
pub trait Backend: Send + Sync {
    async fn exists(&self, remote: &str) -> Result<bool>;

    async fn upload(&self, local: &Path, remote: &str) -> Result<()>;

    async fn download(&self, remote: &str, local: &Path) -> Result<()>;

    async fn remove(&self, remote: &str) -> Result<()>;

    /// List entries under `prefix`, relative to the backend root, sorted.
    /// Non-recursive listings include immediate subdirectories with a
    /// trailing `/`; `pattern` is a glob matched against file basenames.
    async fn list(
        &self,
        prefix: &str,
        recursive: bool,
        pattern: Option<&str>,
    ) -> Result<Vec<String>>;
}

/// Shared basename glob filter for listings. Directory entries (trailing
/// slash) always pass.
pub(crate) fn matches_listing(path: &str, pattern: Option<&glob::Pattern>) -> bool {
    if path.ends_with('/') {
        return true;
    }
    match pattern {
        None => true,
        Some(pattern) => {
            let basename = path.rsplit('/').next().unwrap_or(path);
            pattern.matches(basename)
        }
    }
}
