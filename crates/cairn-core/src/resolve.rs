//! Remote path resolution for decryption inputs.
//!
//! Inputs may be plain local paths or `scheme://bucket/path` URLs. The
//! first remote input binds the resolver to that `(scheme, bucket)` pair;
//! later bare names (the chunk names inside a manifest, or follow-up
//! manifests) reuse the same backend without re-parsing. Downloads land in
//! one scoped temp dir that disappears with the resolver.

use std::path::PathBuf;

use tempfile::TempDir;
use url::Url;

use crate::error::{Error, Result};
use crate::manifest::MANIFEST_SUFFIX;
use crate::scratch;
use crate::store::{Backend, BlobStore, Destination};

/// A resolved local file. `temp` marks downloaded copies living inside the
/// resolver's scratch dir.
pub struct Resolved {
    pub path: PathBuf,
    pub temp: bool,
}

struct RemoteSource {
    destination: Destination,
    backend: Box<dyn Backend>,
}

pub struct Resolver {
    tempdir: TempDir,
    remote: Option<RemoteSource>,
}

const KNOWN_SCHEMES: [&str; 3] = ["s3", "b2", "local"];

fn parse_remote(input: &str) -> Option<(String, String, String)> {
    let url = Url::parse(input).ok()?;
    let scheme = url.scheme().to_ascii_lowercase();
    // Anything that merely looks URL-ish (label-prefixed manifest names
    // contain colons) is a local path unless the scheme names a backend.
    if !KNOWN_SCHEMES.contains(&scheme.as_str()) {
        return None;
    }
    if scheme == "local" {
        // `local://store-root/name`: the store root is the named file's
        // directory; chunks are expected in `data/XX/` beside it. An
        // absolute root parses with an empty host and a rooted path.
        let full = format!("{}{}", url.host_str().unwrap_or(""), url.path());
        let (root, name) = match full.rsplit_once('/') {
            Some(("", name)) => ("/".to_string(), name.to_string()),
            Some((root, name)) => (root.to_string(), name.to_string()),
            None => (".".to_string(), full),
        };
        return Some((scheme, root, name));
    }
    let bucket = url.host_str().unwrap_or("").to_string();
    let path = url.path().trim_matches('/').to_string();
    Some((scheme, bucket, path))
}

impl Resolver {
    pub fn new() -> Result<Self> {
        Ok(Resolver {
            tempdir: scratch::scratch_dir()?,
            remote: None,
        })
    }

    /// The destination this resolver is bound to, once a remote input has
    /// been seen.
    pub fn source(&self) -> Option<&Destination> {
        self.remote.as_ref().map(|r| &r.destination)
    }

    fn bind(&mut self, scheme: &str, bucket: &str) -> Result<&RemoteSource> {
        if self.remote.is_none() {
            let destination = Destination::for_scheme(scheme, bucket)?;
            let backend = destination.connect()?;
            tracing::debug!(destination = %destination, "resolved remote source");
            self.remote = Some(RemoteSource {
                destination,
                backend,
            });
        }
        Ok(self.remote.as_ref().expect("just bound"))
    }

    async fn fetch(&self, remote: &RemoteSource, name: &str) -> Result<Resolved> {
        let remote_path = if name.ends_with(MANIFEST_SUFFIX) {
            name.to_string()
        } else {
            BlobStore::data_path(name)
        };
        let basename = name.rsplit('/').next().unwrap_or(name);
        let local = self.tempdir.path().join(basename);
        remote.backend.download(&remote_path, &local).await?;
        Ok(Resolved {
            path: local,
            temp: true,
        })
    }

    /// Resolve a caller-supplied input: a URL, a local path, or (once a
    /// remote source is bound) a bare remote name.
    pub async fn resolve_input(&mut self, input: &str) -> Result<Resolved> {
        if let Some((scheme, bucket, path)) = parse_remote(input) {
            self.bind(&scheme, &bucket)?;
            let remote = self.remote.as_ref().expect("bound above");
            return self.fetch(remote, &path).await;
        }
        match &self.remote {
            Some(remote) => self.fetch(remote, input).await,
            None => Ok(Resolved {
                path: PathBuf::from(input),
                temp: false,
            }),
        }
    }

    /// Resolve a chunk name out of a loaded manifest. Local lookups try the
    /// bare name first, then the sharded `data/XX/` layout.
    pub async fn resolve_blob(&mut self, name: &str) -> Result<Resolved> {
        if let Some(remote) = &self.remote {
            return self.fetch(remote, name).await;
        }
        let direct = PathBuf::from(name);
        if direct.is_file() {
            return Ok(Resolved {
                path: direct,
                temp: false,
            });
        }
        let sharded = PathBuf::from(BlobStore::data_path(name));
        if sharded.is_file() {
            return Ok(Resolved {
                path: sharded,
                temp: false,
            });
        }
        Err(Error::Integrity(name.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn urls_with_backend_schemes_are_remote() {
        let (scheme, bucket, path) =
            parse_remote("s3://my-bucket/2024-01-01T00:00:00.000000.mfn").unwrap();
        assert_eq!(scheme, "s3");
        assert_eq!(bucket, "my-bucket");
        assert_eq!(path, "2024-01-01T00:00:00.000000.mfn");
    }

    #[test]
    fn label_manifest_names_are_local_despite_colons() {
        assert!(parse_remote("nightly-2024-01-01T00:00:00.000000.mfn").is_none());
        assert!(parse_remote("plain.mfn").is_none());
        assert!(parse_remote("/abs/path/plain.mfn").is_none());
    }

    #[tokio::test]
    async fn local_blob_lookup_falls_back_to_sharded_layout() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("data/QQ")).unwrap();
        std::fs::write(dir.path().join("data/QQ/QQblob="), b"x").unwrap();

        let _guard = crate::test_cwd_lock();
        let cwd = std::env::current_dir().unwrap();
        std::env::set_current_dir(dir.path()).unwrap();

        let mut resolver = Resolver::new().unwrap();
        let hit = resolver.resolve_blob("QQblob=").await;
        let miss = resolver.resolve_blob("ZZblob=").await;
        std::env::set_current_dir(cwd).unwrap();

        assert_eq!(hit.unwrap().path, PathBuf::from("data/QQ/QQblob="));
        assert!(matches!(miss, Err(Error::Integrity(_))));
    }

    #[tokio::test]
    async fn remote_source_is_sticky_and_shards_blob_paths() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("bucket");
        std::fs::create_dir_all(root.join("data/AB")).unwrap();
        std::fs::write(root.join("backup.mfn"), b"manifest bytes").unwrap();
        std::fs::write(root.join("data/AB/ABblob="), b"blob bytes").unwrap();

        let mut resolver = Resolver::new().unwrap();
        let url = format!("local://{}/backup.mfn", root.display());
        let mfn = resolver.resolve_input(&url).await.unwrap();
        assert!(mfn.temp);
        assert_eq!(std::fs::read(&mfn.path).unwrap(), b"manifest bytes");

        let blob = resolver.resolve_blob("ABblob=").await.unwrap();
        assert_eq!(std::fs::read(&blob.path).unwrap(), b"blob bytes");
    }
}
