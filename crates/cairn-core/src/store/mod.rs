//! Destination parsing and the fan-out blob store.
//!
//! A destination string is an ordered, comma-separated list of targets:
//! `s3:bucket`, `b2:bucket`, `local:/path`, or the path of an executable to
//! run per stored object. Destinations are resolved to backends once, at
//! startup; `save` then fans every object out to all of them, skipping a
//! destination when it already holds the object.

use std::fmt;
use std::path::{Path, PathBuf};

mod backend;
mod exec;
mod localfs;
mod object;

pub use backend::Backend;
pub use exec::ExecFs;
pub use localfs::LocalFs;
pub use object::ObjectStoreFs;

use crate::error::{Error, Result};

/// One parsed destination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Destination {
    S3 { bucket: String },
    B2 { bucket: String },
    Local { root: PathBuf },
    Exec { program: String },
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Destination::S3 { bucket } => write!(f, "s3:{bucket}"),
            Destination::B2 { bucket } => write!(f, "b2:{bucket}"),
            Destination::Local { root } => write!(f, "local:{}", root.display()),
            Destination::Exec { program } => f.write_str(program),
        }
    }
}

impl Destination {
    /// Resolve a `scheme://bucket` pair from a remote input path.
    pub fn for_scheme(scheme: &str, bucket: &str) -> Result<Destination> {
        match scheme {
            "s3" => Ok(Destination::S3 {
                bucket: require_bucket("s3", bucket, "S3_BUCKET_NAME")?,
            }),
            "b2" => Ok(Destination::B2 {
                bucket: require_bucket("b2", bucket, "B2_BUCKET_NAME")?,
            }),
            "local" => Ok(Destination::Local {
                root: if bucket.is_empty() {
                    PathBuf::from(".")
                } else {
                    PathBuf::from(bucket)
                },
            }),
            other => Err(Error::Config(format!("unknown backend scheme '{other}'"))),
        }
    }

    pub fn connect(&self) -> Result<Box<dyn Backend>> {
        Ok(match self {
            Destination::S3 { bucket } => Box::new(ObjectStoreFs::s3(bucket)?),
            Destination::B2 { bucket } => Box::new(ObjectStoreFs::b2(bucket)?),
            Destination::Local { root } => Box::new(LocalFs::new(root.clone())),
            Destination::Exec { program } => Box::new(ExecFs::new(program.clone())),
        })
    }
}

fn require_bucket(scheme: &str, bucket: &str, env: &str) -> Result<String> {
    if !bucket.is_empty() {
        return Ok(bucket.to_string());
    }
    std::env::var(env).map_err(|_| {
        Error::Config(format!(
            "destination '{scheme}' needs a bucket (inline or via {env})"
        ))
    })
}

fn clean_bucket(raw: &str) -> &str {
    let raw = raw.strip_prefix("//").unwrap_or(raw);
    raw.trim_end_matches('/')
}

fn parse_one(token: &str) -> Result<Destination> {
    match token.split_once(':') {
        Some(("s3", rest)) => Destination::for_scheme("s3", clean_bucket(rest)),
        Some(("b2", rest)) => Destination::for_scheme("b2", clean_bucket(rest)),
        Some(("local", rest)) => Destination::for_scheme("local", clean_bucket(rest)),
        None if token == "s3" || token == "b2" || token == "local" => {
            Destination::for_scheme(token, "")
        }
        // Anything else is the path of an upload program.
        _ => Ok(Destination::Exec {
            program: token.to_string(),
        }),
    }
}

/// Parse a `t1[:b1],t2[:b2],…` destination list.
pub fn parse_destinations(spec: &str) -> Result<Vec<Destination>> {
    spec.split(',')
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .map(parse_one)
        .collect()
}

/// Ordered fan-out over the configured destinations.
pub struct BlobStore {
    destinations: Vec<(Destination, Box<dyn Backend>)>,
}

impl BlobStore {
    /// Parse the destination string and connect each backend once.
    pub fn from_spec(spec: Option<&str>) -> Result<Self> {
        let mut destinations = Vec::new();
        if let Some(spec) = spec {
            for dest in parse_destinations(spec)? {
                let backend = dest.connect()?;
                destinations.push((dest, backend));
            }
        }
        Ok(BlobStore { destinations })
    }

    pub fn is_empty(&self) -> bool {
        self.destinations.is_empty()
    }

    /// Two-character shard prefix: `data/XX/<name>`. Keeps per-directory
    /// entry counts reasonable on filesystem-backed stores.
    pub fn data_path(blob_name: &str) -> String {
        match blob_name.get(..2) {
            Some(shard) => format!("data/{shard}/{blob_name}"),
            None => blob_name.to_string(),
        }
    }

    /// Store `local` under `name` on every destination, skipping the ones
    /// that already hold it. With no destinations configured, the object is
    /// copied into the current directory instead.
    ///
    /// A failing destination does not stop the others from being tried; the
    /// first failure is propagated once the fan-out completes.
    pub async fn save(&self, name: &str, local: &Path) -> Result<()> {
        if self.destinations.is_empty() {
            let target = Path::new(name)
                .file_name()
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(name));
            tokio::fs::copy(local, &target)
                .await
                .map_err(|e| Error::io(target, e))?;
            return Ok(());
        }

        let mut first_failure = None;
        for (dest, backend) in &self.destinations {
            let outcome = async {
                if backend.exists(name).await? {
                    tracing::debug!(destination = %dest, name, "already stored, skipping");
                    return Ok(());
                }
                backend.upload(local, name).await
            }
            .await;
            if let Err(err) = outcome {
                tracing::warn!(destination = %dest, name, error = %err, "store failed");
                first_failure.get_or_insert(err);
            }
        }
        match first_failure {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Store a chunk under its sharded `data/XX/` path.
    pub async fn save_blob(&self, blob_name: &str, local: &Path) -> Result<()> {
        self.save(&Self::data_path(blob_name), local).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_mixed_destination_list() {
        let dests =
            parse_destinations("local:/var/backup/, s3://my-bucket ,/usr/local/bin/push.sh")
                .unwrap();
        assert_eq!(
            dests,
            vec![
                Destination::Local {
                    root: PathBuf::from("/var/backup"),
                },
                Destination::S3 {
                    bucket: "my-bucket".into(),
                },
                Destination::Exec {
                    program: "/usr/local/bin/push.sh".into(),
                },
            ]
        );
    }

    #[test]
    fn bare_local_defaults_to_cwd() {
        assert_eq!(
            parse_destinations("local").unwrap(),
            vec![Destination::Local {
                root: PathBuf::from("."),
            }]
        );
    }

    #[test]
    fn bare_program_name_is_exec() {
        assert_eq!(
            parse_destinations("./upload-hook").unwrap(),
            vec![Destination::Exec {
                program: "./upload-hook".into(),
            }]
        );
    }

    #[test]
    fn unknown_scheme_is_rejected_for_remote_paths() {
        assert!(matches!(
            Destination::for_scheme("gopher", "bucket"),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn data_path_shards_on_first_two_chars() {
        assert_eq!(
            BlobStore::data_path("QxNameABC="),
            "data/Qx/QxNameABC="
        );
    }

    #[tokio::test]
    async fn save_blob_skips_existing_chunks() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("chunk");
        std::fs::write(&src, b"one").unwrap();

        let root = dir.path().join("store");
        let store = BlobStore {
            destinations: vec![(
                Destination::Local { root: root.clone() },
                Box::new(LocalFs::new(root.clone())),
            )],
        };

        store.save_blob("AAblob=", &src).await.unwrap();
        // Re-saving different content under the same name is skipped: the
        // name is the identity.
        std::fs::write(&src, b"two").unwrap();
        store.save_blob("AAblob=", &src).await.unwrap();
        assert_eq!(
            std::fs::read(root.join("data/AA/AAblob=")).unwrap(),
            b"one"
        );
    }

    #[tokio::test]
    async fn no_destinations_copies_to_cwd_basename() {
        let _guard = crate::test_cwd_lock();

        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("payload");
        std::fs::write(&src, b"bytes").unwrap();

        let cwd = std::env::current_dir().unwrap();
        // Run the no-destination path against a scratch working directory.
        std::env::set_current_dir(dir.path()).unwrap();
        let store = BlobStore::from_spec(None).unwrap();
        let result = store.save("data/AA/AAname=", &src).await;
        std::env::set_current_dir(cwd).unwrap();

        result.unwrap();
        assert_eq!(std::fs::read(dir.path().join("AAname=")).unwrap(), b"bytes");
    }
}
