//! The encryption pipeline: expand inputs, chunk and seal each file with
//! bounded parallelism, assemble and store the manifest.

use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use futures::stream::{self, StreamExt};

use crate::chunker::ChunkIter;
use crate::codec;
use crate::crypto;
use crate::error::{Error, Result};
use crate::inputs;
use crate::keys::KeySet;
use crate::manifest::{self, FileEntry, Manifest};
use crate::output::Output;
use crate::scratch;
use crate::store::BlobStore;

pub struct EncryptOptions {
    pub chunk_size: usize,
    pub compresslevel: i32,
    pub concurrency: usize,
    pub store_absolute_paths: bool,
    pub label: Option<String>,
    /// Overrides the timestamped default manifest filename.
    pub manifest_filename: Option<String>,
}

impl Default for EncryptOptions {
    fn default() -> Self {
        EncryptOptions {
            chunk_size: 100_000_000,
            compresslevel: 6,
            concurrency: 8,
            store_absolute_paths: false,
            label: None,
            manifest_filename: None,
        }
    }
}

pub struct EncryptReport {
    pub manifest_name: String,
    /// Total ciphertext bytes handed to the store.
    pub stored_bytes: u64,
    /// Files that failed, with their errors. The manifest still covers
    /// every file that succeeded.
    pub failures: Vec<(PathBuf, Error)>,
}

pub struct Encryptor {
    keys: Arc<KeySet>,
    store: Arc<BlobStore>,
    out: Output,
    opts: EncryptOptions,
}

impl Encryptor {
    pub fn new(keys: KeySet, store: BlobStore, out: Output, opts: EncryptOptions) -> Self {
        Encryptor {
            keys: Arc::new(keys),
            store: Arc::new(store),
            out,
            opts,
        }
    }

    /// Back up everything the inputs expand to. Work is parallel at file
    /// granularity only; within a file, chunks are produced and recorded in
    /// strict source order. The manifest is key-sorted after all workers
    /// finish, so its serialization does not depend on completion order.
    pub async fn encrypt<S: AsRef<str>>(&self, raw_inputs: &[S]) -> Result<EncryptReport> {
        let files = inputs::expand_inputs(raw_inputs)?;

        let results: Vec<(PathBuf, Result<(FileEntry, u64)>)> = stream::iter(
            files.into_iter().map(|path| {
                let keys = Arc::clone(&self.keys);
                let store = Arc::clone(&self.store);
                let out = self.out.clone();
                let chunk_size = self.opts.chunk_size;
                let level = self.opts.compresslevel;
                async move {
                    let task = tokio::spawn(encrypt_one(
                        keys,
                        store,
                        out,
                        path.clone(),
                        chunk_size,
                        level,
                    ));
                    let entry = match task.await {
                        Ok(entry) => entry,
                        Err(e) => Err(Error::Store(format!("worker failed: {e}"))),
                    };
                    (path, entry)
                }
            }),
        )
        .buffer_unordered(self.opts.concurrency.max(1))
        .collect()
        .await;

        let mut mfn = Manifest::new();
        let mut failures = Vec::new();
        let mut stored_bytes = 0u64;
        for (path, entry) in results {
            match entry {
                Ok((entry, bytes)) => {
                    stored_bytes += bytes;
                    mfn.insert(self.archived_path(&path), entry);
                }
                Err(err) => {
                    tracing::error!(file = %path.display(), error = %err, "encryption failed");
                    failures.push((path, err));
                }
            }
        }

        let manifest_name = self.save_manifest(&mfn).await?;
        Ok(EncryptReport {
            manifest_name,
            stored_bytes,
            failures,
        })
    }

    /// The path recorded in the manifest. Absolute archival is explicit
    /// opt-in; otherwise absolute or parent-escaping inputs are reduced to
    /// their basename so decryption stays inside the working directory.
    fn archived_path(&self, path: &Path) -> String {
        archived_path(path, self.opts.store_absolute_paths)
    }

    async fn save_manifest(&self, mfn: &Manifest) -> Result<String> {
        let filename = self.opts.manifest_filename.clone().unwrap_or_else(|| {
            let stamp = chrono::Local::now().format("%Y-%m-%dT%H:%M:%S%.6f");
            match &self.opts.label {
                Some(label) => format!("{label}-{stamp}{}", manifest::MANIFEST_SUFFIX),
                None => format!("{stamp}{}", manifest::MANIFEST_SUFFIX),
            }
        });

        let bytes = manifest::encode_manifest(
            mfn,
            &self.keys.data_box,
            &self.keys.index_box,
            self.opts.compresslevel,
        )?;

        let tempdir = scratch::scratch_dir()?;
        let temp_path = tempdir.path().join(&filename);
        tokio::fs::write(&temp_path, &bytes)
            .await
            .map_err(|e| Error::io(&temp_path, e))?;
        scratch::set_secure_permissions(&temp_path).ok();
        self.store.save(&filename, &temp_path).await?;
        tracing::info!(manifest = %filename, files = mfn.len(), "manifest stored");
        Ok(filename)
    }
}

async fn encrypt_one(
    keys: Arc<KeySet>,
    store: Arc<BlobStore>,
    out: Output,
    path: PathBuf,
    chunk_size: usize,
    level: i32,
) -> Result<(FileEntry, u64)> {
    tracing::info!(file = %path.display(), "encrypting");
    let meta = tokio::fs::metadata(&path)
        .await
        .map_err(|e| Error::io(&path, e))?;
    let atime = meta.accessed().map(unix_seconds).unwrap_or(0.0);
    let mtime = meta.modified().map(unix_seconds).unwrap_or(0.0);

    // Chunk ciphertexts are staged on the scratch dir (ramdisk when
    // available) and released as soon as the fan-out accepts them.
    let tempdir = scratch::scratch_dir()?;
    let mut blobs = Vec::new();
    let mut stored_bytes = 0u64;
    for chunk in ChunkIter::open(&path, chunk_size, level)? {
        let chunk = chunk?;
        let name = crypto::blob_name(&chunk, keys.secret.expose());
        let ciphertext = keys
            .data_box
            .encrypt(&codec::skippable_frame_pad(chunk, chunk_size))?;
        stored_bytes += ciphertext.len() as u64;

        let temp_path = tempdir.path().join(&name);
        tokio::fs::write(&temp_path, &ciphertext)
            .await
            .map_err(|e| Error::io(&temp_path, e))?;
        scratch::set_secure_permissions(&temp_path).ok();
        store.save_blob(&name, &temp_path).await?;
        tokio::fs::remove_file(&temp_path).await.ok();

        out.line(&name);
        blobs.push(name);
    }

    Ok((
        FileEntry {
            blobs,
            atime,
            mtime,
        },
        stored_bytes,
    ))
}

fn unix_seconds(time: SystemTime) -> f64 {
    time.duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// Lexical normalization: `.` dropped, `..` folded against preceding
/// components. No filesystem access.
fn lexical_clean(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => match out.components().next_back() {
                Some(Component::Normal(_)) => {
                    out.pop();
                }
                Some(Component::RootDir | Component::Prefix(_)) => {}
                _ => out.push(".."),
            },
            other => out.push(other),
        }
    }
    out
}

pub(crate) fn archived_path(path: &Path, store_absolute: bool) -> String {
    if store_absolute {
        let absolute = if path.is_absolute() {
            lexical_clean(path)
        } else {
            let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
            lexical_clean(&cwd.join(path))
        };
        return absolute.to_string_lossy().into_owned();
    }

    let escapes = path
        .components()
        .any(|c| matches!(c, Component::ParentDir));
    if path.is_absolute() || escapes {
        return path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.to_string_lossy().into_owned());
    }
    path.to_string_lossy().into_owned()
}
