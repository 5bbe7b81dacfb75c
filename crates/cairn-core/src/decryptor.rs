//! The restore pipeline: load manifests, stream chunks through decryption
//! and decompression into output files, put timestamps back.

use std::collections::BTreeSet;
use std::io::Write;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use filetime::FileTime;

use crate::codec;
use crate::error::{Error, Result};
use crate::keys::KeySet;
use crate::manifest::{self, FileEntry, Manifest, MANIFEST_SUFFIX};
use crate::output::Output;
use crate::resolve::Resolver;

/// How a mixed input list is consumed: every `.mfn` opens a group, later
/// plain entries restrict that group to matching archived paths, and plain
/// entries before any manifest are decrypted blob-by-blob to the output
/// stream.
#[derive(Debug, PartialEq, Eq)]
pub enum RequestGroup {
    Loose(Vec<String>),
    Manifest {
        input: String,
        restrict: BTreeSet<String>,
    },
}

pub fn partition_inputs<S: AsRef<str>>(inputs: &[S]) -> Vec<RequestGroup> {
    let mut groups = Vec::new();
    let mut loose = Vec::new();
    for raw in inputs {
        let raw = raw.as_ref();
        if raw.ends_with(MANIFEST_SUFFIX) {
            groups.push(RequestGroup::Manifest {
                input: raw.to_string(),
                restrict: BTreeSet::new(),
            });
        } else if let Some(RequestGroup::Manifest { restrict, .. }) = groups.last_mut() {
            restrict.insert(raw.to_string());
        } else {
            loose.push(raw.to_string());
        }
    }
    if !loose.is_empty() {
        groups.insert(0, RequestGroup::Loose(loose));
    }
    groups
}

pub struct DecryptReport {
    pub restored: Vec<String>,
    pub failures: Vec<(String, Error)>,
}

impl DecryptReport {
    pub fn ok(&self) -> bool {
        self.failures.is_empty()
    }
}

pub struct Decryptor {
    keys: Arc<KeySet>,
    out: Output,
    consume: bool,
}

impl Decryptor {
    pub fn new(keys: KeySet, out: Output, consume: bool) -> Self {
        Decryptor {
            keys: Arc::new(keys),
            out,
            consume,
        }
    }

    /// Decrypt the manifest body (filenames, timestamps, chunk order).
    pub fn load_manifest(&self, path: &Path) -> Result<Manifest> {
        manifest::read_manifest_body(path, &self.keys.data_box)
    }

    /// Decrypt only the manifest index (the sorted chunk-name list); needs
    /// nothing beyond the content secret.
    pub fn load_manifest_index(&self, path: &Path) -> Result<Vec<String>> {
        manifest::read_manifest_index(path, &self.keys.index_box, self.keys.data_box.overhead())
    }

    /// Process a mixed list of manifests, restrict filters, and loose chunk
    /// names. One file failing does not stop the others; a manifest that
    /// fails to authenticate aborts its whole group. Partially written
    /// output of a failed file is left in place.
    pub async fn decrypt<S: AsRef<str>>(&self, inputs: &[S]) -> Result<DecryptReport> {
        let mut resolver = Resolver::new()?;
        let mut report = DecryptReport {
            restored: Vec::new(),
            failures: Vec::new(),
        };

        for group in partition_inputs(inputs) {
            match group {
                RequestGroup::Loose(names) => {
                    self.decrypt_loose(&mut resolver, &names, &mut report).await;
                }
                RequestGroup::Manifest { input, restrict } => {
                    self.decrypt_group(&mut resolver, &input, &restrict, &mut report)
                        .await;
                }
            }
        }
        Ok(report)
    }

    /// Loose chunks share one decompressor over the output stream: the zstd
    /// frame spans the original file, so the caller must supply the chunks
    /// in their original order.
    async fn decrypt_loose(
        &self,
        resolver: &mut Resolver,
        names: &[String],
        report: &mut DecryptReport,
    ) {
        let mut decoder = match codec::decompress_writer(self.out.writer()) {
            Ok(decoder) => decoder,
            Err(e) => {
                report
                    .failures
                    .push(("<stdout>".into(), Error::Codec(format!("zstd init: {e}"))));
                return;
            }
        };

        for name in names {
            let outcome: Result<()> = async {
                let resolved = resolver.resolve_input(name).await?;
                let bytes = tokio::fs::read(&resolved.path)
                    .await
                    .map_err(|e| Error::io(&resolved.path, e))?;
                let plaintext = self.keys.data_box.decrypt(&bytes)?;
                decoder
                    .write_all(&plaintext)
                    .map_err(|e| Error::Codec(format!("zstd stream: {e}")))?;
                if self.consume {
                    tokio::fs::remove_file(&resolved.path).await.ok();
                }
                Ok(())
            }
            .await;

            match outcome {
                Ok(()) => report.restored.push(name.clone()),
                Err(err) => {
                    tracing::error!(blob = %name, error = %err, "loose decryption failed");
                    report.failures.push((name.clone(), err));
                    // The stream is mid-frame; nothing sensible can follow.
                    return;
                }
            }
        }
        if let Err(e) = decoder.flush() {
            report
                .failures
                .push(("<stdout>".into(), Error::Codec(format!("zstd flush: {e}"))));
        }
    }

    async fn decrypt_group(
        &self,
        resolver: &mut Resolver,
        input: &str,
        restrict: &BTreeSet<String>,
        report: &mut DecryptReport,
    ) {
        let resolved = match resolver.resolve_input(input).await {
            Ok(resolved) => resolved,
            Err(err) => {
                report.failures.push((input.to_string(), err));
                return;
            }
        };
        let mfn = match self.load_manifest(&resolved.path) {
            Ok(mfn) => mfn,
            Err(err) => {
                tracing::error!(manifest = input, error = %err, "manifest unreadable");
                report.failures.push((input.to_string(), err));
                return;
            }
        };

        for (archived, entry) in &mfn {
            if !restrict.is_empty() && !restrict.contains(archived) {
                continue;
            }
            match self.restore_file(resolver, archived, entry).await {
                Ok(()) => report.restored.push(archived.clone()),
                Err(err) => {
                    tracing::error!(file = %archived, error = %err, "restore failed");
                    report.failures.push((archived.clone(), err));
                }
            }
        }

        if self.consume {
            tokio::fs::remove_file(&resolved.path).await.ok();
        }
    }

    async fn restore_file(
        &self,
        resolver: &mut Resolver,
        archived: &str,
        entry: &FileEntry,
    ) -> Result<()> {
        let dest = output_path(archived)?;
        if let Some(parent) = dest.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| Error::io(parent, e))?;
            }
        }

        let file = std::fs::File::create(&dest).map_err(|e| Error::io(&dest, e))?;
        let mut decoder =
            codec::decompress_writer(file).map_err(|e| Error::io(&dest, e))?;

        for blob in &entry.blobs {
            let resolved = resolver.resolve_blob(blob).await?;
            let bytes = tokio::fs::read(&resolved.path)
                .await
                .map_err(|e| Error::io(&resolved.path, e))?;
            let plaintext = self.keys.data_box.decrypt(&bytes)?;
            decoder
                .write_all(&plaintext)
                .map_err(|e| Error::Codec(format!("zstd stream for {archived}: {e}")))?;
            if self.consume {
                tokio::fs::remove_file(&resolved.path).await.ok();
            }
        }
        decoder
            .flush()
            .map_err(|e| Error::Codec(format!("zstd flush for {archived}: {e}")))?;
        drop(decoder);

        filetime::set_file_times(&dest, file_time(entry.atime), file_time(entry.mtime))
            .map_err(|e| Error::io(&dest, e))?;
        tracing::info!(file = %dest.display(), blobs = entry.blobs.len(), "restored");
        Ok(())
    }
}

/// Where an archived path may be materialized. Absolute paths restore
/// absolutely (they are only recorded under explicit opt-in at encryption
/// time); relative paths must stay inside the working directory.
fn output_path(archived: &str) -> Result<PathBuf> {
    if archived.is_empty() {
        return Err(Error::Codec("empty archived path".into()));
    }
    let path = Path::new(archived);
    if path.is_absolute() {
        return Ok(path.to_path_buf());
    }
    let escapes = path
        .components()
        .any(|c| matches!(c, Component::ParentDir));
    if escapes {
        return Err(Error::Codec(format!(
            "refusing to restore '{archived}': path escapes the working directory"
        )));
    }
    Ok(path.to_path_buf())
}

fn file_time(seconds: f64) -> FileTime {
    let whole = seconds.floor();
    let nanos = ((seconds - whole) * 1e9).min(999_999_999.0) as u32;
    FileTime::from_unix_time(whole as i64, nanos)
}
