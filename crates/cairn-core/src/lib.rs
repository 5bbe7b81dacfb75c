//! Deduplicating, authenticated, compressed file backup.
//!
//! Files are zstd-compressed, split into fixed-size chunks of the
//! compressed stream, and encrypted one chunk at a time. Chunks are named
//! by a keyed hash of their plaintext, so identical chunks collide by name
//! across files and across runs and are stored once. A backup is described
//! by a layered manifest: a public length prefix, an encrypted index (the
//! sorted set of chunk names, readable with just the content secret), and
//! an encrypted body (per-file metadata and chunk order).
//!
//! Key modes:
//! - a symmetric keyfile or passphrase keys everything;
//! - a hybrid ML-KEM-1024 + X25519 keypair splits privileges: the public
//!   key can write backups and read indexes, only the private key can read
//!   bodies and chunk contents.
//!
//! Storage fans out to an ordered list of destinations (local directory,
//! S3-compatible bucket, or an upload program), skipping chunks a
//! destination already holds.

pub mod chunker;
pub mod codec;
pub mod crypto;
pub mod decryptor;
pub mod encryptor;
pub mod error;
pub mod inputs;
pub mod keys;
pub mod manifest;
pub mod output;
pub mod resolve;
pub mod scratch;
pub mod store;

pub use decryptor::{DecryptReport, Decryptor};
pub use encryptor::{EncryptOptions, EncryptReport, Encryptor};
pub use error::{Error, Result};
pub use keys::{ContentSecret, KeyMaterial, KeySet, Keypair, INDEX_PASSPHRASE_ENV};
pub use manifest::{FileEntry, Manifest, MANIFEST_SUFFIX};
pub use output::Output;
pub use store::BlobStore;

/// Unit tests that move the process working directory serialize on this.
#[cfg(test)]
pub(crate) fn test_cwd_lock() -> std::sync::MutexGuard<'static, ()> {
    static CWD: std::sync::Mutex<()> = std::sync::Mutex::new(());
    CWD.lock().unwrap_or_else(|e| e.into_inner())
}
