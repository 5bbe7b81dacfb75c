use std::path::PathBuf;

/// Error taxonomy for the backup pipeline.
///
/// Errors are surfaced at file granularity: one file failing to encrypt or
/// restore does not abort the run, but the caller is expected to report it
/// and exit non-zero.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Malformed destination string, conflicting key modes, unknown backend.
    #[error("config: {0}")]
    Config(String),

    /// Unreadable keyfile, wrong key length, passphrase mismatch.
    #[error("key: {0}")]
    Key(String),

    /// AEAD or sealed-box decryption failed. Never retried.
    #[error("decryption failed: {0}")]
    CryptoAuth(&'static str),

    /// Zstd or JSON payload could not be decoded, or a manifest entry is
    /// unsafe to materialize.
    #[error("codec: {0}")]
    Codec(String),

    /// Backend I/O failed.
    #[error("store: {0}")]
    Store(String),

    /// A chunk listed in a manifest is absent from all queried destinations.
    #[error("missing blob: {0}")]
    Integrity(String),

    #[error("i/o on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl Error {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Error::Io {
            path: path.into(),
            source,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
