use std::path::Path;

use async_trait::async_trait;

use crate::error::{Error, Result};
use crate::store::backend::Backend;

/// Fallback destination: an external program invoked as
/// `<program> <remote_name> <local_path>` for every stored object.
///
/// Upload-only. `exists` reports false so each object is handed to the
/// program unconditionally; the program owns any skip logic.
pub struct ExecFs {
    program: String,
}

impl ExecFs {
    pub fn new(program: impl Into<String>) -> Self {
        ExecFs {
            program: program.into(),
        }
    }

    fn unsupported(&self, op: &str) -> Error {
        Error::Store(format!(
            "destination '{}' is an upload-only program ({op} not supported)",
            self.program
        ))
    }
}

#[async_trait]
impl Backend for ExecFs {
    async fn exists(&self, _remote: &str) -> Result<bool> {
        Ok(false)
    }

    async fn upload(&self, local: &Path, remote: &str) -> Result<()> {
        let output = tokio::process::Command::new(&self.program)
            .arg(remote)
            .arg(local)
            .output()
            .await
            .map_err(|e| Error::Store(format!("spawn '{}': {e}", self.program)))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::Store(format!(
                "'{}' exited with {} for {remote}: {}",
                self.program,
                output.status,
                stderr.trim()
            )));
        }
        Ok(())
    }

    async fn download(&self, _remote: &str, _local: &Path) -> Result<()> {
        Err(self.unsupported("download"))
    }

    async fn remove(&self, _remote: &str) -> Result<()> {
        Err(self.unsupported("remove"))
    }

    async fn list(
        &self,
        _prefix: &str,
        _recursive: bool,
        _pattern: Option<&str>,
    ) -> Result<Vec<String>> {
        Err(self.unsupported("list"))
    }
}
