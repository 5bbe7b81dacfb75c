use std::path::{Path, PathBuf};

use tempfile::TempDir;

use crate::error::{Error, Result};

/// Root under which all scratch space is allocated: a ramdisk when one is
/// mounted, the system temp dir otherwise.
pub fn scratch_root() -> PathBuf {
    let shm = Path::new("/dev/shm");
    if shm.is_dir() {
        return shm.to_path_buf();
    }
    std::env::temp_dir()
}

/// A scoped scratch directory. Recursively removed on drop, on every exit
/// path.
pub fn scratch_dir() -> Result<TempDir> {
    tempfile::Builder::new()
        .prefix("cairn-")
        .tempdir_in(scratch_root())
        .map_err(|e| Error::io(scratch_root(), e))
}

/// Restrict a scratch file to the current user.
#[cfg(unix)]
pub fn set_secure_permissions(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
}

#[cfg(not(unix))]
pub fn set_secure_permissions(_path: &Path) -> std::io::Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scratch_root_exists() {
        assert!(scratch_root().is_dir());
    }

    #[test]
    fn scratch_dir_is_removed_on_drop() {
        let dir = scratch_dir().unwrap();
        let path = dir.path().to_path_buf();
        assert!(path.is_dir());
        drop(dir);
        assert!(!path.exists());
    }
}
