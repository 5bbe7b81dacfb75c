//! Normalizes a mixed list of files, directories, and glob patterns into a
//! deterministic (sorted, de-duplicated) list of regular files.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

pub fn expand_inputs<S: AsRef<str>>(inputs: &[S]) -> Result<Vec<PathBuf>> {
    let mut files = BTreeSet::new();
    for raw in inputs {
        let raw = raw.as_ref();
        let path = Path::new(raw);
        if path.is_file() {
            files.insert(path.to_path_buf());
            continue;
        }

        let pattern = if path.is_dir() {
            format!("{}/**/*", raw.trim_end_matches('/'))
        } else {
            raw.to_string()
        };
        let matches = glob::glob(&pattern)
            .map_err(|e| Error::Config(format!("bad input pattern '{raw}': {e}")))?;
        for entry in matches {
            let found = entry.map_err(|e| {
                let path = e.path().to_path_buf();
                Error::io(path, e.into_error())
            })?;
            if found.is_file() {
                files.insert(found);
            }
        }
    }
    Ok(files.into_iter().collect())
}
