// src/persistence/mod.rs
// JSON file stores shared by the account registry, the snapshot store and the archive

pub mod history;
pub mod snapshot;

use crate::domain::errors::{PersistenceError, PersistenceResult};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs;
use std::io::Write;
use std::path::Path;

/// Read and parse a JSON file. A missing file is `Ok(None)`.
pub fn read_json<T: DeserializeOwned>(path: &Path) -> PersistenceResult<Option<T>> {
    let data = match fs::read_to_string(path) {
        Ok(data) => data,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(source) => {
            return Err(PersistenceError::Io {
                path: path.display().to_string(),
                source,
            })
        }
    };

    serde_json::from_str(&data)
        .map(Some)
        .map_err(|source| PersistenceError::Malformed {
            path: path.display().to_string(),
            source,
        })
}

/// Serialize to pretty JSON and replace `path` atomically (temp file + rename).
/// With `restricted` the file is created owner-read/write only on unix.
pub fn write_json<T: Serialize>(path: &Path, value: &T, restricted: bool) -> PersistenceResult<()> {
    let io_err = |source| PersistenceError::Io {
        path: path.display().to_string(),
        source,
    };

    let contents = serde_json::to_vec_pretty(value).map_err(|source| {
        PersistenceError::Malformed {
            path: path.display().to_string(),
            source,
        }
    })?;

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(io_err)?;
    }

    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = Path::new(&tmp);

    let mut options = fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    if restricted {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    #[cfg(not(unix))]
    let _ = restricted;

    let mut file = options.open(tmp).map_err(io_err)?;
    file.write_all(&contents).map_err(io_err)?;
    file.sync_all().map_err(io_err)?;
    drop(file);

    fs::rename(tmp, path).map_err(io_err)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn missing_file_reads_as_none() {
        let dir = tempfile::tempdir().unwrap();
        let value: Option<Vec<u32>> = read_json(&dir.path().join("absent.json")).unwrap();
        assert!(value.is_none());
    }

    #[test]
    fn write_then_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("data.json");
        let mut value = BTreeMap::new();
        value.insert(7u32, "seven".to_string());

        write_json(&path, &value, true).unwrap();
        let back: Option<BTreeMap<u32, String>> = read_json(&path).unwrap();
        assert_eq!(back, Some(value));
        assert!(!dir.path().join("nested").join("data.json.tmp").exists());
    }

    #[test]
    fn malformed_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.json");
        fs::write(&path, "{oops").unwrap();
        let result: PersistenceResult<Option<Vec<u32>>> = read_json(&path);
        assert!(matches!(result, Err(PersistenceError::Malformed { .. })));
    }

    #[cfg(unix)]
    #[test]
    fn restricted_files_are_owner_only() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("secrets.json");
        write_json(&path, &vec![1u8], true).unwrap();
        let mode = fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}
