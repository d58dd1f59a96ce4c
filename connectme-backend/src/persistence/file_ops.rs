//! File operations for the collection files
//!
//! Every overwrite goes through a `<file>.bak` copy so an interrupted or
//! failed write can be rolled back, either immediately or on the next load.

use serde::de::DeserializeOwned;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use crate::error::PersistenceError;

/// Backup location for a collection file (e.g. "tags.json" -> "tags.json.bak")
pub fn backup_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".bak");
    path.with_file_name(name)
}

/// Write a file and fsync it (creates parent directories as needed)
pub fn write_file(path: &Path, content: &[u8]) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut file = fs::File::create(path)?;
    file.write_all(content)?;
    file.sync_all()?;
    Ok(())
}

/// Overwrite `path` using `write`, keeping a backup of the previous file
/// until the write has succeeded. On failure the previous content is copied
/// back and the error is returned with `restored` set accordingly.
pub fn write_with_backup<F>(path: &Path, write: F) -> Result<(), PersistenceError>
where
    F: FnOnce(&Path) -> io::Result<()>,
{
    let backup = backup_path(path);
    let had_previous = path.exists();
    if had_previous {
        fs::copy(path, &backup).map_err(|e| PersistenceError::io(&backup, e))?;
    }

    match write(path) {
        Ok(()) => {
            if had_previous {
                if let Err(e) = fs::remove_file(&backup) {
                    log::warn!("[PERSIST] Could not remove backup {}: {}", backup.display(), e);
                }
            }
            Ok(())
        }
        Err(source) => {
            let restored = if had_previous {
                match fs::copy(&backup, path) {
                    Ok(_) => {
                        let _ = fs::remove_file(&backup);
                        true
                    }
                    Err(e) => {
                        // Leave the backup in place; the next load recovers from it
                        log::error!(
                            "[PERSIST] Could not restore {} from backup: {}",
                            path.display(),
                            e
                        );
                        false
                    }
                }
            } else {
                let _ = fs::remove_file(path);
                false
            };
            Err(PersistenceError::Write {
                path: path.to_path_buf(),
                source,
                restored,
            })
        }
    }
}

/// Parse a collection file. `None` when the file is missing or blank.
fn parse_file<T: DeserializeOwned>(path: &Path) -> Result<Option<Vec<T>>, PersistenceError> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(PersistenceError::io(path, e)),
    };
    if content.trim().is_empty() {
        return Ok(None);
    }
    serde_json::from_str(&content)
        .map(Some)
        .map_err(|source| PersistenceError::Corrupt {
            path: path.to_path_buf(),
            source,
        })
}

/// Load a collection, recovering from a leftover backup if the last write
/// was interrupted. A missing file is an empty collection; a corrupt file
/// with no backup is an error.
pub fn read_collection<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>, PersistenceError> {
    let backup = backup_path(path);
    if backup.exists() {
        match parse_file(path) {
            Ok(Some(items)) => {
                log::warn!(
                    "[PERSIST] Found leftover backup for {}, primary is intact; discarding backup",
                    path.display()
                );
                let _ = fs::remove_file(&backup);
                return Ok(items);
            }
            Ok(None) | Err(_) => {
                log::warn!(
                    "[PERSIST] {} is missing or unreadable, restoring from {}",
                    path.display(),
                    backup.display()
                );
                fs::copy(&backup, path).map_err(|e| PersistenceError::io(path, e))?;
                let items = parse_file(path)?.unwrap_or_default();
                let _ = fs::remove_file(&backup);
                return Ok(items);
            }
        }
    }

    match parse_file(path)? {
        Some(items) => Ok(items),
        None => {
            if path.exists() {
                log::warn!("[PERSIST] {} is empty, starting with no records", path.display());
            }
            Ok(Vec::new())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{Value, json};
    use tempfile::tempdir;

    #[test]
    fn test_backup_path() {
        assert_eq!(
            backup_path(Path::new("/data/tags.json")),
            PathBuf::from("/data/tags.json.bak")
        );
    }

    #[test]
    fn test_write_and_read_collection() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("tags.json");

        write_with_backup(&path, |p| write_file(p, br#"[{"_id": "t1"}]"#)).unwrap();
        write_with_backup(&path, |p| write_file(p, br#"[{"_id": "t2"}]"#)).unwrap();

        let items: Vec<Value> = read_collection(&path).unwrap();
        assert_eq!(items, vec![json!({"_id": "t2"})]);
        assert!(!backup_path(&path).exists());
    }

    #[test]
    fn test_missing_and_blank_files_are_empty() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("persons.json");
        let items: Vec<Value> = read_collection(&path).unwrap();
        assert!(items.is_empty());

        fs::write(&path, "  \n").unwrap();
        let items: Vec<Value> = read_collection(&path).unwrap();
        assert!(items.is_empty());
    }

    #[test]
    fn test_failed_write_restores_previous_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("tags.json");
        fs::write(&path, "[1, 2]").unwrap();

        let err = write_with_backup(&path, |p| {
            fs::write(p, "[1, 2, 3")?;
            Err(io::Error::other("disk full"))
        })
        .unwrap_err();

        assert!(matches!(err, PersistenceError::Write { restored: true, .. }));
        assert_eq!(fs::read_to_string(&path).unwrap(), "[1, 2]");
        assert!(!backup_path(&path).exists());
    }

    #[test]
    fn test_failed_first_write_leaves_nothing() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("tags.json");

        let err = write_with_backup(&path, |p| {
            fs::write(p, "[")?;
            Err(io::Error::other("disk full"))
        })
        .unwrap_err();

        assert!(matches!(err, PersistenceError::Write { restored: false, .. }));
        assert!(!path.exists());
    }

    #[test]
    fn test_load_recovers_from_backup() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("tags.json");
        fs::write(&path, "[{\"_id\": ").unwrap();
        fs::write(backup_path(&path), "[{\"_id\": \"t1\"}]").unwrap();

        let items: Vec<Value> = read_collection(&path).unwrap();
        assert_eq!(items, vec![json!({"_id": "t1"})]);
        assert!(!backup_path(&path).exists());
        assert_eq!(fs::read_to_string(&path).unwrap(), "[{\"_id\": \"t1\"}]");
    }

    #[test]
    fn test_load_prefers_intact_primary_over_backup() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("tags.json");
        fs::write(&path, "[\"new\"]").unwrap();
        fs::write(backup_path(&path), "[\"old\"]").unwrap();

        let items: Vec<String> = read_collection(&path).unwrap();
        assert_eq!(items, vec!["new"]);
        assert!(!backup_path(&path).exists());
    }

    #[test]
    fn test_corrupt_without_backup_is_an_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("tags.json");
        fs::write(&path, "{not json").unwrap();

        let err = read_collection::<Value>(&path).unwrap_err();
        assert!(matches!(err, PersistenceError::Corrupt { .. }));
        assert_eq!(fs::read_to_string(&path).unwrap(), "{not json");
    }
}
