//! The local contacts file: reading, atomic replacement and the lock that
//! keeps two runs from writing it at once.

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::row::{Row, RowError, RowSet, Upserted, WIDTH};

#[derive(Debug, thiserror::Error)]
pub enum LocalFileError {
    #[error("failed to read {}: {source}", .path.display())]
    Read { path: PathBuf, source: io::Error },
    #[error("{} is not valid UTF-8; use --fresh to start over", .path.display())]
    Encoding { path: PathBuf },
    #[error("{}:{line}: {source}; use --fresh to start over", .path.display())]
    Malformed {
        path: PathBuf,
        line: usize,
        source: RowError,
    },
    #[error("failed to write {}: {source}", .path.display())]
    Persist { path: PathBuf, source: io::Error },
    #[error(
        "{} is locked by another run (lock file {}); remove the lock file if no sync is running",
        .path.display(),
        .lock.display()
    )]
    Locked { path: PathBuf, lock: PathBuf },
    #[error("failed to create lock file {}: {source}", .lock.display())]
    Lock { lock: PathBuf, source: io::Error },
}

/// Read the rows stored at `path`. A missing file is an empty set.
///
/// Blank lines are skipped. Rows without data are dropped with a warning.
/// A repeated identity keeps its first position and the last row.
pub fn read_rows(path: &Path) -> Result<RowSet, LocalFileError> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            debug!("{} does not exist yet; starting empty", path.display());
            return Ok(RowSet::new());
        }
        Err(err) if err.kind() == io::ErrorKind::InvalidData => {
            return Err(LocalFileError::Encoding {
                path: path.to_path_buf(),
            });
        }
        Err(source) => {
            return Err(LocalFileError::Read {
                path: path.to_path_buf(),
                source,
            });
        }
    };

    let mut rows = RowSet::new();
    for (idx, line) in content.lines().enumerate() {
        let line = line.trim_end_matches('\r');
        if line.trim().is_empty() {
            continue;
        }
        let row = Row::from_line(line, WIDTH).map_err(|source| LocalFileError::Malformed {
            path: path.to_path_buf(),
            line: idx + 1,
            source,
        })?;
        match rows.upsert(row) {
            Upserted::Added => {}
            Upserted::Replaced(previous) => warn!(
                "{}:{}: duplicate identity '{}'; keeping the later row",
                path.display(),
                idx + 1,
                previous.key()
            ),
            Upserted::Refused => warn!(
                "{}:{}: row has no data; dropping it",
                path.display(),
                idx + 1
            ),
        }
    }
    Ok(rows)
}

/// Render rows in file format: one line per row, each terminated by `\n`.
pub fn render(rows: &RowSet) -> String {
    let mut output = String::new();
    for row in rows {
        output.push_str(&row.to_line());
        output.push('\n');
    }
    output
}

/// Replace the file at `path` with `rows`. The previous content stays intact
/// unless the new content was written completely.
pub fn write_rows(path: &Path, rows: &RowSet) -> Result<(), LocalFileError> {
    write_atomic(path, render(rows).as_bytes()).map_err(|source| LocalFileError::Persist {
        path: path.to_path_buf(),
        source,
    })
}

/// Removes the temporary file unless it was renamed into place.
struct TempGuard {
    path: PathBuf,
    armed: bool,
}

impl Drop for TempGuard {
    fn drop(&mut self) {
        if self.armed {
            if let Err(err) = fs::remove_file(&self.path) {
                warn!(
                    "failed to remove temporary file {}: {err}",
                    self.path.display()
                );
            }
        }
    }
}

/// The file a write should land in: symlinks are followed so the link stays
/// in place and its destination is updated.
fn resolve_target(target: &Path) -> io::Result<PathBuf> {
    if target.exists() {
        fs::canonicalize(target)
    } else {
        Ok(target.to_path_buf())
    }
}

fn write_atomic(target: &Path, data: &[u8]) -> io::Result<()> {
    let target = resolve_target(target)?;
    let target = target.as_path();
    let permissions = match fs::metadata(target) {
        Ok(metadata) => Some(metadata.permissions()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => None,
        Err(err) => return Err(err),
    };

    let parent = match target.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    fs::create_dir_all(&parent)?;

    let name = target
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or("contacts");

    let mut counter: u32 = 0;
    let (temp_path, mut file) = loop {
        let candidate = if counter == 0 {
            parent.join(format!(".{name}.tmp"))
        } else {
            parent.join(format!(".{name}.{counter}.tmp"))
        };
        match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&candidate)
        {
            Ok(file) => break (candidate, file),
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists && counter < 100 => {
                counter += 1;
            }
            Err(err) => return Err(err),
        }
    };
    let mut guard = TempGuard {
        path: temp_path,
        armed: true,
    };

    file.write_all(data)?;
    if let Some(permissions) = permissions {
        file.set_permissions(permissions)?;
    }
    file.sync_all()?;
    drop(file);

    fs::rename(&guard.path, target)?;
    guard.armed = false;
    Ok(())
}

/// Exclusive claim on the contacts file for the duration of a run. The lock
/// file is removed on drop.
#[derive(Debug)]
pub struct FileLock {
    path: PathBuf,
}

impl FileLock {
    pub fn acquire(target: &Path) -> Result<Self, LocalFileError> {
        let lock = lock_path(target);
        if let Some(parent) = lock.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|source| LocalFileError::Lock {
                lock: lock.clone(),
                source,
            })?;
        }

        match OpenOptions::new().write(true).create_new(true).open(&lock) {
            Ok(mut file) => {
                // The pid is informational only.
                let _ = writeln!(file, "{}", std::process::id());
                Ok(Self { path: lock })
            }
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => Err(LocalFileError::Locked {
                path: target.to_path_buf(),
                lock,
            }),
            Err(source) => Err(LocalFileError::Lock { lock, source }),
        }
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        if let Err(err) = fs::remove_file(&self.path) {
            warn!("failed to remove lock file {}: {err}", self.path.display());
        }
    }
}

pub fn lock_path(target: &Path) -> PathBuf {
    let mut name = target.as_os_str().to_os_string();
    name.push(".lock");
    PathBuf::from(name)
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;
    use crate::row::{row, RowKey};

    fn sample() -> RowSet {
        vec![
            row("uid-b", &["Bob", "555-3333", "", ""]),
            row("uid-a", &["Alice", "555-2222", "alice@x.com", "ACME"]),
        ]
        .into_iter()
        .collect()
    }

    #[test]
    fn test_write_then_read_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("contacts.tsv");

        write_rows(&path, &sample()).unwrap();
        let content = fs::read_to_string(&path).unwrap();
        assert_eq!(
            content,
            "uid-b\tBob\t555-3333\t\t\nuid-a\tAlice\t555-2222\talice@x.com\tACME\n"
        );
        assert_eq!(read_rows(&path).unwrap(), sample());
    }

    #[test]
    fn test_missing_file_is_empty() {
        let dir = TempDir::new().unwrap();
        let rows = read_rows(&dir.path().join("nope.tsv")).unwrap();
        assert!(rows.is_empty());
    }

    #[test]
    fn test_malformed_line_is_fatal() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("contacts.tsv");
        fs::write(&path, "uid-a\tAlice\t\t\t\nthis line has no tabs\n").unwrap();

        let err = read_rows(&path).unwrap_err();
        assert!(matches!(err, LocalFileError::Malformed { line: 2, .. }));
    }

    #[test]
    fn test_invalid_utf8_is_fatal() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("contacts.tsv");
        fs::write(&path, b"uid-a\t\xff\xfe\t\t\t\n").unwrap();

        assert!(matches!(
            read_rows(&path).unwrap_err(),
            LocalFileError::Encoding { .. }
        ));
    }

    #[test]
    fn test_read_tolerates_blank_lines_and_crlf() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("contacts.tsv");
        fs::write(&path, "uid-a\tAlice\t\t\t\r\n\r\n\t\t\t\t\nuid-a\tAlicia\t\t\t\n").unwrap();

        let rows = read_rows(&path).unwrap();
        assert_eq!(rows.len(), 1);
        let alice = rows.get(&RowKey::Id("uid-a".to_string())).unwrap();
        assert_eq!(alice.fields()[0], "Alicia");
    }

    #[test]
    fn test_failed_write_keeps_original_and_cleans_up() {
        let dir = TempDir::new().unwrap();
        // A directory in the way of the rename target makes the rename fail.
        let path = dir.path().join("contacts.tsv");
        fs::create_dir(&path).unwrap();
        fs::write(path.join("keep"), "data").unwrap();

        let err = write_rows(&path, &sample()).unwrap_err();
        assert!(matches!(err, LocalFileError::Persist { .. }));
        assert!(path.join("keep").exists());

        let leftovers: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[cfg(unix)]
    #[test]
    fn test_write_keeps_file_mode() {
        use std::os::unix::fs::PermissionsExt;

        let dir = TempDir::new().unwrap();
        let path = dir.path().join("contacts.tsv");
        fs::write(&path, "old\tOld\t\t\t\n").unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o600)).unwrap();

        write_rows(&path, &sample()).unwrap();

        let mode = fs::metadata(&path).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o600);
        assert_eq!(read_rows(&path).unwrap(), sample());
    }

    #[cfg(unix)]
    #[test]
    fn test_write_through_symlink_updates_destination() {
        use std::os::unix::fs::symlink;

        let dir = TempDir::new().unwrap();
        let real = dir.path().join("real.tsv");
        let link = dir.path().join("contacts.tsv");
        fs::write(&real, "a\tA\t\t\t\n").unwrap();
        symlink(&real, &link).unwrap();

        write_rows(&link, &sample()).unwrap();

        assert!(fs::symlink_metadata(&link).unwrap().file_type().is_symlink());
        assert_eq!(read_rows(&real).unwrap(), sample());
        assert_eq!(read_rows(&link).unwrap(), sample());
    }

    #[test]
    fn test_lock_is_exclusive_and_released() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("contacts.tsv");

        let lock = FileLock::acquire(&path).unwrap();
        assert!(lock_path(&path).exists());
        assert!(matches!(
            FileLock::acquire(&path).unwrap_err(),
            LocalFileError::Locked { .. }
        ));

        drop(lock);
        assert!(!lock_path(&path).exists());
        assert!(FileLock::acquire(&path).is_ok());
    }
}
