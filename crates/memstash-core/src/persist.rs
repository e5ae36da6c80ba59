//! Moves the database image between disk and memory.
//!
//! The working image always lives in an in-memory SQLite connection. Loading
//! restores the file into it; flushing backs the whole image up into a
//! sibling temp file and renames it over the target, so readers of the file
//! never see a half-written image.

use std::fs;
use std::path::{Path, PathBuf};

use rusqlite::{backup::Progress, Connection, DatabaseName};
use tracing::debug;

use crate::MemoryError;

/// Open an in-memory image, seeded from `path` when the file exists.
pub fn load(path: Option<&Path>) -> Result<Connection, MemoryError> {
    let mut conn = Connection::open_in_memory().map_err(MemoryError::Database)?;
    let Some(path) = path else {
        return Ok(conn);
    };
    if path.exists() {
        conn.restore(DatabaseName::Main, path, None::<fn(Progress)>)
            .map_err(|e| MemoryError::image(path, e))?;
        debug!(path = %path.display(), "loaded memory image");
    } else {
        debug!(path = %path.display(), "no memory image on disk, starting empty");
    }
    Ok(conn)
}

/// Write the full image to `path`, replacing whatever was there.
pub fn flush(conn: &Connection, path: &Path) -> Result<(), MemoryError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(|e| MemoryError::io(parent, e))?;
    }

    let tmp = temp_path(path);
    if tmp.exists() {
        fs::remove_file(&tmp).map_err(|e| MemoryError::io(&tmp, e))?;
    }
    if let Err(e) = conn.backup(DatabaseName::Main, &tmp, None) {
        let _ = fs::remove_file(&tmp);
        return Err(MemoryError::image(&tmp, e));
    }
    fs::rename(&tmp, path).map_err(|e| MemoryError::io(path, e))?;
    debug!(path = %path.display(), "flushed memory image");
    Ok(())
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_else(|| "memstash.db".into());
    name.push(".tmp");
    path.with_file_name(name)
}
