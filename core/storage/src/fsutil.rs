//! Private, atomic file helpers.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use rand::{rngs::OsRng, RngCore};
use tracing::warn;

use phantomvault_common::{io_err, Result};

/// Unix mode for private directories.
pub const PRIVATE_DIR_MODE: u32 = 0o700;
/// Unix mode for private files.
pub const PRIVATE_FILE_MODE: u32 = 0o600;

/// Ensure a directory exists and restrict it to the owner.
pub fn ensure_private_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path).map_err(io_err(path))?;
    set_permissions(path, PRIVATE_DIR_MODE)
}

/// Write a file atomically: temp sibling, fsync, rename.
///
/// # Postconditions
/// - Readers see either the old content or the complete new content
/// - The file is owner-readable only
pub fn write_private_file_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(io_err(parent))?;
    }

    let temp_path = temp_path_for(path);
    let result = (|| {
        let mut file = fs::File::create(&temp_path).map_err(io_err(&temp_path))?;
        set_permissions(&temp_path, PRIVATE_FILE_MODE)?;
        file.write_all(bytes).map_err(io_err(&temp_path))?;
        file.sync_all().map_err(io_err(&temp_path))?;
        fs::rename(&temp_path, path).map_err(io_err(path))
    })();

    if result.is_err() {
        match fs::remove_file(&temp_path) {
            Err(cleanup) if cleanup.kind() != std::io::ErrorKind::NotFound => {
                warn!(path = %temp_path.display(), error = %cleanup, "failed to remove temp file");
            }
            _ => {}
        }
    }
    result
}

/// Apply Unix permissions when supported.
pub fn set_permissions(path: &Path, mode: u32) -> Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(mode)).map_err(io_err(path))?;
    }
    #[cfg(not(unix))]
    {
        let _ = (path, mode);
    }
    Ok(())
}

/// Unique hidden sibling of `path`.
pub fn temp_path_for(path: &Path) -> PathBuf {
    let file_name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "tmp".to_string());
    path.with_file_name(format!(".{}.{:08x}.tmp", file_name, OsRng.next_u32()))
}
