//! File helpers: copies that create parent directories, and the metadata
//! archive members carry.

use std::fs;
use std::path::Path;
use std::time::UNIX_EPOCH;

use crate::error::{Error, Result};

/// Copy a file, creating the destination's parent directories as needed.
pub fn copy_with_dirs(from: &Path, to: &Path) -> Result<()> {
    ensure_parent_exists(to)?;
    fs::copy(from, to).map_err(|e| Error::io(from, e))?;
    Ok(())
}

/// Ensure all parent directories of a file exist.
pub fn ensure_parent_exists(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(|e| Error::io(parent, e))?;
    }
    Ok(())
}

/// Modification time of `path` in whole seconds since the Unix epoch.
///
/// Times before the epoch clamp to 0.
pub fn mtime_secs(path: &Path) -> Result<u64> {
    let modified = fs::metadata(path)
        .and_then(|m| m.modified())
        .map_err(|e| Error::io(path, e))?;
    Ok(modified
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0))
}

/// Unix permission bits of `path`.
#[cfg(unix)]
pub fn mode_bits(path: &Path) -> Result<u32> {
    use std::os::unix::fs::PermissionsExt;
    let meta = fs::metadata(path).map_err(|e| Error::io(path, e))?;
    Ok(meta.permissions().mode() & 0o777)
}

#[cfg(not(unix))]
pub fn mode_bits(_path: &Path) -> Result<u32> {
    Ok(0o644)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn copy_creates_parents() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src.bbl");
        fs::write(&src, "\\begin{thebibliography}").unwrap();
        let dst = dir.path().join("artifacts/nested/src.bbl");
        copy_with_dirs(&src, &dst).unwrap();
        assert_eq!(fs::read(&dst).unwrap(), fs::read(&src).unwrap());
    }

    #[test]
    fn mtime_of_missing_file_is_io_error() {
        let err = mtime_secs(Path::new("/nonexistent/file.tex")).unwrap_err();
        assert!(matches!(err, Error::Io { .. }));
    }

    #[cfg(unix)]
    #[test]
    fn mode_bits_masks_file_type() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.sh");
        fs::write(&path, "#!/bin/sh\n").unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
        assert_eq!(mode_bits(&path).unwrap(), 0o755);
    }
}
