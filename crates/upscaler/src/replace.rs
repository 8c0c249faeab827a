//! Moving the finished file to its destination.
//!
//! The combined file lives in the temp directory, which is often on another
//! filesystem than the media library. The move therefore degrades from a
//! hard link, to a rename, to a full copy. The copy is written under a hidden
//! name beside the destination and renamed into place, so `dest` is either
//! absent or complete.

use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

/// Errors that can occur while moving a file into place.
#[derive(Debug, Error)]
pub enum ReplaceError {
    /// Source file is gone.
    #[error("Source file {0} does not exist")]
    MissingSource(String),

    /// Link and rename both failed and so did the copy.
    #[error("Failed to copy into place: {0}")]
    CopyFailed(#[source] io::Error),

    /// The destination was written but the source could not be removed.
    #[error("Failed to remove source after copy: {0}")]
    RemoveSourceFailed(#[source] io::Error),
}

/// How [`move_file`] got the file there.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MoveMethod {
    HardLink,
    Rename,
    Copy,
}

/// Move `src` to `dest`, replacing `dest` if the fallbacks allow it.
///
/// Order of attempts:
/// 1. hard link `src` to `dest`, then remove `src`
/// 2. rename `src` to `dest`
/// 3. copy `src` beside `dest`, rename it into place, then remove `src`
///
/// A hard link never overwrites, so an existing `dest` falls through to
/// rename. After success `src` no longer exists.
pub fn move_file(src: &Path, dest: &Path) -> Result<MoveMethod, ReplaceError> {
    if !src.exists() {
        return Err(ReplaceError::MissingSource(src.display().to_string()));
    }

    match fs::hard_link(src, dest) {
        Ok(()) => {
            if let Err(e) = fs::remove_file(src) {
                // Both names point at the same data; the temp dir cleanup removes it later
                warn!(src = %src.display(), error = %e, "linked but could not remove source");
            }
            return Ok(MoveMethod::HardLink);
        }
        Err(e) => debug!(
            src = %src.display(),
            dest = %dest.display(),
            error = %e,
            "hard link failed"
        ),
    }

    match fs::rename(src, dest) {
        Ok(()) => return Ok(MoveMethod::Rename),
        Err(e) => debug!(src = %src.display(), dest = %dest.display(), error = %e, "rename failed"),
    }

    copy_into_place(src, dest).map_err(ReplaceError::CopyFailed)?;
    fs::remove_file(src).map_err(ReplaceError::RemoveSourceFailed)?;
    Ok(MoveMethod::Copy)
}

/// Copy `src` to a hidden file in `dest`'s directory, sync it, then rename it
/// over `dest`. The partial file is removed if any step fails.
pub fn copy_into_place(src: &Path, dest: &Path) -> io::Result<()> {
    let partial = partial_path(dest)?;
    let result = fs::copy(src, &partial)
        .and_then(|_| File::open(&partial)?.sync_all())
        .and_then(|()| fs::rename(&partial, dest));
    if result.is_err() {
        let _ = fs::remove_file(&partial);
    }
    result
}

fn partial_path(dest: &Path) -> io::Result<PathBuf> {
    let name = dest.file_name().ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("{} has no file name", dest.display()),
        )
    })?;
    let partial = format!(".{}.{}.partial", name.to_string_lossy(), Uuid::new_v4());
    Ok(dest.with_file_name(partial))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    fn write(path: &Path, content: &[u8]) {
        let mut file = File::create(path).unwrap();
        file.write_all(content).unwrap();
    }

    #[test]
    fn test_move_to_new_destination_links() {
        let temp_dir = TempDir::new().unwrap();
        let src = temp_dir.path().join("combined.mkv");
        let dest = temp_dir.path().join("Show S01E01 2160p.mkv");
        write(&src, b"upscaled");

        let method = move_file(&src, &dest).unwrap();

        assert_eq!(method, MoveMethod::HardLink);
        assert!(!src.exists());
        assert_eq!(fs::read(&dest).unwrap(), b"upscaled");
    }

    #[test]
    fn test_existing_destination_is_replaced_by_rename() {
        let temp_dir = TempDir::new().unwrap();
        let src = temp_dir.path().join("combined.mkv");
        let dest = temp_dir.path().join("out.mkv");
        write(&src, b"new");
        write(&dest, b"stale");

        let method = move_file(&src, &dest).unwrap();

        assert_eq!(method, MoveMethod::Rename);
        assert!(!src.exists());
        assert_eq!(fs::read(&dest).unwrap(), b"new");
    }

    #[test]
    fn test_missing_source() {
        let temp_dir = TempDir::new().unwrap();
        let result = move_file(
            &temp_dir.path().join("nope.mkv"),
            &temp_dir.path().join("out.mkv"),
        );
        assert!(matches!(result, Err(ReplaceError::MissingSource(_))));
        assert!(!temp_dir.path().join("out.mkv").exists());
    }

    #[test]
    fn test_unwritable_destination_keeps_source() {
        let temp_dir = TempDir::new().unwrap();
        let src = temp_dir.path().join("combined.mkv");
        write(&src, b"upscaled");
        let dest = temp_dir.path().join("missing-dir").join("out.mkv");

        let result = move_file(&src, &dest);

        assert!(matches!(result, Err(ReplaceError::CopyFailed(_))));
        assert!(src.exists(), "source must survive a failed move");
    }

    fn entries(dir: &Path) -> Vec<String> {
        let mut names: Vec<String> = fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    #[test]
    fn test_copy_into_place_leaves_only_the_destination() {
        let src_dir = TempDir::new().unwrap();
        let dest_dir = TempDir::new().unwrap();
        let src = src_dir.path().join("combined.mkv");
        let dest = dest_dir.path().join("out.mkv");
        write(&src, b"upscaled");
        write(&dest, b"stale");

        copy_into_place(&src, &dest).unwrap();

        assert_eq!(fs::read(&dest).unwrap(), b"upscaled");
        assert_eq!(entries(dest_dir.path()), vec!["out.mkv".to_string()]);
        assert!(src.exists());
    }

    #[test]
    fn test_failed_copy_never_creates_the_destination() {
        let temp_dir = TempDir::new().unwrap();
        let dest_dir = temp_dir.path().join("library");
        fs::create_dir(&dest_dir).unwrap();
        let dest = dest_dir.join("out.mkv");

        // A directory as source makes the copy itself fail
        let err = copy_into_place(temp_dir.path(), &dest);

        assert!(err.is_err());
        assert!(!dest.exists());
        assert!(entries(&dest_dir).is_empty());
    }

    #[test]
    fn test_failed_rename_removes_the_partial_copy() {
        let temp_dir = TempDir::new().unwrap();
        let src = temp_dir.path().join("combined.mkv");
        write(&src, b"upscaled");
        let dest_dir = temp_dir.path().join("library");
        // A non-empty directory at the destination cannot be replaced by a file
        let dest = dest_dir.join("out.mkv");
        fs::create_dir_all(dest.join("occupied")).unwrap();

        assert!(copy_into_place(&src, &dest).is_err());

        assert_eq!(entries(&dest_dir), vec!["out.mkv".to_string()]);
        assert!(dest.is_dir());
        assert_eq!(fs::read(&src).unwrap(), b"upscaled");
    }
}
