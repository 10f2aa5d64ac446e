// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use {
    crate::error::{Result, SrpmPackagingError},
    std::{
        path::{Path, PathBuf},
        time::SystemTime,
    },
    walkdir::WalkDir,
};

fn io_path_error(path: &Path, e: impl Into<std::io::Error>) -> SrpmPackagingError {
    SrpmPackagingError::IoPath(path.display().to_string(), e.into())
}

/// Whether `path` names an existing regular file.
pub fn is_file(path: &Path) -> bool {
    std::fs::metadata(path)
        .map(|metadata| metadata.is_file())
        .unwrap_or(false)
}

/// Copy a file, creating the destination's parent directories as needed.
pub fn copy_file(source: &Path, destination: &Path) -> Result<()> {
    if let Some(parent) = destination.parent() {
        std::fs::create_dir_all(parent).map_err(|e| io_path_error(parent, e))?;
    }

    std::fs::copy(source, destination).map_err(|e| io_path_error(source, e))?;

    Ok(())
}

/// Recursively copy the contents of one directory into another.
pub fn copy_directory_contents(source: &Path, destination: &Path) -> Result<()> {
    for entry in WalkDir::new(source) {
        let entry = entry.map_err(|e| io_path_error(source, e))?;
        let relative = entry
            .path()
            .strip_prefix(source)
            .map_err(|_| io_path_error(entry.path(), std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "walked path escapes the source directory",
            )))?;

        let target = destination.join(relative);
        if entry.file_type().is_dir() {
            std::fs::create_dir_all(&target).map_err(|e| io_path_error(&target, e))?;
        } else if entry.file_type().is_file() {
            copy_file(entry.path(), &target)?;
        }
    }

    Ok(())
}

/// Find the most recently modified entry under a directory.
///
/// Every entry in the tree is considered, directories included, so a change
/// anywhere below `directory` moves the returned timestamp forward.
pub fn last_modified_file(directory: &Path) -> Result<(SystemTime, PathBuf)> {
    let mut latest: Option<(SystemTime, PathBuf)> = None;

    for entry in WalkDir::new(directory) {
        let entry = entry.map_err(|e| io_path_error(directory, e))?;
        let modified = entry
            .metadata()
            .map_err(|e| io_path_error(entry.path(), e))?
            .modified()
            .map_err(|e| io_path_error(entry.path(), e))?;

        let newer = match &latest {
            Some((time, _)) => modified > *time,
            None => true,
        };
        if newer {
            latest = Some((modified, entry.path().to_path_buf()));
        }
    }

    latest.ok_or_else(|| {
        io_path_error(
            directory,
            std::io::Error::new(std::io::ErrorKind::NotFound, "directory has no entries"),
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::{create_dir_all, write};

    #[test]
    fn test_copy_file_creates_parents() {
        let td = tempfile::Builder::new()
            .prefix("srpm-packaging-test")
            .tempdir()
            .unwrap();

        let source = td.path().join("source.txt");
        write(&source, b"data").unwrap();

        let destination = td.path().join("a/b/c/destination.txt");
        copy_file(&source, &destination).unwrap();

        assert_eq!(std::fs::read(&destination).unwrap(), b"data");
    }

    #[test]
    fn test_copy_directory_contents() {
        let td = tempfile::Builder::new()
            .prefix("srpm-packaging-test")
            .tempdir()
            .unwrap();

        let source = td.path().join("source");
        create_dir_all(source.join("nested")).unwrap();
        write(source.join("top.txt"), b"top").unwrap();
        write(source.join("nested/deep.txt"), b"deep").unwrap();

        let destination = td.path().join("destination");
        copy_directory_contents(&source, &destination).unwrap();

        assert_eq!(std::fs::read(destination.join("top.txt")).unwrap(), b"top");
        assert_eq!(
            std::fs::read(destination.join("nested/deep.txt")).unwrap(),
            b"deep"
        );
    }

    #[test]
    fn test_last_modified_file_finds_newest() {
        let td = tempfile::Builder::new()
            .prefix("srpm-packaging-test")
            .tempdir()
            .unwrap();

        let older = td.path().join("older.txt");
        write(&older, b"older").unwrap();

        // Push the second file's mtime well past the first regardless of
        // filesystem timestamp granularity.
        let newer = td.path().join("nested/newer.txt");
        create_dir_all(newer.parent().unwrap()).unwrap();
        write(&newer, b"newer").unwrap();
        let future = filetime::FileTime::from_system_time(
            SystemTime::now() + std::time::Duration::from_secs(60),
        );
        filetime::set_file_mtime(&newer, future).unwrap();

        let (_, path) = last_modified_file(td.path()).unwrap();
        assert_eq!(path, newer);
    }
}
