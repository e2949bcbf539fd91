//! Destination directory checks performed before any stream bytes are
//! written. Extraction refuses to mix a backup into a directory that already
//! has contents.

use std::fs;
use std::io;
use std::path::Path;

use crate::error::{BackupError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirState {
    Missing,
    Empty,
    NonEmpty,
}

pub fn check_dir(path: &Path) -> io::Result<DirState> {
    match fs::read_dir(path) {
        Ok(mut entries) => {
            if entries.next().is_some() {
                Ok(DirState::NonEmpty)
            } else {
                Ok(DirState::Empty)
            }
        }
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(DirState::Missing),
        Err(err) => Err(err),
    }
}

/// Require `path` to be an empty directory, creating it (and any missing
/// parents) when absent.
pub fn verify_dir_is_empty_or_create(path: &Path) -> Result<()> {
    match check_dir(path)? {
        DirState::Missing => {
            fs::create_dir_all(path)?;
            Ok(())
        }
        DirState::Empty => Ok(()),
        DirState::NonEmpty => Err(BackupError::Precondition(format!(
            "directory \"{}\" exists but is not empty",
            path.display()
        ))),
    }
}
