//! Scratch workspaces: one uniquely named directory per run.
//!
//! A [`Workspace`] removes its directory when dropped, so every exit path of
//! a run releases it. [`Workspace::close`] does the same removal explicitly
//! and reports failures.

use std::fs;
use std::path::{Path, PathBuf};

use uuid::Uuid;

use crate::error::{Result, VikiError};

const PREFIX: &str = "viki-";

#[derive(Debug)]
pub struct Workspace {
    path: PathBuf,
    removed: bool,
}

impl Workspace {
    /// Creates `<root>/viki-<uuid>`. The name is random, so concurrent runs
    /// never share a directory.
    pub fn allocate(root: &Path) -> Result<Self> {
        let path = root.join(format!("{PREFIX}{}", Uuid::new_v4()));
        fs::create_dir(&path)
            .map_err(|e| VikiError::resource("failed to allocate workspace", e))?;
        tracing::debug!(path = %path.display(), "Workspace allocated");
        Ok(Self {
            path,
            removed: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Removes the directory tree now.
    pub fn close(mut self) -> Result<()> {
        self.removed = true;
        remove(&self.path).map_err(|e| VikiError::resource("failed to remove workspace", e))
    }
}

impl Drop for Workspace {
    fn drop(&mut self) {
        if self.removed {
            return;
        }
        if let Err(e) = remove(&self.path) {
            tracing::warn!(path = %self.path.display(), error = %e, "Failed to remove workspace");
        }
    }
}

fn remove(path: &Path) -> std::io::Result<()> {
    match fs::remove_dir_all(path) {
        Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e),
        _ => {
            tracing::debug!(path = %path.display(), "Workspace removed");
            Ok(())
        }
    }
}
