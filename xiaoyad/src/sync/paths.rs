use std::io;
use std::path::{Component, Path, PathBuf};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PathError {
    #[error("remote path is empty")]
    Empty,
    #[error("remote path contains unsupported component: {0}")]
    UnsupportedComponent(String),
}

/// Maps a POSIX remote path ("/电影/A/A.nfo") under `root`.
pub fn local_path_for(root: &Path, remote_path: &str) -> Result<PathBuf, PathError> {
    if remote_path.is_empty() {
        return Err(PathError::Empty);
    }

    let mut out = root.to_path_buf();
    for component in Path::new(remote_path).components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::RootDir | Component::CurDir => continue,
            Component::ParentDir | Component::Prefix(_) => {
                return Err(PathError::UnsupportedComponent(remote_path.to_string()));
            }
        }
    }
    Ok(out)
}

/// Removes `start` and then each ancestor while it is empty, stopping
/// before `root`. Missing directories count as already removed.
pub async fn remove_empty_dirs(start: &Path, root: &Path) -> io::Result<()> {
    let mut current = start.to_path_buf();
    while current != root && current.starts_with(root) {
        match tokio::fs::remove_dir(&current).await {
            Ok(()) => tracing::debug!(dir = %current.display(), "removed empty directory"),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) if err.kind() == io::ErrorKind::DirectoryNotEmpty => return Ok(()),
            Err(err) => {
                // Some platforms report a non-empty directory differently.
                if has_entries(&current).await? {
                    return Ok(());
                }
                return Err(err);
            }
        }
        if !current.pop() {
            break;
        }
    }
    Ok(())
}

/// Removes a file, treating a missing file as success.
pub async fn remove_file_if_exists(path: &Path) -> io::Result<bool> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(true),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(err) => Err(err),
    }
}

async fn has_entries(dir: &Path) -> io::Result<bool> {
    let mut entries = tokio::fs::read_dir(dir).await?;
    Ok(entries.next_entry().await?.is_some())
}
