use std::io;
use std::path::{Path, PathBuf};

use futures_util::StreamExt;
use reqwest::Response;
use thiserror::Error;
use tokio::io::AsyncWriteExt;

#[derive(Debug, Error)]
pub enum TransferError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl TransferError {
    fn io(path: &Path) -> impl FnOnce(io::Error) -> Self + '_ {
        move |source| TransferError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Streams the response body to `target` through a `.partial` sibling.
/// Returns the number of bytes written.
pub async fn write_response(response: Response, target: &Path) -> Result<u64, TransferError> {
    create_parent(target).await?;
    let partial = partial_path(target);
    let result = match stream_to(response, &partial).await {
        Ok(written) => publish(&partial, target).await.map(|()| written),
        Err(err) => Err(err),
    };
    discard_on_error(result, &partial).await
}

/// Copies `source` to `target` through a `.partial` sibling.
pub async fn copy_file(source: &Path, target: &Path) -> Result<u64, TransferError> {
    create_parent(target).await?;
    let partial = partial_path(target);
    let result = match tokio::fs::copy(source, &partial).await {
        Ok(copied) => publish(&partial, target).await.map(|()| copied),
        Err(err) => Err(TransferError::io(source)(err)),
    };
    discard_on_error(result, &partial).await
}

/// Writes `contents` unless `target` already holds exactly those bytes.
/// Returns whether the file was written.
pub async fn write_if_changed(target: &Path, contents: &[u8]) -> Result<bool, TransferError> {
    match tokio::fs::read(target).await {
        Ok(existing) if existing == contents => return Ok(false),
        Ok(_) => {}
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(err) => return Err(TransferError::io(target)(err)),
    }
    create_parent(target).await?;
    let partial = partial_path(target);
    let result = match tokio::fs::write(&partial, contents).await {
        Ok(()) => publish(&partial, target).await,
        Err(err) => Err(TransferError::io(&partial)(err)),
    };
    discard_on_error(result, &partial).await.map(|()| true)
}

async fn stream_to(response: Response, partial: &Path) -> Result<u64, TransferError> {
    let mut file = tokio::fs::File::create(partial)
        .await
        .map_err(TransferError::io(partial))?;
    let mut stream = response.bytes_stream();
    let mut written = 0u64;
    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        file.write_all(&chunk)
            .await
            .map_err(TransferError::io(partial))?;
        written += chunk.len() as u64;
    }
    file.flush().await.map_err(TransferError::io(partial))?;
    file.sync_all().await.map_err(TransferError::io(partial))?;
    Ok(written)
}

async fn publish(partial: &Path, target: &Path) -> Result<(), TransferError> {
    tokio::fs::rename(partial, target)
        .await
        .map_err(TransferError::io(target))
}

/// No `.partial` file outlives a failed transfer.
async fn discard_on_error<T>(
    result: Result<T, TransferError>,
    partial: &Path,
) -> Result<T, TransferError> {
    if result.is_err() {
        if let Err(err) = tokio::fs::remove_file(partial).await {
            if err.kind() != io::ErrorKind::NotFound {
                tracing::warn!(path = %partial.display(), error = %err, "failed to remove partial file");
            }
        }
    }
    result
}

async fn create_parent(target: &Path) -> Result<(), TransferError> {
    if let Some(parent) = target.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(TransferError::io(parent))?;
    }
    Ok(())
}

fn partial_path(target: &Path) -> PathBuf {
    target.with_extension(format!(
        "{}partial",
        target
            .extension()
            .map(|ext| format!("{}.", ext.to_string_lossy()))
            .unwrap_or_default()
    ))
}
