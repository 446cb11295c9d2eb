use reqwest::{header::AUTHORIZATION, Client, StatusCode, Url};
use std::fmt;
use std::io;
use std::path::Path;
use tokio::io::AsyncWriteExt;

#[derive(Debug)]
pub enum DownloadError {
    Http(reqwest::Error),
    Status(StatusCode),
    Io(io::Error),
}

impl fmt::Display for DownloadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Http(err) => write!(f, "download http error: {err}"),
            Self::Status(status) => write!(f, "download failed: {status}"),
            Self::Io(err) => write!(f, "download io error: {err}"),
        }
    }
}

impl std::error::Error for DownloadError {}

/// Streams a bearer-authenticated GET into `dest`, creating parent
/// directories as needed.
pub async fn download_file(
    http: &Client,
    url: Url,
    bearer: &str,
    dest: &Path,
) -> Result<(), DownloadError> {
    let mut resp = http
        .get(url)
        .header(AUTHORIZATION, format!("Bearer {bearer}"))
        .send()
        .await
        .map_err(DownloadError::Http)?;
    if !resp.status().is_success() {
        return Err(DownloadError::Status(resp.status()));
    }

    if let Some(parent) = dest.parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(DownloadError::Io)?;
        }
    }

    // Stage next to the destination and rename once complete, so an
    // interrupted transfer never leaves a truncated file at `dest`.
    let staging = staging_path(dest);
    let mut file = tokio::fs::File::create(&staging)
        .await
        .map_err(DownloadError::Io)?;
    let written = async {
        while let Some(chunk) = resp.chunk().await.map_err(DownloadError::Http)? {
            file.write_all(&chunk).await.map_err(DownloadError::Io)?;
        }
        file.flush().await.map_err(DownloadError::Io)
    }
    .await;
    drop(file);

    match written {
        Ok(()) => tokio::fs::rename(&staging, dest)
            .await
            .map_err(DownloadError::Io),
        Err(err) => {
            let _ = tokio::fs::remove_file(&staging).await;
            Err(err)
        }
    }
}

fn staging_path(dest: &Path) -> std::path::PathBuf {
    let name = dest
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("download");
    dest.with_file_name(format!("{name}.part"))
}
