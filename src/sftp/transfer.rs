//! SFTP file transfer
//!
//! Thin layer over `russh_sftp` used by the SSH session backend: single-file
//! copies in both directions, `mkdir -p`, and recursive file listing.

use std::future::Future;
use std::path::Path;
use std::pin::Pin;

use russh_sftp::client::error::Error as SftpErrorInner;
use russh_sftp::client::SftpSession as RusshSftpSession;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use super::error::SftpError;
use super::path_utils::{join_remote_path, remote_dir_chain};
use crate::ssh::HandleController;

pub struct SftpTransfer {
    sftp: RusshSftpSession,
}

impl SftpTransfer {
    /// Open the SFTP subsystem on a fresh session channel
    pub async fn open(handle_controller: &HandleController, node: &str) -> Result<Self, SftpError> {
        info!("Opening SFTP subsystem for {}", node);

        let channel = handle_controller
            .open_session_channel()
            .await
            .map_err(|e| SftpError::ChannelError(e.to_string()))?;

        channel.request_subsystem(true, "sftp").await.map_err(|e| {
            SftpError::SubsystemNotAvailable(format!("Failed to request SFTP subsystem: {}", e))
        })?;

        let sftp = RusshSftpSession::new(channel.into_stream())
            .await
            .map_err(|e| SftpError::SubsystemNotAvailable(e.to_string()))?;

        Ok(Self { sftp })
    }

    /// Copy a local file to `remote_path`, truncating any existing file
    pub async fn upload_file(&self, local_path: &Path, remote_path: &str) -> Result<u64, SftpError> {
        let mut local = tokio::fs::File::open(local_path).await.map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => {
                SftpError::FileNotFound(local_path.display().to_string())
            }
            _ => SftpError::IoError(e),
        })?;

        let mut remote = self
            .sftp
            .create(remote_path)
            .await
            .map_err(|e| map_sftp_error(e, remote_path))?;

        let bytes = tokio::io::copy(&mut local, &mut remote).await?;
        remote.shutdown().await?;

        debug!("Uploaded {} bytes to {}", bytes, remote_path);
        Ok(bytes)
    }

    /// Copy `remote_path` to a local file, creating parent directories
    pub async fn download_file(&self, remote_path: &str, local_path: &Path) -> Result<u64, SftpError> {
        let mut remote = self
            .sftp
            .open(remote_path)
            .await
            .map_err(|e| map_sftp_error(e, remote_path))?;

        if let Some(parent) = local_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let mut local = tokio::fs::File::create(local_path).await?;
        let bytes = tokio::io::copy(&mut remote, &mut local).await?;
        local.flush().await?;

        debug!("Downloaded {} bytes from {}", bytes, remote_path);
        Ok(bytes)
    }

    /// `mkdir -p` over SFTP
    pub async fn create_dir_all(&self, remote_path: &str) -> Result<(), SftpError> {
        for dir in remote_dir_chain(remote_path) {
            let exists = self
                .sftp
                .try_exists(&dir)
                .await
                .map_err(|e| map_sftp_error(e, &dir))?;
            if !exists {
                self.sftp
                    .create_dir(&dir)
                    .await
                    .map_err(|e| map_sftp_error(e, &dir))?;
            }
        }
        Ok(())
    }

    /// Every regular file below `remote_dir`, as full remote paths
    pub async fn list_files(&self, remote_dir: &str) -> Result<Vec<String>, SftpError> {
        let mut files = Vec::new();
        self.list_files_inner(remote_dir, &mut files).await?;
        files.sort();
        Ok(files)
    }

    fn list_files_inner<'a>(
        &'a self,
        dir: &'a str,
        files: &'a mut Vec<String>,
    ) -> Pin<Box<dyn Future<Output = Result<(), SftpError>> + Send + 'a>> {
        Box::pin(async move {
            let read_dir = self.sftp.read_dir(dir).await.map_err(|e| match map_sftp_error(e, dir) {
                SftpError::FileNotFound(p) => SftpError::DirectoryNotFound(p),
                other => other,
            })?;

            for entry in read_dir {
                let name = entry.file_name();
                if name == "." || name == ".." {
                    continue;
                }

                let path = join_remote_path(dir, &name);
                let metadata = entry.metadata();

                if metadata.is_dir() {
                    self.list_files_inner(&path, files).await?;
                } else if metadata.is_regular() {
                    files.push(path);
                }
            }

            Ok(())
        })
    }

    pub async fn close(&self) {
        let _ = self.sftp.close().await;
    }
}

/// Map SFTP errors to our error type
fn map_sftp_error(err: SftpErrorInner, path: &str) -> SftpError {
    let err_str = err.to_string();
    if err_str.contains("No such file") || err_str.contains("not found") {
        SftpError::FileNotFound(path.to_string())
    } else if err_str.contains("Permission denied") {
        SftpError::PermissionDenied(path.to_string())
    } else {
        SftpError::ProtocolError(err_str)
    }
}
