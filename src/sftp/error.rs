//! SFTP Error types

use thiserror::Error;

#[derive(Error, Debug)]
pub enum SftpError {
    #[error("SFTP subsystem not available: {0}")]
    SubsystemNotAvailable(String),

    #[error("Channel error: {0}")]
    ChannelError(String),

    #[error("File not found: {0}")]
    FileNotFound(String),

    #[error("Directory not found: {0}")]
    DirectoryNotFound(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("SFTP protocol error: {0}")]
    ProtocolError(String),
}

impl From<russh_sftp::client::error::Error> for SftpError {
    fn from(err: russh_sftp::client::error::Error) -> Self {
        SftpError::ProtocolError(err.to_string())
    }
}
