//! SFTP file transfer module
//!
//! Single-file transfers, remote directory listing and the include/exclude
//! filters used by directory downloads.

pub mod error;
pub mod filter;
pub mod path_utils;
mod transfer;

pub use error::SftpError;
pub use filter::{GlobPattern, TransferFilter};
pub use transfer::SftpTransfer;
