//! SFTP file management module
//!
//! Remote directory browsing plus resumable uploads and downloads over a
//! secondary channel of an existing connection.

mod channel;
mod engine;
mod error;
mod transfer;
mod types;

pub use channel::{RemoteReader, RemoteWriter, RusshSftpChannel, SftpChannel};
pub use engine::{SftpTransferEngine, PART_SUFFIX};
pub use error::SftpError;
pub use transfer::{TransferControl, TransferGuard, TransferManager, TransferRequest};
pub use types::*;
