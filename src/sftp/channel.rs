//! SFTP channel seam and its russh-sftp implementation

use async_trait::async_trait;
use russh::client::Msg;
use russh::Channel;
use russh_sftp::client::SftpSession as RusshSftpSession;
use russh_sftp::protocol::{FileAttributes, OpenFlags};
use tokio::io::{AsyncRead, AsyncSeekExt, AsyncWrite};
use tracing::{debug, info};

use super::error::SftpError;
use super::types::{remote_file_name, DirEntry, FileType};

/// Remote file opened for writing
pub type RemoteWriter = Box<dyn AsyncWrite + Send + Unpin>;
/// Remote file opened for reading
pub type RemoteReader = Box<dyn AsyncRead + Send + Unpin>;

/// File-transfer channel over an established connection
#[async_trait]
pub trait SftpChannel: Send + Sync {
    /// List `path`, without `.` and `..`
    async fn read_dir(&self, path: &str) -> Result<Vec<DirEntry>, SftpError>;

    async fn stat(&self, path: &str) -> Result<DirEntry, SftpError>;

    /// Open `path` for writing at `offset`. Offset 0 creates or truncates.
    async fn open_write(&self, path: &str, offset: u64) -> Result<RemoteWriter, SftpError>;

    /// Open `path` for reading from `offset`
    async fn open_read(&self, path: &str, offset: u64) -> Result<RemoteReader, SftpError>;

    async fn rename(&self, from: &str, to: &str) -> Result<(), SftpError>;

    async fn remove_file(&self, path: &str) -> Result<(), SftpError>;

    async fn create_dir(&self, path: &str) -> Result<(), SftpError>;

    async fn close(&self) -> Result<(), SftpError>;
}

/// SFTP subsystem on a russh session channel
pub struct RusshSftpChannel {
    sftp: RusshSftpSession,
    session_id: String,
}

impl RusshSftpChannel {
    /// Request the sftp subsystem on `channel` and start the client
    pub async fn open(channel: Channel<Msg>, session_id: &str) -> Result<Self, SftpError> {
        info!("Opening SFTP subsystem for session {}", session_id);

        channel
            .request_subsystem(true, "sftp")
            .await
            .map_err(|e| SftpError::Channel(format!("Failed to request SFTP subsystem: {}", e)))?;

        let sftp = RusshSftpSession::new(channel.into_stream())
            .await
            .map_err(|e| SftpError::Channel(e.to_string()))?;

        info!("SFTP subsystem opened for session {}", session_id);

        Ok(Self {
            sftp,
            session_id: session_id.to_string(),
        })
    }
}

fn entry_from_metadata(name: String, metadata: &FileAttributes) -> DirEntry {
    let file_type = if metadata.is_dir() {
        FileType::Directory
    } else if metadata.is_symlink() {
        FileType::Symlink
    } else {
        FileType::File
    };

    DirEntry {
        name,
        file_type,
        size: metadata.size.unwrap_or(0),
        modified_time: metadata.mtime.map(|t| t as i64).unwrap_or(0),
    }
}

#[async_trait]
impl SftpChannel for RusshSftpChannel {
    async fn read_dir(&self, path: &str) -> Result<Vec<DirEntry>, SftpError> {
        let read_dir = self
            .sftp
            .read_dir(path)
            .await
            .map_err(|e| SftpError::from_remote(e, path))?;

        let mut entries = Vec::new();
        for entry in read_dir {
            let name = entry.file_name();
            if name == "." || name == ".." {
                continue;
            }
            let metadata = entry.metadata();
            entries.push(entry_from_metadata(name, &metadata));
        }

        debug!(
            "Listed {} entries in {} for session {}",
            entries.len(),
            path,
            self.session_id
        );
        Ok(entries)
    }

    async fn stat(&self, path: &str) -> Result<DirEntry, SftpError> {
        let metadata = self
            .sftp
            .metadata(path)
            .await
            .map_err(|e| SftpError::from_remote(e, path))?;
        Ok(entry_from_metadata(
            remote_file_name(path).to_string(),
            &metadata,
        ))
    }

    async fn open_write(&self, path: &str, offset: u64) -> Result<RemoteWriter, SftpError> {
        if offset == 0 {
            let file = self
                .sftp
                .create(path)
                .await
                .map_err(|e| SftpError::from_remote(e, path))?;
            return Ok(Box::new(file));
        }

        let mut file = self
            .sftp
            .open_with_flags(path, OpenFlags::WRITE)
            .await
            .map_err(|e| SftpError::from_remote(e, path))?;
        file.seek(std::io::SeekFrom::Start(offset))
            .await
            .map_err(|e| SftpError::from_io(e, path))?;
        Ok(Box::new(file))
    }

    async fn open_read(&self, path: &str, offset: u64) -> Result<RemoteReader, SftpError> {
        let mut file = self
            .sftp
            .open(path)
            .await
            .map_err(|e| SftpError::from_remote(e, path))?;
        if offset > 0 {
            file.seek(std::io::SeekFrom::Start(offset))
                .await
                .map_err(|e| SftpError::from_io(e, path))?;
        }
        Ok(Box::new(file))
    }

    async fn rename(&self, from: &str, to: &str) -> Result<(), SftpError> {
        self.sftp
            .rename(from, to)
            .await
            .map_err(|e| SftpError::from_remote(e, from))
    }

    async fn remove_file(&self, path: &str) -> Result<(), SftpError> {
        self.sftp
            .remove_file(path)
            .await
            .map_err(|e| SftpError::from_remote(e, path))
    }

    async fn create_dir(&self, path: &str) -> Result<(), SftpError> {
        self.sftp
            .create_dir(path)
            .await
            .map_err(|e| SftpError::from_remote(e, path))
    }

    async fn close(&self) -> Result<(), SftpError> {
        info!("Closing SFTP subsystem for session {}", self.session_id);
        self.sftp
            .close()
            .await
            .map_err(|e| SftpError::Channel(e.to_string()))
    }
}
