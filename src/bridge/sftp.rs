//! SFTP bridge
//!
//! File-manager operations over the session's SFTP subsystem channel.
//! Operations are idempotent where the protocol allows (removing a
//! missing file succeeds; mkdir over an existing directory succeeds).
//! Reads and writes stream in 256 KiB chunks with progress events.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use russh_sftp::client::error::Error as SftpErrorInner;
use russh_sftp::client::SftpSession as RusshSftpSession;
use russh_sftp::protocol::{FileAttributes, OpenFlags};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, info, warn};

use crate::protocol::{EventSender, FileEntry, ServerMessage};
use crate::ssh::{HandleController, SshError};

/// Streaming chunk size for file transfers
pub const TRANSFER_CHUNK: usize = 256 * 1024;

/// SFTP session bound to one files tab
pub struct FilesBridge {
    sftp: RusshSftpSession,
    events: EventSender,
}

impl FilesBridge {
    /// Open the SFTP subsystem on a fresh session channel
    pub async fn open(
        controller: &HandleController,
        events: EventSender,
    ) -> Result<Self, SshError> {
        info!("Opening SFTP subsystem");

        let channel = controller.open_session_channel().await?;
        channel
            .request_subsystem(true, "sftp")
            .await
            .map_err(|e| SshError::ChannelError(format!("SFTP subsystem request failed: {}", e)))?;

        let sftp = RusshSftpSession::new(channel.into_stream())
            .await
            .map_err(|e| SshError::ChannelError(format!("SFTP handshake failed: {}", e)))?;

        Ok(Self { sftp, events })
    }

    /// List a directory, sorted directories-first
    pub async fn list(&self, path: &str) -> Result<(), SshError> {
        let canonical = self.canonicalize(path).await?;
        debug!(path = %canonical, "SFTP list");

        let read_dir = self
            .sftp
            .read_dir(&canonical)
            .await
            .map_err(|e| map_sftp_error(e, &canonical))?;

        let mut entries = Vec::new();
        for entry in read_dir {
            let name = entry.file_name();
            if name == "." || name == ".." {
                continue;
            }
            let full_path = join_remote(&canonical, &name);
            entries.push(to_file_entry(&name, &full_path, &entry.metadata()));
        }

        entries.sort_by(|a, b| {
            let a_dir = a.kind == "directory";
            let b_dir = b.kind == "directory";
            b_dir
                .cmp(&a_dir)
                .then_with(|| a.name.to_lowercase().cmp(&b.name.to_lowercase()))
        });

        let _ = self
            .events
            .send(ServerMessage::FileListResult {
                path: canonical,
                entries,
            })
            .await;
        Ok(())
    }

    pub async fn stat(&self, path: &str) -> Result<(), SshError> {
        let canonical = self.canonicalize(path).await?;
        let attrs = self
            .sftp
            .metadata(&canonical)
            .await
            .map_err(|e| map_sftp_error(e, &canonical))?;

        let name = canonical
            .rsplit('/')
            .next()
            .filter(|s| !s.is_empty())
            .unwrap_or("/")
            .to_string();

        let _ = self
            .events
            .send(ServerMessage::FileStatResult {
                entry: to_file_entry(&name, &canonical, &attrs),
            })
            .await;
        Ok(())
    }

    /// Create a directory; succeeding over an existing directory is fine
    pub async fn mkdir(&self, path: &str) -> Result<(), SshError> {
        match self.sftp.create_dir(path).await {
            Ok(()) => {}
            Err(e) => {
                let already_there = matches!(
                    self.sftp.metadata(path).await,
                    Ok(attrs) if attrs.is_dir()
                );
                if !already_there {
                    return Err(map_sftp_error(e, path));
                }
            }
        }
        let _ = self
            .events
            .send(ServerMessage::FileDone {
                op: "mkdir".into(),
                path: path.to_string(),
            })
            .await;
        Ok(())
    }

    /// Remove a file or an empty directory; missing targets succeed
    pub async fn remove(&self, path: &str) -> Result<(), SshError> {
        let result = match self.sftp.metadata(path).await {
            Ok(attrs) if attrs.is_dir() => self.sftp.remove_dir(path).await,
            Ok(_) => self.sftp.remove_file(path).await,
            Err(e) if is_not_found(&e) => Ok(()),
            Err(e) => Err(e),
        };

        match result {
            Ok(()) => {}
            Err(e) if is_not_found(&e) => {}
            Err(e) => return Err(map_sftp_error(e, path)),
        }

        let _ = self
            .events
            .send(ServerMessage::FileDone {
                op: "remove".into(),
                path: path.to_string(),
            })
            .await;
        Ok(())
    }

    pub async fn rename(&self, from: &str, to: &str) -> Result<(), SshError> {
        self.sftp
            .rename(from, to)
            .await
            .map_err(|e| map_sftp_error(e, from))?;
        let _ = self
            .events
            .send(ServerMessage::FileDone {
                op: "move".into(),
                path: to.to_string(),
            })
            .await;
        Ok(())
    }

    pub async fn chmod(&self, path: &str, mode: u32) -> Result<(), SshError> {
        let attrs = FileAttributes {
            permissions: Some(mode),
            ..Default::default()
        };
        self.sftp
            .set_metadata(path, attrs)
            .await
            .map_err(|e| map_sftp_error(e, path))?;
        let _ = self
            .events
            .send(ServerMessage::FileDone {
                op: "chmod".into(),
                path: path.to_string(),
            })
            .await;
        Ok(())
    }

    pub async fn chown(&self, path: &str, uid: u32, gid: u32) -> Result<(), SshError> {
        let attrs = FileAttributes {
            uid: Some(uid),
            gid: Some(gid),
            ..Default::default()
        };
        self.sftp
            .set_metadata(path, attrs)
            .await
            .map_err(|e| map_sftp_error(e, path))?;
        let _ = self
            .events
            .send(ServerMessage::FileDone {
                op: "chown".into(),
                path: path.to_string(),
            })
            .await;
        Ok(())
    }

    /// Stream a file to the browser in base64 chunks with progress
    pub async fn read_file(&self, path: &str) -> Result<(), SshError> {
        let total = self
            .sftp
            .metadata(path)
            .await
            .ok()
            .and_then(|a| a.size);

        let mut file = self
            .sftp
            .open_with_flags(path, OpenFlags::READ)
            .await
            .map_err(|e| map_sftp_error(e, path))?;

        let mut buf = vec![0u8; TRANSFER_CHUNK];
        let mut offset: u64 = 0;

        loop {
            let n = file
                .read(&mut buf)
                .await
                .map_err(|e| SshError::ChannelError(format!("SFTP read failed: {}", e)))?;
            let eof = n == 0;

            let _ = self
                .events
                .send(ServerMessage::FileData {
                    path: path.to_string(),
                    data: BASE64.encode(&buf[..n]),
                    offset,
                    eof,
                })
                .await;

            if eof {
                break;
            }
            offset += n as u64;

            let _ = self
                .events
                .send(ServerMessage::FileProgress {
                    path: path.to_string(),
                    bytes: offset,
                    total,
                })
                .await;
        }

        debug!(path, bytes = offset, "SFTP read complete");
        Ok(())
    }

    /// Write one base64 chunk; `append` continues a previous write
    pub async fn write_file(&self, path: &str, data_b64: &str, append: bool) -> Result<(), SshError> {
        let bytes = BASE64
            .decode(data_b64)
            .map_err(|e| SshError::InvalidInput(format!("Bad base64 payload: {}", e)))?;

        let flags = if append {
            OpenFlags::WRITE | OpenFlags::APPEND
        } else {
            OpenFlags::CREATE | OpenFlags::TRUNCATE | OpenFlags::WRITE
        };

        let mut file = self
            .sftp
            .open_with_flags(path, flags)
            .await
            .map_err(|e| map_sftp_error(e, path))?;

        for chunk in bytes.chunks(TRANSFER_CHUNK) {
            file.write_all(chunk)
                .await
                .map_err(|e| SshError::ChannelError(format!("SFTP write failed: {}", e)))?;
        }
        file.shutdown()
            .await
            .map_err(|e| SshError::ChannelError(format!("SFTP close failed: {}", e)))?;

        let _ = self
            .events
            .send(ServerMessage::FileProgress {
                path: path.to_string(),
                bytes: bytes.len() as u64,
                total: None,
            })
            .await;
        let _ = self
            .events
            .send(ServerMessage::FileDone {
                op: "write".into(),
                path: path.to_string(),
            })
            .await;

        debug!(path, bytes = bytes.len(), append, "SFTP write complete");
        Ok(())
    }

    async fn canonicalize(&self, path: &str) -> Result<String, SshError> {
        if path.is_empty() || path == "." {
            return self
                .sftp
                .canonicalize(".")
                .await
                .map_err(|e| map_sftp_error(e, "."));
        }
        match self.sftp.canonicalize(path).await {
            Ok(p) => Ok(p),
            Err(e) => {
                warn!(path, "Canonicalize failed: {}", e);
                Err(map_sftp_error(e, path))
            }
        }
    }
}

fn to_file_entry(name: &str, path: &str, attrs: &FileAttributes) -> FileEntry {
    let kind = if attrs.is_dir() {
        "directory"
    } else if attrs.is_symlink() {
        "symlink"
    } else if attrs.is_regular() {
        "file"
    } else {
        "other"
    };

    FileEntry {
        name: name.to_string(),
        path: path.to_string(),
        kind: kind.to_string(),
        size: attrs.size.unwrap_or(0),
        modified: attrs.mtime.map(|t| t as i64).unwrap_or(0),
        permissions: attrs.permissions.map(|p| p & 0o7777),
        owner: attrs.uid.map(|u| u.to_string()),
        group: attrs.gid.map(|g| g.to_string()),
        is_symlink: attrs.is_symlink(),
    }
}

fn join_remote(dir: &str, name: &str) -> String {
    if dir.ends_with('/') {
        format!("{}{}", dir, name)
    } else {
        format!("{}/{}", dir, name)
    }
}

fn is_not_found(e: &SftpErrorInner) -> bool {
    e.to_string().to_lowercase().contains("no such file")
}

fn map_sftp_error(e: SftpErrorInner, path: &str) -> SshError {
    SshError::ChannelError(format!("SFTP error on {}: {}", path, e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn join_remote_handles_root() {
        assert_eq!(join_remote("/", "etc"), "/etc");
        assert_eq!(join_remote("/home/user", "file"), "/home/user/file");
    }

    #[test]
    fn entry_kind_mapping() {
        let dir_attrs = FileAttributes {
            permissions: Some(0o040755),
            ..Default::default()
        };
        let entry = to_file_entry("srv", "/srv", &dir_attrs);
        assert_eq!(entry.kind, "directory");
        assert_eq!(entry.permissions, Some(0o755));
    }
}
