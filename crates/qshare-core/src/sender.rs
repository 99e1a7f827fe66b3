//! Sending side of a transfer: one connection, any number of files.

use crate::cipher::EncryptingWriter;
use crate::error::TransferError;
use crate::keys::TransferKey;
use crate::protocol::{self, FileHeader, CHUNK_SIZE};
use crate::session::TransferSession;
use discovery::PeerRegistry;
use serde::Serialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

/// Why a path was left out of the transfer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum SkipReason {
    /// The path could not be stat'ed or opened.
    Unreadable(String),
    /// Directories are not expanded.
    IsDirectory,
    /// The name cannot be carried by a metadata line.
    InvalidFilename,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum FileOutcome {
    Sent { bytes: u64 },
    /// Reading stopped early. The rest of the declared size was sent as
    /// zeros so the following files stay framed.
    Truncated { read: u64, declared: u64 },
    Skipped(SkipReason),
}

#[derive(Debug, Clone, Serialize)]
pub struct FileReport {
    pub path: PathBuf,
    pub outcome: FileOutcome,
}

/// Result of one `send` call, one entry per requested path in order.
#[derive(Debug, Clone, Serialize)]
pub struct TransferSummary {
    pub peer: SocketAddr,
    pub files: Vec<FileReport>,
    pub bytes: u64,
}

impl TransferSummary {
    pub fn sent_count(&self) -> usize {
        self.files
            .iter()
            .filter(|f| matches!(f.outcome, FileOutcome::Sent { .. }))
            .count()
    }

    pub fn skipped(&self) -> impl Iterator<Item = &FileReport> {
        self.files
            .iter()
            .filter(|f| matches!(f.outcome, FileOutcome::Skipped(_)))
    }
}

#[derive(Clone)]
pub struct Sender {
    registry: PeerRegistry,
    key: TransferKey,
    transfer_port: u16,
    chunk_size: usize,
}

impl Sender {
    pub fn new(registry: PeerRegistry, key: TransferKey, transfer_port: u16) -> Self {
        Self {
            registry,
            key,
            transfer_port,
            chunk_size: CHUNK_SIZE,
        }
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    /// Send `paths`, in order, to the peer announced as `target`.
    ///
    /// Fails before any network I/O if `target` has not been discovered.
    pub async fn send<P: AsRef<Path>>(
        &self,
        paths: &[P],
        target: &str,
    ) -> Result<TransferSummary, TransferError> {
        let ip = self
            .registry
            .get(target)
            .ok_or_else(|| TransferError::PeerUnknown(target.to_string()))?;

        self.send_to(paths, SocketAddr::new(ip, self.transfer_port))
            .await
    }

    /// Send `paths` to an explicit address, bypassing the registry.
    pub async fn send_to<P: AsRef<Path>>(
        &self,
        paths: &[P],
        addr: SocketAddr,
    ) -> Result<TransferSummary, TransferError> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|source| TransferError::Connect { addr, source })?;
        tracing::info!("Connected to {} (key {})", addr, self.key.fingerprint());

        let mut writer = EncryptingWriter::new(&self.key, stream);
        let mut session = TransferSession::new(addr);
        let mut files = Vec::with_capacity(paths.len());

        for path in paths {
            let path = path.as_ref();
            let outcome = self.send_file(&mut writer, path, &mut session).await?;
            files.push(FileReport {
                path: path.to_path_buf(),
                outcome,
            });
        }

        writer.shutdown().await?;
        tracing::info!(
            "Sent {} file(s), {} bytes to {} in {:.1?} ({:.2} MiB/s)",
            session.files_done(),
            session.total_bytes(),
            addr,
            session.elapsed(),
            session.rate_mib()
        );

        Ok(TransferSummary {
            peer: addr,
            files,
            bytes: session.total_bytes(),
        })
    }

    /// Stream one file. Only errors on the connection itself are returned;
    /// problems with the local file are reported in the outcome.
    async fn send_file<W>(
        &self,
        writer: &mut EncryptingWriter<W>,
        path: &Path,
        session: &mut TransferSession,
    ) -> std::io::Result<FileOutcome>
    where
        W: AsyncWrite + Unpin,
    {
        let meta = match tokio::fs::metadata(path).await {
            Ok(meta) => meta,
            Err(e) => {
                tracing::warn!("Could not access {}: {}", path.display(), e);
                return Ok(FileOutcome::Skipped(SkipReason::Unreadable(e.to_string())));
            }
        };
        if meta.is_dir() {
            tracing::warn!("Skipping directory {}", path.display());
            return Ok(FileOutcome::Skipped(SkipReason::IsDirectory));
        }

        let header = match path
            .file_name()
            .and_then(|n| n.to_str())
            .map(|name| FileHeader::new(name, meta.len()))
        {
            Some(Ok(header)) => header,
            _ => {
                tracing::warn!("Skipping {}: unsupported file name", path.display());
                return Ok(FileOutcome::Skipped(SkipReason::InvalidFilename));
            }
        };

        let file = match File::open(path).await {
            Ok(file) => file,
            Err(e) => {
                tracing::warn!("Could not open {}: {}", path.display(), e);
                return Ok(FileOutcome::Skipped(SkipReason::Unreadable(e.to_string())));
            }
        };

        protocol::write_header(writer, &header).await?;
        tracing::info!(
            "Sending {} ({:.2} MB)",
            header.filename,
            header.size as f64 / (1024.0 * 1024.0)
        );

        let declared = header.size;
        session.begin(header);
        let read = self
            .stream_payload(file.take(declared), writer, session)
            .await?;

        if read < declared {
            pad_zeros(writer, declared - read, self.chunk_size, session).await?;
        }
        writer.flush().await?;

        if let Some((header, bytes)) = session.finish() {
            tracing::debug!("Finished {} ({} bytes on the wire)", header.filename, bytes);
        }

        if read < declared {
            tracing::warn!(
                "{} ended after {} of {} bytes; remainder sent as zeros",
                path.display(),
                read,
                declared
            );
            Ok(FileOutcome::Truncated { read, declared })
        } else {
            tracing::info!("Sent {}", path.display());
            Ok(FileOutcome::Sent { bytes: declared })
        }
    }

    /// Copy file bytes through the cipher. Returns how many bytes the file
    /// yielded before EOF or a read error.
    async fn stream_payload<R, W>(
        &self,
        mut file: R,
        writer: &mut EncryptingWriter<W>,
        session: &mut TransferSession,
    ) -> std::io::Result<u64>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut buf = vec![0u8; self.chunk_size];
        let mut read = 0u64;
        loop {
            let n = match file.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) => {
                    tracing::warn!("Error reading file: {}", e);
                    break;
                }
            };
            writer.write_all(&buf[..n]).await?;
            read += n as u64;
            session.advance(n);
        }
        Ok(read)
    }
}

async fn pad_zeros<W>(
    writer: &mut EncryptingWriter<W>,
    mut remaining: u64,
    chunk_size: usize,
    session: &mut TransferSession,
) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let zeros = vec![0u8; chunk_size];
    while remaining > 0 {
        let n = remaining.min(chunk_size as u64) as usize;
        writer.write_all(&zeros[..n]).await?;
        remaining -= n as u64;
        session.advance(n);
    }
    Ok(())
}
