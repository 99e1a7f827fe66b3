//! Receiving side: accept connections and write the files they carry.
//!
//! An accept task feeds a queue of connections; the dispatch loop in
//! [`Receiver::serve`] takes them off the queue and runs each on its own
//! task until the [`CancellationSignal`] fires. Cancelling stops the accept
//! task, which drops (and so closes) the listening socket, then waits for
//! connections already being handled to finish.

use crate::cipher::DecryptingReader;
use crate::error::TransferError;
use crate::keys::TransferKey;
use crate::protocol::{self, FileHeader, HeaderLine, CHUNK_SIZE};
use crate::session::TransferSession;
use std::future::Future;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use storage::Storage;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinSet;

/// Pause after an accept error before trying again.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Connections accepted but not yet dispatched.
const QUEUE_DEPTH: usize = 16;

/// Create a linked cancel handle / signal pair for [`Receiver::serve`].
pub fn cancellation() -> (CancelHandle, CancellationSignal) {
    let (tx, rx) = oneshot::channel();
    (CancelHandle(tx), CancellationSignal(rx))
}

/// Held by whoever may stop a running `serve`. Dropping it also cancels.
#[derive(Debug)]
pub struct CancelHandle(oneshot::Sender<()>);

impl CancelHandle {
    pub fn cancel(self) {
        let _ = self.0.send(());
    }
}

/// Resolves once the matching [`CancelHandle`] is used or dropped.
#[derive(Debug)]
pub struct CancellationSignal(oneshot::Receiver<()>);

impl Future for CancellationSignal {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        Pin::new(&mut self.0).poll(cx).map(|_| ())
    }
}

/// What happened to one file on an incoming connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedFile {
    pub header: FileHeader,
    /// Where the bytes went; `None` if the name was refused and the
    /// payload discarded.
    pub path: Option<PathBuf>,
    pub received: u64,
}

impl ReceivedFile {
    pub fn is_complete(&self) -> bool {
        self.path.is_some() && self.received == self.header.size
    }
}

pub struct Receiver<S> {
    listener: TcpListener,
    storage: Arc<S>,
    key: TransferKey,
    chunk_size: usize,
}

impl<S> Receiver<S>
where
    S: Storage + 'static,
{
    /// Bind the transfer listener. A port already in use is reported as
    /// [`TransferError::Bind`].
    pub async fn bind(addr: SocketAddr, storage: S, key: TransferKey) -> Result<Self, TransferError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| TransferError::Bind { addr, source })?;

        Ok(Self {
            listener,
            storage: Arc::new(storage),
            key,
            chunk_size: CHUNK_SIZE,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept and handle connections until `cancellation` resolves.
    pub async fn serve(self, mut cancellation: CancellationSignal) -> Result<(), TransferError> {
        let Self {
            listener,
            storage,
            key,
            chunk_size,
        } = self;

        let local = listener.local_addr()?;
        tracing::info!("Ready to receive files on {}", local);

        let (queue_tx, mut queue_rx) = mpsc::channel(QUEUE_DEPTH);
        let mut accept_task = tokio::spawn(accept_loop(listener, queue_tx));
        let mut connections = JoinSet::new();

        loop {
            tokio::select! {
                _ = &mut cancellation => {
                    tracing::info!("Stopping receiver on {}", local);
                    break;
                }
                queued = queue_rx.recv() => {
                    let Some((stream, peer)) = queued else {
                        tracing::warn!("Accept loop on {} ended", local);
                        break;
                    };
                    dispatch(&mut connections, stream, peer, &storage, &key, chunk_size);
                }
                Some(done) = connections.join_next(), if !connections.is_empty() => {
                    log_finished(done);
                }
            }
        }

        // Dropping the listener inside the accept task closes the socket.
        accept_task.abort();
        let _ = (&mut accept_task).await;

        // Connections accepted before the cancel are still served.
        while let Ok((stream, peer)) = queue_rx.try_recv() {
            dispatch(&mut connections, stream, peer, &storage, &key, chunk_size);
        }
        drop(queue_rx);

        if !connections.is_empty() {
            tracing::info!("Waiting for {} connection(s) to finish", connections.len());
        }
        while let Some(done) = connections.join_next().await {
            log_finished(done);
        }
        Ok(())
    }
}

async fn accept_loop(listener: TcpListener, queue: mpsc::Sender<(TcpStream, SocketAddr)>) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                tracing::info!("Incoming connection from {}", peer);
                if queue.send((stream, peer)).await.is_err() {
                    return;
                }
            }
            Err(e) => {
                tracing::warn!("Accept error: {}", e);
                tokio::time::sleep(ACCEPT_BACKOFF).await;
            }
        }
    }
}

fn dispatch<S>(
    connections: &mut JoinSet<(SocketAddr, Vec<ReceivedFile>)>,
    stream: TcpStream,
    peer: SocketAddr,
    storage: &Arc<S>,
    key: &TransferKey,
    chunk_size: usize,
) where
    S: Storage + 'static,
{
    let storage = Arc::clone(storage);
    let key = key.clone();
    connections.spawn(async move {
        let files = handle_connection(stream, peer, storage.as_ref(), &key, chunk_size).await;
        (peer, files)
    });
}

fn log_finished(done: Result<(SocketAddr, Vec<ReceivedFile>), tokio::task::JoinError>) {
    match done {
        Ok((peer, files)) => {
            let complete = count_complete(&files);
            if complete == files.len() {
                tracing::info!("Saved {} file(s) from {}", complete, peer);
            } else {
                tracing::warn!(
                    "Saved {} of {} file(s) from {}, the rest incomplete or refused",
                    complete,
                    files.len(),
                    peer
                );
            }
        }
        Err(e) => tracing::error!("Connection task failed: {}", e),
    }
}

/// Number of files that were written in full.
pub fn count_complete(files: &[ReceivedFile]) -> usize {
    files.iter().filter(|f| f.is_complete()).count()
}

/// Receive every file on one connection.
///
/// Metadata lines are read from the buffered reader underneath the cipher;
/// payload bytes are read through the cipher from that same buffer.
pub async fn handle_connection<S, T>(
    stream: T,
    peer: SocketAddr,
    storage: &S,
    key: &TransferKey,
    chunk_size: usize,
) -> Vec<ReceivedFile>
where
    S: Storage + ?Sized,
    T: AsyncRead + Unpin,
{
    let mut reader = DecryptingReader::new(key, BufReader::new(stream));
    let mut session = TransferSession::new(peer);
    let mut buf = vec![0u8; chunk_size.max(1)];
    let mut received = Vec::new();

    loop {
        let header = match protocol::read_header(reader.get_mut()).await {
            Ok(None) => {
                tracing::info!("All files received from {}", peer);
                break;
            }
            Ok(Some(HeaderLine::Header(header))) => header,
            Ok(Some(HeaderLine::Malformed(line))) => {
                tracing::warn!("Skipping malformed metadata from {}: {:?}", peer, line);
                continue;
            }
            Err(e) => {
                tracing::warn!("Closing connection from {}: {}", peer, e);
                break;
            }
        };

        let (file, result) = receive_file(&mut reader, header, storage, &mut buf, &mut session).await;
        let cut_short = file.received < file.header.size;
        received.push(file);
        if let Err(e) = result {
            tracing::warn!("Stream from {} failed: {}", peer, e);
            break;
        }
        if cut_short {
            break;
        }
    }

    tracing::info!(
        "Connection from {} closed: {} file(s), {} bytes in {:.1?}",
        session.peer(),
        session.files_done(),
        session.total_bytes(),
        session.elapsed()
    );
    received
}

/// Move one payload from `reader` into storage.
///
/// Always consumes the declared size from the stream when it can, even if
/// the file could not be created, so the next metadata line is found.
async fn receive_file<R, S>(
    reader: &mut DecryptingReader<R>,
    header: FileHeader,
    storage: &S,
    buf: &mut [u8],
    session: &mut TransferSession,
) -> (ReceivedFile, std::io::Result<()>)
where
    R: AsyncRead + Unpin,
    S: Storage + ?Sized,
{
    tracing::info!(
        "Receiving {} ({:.2} MB)",
        header.filename,
        header.size as f64 / (1024.0 * 1024.0)
    );

    let (path, mut out) = match storage.create_file(&header.filename).await {
        Ok(Some((path, file))) => (Some(path), Some(file)),
        Ok(None) => (None, None),
        Err(e) => {
            tracing::warn!("Discarding {}: {:#}", header.filename, e);
            (None, None)
        }
    };

    let size = header.size;
    session.begin(header.clone());
    let mut written = 0u64;
    let mut result = Ok(());

    while written < size {
        let want = (size - written).min(buf.len() as u64) as usize;
        let n = match reader.read(&mut buf[..want]).await {
            Ok(0) => {
                tracing::warn!(
                    "Connection ended after {} of {} bytes of {}",
                    written,
                    size,
                    header.filename
                );
                break;
            }
            Ok(n) => n,
            Err(e) => {
                result = Err(e);
                break;
            }
        };

        if let Some(file) = out.as_mut() {
            if let Err(e) = file.write_all(&buf[..n]).await {
                tracing::warn!("Write to {} failed, discarding rest: {}", header.filename, e);
                out = None;
            }
        }
        written += n as u64;
        session.advance(n);
    }

    if let Some(mut file) = out {
        if let Err(e) = file.flush().await {
            tracing::warn!("Flush of {} failed: {}", header.filename, e);
        }
    }

    // An unfinished payload leaves the session's current file open.
    if written == size {
        session.finish();
        if let Some(path) = &path {
            tracing::info!("Saved {}", path.display());
        }
    }

    (
        ReceivedFile {
            header,
            path,
            received: written,
        },
        result,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cipher::EncryptingWriter;
    use crate::sender::{FileOutcome, Sender, SkipReason};
    use discovery::PeerRegistry;
    use std::net::{IpAddr, Ipv4Addr};
    use storage::LocalStorage;
    use tempfile::TempDir;

    const PEER: &str = "peer";

    struct Harness {
        _save: TempDir,
        save_dir: PathBuf,
        sender: Sender,
        cancel: CancelHandle,
        serving: tokio::task::JoinHandle<Result<(), TransferError>>,
        addr: SocketAddr,
    }

    async fn start() -> Harness {
        let save = TempDir::new().unwrap();
        let save_dir = save.path().join("inbox");
        let key = TransferKey::derive("qshare");

        let storage = LocalStorage::new(save_dir.clone()).unwrap();
        let receiver = Receiver::bind("127.0.0.1:0".parse().unwrap(), storage, key.clone())
            .await
            .unwrap();
        let addr = receiver.local_addr().unwrap();
        let (cancel, signal) = cancellation();
        let serving = tokio::spawn(receiver.serve(signal));

        let registry = PeerRegistry::new();
        registry.upsert(PEER, IpAddr::V4(Ipv4Addr::LOCALHOST));
        let sender = Sender::new(registry, key, addr.port());

        Harness {
            _save: save,
            save_dir,
            sender,
            cancel,
            serving,
            addr,
        }
    }

    /// The receiver writes asynchronously from the sender's point of view.
    async fn wait_for(path: &std::path::Path, len: usize) -> Vec<u8> {
        for _ in 0..100 {
            if let Ok(data) = std::fs::read(path) {
                if data.len() == len {
                    return data;
                }
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        std::fs::read(path).unwrap_or_default()
    }

    async fn stop(h: Harness) {
        h.cancel.cancel();
        tokio::time::timeout(Duration::from_secs(5), h.serving)
            .await
            .expect("serve did not return after cancel")
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn single_file_transfer() {
        let h = start().await;
        let src = TempDir::new().unwrap();
        let a = src.path().join("a.txt");
        std::fs::write(&a, b"hello").unwrap();

        let summary = h.sender.send(&[&a], PEER).await.unwrap();
        assert_eq!(summary.sent_count(), 1);
        assert_eq!(summary.bytes, 5);

        assert_eq!(wait_for(&h.save_dir.join("a.txt"), 5).await, b"hello");
        stop(h).await;
    }

    #[tokio::test]
    async fn multiple_files_share_one_connection() {
        let h = start().await;
        let src = TempDir::new().unwrap();
        let a = src.path().join("a.txt");
        let b = src.path().join("b.txt");
        std::fs::write(&a, b"hi").unwrap();
        std::fs::write(&b, b"bye").unwrap();

        let summary = h.sender.send(&[&a, &b], PEER).await.unwrap();
        assert_eq!(summary.sent_count(), 2);

        assert_eq!(wait_for(&h.save_dir.join("a.txt"), 2).await, b"hi");
        assert_eq!(wait_for(&h.save_dir.join("b.txt"), 3).await, b"bye");
        stop(h).await;
    }

    #[tokio::test]
    async fn large_files_survive_chunking() {
        let h = start().await;
        let src = TempDir::new().unwrap();
        let big: Vec<u8> = (0..100_000u32).map(|i| (i % 253) as u8).collect();
        let first = src.path().join("first.bin");
        let second = src.path().join("second.bin");
        std::fs::write(&first, &big).unwrap();
        std::fs::write(&second, &big[..12_345]).unwrap();

        h.sender.send(&[&first, &second], PEER).await.unwrap();

        assert_eq!(wait_for(&h.save_dir.join("first.bin"), big.len()).await, big);
        assert_eq!(
            wait_for(&h.save_dir.join("second.bin"), 12_345).await,
            &big[..12_345]
        );
        stop(h).await;
    }

    #[tokio::test]
    async fn bad_paths_are_skipped_not_fatal() {
        let h = start().await;
        let src = TempDir::new().unwrap();
        let missing = src.path().join("missing.txt");
        let dir = src.path().join("folder");
        std::fs::create_dir(&dir).unwrap();
        let ok = src.path().join("ok.txt");
        std::fs::write(&ok, b"fine").unwrap();

        let summary = h.sender.send(&[&missing, &dir, &ok], PEER).await.unwrap();
        assert!(matches!(
            summary.files[0].outcome,
            FileOutcome::Skipped(SkipReason::Unreadable(_))
        ));
        assert_eq!(
            summary.files[1].outcome,
            FileOutcome::Skipped(SkipReason::IsDirectory)
        );
        assert_eq!(summary.files[2].outcome, FileOutcome::Sent { bytes: 4 });

        assert_eq!(wait_for(&h.save_dir.join("ok.txt"), 4).await, b"fine");
        assert!(!h.save_dir.join("folder").exists());
        stop(h).await;
    }

    #[tokio::test]
    async fn existing_file_is_overwritten() {
        let h = start().await;
        std::fs::write(h.save_dir.join("a.txt"), b"previous longer content").unwrap();
        let src = TempDir::new().unwrap();
        let a = src.path().join("a.txt");
        std::fs::write(&a, b"new").unwrap();

        h.sender.send(&[&a], PEER).await.unwrap();
        assert_eq!(wait_for(&h.save_dir.join("a.txt"), 3).await, b"new");
        stop(h).await;
    }

    #[tokio::test]
    async fn cancel_releases_the_port() {
        let h = start().await;
        let addr = h.addr;
        stop(h).await;

        let again = TcpListener::bind(addr).await;
        assert!(again.is_ok(), "port {} still bound after cancel", addr.port());
    }

    #[tokio::test]
    async fn bind_conflict_is_reported() {
        let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = taken.local_addr().unwrap();
        let dir = TempDir::new().unwrap();
        let storage = LocalStorage::new(dir.path().to_path_buf()).unwrap();

        let result = Receiver::bind(addr, storage, TransferKey::derive("qshare")).await;
        assert!(matches!(result, Err(TransferError::Bind { .. })));
    }

    #[tokio::test]
    async fn dropping_cancel_handle_stops_serve() {
        let h = start().await;
        drop(h.cancel);
        tokio::time::timeout(Duration::from_secs(5), h.serving)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }

    /// Build a raw connection byte stream the way a sender would.
    async fn wire(key: &TransferKey, items: &[(&str, &[u8])]) -> Vec<u8> {
        let mut writer = EncryptingWriter::new(key, Vec::new());
        for (line, payload) in items {
            writer.flush().await.unwrap();
            writer.get_mut().extend_from_slice(line.as_bytes());
            writer.write_all(payload).await.unwrap();
        }
        writer.flush().await.unwrap();
        writer.into_inner()
    }

    #[tokio::test]
    async fn malformed_lines_are_skipped() {
        let key = TransferKey::derive("qshare");
        let dir = TempDir::new().unwrap();
        let storage = LocalStorage::new(dir.path().to_path_buf()).unwrap();
        let bytes = wire(
            &key,
            &[
                ("this is not metadata\n", &b""[..]),
                ("a.txt<SEPARATOR>2\n", &b"hi"[..]),
            ],
        )
        .await;

        let files = handle_connection(
            bytes.as_slice(),
            "127.0.0.1:9".parse().unwrap(),
            &storage,
            &key,
            CHUNK_SIZE,
        )
        .await;

        assert_eq!(files.len(), 1);
        assert!(files[0].is_complete());
        assert_eq!(std::fs::read(dir.path().join("a.txt")).unwrap(), b"hi");
    }

    #[tokio::test]
    async fn refused_name_keeps_stream_framed() {
        let key = TransferKey::derive("qshare");
        let dir = TempDir::new().unwrap();
        let storage = LocalStorage::new(dir.path().to_path_buf()).unwrap();
        let bytes = wire(
            &key,
            &[
                ("..<SEPARATOR>4\n", &b"evil"[..]),
                ("../b.txt<SEPARATOR>3\n", &b"bye"[..]),
            ],
        )
        .await;

        let files = handle_connection(
            bytes.as_slice(),
            "127.0.0.1:9".parse().unwrap(),
            &storage,
            &key,
            3,
        )
        .await;

        assert_eq!(files.len(), 2);
        assert_eq!(files[0].path, None);
        assert_eq!(files[0].received, 4);
        assert!(files[1].is_complete());
        assert_eq!(count_complete(&files), 1);
        assert_eq!(std::fs::read(dir.path().join("b.txt")).unwrap(), b"bye");
        assert!(!dir.path().parent().unwrap().join("b.txt").exists());
    }

    #[tokio::test]
    async fn early_end_keeps_partial_file() {
        let key = TransferKey::derive("qshare");
        let dir = TempDir::new().unwrap();
        let storage = LocalStorage::new(dir.path().to_path_buf()).unwrap();
        let bytes = wire(&key, &[("c.txt<SEPARATOR>10\n", &b"abcd"[..])]).await;

        let files = handle_connection(
            bytes.as_slice(),
            "127.0.0.1:9".parse().unwrap(),
            &storage,
            &key,
            CHUNK_SIZE,
        )
        .await;

        assert_eq!(files.len(), 1);
        assert_eq!(files[0].received, 4);
        assert!(!files[0].is_complete());
        assert_eq!(count_complete(&files), 0);
        assert_eq!(std::fs::read(dir.path().join("c.txt")).unwrap(), b"abcd");
    }
}
