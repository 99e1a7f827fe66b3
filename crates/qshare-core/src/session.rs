use crate::protocol::FileHeader;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

/// Byte and file counters for one connection. Owned by the task driving
/// that connection.
#[derive(Debug)]
pub struct TransferSession {
    peer: SocketAddr,
    started: Instant,
    current: Option<FileHeader>,
    file_bytes: u64,
    total_bytes: u64,
    files_done: usize,
}

impl TransferSession {
    pub fn new(peer: SocketAddr) -> Self {
        Self {
            peer,
            started: Instant::now(),
            current: None,
            file_bytes: 0,
            total_bytes: 0,
            files_done: 0,
        }
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn begin(&mut self, header: FileHeader) {
        self.current = Some(header);
        self.file_bytes = 0;
    }

    pub fn advance(&mut self, n: usize) {
        self.file_bytes += n as u64;
        self.total_bytes += n as u64;
    }

    /// Close the file in flight. Returns its header and the payload bytes
    /// moved for it.
    pub fn finish(&mut self) -> Option<(FileHeader, u64)> {
        let header = self.current.take()?;
        self.files_done += 1;
        Some((header, std::mem::take(&mut self.file_bytes)))
    }

    pub fn current(&self) -> Option<&FileHeader> {
        self.current.as_ref()
    }

    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }

    pub fn files_done(&self) -> usize {
        self.files_done
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Average throughput in MiB/s since the session started.
    pub fn rate_mib(&self) -> f64 {
        let secs = self.elapsed().as_secs_f64();
        if secs <= 0.0 {
            return 0.0;
        }
        self.total_bytes as f64 / (1024.0 * 1024.0) / secs
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_bytes_per_file_and_in_total() {
        let mut session = TransferSession::new("127.0.0.1:1".parse().unwrap());
        session.begin(FileHeader::new("a", 3).unwrap());
        session.advance(2);
        session.advance(1);
        let (header, bytes) = session.finish().unwrap();
        assert_eq!(header.filename, "a");
        assert_eq!(bytes, 3);

        session.begin(FileHeader::new("b", 4).unwrap());
        session.advance(4);
        assert_eq!(session.current().map(|h| h.size), Some(4));
        session.finish();

        assert_eq!(session.total_bytes(), 7);
        assert_eq!(session.files_done(), 2);
        assert!(session.finish().is_none());
        assert_eq!(session.peer().port(), 1);
    }
}
