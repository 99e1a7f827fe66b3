//! Wire format of a transfer connection (protocol v1).
//!
//! Each file is sent as a plaintext metadata line followed by its payload:
//!
//! ```text
//! <filename><SEPARATOR><decimal size>\n
//! <size bytes of AES-256-CTR ciphertext>
//! ```
//!
//! The keystream is not reset between files, so the payload of the second
//! file continues where the first one stopped. Metadata lines are never
//! encrypted and do not advance the keystream.

use crate::cipher::EncryptingWriter;
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Token between filename and size. Filenames containing it cannot be sent.
pub const SEPARATOR: &str = "<SEPARATOR>";

/// Well-known TCP port receivers listen on.
pub const TRANSFER_PORT: u16 = 50001;

/// Size of the chunks payloads are streamed in.
pub const CHUNK_SIZE: usize = 8192;

/// Longest metadata line a receiver will buffer, newline included.
pub const MAX_HEADER_LEN: usize = 4096;

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("metadata line exceeds 4096 bytes")]
    HeaderTooLong,
    #[error("connection closed in the middle of a metadata line")]
    TruncatedHeader,
    #[error("malformed metadata line: {0:?}")]
    Malformed(String),
    #[error("filename {0:?} cannot be sent")]
    InvalidFilename(String),
}

/// Metadata announcing one file on the connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileHeader {
    pub filename: String,
    pub size: u64,
}

impl FileHeader {
    /// Filenames must be non-empty and may contain neither the separator
    /// nor a line break, since neither can be escaped on the wire.
    pub fn new(filename: impl Into<String>, size: u64) -> Result<Self, ProtocolError> {
        let filename = filename.into();
        if filename.trim().is_empty()
            || filename.contains(SEPARATOR)
            || filename.contains(['\n', '\r'])
        {
            return Err(ProtocolError::InvalidFilename(filename));
        }
        Ok(Self { filename, size })
    }

    pub fn encode(&self) -> String {
        format!("{}{}{}\n", self.filename, SEPARATOR, self.size)
    }

    /// Parse a metadata line, with or without its trailing newline.
    pub fn parse(line: &str) -> Result<Self, ProtocolError> {
        let malformed = || ProtocolError::Malformed(line.to_string());

        let mut parts = line.trim().split(SEPARATOR);
        let filename = parts.next().filter(|f| !f.is_empty()).ok_or_else(malformed)?;
        let size = parts
            .next()
            .and_then(|s| s.trim().parse::<u64>().ok())
            .ok_or_else(malformed)?;

        Ok(Self {
            filename: filename.to_string(),
            size,
        })
    }
}

/// What a receiver found where a metadata line was expected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeaderLine {
    Header(FileHeader),
    Malformed(String),
}

/// Read the next metadata line from the buffered connection.
///
/// `reader` must be the same buffered reader the payload is decrypted from,
/// so bytes it has buffered past the newline stay available to the payload.
/// Returns `Ok(None)` on a clean end of stream.
pub async fn read_header<R>(reader: &mut R) -> Result<Option<HeaderLine>, ProtocolError>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = Vec::new();
    let n = (&mut *reader)
        .take(MAX_HEADER_LEN as u64)
        .read_until(b'\n', &mut line)
        .await?;

    if n == 0 {
        return Ok(None);
    }
    if line.last() != Some(&b'\n') {
        return Err(if line.len() >= MAX_HEADER_LEN {
            ProtocolError::HeaderTooLong
        } else {
            ProtocolError::TruncatedHeader
        });
    }

    let Ok(text) = String::from_utf8(line) else {
        return Ok(Some(HeaderLine::Malformed("<non-utf8>".to_string())));
    };
    Ok(Some(match FileHeader::parse(&text) {
        Ok(header) => HeaderLine::Header(header),
        Err(_) => HeaderLine::Malformed(text.trim_end().to_string()),
    }))
}

/// Write a metadata line in plaintext on the stream under `writer`.
///
/// Pending ciphertext from the previous payload is flushed first so the
/// line cannot overtake it.
pub async fn write_header<W>(
    writer: &mut EncryptingWriter<W>,
    header: &FileHeader,
) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.flush().await?;
    writer.get_mut().write_all(header.encode().as_bytes()).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::BufReader;

    #[test]
    fn encode_matches_wire_format() {
        let header = FileHeader::new("a.txt", 5).unwrap();
        assert_eq!(header.encode(), "a.txt<SEPARATOR>5\n");
        assert_eq!(FileHeader::parse(&header.encode()).unwrap(), header);
    }

    #[test]
    fn new_rejects_unsendable_names() {
        for name in ["", "  ", "a<SEPARATOR>b", "line\nbreak", "cr\r"] {
            assert!(
                matches!(FileHeader::new(name, 1), Err(ProtocolError::InvalidFilename(_))),
                "{:?} should be rejected",
                name
            );
        }
    }

    #[test]
    fn parse_rejects_malformed_lines() {
        for line in [
            "no separator\n",
            "<SEPARATOR>5\n",
            "a.txt<SEPARATOR>\n",
            "a.txt<SEPARATOR>-1\n",
            "a.txt<SEPARATOR>five\n",
        ] {
            assert!(FileHeader::parse(line).is_err(), "{:?} should not parse", line);
        }
    }

    #[test]
    fn parse_accepts_crlf() {
        let header = FileHeader::parse("b.bin<SEPARATOR>42\r\n").unwrap();
        assert_eq!(header, FileHeader::new("b.bin", 42).unwrap());
    }

    #[tokio::test]
    async fn read_header_leaves_payload_in_buffer() {
        let wire = b"a.txt<SEPARATOR>2\nhib.txt<SEPARATOR>3\nbye".to_vec();
        let mut reader = BufReader::new(wire.as_slice());

        let first = read_header(&mut reader).await.unwrap().unwrap();
        assert_eq!(first, HeaderLine::Header(FileHeader::new("a.txt", 2).unwrap()));

        let mut payload = [0u8; 2];
        reader.read_exact(&mut payload).await.unwrap();
        assert_eq!(&payload, b"hi");

        let second = read_header(&mut reader).await.unwrap().unwrap();
        assert_eq!(second, HeaderLine::Header(FileHeader::new("b.txt", 3).unwrap()));

        let mut rest = Vec::new();
        reader.read_to_end(&mut rest).await.unwrap();
        assert_eq!(rest, b"bye");
        assert!(read_header(&mut reader).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn read_header_reports_malformed_and_truncated() {
        let wire = b"garbage\npartial".to_vec();
        let mut reader = BufReader::new(wire.as_slice());

        assert_eq!(
            read_header(&mut reader).await.unwrap(),
            Some(HeaderLine::Malformed("garbage".to_string()))
        );
        assert!(matches!(
            read_header(&mut reader).await,
            Err(ProtocolError::TruncatedHeader)
        ));
    }

    #[tokio::test]
    async fn read_header_bounds_line_length() {
        let wire = vec![b'x'; MAX_HEADER_LEN * 2];
        let mut reader = BufReader::new(wire.as_slice());
        assert!(matches!(
            read_header(&mut reader).await,
            Err(ProtocolError::HeaderTooLong)
        ));
    }
}
