//! LOB streaming
//!
//! Moves LOB content between the engine and an external source or sink in
//! fixed-size chunks. Each chunk is handed on as soon as it is transferred;
//! a whole LOB is never buffered except by [`LobStreamer::read_to_vec`].
//!
//! Empty content is NULL in both directions: a zero-length source is never
//! written, and a zero-length LOB is never read or handed to a sink.

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

use crate::constants::{OracleType, Piece};
use crate::engine::{completed, Engine, LobChunk, LobLocator};
use crate::error::Error;
use crate::piecewise::{engine_err, TransferError};

/// Kind of LOB a statement binds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LobKind {
    /// Character LOB
    #[default]
    Clob,
    /// Binary LOB
    Blob,
}

impl LobKind {
    /// Bind type for returning descriptors of this kind
    pub fn oracle_type(&self) -> OracleType {
        match self {
            LobKind::Clob => OracleType::Clob,
            LobKind::Blob => OracleType::Blob,
        }
    }
}

type SharedReader = Arc<Mutex<Option<Box<dyn AsyncRead + Send + Unpin>>>>;

/// Content to write into a LOB
#[derive(Clone)]
pub enum LobSource {
    /// In-memory bytes
    Bytes(Bytes),
    /// A file, read in chunks
    File(PathBuf),
    /// A caller stream of declared length. It is read once, so it can fill
    /// a single LOB.
    Stream {
        /// The stream, until a transfer takes it
        reader: SharedReader,
        /// Declared length in bytes
        len: u64,
    },
}

impl fmt::Debug for LobSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LobSource::Bytes(bytes) => f.debug_tuple("Bytes").field(&bytes.len()).finish(),
            LobSource::File(path) => f.debug_tuple("File").field(path).finish(),
            LobSource::Stream { len, .. } => f.debug_struct("Stream").field("len", len).finish(),
        }
    }
}

impl LobSource {
    /// Source from anything byte-like
    pub fn bytes(value: impl AsRef<[u8]>) -> Self {
        LobSource::Bytes(Bytes::copy_from_slice(value.as_ref()))
    }

    /// Source from a file path
    pub fn file(path: impl AsRef<Path>) -> Self {
        LobSource::File(path.as_ref().to_path_buf())
    }

    /// Source from a stream that will yield `len` bytes
    pub fn stream(reader: impl AsyncRead + Send + Unpin + 'static, len: u64) -> Self {
        LobSource::Stream {
            reader: Arc::new(Mutex::new(Some(Box::new(reader)))),
            len,
        }
    }

    /// Check the source can be read before anything is executed
    pub async fn check_access(&self) -> Result<(), Error> {
        match self {
            LobSource::Bytes(_) | LobSource::Stream { .. } => Ok(()),
            LobSource::File(path) => File::open(path)
                .await
                .map(|_| ())
                .map_err(|_| Error::CannotAccessFile(path.display().to_string())),
        }
    }

    /// Open the source, returning a reader and the total length
    pub async fn open(&self) -> io::Result<(Box<dyn AsyncRead + Send + Unpin>, u64)> {
        match self {
            LobSource::Bytes(bytes) => {
                let len = bytes.len() as u64;
                Ok((Box::new(io::Cursor::new(bytes.clone())), len))
            }
            LobSource::File(path) => {
                let file = File::open(path).await?;
                let len = file.metadata().await?.len();
                Ok((Box::new(file), len))
            }
            LobSource::Stream { reader, len } => {
                let taken = reader
                    .lock()
                    .map_err(|_| io::Error::new(io::ErrorKind::Other, "LOB stream lock poisoned"))?
                    .take();
                match taken {
                    Some(reader) => Ok((reader, *len)),
                    None => Err(io::Error::new(io::ErrorKind::Other, "LOB stream already consumed")),
                }
            }
        }
    }
}

/// Outcome of a LOB transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LobTransfer {
    /// Nothing transferred; the value is NULL
    Null,
    /// Every byte transferred
    Complete(u64),
    /// The sink disconnected after this many bytes
    Stopped(u64),
}

impl LobTransfer {
    /// Bytes transferred
    pub fn bytes(&self) -> u64 {
        match self {
            LobTransfer::Null => 0,
            LobTransfer::Complete(n) | LobTransfer::Stopped(n) => *n,
        }
    }
}

fn piece_for(first: bool, last: bool) -> Piece {
    match (first, last) {
        (true, true) => Piece::One,
        (true, false) => Piece::First,
        (false, false) => Piece::Next,
        (false, true) => Piece::Last,
    }
}

/// Read until `buf` is full or the source ends
async fn fill<R: AsyncRead + Unpin + ?Sized>(source: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = source.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

/// Chunked LOB reader and writer
#[derive(Debug, Clone, Copy)]
pub struct LobStreamer {
    chunk_size: usize,
    debug: bool,
}

impl LobStreamer {
    /// Create a streamer moving `chunk_size` bytes per transfer
    pub fn new(chunk_size: usize, debug: bool) -> Self {
        Self {
            chunk_size: chunk_size.max(1),
            debug,
        }
    }

    /// Bytes moved per transfer
    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    fn buffer_for(&self, total: u64) -> Vec<u8> {
        let len = usize::try_from(total).map_or(self.chunk_size, |t| t.min(self.chunk_size));
        vec![0; len]
    }

    /// Write `total` bytes from `source` into `lob`.
    ///
    /// A single chunk goes as one piece; anything larger goes as a first
    /// piece, next pieces and a last piece sized to what was actually read.
    /// A source that ends early closes the transfer with the bytes it had.
    pub async fn write_from<E, R>(
        &self,
        engine: &mut E,
        lob: LobLocator,
        source: &mut R,
        total: u64,
    ) -> Result<LobTransfer, TransferError>
    where
        E: Engine + ?Sized,
        R: AsyncRead + Unpin + ?Sized,
    {
        if total == 0 {
            return Ok(LobTransfer::Null);
        }

        let mut buf = self.buffer_for(total);
        let mut sent = 0u64;
        let mut first = true;

        loop {
            let want = usize::try_from(total - sent).map_or(buf.len(), |r| r.min(buf.len()));
            let n = fill(source, &mut buf[..want]).await.map_err(Error::from)?;
            if first && n == 0 {
                return Ok(LobTransfer::Null);
            }

            let last = n < want || sent + n as u64 >= total;
            let chunk = LobChunk {
                offset: sent + 1,
                amount: n,
                piece: piece_for(first, last),
            };
            completed(engine.lob_write(lob, chunk, &buf[..n]).await).map_err(engine_err("lob_write"))?;
            if self.debug {
                debug!(offset = chunk.offset, amount = n, piece = ?chunk.piece, "LOB chunk written");
            }

            sent += n as u64;
            first = false;
            if last {
                return Ok(LobTransfer::Complete(sent));
            }
        }
    }

    /// Write a [`LobSource`] into `lob`
    pub async fn write_source<E: Engine + ?Sized>(
        &self,
        engine: &mut E,
        lob: LobLocator,
        source: &LobSource,
    ) -> Result<LobTransfer, TransferError> {
        let (mut reader, total) = source.open().await.map_err(Error::from)?;
        self.write_from(engine, lob, &mut reader, total).await
    }

    /// Stream `total` bytes of `lob` into `sink`.
    ///
    /// Every chunk is written to the sink before the next is requested. A
    /// sink that reports a broken pipe ends the transfer early without an
    /// error; a sink that accepts fewer bytes than offered is an error.
    pub async fn read_into<E, W>(
        &self,
        engine: &mut E,
        lob: LobLocator,
        total: u64,
        sink: &mut W,
    ) -> Result<LobTransfer, TransferError>
    where
        E: Engine + ?Sized,
        W: AsyncWrite + Unpin + ?Sized,
    {
        if total == 0 {
            return Ok(LobTransfer::Null);
        }

        let mut buf = self.buffer_for(total);
        let mut received = 0u64;

        while received < total {
            let amount = usize::try_from(total - received).map_or(buf.len(), |r| r.min(buf.len()));
            let last = received + amount as u64 >= total;
            let chunk = LobChunk {
                offset: received + 1,
                amount,
                piece: piece_for(received == 0, last),
            };
            let n = engine
                .lob_read(lob, chunk, &mut buf[..amount])
                .await
                .map_err(engine_err("lob_read"))?;
            if n != amount {
                return Err(Error::Internal(format!(
                    "LOB read returned {} bytes at offset {}, expected {}",
                    n, chunk.offset, amount
                ))
                .into());
            }

            match sink.write(&buf[..n]).await {
                Ok(written) if written == n => {}
                Ok(written) => {
                    return Err(Error::ShortWrite {
                        written,
                        expected: n,
                    }
                    .into())
                }
                Err(e) if e.kind() == io::ErrorKind::BrokenPipe => {
                    debug!(received, total, "LOB consumer disconnected");
                    return Ok(LobTransfer::Stopped(received));
                }
                Err(e) => return Err(Error::Io(e).into()),
            }

            received += n as u64;
            if self.debug {
                debug!(offset = chunk.offset, amount = n, piece = ?chunk.piece, "LOB chunk read");
            }
        }

        match sink.flush().await {
            Err(e) if e.kind() == io::ErrorKind::BrokenPipe => {
                debug!(received, total, "LOB consumer disconnected");
                Ok(LobTransfer::Stopped(received))
            }
            Err(e) => Err(Error::Io(e).into()),
            Ok(()) => Ok(LobTransfer::Complete(received)),
        }
    }

    /// Read a whole LOB into memory; `None` for NULL or empty
    pub async fn read_to_vec<E: Engine + ?Sized>(
        &self,
        engine: &mut E,
        lob: LobLocator,
    ) -> Result<Option<Vec<u8>>, TransferError> {
        let total = engine
            .lob_length(lob)
            .await
            .map_err(engine_err("lob_length"))?;
        if total == 0 {
            return Ok(None);
        }
        let mut content = Vec::with_capacity(usize::try_from(total).unwrap_or(0));
        self.read_into(engine, lob, total, &mut content).await?;
        Ok(Some(content))
    }
}
