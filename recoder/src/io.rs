use std::io::SeekFrom;
use std::path::Path;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};

#[derive(Debug, thiserror::Error)]
pub enum IoError {
    #[error("Unexpected end of stream")]
    UnexpectedEof,

    #[error("{0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Misc(#[from] anyhow::Error),
}

/// A random-access byte source with a length known up front.
///
/// This is the seam the EBML walker reads through, so both local segment
/// files and the range-fetched remote source can be parsed the same way.
#[async_trait]
pub trait ReadSeek: Send {
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize, IoError>;

    async fn seek(&mut self, pos: u64) -> Result<(), IoError>;

    /// Total size of the underlying stream.
    fn len(&self) -> u64;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    async fn read_exact(&mut self, buf: &mut [u8]) -> Result<(), IoError> {
        let mut filled = 0;

        while filled < buf.len() {
            let n = self.read(&mut buf[filled..]).await?;

            if n == 0 {
                return Err(IoError::UnexpectedEof);
            }

            filled += n;
        }

        Ok(())
    }
}

/// Reads `len` bytes starting at `start`, restoring no cursor state.
pub async fn read_range<R: ReadSeek + ?Sized>(
    io: &mut R,
    start: u64,
    len: u64,
) -> Result<Bytes, IoError> {
    io.seek(start).await?;

    let mut data = vec![0u8; len as usize];
    io.read_exact(&mut data).await?;

    Ok(Bytes::from(data))
}

pub struct FileReader {
    file: File,
    len: u64,
}

impl FileReader {
    pub async fn open<P: AsRef<Path>>(path: P) -> Result<Self, IoError> {
        let file = File::open(path).await?;
        let len = file.metadata().await?.len();

        Ok(FileReader { file, len })
    }
}

#[async_trait]
impl ReadSeek for FileReader {
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize, IoError> {
        Ok(self.file.read(buf).await?)
    }

    async fn seek(&mut self, pos: u64) -> Result<(), IoError> {
        self.file.seek(SeekFrom::Start(pos)).await?;

        Ok(())
    }

    fn len(&self) -> u64 {
        self.len
    }
}

/// In-memory [ReadSeek] over a [Bytes] buffer.
pub struct MemoryReader {
    data: Bytes,
    pos: u64,
}

impl MemoryReader {
    pub fn new(data: Bytes) -> Self {
        MemoryReader { data, pos: 0 }
    }
}

#[async_trait]
impl ReadSeek for MemoryReader {
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize, IoError> {
        let start = self.pos.min(self.data.len() as u64) as usize;
        let n = buf.len().min(self.data.len() - start);

        buf[..n].copy_from_slice(&self.data[start..start + n]);
        self.pos += n as u64;

        Ok(n)
    }

    async fn seek(&mut self, pos: u64) -> Result<(), IoError> {
        self.pos = pos;

        Ok(())
    }

    fn len(&self) -> u64 {
        self.data.len() as u64
    }
}
