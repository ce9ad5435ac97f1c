use std::collections::HashMap;

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::{header, Client, StatusCode};
use tracing::trace;

use crate::io::{IoError, ReadSeek};

pub const CHUNK_SIZE: u64 = 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum RemoteError {
    #[error("{0}")]
    Http(#[from] reqwest::Error),

    #[error("Expected 206 Partial Content, got {0}")]
    UnexpectedStatus(StatusCode),

    #[error("Response is missing a usable Content-Range header")]
    MissingContentRange,
}

/// Random-access reads over a remote file via HTTP range requests.
///
/// Data is fetched in fixed 1 MiB chunks which are immutable once cached,
/// so probing the same header regions repeatedly costs one request. The
/// total size is learned from the `Content-Range` of the first fetch.
pub struct RemoteFile {
    client: Client,
    url: String,
    size: u64,
    pos: u64,
    chunks: HashMap<u64, Bytes>,
}

impl RemoteFile {
    pub async fn open(client: Client, url: &str) -> Result<Self, RemoteError> {
        let mut file = RemoteFile {
            client,
            url: url.to_string(),
            size: 0,
            pos: 0,
            chunks: HashMap::new(),
        };

        file.fetch_chunk(0).await?;

        Ok(file)
    }

    async fn fetch_chunk(&mut self, index: u64) -> Result<(), RemoteError> {
        let start = index * CHUNK_SIZE;
        let mut end = (index + 1) * CHUNK_SIZE;

        if self.size > 0 {
            end = end.min(self.size);
        }

        let range = format!("bytes={}-{}", start, end - 1);

        trace!(url = %self.url, %range, "fetching chunk");

        let response = self
            .client
            .get(&self.url)
            .header(header::RANGE, range)
            .send()
            .await?;

        if response.status() != StatusCode::PARTIAL_CONTENT {
            return Err(RemoteError::UnexpectedStatus(response.status()));
        }

        self.size = response
            .headers()
            .get(header::CONTENT_RANGE)
            .and_then(|value| value.to_str().ok())
            .and_then(parse_content_range)
            .ok_or(RemoteError::MissingContentRange)?;

        let data = response.bytes().await?;
        self.chunks.insert(index, data);

        Ok(())
    }

    pub fn position(&self) -> u64 {
        self.pos
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    #[cfg(test)]
    fn with_chunks(size: u64, chunks: HashMap<u64, Bytes>) -> Self {
        RemoteFile {
            client: Client::new(),
            url: String::new(),
            size,
            pos: 0,
            chunks,
        }
    }
}

/// Extracts the total size from a `Content-Range: bytes a-b/T` value.
fn parse_content_range(value: &str) -> Option<u64> {
    value.split('/').nth(1)?.trim().parse().ok()
}

#[async_trait]
impl ReadSeek for RemoteFile {
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize, IoError> {
        if self.pos >= self.size || buf.is_empty() {
            return Ok(0);
        }

        let index = self.pos / CHUNK_SIZE;

        if !self.chunks.contains_key(&index) {
            self.fetch_chunk(index)
                .await
                .map_err(|e| IoError::Misc(e.into()))?;
        }

        let chunk = &self.chunks[&index];
        let offset = (self.pos % CHUNK_SIZE) as usize;

        if offset >= chunk.len() {
            return Err(IoError::UnexpectedEof);
        }

        let n = buf.len().min(chunk.len() - offset);
        buf[..n].copy_from_slice(&chunk[offset..offset + n]);
        self.pos += n as u64;

        Ok(n)
    }

    async fn seek(&mut self, pos: u64) -> Result<(), IoError> {
        self.pos = pos;

        Ok(())
    }

    fn len(&self) -> u64 {
        self.size
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use test_case::test_case;

    #[test_case("bytes 0-1048575/2000000", Some(2_000_000))]
    #[test_case("bytes 0-99/100", Some(100))]
    #[test_case("bytes */123", Some(123))]
    #[test_case("bytes 0-99/*", None)]
    #[test_case("garbage", None)]
    fn content_range(value: &str, expected: Option<u64>) {
        assert_eq!(expected, parse_content_range(value));
    }

    fn two_chunk_file() -> RemoteFile {
        let first = Bytes::from(vec![1u8; CHUNK_SIZE as usize]);
        let second = Bytes::from(vec![2u8; 100]);
        let size = CHUNK_SIZE + 100;

        RemoteFile::with_chunks(size, HashMap::from([(0, first), (1, second)]))
    }

    #[tokio::test]
    async fn read_across_chunk_boundary() {
        let mut file = two_chunk_file();
        file.seek(CHUNK_SIZE - 4).await.unwrap();

        let mut buf = [0u8; 8];
        file.read_exact(&mut buf).await.unwrap();

        assert_eq!([1, 1, 1, 1, 2, 2, 2, 2], buf);
        assert_eq!(CHUNK_SIZE + 4, file.position());
        assert_eq!(CHUNK_SIZE + 100, file.size());
    }

    #[tokio::test]
    async fn read_stops_at_total_size() {
        let mut file = two_chunk_file();
        file.seek(CHUNK_SIZE + 98).await.unwrap();

        let mut buf = [0u8; 8];
        let n = file.read(&mut buf).await.unwrap();

        assert_eq!(2, n);
        assert_eq!(0, file.read(&mut buf).await.unwrap());
    }
}
