use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::sync::Mutex;
use tracing::warn;

use super::ByteSource;

pub type SharedFetch = Arc<dyn Fn() -> BoxFuture<'static, anyhow::Result<Bytes>> + Send + Sync>;

/// A byte source whose payload is produced by an async function on first
/// touch.
///
/// The fetch runs at most once per instance; concurrent reads before the
/// bytes exist all await the same in-flight call. [ByteSource::copy]
/// returns a sibling sharing the fetch but not the cursor or the
/// materialised bytes, so every client fork produces its own view through
/// the same producer. [ByteSource::close] drops the materialised bytes to
/// cap memory when many forks hold the same slot; the next read fetches
/// again.
pub struct LazyPart {
    fetch: SharedFetch,
    size: u64,
    loaded: Arc<Mutex<Option<Bytes>>>,
    pos: u64,
}

impl LazyPart {
    pub fn new<F, Fut>(size: u64, fetch: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Bytes>> + Send + 'static,
    {
        LazyPart {
            fetch: Arc::new(move || fetch().boxed()),
            size,
            loaded: Arc::new(Mutex::new(None)),
            pos: 0,
        }
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// The cursor position. Does not touch the fetch.
    pub fn position(&self) -> u64 {
        self.pos
    }

    async fn materialize(&self) -> anyhow::Result<Bytes> {
        let mut slot = self.loaded.lock().await;

        if let Some(data) = slot.as_ref() {
            return Ok(data.clone());
        }

        let data = (self.fetch)().await?;

        if data.len() as u64 != self.size {
            warn!(
                declared = self.size,
                actual = data.len(),
                "lazy part produced a different size than declared"
            );
        }

        *slot = Some(data.clone());

        Ok(data)
    }
}

#[async_trait]
impl ByteSource for LazyPart {
    async fn read(&mut self, size: usize) -> anyhow::Result<Bytes> {
        let data = self.materialize().await?;

        let start = self.pos.min(data.len() as u64) as usize;
        let n = size.min(data.len() - start);

        self.pos += n as u64;

        Ok(data.slice(start..start + n))
    }

    async fn seek(&mut self, pos: u64) -> anyhow::Result<()> {
        self.materialize().await?;
        self.pos = pos;

        Ok(())
    }

    fn close(&mut self) {
        self.loaded = Arc::new(Mutex::new(None));
        self.pos = 0;
    }

    fn copy(&self) -> Box<dyn ByteSource> {
        Box::new(LazyPart {
            fetch: Arc::clone(&self.fetch),
            size: self.size,
            loaded: Arc::new(Mutex::new(None)),
            pos: 0,
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counted_part(size: u64) -> (LazyPart, Arc<AtomicUsize>) {
        let counter = Arc::new(AtomicUsize::new(0));
        let fetches = counter.clone();

        let part = LazyPart::new(size, move || {
            let fetches = fetches.clone();

            async move {
                fetches.fetch_add(1, Ordering::SeqCst);

                Ok(Bytes::from_static(b"0123456789"))
            }
        });

        (part, counter)
    }

    #[tokio::test]
    async fn fetch_runs_once() {
        let (mut part, counter) = counted_part(10);

        assert_eq!(b"0123"[..], part.read(4).await.unwrap()[..]);
        assert_eq!(b"4567"[..], part.read(4).await.unwrap()[..]);
        assert_eq!(1, counter.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn concurrent_materialisation_is_single_flight() {
        let (part, counter) = counted_part(10);

        let (a, b) = tokio::join!(part.materialize(), part.materialize());

        assert_eq!(a.unwrap(), b.unwrap());
        assert_eq!(1, counter.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn close_drops_the_materialised_bytes() {
        let (mut part, counter) = counted_part(10);

        part.read(4).await.unwrap();
        part.close();

        assert_eq!(b"0123"[..], part.read(4).await.unwrap()[..]);
        assert_eq!(2, counter.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn copy_shares_the_fetch_but_not_the_view() {
        let (mut part, counter) = counted_part(10);

        part.read(4).await.unwrap();

        let mut sibling = part.copy();

        assert_eq!(b"0123"[..], sibling.read(4).await.unwrap()[..]);
        assert_eq!(4, part.position());
        assert_eq!(2, counter.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn read_past_end_is_empty() {
        let (mut part, _counter) = counted_part(10);

        part.seek(10).await.unwrap();

        assert!(part.read(4).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn fetch_errors_propagate() {
        let mut part = LazyPart::new(10, || async { anyhow::bail!("segment never produced") });

        assert!(part.read(4).await.is_err());
    }
}
