use std::sync::{Arc, Mutex as StdMutex, Weak};

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use tokio::sync::{Mutex, Notify};
use tracing::trace;

mod lazy;

pub use lazy::{LazyPart, SharedFetch};

/// A sized, seekable byte producer a [FileContainer] can serve parts from.
///
/// `copy` forks the view: the result shares whatever produces the bytes but
/// has its own cursor and no materialised data.
#[async_trait]
pub trait ByteSource: Send {
    /// Reads up to `size` bytes, advancing the cursor. An empty or short
    /// result means the source is exhausted.
    async fn read(&mut self, size: usize) -> anyhow::Result<Bytes>;

    async fn seek(&mut self, pos: u64) -> anyhow::Result<()>;

    /// Releases whatever the source holds; reading again is allowed and
    /// re-materialises.
    fn close(&mut self);

    fn copy(&self) -> Box<dyn ByteSource>;
}

/// A fully materialised byte source.
pub struct MemorySource {
    data: Bytes,
    pos: u64,
}

impl MemorySource {
    pub fn new(data: Bytes) -> Self {
        MemorySource { data, pos: 0 }
    }
}

#[async_trait]
impl ByteSource for MemorySource {
    async fn read(&mut self, size: usize) -> anyhow::Result<Bytes> {
        let start = self.pos.min(self.data.len() as u64) as usize;
        let n = size.min(self.data.len() - start);

        self.pos += n as u64;

        Ok(self.data.slice(start..start + n))
    }

    async fn seek(&mut self, pos: u64) -> anyhow::Result<()> {
        self.pos = pos;

        Ok(())
    }

    fn close(&mut self) {}

    fn copy(&self) -> Box<dyn ByteSource> {
        Box::new(MemorySource::new(self.data.clone()))
    }
}

struct Part {
    offset: u64,
    source: Box<dyn ByteSource>,
}

struct State {
    parts: Vec<Part>,
    size: u64,
    pos: u64,
    current: usize,
    done: bool,
}

struct Shared {
    state: Mutex<State>,
    new_part: Notify,
    children: StdMutex<Vec<Weak<Shared>>>,
    parent: Option<Weak<Shared>>,
}

/// An ordered list of sized byte parts exposed as one seekable file.
///
/// A container is either canonical (owned by the encoder, appended to by
/// the producer) or a fork created with [copy](FileContainer::copy) and
/// handed to one client. Appends to the canonical are mirrored into every
/// live fork, each mirrored part derived with [ByteSource::copy] so the
/// producers are shared but the cursors are not.
pub struct FileContainer {
    shared: Arc<Shared>,
}

impl FileContainer {
    pub fn new() -> Self {
        FileContainer {
            shared: Arc::new(Shared {
                state: Mutex::new(State {
                    parts: Vec::new(),
                    size: 0,
                    pos: 0,
                    current: 0,
                    done: false,
                }),
                new_part: Notify::new(),
                children: StdMutex::new(Vec::new()),
                parent: None,
            }),
        }
    }

    /// Appends a sized byte source, waking blocked readers and mirroring
    /// the append into every live fork.
    pub async fn write_element(&self, source: Box<dyn ByteSource>, size: u64) {
        let mut st = self.shared.state.lock().await;

        let children: Vec<Arc<Shared>> = {
            let mut children = self.shared.children.lock().unwrap();
            children.retain(|weak| weak.strong_count() > 0);
            children.iter().filter_map(Weak::upgrade).collect()
        };

        let copies: Vec<Box<dyn ByteSource>> =
            children.iter().map(|_| source.copy()).collect();

        let offset = st.size;
        st.parts.push(Part { offset, source });
        st.size += size;
        self.shared.new_part.notify_waiters();

        // Mirroring under the canonical's lock keeps fork part order equal
        // to the canonical append order.
        for (child, copy) in children.into_iter().zip(copies) {
            let mut child_state = child.state.lock().await;
            let offset = child_state.size;
            child_state.parts.push(Part {
                offset,
                source: copy,
            });
            child_state.size += size;
            drop(child_state);

            child.new_part.notify_waiters();
        }
    }

    /// Serves up to `size` bytes from the current position, crossing part
    /// boundaries as parts are exhausted. If nothing can be produced and
    /// the container is not done, waits for a new part; once done, reads at
    /// the end return empty.
    pub async fn read(&self, size: usize) -> anyhow::Result<Bytes> {
        loop {
            let notified = self.shared.new_part.notified();
            tokio::pin!(notified);

            let mut st = self.shared.state.lock().await;
            let mut out = BytesMut::new();

            while out.len() < size {
                let state = &mut *st;

                let Some(part) = state.parts.get_mut(state.current) else {
                    break;
                };

                let want = size - out.len();
                let data = part.source.read(want).await?;
                let exhausted = data.len() < want;

                out.extend_from_slice(&data);

                if exhausted {
                    part.source.close();
                    state.current += 1;

                    // A part entered mid-stream starts at its beginning no
                    // matter where an earlier pass left its cursor.
                    if let Some(next) = state.parts.get_mut(state.current) {
                        next.source.seek(0).await?;
                    }
                }
            }

            st.pos += out.len() as u64;

            if out.is_empty() && size > 0 && !st.done {
                notified.as_mut().enable();
                drop(st);
                notified.await;

                continue;
            }

            return Ok(out.freeze());
        }
    }

    /// Positions the cursor, forwarding the relative offset into the part
    /// covering `position`. Seeking past the known size waits for new parts
    /// while the container is still growing and fails once it is done.
    pub async fn seek(&self, position: u64) -> anyhow::Result<()> {
        loop {
            let notified = self.shared.new_part.notified();
            tokio::pin!(notified);

            let mut st = self.shared.state.lock().await;

            if position > st.size {
                if st.done {
                    anyhow::bail!(
                        "seek to {position} is past the end of the container ({} bytes)",
                        st.size
                    );
                }

                notified.as_mut().enable();
                drop(st);
                notified.await;

                continue;
            }

            st.pos = position;

            let state = &mut *st;
            let Some(index) = state.parts.iter().rposition(|part| part.offset <= position)
            else {
                state.current = 0;

                return Ok(());
            };

            state.current = index;

            let offset = state.parts[index].offset;
            state.parts[index].source.seek(position - offset).await?;

            return Ok(());
        }
    }

    pub async fn position(&self) -> u64 {
        self.shared.state.lock().await.pos
    }

    /// The total size, or 0 while parts may still be appended so a partial
    /// stream is never mistaken for a fixed-length resource.
    pub async fn size(&self) -> u64 {
        let st = self.shared.state.lock().await;

        if st.done {
            st.size
        } else {
            0
        }
    }

    /// Marks the part list complete and wakes blocked readers, which then
    /// observe end of stream. Live forks are marked done as well.
    pub async fn mark_done(&self) {
        let mut st = self.shared.state.lock().await;
        st.done = true;

        let children: Vec<Arc<Shared>> = {
            let mut children = self.shared.children.lock().unwrap();
            children.retain(|weak| weak.strong_count() > 0);
            children.iter().filter_map(Weak::upgrade).collect()
        };

        drop(st);
        self.shared.new_part.notify_waiters();

        for child in children {
            child.state.lock().await.done = true;
            child.new_part.notify_waiters();
        }
    }

    /// Forks the container: the fork sees every current part through fresh
    /// cursors and receives every later canonical append.
    pub async fn copy(&self) -> FileContainer {
        let st = self.shared.state.lock().await;

        let parts = st
            .parts
            .iter()
            .map(|part| Part {
                offset: part.offset,
                source: part.source.copy(),
            })
            .collect();

        let shared = Arc::new(Shared {
            state: Mutex::new(State {
                parts,
                size: st.size,
                pos: 0,
                current: 0,
                done: st.done,
            }),
            new_part: Notify::new(),
            children: StdMutex::new(Vec::new()),
            parent: Some(Arc::downgrade(&self.shared)),
        });

        self.shared
            .children
            .lock()
            .unwrap()
            .push(Arc::downgrade(&shared));

        trace!("forked container");

        FileContainer { shared }
    }

    /// A fork removes itself from its parent; on a canonical container this
    /// is a no-op.
    pub fn close(&self) {
        let Some(parent) = self.shared.parent.as_ref().and_then(Weak::upgrade) else {
            return;
        };

        let this = Arc::downgrade(&self.shared);
        let mut children = parent.children.lock().unwrap();
        children.retain(|weak| !weak.ptr_eq(&this));
    }

    #[cfg(test)]
    fn fork_count(&self) -> usize {
        let mut children = self.shared.children.lock().unwrap();
        children.retain(|weak| weak.strong_count() > 0);
        children.len()
    }
}

impl Default for FileContainer {
    fn default() -> Self {
        FileContainer::new()
    }
}

impl Drop for FileContainer {
    fn drop(&mut self) {
        self.close();
    }
}
