//! Remuxing/transcoding proxy core for Matroska media.
//!
//! A source MKV is probed over HTTP range requests, its cue/cluster layout
//! is replanned, and an external encoder rebuilds the clusters segment by
//! segment while the rest of the container is assembled in memory. The
//! result is exposed as a virtual, seekable file whose total size is known
//! before a single cluster has been encoded.

pub mod container;
pub mod ebml;
pub mod encoder;
pub mod io;
pub mod mkv;
pub mod remote;

pub use container::{ByteSource, FileContainer, LazyPart, MemorySource};
pub use encoder::{Encoder, EncoderConfig, SegmentedEncoder, StreamingEncoder};
pub use remote::RemoteFile;
