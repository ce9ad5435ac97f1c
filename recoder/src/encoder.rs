use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use bytes::Bytes;
use tracing::info;

use crate::container::FileContainer;
use crate::mkv::{segment_file_name, wrap_segment};

mod producer;
mod segmented;
mod streaming;

pub use producer::{ProducerEvent, SegmentProducer, SweepMode};
pub use segmented::SegmentedEncoder;
pub use streaming::StreamingEncoder;

/// Paths of the external tools the producer drives.
#[derive(Debug, Clone)]
pub struct EncoderConfig {
    pub ffmpeg: PathBuf,
    pub ffprobe: PathBuf,
}

/// Turns a client request into a readable container backed by a running
/// re-encode.
#[async_trait]
pub trait Encoder: Send + Sync {
    /// Probes the source and starts the external encoder. Failures here
    /// mean the encoder was never started.
    async fn prepare(self: Arc<Self>) -> anyhow::Result<()>;

    /// A fork of the canonical container. Requests arriving before the
    /// canonical exists are parked and fulfilled once it is built.
    async fn container(&self) -> anyhow::Result<FileContainer>;

    /// Tears the producer down; pending segment waiters fail.
    async fn stop(&self);
}

/// Lifecycle of an encode. Transitions are one-way.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Phase {
    Init,
    Probing,
    Planned,
    Encoding,
    Ready,
    Done,
    Failed,
}

pub(crate) fn advance_phase(phase: &mut Phase, next: Phase) {
    info!(from = ?*phase, to = ?next, "encoder phase");
    *phase = next;
}

/// Formats a cue time in milliseconds as the decimal seconds ffmpeg
/// expects, without a trailing fraction for whole seconds.
pub(crate) fn cue_time_seconds(ms: u64) -> String {
    if ms % 1000 == 0 {
        return format!("{}", ms / 1000);
    }

    let mut out = format!("{}.{:03}", ms / 1000, ms % 1000);

    while out.ends_with('0') {
        out.pop();
    }

    out
}

/// Resolves one planned cluster slot: waits for the segment file to be
/// promoted, then wraps its clusters padded to the slot size.
pub(crate) async fn fetch_segment(
    producer: Arc<SegmentProducer>,
    output_dir: PathBuf,
    id: u64,
    expected_size: u64,
) -> anyhow::Result<Bytes> {
    let path = output_dir.join(segment_file_name(id));

    if !tokio::fs::try_exists(&path).await.unwrap_or(false) {
        producer.wait_for_segment(id, &path).await?;
    }

    let wrapped = wrap_segment(&path, expected_size)
        .await
        .with_context(|| format!("Failed to wrap segment {id}"))?;

    Ok(wrapped)
}

#[cfg(test)]
mod test {
    use super::*;
    use test_case::test_case;

    #[test_case(0, "0")]
    #[test_case(2000, "2")]
    #[test_case(1500, "1.5")]
    #[test_case(1, "0.001")]
    #[test_case(62125, "62.125")]
    #[test_case(100, "0.1")]
    fn cue_times(ms: u64, expected: &str) {
        assert_eq!(expected, cue_time_seconds(ms));
    }
}
