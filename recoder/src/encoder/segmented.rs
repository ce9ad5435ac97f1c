use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{error, info, warn};

use super::producer::{ProducerEvent, SegmentProducer, SweepMode};
use super::{advance_phase, cue_time_seconds, fetch_segment, Encoder, EncoderConfig, Phase};
use crate::container::{FileContainer, LazyPart, MemorySource};
use crate::io::FileReader;
use crate::mkv::{self, probe_segment, probe_source, SourceInfo};
use crate::remote::RemoteFile;

/// Re-encodes a cue-indexed source into a container whose total size is
/// known before any cluster exists.
///
/// The source is probed over HTTP for Cues, Info and the Segment size; the
/// external encoder is told to split exactly at the cue times; and the
/// canonical container is one header part plus a lazy part per cue slot.
/// Tracks cannot come from the source (the audio is re-encoded), so the
/// container is built once the first promoted segment yields them.
pub struct SegmentedEncoder {
    url: String,
    config: EncoderConfig,
    output_dir: PathBuf,
    temp_dir: PathBuf,
    state: Mutex<EncoderState>,
}

struct EncoderState {
    phase: Phase,
    source: Option<SourceInfo>,
    cue_times: Vec<String>,
    tracks: Option<Bytes>,
    producer: Option<Arc<SegmentProducer>>,
    canonical: Option<FileContainer>,
    container_waiters: Vec<oneshot::Sender<FileContainer>>,
}

impl SegmentedEncoder {
    pub fn new(url: &str, output_dir: &Path, config: EncoderConfig) -> Arc<Self> {
        Arc::new(SegmentedEncoder {
            url: url.to_string(),
            config,
            output_dir: output_dir.to_path_buf(),
            temp_dir: output_dir.join("encoding"),
            state: Mutex::new(EncoderState {
                phase: Phase::Init,
                source: None,
                cue_times: Vec::new(),
                tracks: None,
                producer: None,
                canonical: None,
                container_waiters: Vec::new(),
            }),
        })
    }

    async fn set_phase(&self, phase: Phase) {
        advance_phase(&mut self.state.lock().await.phase, phase);
    }

    async fn probe(&self) -> anyhow::Result<()> {
        self.set_phase(Phase::Probing).await;

        let client = reqwest::Client::new();
        let mut remote = RemoteFile::open(client, &self.url)
            .await
            .context("Failed to open the remote source")?;

        let source = probe_source(&mut remote)
            .await
            .context("Failed to probe the source structure")?;

        let cue_times = source.cues.keys().map(|&ms| cue_time_seconds(ms)).collect();

        let mut st = self.state.lock().await;
        st.source = Some(source);
        st.cue_times = cue_times;
        advance_phase(&mut st.phase, Phase::Planned);

        Ok(())
    }

    /// Spawns the external encoder for segments `start..`, optionally
    /// bounded by `end`, and returns the producer's event stream.
    async fn start_encoding(
        &self,
        start: u64,
        end: Option<u64>,
    ) -> anyhow::Result<mpsc::UnboundedReceiver<ProducerEvent>> {
        tokio::fs::create_dir_all(&self.temp_dir).await?;

        let mut st = self.state.lock().await;

        anyhow::ensure!(
            (start as usize) < st.cue_times.len(),
            "start segment {start} is beyond the last cue"
        );

        if let Some(end) = end {
            anyhow::ensure!(
                (end as usize) + 1 < st.cue_times.len(),
                "end segment {end} has no closing cue time"
            );
        }

        let end_id = end.unwrap_or(st.cue_times.len() as u64 - 1);
        let args = ffmpeg_args(&self.url, &st.cue_times, start, end, &self.temp_dir);

        let (producer, events) = SegmentProducer::start(
            &self.config.ffmpeg,
            args,
            self.temp_dir.clone(),
            self.output_dir.clone(),
            SweepMode::Bounded { start, end: end_id },
        )?;

        st.producer = Some(Arc::new(producer));
        advance_phase(&mut st.phase, Phase::Encoding);

        Ok(events)
    }

    async fn event_loop(&self, mut events: mpsc::UnboundedReceiver<ProducerEvent>) {
        while let Some(event) = events.recv().await {
            match event {
                ProducerEvent::Promoted { id: _, path } => {
                    self.handle_promoted(&path).await;
                }
                ProducerEvent::Finished { success } => {
                    self.handle_finished(success).await;
                }
            }
        }
    }

    /// Lazily pulls Tracks out of a promoted segment. Failures are not
    /// fatal; a later segment can still provide them.
    async fn handle_promoted(&self, path: &Path) {
        if self.state.lock().await.tracks.is_some() {
            return;
        }

        let headers = async {
            let mut io = FileReader::open(path).await?;

            Ok::<_, anyhow::Error>(probe_segment(&mut io).await?)
        }
        .await;

        let tracks = match headers {
            Ok(headers) => headers.tracks,
            Err(e) => {
                warn!(path = %path.display(), "failed to probe promoted segment: {e:#}");
                return;
            }
        };

        let Some(tracks) = tracks else {
            warn!(path = %path.display(), "promoted segment carries no Tracks yet");
            return;
        };

        self.state.lock().await.tracks = Some(tracks);

        if let Err(e) = self.check_if_ready_to_stream().await {
            error!("failed to build the container: {e:#}");
            self.set_phase(Phase::Failed).await;
        }
    }

    /// Builds the canonical container and releases parked clients once
    /// every piece of information has arrived.
    async fn check_if_ready_to_stream(&self) -> anyhow::Result<()> {
        let mut st = self.state.lock().await;

        if st.canonical.is_some() {
            return Ok(());
        }

        let (Some(source), Some(tracks)) = (st.source.as_ref(), st.tracks.as_ref()) else {
            return Ok(());
        };

        let producer = st
            .producer
            .clone()
            .context("The container cannot be built before encoding starts")?;

        let layout = mkv::plan(source, tracks)?;

        let container = FileContainer::new();
        container
            .write_element(
                Box::new(MemorySource::new(layout.header.clone())),
                layout.header.len() as u64,
            )
            .await;

        for (id, &slot) in layout.cluster_slots.iter().enumerate() {
            let producer = producer.clone();
            let output_dir = self.output_dir.clone();

            let part = LazyPart::new(slot, move || {
                fetch_segment(producer.clone(), output_dir.clone(), id as u64, slot)
            });

            container.write_element(Box::new(part), slot).await;
        }

        container.mark_done().await;

        info!(total_size = layout.total_size, "container ready");

        for waiter in st.container_waiters.drain(..) {
            let _ = waiter.send(container.copy().await);
        }

        st.canonical = Some(container);
        advance_phase(&mut st.phase, Phase::Ready);

        Ok(())
    }

    async fn handle_finished(&self, success: bool) {
        let mut st = self.state.lock().await;

        if success {
            advance_phase(&mut st.phase, Phase::Done);
        } else {
            advance_phase(&mut st.phase, Phase::Failed);

            // Parked clients can never be served now.
            st.container_waiters.clear();
        }
    }
}

#[async_trait]
impl Encoder for SegmentedEncoder {
    async fn prepare(self: Arc<Self>) -> anyhow::Result<()> {
        let result = async {
            self.probe().await?;
            self.start_encoding(0, None).await
        }
        .await;

        let events = match result {
            Ok(events) => events,
            Err(e) => {
                self.set_phase(Phase::Failed).await;

                return Err(e);
            }
        };

        let encoder = self.clone();
        tokio::spawn(async move { encoder.event_loop(events).await });

        Ok(())
    }

    async fn container(&self) -> anyhow::Result<FileContainer> {
        let receiver = {
            let mut st = self.state.lock().await;

            if let Some(canonical) = &st.canonical {
                return Ok(canonical.copy().await);
            }

            anyhow::ensure!(
                st.phase != Phase::Failed,
                "the encode failed before a container could be built"
            );

            let (tx, rx) = oneshot::channel();
            st.container_waiters.push(tx);

            rx
        };

        receiver
            .await
            .map_err(|_| anyhow::anyhow!("the encoder went away before the container was ready"))
    }

    async fn stop(&self) {
        if let Some(producer) = self.state.lock().await.producer.as_ref() {
            producer.stop();
        }
    }
}

/// The external encoder command line: copy everything but subtitles,
/// re-encode audio to 384 kbps AAC, and split into Matroska segments at
/// exactly the cue times. Resumes pass the initial offset and a starting
/// index; bounded encodes stop at the closing cue time.
fn ffmpeg_args(
    url: &str,
    cue_times: &[String],
    start: u64,
    end: Option<u64>,
    temp_dir: &Path,
) -> Vec<String> {
    let mut args: Vec<String> = [
        "-i", url, "-sn", "-codec", "copy", "-map", "0",
        "-c:a", "aac", "-strict", "-2", "-b:a", "384k",
        "-f", "segment", "-segment_format", "mkv",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect();

    args.push("-segment_times".to_string());
    args.push(cue_times[start as usize + 1..].join(","));

    if start > 0 {
        let offset = &cue_times[start as usize];

        args.extend([
            "-segment_start_number".to_string(),
            (start - 1).to_string(),
            "-initial_offset".to_string(),
            offset.clone(),
            "-ss".to_string(),
            offset.clone(),
        ]);
    }

    if let Some(end) = end {
        args.push("-to".to_string());
        args.push(cue_times[end as usize + 1].clone());
    }

    args.push(
        temp_dir
            .join("output-%05d.mkv")
            .to_string_lossy()
            .into_owned(),
    );

    args
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;

    fn cue_times() -> Vec<String> {
        vec!["0".into(), "2".into(), "5.5".into(), "10".into()]
    }

    #[test]
    fn args_for_a_fresh_encode() {
        let args = ffmpeg_args("http://src/file.mkv", &cue_times(), 0, None, Path::new("/tmp/enc"));

        assert_eq!(
            vec![
                "-i", "http://src/file.mkv", "-sn", "-codec", "copy", "-map", "0",
                "-c:a", "aac", "-strict", "-2", "-b:a", "384k",
                "-f", "segment", "-segment_format", "mkv",
                "-segment_times", "2,5.5,10",
                "/tmp/enc/output-%05d.mkv",
            ],
            args
        );
    }

    #[test]
    fn args_for_a_resume() {
        let args = ffmpeg_args("u", &cue_times(), 2, None, Path::new("/t"));

        let tail: Vec<_> = args.iter().skip(17).map(String::as_str).collect();

        assert_eq!(
            vec![
                "-segment_times", "10",
                "-segment_start_number", "1",
                "-initial_offset", "5.5",
                "-ss", "5.5",
                "/t/output-%05d.mkv",
            ],
            tail
        );
    }

    #[test]
    fn args_for_a_bounded_range() {
        let args = ffmpeg_args("u", &cue_times(), 0, Some(1), Path::new("/t"));

        assert!(args.windows(2).any(|w| w[0] == "-to" && w[1] == "5.5"));
    }
}
