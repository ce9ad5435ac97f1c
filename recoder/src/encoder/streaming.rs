use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use bytes::Bytes;
use serde::Deserialize;
use tokio::process::Command;
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{error, info, warn};

use super::producer::{ProducerEvent, SegmentProducer, SweepMode};
use super::{advance_phase, fetch_segment, Encoder, EncoderConfig, Phase};
use crate::container::{FileContainer, LazyPart, MemorySource};
use crate::io::FileReader;
use crate::mkv::{probe_segment, streaming_header};

#[derive(Debug, Deserialize)]
struct ProbeOutput {
    #[serde(default)]
    streams: Vec<ProbeStream>,
    format: ProbeFormat,
}

#[derive(Debug, Deserialize)]
struct ProbeStream {
    codec_type: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ProbeFormat {
    duration: Option<String>,
}

/// Re-encodes a source that cannot be cue-indexed.
///
/// The external encoder splits on uniform ten second boundaries; every
/// promoted segment is appended to the canonical container as it appears,
/// so forks receive live appends, and the total size is unknown until the
/// encoder exits. The Segment header carries an unknown size and readers
/// block on "more data pending" rather than end of file.
pub struct StreamingEncoder {
    url: String,
    config: EncoderConfig,
    output_dir: PathBuf,
    temp_dir: PathBuf,
    state: Mutex<EncoderState>,
}

struct EncoderState {
    phase: Phase,
    duration_secs: Option<f64>,
    tracks: Option<Bytes>,
    timecode_scale: Option<u64>,
    producer: Option<Arc<SegmentProducer>>,
    canonical: Option<FileContainer>,
    appended: BTreeSet<u64>,
    container_waiters: Vec<oneshot::Sender<FileContainer>>,
}

impl StreamingEncoder {
    pub fn new(url: &str, output_dir: &Path, config: EncoderConfig) -> Arc<Self> {
        Arc::new(StreamingEncoder {
            url: url.to_string(),
            config,
            output_dir: output_dir.to_path_buf(),
            temp_dir: output_dir.join("encoding"),
            state: Mutex::new(EncoderState {
                phase: Phase::Init,
                duration_secs: None,
                tracks: None,
                timecode_scale: None,
                producer: None,
                canonical: None,
                appended: BTreeSet::new(),
                container_waiters: Vec::new(),
            }),
        })
    }

    async fn set_phase(&self, phase: Phase) {
        advance_phase(&mut self.state.lock().await.phase, phase);
    }

    /// Probes the source with the external probe tool; the container's
    /// duration can only come from here since the source has no usable
    /// index.
    async fn probe(&self) -> anyhow::Result<()> {
        self.set_phase(Phase::Probing).await;

        let output = Command::new(&self.config.ffprobe)
            .args([
                "-print_format",
                "json",
                "-loglevel",
                "quiet",
                "-show_format",
                "-show_streams",
                &self.url,
            ])
            .stdin(Stdio::null())
            .output()
            .await
            .context("Failed to run the probe tool")?;

        anyhow::ensure!(output.status.success(), "The probe tool failed");

        let probe: ProbeOutput =
            serde_json::from_slice(&output.stdout).context("Failed to parse the probe output")?;

        let audio = count_streams(&probe, "audio");
        let video = count_streams(&probe, "video");
        info!(audio, video, "probed source streams");

        let duration = probe
            .format
            .duration
            .as_deref()
            .and_then(|d| d.parse::<f64>().ok())
            .context("The probe output carries no duration")?;

        let mut st = self.state.lock().await;
        st.duration_secs = Some(duration);
        advance_phase(&mut st.phase, Phase::Planned);

        Ok(())
    }

    async fn start_encoding(&self) -> anyhow::Result<mpsc::UnboundedReceiver<ProducerEvent>> {
        tokio::fs::create_dir_all(&self.temp_dir).await?;

        let args = ffmpeg_args(&self.url, &self.temp_dir);

        let (producer, events) = SegmentProducer::start(
            &self.config.ffmpeg,
            args,
            self.temp_dir.clone(),
            self.output_dir.clone(),
            SweepMode::Live,
        )?;

        let mut st = self.state.lock().await;
        st.producer = Some(Arc::new(producer));
        advance_phase(&mut st.phase, Phase::Encoding);

        Ok(events)
    }

    async fn event_loop(&self, mut events: mpsc::UnboundedReceiver<ProducerEvent>) {
        while let Some(event) = events.recv().await {
            match event {
                ProducerEvent::Promoted { id, path } => {
                    self.handle_promoted(id, &path).await;
                }
                ProducerEvent::Finished { success } => {
                    self.handle_finished(success).await;
                }
            }
        }
    }

    async fn handle_promoted(&self, id: u64, path: &Path) {
        if self.state.lock().await.tracks.is_none() {
            if let Err(e) = self.probe_tracks(path).await {
                warn!(path = %path.display(), "failed to probe promoted segment: {e:#}");
            }

            if let Err(e) = self.check_if_ready_to_stream().await {
                error!("failed to build the container: {e:#}");
                self.set_phase(Phase::Failed).await;
            }

            // The promoted file is appended by the directory scan inside
            // the container build, or below on the next promotion.
        }

        if let Err(e) = self.append_segment(id, path).await {
            warn!(segment = id, "failed to append promoted segment: {e:#}");
        }
    }

    async fn probe_tracks(&self, path: &Path) -> anyhow::Result<()> {
        let mut io = FileReader::open(path).await?;
        let headers = probe_segment(&mut io).await?;

        let Some(tracks) = headers.tracks else {
            anyhow::bail!("the promoted segment carries no Tracks yet");
        };

        let mut st = self.state.lock().await;
        st.tracks = Some(tracks);
        st.timecode_scale = headers.timecode_scale;

        Ok(())
    }

    /// Builds the canonical container from the streaming header plus every
    /// segment already promoted, then releases parked clients.
    async fn check_if_ready_to_stream(&self) -> anyhow::Result<()> {
        let mut st = self.state.lock().await;

        if st.canonical.is_some() {
            return Ok(());
        }

        let Some(tracks) = st.tracks.as_ref() else {
            return Ok(());
        };

        let duration_secs = st
            .duration_secs
            .context("The container cannot be built before the source was probed")?;

        let scale = st.timecode_scale.unwrap_or(1_000_000);
        let duration = duration_secs * 1_000_000_000.0 / scale as f64;

        let header = streaming_header(scale, duration, tracks)?;

        let container = FileContainer::new();
        container
            .write_element(Box::new(MemorySource::new(header.clone())), header.len() as u64)
            .await;

        // Segments promoted before the header was ready are already on
        // disk; pick them up in order.
        let mut promoted = Vec::new();
        let mut dir = tokio::fs::read_dir(&self.output_dir).await?;

        while let Some(entry) = dir.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();

            if let Some(id) = crate::mkv::parse_segment_file_name(&name) {
                promoted.push((id, entry.path()));
            }
        }

        promoted.sort();

        for waiter in st.container_waiters.drain(..) {
            let _ = waiter.send(container.copy().await);
        }

        st.canonical = Some(container);
        advance_phase(&mut st.phase, Phase::Ready);

        info!("streaming container ready");

        drop(st);

        for (id, path) in promoted {
            if let Err(e) = self.append_segment(id, &path).await {
                warn!(segment = id, "failed to append promoted segment: {e:#}");
            }
        }

        Ok(())
    }

    /// Appends one promoted segment as a lazy part sized to the file. The
    /// canonical mirrors the append into every live fork.
    async fn append_segment(&self, id: u64, path: &Path) -> anyhow::Result<()> {
        let mut st = self.state.lock().await;

        if st.canonical.is_none() || st.appended.contains(&id) {
            return Ok(());
        }

        let producer = st
            .producer
            .clone()
            .context("No producer is running for this stream")?;

        let size = tokio::fs::metadata(path).await?.len();
        let output_dir = self.output_dir.clone();

        let part = LazyPart::new(size, move || {
            fetch_segment(producer.clone(), output_dir.clone(), id, size)
        });

        if let Some(canonical) = st.canonical.as_ref() {
            canonical.write_element(Box::new(part), size).await;
        }

        st.appended.insert(id);

        Ok(())
    }

    async fn handle_finished(&self, success: bool) {
        let mut st = self.state.lock().await;

        if let Some(canonical) = st.canonical.as_ref() {
            canonical.mark_done().await;
        }

        if success {
            advance_phase(&mut st.phase, Phase::Done);
        } else {
            advance_phase(&mut st.phase, Phase::Failed);
            st.container_waiters.clear();
        }
    }
}

#[async_trait]
impl Encoder for StreamingEncoder {
    async fn prepare(self: Arc<Self>) -> anyhow::Result<()> {
        let result = async {
            self.probe().await?;
            self.start_encoding().await
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

fn count_streams(probe: &ProbeOutput, kind: &str) -> usize {
    probe
        .streams
        .iter()
        .filter(|s| s.codec_type.as_deref() == Some(kind))
        .count()
}

/// Uniform ten second splits; everything else matches the cue-driven
/// command line.
fn ffmpeg_args(url: &str, temp_dir: &Path) -> Vec<String> {
    let mut args: Vec<String> = [
        "-i", url, "-sn", "-codec", "copy", "-map", "0",
        "-c:a", "aac", "-strict", "-2", "-b:a", "384k",
        "-f", "segment", "-segment_format", "mkv",
        "-segment_time", "10",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect();

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

    #[test]
    fn probe_output_parses() {
        let raw = r#"{
            "streams": [
                {"codec_type": "video"},
                {"codec_type": "audio"},
                {"codec_type": "audio"}
            ],
            "format": {"duration": "1325.048000"}
        }"#;

        let probe: ProbeOutput = serde_json::from_str(raw).unwrap();

        assert_eq!(1, count_streams(&probe, "video"));
        assert_eq!(2, count_streams(&probe, "audio"));
        assert_eq!(Some("1325.048000"), probe.format.duration.as_deref());
    }

    #[test]
    fn args_split_on_uniform_time() {
        let args = ffmpeg_args("http://src/live", Path::new("/tmp/enc"));

        assert!(args.windows(2).any(|w| w[0] == "-segment_time" && w[1] == "10"));
        assert_eq!("/tmp/enc/output-%05d.mkv", args.last().unwrap());
    }
}
