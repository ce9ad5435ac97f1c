use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use tokio::fs;
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::mkv::parse_segment_file_name;

/// How the directory sweep treats files relative to the encode window.
#[derive(Debug, Clone, Copy)]
pub enum SweepMode {
    /// Cue-driven encode producing segments `start..=end`.
    Bounded { start: u64, end: u64 },
    /// Live encode with no known end.
    Live,
}

#[derive(Debug)]
pub enum ProducerEvent {
    /// A finished segment file was moved into the output directory.
    Promoted { id: u64, path: PathBuf },
    /// The external encoder is gone and the final sweep has run.
    Finished { success: bool },
}

/// Supervises the external encoder and keeps the output directory
/// populated with finished `output-NNNNN.mkv` files.
///
/// The encoder writes into a temp directory; a periodic sweep promotes
/// every file but the one still being written, deletes files below the
/// window, and resolves waiters registered for a segment id. Dropping the
/// producer (or calling [stop](SegmentProducer::stop)) kills the encoder
/// and fails all remaining waiters.
pub struct SegmentProducer {
    inner: Arc<ProducerInner>,
    stop: StdMutex<Option<oneshot::Sender<()>>>,
}

struct ProducerInner {
    temp_dir: PathBuf,
    output_dir: PathBuf,
    mode: SweepMode,
    /// Cleared on teardown, failing every waiter and all later arrivals.
    waiters: StdMutex<Option<HashMap<u64, Vec<oneshot::Sender<()>>>>>,
    events: mpsc::UnboundedSender<ProducerEvent>,
}

impl SegmentProducer {
    /// Spawns the external encoder and the sweep loop.
    pub fn start(
        ffmpeg: &Path,
        args: Vec<String>,
        temp_dir: PathBuf,
        output_dir: PathBuf,
        mode: SweepMode,
    ) -> anyhow::Result<(Self, mpsc::UnboundedReceiver<ProducerEvent>)> {
        info!(ffmpeg = %ffmpeg.display(), ?args, "starting external encoder");

        let child = Command::new(ffmpeg)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()?;

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (stop_tx, stop_rx) = oneshot::channel();

        let inner = Arc::new(ProducerInner {
            temp_dir,
            output_dir,
            mode,
            waiters: StdMutex::new(Some(HashMap::new())),
            events: events_tx,
        });

        tokio::spawn(run(inner.clone(), child, stop_rx));

        Ok((
            SegmentProducer {
                inner,
                stop: StdMutex::new(Some(stop_tx)),
            },
            events_rx,
        ))
    }

    /// Resolves once the segment has been promoted. Fails if the producer
    /// is torn down first.
    pub async fn wait_for_segment(&self, id: u64, path: &Path) -> anyhow::Result<()> {
        let receiver = {
            let mut waiters = self.inner.waiters.lock().unwrap();

            match waiters.as_mut() {
                None => anyhow::bail!("encoding stopped before segment {id} was produced"),
                Some(map) => {
                    let (tx, rx) = oneshot::channel();
                    map.entry(id).or_default().push(tx);

                    rx
                }
            }
        };

        // The sweep may have promoted the file between the caller's check
        // and the registration above.
        if fs::try_exists(path).await.unwrap_or(false) {
            return Ok(());
        }

        receiver
            .await
            .map_err(|_| anyhow::anyhow!("encoding stopped before segment {id} was produced"))
    }

    /// Kills the encoder and finalises without promoting the last file.
    pub fn stop(&self) {
        if let Some(stop) = self.stop.lock().unwrap().take() {
            let _ = stop.send(());
        }
    }
}

enum Exit {
    Status(std::io::Result<std::process::ExitStatus>),
    Stopped,
}

async fn run(inner: Arc<ProducerInner>, mut child: Child, mut stop: oneshot::Receiver<()>) {
    let mut ticker = interval(Duration::from_secs(1));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    // Awaiting the sweep inline makes the ticker skip while a slow sweep is
    // still running.
    let exit = loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(e) = inner.sweep(false).await {
                    warn!("sweep failed: {e:#}");
                }
            }
            status = child.wait() => break Exit::Status(status),
            _ = &mut stop => break Exit::Stopped,
        }
    };

    let success = match exit {
        Exit::Status(Ok(status)) if status.success() => {
            info!("external encoder finished");
            true
        }
        Exit::Status(Ok(status)) => {
            error!(?status, "external encoder failed");
            false
        }
        Exit::Status(Err(e)) => {
            error!("failed to wait for the external encoder: {e}");
            false
        }
        Exit::Stopped => {
            info!("stopping external encoder");

            if let Err(e) = child.kill().await {
                warn!("failed to kill the external encoder: {e}");
            }

            false
        }
    };

    if let Err(e) = inner.sweep(success).await {
        warn!("final sweep failed: {e:#}");
    }

    inner.fail_remaining_waiters();

    let _ = inner.events.send(ProducerEvent::Finished { success });
}

impl ProducerInner {
    /// One pass over the temp directory in name order: delete files below
    /// the window, promote finished files, and leave the last file alone
    /// unless we are stopping successfully (and, for a bounded encode, it
    /// is the final segment).
    async fn sweep(&self, stopping: bool) -> anyhow::Result<()> {
        let mut names = Vec::new();
        let mut dir = fs::read_dir(&self.temp_dir).await?;

        while let Some(entry) = dir.next_entry().await? {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }

        names.sort();

        let count = names.len();

        for (index, name) in names.iter().enumerate() {
            let Some(id) = parse_segment_file_name(name) else {
                continue;
            };

            let path = self.temp_dir.join(name);

            if let SweepMode::Bounded { start, .. } = self.mode {
                if id < start {
                    // Below the window; the encoder never reopens these.
                    if count > 1 {
                        fs::remove_file(&path).await?;
                        debug!(segment = id, "deleted segment below the encode window");
                    }

                    continue;
                }
            }

            if index + 1 == count && !self.may_move_last(stopping, id) {
                continue;
            }

            let promoted = self.output_dir.join(name);
            fs::rename(&path, &promoted).await?;
            debug!(segment = id, "promoted segment");

            self.fulfil(id);

            let _ = self.events.send(ProducerEvent::Promoted { id, path: promoted });
        }

        Ok(())
    }

    /// The encoder may still be writing the last file in the directory.
    fn may_move_last(&self, stopping: bool, id: u64) -> bool {
        match self.mode {
            SweepMode::Bounded { end, .. } => stopping && id == end,
            SweepMode::Live => stopping,
        }
    }

    fn fulfil(&self, id: u64) {
        let mut waiters = self.waiters.lock().unwrap();

        if let Some(map) = waiters.as_mut() {
            for waiter in map.remove(&id).unwrap_or_default() {
                let _ = waiter.send(());
            }
        }
    }

    fn fail_remaining_waiters(&self) {
        let pending = self.waiters.lock().unwrap().take();

        if let Some(map) = pending {
            let open: usize = map.values().map(Vec::len).sum();

            if open > 0 {
                warn!(waiters = open, "failing segment waiters on teardown");
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::mkv::segment_file_name;
    use std::time::Duration;
    use tokio::time::timeout;

    fn test_inner(
        temp_dir: &Path,
        output_dir: &Path,
        mode: SweepMode,
    ) -> (Arc<ProducerInner>, mpsc::UnboundedReceiver<ProducerEvent>) {
        let (events, events_rx) = mpsc::unbounded_channel();

        (
            Arc::new(ProducerInner {
                temp_dir: temp_dir.to_path_buf(),
                output_dir: output_dir.to_path_buf(),
                mode,
                waiters: StdMutex::new(Some(HashMap::new())),
                events,
            }),
            events_rx,
        )
    }

    async fn touch(dir: &Path, id: u64) {
        fs::write(dir.join(segment_file_name(id)), b"x").await.unwrap();
    }

    async fn listing(dir: &Path) -> Vec<String> {
        let mut names = Vec::new();
        let mut entries = fs::read_dir(dir).await.unwrap();

        while let Some(entry) = entries.next_entry().await.unwrap() {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }

        names.sort();
        names
    }

    #[tokio::test]
    async fn sweep_keeps_the_last_file() {
        let temp = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        let (inner, mut events) =
            test_inner(temp.path(), out.path(), SweepMode::Bounded { start: 0, end: 1 });

        touch(temp.path(), 0).await;
        touch(temp.path(), 1).await;

        inner.sweep(false).await.unwrap();

        assert_eq!(vec![segment_file_name(1)], listing(temp.path()).await);
        assert_eq!(vec![segment_file_name(0)], listing(out.path()).await);

        assert!(matches!(
            events.try_recv(),
            Ok(ProducerEvent::Promoted { id: 0, .. })
        ));

        // A successful stop moves the final segment too.
        inner.sweep(true).await.unwrap();

        assert!(listing(temp.path()).await.is_empty());
        assert_eq!(
            vec![segment_file_name(0), segment_file_name(1)],
            listing(out.path()).await
        );
    }

    #[tokio::test]
    async fn sweep_deletes_files_below_the_window() {
        let temp = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        let (inner, _events) =
            test_inner(temp.path(), out.path(), SweepMode::Bounded { start: 2, end: 5 });

        touch(temp.path(), 0).await;
        touch(temp.path(), 1).await;
        touch(temp.path(), 2).await;

        inner.sweep(false).await.unwrap();

        // 0 and 1 are gone, 2 is kept because it is the last file.
        assert_eq!(vec![segment_file_name(2)], listing(temp.path()).await);
        assert!(listing(out.path()).await.is_empty());
    }

    #[tokio::test]
    async fn sweep_ignores_foreign_files() {
        let temp = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        let (inner, _events) = test_inner(temp.path(), out.path(), SweepMode::Live);

        fs::write(temp.path().join("noise.txt"), b"x").await.unwrap();
        touch(temp.path(), 0).await;
        touch(temp.path(), 1).await;

        inner.sweep(false).await.unwrap();

        assert_eq!(
            vec!["noise.txt".to_string(), segment_file_name(1)],
            listing(temp.path()).await
        );
        assert_eq!(vec![segment_file_name(0)], listing(out.path()).await);
    }

    #[tokio::test]
    async fn live_mode_moves_the_last_file_only_after_exit() {
        let temp = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        let (inner, _events) = test_inner(temp.path(), out.path(), SweepMode::Live);

        touch(temp.path(), 0).await;

        inner.sweep(false).await.unwrap();
        assert_eq!(vec![segment_file_name(0)], listing(temp.path()).await);

        inner.sweep(true).await.unwrap();
        assert_eq!(vec![segment_file_name(0)], listing(out.path()).await);
    }

    #[tokio::test]
    async fn waiters_resolve_on_promotion() {
        let temp = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        let (inner, _events) =
            test_inner(temp.path(), out.path(), SweepMode::Bounded { start: 0, end: 9 });

        let producer = Arc::new(SegmentProducer {
            inner: inner.clone(),
            stop: StdMutex::new(None),
        });

        let path = out.path().join(segment_file_name(0));

        let waiter = {
            let producer = producer.clone();
            let path = path.clone();

            tokio::spawn(async move { producer.wait_for_segment(0, &path).await })
        };

        tokio::task::yield_now().await;

        touch(temp.path(), 0).await;
        touch(temp.path(), 1).await;
        inner.sweep(false).await.unwrap();

        timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn waiters_fail_on_teardown() {
        let temp = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        let (inner, _events) = test_inner(temp.path(), out.path(), SweepMode::Live);

        let producer = Arc::new(SegmentProducer {
            inner: inner.clone(),
            stop: StdMutex::new(None),
        });

        let path = out.path().join(segment_file_name(7));

        let waiter = {
            let producer = producer.clone();
            let path = path.clone();

            tokio::spawn(async move { producer.wait_for_segment(7, &path).await })
        };

        tokio::task::yield_now().await;
        inner.fail_remaining_waiters();

        let result = timeout(Duration::from_secs(1), waiter).await.unwrap().unwrap();
        assert!(result.is_err());

        // Later arrivals fail immediately.
        assert!(producer.wait_for_segment(8, &path).await.is_err());
    }

    #[tokio::test]
    async fn waiting_for_an_already_promoted_segment_returns_at_once() {
        let temp = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        let (inner, _events) = test_inner(temp.path(), out.path(), SweepMode::Live);

        let producer = SegmentProducer {
            inner,
            stop: StdMutex::new(None),
        };

        let path = out.path().join(segment_file_name(3));
        fs::write(&path, b"x").await.unwrap();

        timeout(Duration::from_secs(1), producer.wait_for_segment(3, &path))
            .await
            .unwrap()
            .unwrap();
    }
}
