use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use recoder::container::FileContainer;
use recoder::{Encoder, EncoderConfig, SegmentedEncoder, StreamingEncoder};
use tracing::{error, info};
use uuid::Uuid;

/// One registered source URL: a uuid identity, a per-stream output
/// directory and a running encoder.
pub struct Stream {
    pub identifier: String,
    pub url: String,
    encoder: Arc<dyn Encoder>,
}

impl Stream {
    /// Creates the stream directory, picks the encoder variant and kicks
    /// off `prepare` in the background; early clients park inside
    /// [container](Stream::container) until it is ready.
    pub async fn create(
        url: &str,
        streaming: bool,
        folder: &Path,
        config: EncoderConfig,
    ) -> anyhow::Result<Arc<Self>> {
        let identifier = Uuid::new_v4().to_string();
        let output_dir = folder.join(&identifier);

        tokio::fs::create_dir_all(&output_dir).await?;

        let encoder: Arc<dyn Encoder> = if streaming {
            StreamingEncoder::new(url, &output_dir, config)
        } else {
            SegmentedEncoder::new(url, &output_dir, config)
        };

        info!(stream = %identifier, url, streaming, "registered stream");

        {
            let encoder = encoder.clone();
            let identifier = identifier.clone();

            tokio::spawn(async move {
                if let Err(e) = encoder.prepare().await {
                    error!(stream = %identifier, "failed to prepare encode: {e:#}");
                }
            });
        }

        Ok(Arc::new(Stream {
            identifier,
            url: url.to_string(),
            encoder,
        }))
    }

    /// A fresh fork of the stream's container for one client request.
    pub async fn container(&self) -> anyhow::Result<FileContainer> {
        self.encoder.container().await
    }

    pub async fn stop(&self) {
        self.encoder.stop().await;
    }
}

#[derive(Default)]
pub struct StreamMap {
    by_id: HashMap<String, Arc<Stream>>,
    by_url: HashMap<String, String>,
}

impl StreamMap {
    pub fn get(&self, identifier: &str) -> Option<Arc<Stream>> {
        self.by_id.get(identifier).cloned()
    }

    pub fn find_by_url(&self, url: &str) -> Option<Arc<Stream>> {
        self.by_url.get(url).and_then(|id| self.get(id))
    }

    pub fn insert(&mut self, stream: Arc<Stream>) {
        self.by_url
            .insert(stream.url.clone(), stream.identifier.clone());
        self.by_id.insert(stream.identifier.clone(), stream);
    }

    pub fn all(&self) -> Vec<Arc<Stream>> {
        self.by_id.values().cloned().collect()
    }
}
