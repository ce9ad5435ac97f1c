use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::header::{
    ACCEPT_RANGES, CONTENT_LENGTH, CONTENT_RANGE, CONTENT_TYPE, RANGE,
};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Redirect, Response};
use axum::routing::get;
use axum::Router;
use bytes::Bytes;
use recoder::container::FileContainer;
use recoder::EncoderConfig;
use tokio::sync::Mutex;
use tracing_subscriber::EnvFilter;

mod cli;
mod stream;

use cli::Recoderd;
use stream::{Stream, StreamMap};

const READ_CHUNK: usize = 64 * 1024;

struct App {
    config: EncoderConfig,
    folder: PathBuf,
    streams: Mutex<StreamMap>,
}

#[tokio::main]
async fn main() {
    let flags = Recoderd::from_env_or_exit();

    let default_level = match flags.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    if let Err(e) = run(flags).await {
        eprintln!("{e:?}");
    }
}

async fn run(flags: Recoderd) -> anyhow::Result<()> {
    let config = EncoderConfig {
        ffmpeg: flags.ffmpeg.unwrap_or_else(|| PathBuf::from("./ffmpeg")),
        ffprobe: flags.ffprobe.unwrap_or_else(|| PathBuf::from("./ffprobe")),
    };

    let folder = flags.folder.unwrap_or_else(|| PathBuf::from("./unpack"));
    let port = flags.port.unwrap_or(8888);

    tokio::fs::create_dir_all(&folder)
        .await
        .with_context(|| format!("Failed to create output folder {folder:?}"))?;

    let app = Arc::new(App {
        config,
        folder,
        streams: Mutex::new(StreamMap::default()),
    });

    let router = Router::new()
        .route("/", get(register))
        .route("/{id}/{filename}", get(serve))
        .with_state(app.clone());

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port)).await?;
    tracing::info!(port, "listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown(app))
        .await?;

    Ok(())
}

/// On ctrl-c, kill every running encode before the server exits.
async fn shutdown(app: Arc<App>) {
    if tokio::signal::ctrl_c().await.is_err() {
        return;
    }

    tracing::info!("shutting down");

    for stream in app.streams.lock().await.all() {
        stream.stop().await;
    }
}

/// Registers the source URL if it is new and redirects to the stream's
/// stable location.
async fn register(
    State(app): State<Arc<App>>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let Some(url) = params.get("url") else {
        return (StatusCode::BAD_REQUEST, "Missing argument: url").into_response();
    };

    let streaming = matches!(
        params.get("streaming").map(String::as_str),
        Some("1") | Some("true")
    );

    let mut streams = app.streams.lock().await;

    let stream = match streams.find_by_url(url) {
        Some(stream) => stream,
        None => {
            match Stream::create(url, streaming, &app.folder, app.config.clone()).await {
                Ok(stream) => {
                    streams.insert(stream.clone());

                    stream
                }
                Err(e) => {
                    return (StatusCode::INTERNAL_SERVER_ERROR, format!("{e:#}")).into_response();
                }
            }
        }
    };

    let location = format!(
        "/{}/{}",
        stream.identifier,
        urlencoding::encode(&basename(url))
    );

    Redirect::to(&location).into_response()
}

/// Streams the assembled container with standard range semantics when the
/// total size is known, or as an unsized live stream otherwise.
async fn serve(
    State(app): State<Arc<App>>,
    Path((id, _filename)): Path<(String, String)>,
    headers: HeaderMap,
) -> Response {
    let stream = app.streams.lock().await.get(&id);

    let Some(stream) = stream else {
        return StatusCode::NOT_FOUND.into_response();
    };

    let container = match stream.container().await {
        Ok(container) => container,
        Err(e) => {
            return (StatusCode::INTERNAL_SERVER_ERROR, format!("{e:#}")).into_response();
        }
    };

    let total = container.size().await;

    let mut response = HeaderMap::new();
    response.insert(CONTENT_TYPE, HeaderValue::from_static("video/x-matroska"));

    if total == 0 {
        // Still growing; the length is unknown and ranges cannot be served.
        let body = Body::from_stream(container_stream(container, None));

        return (StatusCode::OK, response, body).into_response();
    }

    response.insert(ACCEPT_RANGES, HeaderValue::from_static("bytes"));

    let range = headers
        .get(RANGE)
        .and_then(|value| value.to_str().ok())
        .map(|value| parse_range(value, total));

    match range {
        None => {
            response.insert(CONTENT_LENGTH, HeaderValue::from(total));

            let body = Body::from_stream(container_stream(container, Some(total)));

            (StatusCode::OK, response, body).into_response()
        }
        Some(Ok((start, end))) => {
            if let Err(e) = container.seek(start).await {
                return (StatusCode::INTERNAL_SERVER_ERROR, format!("{e:#}")).into_response();
            }

            let content_range = format!("bytes {start}-{}/{total}", end - 1);
            let Ok(content_range) = HeaderValue::from_str(&content_range) else {
                return StatusCode::INTERNAL_SERVER_ERROR.into_response();
            };

            response.insert(CONTENT_LENGTH, HeaderValue::from(end - start));
            response.insert(CONTENT_RANGE, content_range);

            let body = Body::from_stream(container_stream(container, Some(end - start)));

            (StatusCode::PARTIAL_CONTENT, response, body).into_response()
        }
        Some(Err(e)) => (StatusCode::RANGE_NOT_SATISFIABLE, format!("{e:#}")).into_response(),
    }
}

/// Adapts a container fork into a chunked body stream. Dropping the stream
/// on client disconnect drops the fork, which deregisters itself.
fn container_stream(
    container: FileContainer,
    limit: Option<u64>,
) -> impl futures::Stream<Item = anyhow::Result<Bytes>> {
    futures::stream::try_unfold((container, limit), |(container, remaining)| async move {
        let want = match remaining {
            Some(0) => return Ok(None),
            Some(n) => READ_CHUNK.min(n as usize),
            None => READ_CHUNK,
        };

        let data = container.read(want).await?;

        if data.is_empty() {
            return Ok(None);
        }

        let remaining = remaining.map(|n| n - data.len() as u64);

        Ok(Some((data, (container, remaining))))
    })
}

/// The filename the redirect points at: the last path component of the
/// source URL with any query string stripped.
fn basename(url: &str) -> String {
    let path = url.split('?').next().unwrap_or(url);
    let name = path.rsplit('/').next().unwrap_or("");

    if name.is_empty() {
        "stream".to_string()
    } else {
        name.to_string()
    }
}

/// Parses a single `bytes=` range into a half-open `[start, end)` window.
fn parse_range(value: &str, length: u64) -> anyhow::Result<(u64, u64)> {
    let ranges = value
        .strip_prefix("bytes=")
        .context("Unsupported range unit")?;

    // Only the first range of a multi-range request is served.
    let first = ranges.split(',').next().unwrap_or(ranges).trim();

    let (start, end) = first.split_once('-').context("Malformed range")?;

    match (start.trim(), end.trim()) {
        ("", suffix) => {
            let n: u64 = suffix.parse().context("Malformed range suffix")?;
            anyhow::ensure!(n > 0, "Empty range suffix");

            Ok((length.saturating_sub(n), length))
        }
        (start, "") => {
            let start: u64 = start.parse().context("Malformed range start")?;
            anyhow::ensure!(start < length, "Range starts past the end");

            Ok((start, length))
        }
        (start, end) => {
            let start: u64 = start.parse().context("Malformed range start")?;
            let end: u64 = end.parse().context("Malformed range end")?;
            anyhow::ensure!(start <= end, "Range is inverted");
            anyhow::ensure!(start < length, "Range starts past the end");

            Ok((start, (end + 1).min(length)))
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use test_case::test_case;

    #[test_case("bytes=0-99", 1000, Some((0, 100)))]
    #[test_case("bytes=200-", 1000, Some((200, 1000)))]
    #[test_case("bytes=-100", 1000, Some((900, 1000)))]
    #[test_case("bytes=0-4999", 1000, Some((0, 1000)))]
    #[test_case("bytes=0-99,200-299", 1000, Some((0, 100)))]
    #[test_case("bytes=1000-", 1000, None)]
    #[test_case("bytes=5-2", 1000, None)]
    #[test_case("items=0-99", 1000, None)]
    #[test_case("bytes=abc-", 1000, None)]
    fn ranges(value: &str, length: u64, expected: Option<(u64, u64)>) {
        assert_eq!(expected, parse_range(value, length).ok());
    }

    #[test_case("http://host/path/movie.mkv", "movie.mkv")]
    #[test_case("http://host/path/movie.mkv?token=abc", "movie.mkv")]
    #[test_case("http://host/", "stream")]
    #[test_case("plain", "plain")]
    fn basenames(url: &str, expected: &str) {
        assert_eq!(expected, basename(url));
    }
}
