//! Live view: overlay rendering, JPEG encoding and the MJPEG endpoint.

mod font;
pub mod overlay;

use std::{convert::Infallible, sync::Arc};

use axum::{
    body::Body,
    extract::State,
    http::header,
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use futures::stream::{BoxStream, StreamExt};
use image::{codecs::jpeg::JpegEncoder, ColorType, RgbImage};
use tokio::{
    net::TcpListener,
    time::{sleep, Duration},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use vigil_types::{
    config::StreamConfig,
    shared::{FrameSnapshot, SharedFrameState},
    Result, VigilError,
};

pub use overlay::render_overlay;

pub const MJPEG_CONTENT_TYPE: &str = "multipart/x-mixed-replace; boundary=frame";

/// Wraps one JPEG image as a part of the `frame`-delimited multipart stream.
pub fn multipart_chunk(jpeg: &[u8]) -> Vec<u8> {
    let header = format!(
        "--frame\r\nContent-Type: image/jpeg\r\nContent-Length: {}\r\n\r\n",
        jpeg.len()
    );
    let mut chunk = Vec::with_capacity(header.len() + jpeg.len() + 2);
    chunk.extend_from_slice(header.as_bytes());
    chunk.extend_from_slice(jpeg);
    chunk.extend_from_slice(b"\r\n");
    chunk
}

pub fn encode_jpeg(image: &RgbImage, quality: u8) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    JpegEncoder::new_with_quality(&mut buf, quality.clamp(1, 100))
        .encode(image.as_raw(), image.width(), image.height(), ColorType::Rgb8)
        .map_err(|err| network_error(format!("jpeg encode failed: {err}")))?;
    Ok(buf)
}

/// Per-viewer encoder pulling from the shared state at its own pace.
///
/// Only the snapshot copy happens under the shared lock; drawing and
/// compression run on the copy. A snapshot identical to the last one sent is
/// not re-encoded.
pub struct StreamEncoder {
    shared: SharedFrameState,
    detection_scale: f32,
    quality: u8,
    idle: Duration,
    cancel: CancellationToken,
    last_sent: Option<FrameSnapshot>,
}

impl StreamEncoder {
    pub fn new(
        shared: SharedFrameState,
        detection_scale: f32,
        config: &StreamConfig,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            shared,
            detection_scale,
            quality: config.jpeg_quality,
            idle: Duration::from_millis(config.idle_ms.max(1)),
            cancel,
            last_sent: None,
        }
    }

    fn is_repeat(&self, snapshot: &FrameSnapshot) -> bool {
        self.last_sent.as_ref().is_some_and(|last| {
            Arc::ptr_eq(&last.frame, &snapshot.frame)
                && Arc::ptr_eq(&last.detection, &snapshot.detection)
                && last.status_text == snapshot.status_text
                && last.patience_text == snapshot.patience_text
        })
    }

    /// Renders the newest snapshot into a multipart chunk, or `None` when
    /// there is no frame yet or nothing changed since the last chunk.
    pub fn try_next_chunk(&mut self) -> Result<Option<Vec<u8>>> {
        let Some(snapshot) = self.shared.snapshot() else {
            return Ok(None);
        };
        if self.is_repeat(&snapshot) {
            return Ok(None);
        }
        let image = render_overlay(&snapshot, self.detection_scale)?;
        let jpeg = encode_jpeg(&image, self.quality)?;
        self.last_sent = Some(snapshot);
        Ok(Some(multipart_chunk(&jpeg)))
    }

    /// Waits for the next chunk. Returns `None` once the stop signal fires.
    pub async fn next_chunk(&mut self) -> Option<Vec<u8>> {
        loop {
            if self.cancel.is_cancelled() {
                return None;
            }
            match self.try_next_chunk() {
                Ok(Some(chunk)) => return Some(chunk),
                Ok(None) => {}
                Err(err) => warn!(error = %err, "Failed to encode frame"),
            }
            tokio::select! {
                _ = self.cancel.cancelled() => return None,
                _ = sleep(self.idle) => {}
            }
        }
    }

    pub fn into_stream(mut self) -> BoxStream<'static, std::result::Result<Vec<u8>, Infallible>> {
        async_stream::stream! {
            while let Some(chunk) = self.next_chunk().await {
                yield Ok(chunk);
            }
            debug!("Live view stream finished");
        }
        .boxed()
    }
}

/// Everything a viewer connection needs to build its own encoder.
#[derive(Clone)]
pub struct LiveView {
    shared: SharedFrameState,
    detection_scale: f32,
    config: StreamConfig,
    cancel: CancellationToken,
}

impl LiveView {
    pub fn new(
        shared: SharedFrameState,
        detection_scale: f32,
        config: StreamConfig,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            shared,
            detection_scale,
            config,
            cancel,
        }
    }

    pub fn encoder(&self) -> StreamEncoder {
        StreamEncoder::new(
            self.shared.clone(),
            self.detection_scale,
            &self.config,
            self.cancel.clone(),
        )
    }
}

async fn video_feed(State(view): State<LiveView>) -> Response {
    debug!("Live viewer connected");
    let body = Body::from_stream(view.encoder().into_stream());
    ([(header::CONTENT_TYPE, MJPEG_CONTENT_TYPE)], body).into_response()
}

pub fn router(view: LiveView) -> Router {
    Router::new()
        .route("/video_feed", get(video_feed))
        .with_state(view)
}

/// Serves the live view until `cancel` fires. Open streams end with it.
pub async fn serve(view: LiveView) -> Result<()> {
    let addr = format!("{}:{}", view.config.bind_addr, view.config.port);
    let listener = TcpListener::bind(&addr)
        .await
        .map_err(|err| network_error(format!("cannot bind {addr}: {err}")))?;
    info!("Live view listening on http://{addr}/video_feed");

    let cancel = view.cancel.clone();
    axum::serve(listener, router(view))
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await
        .map_err(|err| network_error(format!("live view server error: {err}")))?;
    info!("Live view server stopped");
    Ok(())
}

pub fn network_error(message: impl Into<String>) -> VigilError {
    VigilError::Stream(message.into())
}
