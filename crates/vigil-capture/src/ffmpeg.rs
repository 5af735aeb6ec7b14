use std::{
    path::{Path, PathBuf},
    process::Stdio,
};

use async_trait::async_trait;
use tokio::{
    io::AsyncReadExt,
    process::{Child, ChildStdout, Command},
    time::{timeout, Duration},
};
use tracing::{debug, info, warn};
use vigil_types::{config::CameraConfig, frame::Frame, Result};

use crate::{capture_error, FrameSource};

const DEFAULT_FFMPEG: &str = "ffmpeg";
const DEVICE_DIR: &str = "/dev";

/// Source value asking for whichever local camera is present.
const ANY_CAMERA: &str = "-1";

/// Camera access through an `ffmpeg` child process that decodes the stream
/// and writes packed `rgb24` frames of the configured size to stdout.
pub struct FfmpegSource {
    config: CameraConfig,
    ffmpeg_path: PathBuf,
    active_source: String,
    child: Option<Child>,
    stdout: Option<ChildStdout>,
    /// Frame read while confirming the device opened.
    pending: Option<Frame>,
    seq: u64,
    opened_once: bool,
}

impl FfmpegSource {
    pub fn new(config: CameraConfig) -> Self {
        let ffmpeg_path = config
            .ffmpeg_path
            .as_ref()
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_FFMPEG));
        let active_source = config.source.clone();

        Self {
            config,
            ffmpeg_path,
            active_source,
            child: None,
            stdout: None,
            pending: None,
            seq: 0,
            opened_once: false,
        }
    }

    fn frame_len(&self) -> usize {
        Frame::buffer_len(self.config.width, self.config.height)
    }

    async fn spawn_and_confirm(&mut self, source: &str) -> Result<()> {
        let input = resolve_input(source, Path::new(DEVICE_DIR))?;
        debug!(source, input = ?input, "Resolved video input");
        let args = ffmpeg_args(&input, self.config.width, self.config.height);
        let mut child = Command::new(&self.ffmpeg_path)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| capture_error(format!("ffmpeg spawn failed ({source}): {err}")))?;
        self.stdout = child.stdout.take();
        self.child = Some(child);

        let open_timeout = Duration::from_millis(self.config.open_timeout_ms);
        match timeout(open_timeout, self.read_frame()).await {
            Ok(Ok(frame)) => {
                self.pending = Some(frame);
                Ok(())
            }
            Ok(Err(err)) => {
                self.release().await;
                Err(err)
            }
            Err(_) => {
                self.release().await;
                Err(capture_error(format!(
                    "no frame from {source} within {}ms",
                    self.config.open_timeout_ms
                )))
            }
        }
    }

    async fn read_frame(&mut self) -> Result<Frame> {
        let len = self.frame_len();
        let stdout = self
            .stdout
            .as_mut()
            .ok_or_else(|| capture_error("video stream is not open"))?;
        let mut buf = vec![0u8; len];
        stdout
            .read_exact(&mut buf)
            .await
            .map_err(|err| capture_error(format!("video stream read failed: {err}")))?;
        self.seq += 1;
        Frame::from_rgb(self.seq, self.config.width, self.config.height, buf)
    }
}

#[async_trait]
impl FrameSource for FfmpegSource {
    async fn open(&mut self) -> Result<()> {
        let primary = self.config.source.clone();
        let primary_err = match self.spawn_and_confirm(&primary).await {
            Ok(()) => {
                self.active_source = primary;
                self.opened_once = true;
                info!(source = %self.active_source, "Connected to video stream");
                return Ok(());
            }
            Err(err) => err,
        };

        // The fallback device is only considered for the very first open;
        // reconnects always target the configured source.
        if self.opened_once {
            return Err(primary_err);
        }
        let Some(fallback) = self.config.effective_fallback() else {
            return Err(primary_err);
        };
        warn!(error = %primary_err, fallback = %fallback, "Could not open primary video source, trying fallback");
        self.spawn_and_confirm(&fallback).await.map_err(|err| {
            capture_error(format!("cannot open video stream or webcam: {err}"))
        })?;
        self.active_source = fallback;
        self.opened_once = true;
        info!(source = %self.active_source, "Connected to fallback video stream");
        Ok(())
    }

    async fn capture(&mut self) -> Result<Frame> {
        if let Some(frame) = self.pending.take() {
            return Ok(frame);
        }
        self.read_frame().await
    }

    async fn release(&mut self) {
        self.stdout = None;
        self.pending = None;
        if let Some(mut child) = self.child.take() {
            if let Err(err) = child.start_kill() {
                warn!(error = %err, "Failed to signal ffmpeg process");
            }
            let _ = child.wait().await;
        }
    }

    fn describe(&self) -> String {
        format!(
            "ffmpeg {} @ {}x{}",
            self.active_source, self.config.width, self.config.height
        )
    }
}

/// What ffmpeg is pointed at.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Input {
    Device(PathBuf),
    Url(String),
}

/// A bare device index maps to the matching V4L2 node under `device_dir`,
/// [`ANY_CAMERA`] to the lowest-numbered node present, and everything else
/// is handed to ffmpeg as an input URL.
fn resolve_input(source: &str, device_dir: &Path) -> Result<Input> {
    let source = source.trim();
    if source == ANY_CAMERA {
        return first_video_device(device_dir).map(Input::Device).ok_or_else(|| {
            capture_error(format!(
                "no video device found under {} for source {ANY_CAMERA}",
                device_dir.display()
            ))
        });
    }
    Ok(match source.parse::<u32>() {
        Ok(index) => Input::Device(device_dir.join(format!("video{index}"))),
        Err(_) => Input::Url(source.to_string()),
    })
}

fn first_video_device(device_dir: &Path) -> Option<PathBuf> {
    std::fs::read_dir(device_dir)
        .ok()?
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| {
            let index = entry
                .file_name()
                .to_str()?
                .strip_prefix("video")?
                .parse::<u32>()
                .ok()?;
            Some((index, entry.path()))
        })
        .min_by_key(|(index, _)| *index)
        .map(|(_, path)| path)
}

fn ffmpeg_args(input: &Input, width: u32, height: u32) -> Vec<String> {
    let mut args: Vec<String> = ["-hide_banner", "-loglevel", "error"]
        .into_iter()
        .map(String::from)
        .collect();
    match input {
        Input::Device(device) => {
            args.extend(["-f", "v4l2", "-i"].map(String::from));
            args.push(device.display().to_string());
        }
        Input::Url(url) => {
            if url.starts_with("rtsp://") {
                args.extend(["-rtsp_transport", "tcp"].map(String::from));
            }
            args.extend(["-i".to_string(), url.clone()]);
        }
    }
    let scale = format!("scale={width}:{height}");
    args.extend(
        [
            "-an",
            "-vf",
            scale.as_str(),
            "-f",
            "rawvideo",
            "-pix_fmt",
            "rgb24",
            "pipe:1",
        ]
        .map(String::from),
    );
    args
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch_dir() -> PathBuf {
        let dir = std::env::temp_dir().join(format!("vigil-dev-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).expect("create scratch dir");
        dir
    }

    fn args_for(source: &str, width: u32, height: u32) -> Vec<String> {
        let input = resolve_input(source, Path::new("/dev")).expect("resolve input");
        ffmpeg_args(&input, width, height)
    }

    #[test]
    fn device_index_uses_v4l2() {
        let args = args_for("0", 640, 480);
        let joined = args.join(" ");
        assert!(joined.contains("-f v4l2 -i /dev/video0"));
        assert!(joined.ends_with("-vf scale=640:480 -f rawvideo -pix_fmt rgb24 pipe:1"));
    }

    #[test]
    fn rtsp_urls_force_tcp_transport() {
        let args = args_for("rtsp://10.0.0.9/live", 320, 240);
        let joined = args.join(" ");
        assert!(joined.contains("-rtsp_transport tcp -i rtsp://10.0.0.9/live"));
        assert!(!joined.contains("v4l2"));
    }

    #[test]
    fn any_camera_opens_the_lowest_numbered_device() {
        let dir = scratch_dir();
        for name in ["video10", "video2", "videoX", "audio0", "video3"] {
            std::fs::write(dir.join(name), b"").expect("create node");
        }

        let input = resolve_input(" -1 ", &dir).expect("a device is present");
        assert_eq!(input, Input::Device(dir.join("video2")));
        let joined = ffmpeg_args(&input, 640, 480).join(" ");
        assert!(joined.contains(&format!("-f v4l2 -i {}", dir.join("video2").display())));
        assert!(!joined.contains("-i -1"));

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn any_camera_without_devices_is_an_error() {
        let dir = scratch_dir();
        std::fs::write(dir.join("audio0"), b"").expect("create node");
        assert!(resolve_input(ANY_CAMERA, &dir).is_err());
        std::fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn missing_binary_fails_to_open() {
        let config = CameraConfig {
            ffmpeg_path: Some("/nonexistent/vigil-ffmpeg".into()),
            source: "rtsp://camera.invalid/live".into(),
            ..CameraConfig::default()
        };
        let mut source = FfmpegSource::new(config);
        assert!(source.open().await.is_err());
        assert!(source.capture().await.is_err());
    }
}
