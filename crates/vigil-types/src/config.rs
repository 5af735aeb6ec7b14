use std::{env, fs, path::Path, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::{Result, VigilError};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CameraConfig {
    /// Device index (`"0"` selects `/dev/video0`) or any URL ffmpeg can open.
    pub source: String,
    pub fallback_source: Option<String>,
    pub width: u32,
    pub height: u32,
    pub ffmpeg_path: Option<String>,
    pub reconnect_backoff_ms: u64,
    pub open_timeout_ms: u64,
    pub max_reconnect_attempts: u8,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            source: "0".into(),
            fallback_source: None,
            width: 640,
            height: 480,
            ffmpeg_path: None,
            reconnect_backoff_ms: 2_000,
            open_timeout_ms: 10_000,
            max_reconnect_attempts: 3,
        }
    }
}

impl CameraConfig {
    /// Secondary device tried when the primary cannot be opened at boot.
    pub fn effective_fallback(&self) -> Option<String> {
        if let Some(fallback) = &self.fallback_source {
            return Some(fallback.clone());
        }
        match self.source.trim().parse::<u32>() {
            Ok(0) => Some("1".into()),
            Ok(_) => Some("0".into()),
            Err(_) => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectionConfig {
    pub scale: f32,
    pub min_contour_area: u32,
    pub face_rec_frame_skip: u32,
    pub match_tolerance: f32,
    pub known_faces_dir: String,
    pub background_history: u32,
    pub variance_threshold: f32,
    pub detect_shadows: bool,
    pub foreground_threshold: u8,
    pub error_pause_ms: u64,
    pub idle_poll_ms: u64,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            scale: 0.25,
            min_contour_area: 500,
            face_rec_frame_skip: 5,
            match_tolerance: 0.45,
            known_faces_dir: "known_faces".into(),
            background_history: 500,
            variance_threshold: 50.0,
            detect_shadows: true,
            foreground_threshold: 244,
            error_pause_ms: 1_000,
            idle_poll_ms: 10,
        }
    }
}

/// Which face analyzer backs recognition.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FaceBackend {
    /// SeetaFace detector plus an ONNX embedding network.
    #[default]
    Model,
    /// Recognition disabled: motion is still reported, faces never are.
    None,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FacesConfig {
    pub backend: FaceBackend,
    /// SeetaFace frontal detector weights (`seeta_fd_frontal_v1.0.bin`).
    pub detector_model: String,
    /// ONNX network mapping a square face crop to an embedding vector.
    pub embedding_model: String,
    /// Side of the square crop fed to the embedding network.
    pub input_size: u32,
    pub min_face_size: u32,
    pub score_threshold: f64,
    pub pyramid_scale: f32,
    pub window_step: u32,
    pub pixel_mean: f32,
    pub pixel_std: f32,
    /// Feed the network BGR planes instead of RGB.
    pub bgr: bool,
}

impl FacesConfig {
    /// Smallest face the SeetaFace cascade can look for.
    pub const MIN_DETECTABLE_FACE: u32 = 20;
}

impl Default for FacesConfig {
    fn default() -> Self {
        Self {
            backend: FaceBackend::Model,
            detector_model: "models/seeta_fd_frontal_v1.0.bin".into(),
            embedding_model: "models/face_embedding.onnx".into(),
            input_size: 112,
            min_face_size: Self::MIN_DETECTABLE_FACE,
            score_threshold: 2.0,
            pyramid_scale: 0.8,
            window_step: 4,
            pixel_mean: 127.5,
            pixel_std: 128.0,
            bgr: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IntruderConfig {
    pub threshold_frames: usize,
    pub patience_secs: f64,
    pub subject_name: String,
}

impl IntruderConfig {
    /// Longest accepted reset delay, one day.
    pub const MAX_PATIENCE_SECS: f64 = 86_400.0;
}

impl Default for IntruderConfig {
    fn default() -> Self {
        Self {
            threshold_frames: 15,
            patience_secs: 7.0,
            subject_name: "Unknown person".into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AudibleConfig {
    pub sound_file: String,
    pub player: String,
    pub cooldown_secs: u64,
}

impl Default for AudibleConfig {
    fn default() -> Self {
        Self {
            sound_file: "alert.wav".into(),
            player: "aplay".into(),
            cooldown_secs: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SmsConfig {
    pub account_sid: Option<String>,
    pub auth_token: Option<String>,
    pub from_number: Option<String>,
    pub to_number: Option<String>,
    pub api_base: String,
    pub cooldown_secs: u64,
}

impl Default for SmsConfig {
    fn default() -> Self {
        Self {
            account_sid: None,
            auth_token: None,
            from_number: None,
            to_number: None,
            api_base: "https://api.twilio.com".into(),
            cooldown_secs: 300,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmailConfig {
    pub smtp_host: String,
    pub smtp_port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub recipient: Option<String>,
    pub cooldown_secs: u64,
}

impl Default for EmailConfig {
    fn default() -> Self {
        Self {
            smtp_host: "smtp.gmail.com".into(),
            smtp_port: 465,
            username: None,
            password: None,
            recipient: None,
            cooldown_secs: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertsConfig {
    pub queue_capacity: usize,
    pub audible: AudibleConfig,
    pub sms: SmsConfig,
    pub email: EmailConfig,
}

impl Default for AlertsConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 16,
            audible: AudibleConfig::default(),
            sms: SmsConfig::default(),
            email: EmailConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    pub bind_addr: String,
    pub port: u16,
    pub jpeg_quality: u8,
    pub idle_ms: u64,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0".into(),
            port: 8000,
            jpeg_quality: 80,
            idle_ms: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub event_log_path: String,
    pub status_path: String,
    pub intruder_dir: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            event_log_path: "security_events.jsonl".into(),
            status_path: "system_status".into(),
            intruder_dir: "intruders".into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OpsConfig {
    pub log_level: String,
}

impl Default for OpsConfig {
    fn default() -> Self {
        Self {
            log_level: "info".into(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct VigilConfig {
    pub camera: CameraConfig,
    pub detection: DetectionConfig,
    pub faces: FacesConfig,
    pub intruder: IntruderConfig,
    pub alerts: AlertsConfig,
    pub stream: StreamConfig,
    pub storage: StorageConfig,
    pub ops: OpsConfig,
}

impl VigilConfig {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path_ref = path.as_ref();
        let contents = fs::read_to_string(path_ref).map_err(|err| {
            VigilError::Configuration(format!(
                "unable to read config file {}: {err}",
                path_ref.display()
            ))
        })?;
        toml::from_str(&contents).map_err(|err| {
            VigilError::Configuration(format!(
                "failed to parse config file {}: {err}",
                path_ref.display()
            ))
        })
    }

    /// Applies the environment variables a `.env` deployment sets.
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        if let Some(source) = env_string("IP_CAMERA_URL") {
            self.camera.source = source;
        }
        if let Some(area) = env_parse("MIN_CONTOUR_AREA")? {
            self.detection.min_contour_area = area;
        }
        if let Some(skip) = env_parse("FACE_REC_FRAME_SKIP")? {
            self.detection.face_rec_frame_skip = skip;
        }
        if let Some(frames) = env_parse("DETECTION_THRESHOLD_FRAMES")? {
            self.intruder.threshold_frames = frames;
        }
        if let Some(secs) = env_parse("PATIENCE_SECONDS")? {
            self.intruder.patience_secs = secs;
        }
        if let Some(backend) = env_string("FACE_BACKEND") {
            self.faces.backend = match backend.trim().to_ascii_lowercase().as_str() {
                "model" => FaceBackend::Model,
                "none" => FaceBackend::None,
                other => {
                    return Err(VigilError::Configuration(format!(
                        "invalid value for FACE_BACKEND ('{other}'): expected model or none"
                    )))
                }
            };
        }

        let sms = &mut self.alerts.sms;
        override_opt(&mut sms.account_sid, "TWILIO_ACCOUNT_SID");
        override_opt(&mut sms.auth_token, "TWILIO_AUTH_TOKEN");
        override_opt(&mut sms.from_number, "TWILIO_PHONE_NUMBER");
        override_opt(&mut sms.to_number, "ADMIN_PHONE_NUMBER");

        let email = &mut self.alerts.email;
        override_opt(&mut email.username, "EMAIL_HOST_USER");
        override_opt(&mut email.password, "EMAIL_HOST_PASSWORD");
        override_opt(&mut email.recipient, "ADMIN_EMAIL");
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.camera.source.trim().is_empty() {
            return Err(VigilError::Configuration(
                "camera.source must not be empty".into(),
            ));
        }
        if self.camera.width == 0 || self.camera.height == 0 {
            return Err(VigilError::Configuration(
                "camera.width and camera.height must be greater than zero".into(),
            ));
        }
        if !(self.detection.scale > 0.0 && self.detection.scale <= 1.0) {
            return Err(VigilError::Configuration(
                "detection.scale must be within (0.0, 1.0]".into(),
            ));
        }
        if self.detection.face_rec_frame_skip == 0 {
            return Err(VigilError::Configuration(
                "detection.face_rec_frame_skip must be greater than zero".into(),
            ));
        }
        if !(self.detection.match_tolerance > 0.0 && self.detection.match_tolerance <= 1.0) {
            return Err(VigilError::Configuration(
                "detection.match_tolerance must be within (0.0, 1.0]".into(),
            ));
        }
        if self.detection.background_history == 0 {
            return Err(VigilError::Configuration(
                "detection.background_history must be greater than zero".into(),
            ));
        }
        if self.faces.backend == FaceBackend::Model {
            self.faces.validate()?;
        }
        if self.intruder.threshold_frames == 0 {
            return Err(VigilError::Configuration(
                "intruder.threshold_frames must be greater than zero".into(),
            ));
        }
        let patience = self.intruder.patience_secs;
        if !(patience.is_finite() && (0.0..=IntruderConfig::MAX_PATIENCE_SECS).contains(&patience)) {
            return Err(VigilError::Configuration(format!(
                "intruder.patience_secs must be within [0, {}] seconds, got {patience}",
                IntruderConfig::MAX_PATIENCE_SECS
            )));
        }
        if self.alerts.queue_capacity == 0 {
            return Err(VigilError::Configuration(
                "alerts.queue_capacity must be greater than zero".into(),
            ));
        }
        if self.stream.port == 0 {
            return Err(VigilError::Configuration(
                "stream.port must be a valid port (>0)".into(),
            ));
        }
        if !(1..=100).contains(&self.stream.jpeg_quality) {
            return Err(VigilError::Configuration(
                "stream.jpeg_quality must be between 1 and 100".into(),
            ));
        }
        Ok(())
    }
}

impl FacesConfig {
    fn validate(&self) -> Result<()> {
        if self.detector_model.trim().is_empty() || self.embedding_model.trim().is_empty() {
            return Err(VigilError::Configuration(
                "faces.detector_model and faces.embedding_model must be set, or faces.backend = \"none\"".into(),
            ));
        }
        if self.input_size == 0 {
            return Err(VigilError::Configuration(
                "faces.input_size must be greater than zero".into(),
            ));
        }
        if self.min_face_size < Self::MIN_DETECTABLE_FACE {
            return Err(VigilError::Configuration(format!(
                "faces.min_face_size must be at least {}",
                Self::MIN_DETECTABLE_FACE
            )));
        }
        if !self.score_threshold.is_finite() {
            return Err(VigilError::Configuration(
                "faces.score_threshold must be finite".into(),
            ));
        }
        if !(self.pyramid_scale > 0.0 && self.pyramid_scale < 1.0) {
            return Err(VigilError::Configuration(
                "faces.pyramid_scale must be within (0.0, 1.0)".into(),
            ));
        }
        if self.window_step == 0 {
            return Err(VigilError::Configuration(
                "faces.window_step must be greater than zero".into(),
            ));
        }
        if !(self.pixel_std.is_finite() && self.pixel_std > 0.0) || !self.pixel_mean.is_finite() {
            return Err(VigilError::Configuration(
                "faces.pixel_std must be positive and faces.pixel_mean finite".into(),
            ));
        }
        Ok(())
    }
}

fn env_string(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn env_parse<T: FromStr>(key: &str) -> Result<Option<T>>
where
    T::Err: std::fmt::Display,
{
    match env_string(key) {
        Some(raw) => raw.trim().parse().map(Some).map_err(|err| {
            VigilError::Configuration(format!("invalid value for {key} ('{raw}'): {err}"))
        }),
        None => Ok(None),
    }
}

fn override_opt(slot: &mut Option<String>, key: &str) {
    if let Some(value) = env_string(key) {
        *slot = Some(value);
    }
}
