use greeter_core::greeting::FallbackPhrases;
use greeter_core::GateConfig;
use greeter_hw::Rotation;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },
    #[error(
        "identity distance threshold is not set; put `distance_threshold` under [identity] \
         or set GREETER_DISTANCE_THRESHOLD"
    )]
    MissingDistanceThreshold,
    #[error("invalid value for {key}: {value}")]
    Invalid { key: &'static str, value: String },
}

/// Daemon configuration: optional TOML file at `$GREETER_CONFIG`, then
/// `GREETER_*` environment overrides.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub camera: CameraConfig,
    pub models: ModelConfig,
    pub gates: GateConfig,
    pub identity: IdentityConfig,
    pub greeting: GreetingConfig,
    pub speech: SpeechConfig,
    pub storage: StorageConfig,
    pub display: DisplayConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CameraConfig {
    /// Opens `/dev/video{index}` unless `device` is set.
    pub index: u32,
    pub device: Option<String>,
    pub width: u32,
    pub height: u32,
    pub rotation: Rotation,
    /// Frames discarded after opening (camera AGC/AE stabilization).
    pub warmup_frames: usize,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            index: 0,
            device: None,
            width: 1280,
            height: 720,
            rotation: Rotation::Clockwise90,
            warmup_frames: 30,
        }
    }
}

impl CameraConfig {
    pub fn device_path(&self) -> String {
        self.device
            .clone()
            .unwrap_or_else(|| format!("/dev/video{}", self.index))
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    /// Directory containing the ONNX model files.
    pub dir: PathBuf,
    pub person_confidence: f32,
    pub face_confidence: f32,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            dir: greeter_core::default_model_dir(),
            person_confidence: 0.5,
            face_confidence: 0.9,
        }
    }
}

impl ModelConfig {
    pub fn person_model_path(&self) -> String {
        self.path_of(greeter_core::PERSON_MODEL_FILE)
    }

    pub fn face_model_path(&self) -> String {
        self.path_of(greeter_core::FACE_MODEL_FILE)
    }

    pub fn embedding_model_path(&self) -> String {
        self.path_of(greeter_core::EMBEDDING_MODEL_FILE)
    }

    fn path_of(&self, file: &str) -> String {
        self.dir.join(file).to_string_lossy().into_owned()
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct IdentityConfig {
    /// Maximum cosine distance for a positive match. Required.
    pub distance_threshold: Option<f32>,
    /// Greet visitors who already have a logged visit.
    pub greet_returning_visitors: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GreetingConfig {
    pub api_url: String,
    /// Usually supplied through `OPENAI_API_KEY`.
    pub api_key: Option<String>,
    pub model: String,
    pub timeout_secs: f64,
    /// Longest side of the image sent for description.
    pub image_max_side: u32,
    pub system_prompt: String,
    pub guest_prompt: String,
    /// `{name}` is replaced with the visitor's first name.
    pub visitor_prompt: String,
    pub fallbacks: FallbackPhrases,
}

impl Default for GreetingConfig {
    fn default() -> Self {
        Self {
            api_url: "https://api.openai.com/v1/chat/completions".into(),
            api_key: None,
            model: "gpt-4.1".into(),
            timeout_secs: 5.0,
            image_max_side: 1024,
            system_prompt: "You are an enthusiastic greeter at the venue entrance. \
                Greet each guest by looking at their outfit, appearance and expression in a stylish way. \
                Always end with greeting words. Be warm, flattering, and short: two sentences."
                .into(),
            guest_prompt: "Greet the person in the image warmly. \
                Start with an enthusiastic greeting like \"Hey there\", \"Hello\" or \"Welcome\". \
                Describe their outfit stylishly as they enter."
                .into(),
            visitor_prompt: "The person in the image is {name}, a returning visitor. \
                Welcome {name} by name and compliment their outfit."
                .into(),
            fallbacks: FallbackPhrases::default(),
        }
    }
}

impl GreetingConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs_f64(self.timeout_secs.max(0.0))
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SpeechConfig {
    pub enabled: bool,
    pub piper_binary: String,
    pub voice_model: PathBuf,
    pub sample_rate: u32,
    pub player_binary: String,
}

impl Default for SpeechConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            piper_binary: "piper".into(),
            voice_model: PathBuf::from("piper-voices/en/ljspeech/medium/en_US-ljspeech-medium.onnx"),
            sample_rate: 22050,
            player_binary: "aplay".into(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub db_path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: greeter_store::default_db_path(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DisplayConfig {
    /// How long after a capture frames are annotated but not captured.
    pub overlay_secs: f64,
    /// Latest annotated frame is written here as JPEG, when set.
    pub preview_path: Option<PathBuf>,
}

impl Default for DisplayConfig {
    fn default() -> Self {
        Self {
            overlay_secs: 3.0,
            preview_path: None,
        }
    }
}

impl DisplayConfig {
    pub fn overlay_duration(&self) -> Duration {
        Duration::from_secs_f64(self.overlay_secs.max(0.0))
    }
}

impl Config {
    /// Load from `$GREETER_CONFIG` (if set) and the process environment.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = match std::env::var("GREETER_CONFIG") {
            Ok(path) => Self::from_file(Path::new(&path))?,
            Err(_) => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml(&text).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })
    }

    pub fn from_toml(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    /// Apply `GREETER_*` / `OPENAI_API_KEY` overrides from `lookup`.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("GREETER_CAMERA_INDEX") {
            self.camera.index = parse("GREETER_CAMERA_INDEX", &v)?;
        }
        if let Some(v) = lookup("GREETER_CAMERA_DEVICE") {
            self.camera.device = Some(v);
        }
        if let Some(v) = lookup("GREETER_CAMERA_ROTATION") {
            self.camera.rotation = v.parse().map_err(|_| ConfigError::Invalid {
                key: "GREETER_CAMERA_ROTATION",
                value: v.clone(),
            })?;
        }
        if let Some(v) = lookup("GREETER_WARMUP_FRAMES") {
            self.camera.warmup_frames = parse("GREETER_WARMUP_FRAMES", &v)?;
        }
        if let Some(v) = lookup("GREETER_MODEL_DIR") {
            self.models.dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("GREETER_DB_PATH") {
            self.storage.db_path = PathBuf::from(v);
        }
        if let Some(v) = lookup("GREETER_DISTANCE_THRESHOLD") {
            self.identity.distance_threshold = Some(parse("GREETER_DISTANCE_THRESHOLD", &v)?);
        }
        if let Some(v) = lookup("GREETER_OVERLAY_SECS") {
            self.display.overlay_secs = parse("GREETER_OVERLAY_SECS", &v)?;
        }
        if let Some(v) = lookup("GREETER_PREVIEW_PATH") {
            self.display.preview_path = Some(PathBuf::from(v));
        }
        if let Some(v) = lookup("GREETER_SPEECH_ENABLED") {
            self.speech.enabled = v != "0";
        }
        if let Some(v) = lookup("GREETER_API_URL") {
            self.greeting.api_url = v;
        }
        if let Some(v) = lookup("OPENAI_API_KEY") {
            if !v.is_empty() {
                self.greeting.api_key = Some(v);
            }
        }
        Ok(())
    }

    /// The identity distance threshold has no default.
    pub fn distance_threshold(&self) -> Result<f32, ConfigError> {
        match self.identity.distance_threshold {
            Some(t) if t.is_finite() && t >= 0.0 => Ok(t),
            Some(t) => Err(ConfigError::Invalid {
                key: "distance_threshold",
                value: t.to_string(),
            }),
            None => Err(ConfigError::MissingDistanceThreshold),
        }
    }
}

fn parse<T: std::str::FromStr>(key: &'static str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::Invalid {
        key,
        value: value.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_follow_venue_setup() {
        let config = Config::default();
        assert_eq!(config.gates.near_width, 200.0);
        assert_eq!(config.gates.near_height, 500.0);
        assert_eq!(config.models.face_confidence, 0.9);
        assert_eq!(config.camera.warmup_frames, 30);
        assert_eq!(config.camera.device_path(), "/dev/video0");
        assert_eq!(config.greeting.timeout(), Duration::from_secs(5));
        assert_eq!(config.greeting.image_max_side, 1024);
        assert_eq!(config.display.overlay_duration(), Duration::from_secs(3));
    }

    #[test]
    fn test_missing_distance_threshold_is_an_error() {
        let config = Config::default();
        assert!(matches!(
            config.distance_threshold(),
            Err(ConfigError::MissingDistanceThreshold)
        ));
    }

    #[test]
    fn test_partial_toml() {
        let config = Config::from_toml(
            r#"
            [camera]
            index = 2
            rotation = "none"

            [gates]
            near_width = 150.0

            [gates.safe_zone]
            left = 0.1

            [identity]
            distance_threshold = 0.35
            greet_returning_visitors = true
            "#,
        )
        .unwrap();
        assert_eq!(config.camera.device_path(), "/dev/video2");
        assert_eq!(config.camera.rotation, Rotation::None);
        assert_eq!(config.gates.near_width, 150.0);
        assert_eq!(config.gates.near_height, 500.0);
        assert_eq!(config.gates.safe_zone.left, 0.1);
        assert_eq!(config.gates.safe_zone.right, 0.8);
        assert_eq!(config.distance_threshold().unwrap(), 0.35);
        assert!(config.identity.greet_returning_visitors);
    }

    #[test]
    fn test_env_overrides_file() {
        let mut config = Config::from_toml("[identity]\ndistance_threshold = 0.5\n").unwrap();
        config
            .apply_env(env(&[
                ("GREETER_DISTANCE_THRESHOLD", "0.3"),
                ("GREETER_CAMERA_DEVICE", "/dev/video7"),
                ("GREETER_CAMERA_ROTATION", "180"),
                ("GREETER_SPEECH_ENABLED", "0"),
                ("OPENAI_API_KEY", "sk-test"),
            ]))
            .unwrap();
        assert_eq!(config.distance_threshold().unwrap(), 0.3);
        assert_eq!(config.camera.device_path(), "/dev/video7");
        assert_eq!(config.camera.rotation, Rotation::Clockwise180);
        assert!(!config.speech.enabled);
        assert_eq!(config.greeting.api_key.as_deref(), Some("sk-test"));
    }

    #[test]
    fn test_invalid_env_value_is_rejected() {
        let mut config = Config::default();
        let err = config
            .apply_env(env(&[("GREETER_DISTANCE_THRESHOLD", "close")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "GREETER_DISTANCE_THRESHOLD", .. }));
    }

    #[test]
    fn test_negative_threshold_is_rejected() {
        let config = Config::from_toml("[identity]\ndistance_threshold = -1.0\n").unwrap();
        assert!(matches!(config.distance_threshold(), Err(ConfigError::Invalid { .. })));
    }

    #[test]
    fn test_model_paths() {
        let mut config = Config::default();
        config.models.dir = PathBuf::from("/opt/models");
        assert_eq!(config.models.person_model_path(), "/opt/models/yolov10n.onnx");
    }
}
