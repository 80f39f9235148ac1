use crate::errors::{AppError, AppResult};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

const APP_DIR_NAME: &str = "lightbox";
const DATABASE_FILE: &str = "index.db";

pub const DEFAULT_QUALITY: u8 = 90;
pub const DEFAULT_TRANSCODE_RESOLUTION: u32 = 720;
const DEFAULT_FFMPEG: &str = "ffmpeg";

/// Runtime configuration. Built from `LIGHTBOX_*` environment variables; the
/// binary loads `.env` through dotenvy before calling [`Config::from_env`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub media: PathBuf,
    pub cache: PathBuf,
    pub data: PathBuf,
    pub quality: u8,
    pub transcode_resolution: u32,
    pub pregenerate_thumbs: bool,
    /// ffmpeg binary for frame grabs and HLS transcodes.
    pub ffmpeg: PathBuf,
    pub resize_service: Option<String>,
    pub location_service: Option<String>,
    pub location_dataset: Option<PathBuf>,
    /// Lens alias -> canonical lens name.
    pub lens_aliases: HashMap<String, String>,
    /// Development mode disables conditional (304) responses.
    pub dev: bool,
}

impl Config {
    /// Defaults for a media root, with data and cache under `data`.
    pub fn new(media: impl Into<PathBuf>, data: impl Into<PathBuf>) -> Self {
        let data = data.into();
        Self {
            media: media.into(),
            cache: data.join("cache"),
            data,
            quality: DEFAULT_QUALITY,
            transcode_resolution: DEFAULT_TRANSCODE_RESOLUTION,
            pregenerate_thumbs: false,
            ffmpeg: PathBuf::from(DEFAULT_FFMPEG),
            resize_service: None,
            location_service: None,
            location_dataset: None,
            lens_aliases: HashMap::new(),
            dev: false,
        }
    }

    pub fn from_env() -> AppResult<Self> {
        let media = env_var("LIGHTBOX_MEDIA")
            .map(PathBuf::from)
            .ok_or_else(|| AppError::Config("LIGHTBOX_MEDIA is not set".to_string()))?;

        let data = match env_var("LIGHTBOX_DATA") {
            Some(dir) => PathBuf::from(dir),
            None => default_data_dir()?,
        };

        let mut config = Config::new(media, data);

        if let Some(cache) = env_var("LIGHTBOX_CACHE") {
            config.cache = PathBuf::from(cache);
        }
        if let Some(quality) = env_var("LIGHTBOX_QUALITY") {
            config.quality = quality
                .parse()
                .map_err(|_| AppError::Config(format!("LIGHTBOX_QUALITY: not a number: {}", quality)))?;
        }
        if let Some(res) = env_var("LIGHTBOX_TRANSCODE_RESOLUTION") {
            config.transcode_resolution = res.parse().map_err(|_| {
                AppError::Config(format!("LIGHTBOX_TRANSCODE_RESOLUTION: not a number: {}", res))
            })?;
        }
        if let Some(flag) = env_var("LIGHTBOX_PREGENERATE_THUMBS") {
            config.pregenerate_thumbs = parse_bool(&flag);
        }
        if let Some(ffmpeg) = env_var("LIGHTBOX_FFMPEG") {
            config.ffmpeg = PathBuf::from(ffmpeg);
        }
        if let Some(flag) = env_var("LIGHTBOX_DEV") {
            config.dev = parse_bool(&flag);
        }
        config.resize_service = env_var("LIGHTBOX_RESIZE_SERVICE").map(trim_service_url);
        config.location_service = env_var("LIGHTBOX_LOCATION_SERVICE").map(trim_service_url);
        config.location_dataset = env_var("LIGHTBOX_LOCATION_DATASET").map(PathBuf::from);

        if let Some(path) = env_var("LIGHTBOX_LENS_ALIASES") {
            config.lens_aliases = load_lens_aliases(Path::new(&path))?;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> AppResult<()> {
        if !(1..=100).contains(&self.quality) {
            return Err(AppError::Config(format!(
                "quality must be between 1 and 100, got {}",
                self.quality
            )));
        }
        if self.transcode_resolution == 0 || self.transcode_resolution % 2 != 0 {
            return Err(AppError::Config(format!(
                "transcode resolution must be a positive even number, got {}",
                self.transcode_resolution
            )));
        }
        Ok(())
    }

    pub fn database_path(&self) -> PathBuf {
        self.data.join(DATABASE_FILE)
    }
}

fn env_var(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn parse_bool(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

fn trim_service_url(url: String) -> String {
    url.trim_end_matches('/').to_string()
}

fn default_data_dir() -> AppResult<PathBuf> {
    let base = dirs::data_local_dir()
        .ok_or_else(|| AppError::Config("Could not find local data directory".to_string()))?;
    Ok(base.join(APP_DIR_NAME))
}

/// Reads a JSON object mapping each alias to its canonical lens name.
pub fn load_lens_aliases(path: &Path) -> AppResult<HashMap<String, String>> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| AppError::Config(format!("lens aliases {:?}: {}", path, e)))?;
    serde_json::from_str(&raw)
        .map_err(|e| AppError::Config(format!("lens aliases {:?}: {}", path, e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let config = Config::new("/media", "/data");
        assert!(config.validate().is_ok());
        assert_eq!(config.cache, PathBuf::from("/data/cache"));
        assert_eq!(config.database_path(), PathBuf::from("/data/index.db"));
        assert_eq!(config.ffmpeg, PathBuf::from("ffmpeg"));
    }

    #[test]
    fn test_rejects_bad_quality() {
        let mut config = Config::new("/media", "/data");
        config.quality = 0;
        assert!(matches!(config.validate(), Err(AppError::Config(_))));
    }

    #[test]
    fn test_parse_bool() {
        assert!(parse_bool("TRUE"));
        assert!(parse_bool(" 1 "));
        assert!(!parse_bool("no"));
    }

    #[test]
    fn test_load_lens_aliases() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("lenses.json");
        std::fs::write(&path, r#"{"EF50mm f/1.8 STM": "Canon EF 50mm f/1.8 STM"}"#)
            .expect("write");
        let aliases = load_lens_aliases(&path).expect("load");
        assert_eq!(
            aliases.get("EF50mm f/1.8 STM").map(String::as_str),
            Some("Canon EF 50mm f/1.8 STM")
        );

        std::fs::write(&path, "not json").expect("write");
        assert!(matches!(load_lens_aliases(&path), Err(AppError::Config(_))));
    }
}
