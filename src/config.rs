//! Startup configuration pulled from the environment.
//!
//! Everything is read once at boot and is immutable afterwards. A missing
//! required value is fatal before any client connects.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    Missing(&'static str),

    #[error("invalid value for {key}: {message}")]
    Invalid { key: &'static str, message: String },
}

#[derive(Debug, Clone)]
pub struct Config {
    /// Main bot token.
    pub discord_token: String,
    /// One token per recorder worker; pool size is the list length.
    pub recorder_tokens: Vec<String>,
    /// Label prefix for numbered rooms, e.g. "Room-" gives "Room-1".
    pub room_prefix: String,
    /// Hard ceiling on concurrently numbered rooms per guild.
    pub max_rooms: u16,
    /// Occupant limit per room, counting non-worker members.
    pub room_capacity: u32,
    /// How long an emptied room keeps recording before the session stops.
    pub grace_period: Duration,
    /// Wall-clock cap on a single recording, regardless of occupancy.
    pub silence_timeout: Duration,
    /// Where raw captures live until the pipeline removes them.
    pub recordings_dir: PathBuf,
    pub storage: StorageConfig,
    /// Absent when no transcription service is configured; the pipeline
    /// then skips transcripts and summaries entirely.
    pub speech: Option<SpeechConfig>,
    /// Optional guild for instant slash-command registration.
    pub command_guild: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub endpoint: String,
    pub bucket: String,
    pub folder: String,
    pub token: Option<String>,
}

#[derive(Debug, Clone)]
pub struct SpeechConfig {
    pub transcribe_url: String,
    pub summarize_url: Option<String>,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup; tests feed a map instead of the process
    /// environment.
    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let required = |key: &'static str| -> Result<String, ConfigError> {
            match get(key) {
                Some(v) if !v.trim().is_empty() => Ok(v),
                _ => Err(ConfigError::Missing(key)),
            }
        };

        let recorder_tokens: Vec<String> = required("RECORDER_TOKENS")?
            .split(',')
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .collect();
        if recorder_tokens.is_empty() {
            return Err(ConfigError::Invalid {
                key: "RECORDER_TOKENS",
                message: "expected at least one comma-separated token".into(),
            });
        }

        let storage = StorageConfig {
            endpoint: required("STORAGE_ENDPOINT")?
                .trim_end_matches('/')
                .to_string(),
            bucket: required("STORAGE_BUCKET")?,
            folder: get("STORAGE_FOLDER").unwrap_or_else(|| "recordings".into()),
            token: get("STORAGE_TOKEN").filter(|t| !t.trim().is_empty()),
        };

        let speech = match get("TRANSCRIBE_URL").filter(|u| !u.trim().is_empty()) {
            Some(transcribe_url) => Some(SpeechConfig {
                transcribe_url,
                summarize_url: get("SUMMARIZE_URL").filter(|u| !u.trim().is_empty()),
            }),
            None => None,
        };

        Ok(Self {
            discord_token: required("DISCORD_TOKEN")?,
            recorder_tokens,
            room_prefix: get("ROOM_PREFIX").unwrap_or_else(|| "Room-".into()),
            max_rooms: parse_or(&get, "MAX_ROOMS", 10)?,
            room_capacity: parse_or(&get, "ROOM_CAPACITY", 5)?,
            grace_period: Duration::from_secs(parse_or(&get, "GRACE_SECS", 120)?),
            silence_timeout: Duration::from_secs(parse_or(&get, "SILENCE_TIMEOUT_SECS", 300)?),
            recordings_dir: PathBuf::from(
                get("RECORDINGS_DIR").unwrap_or_else(|| "recordings".into()),
            ),
            storage,
            speech,
            command_guild: match get("GUILD_ID") {
                Some(raw) => Some(raw.parse().map_err(|_| ConfigError::Invalid {
                    key: "GUILD_ID",
                    message: format!("not a guild id: {raw}"),
                })?),
                None => None,
            },
        })
    }
}

fn parse_or<T>(
    get: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    default: T,
) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match get(key) {
        Some(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
            key,
            message: e.to_string(),
        }),
        None => Ok(default),
    }
}
