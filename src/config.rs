//! Configuration management for Qiraah Coach
//!
//! Loads settings from environment variables (.env file)

use std::env;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),
    #[error("Invalid value for {0}: {1}")]
    InvalidValue(String, String),
}

/// Application configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Gemini API key. Absence is reported when a feature needs it.
    pub gemini_api_key: Option<String>,
    /// REST base URL for single-shot calls
    pub api_base: String,
    /// WebSocket endpoint for live sessions
    pub live_url: String,
    /// Model used by live voice sessions
    pub live_model: String,
    /// Synthesized voice of the reading coach
    pub live_voice: String,
    /// Voice for single-shot speech generation
    pub tts_voice: String,
    /// Microphone sample rate sent to the live service (16kHz mono)
    pub input_sample_rate: u32,
    /// Sample rate of synthesized speech (24kHz mono)
    pub output_sample_rate: u32,
    /// Samples per captured block
    pub capture_block_size: usize,
    /// Directory for exported transcripts and analyses
    pub export_dir: PathBuf,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        // Load .env file if present (ignore errors if not found)
        let _ = dotenvy::dotenv();
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build configuration from an arbitrary variable source
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(key).filter(|s| !s.trim().is_empty());

        let gemini_api_key = var("GEMINI_API_KEY").or_else(|| var("API_KEY"));

        let capture_block_size = match var("CAPTURE_BLOCK_SIZE") {
            Some(s) => match s.parse::<usize>() {
                Ok(n) if n > 0 => n,
                _ => return Err(ConfigError::InvalidValue("CAPTURE_BLOCK_SIZE".to_string(), s)),
            },
            None => 4096,
        };

        Ok(Self {
            gemini_api_key,
            api_base: var("GEMINI_API_BASE").unwrap_or_else(|| endpoints::API_BASE.to_string()),
            live_url: var("GEMINI_LIVE_URL").unwrap_or_else(|| endpoints::LIVE_URL.to_string()),
            live_model: var("GEMINI_LIVE_MODEL").unwrap_or_else(|| models::GEMINI_LIVE.to_string()),
            live_voice: var("GEMINI_LIVE_VOICE").unwrap_or_else(|| "Zephyr".to_string()),
            tts_voice: var("GEMINI_TTS_VOICE").unwrap_or_else(|| "Kore".to_string()),
            input_sample_rate: 16000,
            output_sample_rate: 24000,
            capture_block_size,
            export_dir: var("EXPORT_DIR").unwrap_or_else(|| "exports".to_string()).into(),
        })
    }

    /// API key, or the error single-shot commands report without one
    pub fn require_api_key(&self) -> Result<&str, ConfigError> {
        self.gemini_api_key
            .as_deref()
            .ok_or_else(|| ConfigError::MissingEnvVar("GEMINI_API_KEY".to_string()))
    }
}

/// Gemini model identifiers
pub mod models {
    pub const GEMINI_FLASH: &str = "gemini-2.5-flash";
    pub const GEMINI_PRO: &str = "gemini-2.5-pro";
    pub const GEMINI_TTS: &str = "gemini-2.5-flash-preview-tts";
    pub const GEMINI_LIVE: &str = "gemini-2.5-flash-native-audio-preview-09-2025";
}

pub mod endpoints {
    pub const API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta";
    pub const LIVE_URL: &str = "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent";
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_missing_key_is_not_fatal() {
        let config = Config::from_lookup(lookup(&[])).unwrap();
        assert!(config.gemini_api_key.is_none());
        assert!(config.require_api_key().is_err());
        assert_eq!(config.capture_block_size, 4096);
        assert_eq!(config.live_voice, "Zephyr");
        assert_eq!(config.input_sample_rate, 16000);
        assert_eq!(config.output_sample_rate, 24000);
    }

    #[test]
    fn test_api_key_fallback() {
        let config = Config::from_lookup(lookup(&[("API_KEY", "abc")])).unwrap();
        assert_eq!(config.require_api_key().unwrap(), "abc");

        let config = Config::from_lookup(lookup(&[("GEMINI_API_KEY", "x"), ("API_KEY", "y")])).unwrap();
        assert_eq!(config.gemini_api_key.as_deref(), Some("x"));
    }

    #[test]
    fn test_invalid_block_size() {
        let err = Config::from_lookup(lookup(&[("CAPTURE_BLOCK_SIZE", "0")])).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue(ref k, _) if k == "CAPTURE_BLOCK_SIZE"));
        assert!(Config::from_lookup(lookup(&[("CAPTURE_BLOCK_SIZE", "abc")])).is_err());
    }
}
