//! CLI subcommands

pub mod analyze;
pub mod chat;
pub mod dictionary;
pub mod practice;

use crate::config::Config;
use crate::gemini::{GeminiClient, GeminiError};
use tracing::{error, warn};

pub type CommandResult = Result<(), Box<dyn std::error::Error + Send + Sync>>;

/// Learner-facing texts printed when a Gemini request fails
pub mod fallback {
    pub const ANALYZE: &str = "Maaf, terjadi kesalahan saat menganalisis teks.";
    pub const DEEP: &str = "Maaf, terjadi kesalahan saat melakukan analisis mendalam.";
    pub const SEARCH: &str = "Maaf, terjadi kesalahan saat mencari informasi.";
    pub const CHAT: &str = "Maaf, terjadi kesalahan. Coba lagi nanti.";
    pub const RATE_LIMIT: &str = "Batas penggunaan API tercapai. Coba lagi nanti.";
}

/// REST client for commands that cannot run without a credential
fn client(config: &Config) -> Result<GeminiClient, Box<dyn std::error::Error + Send + Sync>> {
    let api_key = config.require_api_key()?;
    Ok(GeminiClient::new(api_key, &config.api_base, &config.tts_voice)?)
}

/// Log the technical error and return the text shown instead of it
fn failure_message(err: &GeminiError, fallback: &str) -> String {
    match err {
        GeminiError::RateLimitExceeded => {
            warn!("Gemini rate limit exceeded");
            fallback::RATE_LIMIT.to_string()
        }
        e => {
            error!("Gemini request failed: {}", e);
            fallback.to_string()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rate_limit_has_its_own_message() {
        assert_eq!(
            failure_message(&GeminiError::RateLimitExceeded, fallback::ANALYZE),
            fallback::RATE_LIMIT
        );
    }

    #[test]
    fn test_other_failures_use_the_fallback() {
        let err = GeminiError::Api("Generation failed: 500 Internal Server Error".to_string());
        assert_eq!(failure_message(&err, fallback::SEARCH), fallback::SEARCH);
        assert_eq!(failure_message(&err, fallback::DEEP), fallback::DEEP);
    }
}
