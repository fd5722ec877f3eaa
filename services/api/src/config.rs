use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use study_buddy_core::SessionConfig;
use tracing::Level;

/// A custom error type for configuration loading failures.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingVar(String),
    #[error("Invalid value for environment variable {0}: {1}")]
    InvalidValue(String, String),
}

/// The OpenAI-compatible backends the gateway and transcriber can talk to.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Provider {
    OpenAI,
    Gemini,
}

impl Provider {
    pub fn api_base(&self) -> &'static str {
        match self {
            Provider::OpenAI => "https://api.openai.com/v1",
            Provider::Gemini => "https://generativelanguage.googleapis.com/v1beta/openai",
        }
    }
}

/// Holds all configuration loaded from the environment at startup.
#[derive(Clone, Debug)]
pub struct Config {
    pub bind_address: SocketAddr,
    pub provider: Provider,
    pub openai_api_key: Option<String>,
    pub gemini_api_key: Option<String>,
    pub chat_model: String,
    pub transcribe_model: String,
    pub log_level: Level,
    pub prompts_path: PathBuf,
    pub study_minutes: u64,
    pub break_minutes: u64,
    pub initial_delay_secs: u64,
}

impl Config {
    /// Loads configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        // Only load from .env in non-test mode to avoid contamination
        if !cfg!(test) {
            dotenvy::dotenv().ok();
        }

        let bind_address_str =
            std::env::var("BIND_ADDRESS").unwrap_or_else(|_| "0.0.0.0:3000".to_string());
        let bind_address = bind_address_str
            .parse::<SocketAddr>()
            .map_err(|e| ConfigError::InvalidValue("BIND_ADDRESS".to_string(), e.to_string()))?;

        let provider_str = std::env::var("AI_PROVIDER").unwrap_or_else(|_| "openai".to_string());
        let provider = match provider_str.to_lowercase().as_str() {
            "openai" => Provider::OpenAI,
            "gemini" => Provider::Gemini,
            other => {
                return Err(ConfigError::InvalidValue(
                    "AI_PROVIDER".to_string(),
                    format!("'{}' is not one of openai, gemini", other),
                ));
            }
        };

        let openai_api_key = std::env::var("OPENAI_API_KEY").ok();
        let gemini_api_key = std::env::var("GEMINI_API_KEY").ok();

        let chat_model = std::env::var("CHAT_MODEL").unwrap_or_else(|_| "gpt-4o".to_string());
        let transcribe_model =
            std::env::var("TRANSCRIBE_MODEL").unwrap_or_else(|_| "whisper-1".to_string());

        let log_level_str = std::env::var("RUST_LOG").unwrap_or_else(|_| "INFO".to_string());
        let log_level = log_level_str.parse::<Level>().map_err(|_| {
            ConfigError::InvalidValue(
                "RUST_LOG".to_string(),
                format!("'{}' is not a valid log level", log_level_str),
            )
        })?;

        let prompts_path = std::env::var("PROMPTS_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./prompts"));

        let study_minutes = positive_var("STUDY_MINUTES", 25)?;
        let break_minutes = positive_var("BREAK_MINUTES", 5)?;
        let initial_delay_secs = number_var("INITIAL_DELAY_SECS", 3)?;

        match provider {
            Provider::OpenAI => {
                if openai_api_key.is_none() {
                    return Err(ConfigError::MissingVar(
                        "OPENAI_API_KEY must be set for 'openai' provider".to_string(),
                    ));
                }
            }
            Provider::Gemini => {
                if gemini_api_key.is_none() {
                    return Err(ConfigError::MissingVar(
                        "GEMINI_API_KEY must be set for 'gemini' provider".to_string(),
                    ));
                }
            }
        }

        Ok(Self {
            bind_address,
            provider,
            openai_api_key,
            gemini_api_key,
            chat_model,
            transcribe_model,
            log_level,
            prompts_path,
            study_minutes,
            break_minutes,
            initial_delay_secs,
        })
    }

    /// The key for whichever provider was selected.
    pub fn api_key(&self) -> Option<&str> {
        match self.provider {
            Provider::OpenAI => self.openai_api_key.as_deref(),
            Provider::Gemini => self.gemini_api_key.as_deref(),
        }
    }

    /// Session timings for a new study session. A client may still shorten or
    /// lengthen the pomodoro phases in its `init` message.
    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            initial_delay: Duration::from_secs(self.initial_delay_secs),
            ..SessionConfig::default()
        }
        .with_pomodoro(
            Duration::from_secs(self.study_minutes * 60),
            Duration::from_secs(self.break_minutes * 60),
        )
    }
}

fn number_var(name: &str, default: u64) -> Result<u64, ConfigError> {
    match std::env::var(name) {
        Ok(raw) => raw.trim().parse::<u64>().map_err(|_| {
            ConfigError::InvalidValue(name.to_string(), format!("'{}' is not a number", raw))
        }),
        Err(_) => Ok(default),
    }
}

fn positive_var(name: &str, default: u64) -> Result<u64, ConfigError> {
    let value = number_var(name, default)?;
    if value == 0 {
        return Err(ConfigError::InvalidValue(
            name.to_string(),
            "must be greater than zero".to_string(),
        ));
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::env;
    use tracing::Level;

    fn clear_env_vars() {
        unsafe {
            env::remove_var("BIND_ADDRESS");
            env::remove_var("AI_PROVIDER");
            env::remove_var("OPENAI_API_KEY");
            env::remove_var("GEMINI_API_KEY");
            env::remove_var("CHAT_MODEL");
            env::remove_var("TRANSCRIBE_MODEL");
            env::remove_var("RUST_LOG");
            env::remove_var("PROMPTS_PATH");
            env::remove_var("STUDY_MINUTES");
            env::remove_var("BREAK_MINUTES");
            env::remove_var("INITIAL_DELAY_SECS");
        }
    }

    fn set_minimal_env_openai() {
        unsafe {
            env::set_var("AI_PROVIDER", "openai");
            env::set_var("OPENAI_API_KEY", "test-openai-key");
        }
    }

    #[test]
    fn test_config_error_display() {
        let missing_var = ConfigError::MissingVar("TEST_VAR".to_string());
        assert_eq!(
            format!("{}", missing_var),
            "Missing environment variable: TEST_VAR"
        );

        let invalid_value =
            ConfigError::InvalidValue("TEST_VAR".to_string(), "bad_value".to_string());
        assert_eq!(
            format!("{}", invalid_value),
            "Invalid value for environment variable TEST_VAR: bad_value"
        );
    }

    #[test]
    #[serial]
    fn test_config_from_env_minimal_openai() {
        clear_env_vars();
        set_minimal_env_openai();

        let config = Config::from_env().expect("Config should load successfully");

        assert_eq!(config.bind_address.to_string(), "0.0.0.0:3000");
        assert_eq!(config.provider, Provider::OpenAI);
        assert_eq!(config.api_key(), Some("test-openai-key"));
        assert_eq!(config.gemini_api_key, None);
        assert_eq!(config.chat_model, "gpt-4o");
        assert_eq!(config.transcribe_model, "whisper-1");
        assert_eq!(config.log_level, Level::INFO);
        assert_eq!(config.prompts_path, PathBuf::from("./prompts"));
        assert_eq!(config.study_minutes, 25);
        assert_eq!(config.break_minutes, 5);
        assert_eq!(config.initial_delay_secs, 3);
    }

    #[test]
    #[serial]
    fn test_config_from_env_gemini_provider() {
        clear_env_vars();
        unsafe {
            env::set_var("AI_PROVIDER", "Gemini");
            env::set_var("GEMINI_API_KEY", "test-gemini-key");
        }

        let config = Config::from_env().expect("Config should load successfully");

        assert_eq!(config.provider, Provider::Gemini);
        assert_eq!(config.api_key(), Some("test-gemini-key"));
        assert_eq!(config.openai_api_key, None);
        assert!(config.provider.api_base().contains("generativelanguage"));
    }

    #[test]
    #[serial]
    fn test_config_from_env_custom_values() {
        clear_env_vars();
        unsafe {
            env::set_var("BIND_ADDRESS", "127.0.0.1:8080");
            env::set_var("AI_PROVIDER", "openai");
            env::set_var("OPENAI_API_KEY", "custom-openai-key");
            env::set_var("CHAT_MODEL", "gpt-4o-mini");
            env::set_var("TRANSCRIBE_MODEL", "gpt-4o-transcribe");
            env::set_var("RUST_LOG", "debug");
            env::set_var("PROMPTS_PATH", "/custom/prompts");
            env::set_var("STUDY_MINUTES", "50");
            env::set_var("BREAK_MINUTES", "10");
            env::set_var("INITIAL_DELAY_SECS", "0");
        }

        let config = Config::from_env().expect("Config should load successfully");

        assert_eq!(config.bind_address.to_string(), "127.0.0.1:8080");
        assert_eq!(config.chat_model, "gpt-4o-mini");
        assert_eq!(config.transcribe_model, "gpt-4o-transcribe");
        assert_eq!(config.log_level, Level::DEBUG);
        assert_eq!(config.prompts_path, PathBuf::from("/custom/prompts"));

        let session = config.session_config();
        assert_eq!(session.study_duration, Duration::from_secs(50 * 60));
        assert_eq!(session.break_duration, Duration::from_secs(10 * 60));
        assert_eq!(session.initial_delay, Duration::ZERO);
        assert_eq!(session.topic_grace, SessionConfig::default().topic_grace);
    }

    #[test]
    #[serial]
    fn test_config_invalid_bind_address() {
        clear_env_vars();
        set_minimal_env_openai();
        unsafe {
            env::set_var("BIND_ADDRESS", "not-a-valid-address");
        }

        let err = Config::from_env().unwrap_err();
        match err {
            ConfigError::InvalidValue(var, _) => assert_eq!(var, "BIND_ADDRESS"),
            _ => panic!("Expected InvalidValue for BIND_ADDRESS"),
        }
    }

    #[test]
    #[serial]
    fn test_config_unknown_provider() {
        clear_env_vars();
        set_minimal_env_openai();
        unsafe {
            env::set_var("AI_PROVIDER", "claude");
        }

        let err = Config::from_env().unwrap_err();
        match err {
            ConfigError::InvalidValue(var, _) => assert_eq!(var, "AI_PROVIDER"),
            _ => panic!("Expected InvalidValue for AI_PROVIDER"),
        }
    }

    #[test]
    #[serial]
    fn test_config_invalid_log_level() {
        clear_env_vars();
        set_minimal_env_openai();
        unsafe {
            env::set_var("RUST_LOG", "not-a-level");
        }

        let err = Config::from_env().unwrap_err();
        match err {
            ConfigError::InvalidValue(var, _) => assert_eq!(var, "RUST_LOG"),
            _ => panic!("Expected InvalidValue for RUST_LOG"),
        }
    }

    #[test]
    #[serial]
    fn test_config_rejects_zero_length_study_phase() {
        clear_env_vars();
        set_minimal_env_openai();
        unsafe {
            env::set_var("STUDY_MINUTES", "0");
        }

        let err = Config::from_env().unwrap_err();
        match err {
            ConfigError::InvalidValue(var, _) => assert_eq!(var, "STUDY_MINUTES"),
            _ => panic!("Expected InvalidValue for STUDY_MINUTES"),
        }
    }

    #[test]
    #[serial]
    fn test_config_rejects_non_numeric_break() {
        clear_env_vars();
        set_minimal_env_openai();
        unsafe {
            env::set_var("BREAK_MINUTES", "five");
        }

        assert!(matches!(
            Config::from_env(),
            Err(ConfigError::InvalidValue(var, _)) if var == "BREAK_MINUTES"
        ));
    }

    #[test]
    #[serial]
    fn test_config_missing_openai_key() {
        clear_env_vars();
        unsafe {
            env::set_var("AI_PROVIDER", "openai");
        }

        let err = Config::from_env().unwrap_err();
        match err {
            ConfigError::MissingVar(msg) => {
                assert!(msg.contains("OPENAI_API_KEY"));
            }
            _ => panic!("Expected MissingVar for OPENAI_API_KEY"),
        }
    }

    #[test]
    #[serial]
    fn test_config_missing_gemini_key() {
        clear_env_vars();
        unsafe {
            env::set_var("AI_PROVIDER", "gemini");
        }

        let err = Config::from_env().unwrap_err();
        match err {
            ConfigError::MissingVar(msg) => {
                assert!(msg.contains("GEMINI_API_KEY"));
            }
            _ => panic!("Expected MissingVar for GEMINI_API_KEY"),
        }
    }
}
