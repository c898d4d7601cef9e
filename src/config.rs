use chrono_tz::Tz;
use regex::Regex;
use serde::Deserialize;
use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use teloxide::types::{ChatId, UserId};

/// Errors that can occur when loading configuration.
#[derive(Debug)]
pub enum ConfigError {
    /// Failed to read the config file.
    ReadFile { path: PathBuf, source: std::io::Error },
    /// Failed to parse JSON.
    ParseJson { path: PathBuf, source: serde_json::Error },
    /// Invalid regex pattern.
    InvalidRegex { pattern: String, source: regex::Error },
    /// Unknown IANA timezone name.
    InvalidTimezone(String),
    /// Validation error.
    Validation(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ReadFile { path, source } => {
                write!(f, "failed to read config file '{}': {}", path.display(), source)
            }
            Self::ParseJson { path, source } => {
                write!(f, "failed to parse config file '{}': {}", path.display(), source)
            }
            Self::InvalidRegex { pattern, source } => {
                write!(f, "invalid regex pattern '{}': {}", pattern, source)
            }
            Self::InvalidTimezone(name) => write!(f, "unknown timezone '{}'", name),
            Self::Validation(msg) => write!(f, "config validation error: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::ReadFile { source, .. } => Some(source),
            Self::ParseJson { source, .. } => Some(source),
            Self::InvalidRegex { source, .. } => Some(source),
            Self::InvalidTimezone(_) | Self::Validation(_) => None,
        }
    }
}

#[derive(Deserialize)]
struct ConfigFile {
    telegram_bot_token: String,
    /// Gemini API key for text, vision and image generation
    gemini_api_key: String,
    #[serde(default)]
    owner_ids: Vec<u64>,
    /// Users allowed to talk to the bot. Empty means everyone.
    #[serde(default)]
    allowed_users: Vec<u64>,
    #[serde(default = "default_model")]
    default_model: String,
    #[serde(default = "default_image_model")]
    image_model: String,
    /// Models offered by /model. The default model is always included.
    #[serde(default)]
    models: Vec<String>,
    system_prompt: Option<String>,
    #[serde(default = "default_history_turns")]
    history_turns: usize,
    /// Requests per user per day (0 = unlimited). Owners are exempt.
    #[serde(default)]
    daily_request_limit: u32,
    /// Free-text patterns that turn a message into an image request.
    /// The first capture group is the prompt.
    #[serde(default)]
    image_triggers: Vec<String>,
    #[serde(default = "default_chart_endpoint")]
    chart_endpoint: String,
    #[serde(default = "default_timezone")]
    timezone: String,
    /// Directory for state files (logs, database). Defaults to current directory.
    data_dir: Option<String>,
    log_chat_id: Option<i64>,
}

fn default_model() -> String {
    "gemini-2.5-flash".to_string()
}

fn default_image_model() -> String {
    "gemini-2.5-flash-image".to_string()
}

fn default_history_turns() -> usize {
    20
}

fn default_chart_endpoint() -> String {
    "https://quickchart.io/chart".to_string()
}

fn default_timezone() -> String {
    "UTC".to_string()
}

pub struct Config {
    pub telegram_bot_token: String,
    pub gemini_api_key: String,
    pub owner_ids: HashSet<UserId>,
    pub allowed_users: HashSet<UserId>,
    pub default_model: String,
    pub image_model: String,
    /// Selectable text models, default first.
    pub models: Vec<String>,
    pub system_prompt: Option<String>,
    pub history_turns: usize,
    pub daily_request_limit: u32,
    pub image_triggers: Vec<Regex>,
    pub chart_endpoint: String,
    /// Timezone used to bucket usage into days.
    pub timezone: Tz,
    /// Directory for state files (logs, database).
    pub data_dir: PathBuf,
    pub log_chat_id: Option<ChatId>,
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let config_path = path.as_ref().to_path_buf();
        let content = std::fs::read_to_string(&config_path)
            .map_err(|e| ConfigError::ReadFile { path: config_path.clone(), source: e })?;
        let file: ConfigFile = serde_json::from_str(&content)
            .map_err(|e| ConfigError::ParseJson { path: config_path.clone(), source: e })?;

        if file.telegram_bot_token.is_empty() {
            return Err(ConfigError::Validation("telegram_bot_token is required".into()));
        }
        // Telegram tokens are formatted as {bot_id}:{secret} where bot_id is numeric
        let token_parts: Vec<&str> = file.telegram_bot_token.split(':').collect();
        if token_parts.len() != 2 || token_parts[0].parse::<u64>().is_err() || token_parts[1].is_empty() {
            return Err(ConfigError::Validation(
                "telegram_bot_token appears invalid (expected format: 123456789:ABCdefGHI...)".into()
            ));
        }
        if file.gemini_api_key.trim().is_empty() {
            return Err(ConfigError::Validation("gemini_api_key is required".into()));
        }
        if file.history_turns == 0 {
            return Err(ConfigError::Validation("history_turns must be at least 1".into()));
        }

        let timezone: Tz = file
            .timezone
            .parse()
            .map_err(|_| ConfigError::InvalidTimezone(file.timezone.clone()))?;

        let image_triggers = if file.image_triggers.is_empty() {
            default_image_triggers()
        } else {
            file.image_triggers
                .into_iter()
                .map(|p| Regex::new(&p).map_err(|e| ConfigError::InvalidRegex { pattern: p, source: e }))
                .collect::<Result<Vec<_>, _>>()?
        };

        let mut models = vec![file.default_model.clone()];
        for m in file.models {
            if !models.contains(&m) {
                models.push(m);
            }
        }

        let data_dir = file
            .data_dir
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."));

        Ok(Self {
            telegram_bot_token: file.telegram_bot_token,
            gemini_api_key: file.gemini_api_key,
            owner_ids: file.owner_ids.into_iter().map(UserId).collect(),
            allowed_users: file.allowed_users.into_iter().map(UserId).collect(),
            default_model: file.default_model,
            image_model: file.image_model,
            models,
            system_prompt: file.system_prompt.filter(|s| !s.trim().is_empty()),
            history_turns: file.history_turns,
            daily_request_limit: file.daily_request_limit,
            image_triggers,
            chart_endpoint: file.chart_endpoint,
            timezone,
            data_dir,
            log_chat_id: file.log_chat_id.map(ChatId),
        })
    }

    pub fn is_owner(&self, user_id: UserId) -> bool {
        self.owner_ids.contains(&user_id)
    }

    /// Owners are always allowed; otherwise an empty allow-list admits everyone.
    pub fn is_allowed(&self, user_id: UserId) -> bool {
        self.is_owner(user_id)
            || self.allowed_users.is_empty()
            || self.allowed_users.contains(&user_id)
    }

    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join("bot.db")
    }

    /// If `text` matches an image trigger, return the extracted prompt.
    pub fn image_prompt<'a>(&self, text: &'a str) -> Option<&'a str> {
        self.image_triggers.iter().find_map(|re| {
            re.captures(text)
                .and_then(|c| c.get(1))
                .map(|m| m.as_str().trim())
                .filter(|p| !p.is_empty())
        })
    }
}

fn default_image_triggers() -> Vec<Regex> {
    vec![
        r"(?is)^\s*draw\s+(?:me\s+)?(.+)$",
        r"(?is)^\s*(?:generate|create|make)\s+(?:an?\s+)?(?:image|picture|photo)\s+of\s+(.+)$",
    ]
    .into_iter()
    .map(|p| Regex::new(p).unwrap())
    .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn write_config(content: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    fn assert_err<T>(result: Result<T, ConfigError>) -> ConfigError {
        match result {
            Ok(_) => panic!("expected error, got Ok"),
            Err(e) => e,
        }
    }

    #[test]
    fn test_valid_config() {
        let file = write_config(r#"{
            "telegram_bot_token": "123456789:ABCdefGHIjklMNOpqrsTUVwxyz",
            "gemini_api_key": "key",
            "owner_ids": [123456]
        }"#);
        let config = Config::load(file.path()).expect("should load valid config");
        assert!(config.is_owner(UserId(123456)));
        assert_eq!(config.default_model, "gemini-2.5-flash");
        assert_eq!(config.models, vec!["gemini-2.5-flash".to_string()]);
        assert_eq!(config.history_turns, 20);
        assert_eq!(config.timezone, chrono_tz::UTC);
        assert_eq!(config.database_path(), PathBuf::from("./bot.db"));
    }

    #[test]
    fn test_models_deduplicated_default_first() {
        let file = write_config(r#"{
            "telegram_bot_token": "123:abc",
            "gemini_api_key": "key",
            "default_model": "gemini-2.5-pro",
            "models": ["gemini-2.5-flash", "gemini-2.5-pro"]
        }"#);
        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.models, vec!["gemini-2.5-pro".to_string(), "gemini-2.5-flash".to_string()]);
    }

    #[test]
    fn test_empty_token() {
        let file = write_config(r#"{
            "telegram_bot_token": "",
            "gemini_api_key": "key"
        }"#);
        let err = assert_err(Config::load(file.path()));
        assert!(matches!(err, ConfigError::Validation(_)));
        assert!(err.to_string().contains("telegram_bot_token"));
    }

    #[test]
    fn test_invalid_token_format_no_colon() {
        let file = write_config(r#"{
            "telegram_bot_token": "invalid_token_no_colon",
            "gemini_api_key": "key"
        }"#);
        let err = assert_err(Config::load(file.path()));
        assert!(err.to_string().contains("invalid"));
    }

    #[test]
    fn test_invalid_token_format_empty_secret() {
        let file = write_config(r#"{
            "telegram_bot_token": "123456789:",
            "gemini_api_key": "key"
        }"#);
        let err = assert_err(Config::load(file.path()));
        assert!(matches!(err, ConfigError::Validation(_)));
    }

    #[test]
    fn test_missing_gemini_key() {
        let file = write_config(r#"{
            "telegram_bot_token": "123:abc",
            "gemini_api_key": "   "
        }"#);
        let err = assert_err(Config::load(file.path()));
        assert!(err.to_string().contains("gemini_api_key"));
    }

    #[test]
    fn test_invalid_timezone() {
        let file = write_config(r#"{
            "telegram_bot_token": "123:abc",
            "gemini_api_key": "key",
            "timezone": "Mars/Olympus"
        }"#);
        let err = assert_err(Config::load(file.path()));
        assert!(matches!(err, ConfigError::InvalidTimezone(_)));
    }

    #[test]
    fn test_invalid_regex_pattern() {
        let file = write_config(r#"{
            "telegram_bot_token": "123:abc",
            "gemini_api_key": "key",
            "image_triggers": ["[invalid(regex"]
        }"#);
        let err = assert_err(Config::load(file.path()));
        assert!(matches!(err, ConfigError::InvalidRegex { .. }));
    }

    #[test]
    fn test_file_not_found() {
        let err = assert_err(Config::load("/nonexistent/path/config.json"));
        assert!(matches!(err, ConfigError::ReadFile { .. }));
    }

    #[test]
    fn test_invalid_json() {
        let file = write_config("{ invalid json }");
        let err = assert_err(Config::load(file.path()));
        assert!(matches!(err, ConfigError::ParseJson { .. }));
    }

    #[test]
    fn test_allow_list() {
        let file = write_config(r#"{
            "telegram_bot_token": "123:abc",
            "gemini_api_key": "key",
            "owner_ids": [1],
            "allowed_users": [2]
        }"#);
        let config = Config::load(file.path()).unwrap();
        assert!(config.is_allowed(UserId(1)));
        assert!(config.is_allowed(UserId(2)));
        assert!(!config.is_allowed(UserId(3)));
    }

    #[test]
    fn test_default_image_triggers() {
        let file = write_config(r#"{
            "telegram_bot_token": "123:abc",
            "gemini_api_key": "key"
        }"#);
        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.image_prompt("draw me a red fox"), Some("a red fox"));
        assert_eq!(config.image_prompt("Generate an image of the moon"), Some("the moon"));
        assert_eq!(config.image_prompt("how do I draw a circle in svg?"), None);
        assert_eq!(config.image_prompt("draw "), None);
    }
}
