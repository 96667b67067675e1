// config_utils.rs
use std::env;

fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

/// MYSQL connection settings for the payments database.
#[derive(Debug, Clone)]
pub struct DbConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub database: String,
}

impl DbConfig {
    pub fn from_env() -> Self {
        DbConfig {
            host: env_or("DB_HOST", "localhost"),
            port: env_or("DB_PORT", "3306").parse().unwrap_or(3306),
            username: env_or("DB_USER", "jalikoi"),
            password: env_or("DB_PASSWORD", ""),
            database: env_or("DB_NAME", "jalikoi"),
        }
    }
}

/// Groq chat-completions settings. The chatbot stays disabled (503 on its
/// routes) when no API key is present.
#[derive(Debug, Clone)]
pub struct GroqConfig {
    pub api_key: Option<String>,
    pub model: String,
    pub api_url: String,
}

impl GroqConfig {
    pub fn from_env() -> Self {
        GroqConfig {
            api_key: env::var("GROQ_API_KEY").ok().filter(|k| !k.trim().is_empty()),
            model: env_or("GROQ_MODEL", "llama-3.3-70b-versatile"),
            api_url: env_or(
                "GROQ_API_URL",
                "https://api.groq.com/openai/v1/chat/completions",
            ),
        }
    }

    pub fn is_configured(&self) -> bool {
        self.api_key.is_some()
    }
}

/// Full runtime configuration, resolved once at startup.
///
/// ```
/// use jalikoi_analytics::config_utils::AppConfig;
///
/// let config = AppConfig::from_env();
/// println!("Serving on {}", config.bind_addr);
/// ```
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub db: DbConfig,
    pub groq: GroqConfig,
    pub bind_addr: String,
    pub model_dir: String,
    pub admin_key: String,
}

impl AppConfig {
    pub fn from_env() -> Self {
        AppConfig {
            db: DbConfig::from_env(),
            groq: GroqConfig::from_env(),
            bind_addr: env_or("BIND_ADDR", "0.0.0.0:8000"),
            model_dir: env_or("MODEL_DIR", "models"),
            admin_key: env_or("ADMIN_KEY", "JALIKOI_ADMIN_2025"),
        }
    }
}
