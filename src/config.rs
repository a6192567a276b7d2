use std::env;
use std::time::Duration;

use dotenvy::dotenv;

use crate::constants::{DEFAULT_ANTHROPIC_VERSION, DEFAULT_REASON_BUDGET_TOKENS};

fn env_bool(key: &str) -> bool {
    env::var(key).is_ok_and(|v| v == "true" || v == "1")
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|v| v.parse().ok())
}

/// AWS Bedrock credentials and translation knobs
#[derive(Debug, Clone)]
pub struct BedrockConfig {
    pub access_key: String,
    pub secret_key: String,
    pub region: String,
    pub anthropic_version: String,
    pub enable_computer_use: bool,
    pub enable_output_reason: bool,
    pub reason_budget_tokens: u32,
    /// Overrides the request's max_tokens when > 0
    pub max_tokens: u32,
    pub debug: bool,
}

impl BedrockConfig {
    pub fn from_env() -> Self {
        Self {
            access_key: env::var("AWS_BEDROCK_ACCESS_KEY").unwrap_or_default(),
            secret_key: env::var("AWS_BEDROCK_SECRET_KEY").unwrap_or_default(),
            region: env::var("AWS_BEDROCK_REGION").unwrap_or_default(),
            anthropic_version: env::var("AWS_BEDROCK_ANTHROPIC_DEFAULT_VERSION")
                .unwrap_or_else(|_| DEFAULT_ANTHROPIC_VERSION.to_string()),
            enable_computer_use: env_bool("AWS_BEDROCK_ENABLE_COMPUTER_USE"),
            enable_output_reason: env_bool("AWS_BEDROCK_ENABLE_OUTPUT_REASON"),
            reason_budget_tokens: env_parse("AWS_BEDROCK_REASON_BUDGET_TOKENS")
                .unwrap_or(DEFAULT_REASON_BUDGET_TOKENS),
            max_tokens: env_parse("AWS_BEDROCK_MAX_TOKENS").unwrap_or(0),
            debug: env_bool("AWS_BEDROCK_DEBUG"),
        }
    }

    pub fn has_credentials(&self) -> bool {
        !self.access_key.is_empty() && !self.secret_key.is_empty() && !self.region.is_empty()
    }
}

/// PostgreSQL connection settings
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub user: String,
    pub password: String,
    pub ssl_mode: String,
    pub max_conns: u32,
    pub min_conns: u32,
}

impl DatabaseConfig {
    pub fn from_env() -> Self {
        Self {
            host: env::var("DB_HOST").unwrap_or_default(),
            port: env_parse("DB_PORT").unwrap_or(5432),
            database: env::var("DB_NAME").unwrap_or_default(),
            user: env::var("DB_USER").unwrap_or_default(),
            password: env::var("DB_PASSWORD").unwrap_or_default(),
            ssl_mode: env::var("DB_SSLMODE").unwrap_or_else(|_| "require".to_string()),
            max_conns: env_parse("DB_MAX_CONNS").unwrap_or(25),
            min_conns: env_parse("DB_MIN_CONNS").unwrap_or(5),
        }
    }

    /// Host, user, and password are the minimum needed to attempt a connection
    pub fn is_configured(&self) -> bool {
        !self.host.is_empty() && !self.user.is_empty() && !self.password.is_empty()
    }

    pub fn connection_url(&self) -> String {
        format!(
            "postgres://{}:{}@{}:{}/{}?sslmode={}",
            self.user, self.password, self.host, self.port, self.database, self.ssl_mode
        )
    }
}

/// Symmetric-key JWT validation settings
#[derive(Debug, Clone)]
pub struct JwtConfig {
    pub secret_key: String,
    pub issuer: String,
    pub audience: String,
}

impl JwtConfig {
    pub fn from_env() -> Self {
        Self {
            secret_key: env::var("JWT_SECRET_KEY").unwrap_or_default(),
            issuer: env::var("JWT_ISSUER").unwrap_or_default(),
            audience: env::var("JWT_AUDIENCE").unwrap_or_default(),
        }
    }
}

/// Markup-safe delta buffer settings
#[derive(Debug, Clone, Copy)]
pub struct TagBufferConfig {
    pub max_size: usize,
}

impl TagBufferConfig {
    pub fn from_env() -> Self {
        let max_size = env_parse::<usize>("XML_BUFFER_MAX_SIZE")
            .filter(|&s| s > 0)
            .unwrap_or(crate::constants::DEFAULT_TAG_BUFFER_SIZE);
        Self { max_size }
    }
}

/// HTTP server and process identity settings
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub environment: String,
    pub instance_id: String,
}

impl ServerConfig {
    pub fn from_env() -> Self {
        Self {
            port: env_parse("PORT").unwrap_or(8080),
            environment: env::var("ENVIRONMENT").unwrap_or_else(|_| "development".to_string()),
            instance_id: env::var("INSTANCE_ID").unwrap_or_default(),
        }
    }
}

/// Everything the process needs, loaded once at startup
#[derive(Debug, Clone)]
pub struct Config {
    pub bedrock: BedrockConfig,
    pub database: DatabaseConfig,
    pub jwt: JwtConfig,
    pub tag_buffer: TagBufferConfig,
    pub server: ServerConfig,
}

impl Config {
    pub fn from_env() -> Self {
        dotenv().ok();
        Self {
            bedrock: BedrockConfig::from_env(),
            database: DatabaseConfig::from_env(),
            jwt: JwtConfig::from_env(),
            tag_buffer: TagBufferConfig::from_env(),
            server: ServerConfig::from_env(),
        }
    }
}

/// Upstream HTTP client timeout: generous, streams can run for minutes
pub const UPSTREAM_TIMEOUT: Duration = Duration::from_secs(300);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_url_includes_sslmode() {
        let cfg = DatabaseConfig {
            host: "db.internal".into(),
            port: 5433,
            database: "gateway".into(),
            user: "svc".into(),
            password: "pw".into(),
            ssl_mode: "verify-full".into(),
            max_conns: 25,
            min_conns: 5,
        };
        assert_eq!(
            cfg.connection_url(),
            "postgres://svc:pw@db.internal:5433/gateway?sslmode=verify-full"
        );
    }

    #[test]
    fn bedrock_credentials_check() {
        let mut cfg = BedrockConfig {
            access_key: "ak".into(),
            secret_key: "sk".into(),
            region: "eu-west-1".into(),
            anthropic_version: DEFAULT_ANTHROPIC_VERSION.into(),
            enable_computer_use: false,
            enable_output_reason: false,
            reason_budget_tokens: DEFAULT_REASON_BUDGET_TOKENS,
            max_tokens: 0,
            debug: false,
        };
        assert!(cfg.has_credentials());
        cfg.region.clear();
        assert!(!cfg.has_credentials());
    }
}
