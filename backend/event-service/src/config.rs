/// Configuration management for the event service.
///
/// Loads configuration from environment variables with sensible defaults.
use sha2::{Digest, Sha256};

#[derive(Clone, Debug)]
pub struct Config {
    pub app: AppConfig,
    pub database: DatabaseConfig,
    pub cache: CacheConfig,
    pub auth: AuthConfig,
    pub platform: PlatformConfig,
    pub broadcast: BroadcastConfig,
    pub presence: PresenceConfig,
}

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub env: String,
}

#[derive(Clone, Debug)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
}

#[derive(Clone, Debug)]
pub struct CacheConfig {
    pub redis_url: String,
}

#[derive(Clone, Debug)]
pub struct AuthConfig {
    pub jwt_secret: String,
    pub master_key: [u8; 32],
}

#[derive(Clone, Debug)]
pub struct PlatformConfig {
    pub api_url: String,
}

#[derive(Clone, Debug)]
pub struct BroadcastConfig {
    /// Base URL of the bucket that receives finished archives.
    pub bucket_url: String,
}

#[derive(Clone, Debug)]
pub struct PresenceConfig {
    /// Maximum concurrent interactive connections per stage session.
    /// `None` means unlimited.
    pub interactive_stream_limit: Option<u32>,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, String> {
        let jwt_secret = std::env::var("JWT_SECRET")
            .map_err(|_| "JWT_SECRET is required".to_string())?;

        Ok(Config {
            app: AppConfig {
                host: std::env::var("EVENT_SERVICE_HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
                port: std::env::var("EVENT_SERVICE_PORT")
                    .unwrap_or_else(|_| "4040".to_string())
                    .parse()
                    .unwrap_or(4040),
                env: std::env::var("APP_ENV").unwrap_or_else(|_| "development".to_string()),
            },
            database: DatabaseConfig {
                url: std::env::var("DATABASE_URL")
                    .unwrap_or_else(|_| "postgresql://localhost/stagelight".to_string()),
                max_connections: std::env::var("DATABASE_MAX_CONNECTIONS")
                    .unwrap_or_else(|_| "10".to_string())
                    .parse()
                    .unwrap_or(10),
            },
            cache: CacheConfig {
                redis_url: std::env::var("REDIS_URL")
                    .unwrap_or_else(|_| "redis://localhost".to_string()),
            },
            auth: AuthConfig {
                master_key: master_key_from_env(&jwt_secret)?,
                jwt_secret,
            },
            platform: PlatformConfig {
                api_url: std::env::var("PLATFORM_API_URL")
                    .unwrap_or_else(|_| "https://api.opentok.com".to_string()),
            },
            broadcast: BroadcastConfig {
                bucket_url: std::env::var("BUCKET_URL")
                    .unwrap_or_else(|_| "https://s3.amazonaws.com/stagelight-archives".to_string()),
            },
            presence: PresenceConfig {
                interactive_stream_limit: parse_stream_limit(),
            },
        })
    }
}

/// The master key seals vendor API secrets at rest. Accepts a base64-encoded
/// 32-byte MASTER_KEY; falls back to a key derived from JWT_SECRET so
/// development setups work without extra variables.
fn master_key_from_env(jwt_secret: &str) -> Result<[u8; 32], String> {
    use base64::engine::general_purpose::STANDARD as BASE64;
    use base64::Engine as _;

    match std::env::var("MASTER_KEY") {
        Ok(raw) => {
            let bytes = BASE64
                .decode(raw.trim())
                .map_err(|_| "MASTER_KEY must be base64".to_string())?;
            let key: [u8; 32] = bytes
                .try_into()
                .map_err(|_| "MASTER_KEY must decode to 32 bytes".to_string())?;
            Ok(key)
        }
        Err(_) => {
            tracing::warn!("MASTER_KEY not set; deriving sealing key from JWT_SECRET");
            let digest = Sha256::digest(jwt_secret.as_bytes());
            Ok(digest.into())
        }
    }
}

/// Unset or 0 disables the capacity check.
fn parse_stream_limit() -> Option<u32> {
    std::env::var("INTERACTIVE_STREAM_LIMIT")
        .ok()
        .and_then(|v| v.parse::<u32>().ok())
        .filter(|limit| *limit > 0)
}
