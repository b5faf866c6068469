use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

/// 应用配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub gateway: GatewayConfig,
    pub storage: StorageConfig,
    pub invoicing: InvoicingConfig,
    pub rate_limit: RateLimitConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
}

/// Facturama 接入参数
#[derive(Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    pub base_url: String,
    pub user: String,
    pub password: String,
    pub timeout_secs: u64,
}

// 密码不进日志
impl fmt::Debug for GatewayConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GatewayConfig")
            .field("base_url", &self.base_url)
            .field("user", &self.user)
            .field("password", &"***")
            .field("timeout_secs", &self.timeout_secs)
            .finish()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    pub dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvoicingConfig {
    /// 启动时自动创建的默认系列
    pub default_serie: String,
    /// pending 记录超过该分钟数才参与对账
    pub reconcile_after_minutes: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    pub submit_count: usize,
    pub submit_window_secs: u64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 8080,
            },
            database: DatabaseConfig {
                url: "postgres://localhost/factura_global".to_string(),
            },
            gateway: GatewayConfig {
                base_url: "https://apisandbox.facturama.mx".to_string(),
                user: String::new(),
                password: String::new(),
                timeout_secs: 30,
            },
            storage: StorageConfig {
                dir: PathBuf::from("./storage/facturas"),
            },
            invoicing: InvoicingConfig {
                default_serie: "ML".to_string(),
                reconcile_after_minutes: 30,
            },
            rate_limit: RateLimitConfig {
                submit_count: 5,
                submit_window_secs: 600,
            },
        }
    }
}

fn env_or(key: &str, default: String) -> String {
    std::env::var(key).unwrap_or(default)
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl AppConfig {
    /// 从环境变量加载配置 (沿用部署时的扁平变量名)
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            server: ServerConfig {
                host: env_or("SERVER_HOST", d.server.host),
                port: env_parse("SERVER_PORT", d.server.port),
            },
            database: DatabaseConfig {
                url: env_or("DATABASE_URL", d.database.url),
            },
            gateway: GatewayConfig {
                base_url: env_or("FACTURAMA_BASE_URL", d.gateway.base_url),
                user: env_or("FACTURAMA_USER", d.gateway.user),
                password: env_or("FACTURAMA_PASSWORD", d.gateway.password),
                timeout_secs: env_parse("FACTURAMA_TIMEOUT_SECS", d.gateway.timeout_secs),
            },
            storage: StorageConfig {
                dir: std::env::var("FACTURAS_STORAGE_DIR")
                    .map(PathBuf::from)
                    .unwrap_or(d.storage.dir),
            },
            invoicing: InvoicingConfig {
                default_serie: env_or("DEFAULT_SERIE", d.invoicing.default_serie),
                reconcile_after_minutes: env_parse(
                    "RECONCILE_AFTER_MINUTES",
                    d.invoicing.reconcile_after_minutes,
                ),
            },
            rate_limit: RateLimitConfig {
                submit_count: env_parse("SUBMIT_RATE_LIMIT_COUNT", d.rate_limit.submit_count),
                submit_window_secs: env_parse(
                    "SUBMIT_RATE_LIMIT_WINDOW",
                    d.rate_limit.submit_window_secs,
                ),
            },
        }
    }

    /// 分层加载: 环境变量基线 -> 可选 TOML 文件 -> `APP__` 前缀的嵌套变量
    pub fn load(file: Option<&Path>) -> Result<Self, config::ConfigError> {
        let base = Self::from_env();
        let mut builder = config::Config::builder()
            .add_source(config::Config::try_from(&base)?);

        if let Some(path) = file {
            builder = builder.add_source(config::File::from(path).required(false));
        }

        builder
            .add_source(
                config::Environment::with_prefix("APP")
                    .prefix_separator("__")
                    .separator("__"),
            )
            .build()?
            .try_deserialize()
    }
}
