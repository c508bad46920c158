use chrono_tz::Tz;
use config::ConfigError;
use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

// Главная структура конфигурации - контейнер для всех настроек
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    pub app: AppConfig,
    pub database: DatabaseConfig,
    pub redis: RedisConfig,
    pub payment: PaymentConfig,
    pub circuit_breaker: CircuitBreakerConfig,
    pub deposit: DepositConfig,
    pub attendance: AttendanceConfig,
    pub retry: RetryConfig,
    pub ledger: LedgerConfig,
    pub notifications: NotificationConfig,
}

// Настройки приложения
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub environment: String,
    pub rust_log: String,
    /// `json` включает структурированный вывод логов.
    pub log_format: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8000,
            environment: "development".to_string(),
            rust_log: "deposit_guard=debug,tower_http=debug".to_string(),
            log_format: "pretty".to_string(),
        }
    }
}

// Настройки базы данных
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub pool_size: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self { url: String::new(), pool_size: 20 }
    }
}

// Настройки Redis (журнал идемпотентности вебхуков)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RedisConfig {
    pub url: String,
}

// Настройки платежного шлюза
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentConfig {
    pub gateway_url: String,
    pub api_key: String,
    pub webhook_secret: String,
    /// Допустимое расхождение часов между шлюзом и нами при проверке подписи.
    pub signature_tolerance_secs: i64,
    pub currency: String,
    pub request_timeout_secs: u64,
}

impl Default for PaymentConfig {
    fn default() -> Self {
        Self {
            gateway_url: "http://localhost:9000".to_string(),
            api_key: String::new(),
            webhook_secret: String::new(),
            signature_tolerance_secs: 300,
            currency: "EUR".to_string(),
            request_timeout_secs: 10,
        }
    }
}

// Настройки Circuit Breaker
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub timeout_seconds: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self { failure_threshold: 5, timeout_seconds: 60 }
    }
}

// Стратегия депозита
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DepositConfig {
    /// Если до даты брони меньше стольких дней, ставим ручной холд сразу.
    pub manual_capture_lead_days: i64,
    /// За сколько дней до даты списывать отложенные (automatic) депозиты.
    pub pre_charge_days: i64,
    /// Часовой пояс площадки. Все календарные расчёты ведутся в нём.
    pub venue_timezone: Tz,
}

impl Default for DepositConfig {
    fn default() -> Self {
        Self {
            manual_capture_lead_days: 7,
            pre_charge_days: 3,
            venue_timezone: Tz::UTC,
        }
    }
}

/// Что делать с холдом, если админ не отметил ни присутствие, ни неявку.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttendancePolicy {
    NoShow,
    LeavePending,
}

impl AttendancePolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NoShow => "no_show",
            Self::LeavePending => "leave_pending",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttendanceConfig {
    pub sweep_interval_secs: u64,
    pub grace_period_mins: i64,
    pub default_policy: AttendancePolicy,
    pub concurrency: usize,
}

impl Default for AttendanceConfig {
    fn default() -> Self {
        Self {
            sweep_interval_secs: 300,
            grace_period_mins: 60,
            default_policy: AttendancePolicy::LeavePending,
            concurrency: 8,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self { max_attempts: 3, base_backoff_ms: 200 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerConfig {
    pub retention_hours: i64,
    pub sweep_interval_secs: u64,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self { retention_hours: 24, sweep_interval_secs: 3600 }
    }
}

impl LedgerConfig {
    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_hours.max(1) as u64 * 3600)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NotificationConfig {
    /// Без URL уведомления только пишутся в лог.
    pub dispatcher_url: Option<String>,
}

// Плоские переменные окружения -> ключи конфигурации
const ENV_OVERRIDES: &[(&str, &str)] = &[
    ("app.host", "HOST"),
    ("app.port", "PORT"),
    ("app.environment", "ENVIRONMENT"),
    ("app.rust_log", "RUST_LOG"),
    ("app.log_format", "LOG_FORMAT"),
    ("database.url", "DATABASE_URL"),
    ("database.pool_size", "DB_POOL_SIZE"),
    ("redis.url", "REDIS_URL"),
    ("payment.gateway_url", "PAYMENT_GATEWAY_URL"),
    ("payment.api_key", "PAYMENT_API_KEY"),
    ("payment.webhook_secret", "PAYMENT_WEBHOOK_SECRET"),
    ("payment.signature_tolerance_secs", "PAYMENT_SIGNATURE_TOLERANCE_SECS"),
    ("payment.currency", "PAYMENT_CURRENCY"),
    ("payment.request_timeout_secs", "PAYMENT_REQUEST_TIMEOUT_SECS"),
    ("circuit_breaker.failure_threshold", "CIRCUIT_BREAKER_FAILURE_THRESHOLD"),
    ("circuit_breaker.timeout_seconds", "CIRCUIT_BREAKER_TIMEOUT_SECONDS"),
    ("deposit.manual_capture_lead_days", "DEPOSIT_MANUAL_CAPTURE_LEAD_DAYS"),
    ("deposit.pre_charge_days", "PRE_CHARGE_DAYS"),
    ("deposit.venue_timezone", "VENUE_TIMEZONE"),
    ("attendance.sweep_interval_secs", "ATTENDANCE_SWEEP_INTERVAL_SECS"),
    ("attendance.grace_period_mins", "ATTENDANCE_GRACE_PERIOD_MINS"),
    ("attendance.default_policy", "ATTENDANCE_DEFAULT_POLICY"),
    ("attendance.concurrency", "ATTENDANCE_CONCURRENCY"),
    ("retry.max_attempts", "RETRY_MAX_ATTEMPTS"),
    ("retry.base_backoff_ms", "RETRY_BASE_BACKOFF_MS"),
    ("ledger.retention_hours", "LEDGER_RETENTION_HOURS"),
    ("ledger.sweep_interval_secs", "LEDGER_SWEEP_INTERVAL_SECS"),
    ("notifications.dispatcher_url", "NOTIFICATION_DISPATCHER_URL"),
];

impl Config {
    /// Собирает конфигурацию: значения по умолчанию, затем `.env`, затем окружение.
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        let mut builder = config::Config::builder().add_source(config::Config::try_from(&Config::default())?);
        for (key, var) in ENV_OVERRIDES {
            builder = builder.set_override_option(*key, env::var(var).ok())?;
        }

        let config: Config = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let required = [
            ("DATABASE_URL", &self.database.url),
            ("REDIS_URL", &self.redis.url),
            ("PAYMENT_WEBHOOK_SECRET", &self.payment.webhook_secret),
        ];
        for (name, value) in required {
            if value.trim().is_empty() {
                return Err(ConfigError::Message(format!("{name} must be set")));
            }
        }
        if self.deposit.pre_charge_days < 0 || self.deposit.manual_capture_lead_days < 0 {
            return Err(ConfigError::Message("deposit day thresholds must not be negative".to_string()));
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::Message("RETRY_MAX_ATTEMPTS must be at least 1".to_string()));
        }
        Ok(())
    }

    pub fn is_json_logging(&self) -> bool {
        self.app.log_format.eq_ignore_ascii_case("json")
    }
}
