use std::env;
use std::path::PathBuf;

use crate::error::AppError;

/// Application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    pub database: DatabaseConfig,
    pub logging: LoggingConfig,
    pub scan: ScanConfig,
    pub rules: RuleConfig,
    pub auth: AuthConfig,
}

/// Database configuration
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub path: PathBuf,
    pub max_connections: u32,
}

/// Logging configuration
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

/// Log output format
#[derive(Debug, Clone, PartialEq)]
pub enum LogFormat {
    Pretty,
    Json,
}

/// Scan orchestration and query limits
#[derive(Debug, Clone)]
pub struct ScanConfig {
    /// Upper bound on detection rules running at the same time.
    pub max_concurrent_rules: usize,
    pub default_page_size: u32,
    pub max_page_size: u32,
    /// Default threshold for bulk acceptance.
    pub bulk_accept_min_confidence: f64,
}

/// Tunables for the built-in detection rules
#[derive(Debug, Clone)]
pub struct RuleConfig {
    pub min_parent_age_gap_years: i64,
    pub max_parent_age_gap_years: i64,
    pub max_partner_age_gap_years: i64,
}

/// Admin allow-list used by the default authorization gate
#[derive(Debug, Clone, Default)]
pub struct AuthConfig {
    pub admin_user_ids: Vec<String>,
    /// `ADMIN_USER_IDS=*` grants admin capability to every caller.
    pub allow_all: bool,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, AppError> {
        // Load .env file if present (ignore errors if not found)
        let _ = dotenvy::dotenv();

        let database = DatabaseConfig {
            path: PathBuf::from(
                env::var("DATABASE_PATH").unwrap_or_else(|_| "./data/genealogy.db".to_string()),
            ),
            max_connections: parse_env("DATABASE_MAX_CONNECTIONS", 5),
        };

        let logging = LoggingConfig {
            level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            format: match env::var("LOG_FORMAT")
                .unwrap_or_else(|_| "pretty".to_string())
                .to_lowercase()
                .as_str()
            {
                "json" => LogFormat::Json,
                _ => LogFormat::Pretty,
            },
        };

        let defaults = ScanConfig::default();
        let scan = ScanConfig {
            max_concurrent_rules: parse_env(
                "SCAN_MAX_CONCURRENT_RULES",
                defaults.max_concurrent_rules,
            )
            .max(1),
            default_page_size: parse_env("PREDICTIONS_DEFAULT_PAGE_SIZE", defaults.default_page_size)
                .max(1),
            max_page_size: parse_env("PREDICTIONS_MAX_PAGE_SIZE", defaults.max_page_size).max(1),
            bulk_accept_min_confidence: parse_env(
                "BULK_ACCEPT_MIN_CONFIDENCE",
                defaults.bulk_accept_min_confidence,
            )
            .clamp(0.0, 100.0),
        };

        let defaults = RuleConfig::default();
        let rules = RuleConfig {
            min_parent_age_gap_years: parse_env(
                "RULE_MIN_PARENT_AGE_GAP_YEARS",
                defaults.min_parent_age_gap_years,
            ),
            max_parent_age_gap_years: parse_env(
                "RULE_MAX_PARENT_AGE_GAP_YEARS",
                defaults.max_parent_age_gap_years,
            ),
            max_partner_age_gap_years: parse_env(
                "RULE_MAX_PARTNER_AGE_GAP_YEARS",
                defaults.max_partner_age_gap_years,
            ),
        };
        rules.validate()?;

        let auth = AuthConfig::from_list(&env::var("ADMIN_USER_IDS").unwrap_or_default());

        Ok(Config {
            database,
            logging,
            scan,
            rules,
            auth,
        })
    }
}

impl RuleConfig {
    /// Reject age windows that can never match.
    pub fn validate(&self) -> Result<(), AppError> {
        if self.min_parent_age_gap_years < 0 || self.max_partner_age_gap_years < 0 {
            return Err(AppError::Config {
                message: "rule age gaps must not be negative".to_string(),
            });
        }
        if self.min_parent_age_gap_years > self.max_parent_age_gap_years {
            return Err(AppError::Config {
                message: format!(
                    "RULE_MIN_PARENT_AGE_GAP_YEARS ({}) exceeds RULE_MAX_PARENT_AGE_GAP_YEARS ({})",
                    self.min_parent_age_gap_years, self.max_parent_age_gap_years
                ),
            });
        }
        Ok(())
    }
}

impl AuthConfig {
    /// Parse a comma separated admin list.
    pub fn from_list(raw: &str) -> Self {
        let ids: Vec<String> = raw
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();

        Self {
            allow_all: ids.iter().any(|id| id == "*"),
            admin_user_ids: ids.into_iter().filter(|id| id != "*").collect(),
        }
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(default)
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            max_concurrent_rules: 4,
            default_page_size: 50,
            max_page_size: 200,
            bulk_accept_min_confidence: 85.0,
        }
    }
}

impl Default for RuleConfig {
    fn default() -> Self {
        Self {
            min_parent_age_gap_years: 15,
            max_parent_age_gap_years: 60,
            max_partner_age_gap_years: 10,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
        }
    }
}
